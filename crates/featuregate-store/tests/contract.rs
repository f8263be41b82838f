//! Contract tests exercised against every backend: the memory
//! reference implementation and the SQLite adapter must be
//! indistinguishable through the `FlagStore` trait.

use std::sync::Arc;

use chrono::{Duration, Utc};
use featuregate_engine::{Condition, FlagType, FlagValue, Variant};
use featuregate_store::{
    AuditAction, AuditFilter, DateRange, FlagQuery, FlagStore, FlagUpdate, MemoryStore,
    NewAuditEntry, NewEvaluationRecord, NewFlag, NewOverride, NewRule, SqliteStore, StatsQuery,
    StoreError, UNKNOWN_FLAG_KEY, UnknownFlagPolicy,
};
use serde_json::json;

fn backends(policy: UnknownFlagPolicy) -> Vec<(&'static str, Arc<dyn FlagStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new(policy))),
        (
            "sqlite",
            Arc::new(SqliteStore::open_in_memory(policy).expect("open sqlite")),
        ),
    ]
}

fn new_flag(key: &str, organization_id: Option<&str>) -> NewFlag {
    NewFlag {
        key: key.to_string(),
        name: format!("Flag {key}"),
        description: None,
        flag_type: FlagType::Boolean,
        enabled: true,
        default_value: FlagValue::Bool(false),
        rollout_percentage: 100.0,
        organization_id: organization_id.map(String::from),
        variants: Vec::new(),
        metadata: None,
    }
}

fn new_rule(flag_id: featuregate_engine::FlagId, priority: Option<i64>) -> NewRule {
    NewRule {
        flag_id,
        priority,
        conditions: Condition::always(),
        value: FlagValue::Bool(true),
        variant: None,
        percentage: None,
        enabled: true,
    }
}

#[test_log::test(tokio::test)]
async fn key_uniqueness_is_scoped_by_organization() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        store.create_flag(new_flag("dark-mode", None)).await.unwrap();
        // same key, different scope: allowed
        store
            .create_flag(new_flag("dark-mode", Some("org-1")))
            .await
            .unwrap();
        // same key, same scope: conflict
        let err = store
            .create_flag(new_flag("dark-mode", Some("org-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{name}: {err}");

        // lookups respect the scope boundary
        let global = store.flag_by_key("dark-mode", None).await.unwrap().unwrap();
        assert_eq!(global.organization_id, None, "{name}");
        let scoped = store
            .flag_by_key("dark-mode", Some("org-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoped.organization_id.as_deref(), Some("org-1"), "{name}");
        assert!(
            store
                .flag_by_key("dark-mode", Some("org-2"))
                .await
                .unwrap()
                .is_none(),
            "{name}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn update_bumps_updated_at_and_validates() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let flag = store.create_flag(new_flag("tuned", None)).await.unwrap();
        let update = FlagUpdate {
            rollout_percentage: Some(25.0),
            ..Default::default()
        };
        let updated = store.update_flag(flag.id, update).await.unwrap();
        assert_eq!(updated.rollout_percentage, 25.0, "{name}");
        assert!(updated.updated_at >= flag.updated_at, "{name}");

        let invalid = FlagUpdate {
            rollout_percentage: Some(250.0),
            ..Default::default()
        };
        assert!(
            matches!(
                store.update_flag(flag.id, invalid).await,
                Err(StoreError::InvalidInput(_))
            ),
            "{name}"
        );

        // a variant value of the wrong type is a type error
        let invalid = FlagUpdate {
            variants: Some(vec![Variant {
                key: "v".to_string(),
                value: FlagValue::String("nope".to_string()),
                weight: 100.0,
                metadata: None,
            }]),
            ..Default::default()
        };
        assert!(
            matches!(
                store.update_flag(flag.id, invalid).await,
                Err(StoreError::InvalidFlagType(_))
            ),
            "{name}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn delete_flag_cascades_rules_and_overrides() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let flag = store.create_flag(new_flag("doomed", None)).await.unwrap();
        store.create_rule(new_rule(flag.id, None)).await.unwrap();
        store.create_rule(new_rule(flag.id, None)).await.unwrap();
        store
            .create_override(NewOverride {
                flag_id: flag.id,
                user_id: "u1".to_string(),
                value: FlagValue::Bool(true),
                variant: None,
                expires_at: None,
                reason: None,
            })
            .await
            .unwrap();

        store.delete_flag(flag.id).await.unwrap();

        assert!(store.flag_by_id(flag.id).await.unwrap().is_none(), "{name}");
        assert!(
            store.rules_for_flag(flag.id).await.unwrap().is_empty(),
            "{name}"
        );
        assert!(
            store
                .list_overrides(Some(flag.id), None)
                .await
                .unwrap()
                .is_empty(),
            "{name}"
        );
        // deleting again reports not found
        assert!(
            matches!(
                store.delete_flag(flag.id).await,
                Err(StoreError::FlagNotFound)
            ),
            "{name}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn rules_come_back_in_priority_order() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let flag = store.create_flag(new_flag("ordered", None)).await.unwrap();
        let third = store.create_rule(new_rule(flag.id, Some(30))).await.unwrap();
        let first = store.create_rule(new_rule(flag.id, Some(10))).await.unwrap();
        let second = store.create_rule(new_rule(flag.id, Some(20))).await.unwrap();

        let rules = store.rules_for_flag(flag.id).await.unwrap();
        let ids: Vec<_> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id], "{name}");

        // omitted priority appends to the end
        let appended = store.create_rule(new_rule(flag.id, None)).await.unwrap();
        assert_eq!(appended.priority, 31, "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn reorder_assigns_sequential_priorities() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let flag = store.create_flag(new_flag("shuffled", None)).await.unwrap();
        let a = store.create_rule(new_rule(flag.id, Some(1))).await.unwrap();
        let b = store.create_rule(new_rule(flag.id, Some(2))).await.unwrap();
        let c = store.create_rule(new_rule(flag.id, Some(3))).await.unwrap();

        store
            .reorder_rules(flag.id, &[c.id, a.id, b.id])
            .await
            .unwrap();

        let rules = store.rules_for_flag(flag.id).await.unwrap();
        let order: Vec<_> = rules.iter().map(|r| (r.id, r.priority)).collect();
        assert_eq!(order, vec![(c.id, 1), (a.id, 2), (b.id, 3)], "{name}");

        // a partial list is not a permutation
        assert!(
            matches!(
                store.reorder_rules(flag.id, &[a.id, b.id]).await,
                Err(StoreError::InvalidInput(_))
            ),
            "{name}"
        );

        // neither is a right-length list with a duplicated id
        assert!(
            matches!(
                store.reorder_rules(flag.id, &[a.id, a.id, b.id]).await,
                Err(StoreError::InvalidInput(_))
            ),
            "{name}"
        );
        // priorities are untouched by the rejected submissions
        let rules = store.rules_for_flag(flag.id).await.unwrap();
        let order: Vec<_> = rules.iter().map(|r| (r.id, r.priority)).collect();
        assert_eq!(order, vec![(c.id, 1), (a.id, 2), (b.id, 3)], "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn override_pairs_are_unique() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let flag = store.create_flag(new_flag("pinned", None)).await.unwrap();
        let make = |user: &str| NewOverride {
            flag_id: flag.id,
            user_id: user.to_string(),
            value: FlagValue::Bool(true),
            variant: None,
            expires_at: None,
            reason: Some("support ticket".to_string()),
        };
        let first = store.create_override(make("u1")).await.unwrap();
        store.create_override(make("u2")).await.unwrap();
        assert!(
            matches!(
                store.create_override(make("u1")).await,
                Err(StoreError::Conflict(_))
            ),
            "{name}"
        );

        let found = store.override_for(flag.id, "u1").await.unwrap().unwrap();
        assert_eq!(found.id, first.id, "{name}");

        let by_user = store.list_overrides(None, Some("u2")).await.unwrap();
        assert_eq!(by_user.len(), 1, "{name}");
        let by_flag = store.list_overrides(Some(flag.id), None).await.unwrap();
        assert_eq!(by_flag.len(), 2, "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn unknown_flag_policy_log_drops_silently() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let record = NewEvaluationRecord {
            flag_key: "never-created".to_string(),
            organization_id: None,
            user_id: Some("u1".to_string()),
            value: FlagValue::Bool(false),
            variant: None,
            reason: featuregate_engine::EvaluationReason::NotFound,
            context: json!({}),
            latency_ms: None,
            error: false,
        };
        assert!(store.track_evaluation(record).await.is_ok(), "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn unknown_flag_policy_throw_surfaces() {
    for (name, store) in backends(UnknownFlagPolicy::Throw) {
        let record = NewEvaluationRecord {
            flag_key: "never-created".to_string(),
            organization_id: None,
            user_id: None,
            value: FlagValue::Bool(false),
            variant: None,
            reason: featuregate_engine::EvaluationReason::NotFound,
            context: json!({}),
            latency_ms: None,
            error: false,
        };
        assert!(
            matches!(
                store.track_evaluation(record).await,
                Err(StoreError::UnknownFlag(_))
            ),
            "{name}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn unknown_flag_policy_track_unknown_files_under_system_flag() {
    for (name, store) in backends(UnknownFlagPolicy::TrackUnknown) {
        let record = NewEvaluationRecord {
            flag_key: "ghost".to_string(),
            organization_id: None,
            user_id: Some("u1".to_string()),
            value: FlagValue::Bool(false),
            variant: None,
            reason: featuregate_engine::EvaluationReason::Default,
            context: json!({"userId": "u1"}),
            latency_ms: None,
            error: false,
        };
        store.track_evaluation(record).await.unwrap();

        let sink = store
            .flag_by_key(UNKNOWN_FLAG_KEY, None)
            .await
            .unwrap()
            .expect("system flag created on demand");
        let stats = store
            .evaluation_stats(sink.id, &StatsQuery::default())
            .await
            .unwrap();
        assert_eq!(stats.total_evaluations, Some(1), "{name}");
        assert_eq!(
            stats.reasons.unwrap().get("not_found"),
            Some(&1),
            "{name}: unknown evaluations are stored with reason not_found"
        );
        // the system flag never shows up in listings
        let listed = store.list_flags(None, &FlagQuery::default()).await.unwrap();
        assert!(listed.iter().all(|f| f.key != UNKNOWN_FLAG_KEY), "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn stats_aggregate_variants_users_and_latency() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let flag = store.create_flag(new_flag("measured", None)).await.unwrap();
        for (user, variant, latency) in [
            ("u1", Some("A"), Some(2.0)),
            ("u1", Some("A"), Some(4.0)),
            ("u2", Some("B"), None),
        ] {
            store
                .track_evaluation(NewEvaluationRecord {
                    flag_key: "measured".to_string(),
                    organization_id: None,
                    user_id: Some(user.to_string()),
                    value: FlagValue::Bool(true),
                    variant: variant.map(String::from),
                    reason: featuregate_engine::EvaluationReason::PercentageRollout,
                    context: json!({}),
                    latency_ms: latency,
                    error: false,
                })
                .await
                .unwrap();
        }

        let stats = store
            .evaluation_stats(flag.id, &StatsQuery::default())
            .await
            .unwrap();
        assert_eq!(stats.total_evaluations, Some(3), "{name}");
        assert_eq!(stats.unique_users, Some(2), "{name}");
        let variants = stats.variants.unwrap();
        assert_eq!(variants.get("A"), Some(&2), "{name}");
        assert_eq!(variants.get("B"), Some(&1), "{name}");
        assert_eq!(stats.avg_latency_ms, Some(3.0), "{name}");
        assert_eq!(stats.error_rate, Some(0.0), "{name}");

        // an empty window yields zero counts
        let past = DateRange {
            start: Utc::now() - Duration::days(30),
            end: Utc::now() - Duration::days(29),
        };
        let stats = store
            .evaluation_stats(
                flag.id,
                &StatsQuery {
                    range: Some(past),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stats.total_evaluations, Some(0), "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn usage_metrics_roll_up_per_scope() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        store
            .create_flag(new_flag("a", Some("org-1")))
            .await
            .unwrap();
        let mut disabled = new_flag("b", Some("org-1"));
        disabled.enabled = false;
        store.create_flag(disabled).await.unwrap();
        store
            .create_flag(new_flag("other", Some("org-2")))
            .await
            .unwrap();

        store
            .track_evaluation(NewEvaluationRecord {
                flag_key: "a".to_string(),
                organization_id: Some("org-1".to_string()),
                user_id: Some("u1".to_string()),
                value: FlagValue::Bool(true),
                variant: None,
                reason: featuregate_engine::EvaluationReason::Default,
                context: json!({}),
                latency_ms: None,
                error: false,
            })
            .await
            .unwrap();

        let usage = store.usage_metrics(Some("org-1"), None).await.unwrap();
        assert_eq!(usage.total_flags, 2, "{name}");
        assert_eq!(usage.enabled_flags, 1, "{name}");
        assert_eq!(usage.total_evaluations, 1, "{name}");
        assert_eq!(usage.unique_users, 1, "{name}");

        let other = store.usage_metrics(Some("org-2"), None).await.unwrap();
        assert_eq!(other.total_evaluations, 0, "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn audit_entries_survive_flag_deletion() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let flag = store.create_flag(new_flag("audited", None)).await.unwrap();
        store
            .log_audit(NewAuditEntry {
                flag_id: Some(flag.id),
                user_id: Some("admin-1".to_string()),
                action: AuditAction::Created,
                organization_id: None,
                metadata: serde_json::Map::new(),
            })
            .await
            .unwrap();
        store.delete_flag(flag.id).await.unwrap();

        let entries = store
            .audit_logs(&AuditFilter {
                flag_id: Some(flag.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1, "{name}");
        assert_eq!(entries[0].flag_id, Some(flag.id), "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn audit_filters_and_cleanup() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        for action in [AuditAction::Created, AuditAction::Updated, AuditAction::Deleted] {
            store
                .log_audit(NewAuditEntry {
                    flag_id: None,
                    user_id: Some("admin-1".to_string()),
                    action,
                    organization_id: Some("org-1".to_string()),
                    metadata: serde_json::Map::new(),
                })
                .await
                .unwrap();
        }

        let updated_only = store
            .audit_logs(&AuditFilter {
                action: Some(AuditAction::Updated),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated_only.len(), 1, "{name}");

        let limited = store
            .audit_logs(&AuditFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2, "{name}");

        let by_id = store.audit_by_id(updated_only[0].id).await.unwrap();
        assert!(by_id.is_some(), "{name}");

        // nothing is older than a cutoff in the past
        let removed = store
            .cleanup_audit_logs(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 0, "{name}");
        // everything is older than a cutoff in the future
        let removed = store
            .cleanup_audit_logs(Utc::now() + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(removed, 3, "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn listings_are_deterministic_and_paginated() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        for key in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            store.create_flag(new_flag(key, None)).await.unwrap();
        }
        let query = FlagQuery {
            order_by: featuregate_store::FlagOrderBy::Key,
            ..Default::default()
        };
        let all = store.list_flags(None, &query).await.unwrap();
        let keys: Vec<_> = all.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["alpha", "beta", "delta", "epsilon", "gamma"], "{name}");

        // pages are disjoint and cover the listing
        let mut paged = Vec::new();
        for offset in [0, 2, 4] {
            let page = store
                .list_flags(
                    None,
                    &FlagQuery {
                        order_by: featuregate_store::FlagOrderBy::Key,
                        limit: Some(2),
                        offset,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            paged.extend(page.into_iter().map(|f| f.key));
        }
        assert_eq!(paged, keys, "{name}");

        // prefix filter
        let filtered = store
            .list_flags(
                None,
                &FlagQuery {
                    key_prefix: Some("de".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1, "{name}");
        assert_eq!(filtered[0].key, "delta", "{name}");
    }
}

#[test_log::test(tokio::test)]
async fn environments_crud_and_conflict() {
    for (name, store) in backends(UnknownFlagPolicy::Log) {
        let env = store
            .create_environment(featuregate_store::NewEnvironment {
                key: "production".to_string(),
                name: "Production".to_string(),
                description: None,
                organization_id: Some("org-1".to_string()),
            })
            .await
            .unwrap();
        assert!(
            matches!(
                store
                    .create_environment(featuregate_store::NewEnvironment {
                        key: "production".to_string(),
                        name: "Again".to_string(),
                        description: None,
                        organization_id: Some("org-1".to_string()),
                    })
                    .await,
                Err(StoreError::Conflict(_))
            ),
            "{name}"
        );
        // invalid keys are rejected up front
        assert!(
            matches!(
                store
                    .create_environment(featuregate_store::NewEnvironment {
                        key: "Not Valid".to_string(),
                        name: "Nope".to_string(),
                        description: None,
                        organization_id: None,
                    })
                    .await,
                Err(StoreError::InvalidInput(_))
            ),
            "{name}"
        );

        let updated = store
            .update_environment(
                env.id,
                featuregate_store::EnvironmentUpdate {
                    name: Some("Prod".to_string()),
                    description: Some("primary ring".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Prod", "{name}");

        let listed = store.list_environments(Some("org-1")).await.unwrap();
        assert_eq!(listed.len(), 1, "{name}");

        store.delete_environment(env.id).await.unwrap();
        assert!(
            store.list_environments(Some("org-1")).await.unwrap().is_empty(),
            "{name}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn sqlite_state_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("flags.db");

    let flag_id = {
        let store = SqliteStore::open(&path, UnknownFlagPolicy::Log).expect("open");
        let flag = store
            .create_flag(new_flag("durable", Some("org-1")))
            .await
            .unwrap();
        store.create_rule(new_rule(flag.id, Some(1))).await.unwrap();
        flag.id
    };

    let reopened = SqliteStore::open(&path, UnknownFlagPolicy::Log).expect("reopen");
    let flag = reopened
        .flag_by_key("durable", Some("org-1"))
        .await
        .unwrap()
        .expect("flag persisted");
    assert_eq!(flag.id, flag_id);
    assert_eq!(reopened.rules_for_flag(flag.id).await.unwrap().len(), 1);
}
