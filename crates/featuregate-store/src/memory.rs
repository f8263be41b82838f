//! In-memory reference backend.
//!
//! Keeps every collection behind a single `RwLock` with secondary
//! indexes for the hot lookups: `(organization, key) → flag` and
//! `(flag, user) → override`. The evaluation log is a bounded ring;
//! the oldest records fall off once the retention cap is reached.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use featuregate_engine::{
    AuditId, EnvironmentId, EvaluationId, EvaluationReason, Flag, FlagId, Override, OverrideId,
    Rule, RuleId, sort_rules,
};
use tokio::sync::RwLock;
use tracing::warn;

use crate::analytics::{
    EvaluationRecord, EvaluationStats, NewEvaluationRecord, StatsQuery, UsageMetrics,
    aggregate_stats,
};
use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::environment::{Environment, EnvironmentUpdate, NewEnvironment};
use crate::error::StoreError;
use crate::query::{DateRange, FlagQuery, FlagOrderBy, OrderDirection};
use crate::store::{
    FlagStore, FlagUpdate, NewFlag, NewOverride, NewRule, OverrideUpdate, RuleUpdate,
    UNKNOWN_FLAG_KEY, UnknownFlagPolicy,
};

/// Default cap on retained evaluation records.
const DEFAULT_MAX_EVALUATIONS: usize = 10_000;

#[derive(Default)]
struct Inner {
    flags: HashMap<FlagId, Flag>,
    /// `(organization scope, key) → flag id`; the global scope is `None`.
    keys: HashMap<(Option<String>, String), FlagId>,
    rules: HashMap<FlagId, Vec<Rule>>,
    overrides: HashMap<OverrideId, Override>,
    override_index: HashMap<(FlagId, String), OverrideId>,
    evaluations: VecDeque<EvaluationRecord>,
    audits: Vec<AuditEntry>,
    environments: HashMap<EnvironmentId, Environment>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    unknown_flag_policy: UnknownFlagPolicy,
    max_evaluations: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(UnknownFlagPolicy::default())
    }
}

impl MemoryStore {
    pub fn new(unknown_flag_policy: UnknownFlagPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            unknown_flag_policy,
            max_evaluations: DEFAULT_MAX_EVALUATIONS,
        }
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }
}

fn scope(organization_id: Option<&str>) -> Option<String> {
    organization_id.map(str::to_string)
}

fn list_sort(flags: &mut [Flag], query: &FlagQuery) {
    flags.sort_by(|a, b| {
        let ordering = match query.order_by {
            FlagOrderBy::Key => a.key.cmp(&b.key),
            FlagOrderBy::Name => a.name.cmp(&b.name),
            FlagOrderBy::CreatedAt => a.created_at.cmp(&b.created_at),
            FlagOrderBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        let ordering = match query.order_direction {
            OrderDirection::Asc => ordering,
            OrderDirection::Desc => ordering.reverse(),
        };
        // stable tie-break keeps pages disjoint
        ordering.then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
}

fn matches_query(flag: &Flag, query: &FlagQuery) -> bool {
    if let Some(flag_type) = query.flag_type {
        if flag.flag_type != flag_type {
            return false;
        }
    }
    if let Some(enabled) = query.enabled {
        if flag.enabled != enabled {
            return false;
        }
    }
    if let Some(prefix) = &query.key_prefix {
        if !flag.key.starts_with(prefix.as_str()) {
            return false;
        }
    }
    if let Some(search) = &query.search {
        let needle = search.to_lowercase();
        if !flag.key.to_lowercase().contains(&needle)
            && !flag.name.to_lowercase().contains(&needle)
        {
            return false;
        }
    }
    true
}

impl Inner {
    fn ensure_unknown_flag(&mut self, now: DateTime<Utc>) -> FlagId {
        let key = (None, UNKNOWN_FLAG_KEY.to_string());
        if let Some(id) = self.keys.get(&key) {
            return *id;
        }
        let flag = Flag {
            id: FlagId::new(),
            key: UNKNOWN_FLAG_KEY.to_string(),
            name: "Unknown flag evaluations".to_string(),
            description: Some("Reserved sink for evaluations of unknown flag keys".to_string()),
            flag_type: featuregate_engine::FlagType::Json,
            enabled: false,
            default_value: featuregate_engine::FlagValue::Json(serde_json::Value::Null),
            rollout_percentage: 0.0,
            organization_id: None,
            variants: Vec::new(),
            metadata: None,
            created_at: now,
            updated_at: now,
        };
        let id = flag.id;
        self.keys.insert(key, id);
        self.flags.insert(id, flag);
        id
    }

    fn push_evaluation(&mut self, record: EvaluationRecord, max: usize) {
        self.evaluations.push_back(record);
        while self.evaluations.len() > max {
            self.evaluations.pop_front();
        }
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn flag_by_key(
        &self,
        key: &str,
        organization_id: Option<&str>,
    ) -> Result<Option<Flag>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .get(&(scope(organization_id), key.to_string()))
            .and_then(|id| inner.flags.get(id))
            .cloned())
    }

    async fn flag_by_id(&self, id: FlagId) -> Result<Option<Flag>, StoreError> {
        Ok(self.inner.read().await.flags.get(&id).cloned())
    }

    async fn flags_by_keys(
        &self,
        keys: &[String],
        organization_id: Option<&str>,
    ) -> Result<Vec<Flag>, StoreError> {
        let inner = self.inner.read().await;
        let org = scope(organization_id);
        Ok(keys
            .iter()
            .filter_map(|key| inner.keys.get(&(org.clone(), key.clone())))
            .filter_map(|id| inner.flags.get(id))
            .cloned()
            .collect())
    }

    async fn list_flags(
        &self,
        organization_id: Option<&str>,
        query: &FlagQuery,
    ) -> Result<Vec<Flag>, StoreError> {
        let inner = self.inner.read().await;
        let org = scope(organization_id);
        let mut flags: Vec<Flag> = inner
            .flags
            .values()
            .filter(|f| f.organization_id == org && f.key != UNKNOWN_FLAG_KEY)
            .filter(|f| matches_query(f, query))
            .cloned()
            .collect();
        list_sort(&mut flags, query);
        let page = flags.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        })
    }

    async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, StoreError> {
        let flag = new_flag.into_flag(Utc::now())?;
        let mut inner = self.inner.write().await;
        let index_key = (flag.organization_id.clone(), flag.key.clone());
        if inner.keys.contains_key(&index_key) {
            return Err(StoreError::Conflict(flag.key));
        }
        inner.keys.insert(index_key, flag.id);
        inner.flags.insert(flag.id, flag.clone());
        Ok(flag)
    }

    async fn update_flag(&self, id: FlagId, update: FlagUpdate) -> Result<Flag, StoreError> {
        let mut inner = self.inner.write().await;
        let flag = inner.flags.get_mut(&id).ok_or(StoreError::FlagNotFound)?;
        update.apply(flag, Utc::now())?;
        Ok(flag.clone())
    }

    async fn delete_flag(&self, id: FlagId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let flag = inner.flags.remove(&id).ok_or(StoreError::FlagNotFound)?;
        inner
            .keys
            .remove(&(flag.organization_id.clone(), flag.key.clone()));
        inner.rules.remove(&id);
        let stale: Vec<OverrideId> = inner
            .overrides
            .values()
            .filter(|o| o.flag_id == id)
            .map(|o| o.id)
            .collect();
        for override_id in stale {
            if let Some(removed) = inner.overrides.remove(&override_id) {
                inner
                    .override_index
                    .remove(&(removed.flag_id, removed.user_id));
            }
        }
        inner.evaluations.retain(|r| r.flag_id != id);
        Ok(())
    }

    async fn rules_for_flag(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError> {
        let inner = self.inner.read().await;
        let mut rules = inner.rules.get(&flag_id).cloned().unwrap_or_default();
        sort_rules(&mut rules);
        Ok(rules)
    }

    async fn rule_by_id(&self, id: RuleId) -> Result<Option<Rule>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .values()
            .flatten()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn create_rule(&self, new_rule: NewRule) -> Result<Rule, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.flags.contains_key(&new_rule.flag_id) {
            return Err(StoreError::FlagNotFound);
        }
        let existing = inner.rules.entry(new_rule.flag_id).or_default();
        let priority = new_rule.priority.unwrap_or_else(|| {
            existing.iter().map(|r| r.priority).max().unwrap_or(0) + 1
        });
        let rule = Rule {
            id: RuleId::new(),
            flag_id: new_rule.flag_id,
            priority,
            conditions: new_rule.conditions,
            value: new_rule.value,
            variant: new_rule.variant,
            percentage: new_rule.percentage,
            enabled: new_rule.enabled,
            created_at: Utc::now(),
        };
        rule.validate()?;
        existing.push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, id: RuleId, update: RuleUpdate) -> Result<Rule, StoreError> {
        let mut inner = self.inner.write().await;
        let rule = inner
            .rules
            .values_mut()
            .flatten()
            .find(|r| r.id == id)
            .ok_or(StoreError::RuleNotFound)?;
        update.apply(rule)?;
        Ok(rule.clone())
    }

    async fn delete_rule(&self, id: RuleId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for rules in inner.rules.values_mut() {
            if let Some(position) = rules.iter().position(|r| r.id == id) {
                rules.remove(position);
                return Ok(());
            }
        }
        Err(StoreError::RuleNotFound)
    }

    async fn reorder_rules(&self, flag_id: FlagId, order: &[RuleId]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let rules = inner.rules.get_mut(&flag_id).ok_or(StoreError::FlagNotFound)?;
        // a true permutation: duplicate-free and covering every rule
        let submitted: std::collections::HashSet<RuleId> = order.iter().copied().collect();
        if submitted.len() != order.len()
            || submitted.len() != rules.len()
            || !rules.iter().all(|r| submitted.contains(&r.id))
        {
            return Err(StoreError::InvalidInput(
                "reorder must submit a permutation of the flag's rule ids".to_string(),
            ));
        }
        for rule in rules.iter_mut() {
            if let Some(index) = order.iter().position(|id| *id == rule.id) {
                rule.priority = index as i64 + 1;
            }
        }
        Ok(())
    }

    async fn override_for(
        &self,
        flag_id: FlagId,
        user_id: &str,
    ) -> Result<Option<Override>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .override_index
            .get(&(flag_id, user_id.to_string()))
            .and_then(|id| inner.overrides.get(id))
            .cloned())
    }

    async fn override_by_id(&self, id: OverrideId) -> Result<Option<Override>, StoreError> {
        Ok(self.inner.read().await.overrides.get(&id).cloned())
    }

    async fn create_override(&self, new_override: NewOverride) -> Result<Override, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.flags.contains_key(&new_override.flag_id) {
            return Err(StoreError::FlagNotFound);
        }
        let index_key = (new_override.flag_id, new_override.user_id.clone());
        if inner.override_index.contains_key(&index_key) {
            return Err(StoreError::Conflict(new_override.user_id));
        }
        let record = Override {
            id: OverrideId::new(),
            flag_id: new_override.flag_id,
            user_id: new_override.user_id,
            value: new_override.value,
            variant: new_override.variant,
            expires_at: new_override.expires_at,
            reason: new_override.reason,
            created_at: Utc::now(),
        };
        inner.override_index.insert(index_key, record.id);
        inner.overrides.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_override(
        &self,
        id: OverrideId,
        update: OverrideUpdate,
    ) -> Result<Override, StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .overrides
            .get_mut(&id)
            .ok_or(StoreError::OverrideNotFound)?;
        update.apply(existing);
        Ok(existing.clone())
    }

    async fn delete_override(&self, id: OverrideId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .overrides
            .remove(&id)
            .ok_or(StoreError::OverrideNotFound)?;
        inner
            .override_index
            .remove(&(removed.flag_id, removed.user_id));
        Ok(())
    }

    async fn list_overrides(
        &self,
        flag_id: Option<FlagId>,
        user_id: Option<&str>,
    ) -> Result<Vec<Override>, StoreError> {
        let inner = self.inner.read().await;
        let mut overrides: Vec<Override> = inner
            .overrides
            .values()
            .filter(|o| flag_id.is_none_or(|id| o.flag_id == id))
            .filter(|o| user_id.is_none_or(|user| o.user_id == user))
            .cloned()
            .collect();
        overrides.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        Ok(overrides)
    }

    async fn track_evaluation(&self, record: NewEvaluationRecord) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let org = record.organization_id.clone();
        let lookup = inner
            .keys
            .get(&(org, record.flag_key.clone()))
            .copied();
        let (flag_id, reason, context) = match lookup {
            Some(id) => (id, record.reason, record.context),
            None => match self.unknown_flag_policy {
                UnknownFlagPolicy::Log => {
                    warn!(flag_key = %record.flag_key, "dropping evaluation for unknown flag");
                    return Ok(());
                }
                UnknownFlagPolicy::Throw => {
                    return Err(StoreError::UnknownFlag(record.flag_key));
                }
                UnknownFlagPolicy::TrackUnknown => {
                    let sink = inner.ensure_unknown_flag(now);
                    let mut context = record.context;
                    if let Some(object) = context.as_object_mut() {
                        object.insert(
                            "unknownFlagKey".to_string(),
                            serde_json::Value::String(record.flag_key.clone()),
                        );
                    }
                    (sink, EvaluationReason::NotFound, context)
                }
            },
        };
        let stored = EvaluationRecord {
            id: EvaluationId::new(),
            flag_id,
            user_id: record.user_id,
            value: record.value,
            variant: record.variant,
            reason,
            context,
            latency_ms: record.latency_ms,
            error: record.error,
            evaluated_at: now,
        };
        inner.push_evaluation(stored, self.max_evaluations);
        Ok(())
    }

    async fn evaluation_stats(
        &self,
        flag_id: FlagId,
        query: &StatsQuery,
    ) -> Result<EvaluationStats, StoreError> {
        let inner = self.inner.read().await;
        let records: Vec<EvaluationRecord> = inner
            .evaluations
            .iter()
            .filter(|r| r.flag_id == flag_id)
            .filter(|r| query.range.is_none_or(|range| range.contains(r.evaluated_at)))
            .cloned()
            .collect();
        Ok(aggregate_stats(&records, query))
    }

    async fn usage_metrics(
        &self,
        organization_id: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<UsageMetrics, StoreError> {
        let inner = self.inner.read().await;
        let org = scope(organization_id);
        let flag_ids: Vec<FlagId> = inner
            .flags
            .values()
            .filter(|f| f.organization_id == org && f.key != UNKNOWN_FLAG_KEY)
            .map(|f| f.id)
            .collect();
        let enabled_flags = inner
            .flags
            .values()
            .filter(|f| f.organization_id == org && f.enabled && f.key != UNKNOWN_FLAG_KEY)
            .count() as u64;
        let records: Vec<&EvaluationRecord> = inner
            .evaluations
            .iter()
            .filter(|r| flag_ids.contains(&r.flag_id))
            .filter(|r| range.is_none_or(|window| window.contains(r.evaluated_at)))
            .collect();
        let unique_users = records
            .iter()
            .filter_map(|r| r.user_id.as_deref())
            .collect::<std::collections::HashSet<_>>()
            .len() as u64;
        Ok(UsageMetrics {
            total_flags: flag_ids.len() as u64,
            enabled_flags,
            total_evaluations: records.len() as u64,
            unique_users,
        })
    }

    async fn log_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let stored = AuditEntry {
            id: AuditId::new(),
            flag_id: entry.flag_id,
            user_id: entry.user_id,
            action: entry.action,
            organization_id: entry.organization_id,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        self.inner.write().await.audits.push(stored.clone());
        Ok(stored)
    }

    async fn audit_logs(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner.read().await;
        let mut entries: Vec<AuditEntry> = inner
            .audits
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // most recent first, deterministic under equal timestamps
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.to_string().cmp(&a.id.to_string()))
        });
        let page = entries.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        })
    }

    async fn audit_by_id(&self, id: AuditId) -> Result<Option<AuditEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.audits.iter().find(|e| e.id == id).cloned())
    }

    async fn cleanup_audit_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.audits.len();
        inner.audits.retain(|e| e.created_at >= older_than);
        Ok((before - inner.audits.len()) as u64)
    }

    async fn list_environments(
        &self,
        organization_id: Option<&str>,
    ) -> Result<Vec<Environment>, StoreError> {
        let inner = self.inner.read().await;
        let org = scope(organization_id);
        let mut environments: Vec<Environment> = inner
            .environments
            .values()
            .filter(|e| e.organization_id == org)
            .cloned()
            .collect();
        environments.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(environments)
    }

    async fn environment_by_id(
        &self,
        id: EnvironmentId,
    ) -> Result<Option<Environment>, StoreError> {
        Ok(self.inner.read().await.environments.get(&id).cloned())
    }

    async fn create_environment(
        &self,
        new_environment: NewEnvironment,
    ) -> Result<Environment, StoreError> {
        if !Environment::validate_key(&new_environment.key) {
            return Err(StoreError::InvalidInput(format!(
                "invalid environment key {:?}",
                new_environment.key
            )));
        }
        let mut inner = self.inner.write().await;
        if inner.environments.values().any(|e| {
            e.key == new_environment.key && e.organization_id == new_environment.organization_id
        }) {
            return Err(StoreError::Conflict(new_environment.key));
        }
        let environment = Environment {
            id: EnvironmentId::new(),
            key: new_environment.key,
            name: new_environment.name,
            description: new_environment.description,
            organization_id: new_environment.organization_id,
            created_at: Utc::now(),
        };
        inner.environments.insert(environment.id, environment.clone());
        Ok(environment)
    }

    async fn update_environment(
        &self,
        id: EnvironmentId,
        update: EnvironmentUpdate,
    ) -> Result<Environment, StoreError> {
        let mut inner = self.inner.write().await;
        let environment = inner
            .environments
            .get_mut(&id)
            .ok_or(StoreError::EnvironmentNotFound)?;
        if let Some(name) = update.name {
            environment.name = name;
        }
        if let Some(description) = update.description {
            environment.description = Some(description);
        }
        Ok(environment.clone())
    }

    async fn delete_environment(&self, id: EnvironmentId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .environments
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::EnvironmentNotFound)
    }

    async fn healthy(&self) -> bool {
        true
    }
}
