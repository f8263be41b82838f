//! Evaluation tracking records and aggregate statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use featuregate_engine::{EvaluationId, EvaluationReason, FlagId, FlagValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::DateRange;

/// A tracked evaluation submitted by the service. The flag is addressed
/// by key because unknown keys are subject to the configured
/// unknown-flag policy.
#[derive(Debug, Clone)]
pub struct NewEvaluationRecord {
    pub flag_key: String,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub value: FlagValue,
    pub variant: Option<String>,
    pub reason: EvaluationReason,
    /// Context snapshot at evaluation time.
    pub context: Value,
    pub latency_ms: Option<f64>,
    pub error: bool,
}

/// A stored evaluation record. Append-only with bounded retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRecord {
    pub id: EvaluationId,
    pub flag_id: FlagId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub reason: EvaluationReason,
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub error: bool,
    pub evaluated_at: DateTime<Utc>,
}

/// Metrics a stats query may request. Omitted metrics are not computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatMetric {
    TotalEvaluations,
    UniqueUsers,
    Variants,
    Reasons,
    AvgLatency,
    ErrorRate,
}

impl StatMetric {
    pub const ALL: [StatMetric; 6] = [
        StatMetric::TotalEvaluations,
        StatMetric::UniqueUsers,
        StatMetric::Variants,
        StatMetric::Reasons,
        StatMetric::AvgLatency,
        StatMetric::ErrorRate,
    ];
}

/// Time-series bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

#[derive(Debug, Clone, Default)]
pub struct StatsQuery {
    pub range: Option<DateRange>,
    /// Requested subset; `None` means all metrics.
    pub metrics: Option<Vec<StatMetric>>,
    pub granularity: Option<Granularity>,
    /// Shifts series bucket boundaries to a caller timezone expressed
    /// as a fixed UTC offset. Bucket timestamps stay in UTC.
    pub utc_offset_minutes: i32,
}

impl StatsQuery {
    pub fn wants(&self, metric: StatMetric) -> bool {
        match &self.metrics {
            None => true,
            Some(list) => list.contains(&metric),
        }
    }
}

/// One bucket of an evaluation time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesBucket {
    pub period_start: DateTime<Utc>,
    pub total_evaluations: u64,
}

/// Aggregated statistics for one flag. Only requested metrics are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_evaluations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_users: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasons: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<SeriesBucket>>,
}

/// Organization-wide usage rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub total_flags: u64,
    pub enabled_flags: u64,
    pub total_evaluations: u64,
    pub unique_users: u64,
}

/// Computes the requested stats from raw records. Shared by backends
/// that aggregate in process; SQL backends may push parts of this into
/// queries but must produce identical numbers.
pub fn aggregate_stats(records: &[EvaluationRecord], query: &StatsQuery) -> EvaluationStats {
    let mut stats = EvaluationStats::default();
    if query.wants(StatMetric::TotalEvaluations) {
        stats.total_evaluations = Some(records.len() as u64);
    }
    if query.wants(StatMetric::UniqueUsers) {
        let users: std::collections::HashSet<&str> = records
            .iter()
            .filter_map(|r| r.user_id.as_deref())
            .collect();
        stats.unique_users = Some(users.len() as u64);
    }
    if query.wants(StatMetric::Variants) {
        let mut variants = BTreeMap::new();
        for record in records {
            if let Some(variant) = &record.variant {
                *variants.entry(variant.clone()).or_insert(0) += 1;
            }
        }
        stats.variants = Some(variants);
    }
    if query.wants(StatMetric::Reasons) {
        let mut reasons = BTreeMap::new();
        for record in records {
            *reasons.entry(record.reason.to_string()).or_insert(0) += 1;
        }
        stats.reasons = Some(reasons);
    }
    if query.wants(StatMetric::AvgLatency) {
        let latencies: Vec<f64> = records.iter().filter_map(|r| r.latency_ms).collect();
        if !latencies.is_empty() {
            stats.avg_latency_ms = Some(latencies.iter().sum::<f64>() / latencies.len() as f64);
        }
    }
    if query.wants(StatMetric::ErrorRate) && !records.is_empty() {
        let errors = records.iter().filter(|r| r.error).count();
        stats.error_rate = Some(errors as f64 / records.len() as f64);
    }
    if let Some(granularity) = query.granularity {
        stats.series = Some(bucket_series(records, granularity, query.utc_offset_minutes));
    }
    stats
}

fn bucket_series(
    records: &[EvaluationRecord],
    granularity: Granularity,
    utc_offset_minutes: i32,
) -> Vec<SeriesBucket> {
    use chrono::{Duration, DurationRound};

    let width = match granularity {
        Granularity::Hour => Duration::hours(1),
        Granularity::Day => Duration::days(1),
    };
    let offset = Duration::minutes(i64::from(utc_offset_minutes));
    let mut buckets: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
    for record in records {
        let Ok(start) = (record.evaluated_at + offset).duration_trunc(width) else {
            continue;
        };
        *buckets.entry(start - offset).or_insert(0) += 1;
    }
    buckets
        .into_iter()
        .map(|(period_start, total_evaluations)| SeriesBucket {
            period_start,
            total_evaluations,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(user: Option<&str>, variant: Option<&str>, latency: Option<f64>, error: bool) -> EvaluationRecord {
        EvaluationRecord {
            id: EvaluationId::new(),
            flag_id: FlagId::new(),
            user_id: user.map(String::from),
            value: FlagValue::Bool(true),
            variant: variant.map(String::from),
            reason: EvaluationReason::Default,
            context: serde_json::json!({}),
            latency_ms: latency,
            error,
            evaluated_at: Utc.with_ymd_and_hms(2026, 7, 1, 10, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_aggregate_requested_subset_only() {
        let records = vec![
            record(Some("u1"), Some("A"), Some(2.0), false),
            record(Some("u1"), Some("B"), Some(4.0), true),
            record(Some("u2"), None, None, false),
        ];
        let query = StatsQuery {
            metrics: Some(vec![StatMetric::TotalEvaluations, StatMetric::UniqueUsers]),
            ..Default::default()
        };
        let stats = aggregate_stats(&records, &query);
        assert_eq!(stats.total_evaluations, Some(3));
        assert_eq!(stats.unique_users, Some(2));
        assert!(stats.variants.is_none());
        assert!(stats.avg_latency_ms.is_none());
    }

    #[test]
    fn test_aggregate_all_metrics() {
        let records = vec![
            record(Some("u1"), Some("A"), Some(2.0), false),
            record(Some("u2"), Some("A"), Some(6.0), true),
        ];
        let stats = aggregate_stats(&records, &StatsQuery::default());
        assert_eq!(stats.total_evaluations, Some(2));
        assert_eq!(stats.variants.unwrap().get("A"), Some(&2));
        assert_eq!(stats.avg_latency_ms, Some(4.0));
        assert_eq!(stats.error_rate, Some(0.5));
    }

    #[test]
    fn test_series_bucketing_by_hour() {
        let mut early = record(None, None, None, false);
        early.evaluated_at = Utc.with_ymd_and_hms(2026, 7, 1, 10, 5, 0).unwrap();
        let mut late = record(None, None, None, false);
        late.evaluated_at = Utc.with_ymd_and_hms(2026, 7, 1, 11, 59, 0).unwrap();
        let query = StatsQuery {
            granularity: Some(Granularity::Hour),
            ..Default::default()
        };
        let stats = aggregate_stats(&[early, late], &query);
        let series = stats.series.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(
            series[0].period_start,
            Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap()
        );
    }
}
