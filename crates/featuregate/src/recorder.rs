//! Fire-and-forget recording of evaluations and audit entries.
//!
//! A bounded channel feeds a single worker task. The submit side never
//! blocks and never fails the caller: when the queue is full the event
//! is dropped (drop-newest) and a counter is bumped so `/health` can
//! surface the loss.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use featuregate_store::{FlagStore, NewAuditEntry, NewEvaluationRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum RecorderEvent {
    Evaluation(NewEvaluationRecord),
    Audit(NewAuditEntry),
}

#[derive(Clone)]
pub struct Recorder {
    sender: mpsc::Sender<RecorderEvent>,
    dropped: Arc<AtomicU64>,
}

impl Recorder {
    /// Starts the worker task and returns the submit handle.
    pub fn spawn(store: Arc<dyn FlagStore>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<RecorderEvent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    RecorderEvent::Evaluation(record) => {
                        if let Err(err) = store.track_evaluation(record).await {
                            warn!("failed to track evaluation: {err}");
                        }
                    }
                    RecorderEvent::Audit(entry) => {
                        if let Err(err) = store.log_audit(entry).await {
                            warn!("failed to write audit entry: {err}");
                        }
                    }
                }
            }
            debug!("recorder worker stopped");
        });
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_evaluation(&self, record: NewEvaluationRecord) {
        self.submit(RecorderEvent::Evaluation(record));
    }

    pub fn record_audit(&self, entry: NewAuditEntry) {
        self.submit(RecorderEvent::Audit(entry));
    }

    fn submit(&self, event: RecorderEvent) {
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("recorder queue full, dropping event");
        }
    }

    /// Number of events lost to back-pressure since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use featuregate_engine::{EvaluationReason, FlagType, FlagValue};
    use featuregate_store::{
        FlagQuery, MemoryStore, NewFlag, StatsQuery, UnknownFlagPolicy,
    };
    use serde_json::json;

    fn record(key: &str) -> NewEvaluationRecord {
        NewEvaluationRecord {
            flag_key: key.to_string(),
            organization_id: None,
            user_id: Some("u1".to_string()),
            value: FlagValue::Bool(true),
            variant: None,
            reason: EvaluationReason::Default,
            context: json!({}),
            latency_ms: None,
            error: false,
        }
    }

    #[tokio::test]
    async fn test_worker_persists_evaluations() {
        let store = Arc::new(MemoryStore::new(UnknownFlagPolicy::Log));
        let flag = store
            .create_flag(NewFlag {
                key: "tracked".to_string(),
                name: "Tracked".to_string(),
                description: None,
                flag_type: FlagType::Boolean,
                enabled: true,
                default_value: FlagValue::Bool(false),
                rollout_percentage: 100.0,
                organization_id: None,
                variants: Vec::new(),
                metadata: None,
            })
            .await
            .unwrap();

        let recorder = Recorder::spawn(store.clone(), 16);
        recorder.record_evaluation(record("tracked"));

        // the worker drains asynchronously
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let stats = store
                .evaluation_stats(flag.id, &StatsQuery::default())
                .await
                .unwrap();
            if stats.total_evaluations == Some(1) {
                return;
            }
        }
        panic!("evaluation was never persisted");
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_and_counts() {
        let store = Arc::new(MemoryStore::new(UnknownFlagPolicy::Log));
        let recorder = Recorder::spawn(store.clone(), 1);
        // stall the worker by flooding; queue capacity 1 means later
        // submits race it, so drive until we observe a drop
        for _ in 0..256 {
            recorder.record_evaluation(record("missing"));
        }
        assert!(recorder.dropped() > 0);

        let _ = store.list_flags(None, &FlagQuery::default()).await;
    }
}
