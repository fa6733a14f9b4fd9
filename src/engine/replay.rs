//! Replay of the pending queue, and the bulk replace path.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::{SyncEngine, SyncEvent};
use crate::error::{RemoteError, Result, SyncError};
use crate::models::{BulkSnapshot, Operation, PendingOperation, RecordType};
use crate::remote::RemoteApi;
use crate::store::LocalStore;

/// Totals of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Operations acknowledged and removed from the queue
    pub succeeded: usize,
    /// Operations the server rejected; dropped from the queue
    pub failed: usize,
    /// Operations still queued when the pass stopped
    pub remaining: usize,
    /// Record types skipped because a replay was already running
    pub skipped: usize,
}

impl ReplayReport {
    fn absorb(&mut self, other: ReplayReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.remaining += other.remaining;
        self.skipped += other.skipped;
    }
}

/// Holds a per-type replay flag; released on drop
struct ReplayGuard<'a>(&'a AtomicBool);

impl<'a> ReplayGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Outcome {
    Acknowledged,
    Rejected,
    /// Network-class failure; the sub-queue stops here
    Stalled,
}

impl<R, S> SyncEngine<R, S>
where
    R: RemoteApi + 'static,
    S: LocalStore + 'static,
{
    /// Replay queued operations, FIFO per record type, types in parallel.
    ///
    /// A replayed create whose record was edited or deleted meanwhile is
    /// followed by an update or delete; if that follow-up hits a network
    /// failure it is queued, so a pass can leave the queue no shorter.
    pub async fn replay_pending(&self) -> ReplayReport {
        if self.pending_count() == 0 {
            return ReplayReport::default();
        }

        let passes = join_all(RecordType::ALL.map(|record_type| self.replay_type(record_type))).await;

        let mut report = ReplayReport::default();
        let mut ran = false;
        for pass in passes {
            match pass {
                Some(pass) => {
                    ran = true;
                    report.absorb(pass);
                }
                None => report.skipped += 1,
            }
        }

        if ran {
            info!(
                "Replay finished: {} synced, {} rejected, {} remaining",
                report.succeeded, report.failed, report.remaining
            );
            self.inner.events.emit(&SyncEvent::ReplayCompleted {
                succeeded: report.succeeded,
                failed: report.failed,
            });
        }
        report
    }

    async fn replay_type(&self, record_type: RecordType) -> Option<ReplayReport> {
        let Some(_guard) = ReplayGuard::acquire(&self.inner.replaying[record_type.index()]) else {
            debug!("Replay of {} already running", record_type);
            return None;
        };

        let mut report = ReplayReport::default();
        loop {
            let next = self.inner.state.lock().next_pending(record_type).cloned();
            let Some(op) = next else {
                break;
            };

            match self.replay_one(op).await {
                Outcome::Acknowledged => report.succeeded += 1,
                Outcome::Rejected => report.failed += 1,
                Outcome::Stalled => break,
            }
        }

        report.remaining = self
            .inner
            .state
            .lock()
            .queue()
            .iter()
            .filter(|op| op.record_type == record_type)
            .count();
        Some(report)
    }

    async fn replay_one(&self, pending: PendingOperation) -> Outcome {
        let record_type = pending.record_type;
        let label = format!("replay {} {}", pending.kind(), record_type);

        match &pending.op {
            Operation::Create { record } => {
                let payload = record.to_payload();
                match self
                    .call(&label, || self.inner.remote.create(record_type, &payload))
                    .await
                {
                    Ok(remote) => {
                        self.acknowledge_create(record_type, record, remote, Some(pending.id.as_str()))
                            .await;
                        Outcome::Acknowledged
                    }
                    Err(err) if err.is_network_class() => Outcome::Stalled,
                    Err(err) => {
                        self.reject(&pending, &err, true);
                        Outcome::Rejected
                    }
                }
            }
            Operation::Update { record } => {
                // Send the latest local version when there is one
                let current = self
                    .inner
                    .state
                    .lock()
                    .find(record_type, &pending.local_id)
                    .cloned()
                    .unwrap_or_else(|| record.clone());
                let Some(remote_id) = current.remote_id.clone() else {
                    warn!("Dropping update for {} {} without a server id", record_type, pending.local_id);
                    self.transact(|state| state.remove_op(&pending.id));
                    return Outcome::Rejected;
                };

                let payload = current.to_payload();
                match self
                    .call(&label, || {
                        self.inner.remote.update(record_type, &remote_id, &payload)
                    })
                    .await
                {
                    Ok(_) => {
                        self.transact(|state| state.remove_op(&pending.id));
                        Outcome::Acknowledged
                    }
                    Err(err) if err.is_network_class() => Outcome::Stalled,
                    Err(err) => {
                        self.reject(&pending, &err, false);
                        Outcome::Rejected
                    }
                }
            }
            Operation::Delete { remote_id } => {
                match self
                    .call(&label, || self.inner.remote.delete(record_type, remote_id))
                    .await
                {
                    Ok(()) | Err(RemoteError::Rejected { status: 404, .. }) => {
                        self.transact(|state| {
                            state.remove_op(&pending.id);
                            state.prune_updates(record_type, &pending.local_id);
                        });
                        Outcome::Acknowledged
                    }
                    Err(err) if err.is_network_class() => Outcome::Stalled,
                    Err(err) => {
                        self.reject(&pending, &err, false);
                        Outcome::Rejected
                    }
                }
            }
        }
    }

    /// Drop a rejected operation; a rejected create takes its record along
    fn reject(&self, pending: &PendingOperation, err: &RemoteError, drop_record: bool) {
        warn!(
            "Server rejected queued {} of {} {}: {}",
            pending.kind(),
            pending.record_type,
            pending.local_id,
            err
        );

        self.transact(|state| {
            state.remove_op(&pending.id);
            if drop_record {
                state.remove_ops_for(pending.record_type, &pending.local_id);
                if state.remove(pending.record_type, &pending.local_id).is_some() {
                    state.outbox.push(SyncEvent::RecordRemoved {
                        record_type: pending.record_type,
                        id: pending.local_id.clone(),
                    });
                }
            }
            state.outbox.push(SyncEvent::OperationRejected {
                record_type: pending.record_type,
                local_id: pending.local_id.clone(),
                kind: pending.kind(),
                message: err.to_string(),
            });
        });
    }

    /// Replace the user's remote data with every local record.
    ///
    /// Records come back with server ids and are matched to local ids via
    /// `clientId`. Operations queued before the snapshot are cleared.
    pub async fn bulk_sync(&self) -> Result<ReplayReport> {
        let guards: Vec<_> = self
            .inner
            .replaying
            .iter()
            .map(ReplayGuard::acquire)
            .collect();
        if guards.iter().any(Option::is_none) {
            return Err(SyncError::ReplayInFlight);
        }

        let (snapshot, sent_ids, queued_ops) = {
            let state = self.inner.state.lock();
            let mut snapshot = BulkSnapshot::default();
            let mut sent_ids = [HashSet::new(), HashSet::new()];
            for record_type in RecordType::ALL {
                for record in state.records(record_type) {
                    let mut payload = record.to_payload();
                    if let Value::Object(body) = &mut payload {
                        body.insert("clientId".into(), Value::String(record.id.clone()));
                        if let Some(remote_id) = &record.remote_id {
                            body.insert("id".into(), Value::String(remote_id.clone()));
                        }
                    }
                    snapshot.records_mut(record_type).push(payload);
                    sent_ids[record_type.index()].insert(record.id.clone());
                }
            }
            let queued_ops: Vec<String> = state.queue().iter().map(|op| op.id.clone()).collect();
            (snapshot, sent_ids, queued_ops)
        };

        let mut response = self
            .call("bulk sync", || self.inner.remote.bulk_sync(&snapshot))
            .await?;

        let report = self.transact(|state| {
            let mut report = ReplayReport::default();
            for record_type in RecordType::ALL {
                let remote = response.take(record_type);
                report.succeeded +=
                    state.apply_bulk(record_type, remote, &sent_ids[record_type.index()]);
            }
            for op_id in &queued_ops {
                state.remove_op(op_id);
            }
            report.remaining = state.queue().len();
            for record_type in RecordType::ALL {
                state.outbox.push(SyncEvent::Refreshed {
                    record_type,
                    count: state.records(record_type).len(),
                });
            }
            report
        });

        info!("Bulk sync stored {} records", report.succeeded);
        drop(guards);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = ReplayGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(ReplayGuard::acquire(&flag).is_none());

        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(ReplayGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_reports_add_up() {
        let mut total = ReplayReport {
            succeeded: 2,
            ..Default::default()
        };
        total.absorb(ReplayReport {
            succeeded: 1,
            failed: 1,
            remaining: 3,
            skipped: 0,
        });
        assert_eq!(
            total,
            ReplayReport {
                succeeded: 3,
                failed: 1,
                remaining: 3,
                skipped: 0
            }
        );
    }
}
