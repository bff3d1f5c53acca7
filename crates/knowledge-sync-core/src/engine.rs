//! Incremental sync engine.
//!
//! Drives every source instance through the same sequence:
//!
//! ```text
//! NotStarted → ResolvingInstance → FetchingDelta → ApplyingDeletions
//!            → ApplyingUpserts → AdvancingWatermark → Persisted
//! ```
//!
//! with `Failed` reachable from resolution and fetching. Instances are
//! processed one after another; a failure in one never stops the others.
//!
//! # Watermark contract
//!
//! The watermark only moves after the delta it certifies has been applied,
//! and it moves to exactly the connector's `new_watermark`, not to a value
//! derived from which items succeeded. A failed upsert is therefore not
//! retried on the next incremental run; a full reindex picks it up.
//!
//! The state is loaded once before the first instance and saved once after
//! the last one, so an interrupted run leaves the previous state untouched.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::admission::{Admission, AdmissionRules};
use crate::connector::SourceConnector;
use crate::error::ConnectorError;
use crate::models::{ChangeSet, ContentUnit, Delta, Document, SyncWatermark, UnitKey};
use crate::sink::DocumentSink;
use crate::state::{StateScope, StateStore, SyncRunRecord, SyncState};

/// Per-instance position in the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    NotStarted,
    ResolvingInstance,
    FetchingDelta,
    ApplyingDeletions,
    ApplyingUpserts,
    AdvancingWatermark,
    Persisted,
}

/// Item tallies for one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceCounts {
    pub added: u64,
    pub skipped: u64,
    pub removed: u64,
    pub failed: u64,
}

impl InstanceCounts {
    pub fn merge(&mut self, other: &InstanceCounts) {
        self.added += other.added;
        self.skipped += other.skipped;
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus {
    /// The delta was applied and the watermark advanced in the run's state.
    Persisted {
        watermark: Option<SyncWatermark>,
        rescanned: bool,
    },
    /// The instance was abandoned; its persisted record is untouched.
    Failed {
        phase: SyncPhase,
        error: ConnectorError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceOutcome {
    pub source: String,
    pub instance: String,
    pub counts: InstanceCounts,
    pub status: InstanceStatus,
    /// Partial fetch problems reported by the connector for a persisted instance.
    pub warnings: Vec<String>,
}

impl InstanceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, InstanceStatus::Failed { .. })
    }
}

/// Result of [`SyncEngine::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub full_reindex: bool,
    pub instances: Vec<InstanceOutcome>,
    /// Set when the final state save failed; the next run repeats this one's work.
    pub state_error: Option<String>,
}

impl RunSummary {
    pub fn totals(&self) -> InstanceCounts {
        let mut totals = InstanceCounts::default();
        for outcome in &self.instances {
            totals.merge(&outcome.counts);
        }
        totals
    }

    pub fn failed_instances(&self) -> usize {
        self.instances.iter().filter(|o| o.is_failed()).count()
    }

    pub fn warnings(&self) -> usize {
        self.instances.iter().map(|o| o.warnings.len()).sum()
    }

    pub fn outcome(&self, instance: &str) -> Option<&InstanceOutcome> {
        self.instances.iter().find(|o| o.instance == instance)
    }
}

/// One connector, the sink its documents go to, and the instances to sync.
pub struct SyncJob {
    pub connector: Arc<dyn SourceConnector>,
    pub sink: Arc<dyn DocumentSink>,
    pub instances: Vec<String>,
    pub admission: AdmissionRules,
}

impl SyncJob {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        sink: Arc<dyn DocumentSink>,
        instances: Vec<String>,
    ) -> Self {
        Self {
            connector,
            sink,
            instances,
            admission: AdmissionRules::default(),
        }
    }

    pub fn with_admission(mut self, admission: AdmissionRules) -> Self {
        self.admission = admission;
        self
    }
}

/// Orchestrates connectors, sinks, and the state store.
pub struct SyncEngine<S: StateStore> {
    store: S,
}

impl<S: StateStore> SyncEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Sync every instance of every job, in order.
    ///
    /// With `full_reindex`, all persisted records are discarded first and the
    /// sink existence check is bypassed, so every admitted unit is rewritten.
    pub async fn run(&self, jobs: &[SyncJob], full_reindex: bool) -> RunSummary {
        let mut state = if full_reindex {
            if let Err(e) = self.store.reset() {
                warn!(error = %e, "failed to reset sync state; continuing from empty state");
            }
            SyncState::default()
        } else {
            self.store.load()
        };

        let mut summary = RunSummary {
            full_reindex,
            ..RunSummary::default()
        };

        for job in jobs {
            let scope = job.connector.scope();
            for descriptor in &job.instances {
                let descriptor = descriptor.trim();
                if descriptor.is_empty() {
                    continue;
                }
                let span = info_span!("instance", source = %scope.source, instance = %descriptor);
                let outcome = self
                    .sync_instance(job, &scope, descriptor, &mut state, full_reindex)
                    .instrument(span)
                    .await;
                summary.instances.push(outcome);
            }
        }

        if let Err(e) = self.store.save(&state) {
            error!(error = %e, "failed to save sync state");
            summary.state_error = Some(e.to_string());
        }

        summary
    }

    async fn sync_instance(
        &self,
        job: &SyncJob,
        scope: &StateScope,
        descriptor: &str,
        state: &mut SyncState,
        full_reindex: bool,
    ) -> InstanceOutcome {
        let mut counts = InstanceCounts::default();
        let failed = |instance: &str, phase: SyncPhase, error: ConnectorError| {
            warn!(%error, ?phase, "instance failed");
            InstanceOutcome {
                source: scope.source.clone(),
                instance: instance.to_string(),
                counts: InstanceCounts::default(),
                status: InstanceStatus::Failed { phase, error },
                warnings: Vec::new(),
            }
        };

        enter(SyncPhase::ResolvingInstance);
        let handle = match job.connector.resolve_instance(descriptor).await {
            Ok(handle) => handle,
            Err(error) => return failed(descriptor, SyncPhase::ResolvingInstance, error),
        };

        let prior = state.get(scope, &handle.key).cloned().filter(|record| {
            let expected = job.connector.watermark_kind();
            if record.watermark.kind() != expected {
                warn!(
                    watermark = %record.watermark,
                    "stored watermark has the wrong kind for this source; treating as first run"
                );
                return false;
            }
            true
        });
        let prior_watermark = prior.as_ref().map(|record| &record.watermark);

        enter(SyncPhase::FetchingDelta);
        let delta = match job.connector.fetch_delta(&handle, prior_watermark).await {
            Ok(delta) => delta,
            Err(error) => return failed(&handle.key, SyncPhase::FetchingDelta, error),
        };
        let Delta {
            changes:
                ChangeSet {
                    added_or_modified,
                    mut removed,
                },
            new_watermark,
            rescan,
            warnings,
        } = delta;
        if rescan {
            warn!("stored watermark no longer matches source history; rescanning");
        }
        for warning in &warnings {
            warn!(%warning, "partial fetch");
        }

        let mut admitted: Vec<ContentUnit> = Vec::with_capacity(added_or_modified.len());
        for unit in added_or_modified {
            match job.admission.check(&unit) {
                Admission::Admitted => admitted.push(unit),
                rejection => {
                    debug!(id = %unit.key.document_id(), reason = %rejection, "unit not admitted");
                    counts.skipped += 1;
                }
            }
        }

        let tracked = job.connector.tracked_source_type();
        let mut indexed: BTreeSet<String> = prior
            .as_ref()
            .and_then(|record| record.indexed_units.clone())
            .unwrap_or_default()
            .into_iter()
            .collect();

        if let (true, Some(kind)) = (rescan, tracked) {
            let present: BTreeSet<&str> = admitted
                .iter()
                .filter(|unit| unit.key.source_type == kind)
                .map(|unit| unit.key.natural_key.as_str())
                .collect();
            for key in indexed.iter().filter(|key| !present.contains(key.as_str())) {
                removed.insert(UnitKey::new(kind, handle.key.clone(), key.clone()));
            }
        }

        enter(SyncPhase::ApplyingDeletions);
        for key in &removed {
            let id = key.document_id();
            match job.sink.delete(&id).await {
                Ok(()) => {
                    counts.removed += 1;
                    if tracked == Some(key.source_type.as_str()) {
                        indexed.remove(&key.natural_key);
                    }
                }
                Err(error) => {
                    warn!(%error, "delete failed; document may remain stale");
                    counts.failed += 1;
                }
            }
        }

        enter(SyncPhase::ApplyingUpserts);
        let force = full_reindex || rescan;
        for unit in &admitted {
            let id = unit.key.document_id();
            if !force {
                match job.sink.get(&id).await {
                    Ok(Some(_)) => {
                        counts.skipped += 1;
                        track(&mut indexed, tracked, unit);
                        continue;
                    }
                    Ok(None) => {}
                    Err(error) => warn!(%error, "existence check failed; upserting"),
                }
            }
            match job.sink.upsert(&Document::from_unit(unit)).await {
                Ok(()) => {
                    counts.added += 1;
                    track(&mut indexed, tracked, unit);
                }
                Err(error) => {
                    warn!(%error, "upsert failed");
                    counts.failed += 1;
                }
            }
        }

        enter(SyncPhase::AdvancingWatermark);
        let next = match (new_watermark, prior_watermark) {
            (Some(next), Some(prev)) if prev.regresses_to(&next) => {
                warn!(%prev, %next, "connector reported an older watermark; keeping the stored one");
                Some(prev.clone())
            }
            (Some(next), _) => Some(next),
            (None, prev) => prev.cloned(),
        };
        if let Some(watermark) = &next {
            state.put(
                scope,
                &handle.key,
                SyncRunRecord {
                    watermark: watermark.clone(),
                    last_run: Utc::now(),
                    indexed_units: tracked.map(|_| indexed.into_iter().collect()),
                },
            );
        }

        enter(SyncPhase::Persisted);
        info!(
            added = counts.added,
            skipped = counts.skipped,
            removed = counts.removed,
            failed = counts.failed,
            watermark = ?next,
            "instance synced"
        );
        InstanceOutcome {
            source: scope.source.clone(),
            instance: handle.key,
            counts,
            status: InstanceStatus::Persisted {
                watermark: next,
                rescanned: rescan,
            },
            warnings,
        }
    }
}

fn enter(phase: SyncPhase) {
    debug!(?phase, "entering phase");
}

fn track(indexed: &mut BTreeSet<String>, tracked: Option<&str>, unit: &ContentUnit) {
    if tracked == Some(unit.key.source_type.as_str()) {
        indexed.insert(unit.key.natural_key.clone());
    }
}
