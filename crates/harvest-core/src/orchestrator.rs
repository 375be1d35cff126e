//! One harvesting process: plan, resume, and drive a bounded worker pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointStore, CheckpointTracker};
use crate::clock::Clock;
use crate::config::HarvestConfig;
use crate::dedup::Deduplicator;
use crate::egress::EgressPool;
use crate::error::HarvestError;
use crate::models::{Partition, Session};
use crate::partition::{PartitionEnumerator, select_regions};
use crate::retry::RetryPolicy;
use crate::sink::RecordSink;
use crate::traits::PortalAdapter;
use crate::walker::{PageWalker, WalkOutcome, WalkReport};

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    Planned {
        instance: &'a str,
        total: usize,
        assigned: usize,
    },
    Resumed {
        run_id: &'a str,
        completed: usize,
        in_flight: usize,
    },
    Seeded {
        ids: usize,
    },
    Skipped {
        partition: &'a Partition,
    },
    PartitionStarted {
        worker: usize,
        partition: &'a Partition,
    },
    PartitionFinished {
        worker: usize,
        report: &'a WalkReport,
    },
    WorkerFailed {
        worker: usize,
        partition: &'a Partition,
        error: &'a HarvestError,
    },
    WorkerStopped {
        worker: usize,
    },
    Finished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Planned {
                instance,
                total,
                assigned,
            } => {
                tracing::info!(%instance, %total, %assigned, "Partitions planned");
            }
            RunEvent::Resumed {
                run_id,
                completed,
                in_flight,
            } => {
                tracing::info!(%run_id, %completed, %in_flight, "Resuming from checkpoint");
            }
            RunEvent::Seeded { ids } => {
                tracing::info!(%ids, "Seeded deduplicator from existing output");
            }
            RunEvent::Skipped { partition } => {
                tracing::debug!(partition = %partition, "Partition already complete");
            }
            RunEvent::PartitionStarted { worker, partition } => {
                tracing::info!(%worker, partition = %partition, "Walking partition");
            }
            RunEvent::PartitionFinished { worker, report } => match &report.outcome {
                WalkOutcome::Completed { .. } => {
                    tracing::info!(
                        %worker,
                        partition = %report.partition,
                        emitted = report.emitted,
                        suppressed = report.suppressed,
                        "Partition finished"
                    );
                }
                WalkOutcome::Abandoned { offset, error } => {
                    tracing::warn!(
                        %worker,
                        partition = %report.partition,
                        %offset,
                        %error,
                        "Partition abandoned"
                    );
                }
                WalkOutcome::Cancelled { offset } => {
                    tracing::info!(
                        %worker,
                        partition = %report.partition,
                        %offset,
                        "Partition interrupted"
                    );
                }
            },
            RunEvent::WorkerFailed {
                worker,
                partition,
                error,
            } => {
                tracing::error!(
                    %worker,
                    partition = %partition,
                    %error,
                    "Worker failed, stopping run"
                );
            }
            RunEvent::WorkerStopped { worker } => {
                tracing::debug!(%worker, "Worker stopped");
            }
            RunEvent::Finished { summary } => {
                tracing::info!(
                    planned = summary.planned,
                    skipped = summary.skipped,
                    completed = summary.completed,
                    abandoned = summary.abandoned,
                    interrupted = summary.interrupted,
                    records = summary.records_emitted,
                    duplicates = summary.duplicates_suppressed,
                    "Run finished"
                );
            }
        }
    }
}

/// Partitions this process is responsible for.
#[derive(Debug, Clone)]
pub struct Plan {
    pub session: Session,
    /// Size of the global partition list, before slicing.
    pub total_partitions: usize,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub planned: usize,
    pub skipped: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub interrupted: usize,
    pub records_emitted: u64,
    pub duplicates_suppressed: u64,
}

impl RunSummary {
    fn absorb(&mut self, report: &WalkReport) {
        match report.outcome {
            WalkOutcome::Completed { .. } => self.completed += 1,
            WalkOutcome::Abandoned { .. } => self.abandoned += 1,
            WalkOutcome::Cancelled { .. } => self.interrupted += 1,
        }
        self.records_emitted += report.emitted;
    }
}

pub struct Orchestrator<P: PortalAdapter, C: Clock> {
    portal: P,
    config: HarvestConfig,
    retry: RetryPolicy<C>,
    clock: C,
}

impl<P: PortalAdapter, C: Clock> Orchestrator<P, C> {
    /// `pool` should already be this instance's share of the identities.
    pub fn new(portal: P, config: HarvestConfig, pool: EgressPool, clock: C) -> Self {
        let retry = RetryPolicy::new(config.retry.clone(), pool, clock.clone());
        Self {
            portal,
            config,
            retry,
            clock,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Authenticate, discover regions and compute this instance's partitions.
    pub async fn plan(&self) -> Result<Plan, HarvestError> {
        self.config.validate()?;

        let session = self
            .retry
            .execute(|identity| {
                let portal = self.portal.clone();
                async move { portal.authenticate(&identity).await }
            })
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Authentication failed"))?;

        let regions = self
            .retry
            .execute(|identity| {
                let portal = self.portal.clone();
                let session = session.clone();
                async move { portal.enumerate_regions(&session, &identity).await }
            })
            .await?;

        let regions = select_regions(regions, &self.config.regions)?;
        let all = PartitionEnumerator::new(self.config.alphabet.clone())
            .with_catch_all(self.config.catch_all)
            .enumerate(&regions)?;
        let partitions = self.config.instance.select(&all).to_vec();

        Ok(Plan {
            session,
            total_partitions: all.len(),
            partitions,
        })
    }

    /// Run until every assigned partition is complete or abandoned, a fatal
    /// error occurs, or `cancel` fires. The checkpoint is flushed on every
    /// exit path.
    pub async fn run<R: RunReporter + 'static>(
        &self,
        cancel: CancellationToken,
        reporter: Arc<R>,
    ) -> Result<RunSummary, HarvestError> {
        let plan = self.plan().await?;
        let instance = self.config.instance.label();
        reporter.report(RunEvent::Planned {
            instance: &instance,
            total: plan.total_partitions,
            assigned: plan.partitions.len(),
        });

        let sink = RecordSink::open(&self.config.output_dir).await?;
        let store = CheckpointStore::new(self.config.resolved_checkpoint_path());
        let checkpoint = match store.load().await? {
            Some(checkpoint) => {
                if checkpoint.instance != instance {
                    tracing::warn!(
                        saved = %checkpoint.instance,
                        current = %instance,
                        "Checkpoint was written by a different instance slice"
                    );
                }
                reporter.report(RunEvent::Resumed {
                    run_id: &checkpoint.run_id.to_string(),
                    completed: checkpoint.completed.len(),
                    in_flight: checkpoint.in_flight.len(),
                });
                checkpoint
            }
            None => Checkpoint::new(instance.as_str()),
        };

        let dedup = Deduplicator::new();
        let existing = sink.scan_ids().await?;
        dedup.seed(&existing);
        reporter.report(RunEvent::Seeded {
            ids: existing.len(),
        });
        drop(existing);

        let tracker = CheckpointTracker::new(store, checkpoint, self.config.flush_every);
        let mut summary = RunSummary {
            planned: plan.partitions.len(),
            ..RunSummary::default()
        };

        let mut pending = VecDeque::new();
        for partition in plan.partitions {
            if tracker.is_completed(&partition).await {
                summary.skipped += 1;
                reporter.report(RunEvent::Skipped {
                    partition: &partition,
                });
            } else if sink.completed_on_disk(&partition).await {
                // Finished by an earlier run whose checkpoint never saw it.
                tracker.complete(&partition).await?;
                summary.skipped += 1;
                reporter.report(RunEvent::Skipped {
                    partition: &partition,
                });
            } else {
                pending.push_back(partition);
            }
        }

        let walker = PageWalker::new(
            self.portal.clone(),
            plan.session,
            self.retry.clone(),
            self.config.throttle.clone(),
            self.clock.clone(),
            dedup.clone(),
            sink,
            tracker.clone(),
            self.config.page_size,
        );

        let worker_count = self.config.workers.min(pending.len());
        let queue = Arc::new(Mutex::new(pending));
        let run_cancel = cancel.child_token();
        let mut workers = JoinSet::new();

        for worker in 0..worker_count {
            let queue = Arc::clone(&queue);
            let walker = walker.clone();
            let cancel = run_cancel.clone();
            let reporter = Arc::clone(&reporter);
            workers.spawn(async move {
                let mut reports = Vec::new();
                while !cancel.is_cancelled() {
                    let next = queue
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .pop_front();
                    let Some(partition) = next else {
                        break;
                    };

                    reporter.report(RunEvent::PartitionStarted {
                        worker,
                        partition: &partition,
                    });
                    match walker.walk(&partition, &cancel).await {
                        Ok(report) => {
                            reporter.report(RunEvent::PartitionFinished {
                                worker,
                                report: &report,
                            });
                            reports.push(report);
                        }
                        Err(error) => {
                            reporter.report(RunEvent::WorkerFailed {
                                worker,
                                partition: &partition,
                                error: &error,
                            });
                            cancel.cancel();
                            return Err(error);
                        }
                    }
                }
                reporter.report(RunEvent::WorkerStopped { worker });
                Ok(reports)
            });
        }

        let mut failure: Option<HarvestError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(reports)) => reports.iter().for_each(|r| summary.absorb(r)),
                Ok(Err(error)) => {
                    failure.get_or_insert(error);
                }
                Err(join_error) => {
                    run_cancel.cancel();
                    tracing::error!(error = %join_error, "Worker task panicked");
                    failure.get_or_insert(HarvestError::Worker(join_error.to_string()));
                }
            }
        }

        tracker.flush().await?;
        summary.duplicates_suppressed = dedup.suppressed();

        if let Some(error) = failure {
            return Err(error);
        }
        reporter.report(RunEvent::Finished { summary: &summary });
        Ok(summary)
    }
}
