//! Sequential pagination of a single partition.

use std::path::PathBuf;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::checkpoint::CheckpointTracker;
use crate::clock::Clock;
use crate::dedup::Deduplicator;
use crate::error::HarvestError;
use crate::models::{PageRequest, Partition, Record, Session};
use crate::retry::RetryPolicy;
use crate::sink::RecordSink;
use crate::throttle::{PagePacer, ThrottleConfig};
use crate::traits::PortalAdapter;

/// How a walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Exhausted upstream; the output file was promoted to its final name.
    Completed { path: PathBuf },
    /// A page could not be fetched. The partition stays incomplete and the
    /// next run resumes it from `offset`.
    Abandoned { offset: u64, error: String },
    /// Stopped between pages by cancellation.
    Cancelled { offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkReport {
    pub partition: Partition,
    pub outcome: WalkOutcome,
    /// Offset the walk started from (non-zero when resuming).
    pub start_offset: u64,
    pub pages: u64,
    pub emitted: u64,
    pub suppressed: u64,
}

/// Everything a walker shares with the other walkers of its process.
#[derive(Clone)]
pub struct PageWalker<P: PortalAdapter, C: Clock> {
    portal: P,
    session: Session,
    retry: RetryPolicy<C>,
    throttle: ThrottleConfig,
    clock: C,
    dedup: Deduplicator,
    sink: RecordSink,
    tracker: CheckpointTracker,
    page_size: u64,
}

impl<P: PortalAdapter, C: Clock> PageWalker<P, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        portal: P,
        session: Session,
        retry: RetryPolicy<C>,
        throttle: ThrottleConfig,
        clock: C,
        dedup: Deduplicator,
        sink: RecordSink,
        tracker: CheckpointTracker,
        page_size: u64,
    ) -> Self {
        Self {
            portal,
            session,
            retry,
            throttle,
            clock,
            dedup,
            sink,
            tracker,
            page_size,
        }
    }

    /// Walk `partition` from its last checkpointed offset until upstream is
    /// exhausted, a page is abandoned, or `cancel` fires.
    ///
    /// Only fatal errors and local I/O failures are returned as `Err`; an
    /// unfetchable page ends the walk with [`WalkOutcome::Abandoned`].
    pub async fn walk(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<WalkReport, HarvestError> {
        let span = tracing::info_span!("partition", key = %partition.key());
        self.walk_inner(partition, cancel).instrument(span).await
    }

    async fn walk_inner(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<WalkReport, HarvestError> {
        let start_offset = self.tracker.resume_offset(partition).await;
        if start_offset > 0 {
            tracing::info!(offset = start_offset, "Resuming partition");
        }

        let mut report = WalkReport {
            partition: partition.clone(),
            outcome: WalkOutcome::Cancelled {
                offset: start_offset,
            },
            start_offset,
            pages: 0,
            emitted: 0,
            suppressed: 0,
        };
        let mut offset = start_offset;
        let mut writer = self.sink.writer(partition).await?;
        let mut pacer = PagePacer::new(self.throttle.clone(), self.clock.clone());

        loop {
            if cancel.is_cancelled() {
                writer.flush().await?;
                tracing::info!(offset, "Walk cancelled");
                report.outcome = WalkOutcome::Cancelled { offset };
                return Ok(report);
            }

            let request = PageRequest {
                partition: partition.clone(),
                offset,
                page_size: self.page_size,
            };
            let fetch = async {
                pacer.wait().await;
                self.retry
                    .execute(|identity| {
                        let portal = self.portal.clone();
                        let session = self.session.clone();
                        let request = request.clone();
                        async move { portal.fetch_page(&session, &identity, &request).await }
                    })
                    .await
            };

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = fetch => Some(result),
            };
            let page = match result {
                None => continue,
                Some(Ok(page)) => page,
                Some(Err(e)) if e.is_fatal() => {
                    tracing::error!(offset, error = %e, "Fatal error while walking partition");
                    writer.flush().await?;
                    return Err(e);
                }
                Some(Err(e)) => {
                    tracing::error!(
                        offset,
                        error = %e,
                        "Abandoning partition; it will resume from this offset next run"
                    );
                    writer.flush().await?;
                    report.outcome = WalkOutcome::Abandoned {
                        offset,
                        error: e.to_string(),
                    };
                    return Ok(report);
                }
            };

            report.pages += 1;
            let fetched = page.records.len() as u64;
            if fetched == 0 {
                break;
            }

            let extracted_at = Utc::now();
            let mut admitted = 0u64;
            for raw in page.records {
                if self.dedup.admit(&raw.id) {
                    writer
                        .append(&Record::from_raw(raw, partition, extracted_at))
                        .await?;
                    admitted += 1;
                } else {
                    report.suppressed += 1;
                }
            }
            // Lines must be durable before the checkpoint may point past them.
            writer.flush().await?;

            offset += self.page_size;
            report.emitted += admitted;
            self.tracker
                .record_page(partition, offset, fetched, admitted)
                .await?;
            tracing::debug!(offset, fetched, admitted, total = ?page.total, "Page stored");

            if fetched < self.page_size {
                break;
            }
            if page.total.is_some_and(|total| offset >= total) {
                break;
            }
        }

        let path = writer.finish().await?;
        self.tracker.complete(partition).await?;
        tracing::info!(
            pages = report.pages,
            emitted = report.emitted,
            suppressed = report.suppressed,
            file = %path.display(),
            "Partition complete"
        );
        report.outcome = WalkOutcome::Completed { path };
        Ok(report)
    }
}
