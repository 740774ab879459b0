use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{spawn_stage, Handoff, Stage, StopHandle};
use crate::error::MigrateError;
use crate::planner::Plan;
use crate::remote::prompb::LabelMatcher;
use crate::store::SeriesSource;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSummary {
    pub blocks: usize,
    pub samples: usize,
    pub bytes: u64,
    /// The forced-stop signal ended the run before the plan was exhausted.
    pub stopped_early: bool,
}

/// Fetches the plan's blocks from the source, in order, and hands them to
/// the writer.
pub struct Reader<S> {
    ctx: CancellationToken,
    source: Arc<S>,
    plan: Plan,
    selector: Vec<LabelMatcher>,
    outbox: mpsc::Sender<Handoff>,
    force_stop: Option<StopHandle>,
}

impl<S: SeriesSource> Reader<S> {
    pub fn new(
        ctx: CancellationToken,
        source: Arc<S>,
        plan: Plan,
        selector: Vec<LabelMatcher>,
        outbox: mpsc::Sender<Handoff>,
    ) -> Result<Self, MigrateError> {
        if !plan.is_initialized() {
            return Err(MigrateError::InvalidPlan(
                "plan must be initialized before reading".to_string(),
            ));
        }
        if plan.preview(1).is_empty() {
            return Err(MigrateError::InvalidPlan(format!(
                "plan for job '{}' has nothing left to migrate",
                plan.job_name()
            )));
        }
        if selector.is_empty() {
            return Err(MigrateError::Config(
                "reader needs at least one series matcher".to_string(),
            ));
        }
        Ok(Self {
            ctx,
            source,
            plan,
            selector,
            outbox,
            force_stop: None,
        })
    }

    /// Polls `stop` between blocks; once triggered the reader finishes cleanly
    /// after the block it is working on.
    pub fn with_force_stop(mut self, stop: StopHandle) -> Self {
        self.force_stop = Some(stop);
        self
    }

    pub fn run(self) -> JoinHandle<Result<ReadSummary, MigrateError>> {
        spawn_stage(Stage::Reader, self.read_all())
    }

    async fn read_all(mut self) -> Result<ReadSummary, MigrateError> {
        let mut summary = ReadSummary::default();
        loop {
            if self.ctx.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            // Claim the hand-off slot before fetching so a populated block never
            // waits behind another one.
            let permit = reserve(&self.ctx, &self.outbox).await?;
            if self.force_stop.as_ref().is_some_and(StopHandle::is_stopped) {
                info!(
                    job = %self.plan.job_name(),
                    blocks = summary.blocks,
                    "forced stop requested, finishing early"
                );
                summary.stopped_early = true;
                drop(permit);
                break;
            }
            let Some(block) = self.plan.next_block() else {
                drop(permit);
                break;
            };

            let series = self
                .source
                .read(block.mint(), block.maxt(), &self.selector)
                .await
                .map_err(|source| MigrateError::Fetch {
                    index: block.index(),
                    mint: block.mint(),
                    maxt: block.maxt(),
                    source,
                })?;
            let block = block.populated(series);
            self.plan.observe_fetch(&block);

            summary.blocks += 1;
            summary.samples += block.sample_count();
            summary.bytes += block.payload_bytes();
            debug!(
                block = block.index(),
                mint = block.mint(),
                maxt = block.maxt(),
                series = block.series().len(),
                samples = block.sample_count(),
                "fetched block"
            );
            permit.send(Handoff::Block(block));
        }

        reserve(&self.ctx, &self.outbox).await?.send(Handoff::Done);
        debug!(blocks = summary.blocks, "reader sent end of stream");
        Ok(summary)
    }
}

async fn reserve<'a>(
    ctx: &CancellationToken,
    outbox: &'a mpsc::Sender<Handoff>,
) -> Result<mpsc::Permit<'a, Handoff>, MigrateError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(MigrateError::Cancelled),
        permit = outbox.reserve() => permit.map_err(|_| MigrateError::DownstreamClosed),
    }
}
