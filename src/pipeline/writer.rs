use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{spawn_stage, BlockCounter, Handoff, Stage};
use crate::error::MigrateError;
use crate::planner::Block;
use crate::store::{ProgressSeries, SeriesSink};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub blocks: u64,
    pub samples: usize,
    pub checkpoints: u64,
    /// End of the last committed block.
    pub committed_until: Option<i64>,
}

/// Pushes populated blocks to the destination, appending a checkpoint sample
/// to each write when progress tracking is enabled.
pub struct Writer<K> {
    ctx: CancellationToken,
    sink: Arc<K>,
    progress: Option<ProgressSeries>,
    inbox: mpsc::Receiver<Handoff>,
    committed: BlockCounter,
}

impl<K: SeriesSink> Writer<K> {
    pub fn new(
        ctx: CancellationToken,
        sink: Arc<K>,
        progress: Option<ProgressSeries>,
        inbox: mpsc::Receiver<Handoff>,
    ) -> Result<Self, MigrateError> {
        if let Some(progress) = &progress {
            if progress.metric_name.trim().is_empty() {
                return Err(MigrateError::Config(
                    "progress metric name must not be empty".to_string(),
                ));
            }
            if progress.job.trim().is_empty() {
                return Err(MigrateError::Config(
                    "progress job name must not be empty".to_string(),
                ));
            }
        }
        Ok(Self {
            ctx,
            sink,
            progress,
            inbox,
            committed: BlockCounter::default(),
        })
    }

    /// Live view of the committed-block count, readable while the writer runs.
    pub fn committed(&self) -> BlockCounter {
        self.committed.clone()
    }

    pub fn run(self) -> JoinHandle<Result<WriteSummary, MigrateError>> {
        spawn_stage(Stage::Writer, self.write_all())
    }

    async fn write_all(mut self) -> Result<WriteSummary, MigrateError> {
        let mut summary = WriteSummary::default();
        loop {
            let message = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return Err(MigrateError::Cancelled),
                message = self.inbox.recv() => message,
            };
            match message {
                Some(Handoff::Block(block)) => self.commit(block, &mut summary).await?,
                Some(Handoff::Done) => {
                    info!(
                        blocks = summary.blocks,
                        samples = summary.samples,
                        "writer drained all blocks"
                    );
                    return Ok(summary);
                }
                None => return Err(MigrateError::UpstreamAborted),
            }
        }
    }

    async fn commit(&self, block: Block, summary: &mut WriteSummary) -> Result<(), MigrateError> {
        let (index, mint, maxt) = (block.index(), block.mint(), block.maxt());
        let samples = block.sample_count();
        let mut series = block.into_series();
        if let Some(progress) = &self.progress {
            // Same request as the data: both land or neither does.
            series.push(progress.checkpoint_series(mint, maxt));
        }

        if !series.is_empty() {
            self.sink
                .write(series)
                .await
                .map_err(|source| MigrateError::Write {
                    index,
                    mint,
                    maxt,
                    source,
                })?;
        }

        self.committed.increment();
        summary.blocks += 1;
        summary.samples += samples;
        if self.progress.is_some() {
            summary.checkpoints += 1;
        }
        summary.committed_until = Some(maxt);
        debug!(block = index, mint, maxt, samples, "committed block");
        Ok(())
    }
}
