//! The reader/writer pipeline and the orchestration that arbitrates between
//! its two stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MigrateError;
use crate::planner::{Block, Plan};
use crate::remote::prompb::LabelMatcher;
use crate::store::{SeriesSink, SeriesSource};

mod reader;
mod writer;

pub use reader::{ReadSummary, Reader};
pub use writer::{WriteSummary, Writer};

/// Mailbox size between reader and writer. Together with the reader
/// reserving its slot before fetching, this keeps at most one populated block
/// waiting for the writer.
pub const HANDOFF_CAPACITY: usize = 1;

const PROGRESS_REFRESH: Duration = Duration::from_millis(200);

/// Message passed from the reader to the writer.
#[derive(Debug)]
pub enum Handoff {
    Block(Block),
    /// The reader finished its sequence (or was force-stopped) cleanly.
    Done,
}

pub fn handoff_channel() -> (mpsc::Sender<Handoff>, mpsc::Receiver<Handoff>) {
    mpsc::channel(HANDOFF_CAPACITY)
}

/// Cooperative request for the reader to stop after its current block.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Number of blocks whose data and checkpoint were both committed.
#[derive(Debug, Clone, Default)]
pub struct BlockCounter(Arc<AtomicU64>);

impl BlockCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reader,
    Writer,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub read: ReadSummary,
    pub write: WriteSummary,
    /// Order in which stage completions were observed.
    pub completion_order: Vec<Stage>,
}

/// Everything needed to drive one run of the pipeline.
pub struct Pipeline<S, K> {
    pub plan: Plan,
    pub source: Arc<S>,
    pub sink: Arc<K>,
    pub selector: Vec<LabelMatcher>,
    pub ctx: CancellationToken,
    pub stop: Option<StopHandle>,
}

impl<S: SeriesSource, K: SeriesSink> Pipeline<S, K> {
    /// Runs reader and writer concurrently until both finish, or until the
    /// first failure, after which the shared context is cancelled and the other
    /// stage is awaited before the failure is returned.
    pub async fn run(self, progress: &ProgressBar) -> Result<PipelineReport, MigrateError> {
        let Pipeline {
            plan,
            source,
            sink,
            selector,
            ctx,
            stop,
        } = self;

        let progress_series = plan.progress_series();
        let (outbox, inbox) = handoff_channel();
        let mut reader = Reader::new(ctx.clone(), source, plan, selector, outbox)?;
        if let Some(stop) = stop {
            reader = reader.with_force_stop(stop);
        }
        let writer = Writer::new(ctx.clone(), sink, progress_series, inbox)?;
        let committed = writer.committed();

        let mut reader_task = reader.run();
        let mut writer_task = writer.run();
        let mut ticker = tokio::time::interval(PROGRESS_REFRESH);
        let mut completion_order = Vec::with_capacity(2);
        let mut read: Option<ReadSummary> = None;

        loop {
            tokio::select! {
                joined = &mut reader_task, if read.is_none() => {
                    match flatten(joined) {
                        Ok(summary) => {
                            debug!(blocks = summary.blocks, "reader finished");
                            completion_order.push(Stage::Reader);
                            read = Some(summary);
                        }
                        Err(err) => {
                            ctx.cancel();
                            let other = flatten(writer_task.await).err();
                            return Err(primary_error(err, other));
                        }
                    }
                }
                joined = &mut writer_task => {
                    let write = match flatten(joined) {
                        Ok(summary) => summary,
                        Err(err) => {
                            ctx.cancel();
                            let other = match read {
                                Some(_) => None,
                                None => flatten(reader_task.await).err(),
                            };
                            return Err(primary_error(err, other));
                        }
                    };
                    // The writer can only finish cleanly after the reader sent
                    // its end-of-stream marker, so the reader is about to resolve.
                    let read = match read {
                        Some(summary) => summary,
                        None => {
                            let summary = flatten(reader_task.await)?;
                            completion_order.push(Stage::Reader);
                            summary
                        }
                    };
                    completion_order.push(Stage::Writer);
                    progress.set_position(committed.get());
                    return Ok(PipelineReport {
                        read,
                        write,
                        completion_order,
                    });
                }
                _ = ticker.tick() => {
                    progress.set_position(committed.get());
                }
            }
        }
    }
}

fn flatten<T>(
    joined: Result<Result<T, MigrateError>, tokio::task::JoinError>,
) -> Result<T, MigrateError> {
    joined.map_err(MigrateError::from).and_then(|result| result)
}

/// Picks the root cause when both stages failed: errors that only report the
/// other side going away yield to the one that caused it.
fn primary_error(first: MigrateError, second: Option<MigrateError>) -> MigrateError {
    let Some(second) = second else {
        return first;
    };
    let secondary = |err: &MigrateError| {
        matches!(
            err,
            MigrateError::Cancelled | MigrateError::UpstreamAborted | MigrateError::DownstreamClosed
        )
    };
    if secondary(&first) && !secondary(&second) {
        warn!(error = %first, "stage failed after its peer");
        second
    } else {
        if !secondary(&second) {
            warn!(error = %second, "both pipeline stages failed");
        }
        first
    }
}

pub(crate) fn spawn_stage<T: Send + 'static>(
    stage: Stage,
    fut: impl std::future::Future<Output = Result<T, MigrateError>> + Send + 'static,
) -> JoinHandle<Result<T, MigrateError>> {
    debug!(?stage, "starting pipeline stage");
    tokio::spawn(fut)
}
