//! Partitioning of a migration range into blocks, and resume-point discovery
//! from the checkpoint samples the writer leaves in the destination.

use std::time::Duration;

use prost::Message;
use tracing::{debug, info};

use crate::error::MigrateError;
use crate::remote::prompb::TimeSeries;
use crate::store::{Checkpoint, CheckpointReader, ProgressSeries};

pub const DEFAULT_BLOCK_SPAN: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PROGRESS_METRIC: &str = "prom_migrator_progress";

/// How the planner chooses the time span of the next block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSizing {
    Fixed {
        span: Duration,
    },
    /// Starts at `initial`; halves after a block whose payload exceeded
    /// `target_bytes` and doubles after one below half of it.
    Adaptive {
        initial: Duration,
        min: Duration,
        max: Duration,
        target_bytes: u64,
    },
}

impl Default for BlockSizing {
    fn default() -> Self {
        BlockSizing::Fixed {
            span: DEFAULT_BLOCK_SPAN,
        }
    }
}

impl BlockSizing {
    fn validate(&self) -> Result<(), MigrateError> {
        match self {
            BlockSizing::Fixed { span } => {
                if duration_ms(*span) <= 0 {
                    return Err(MigrateError::InvalidPlan(
                        "block duration must be at least 1ms".to_string(),
                    ));
                }
            }
            BlockSizing::Adaptive {
                initial,
                min,
                max,
                target_bytes,
            } => {
                if duration_ms(*min) <= 0 {
                    return Err(MigrateError::InvalidPlan(
                        "minimum block duration must be at least 1ms".to_string(),
                    ));
                }
                if min > max || initial < min || initial > max {
                    return Err(MigrateError::InvalidPlan(format!(
                        "adaptive block durations must satisfy min <= initial <= max (got {min:?} <= {initial:?} <= {max:?})"
                    )));
                }
                if *target_bytes == 0 {
                    return Err(MigrateError::InvalidPlan(
                        "target block size must be greater than zero".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn initial_span_ms(&self) -> i64 {
        match self {
            BlockSizing::Fixed { span } => duration_ms(*span),
            BlockSizing::Adaptive { initial, .. } => duration_ms(*initial),
        }
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// One unit of migration work over `[mint, maxt)`.
///
/// Created empty by the planner; the reader attaches the fetched series with
/// [`Block::populated`] before handing it off.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    index: usize,
    mint: i64,
    maxt: i64,
    series: Vec<TimeSeries>,
}

impl Block {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mint(&self) -> i64 {
        self.mint
    }

    pub fn maxt(&self) -> i64 {
        self.maxt
    }

    pub fn series(&self) -> &[TimeSeries] {
        &self.series
    }

    pub fn into_series(self) -> Vec<TimeSeries> {
        self.series
    }

    pub fn populated(mut self, series: Vec<TimeSeries>) -> Self {
        self.series = series;
        self
    }

    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|ts| ts.samples.len()).sum()
    }

    /// Encoded protobuf size of the payload, before compression.
    pub fn payload_bytes(&self) -> u64 {
        self.series.iter().map(|ts| ts.encoded_len() as u64).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressConfig {
    pub enabled: bool,
    pub metric_name: String,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metric_name: DEFAULT_PROGRESS_METRIC.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConfig {
    /// Identity correlating runs of the same migration across restarts.
    pub job_name: String,
    pub mint: i64,
    pub maxt: i64,
    pub progress: ProgressConfig,
    pub sizing: BlockSizing,
    /// Plan and report only; no data is moved.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
struct PlanState {
    effective_mint: i64,
    cursor: i64,
    next_index: usize,
    span_ms: i64,
    resumed_from: Option<Checkpoint>,
}

/// A migration task definition together with its block cursor.
#[derive(Debug, Clone)]
pub struct Plan {
    config: PlanConfig,
    state: Option<PlanState>,
}

impl Plan {
    pub fn new(config: PlanConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    pub fn job_name(&self) -> &str {
        &self.config.job_name
    }

    pub fn progress_series(&self) -> Option<ProgressSeries> {
        self.config.progress.enabled.then(|| {
            ProgressSeries::new(
                self.config.progress.metric_name.as_str(),
                self.config.job_name.as_str(),
            )
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn effective_mint(&self) -> Option<i64> {
        self.state.as_ref().map(|state| state.effective_mint)
    }

    pub fn resumed_from(&self) -> Option<&Checkpoint> {
        self.state.as_ref().and_then(|state| state.resumed_from.as_ref())
    }

    /// Computes the resume point and resets the block cursor.
    ///
    /// Returns `Ok(false)` when the whole range is already migrated. Every call
    /// starts over from the checkpoints, so it is safe to call again after a
    /// halted or failed run.
    pub async fn init<C: CheckpointReader>(&mut self, checkpoints: &C) -> Result<bool, MigrateError> {
        self.state = None;
        self.validate()?;

        let PlanConfig { mint, maxt, .. } = self.config;
        let mut effective_mint = mint;
        let mut resumed_from = None;
        if let Some(progress) = self.progress_series() {
            let found = checkpoints
                .last_checkpoint(&progress, mint, maxt)
                .await
                .map_err(|source| MigrateError::Progress {
                    job: self.config.job_name.clone(),
                    source,
                })?;
            match found {
                Some(checkpoint) if checkpoint.timestamp > mint => {
                    effective_mint = checkpoint.timestamp.min(maxt);
                    resumed_from = Some(checkpoint);
                    info!(
                        job = %self.config.job_name,
                        resume_from = effective_mint,
                        requested_mint = mint,
                        "resuming migration from checkpoint"
                    );
                }
                Some(_) | None => {
                    debug!(job = %self.config.job_name, "no usable checkpoint, starting at requested mint");
                }
            }
        }

        self.state = Some(PlanState {
            effective_mint,
            cursor: effective_mint,
            next_index: 0,
            span_ms: self.config.sizing.initial_span_ms(),
            resumed_from,
        });

        let proceed = effective_mint < maxt;
        if proceed {
            debug!(
                job = %self.config.job_name,
                mint = effective_mint,
                maxt,
                pending_blocks = ?self.pending_blocks(),
                "plan initialized"
            );
        } else {
            info!(job = %self.config.job_name, "nothing left to migrate");
        }
        Ok(proceed)
    }

    fn validate(&self) -> Result<(), MigrateError> {
        let config = &self.config;
        if config.job_name.trim().is_empty() {
            return Err(MigrateError::InvalidPlan(
                "migration job name must not be empty".to_string(),
            ));
        }
        if config.mint >= config.maxt {
            return Err(MigrateError::InvalidPlan(format!(
                "start ({}) must be before end ({})",
                config.mint, config.maxt
            )));
        }
        if config.progress.enabled && config.progress.metric_name.trim().is_empty() {
            return Err(MigrateError::InvalidPlan(
                "progress metric name must not be empty when progress tracking is enabled"
                    .to_string(),
            ));
        }
        config.sizing.validate()
    }

    /// Cuts the next block, or `None` once the range is exhausted or the plan
    /// was never initialized.
    pub fn next_block(&mut self) -> Option<Block> {
        let maxt = self.config.maxt;
        let state = self.state.as_mut()?;
        if state.cursor >= maxt {
            return None;
        }
        let block_maxt = state.cursor.saturating_add(state.span_ms).min(maxt);
        let block = Block {
            index: state.next_index,
            mint: state.cursor,
            maxt: block_maxt,
            series: Vec::new(),
        };
        state.cursor = block_maxt;
        state.next_index += 1;
        Some(block)
    }

    /// Feeds a fetched block's payload size back into adaptive sizing.
    pub fn observe_fetch(&mut self, block: &Block) {
        let BlockSizing::Adaptive {
            min,
            max,
            target_bytes,
            ..
        } = self.config.sizing
        else {
            return;
        };
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let bytes = block.payload_bytes();
        let previous = state.span_ms;
        if bytes > target_bytes {
            state.span_ms = (state.span_ms / 2).max(duration_ms(min));
        } else if bytes.saturating_mul(2) < target_bytes {
            state.span_ms = state.span_ms.saturating_mul(2).min(duration_ms(max));
        }
        if state.span_ms != previous {
            debug!(
                block = block.index(),
                bytes,
                previous_span_ms = previous,
                span_ms = state.span_ms,
                "adjusted block span"
            );
        }
    }

    /// Number of blocks left to cut. Only known up front for fixed sizing.
    pub fn pending_blocks(&self) -> Option<usize> {
        let state = self.state.as_ref()?;
        match self.config.sizing {
            BlockSizing::Fixed { .. } => {
                // Widened so ranges spanning most of i64 cannot overflow.
                let remaining = (i128::from(self.config.maxt) - i128::from(state.cursor)).max(0);
                let span = i128::from(state.span_ms);
                let blocks = remaining / span + i128::from(remaining % span != 0);
                Some(usize::try_from(blocks).unwrap_or(usize::MAX))
            }
            BlockSizing::Adaptive { .. } => None,
        }
    }

    /// The first `limit` block ranges as they would be cut right now, without
    /// advancing the plan. Adaptive plans assume no size feedback.
    pub fn preview(&self, limit: usize) -> Vec<(i64, i64)> {
        let mut scratch = self.clone();
        std::iter::from_fn(|| scratch.next_block())
            .take(limit)
            .map(|block| (block.mint(), block.maxt()))
            .collect()
    }
}
