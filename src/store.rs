//! Narrow contracts between the migration pipeline and the endpoints it
//! talks to, plus their implementations over the remote protocol clients.

use std::future::Future;

use crate::error::StoreError;
use crate::remote::prompb::{
    Label, LabelMatcher, MatchType, Sample, TimeSeries, LABEL_JOB, LABEL_METRIC_NAME,
};
use crate::remote::RemoteClient;

#[cfg(test)]
pub mod memory;

/// Range-query side of a migration.
pub trait SeriesSource: Send + Sync + 'static {
    /// Series with their samples in the half-open range `[mint, maxt)`.
    fn read(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[LabelMatcher],
    ) -> impl Future<Output = Result<Vec<TimeSeries>, StoreError>> + Send;
}

/// Ingestion side of a migration.
pub trait SeriesSink: Send + Sync + 'static {
    fn write(
        &self,
        series: Vec<TimeSeries>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Read access to previously committed checkpoint samples.
pub trait CheckpointReader: Send + Sync {
    /// Newest checkpoint of `progress` with a timestamp in `[mint, maxt]`.
    fn last_checkpoint(
        &self,
        progress: &ProgressSeries,
        mint: i64,
        maxt: i64,
    ) -> impl Future<Output = Result<Option<Checkpoint>, StoreError>> + Send;
}

/// Identity of the series holding a job's checkpoint samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSeries {
    pub metric_name: String,
    pub job: String,
}

impl ProgressSeries {
    pub fn new(metric_name: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            job: job.into(),
        }
    }

    pub fn labels(&self) -> Vec<Label> {
        vec![
            Label::new(LABEL_METRIC_NAME, self.metric_name.as_str()),
            Label::new(LABEL_JOB, self.job.as_str()),
        ]
    }

    pub fn matchers(&self) -> Vec<LabelMatcher> {
        vec![
            LabelMatcher::new(MatchType::Eq, LABEL_METRIC_NAME, self.metric_name.as_str()),
            LabelMatcher::new(MatchType::Eq, LABEL_JOB, self.job.as_str()),
        ]
    }

    /// The single-sample series recording that `[mint, maxt)` was committed.
    pub fn checkpoint_series(&self, mint: i64, maxt: i64) -> TimeSeries {
        TimeSeries {
            labels: self.labels(),
            samples: vec![Sample {
                value: mint as f64,
                timestamp: maxt,
            }],
        }
    }
}

/// A committed checkpoint sample read back from the destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    /// End (exclusive) of the last committed block; the resume point.
    pub timestamp: i64,
    /// Start of the last committed block.
    pub value: f64,
}

impl Checkpoint {
    pub fn block_mint(&self) -> i64 {
        self.value as i64
    }
}

/// Stand-in used when progress tracking is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoints;

impl CheckpointReader for NoCheckpoints {
    async fn last_checkpoint(
        &self,
        _progress: &ProgressSeries,
        _mint: i64,
        _maxt: i64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(None)
    }
}

impl SeriesSource for RemoteClient {
    async fn read(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<TimeSeries>, StoreError> {
        let series = RemoteClient::read(self, mint, maxt - 1, matchers).await?;
        Ok(clamp_to_range(series, mint, maxt))
    }
}

impl SeriesSink for RemoteClient {
    async fn write(&self, series: Vec<TimeSeries>) -> Result<(), StoreError> {
        RemoteClient::write(self, series).await
    }
}

impl CheckpointReader for RemoteClient {
    async fn last_checkpoint(
        &self,
        progress: &ProgressSeries,
        mint: i64,
        maxt: i64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let series = RemoteClient::read(self, mint, maxt, &progress.matchers()).await?;
        Ok(newest_checkpoint(&series))
    }
}

/// Drops samples outside `[mint, maxt)` and series left without samples.
pub fn clamp_to_range(series: Vec<TimeSeries>, mint: i64, maxt: i64) -> Vec<TimeSeries> {
    series
        .into_iter()
        .filter_map(|mut ts| {
            ts.samples
                .retain(|sample| sample.timestamp >= mint && sample.timestamp < maxt);
            (!ts.samples.is_empty()).then_some(ts)
        })
        .collect()
}

pub fn newest_checkpoint(series: &[TimeSeries]) -> Option<Checkpoint> {
    series
        .iter()
        .flat_map(|ts| ts.samples.iter())
        .max_by_key(|sample| sample.timestamp)
        .map(|sample| Checkpoint {
            timestamp: sample.timestamp,
            value: sample.value,
        })
}
