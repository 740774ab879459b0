//! In-process time-series store used by the pipeline tests. It behaves like
//! a TSDB: samples are keyed by label set and timestamp, so rewriting a
//! sample is idempotent, while raw ingestion counters expose duplicates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use tokio::sync::Semaphore;

use super::{newest_checkpoint, CheckpointReader, Checkpoint, ProgressSeries, SeriesSink, SeriesSource};
use crate::error::StoreError;
use crate::remote::prompb::{Label, LabelMatcher, MatchType, Sample, TimeSeries, LABEL_METRIC_NAME};

type SeriesMap = BTreeMap<Vec<Label>, BTreeMap<i64, f64>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    series: Mutex<SeriesMap>,
    fail_read_at: Option<usize>,
    fail_write_at: Option<usize>,
    fail_readback: bool,
    write_gate: Option<Arc<Semaphore>>,
    reads: AtomicUsize,
    reads_completed: AtomicUsize,
    writes: AtomicUsize,
    ingested_samples: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(series: Vec<TimeSeries>) -> Self {
        let store = Self::default();
        {
            let mut map = store.lock();
            for ts in series {
                insert(&mut map, ts);
            }
        }
        store
    }

    /// Fail the read call with this zero-based ordinal.
    pub fn failing_read_at(mut self, ordinal: usize) -> Self {
        self.fail_read_at = Some(ordinal);
        self
    }

    /// Fail the write call with this zero-based ordinal.
    pub fn failing_write_at(mut self, ordinal: usize) -> Self {
        self.fail_write_at = Some(ordinal);
        self
    }

    pub fn failing_readback(mut self) -> Self {
        self.fail_readback = true;
        self
    }

    /// Every write waits for a permit from `gate` before committing.
    pub fn gated_writes(mut self, gate: Arc<Semaphore>) -> Self {
        self.write_gate = Some(gate);
        self
    }

    pub fn series_count(&self) -> usize {
        self.lock().len()
    }

    pub fn sample_count(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    /// `(timestamp, value)` of every sample stored for a metric.
    pub fn samples_of(&self, metric: &str) -> Vec<(i64, f64)> {
        self.lock()
            .iter()
            .filter(|(labels, _)| {
                labels
                    .iter()
                    .any(|label| label.name == LABEL_METRIC_NAME && label.value == metric)
            })
            .flat_map(|(_, samples)| samples.iter().map(|(&ts, &value)| (ts, value)))
            .collect()
    }

    pub fn reads_completed(&self) -> usize {
        self.reads_completed.load(Ordering::SeqCst)
    }

    pub fn writes_started(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Samples received across all writes, duplicates included.
    pub fn ingested_samples(&self) -> usize {
        self.ingested_samples.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, SeriesMap> {
        match self.series.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn select(&self, mint: i64, maxt_inclusive: i64, matchers: &[LabelMatcher]) -> Vec<TimeSeries> {
        if mint > maxt_inclusive {
            return Vec::new();
        }
        let compiled: Vec<(&LabelMatcher, Option<Regex>)> = matchers
            .iter()
            .map(|m| {
                let regex = matches!(m.kind(), MatchType::Re | MatchType::Nre)
                    .then(|| Regex::new(&format!("^(?:{})$", m.value)).ok())
                    .flatten();
                (m, regex)
            })
            .collect();

        self.lock()
            .iter()
            .filter(|(labels, _)| compiled.iter().all(|(m, re)| label_matches(labels, m, re.as_ref())))
            .filter_map(|(labels, samples)| {
                let samples: Vec<Sample> = samples
                    .range(mint..=maxt_inclusive)
                    .map(|(&timestamp, &value)| Sample { value, timestamp })
                    .collect();
                (!samples.is_empty()).then(|| TimeSeries {
                    labels: labels.clone(),
                    samples,
                })
            })
            .collect()
    }
}

impl SeriesSource for MemoryStore {
    async fn read(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<TimeSeries>, StoreError> {
        let ordinal = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_read_at == Some(ordinal) {
            return Err(StoreError::Other(format!("injected read failure #{ordinal}")));
        }
        let series = self.select(mint, maxt - 1, matchers);
        self.reads_completed.fetch_add(1, Ordering::SeqCst);
        Ok(series)
    }
}

impl SeriesSink for MemoryStore {
    async fn write(&self, series: Vec<TimeSeries>) -> Result<(), StoreError> {
        let ordinal = self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.write_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| StoreError::Other("write gate closed".to_string()))?;
            permit.forget();
        }
        if self.fail_write_at == Some(ordinal) {
            return Err(StoreError::Other(format!("injected write failure #{ordinal}")));
        }
        let mut map = self.lock();
        for ts in series {
            self.ingested_samples
                .fetch_add(ts.samples.len(), Ordering::SeqCst);
            insert(&mut map, ts);
        }
        Ok(())
    }
}

impl CheckpointReader for MemoryStore {
    async fn last_checkpoint(
        &self,
        progress: &ProgressSeries,
        mint: i64,
        maxt: i64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        if self.fail_readback {
            return Err(StoreError::Other("readback unavailable".to_string()));
        }
        Ok(newest_checkpoint(&self.select(mint, maxt, &progress.matchers())))
    }
}

fn insert(map: &mut SeriesMap, ts: TimeSeries) {
    let key = ts.series_key();
    let entry = map.entry(key).or_default();
    for sample in ts.samples {
        entry.insert(sample.timestamp, sample.value);
    }
}

fn label_matches(labels: &[Label], matcher: &LabelMatcher, regex: Option<&Regex>) -> bool {
    let value = labels
        .iter()
        .find(|label| label.name == matcher.name)
        .map(|label| label.value.as_str())
        .unwrap_or("");
    match matcher.kind() {
        MatchType::Eq => value == matcher.value,
        MatchType::Neq => value != matcher.value,
        MatchType::Re => regex.is_some_and(|re| re.is_match(value)),
        MatchType::Nre => regex.is_some_and(|re| !re.is_match(value)),
    }
}
