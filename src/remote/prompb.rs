//! Prometheus remote read/write protocol messages.
//!
//! Only the fields this tool sends or consumes are declared; prost skips
//! unknown fields (exemplars, native histograms, read hints) on decode.

use prost::Message;

use crate::error::StoreError;

pub const LABEL_METRIC_NAME: &str = "__name__";
pub const LABEL_JOB: &str = "job";

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[cfg(test)]
impl TimeSeries {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_str())
    }

    /// Canonical identity of the series: its label set sorted by name.
    pub fn series_key(&self) -> Vec<Label> {
        let mut labels = self.labels.clone();
        labels.sort();
        labels
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MatchType {
    Eq = 0,
    Neq = 1,
    Re = 2,
    Nre = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct LabelMatcher {
    #[prost(enumeration = "MatchType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

impl LabelMatcher {
    pub fn new(kind: MatchType, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            r#type: kind as i32,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn kind(&self) -> MatchType {
        MatchType::try_from(self.r#type).unwrap_or(MatchType::Eq)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Query {
    #[prost(int64, tag = "1")]
    pub start_timestamp_ms: i64,
    #[prost(int64, tag = "2")]
    pub end_timestamp_ms: i64,
    #[prost(message, repeated, tag = "3")]
    pub matchers: Vec<LabelMatcher>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseType {
    Samples = 0,
    StreamedXorChunks = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadRequest {
    #[prost(message, repeated, tag = "1")]
    pub queries: Vec<Query>,
    #[prost(enumeration = "ResponseType", repeated, tag = "2")]
    pub accepted_response_types: Vec<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryResult {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadResponse {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<QueryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// Protobuf-encode and snappy-block-compress a message, as both remote
/// protocols expect on the wire.
pub fn encode_snappy<M: Message>(message: &M) -> Result<Vec<u8>, StoreError> {
    let raw = message.encode_to_vec();
    Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
}

pub fn decode_snappy<M: Message + Default>(body: &[u8]) -> Result<M, StoreError> {
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(M::decode(raw.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_survives_snappy_framing() {
        let request = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![Label::new(LABEL_METRIC_NAME, "up"), Label::new("job", "node")],
                samples: vec![
                    Sample {
                        value: 1.0,
                        timestamp: 1_000,
                    },
                    Sample {
                        value: 0.0,
                        timestamp: 2_000,
                    },
                ],
            }],
        };

        let body = encode_snappy(&request).unwrap();
        let decoded: WriteRequest = decode_snappy(&body).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn uncompressed_body_is_rejected() {
        let raw = WriteRequest::default().encode_to_vec();
        let garbage = [raw.as_slice(), b"\xff\xff\xff\xff\xff"].concat();
        let err = decode_snappy::<WriteRequest>(&garbage).unwrap_err();
        assert!(matches!(err, StoreError::Snappy(_) | StoreError::Decode(_)));
    }

    #[test]
    fn series_key_ignores_label_order() {
        let a = TimeSeries {
            labels: vec![Label::new("job", "node"), Label::new(LABEL_METRIC_NAME, "up")],
            samples: vec![],
        };
        let b = TimeSeries {
            labels: vec![Label::new(LABEL_METRIC_NAME, "up"), Label::new("job", "node")],
            samples: vec![],
        };
        assert_eq!(a.series_key(), b.series_key());
        assert_eq!(a.label("job"), Some("node"));
        assert_eq!(a.label("instance"), None);
    }

    #[test]
    fn matcher_kind_round_trips_through_i32() {
        let matcher = LabelMatcher::new(MatchType::Nre, "job", "test.*");
        assert_eq!(matcher.kind(), MatchType::Nre);
    }
}
