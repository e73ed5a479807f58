use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::error::{HistorianError, HistorianResult};

/// Metadata attached to a topic. Compared structurally on every publish to
/// decide whether a metadata write is needed.
pub type TopicMeta = serde_json::Map<String, Value>;

/// One timestamped sample as returned by range queries.
pub type Sample = (DateTime<Utc>, Value);

/// Case-insensitive lookup key for a topic name. All display-case variants of
/// a name normalize to the same key.
pub fn topic_key(name: &str) -> String {
    name.nfc().collect::<String>().to_lowercase()
}

/// One record of a publish batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub value: Value,
    #[serde(default)]
    pub meta: TopicMeta,
}

impl Record {
    pub fn new(timestamp: DateTime<Utc>, topic: impl Into<String>, value: Value) -> Self {
        Self {
            timestamp,
            topic: topic.into(),
            value,
            meta: TopicMeta::new(),
        }
    }

    pub fn with_meta(mut self, meta: TopicMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// Direction of range-query results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    #[default]
    #[serde(rename = "FIRST_TO_LAST")]
    FirstToLast,
    #[serde(rename = "LAST_TO_FIRST")]
    LastToFirst,
}

/// Aggregations the store can compute server-side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Avg,
    Sum,
    Count,
    Min,
    Max,
}

impl Aggregation {
    pub const ALL: &'static [Aggregation] = &[
        Aggregation::Avg,
        Aggregation::Sum,
        Aggregation::Count,
        Aggregation::Min,
        Aggregation::Max,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Avg => "avg",
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }

    pub fn parse(name: &str) -> HistorianResult<Self> {
        match name.to_lowercase().as_str() {
            "avg" => Ok(Aggregation::Avg),
            "sum" => Ok(Aggregation::Sum),
            "count" => Ok(Aggregation::Count),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            other => Err(HistorianError::invalid(format!(
                "unsupported aggregation type: {other}"
            ))),
        }
    }
}

/// Identity of an aggregate topic: name (or pattern), aggregation type and
/// aggregation period. The triple is unique.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggTopicKey {
    pub name_key: String,
    pub agg_type: String,
    pub agg_period: String,
}

impl AggTopicKey {
    pub fn new(name: &str, agg_type: &str, agg_period: &str) -> Self {
        Self {
            name_key: topic_key(name),
            agg_type: agg_type.to_lowercase(),
            agg_period: agg_period.to_string(),
        }
    }
}

/// One configured aggregate topic, with the metadata that records its source
/// topics or topic pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateTopic {
    pub name: String,
    pub agg_type: String,
    pub agg_period: String,
    #[serde(default)]
    pub metadata: TopicMeta,
}

/// Parameters of one historian query.
#[derive(Clone, Debug, Default)]
pub struct HistorianQuery {
    pub topics: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub agg_type: Option<String>,
    pub agg_period: Option<String>,
    pub skip: u64,
    pub count: Option<u64>,
    pub order: Order,
}

impl HistorianQuery {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            topics: vec![name.into()],
            ..Self::default()
        }
    }

    pub fn topics<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Result of a historian query. Metadata is attached only when the query
/// targeted a single topic.
#[derive(Clone, Debug, PartialEq)]
pub enum HistorianValues {
    Empty,
    Single {
        values: Vec<Sample>,
        metadata: TopicMeta,
    },
    Multi(HashMap<String, Vec<Sample>>),
}

impl HistorianValues {
    pub fn is_empty(&self) -> bool {
        matches!(self, HistorianValues::Empty)
    }

    /// Values of a single-topic result.
    pub fn values(&self) -> Option<&[Sample]> {
        match self {
            HistorianValues::Single { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Metadata of a single-topic result.
    pub fn metadata(&self) -> Option<&TopicMeta> {
        match self {
            HistorianValues::Single { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    /// Per-topic values of a multi-topic result.
    pub fn topic_values(&self, topic: &str) -> Option<&[Sample]> {
        match self {
            HistorianValues::Multi(map) => map.get(topic).map(Vec::as_slice),
            _ => None,
        }
    }
}
