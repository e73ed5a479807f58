pub mod error;
pub mod types;

pub use error::{HistorianError, HistorianResult};
pub use types::{
    topic_key, AggTopicKey, AggregateTopic, Aggregation, HistorianQuery, HistorianValues, Order,
    Record, Sample, TopicMeta,
};
