use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tempfile::tempdir;

use historian_sql::{
    Aggregation, HistorianConfig, HistorianQuery, HistorianValues, Record, SqlHistorian,
};

fn ts(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).expect("timestamp")
}

fn meta(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

async fn open(base: &Path) -> SqlHistorian {
    let config = HistorianConfig::default_sqlite("agg.sqlite");
    SqlHistorian::connect(&config, base).await.expect("connect")
}

#[tokio::test]
async fn aggregate_topics_are_stable_across_reinserts() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path()).await;

    historian
        .create_aggregate_store("avg", "1h")
        .await
        .expect("create store");
    // creating the same store twice is fine
    historian
        .create_aggregate_store("avg", "1h")
        .await
        .expect("idempotent create");

    let agg_id = historian
        .insert_agg_topic("device/temp", "avg", "1h")
        .await
        .expect("insert agg topic");
    let again = historian
        .insert_agg_topic("device/temp", "avg", "1h")
        .await
        .expect("reinsert agg topic");
    assert_eq!(agg_id, again);

    historian
        .insert_agg_meta(agg_id, &meta(&[("configured_topics", "device/temp")]))
        .await
        .expect("agg meta");

    let topics = historian
        .query_aggregate_topics()
        .await
        .expect("aggregate topics");
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].name, "device/temp");
    assert_eq!(topics[0].agg_type, "avg");
    assert_eq!(topics[0].agg_period, "1h");
    assert_eq!(
        topics[0].metadata,
        meta(&[("configured_topics", "device/temp")])
    );

    historian
        .update_agg_topic(agg_id, "Device/Temp")
        .await
        .expect("rename");
    let topics = historian
        .query_aggregate_topics()
        .await
        .expect("aggregate topics");
    assert_eq!(topics[0].name, "Device/Temp");
}

#[tokio::test]
async fn collected_aggregates_cover_the_requested_window() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path()).await;

    historian
        .publish_batch(&[
            Record::new(ts(100), "device/temp", json!(1.0)),
            Record::new(ts(200), "device/temp", json!(3.0)),
            Record::new(ts(3_600_000_100), "device/temp", json!(50.0)),
        ])
        .await
        .expect("publish");
    let topic_id = historian.resolve_topic("device/temp").expect("id");

    let (avg, count) = historian
        .collect_aggregate(&[topic_id], Aggregation::Avg, Some(ts(0)), Some(ts(1000)))
        .await
        .expect("avg");
    assert_eq!(avg, 2.0);
    assert_eq!(count, 2);

    let (total, count) = historian
        .collect_aggregate(&[topic_id], Aggregation::Sum, None, None)
        .await
        .expect("sum");
    assert_eq!(total, 54.0);
    assert_eq!(count, 3);

    let (counted, count) = historian
        .collect_aggregate(&[topic_id], Aggregation::Count, Some(ts(0)), Some(ts(1000)))
        .await
        .expect("count");
    assert_eq!(counted, 2.0);
    assert_eq!(count, 2);
}

#[tokio::test]
async fn stored_aggregates_come_back_with_source_topic_metadata() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path()).await;

    historian
        .publish_batch(&[
            Record::new(ts(100), "device/temp", json!(1.0)).with_meta(meta(&[("unit", "C")])),
            Record::new(ts(200), "device/temp", json!(3.0)).with_meta(meta(&[("unit", "C")])),
        ])
        .await
        .expect("publish");
    let topic_id = historian.resolve_topic("device/temp").expect("id");

    historian
        .create_aggregate_store("avg", "1h")
        .await
        .expect("create store");
    let agg_id = historian
        .insert_agg_topic("device/temp", "avg", "1h")
        .await
        .expect("agg topic");
    historian
        .insert_aggregate(agg_id, "avg", "1h", ts(3_600_000_000), 2.0, &[topic_id])
        .await
        .expect("insert aggregate");

    let result = historian
        .query_historian(&HistorianQuery {
            agg_type: Some("AVG".to_string()),
            agg_period: Some("1h".to_string()),
            ..HistorianQuery::topic("device/temp")
        })
        .await
        .expect("aggregate query");
    assert_eq!(result.values(), Some(&[(ts(3_600_000_000), json!(2.0))][..]));
    // single-point aggregate: metadata comes from the underlying raw topic
    assert_eq!(result.metadata(), Some(&meta(&[("unit", "C")])));
}

#[tokio::test]
async fn pattern_wide_aggregates_carry_no_metadata() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path()).await;

    historian
        .create_aggregate_store("sum", "1h")
        .await
        .expect("create store");
    let agg_id = historian
        .insert_agg_topic("plant/all", "sum", "1h")
        .await
        .expect("agg topic");
    historian
        .insert_aggregate(agg_id, "sum", "1h", ts(3_600_000_000), 9.0, &[1, 2, 3])
        .await
        .expect("insert aggregate");

    let result = historian
        .query_historian(&HistorianQuery {
            agg_type: Some("sum".to_string()),
            agg_period: Some("1h".to_string()),
            ..HistorianQuery::topic("plant/all")
        })
        .await
        .expect("aggregate query");
    assert_eq!(result.values(), Some(&[(ts(3_600_000_000), json!(9.0))][..]));
    assert_eq!(result.metadata(), Some(&Map::new()));
}

#[tokio::test]
async fn aggregations_configured_after_startup_resolve_through_a_refresh() {
    let dir = tempdir().expect("tempdir");
    let reader_side = open(dir.path()).await;

    // a second instance configures the aggregation after the first started
    let writer_side = open(dir.path()).await;
    writer_side
        .create_aggregate_store("max", "1d")
        .await
        .expect("create store");
    let agg_id = writer_side
        .insert_agg_topic("device/temp", "max", "1d")
        .await
        .expect("agg topic");
    writer_side
        .insert_aggregate(agg_id, "max", "1d", ts(86_400_000_000), 7.5, &[1])
        .await
        .expect("insert aggregate");
    writer_side.close().await;

    let result = reader_side
        .query_historian(&HistorianQuery {
            agg_type: Some("max".to_string()),
            agg_period: Some("1d".to_string()),
            ..HistorianQuery::topic("device/temp")
        })
        .await
        .expect("aggregate query after refresh");
    assert_eq!(
        result.values(),
        Some(&[(ts(86_400_000_000), json!(7.5))][..])
    );
}

#[tokio::test]
async fn unsupported_aggregation_types_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path()).await;
    assert!(historian.create_aggregate_store("median", "1h").await.is_err());
    assert!(Aggregation::parse("median").is_err());
    assert_eq!(historian.supported_aggregations().len(), 5);
}

#[tokio::test]
async fn unresolved_aggregates_yield_an_empty_result() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path()).await;
    let result = historian
        .query_historian(&HistorianQuery {
            agg_type: Some("avg".to_string()),
            agg_period: Some("1h".to_string()),
            ..HistorianQuery::topic("never/configured")
        })
        .await
        .expect("query must not fail");
    assert_eq!(result, HistorianValues::Empty);
}
