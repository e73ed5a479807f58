use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tempfile::tempdir;

use historian_sql::{
    HistorianConfig, HistorianError, HistorianQuery, HistorianValues, Order, Record, SqlHistorian,
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

async fn open(base: &Path, db_name: &str) -> SqlHistorian {
    let config = HistorianConfig::default_sqlite(db_name);
    SqlHistorian::connect(&config, base).await.expect("connect")
}

#[tokio::test]
async fn first_publish_creates_topic_and_data() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path(), "store.sqlite").await;

    let published = historian
        .publish_batch(&[Record::new(ts(100), "A", json!(1))])
        .await
        .expect("publish");
    assert_eq!(published, 1);
    assert!(historian.resolve_topic("A").is_some());
    assert_eq!(historian.query_topic_list(), vec!["A".to_string()]);

    let result = historian
        .query_historian(&HistorianQuery::topic("A"))
        .await
        .expect("query");
    assert_eq!(result.values(), Some(&[(ts(100), json!(1))][..]));
    assert_eq!(result.metadata(), Some(&Map::new()));
}

#[tokio::test]
async fn case_variants_reuse_one_topic_and_track_last_casing() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path(), "store.sqlite").await;

    historian
        .publish_batch(&[Record::new(ts(100), "Device/Temp", json!(1.0))])
        .await
        .expect("publish");
    let first_id = historian.resolve_topic("Device/Temp").expect("id");

    historian
        .publish_batch(&[
            Record::new(ts(200), "device/temp", json!(2.0)).with_meta(meta(&[("unit", "C")])),
        ])
        .await
        .expect("republish");

    assert_eq!(historian.resolve_topic("DEVICE/TEMP"), Some(first_id));
    assert_eq!(historian.query_topic_list(), vec!["device/temp".to_string()]);

    let result = historian
        .query_historian(&HistorianQuery::topic("DEVICE/TEMP"))
        .await
        .expect("query");
    assert_eq!(
        result.values(),
        Some(&[(ts(100), json!(1.0)), (ts(200), json!(2.0))][..])
    );
    assert_eq!(result.metadata(), Some(&meta(&[("unit", "C")])));

    let metadata = historian.query_topics_metadata(&["device/TEMP".to_string()]);
    assert_eq!(metadata.get("device/TEMP"), Some(&meta(&[("unit", "C")])));
}

#[tokio::test]
async fn order_flag_reverses_results() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path(), "store.sqlite").await;

    historian
        .publish_batch(&[
            Record::new(ts(100), "seq", json!(1)),
            Record::new(ts(200), "seq", json!(2)),
        ])
        .await
        .expect("publish");

    let forward = historian
        .query_historian(&HistorianQuery::topic("seq"))
        .await
        .expect("query");
    assert_eq!(
        forward.values(),
        Some(&[(ts(100), json!(1)), (ts(200), json!(2))][..])
    );

    let backward = historian
        .query_historian(&HistorianQuery {
            order: Order::LastToFirst,
            ..HistorianQuery::topic("seq")
        })
        .await
        .expect("query");
    assert_eq!(
        backward.values(),
        Some(&[(ts(200), json!(2)), (ts(100), json!(1))][..])
    );
}

#[tokio::test]
async fn count_limits_each_topic_independently() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path(), "store.sqlite").await;

    let mut batch = Vec::new();
    for i in 0..3 {
        batch.push(Record::new(ts(100 + i), "a", json!(i)));
        batch.push(Record::new(ts(100 + i), "b", json!(i)));
    }
    historian.publish_batch(&batch).await.expect("publish");

    let result = historian
        .query_historian(&HistorianQuery {
            count: Some(2),
            ..HistorianQuery::topics(["a", "b"])
        })
        .await
        .expect("query");
    assert_eq!(result.topic_values("a").map(<[_]>::len), Some(2));
    assert_eq!(result.topic_values("b").map(<[_]>::len), Some(2));
    // multi-topic results carry no metadata
    assert!(result.metadata().is_none());
}

#[tokio::test]
async fn bounds_are_start_inclusive_end_exclusive() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path(), "store.sqlite").await;

    historian
        .publish_batch(&[
            Record::new(ts(100), "bounded", json!(1)),
            Record::new(ts(200), "bounded", json!(2)),
            Record::new(ts(300), "bounded", json!(3)),
        ])
        .await
        .expect("publish");

    let result = historian
        .query_historian(&HistorianQuery {
            start: Some(ts(100)),
            end: Some(ts(300)),
            ..HistorianQuery::topic("bounded")
        })
        .await
        .expect("query");
    assert_eq!(
        result.values(),
        Some(&[(ts(100), json!(1)), (ts(200), json!(2))][..])
    );

    let skipped = historian
        .query_historian(&HistorianQuery {
            skip: 1,
            ..HistorianQuery::topic("bounded")
        })
        .await
        .expect("query");
    assert_eq!(
        skipped.values(),
        Some(&[(ts(200), json!(2)), (ts(300), json!(3))][..])
    );
}

#[tokio::test]
async fn unknown_topics_yield_an_empty_result() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path(), "store.sqlite").await;

    let result = historian
        .query_historian(&HistorianQuery::topic("never/published"))
        .await
        .expect("query must not fail");
    assert_eq!(result, HistorianValues::Empty);

    // a multi-topic query tolerates individual misses
    historian
        .publish_batch(&[Record::new(ts(100), "known", json!(1))])
        .await
        .expect("publish");
    let result = historian
        .query_historian(&HistorianQuery::topics(["known", "missing"]))
        .await
        .expect("query");
    assert_eq!(result.topic_values("known").map(<[_]>::len), Some(1));
    assert!(result.topic_values("missing").is_none());
}

#[tokio::test]
async fn pattern_queries_match_case_insensitively() {
    let dir = tempdir().expect("tempdir");
    let historian = open(dir.path(), "store.sqlite").await;

    historian
        .publish_batch(&[
            Record::new(ts(100), "Device/Temp", json!(1)),
            Record::new(ts(100), "Device/Humidity", json!(2)),
            Record::new(ts(100), "other", json!(3)),
        ])
        .await
        .expect("publish");

    let matches = historian
        .query_topics_by_pattern("device/%")
        .await
        .expect("pattern query");
    assert_eq!(matches.len(), 2);
    assert_eq!(
        matches.get("device/temp").copied(),
        historian.resolve_topic("Device/Temp")
    );
    assert!(matches.contains_key("device/humidity"));
}

#[tokio::test]
async fn readonly_startup_performs_no_schema_bootstrap() {
    let dir = tempdir().expect("tempdir");
    let mut config = HistorianConfig::default_sqlite("fresh.sqlite");
    config.readonly = Some(true);
    // nothing has created the tables yet, so the catalog load must fail
    let err = SqlHistorian::connect(&config, dir.path())
        .await
        .expect_err("readonly connect against an empty store");
    assert!(matches!(err, HistorianError::Statement { .. }));
}

#[tokio::test]
async fn reopening_loads_the_catalog_from_the_store() {
    let dir = tempdir().expect("tempdir");
    {
        let historian = open(dir.path(), "store.sqlite").await;
        historian
            .publish_batch(&[
                Record::new(ts(100), "Persisted/Topic", json!(1))
                    .with_meta(meta(&[("unit", "kW")])),
            ])
            .await
            .expect("publish");
        historian.close().await;
    }

    let mut config = HistorianConfig::default_sqlite("store.sqlite");
    config.readonly = Some(true);
    let reopened = SqlHistorian::connect(&config, dir.path())
        .await
        .expect("readonly connect");
    assert_eq!(
        reopened.query_topic_list(),
        vec!["Persisted/Topic".to_string()]
    );
    let result = reopened
        .query_historian(&HistorianQuery::topic("persisted/topic"))
        .await
        .expect("query");
    assert_eq!(result.values(), Some(&[(ts(100), json!(1))][..]));
    assert_eq!(result.metadata(), Some(&meta(&[("unit", "kW")])));
}
