use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{
    Alias, ColumnDef, Expr, ExprTrait, Func, Iden, Index, InsertStatement, MysqlQueryBuilder,
    OnConflict, Order as SeaOrder, PostgresQueryBuilder, Query, QueryStatementWriter,
    SchemaStatementBuilder, SimpleExpr, SqliteQueryBuilder, Table,
};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseTransaction, QueryResult, Statement,
};
use serde_json::Value;

use historian_core::types::{
    topic_key, AggTopicKey, AggregateTopic, Aggregation, Order, Sample, TopicMeta,
};
use historian_core::{HistorianError, HistorianResult};

use crate::db::{
    AggDataColumn, AggMetaColumn, AggTopicsColumn, DataColumn, MetaColumn, TableNames, TopicsColumn,
};

/// Parameters of one range retrieval against the data table or one of the
/// per-period aggregate tables.
#[derive(Clone, Debug, Default)]
pub struct RangeRequest {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// `(agg_type, agg_period)` when reading stored aggregates.
    pub aggregate: Option<(String, String)>,
    pub skip: u64,
    pub count: Option<u64>,
    pub order: Order,
}

/// Data half of the bulk-insert channel. The default implementation executes
/// one statement per record; a backend may substitute a multi-row loader
/// that buffers rows and writes them in [`DataInserter::finish`]. Every
/// statement runs on the batch transaction either way.
#[async_trait]
pub trait DataInserter: Send {
    async fn insert(
        &mut self,
        tx: &DatabaseTransaction,
        ts: DateTime<Utc>,
        topic_id: i64,
        value: &Value,
    ) -> HistorianResult<bool>;

    async fn finish(&mut self, tx: &DatabaseTransaction) -> HistorianResult<()> {
        let _ = tx;
        Ok(())
    }
}

/// Metadata half of the bulk-insert channel.
#[async_trait]
pub trait MetaInserter: Send {
    async fn insert(
        &mut self,
        tx: &DatabaseTransaction,
        topic_id: i64,
        meta: &TopicMeta,
    ) -> HistorianResult<bool>;

    async fn finish(&mut self, tx: &DatabaseTransaction) -> HistorianResult<()> {
        let _ = tx;
        Ok(())
    }
}

/// Contract every concrete SQL dialect satisfies. The publish pipeline and
/// the query engine depend only on this trait; statement text is produced by
/// the implementation.
///
/// All operations execute on the calling context's transaction so a publish
/// batch stays atomic and reads release their cursor when done.
#[async_trait]
pub trait HistorianBackend: Send + Sync + 'static {
    fn tables(&self) -> &TableNames;

    /// Topics and metadata share one physical table.
    fn colocated(&self) -> bool {
        self.tables().colocated()
    }

    /// Aggregations the store can compute server-side.
    fn aggregations(&self) -> &'static [Aggregation] {
        Aggregation::ALL
    }

    /// Idempotent creation of the topics/metadata/data tables.
    async fn setup_historian_tables(&self, tx: &DatabaseTransaction) -> HistorianResult<()>;

    /// Idempotent creation of the aggregate-topic catalog tables.
    async fn setup_aggregate_tables(&self, tx: &DatabaseTransaction) -> HistorianResult<()>;

    /// Full topic catalog: `name_key -> id` and `name_key -> display name`.
    async fn topic_map(
        &self,
        tx: &DatabaseTransaction,
    ) -> HistorianResult<(HashMap<String, i64>, HashMap<String, String>)>;

    /// `(name_key, agg_type, agg_period) -> agg_id` for every aggregate topic.
    async fn agg_topic_map(
        &self,
        tx: &DatabaseTransaction,
    ) -> HistorianResult<HashMap<AggTopicKey, i64>>;

    /// `topic id -> metadata` for every topic with stored metadata.
    async fn topic_meta_map(
        &self,
        tx: &DatabaseTransaction,
    ) -> HistorianResult<HashMap<i64, TopicMeta>>;

    /// `name_key -> id` for topic names matching an SQL LIKE pattern.
    async fn topics_by_pattern(
        &self,
        tx: &DatabaseTransaction,
        pattern: &str,
    ) -> HistorianResult<HashMap<String, i64>>;

    /// Configured aggregate topics with their source metadata.
    async fn agg_topics(&self, tx: &DatabaseTransaction) -> HistorianResult<Vec<AggregateTopic>>;

    /// Insert a topic and return its backend-assigned id. Metadata is stored
    /// in the same statement when topics and metadata are co-located.
    async fn insert_topic(
        &self,
        tx: &DatabaseTransaction,
        name: &str,
        meta: Option<&TopicMeta>,
    ) -> HistorianResult<i64>;

    /// Update a topic's display name; when co-located and metadata is given,
    /// both change in one statement.
    async fn update_topic(
        &self,
        tx: &DatabaseTransaction,
        name: &str,
        topic_id: i64,
        meta: Option<&TopicMeta>,
    ) -> HistorianResult<()>;

    /// Metadata-only write for an existing topic.
    async fn update_meta(
        &self,
        tx: &DatabaseTransaction,
        topic_id: i64,
        meta: &TopicMeta,
    ) -> HistorianResult<()>;

    /// Scoped acquisition of the data-insert channel for one batch.
    fn bulk_insert(&self) -> Box<dyn DataInserter>;

    /// Scoped acquisition of the metadata-insert channel for one batch.
    fn bulk_insert_meta(&self) -> Box<dyn MetaInserter>;

    /// Range retrieval for a set of resolved topic ids. The row limit
    /// applies independently per topic; results map display names to
    /// ordered `(timestamp, value)` pairs.
    async fn query(
        &self,
        tx: &DatabaseTransaction,
        topic_ids: &[i64],
        id_name_map: &HashMap<i64, String>,
        request: &RangeRequest,
    ) -> HistorianResult<HashMap<String, Vec<Sample>>>;

    /// Idempotent creation of the `{agg_type}_{agg_period}` storage.
    async fn create_aggregate_store(
        &self,
        tx: &DatabaseTransaction,
        agg_type: &str,
        agg_period: &str,
    ) -> HistorianResult<()>;

    /// Write one computed aggregate row. `end` is the exclusive boundary of
    /// the aggregation window.
    async fn insert_aggregate(
        &self,
        tx: &DatabaseTransaction,
        agg_topic_id: i64,
        agg_type: &str,
        agg_period: &str,
        end: DateTime<Utc>,
        value: f64,
        topic_ids: &[i64],
    ) -> HistorianResult<()>;

    /// Insert an aggregate topic, returning its id; re-inserting the same
    /// triple yields the existing id.
    async fn insert_agg_topic(
        &self,
        tx: &DatabaseTransaction,
        name: &str,
        agg_type: &str,
        agg_period: &str,
    ) -> HistorianResult<i64>;

    async fn update_agg_topic(
        &self,
        tx: &DatabaseTransaction,
        agg_id: i64,
        name: &str,
    ) -> HistorianResult<()>;

    /// Replace the metadata of an aggregate topic.
    async fn insert_agg_meta(
        &self,
        tx: &DatabaseTransaction,
        agg_id: i64,
        meta: &TopicMeta,
    ) -> HistorianResult<()>;

    /// Compute an aggregate over raw data in a time window, returning the
    /// value and the number of samples it covers.
    async fn collect_aggregate(
        &self,
        tx: &DatabaseTransaction,
        topic_ids: &[i64],
        aggregation: Aggregation,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> HistorianResult<(f64, u64)>;

    /// Optional retention hook: drop data older than `cutoff` and/or oldest
    /// rows until the store fits under `size_limit_gb`. The default does
    /// nothing.
    async fn manage_db_size(
        &self,
        tx: &DatabaseTransaction,
        cutoff: Option<DateTime<Utc>>,
        size_limit_gb: Option<f64>,
    ) -> HistorianResult<()> {
        let _ = (tx, cutoff, size_limit_gb);
        Ok(())
    }
}

/// Backend implementation that generates statements with sea-query; the
/// dialect builder is chosen from the live connection, so one implementation
/// covers sqlite, postgres and mysql.
#[derive(Clone, Debug)]
pub struct SqlBackend {
    tables: TableNames,
}

impl SqlBackend {
    pub fn new(tables: TableNames) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl HistorianBackend for SqlBackend {
    fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn setup_historian_tables(&self, tx: &DatabaseTransaction) -> HistorianResult<()> {
        let mut topics = Table::create();
        topics
            .table(self.tables.topics())
            .if_not_exists()
            .col(
                ColumnDef::new(TopicsColumn::TopicId)
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(TopicsColumn::TopicName).text().not_null());
        if self.colocated() {
            topics.col(ColumnDef::new(TopicsColumn::Metadata).text());
        }
        exec_schema(tx, &topics).await?;

        if !self.colocated() {
            let mut meta = Table::create();
            meta.table(self.tables.meta())
                .if_not_exists()
                .col(
                    ColumnDef::new(MetaColumn::TopicId)
                        .big_integer()
                        .not_null()
                        .primary_key(),
                )
                .col(ColumnDef::new(MetaColumn::Metadata).text().not_null());
            exec_schema(tx, &meta).await?;
        }

        let mut data = Table::create();
        data.table(self.tables.data())
            .if_not_exists()
            .col(ColumnDef::new(DataColumn::Ts).big_integer().not_null())
            .col(ColumnDef::new(DataColumn::TopicId).big_integer().not_null())
            .col(
                ColumnDef::new(DataColumn::ValueString)
                    .text()
                    .not_null(),
            );
        exec_schema(tx, &data).await?;

        let mut data_index = Index::create();
        data_index
            .if_not_exists()
            .name(self.tables.data_index().as_str())
            .table(self.tables.data())
            .col(DataColumn::Ts);
        exec_schema(tx, &data_index).await?;

        Ok(())
    }

    async fn setup_aggregate_tables(&self, tx: &DatabaseTransaction) -> HistorianResult<()> {
        let mut agg_topics = Table::create();
        agg_topics
            .table(self.tables.agg_topics())
            .if_not_exists()
            .col(
                ColumnDef::new(AggTopicsColumn::AggTopicId)
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            // sized so the identity index below works on every dialect
            .col(
                ColumnDef::new(AggTopicsColumn::AggTopicName)
                    .string_len(512)
                    .not_null(),
            )
            .col(
                ColumnDef::new(AggTopicsColumn::AggType)
                    .string_len(64)
                    .not_null(),
            )
            .col(
                ColumnDef::new(AggTopicsColumn::AggTimePeriod)
                    .string_len(64)
                    .not_null(),
            );
        exec_schema(tx, &agg_topics).await?;

        let mut identity = Index::create();
        identity
            .if_not_exists()
            .unique()
            .name(self.tables.agg_topics_index().as_str())
            .table(self.tables.agg_topics())
            .col(AggTopicsColumn::AggTopicName)
            .col(AggTopicsColumn::AggType)
            .col(AggTopicsColumn::AggTimePeriod);
        exec_schema(tx, &identity).await?;

        let mut agg_meta = Table::create();
        agg_meta
            .table(self.tables.agg_meta())
            .if_not_exists()
            .col(
                ColumnDef::new(AggMetaColumn::AggTopicId)
                    .big_integer()
                    .not_null()
                    .primary_key(),
            )
            .col(ColumnDef::new(AggMetaColumn::Metadata).text().not_null());
        exec_schema(tx, &agg_meta).await?;

        Ok(())
    }

    async fn topic_map(
        &self,
        tx: &DatabaseTransaction,
    ) -> HistorianResult<(HashMap<String, i64>, HashMap<String, String>)> {
        let select = Query::select()
            .from(self.tables.topics())
            .columns([TopicsColumn::TopicId, TopicsColumn::TopicName])
            .to_owned();
        let rows = query_all(tx, &select).await?;
        let mut ids = HashMap::with_capacity(rows.len());
        let mut names = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("", &col_name(TopicsColumn::TopicId))?;
            let name: String = row.try_get("", &col_name(TopicsColumn::TopicName))?;
            let key = topic_key(&name);
            ids.insert(key.clone(), id);
            names.insert(key, name);
        }
        Ok((ids, names))
    }

    async fn agg_topic_map(
        &self,
        tx: &DatabaseTransaction,
    ) -> HistorianResult<HashMap<AggTopicKey, i64>> {
        let select = Query::select()
            .from(self.tables.agg_topics())
            .columns([
                AggTopicsColumn::AggTopicId,
                AggTopicsColumn::AggTopicName,
                AggTopicsColumn::AggType,
                AggTopicsColumn::AggTimePeriod,
            ])
            .to_owned();
        let rows = query_all(tx, &select).await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("", &col_name(AggTopicsColumn::AggTopicId))?;
            let name: String = row.try_get("", &col_name(AggTopicsColumn::AggTopicName))?;
            let agg_type: String = row.try_get("", &col_name(AggTopicsColumn::AggType))?;
            let agg_period: String = row.try_get("", &col_name(AggTopicsColumn::AggTimePeriod))?;
            map.insert(AggTopicKey::new(&name, &agg_type, &agg_period), id);
        }
        Ok(map)
    }

    async fn topic_meta_map(
        &self,
        tx: &DatabaseTransaction,
    ) -> HistorianResult<HashMap<i64, TopicMeta>> {
        let table = if self.colocated() {
            self.tables.topics()
        } else {
            self.tables.meta()
        };
        let select = Query::select()
            .from(table)
            .columns([MetaColumn::TopicId, MetaColumn::Metadata])
            .to_owned();
        let rows = query_all(tx, &select).await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("", &col_name(MetaColumn::TopicId))?;
            let raw: Option<String> = row.try_get("", &col_name(MetaColumn::Metadata))?;
            let Some(raw) = raw else {
                continue;
            };
            map.insert(id, decode_meta(&raw)?);
        }
        Ok(map)
    }

    async fn topics_by_pattern(
        &self,
        tx: &DatabaseTransaction,
        pattern: &str,
    ) -> HistorianResult<HashMap<String, i64>> {
        let pattern = pattern.to_lowercase();
        let select = Query::select()
            .from(self.tables.topics())
            .columns([TopicsColumn::TopicId, TopicsColumn::TopicName])
            .and_where(Expr::expr(Func::lower(Expr::col(TopicsColumn::TopicName))).like(pattern))
            .to_owned();
        let rows = query_all(tx, &select).await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("", &col_name(TopicsColumn::TopicId))?;
            let name: String = row.try_get("", &col_name(TopicsColumn::TopicName))?;
            map.insert(topic_key(&name), id);
        }
        Ok(map)
    }

    async fn agg_topics(&self, tx: &DatabaseTransaction) -> HistorianResult<Vec<AggregateTopic>> {
        let select = Query::select()
            .from(self.tables.agg_topics())
            .columns([
                (self.tables.agg_topics(), AggTopicsColumn::AggTopicName),
                (self.tables.agg_topics(), AggTopicsColumn::AggType),
                (self.tables.agg_topics(), AggTopicsColumn::AggTimePeriod),
            ])
            .column((self.tables.agg_meta(), AggMetaColumn::Metadata))
            .left_join(
                self.tables.agg_meta(),
                Expr::col((self.tables.agg_meta(), AggMetaColumn::AggTopicId))
                    .equals((self.tables.agg_topics(), AggTopicsColumn::AggTopicId)),
            )
            .to_owned();
        let rows = query_all(tx, &select).await?;
        let mut topics = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("", &col_name(AggTopicsColumn::AggTopicName))?;
            let agg_type: String = row.try_get("", &col_name(AggTopicsColumn::AggType))?;
            let agg_period: String = row.try_get("", &col_name(AggTopicsColumn::AggTimePeriod))?;
            let raw: Option<String> = row.try_get("", &col_name(AggMetaColumn::Metadata))?;
            let metadata = match raw {
                Some(raw) => decode_meta(&raw)?,
                None => TopicMeta::new(),
            };
            topics.push(AggregateTopic {
                name,
                agg_type,
                agg_period,
                metadata,
            });
        }
        Ok(topics)
    }

    async fn insert_topic(
        &self,
        tx: &DatabaseTransaction,
        name: &str,
        meta: Option<&TopicMeta>,
    ) -> HistorianResult<i64> {
        let mut insert = Query::insert();
        insert.into_table(self.tables.topics());
        match meta.filter(|meta| !meta.is_empty()) {
            Some(meta) if self.colocated() => {
                insert
                    .columns([TopicsColumn::TopicName, TopicsColumn::Metadata])
                    .values_panic([name.to_string().into(), encode_meta(meta)?.into()]);
            }
            _ => {
                insert
                    .columns([TopicsColumn::TopicName])
                    .values_panic([name.to_string().into()]);
            }
        }
        insert_returning_id(tx, insert, &col_name(TopicsColumn::TopicId)).await
    }

    async fn update_topic(
        &self,
        tx: &DatabaseTransaction,
        name: &str,
        topic_id: i64,
        meta: Option<&TopicMeta>,
    ) -> HistorianResult<()> {
        let meta = meta.filter(|meta| !meta.is_empty());
        let mut update = Query::update();
        update
            .table(self.tables.topics())
            .value(TopicsColumn::TopicName, name.to_string())
            .and_where(Expr::col(TopicsColumn::TopicId).eq(topic_id));
        if self.colocated() {
            if let Some(meta) = meta {
                update.value(TopicsColumn::Metadata, encode_meta(meta)?);
            }
        }
        exec(tx, &update).await
    }

    async fn update_meta(
        &self,
        tx: &DatabaseTransaction,
        topic_id: i64,
        meta: &TopicMeta,
    ) -> HistorianResult<()> {
        if self.colocated() {
            let update = Query::update()
                .table(self.tables.topics())
                .value(TopicsColumn::Metadata, encode_meta(meta)?)
                .and_where(Expr::col(TopicsColumn::TopicId).eq(topic_id))
                .to_owned();
            return exec(tx, &update).await;
        }
        let insert = meta_upsert(&self.tables, topic_id, meta)?;
        exec(tx, &insert).await
    }

    fn bulk_insert(&self) -> Box<dyn DataInserter> {
        Box::new(SingleRowData {
            tables: self.tables.clone(),
        })
    }

    fn bulk_insert_meta(&self) -> Box<dyn MetaInserter> {
        Box::new(SingleRowMeta {
            tables: self.tables.clone(),
        })
    }

    async fn query(
        &self,
        tx: &DatabaseTransaction,
        topic_ids: &[i64],
        id_name_map: &HashMap<i64, String>,
        request: &RangeRequest,
    ) -> HistorianResult<HashMap<String, Vec<Sample>>> {
        let (source, id_col) = match &request.aggregate {
            Some((agg_type, agg_period)) => (
                self.tables.aggregate(agg_type, agg_period),
                Alias::new(col_name(AggDataColumn::AggTopicId)),
            ),
            None => (
                self.tables.data(),
                Alias::new(col_name(DataColumn::TopicId)),
            ),
        };
        let ts_col = Alias::new(col_name(DataColumn::Ts));
        let value_col = Alias::new(col_name(DataColumn::ValueString));

        let mut results = HashMap::new();
        for topic_id in topic_ids {
            let mut select = Query::select();
            select
                .from(source.clone())
                .columns([ts_col.clone(), value_col.clone()])
                .and_where(Expr::col(id_col.clone()).eq(*topic_id));
            if let Some(start) = request.start {
                select.and_where(Expr::col(ts_col.clone()).gte(start.timestamp_micros()));
            }
            if let Some(end) = request.end {
                select.and_where(Expr::col(ts_col.clone()).lt(end.timestamp_micros()));
            }
            let direction = match request.order {
                Order::FirstToLast => SeaOrder::Asc,
                Order::LastToFirst => SeaOrder::Desc,
            };
            select.order_by(ts_col.clone(), direction);
            if request.count.is_some() || request.skip > 0 {
                // the limit applies per topic, not to the query as a whole
                select.limit(request.count.unwrap_or(i64::MAX as u64));
                select.offset(request.skip);
            }
            let rows = query_all(tx, &select).await?;
            let mut samples = Vec::with_capacity(rows.len());
            for row in rows {
                samples.push(decode_sample(&row, &ts_col, &value_col)?);
            }
            if samples.is_empty() {
                continue;
            }
            let name = match id_name_map.get(topic_id) {
                Some(name) => name.clone(),
                None => topic_id.to_string(),
            };
            results.insert(name, samples);
        }
        Ok(results)
    }

    async fn create_aggregate_store(
        &self,
        tx: &DatabaseTransaction,
        agg_type: &str,
        agg_period: &str,
    ) -> HistorianResult<()> {
        Aggregation::parse(agg_type)?;
        let mut table = Table::create();
        table
            .table(self.tables.aggregate(agg_type, agg_period))
            .if_not_exists()
            .col(ColumnDef::new(AggDataColumn::Ts).big_integer().not_null())
            .col(
                ColumnDef::new(AggDataColumn::AggTopicId)
                    .big_integer()
                    .not_null(),
            )
            .col(
                ColumnDef::new(AggDataColumn::ValueString)
                    .text()
                    .not_null(),
            )
            .col(ColumnDef::new(AggDataColumn::TopicsList).text());
        exec_schema(tx, &table).await?;

        let mut slot = Index::create();
        slot.if_not_exists()
            .unique()
            .name(self.tables.aggregate_index(agg_type, agg_period).as_str())
            .table(self.tables.aggregate(agg_type, agg_period))
            .col(AggDataColumn::AggTopicId)
            .col(AggDataColumn::Ts);
        exec_schema(tx, &slot).await
    }

    async fn insert_aggregate(
        &self,
        tx: &DatabaseTransaction,
        agg_topic_id: i64,
        agg_type: &str,
        agg_period: &str,
        end: DateTime<Utc>,
        value: f64,
        topic_ids: &[i64],
    ) -> HistorianResult<()> {
        let encoded = serde_json::to_string(&value)
            .map_err(|err| HistorianError::invalid(err.to_string()))?;
        let topics_list = serde_json::to_string(topic_ids)
            .map_err(|err| HistorianError::invalid(err.to_string()))?;
        let insert = Query::insert()
            .into_table(self.tables.aggregate(agg_type, agg_period))
            .columns([
                AggDataColumn::Ts,
                AggDataColumn::AggTopicId,
                AggDataColumn::ValueString,
                AggDataColumn::TopicsList,
            ])
            .values_panic([
                end.timestamp_micros().into(),
                agg_topic_id.into(),
                encoded.into(),
                topics_list.into(),
            ])
            .on_conflict(
                OnConflict::columns([AggDataColumn::AggTopicId, AggDataColumn::Ts])
                    .update_columns([AggDataColumn::ValueString, AggDataColumn::TopicsList])
                    .to_owned(),
            )
            .to_owned();
        exec(tx, &insert).await
    }

    async fn insert_agg_topic(
        &self,
        tx: &DatabaseTransaction,
        name: &str,
        agg_type: &str,
        agg_period: &str,
    ) -> HistorianResult<i64> {
        let mut insert = Query::insert();
        insert
            .into_table(self.tables.agg_topics())
            .columns([
                AggTopicsColumn::AggTopicName,
                AggTopicsColumn::AggType,
                AggTopicsColumn::AggTimePeriod,
            ])
            .values_panic([
                name.to_string().into(),
                agg_type.to_lowercase().into(),
                agg_period.to_string().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    AggTopicsColumn::AggTopicName,
                    AggTopicsColumn::AggType,
                    AggTopicsColumn::AggTimePeriod,
                ])
                .update_column(AggTopicsColumn::AggTopicName)
                .to_owned(),
            );
        insert_returning_id(tx, insert, &col_name(AggTopicsColumn::AggTopicId)).await
    }

    async fn update_agg_topic(
        &self,
        tx: &DatabaseTransaction,
        agg_id: i64,
        name: &str,
    ) -> HistorianResult<()> {
        let update = Query::update()
            .table(self.tables.agg_topics())
            .value(AggTopicsColumn::AggTopicName, name.to_string())
            .and_where(Expr::col(AggTopicsColumn::AggTopicId).eq(agg_id))
            .to_owned();
        exec(tx, &update).await
    }

    async fn insert_agg_meta(
        &self,
        tx: &DatabaseTransaction,
        agg_id: i64,
        meta: &TopicMeta,
    ) -> HistorianResult<()> {
        let insert = Query::insert()
            .into_table(self.tables.agg_meta())
            .columns([AggMetaColumn::AggTopicId, AggMetaColumn::Metadata])
            .values_panic([agg_id.into(), encode_meta(meta)?.into()])
            .on_conflict(
                OnConflict::column(AggMetaColumn::AggTopicId)
                    .update_column(AggMetaColumn::Metadata)
                    .to_owned(),
            )
            .to_owned();
        exec(tx, &insert).await
    }

    async fn collect_aggregate(
        &self,
        tx: &DatabaseTransaction,
        topic_ids: &[i64],
        aggregation: Aggregation,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> HistorianResult<(f64, u64)> {
        let backend = tx.get_database_backend();
        let value_expr = Expr::col(DataColumn::ValueString).cast_as(numeric_type(backend));
        let agg_expr: SimpleExpr = match aggregation {
            Aggregation::Avg => Func::avg(value_expr).into(),
            Aggregation::Sum => Func::sum(value_expr).into(),
            Aggregation::Count => Func::count(Expr::col(DataColumn::ValueString)).into(),
            Aggregation::Min => Func::min(value_expr).into(),
            Aggregation::Max => Func::max(value_expr).into(),
        };
        let mut select = Query::select();
        select
            .expr_as(agg_expr, Alias::new("agg_value"))
            .expr_as(
                Func::count(Expr::col(DataColumn::ValueString)),
                Alias::new("value_count"),
            )
            .from(self.tables.data())
            .and_where(Expr::col(DataColumn::TopicId).is_in(topic_ids.iter().copied()));
        if let Some(start) = start {
            select.and_where(Expr::col(DataColumn::Ts).gte(start.timestamp_micros()));
        }
        if let Some(end) = end {
            select.and_where(Expr::col(DataColumn::Ts).lt(end.timestamp_micros()));
        }
        let row = query_one(tx, &select)
            .await?
            .ok_or_else(|| HistorianError::statement("aggregate query returned no row"))?;
        let count: i64 = row.try_get("", "value_count")?;
        let value = match aggregation {
            Aggregation::Count => Some(count as f64),
            _ => row.try_get::<Option<f64>>("", "agg_value")?,
        };
        Ok((value.unwrap_or(0.0), count as u64))
    }

    async fn manage_db_size(
        &self,
        tx: &DatabaseTransaction,
        cutoff: Option<DateTime<Utc>>,
        size_limit_gb: Option<f64>,
    ) -> HistorianResult<()> {
        if let Some(cutoff) = cutoff {
            let delete = Query::delete()
                .from_table(self.tables.data())
                .and_where(Expr::col(DataColumn::Ts).lt(cutoff.timestamp_micros()))
                .to_owned();
            let removed = exec_count(tx, &delete).await?;
            log::debug!("retention cutoff removed {removed} rows");
        }
        let Some(size_limit_gb) = size_limit_gb else {
            return Ok(());
        };
        if tx.get_database_backend() != DatabaseBackend::Sqlite {
            log::warn!("storage ceiling enforcement is only implemented for sqlite; skipping");
            return Ok(());
        }
        let limit_bytes = (size_limit_gb * 1024.0 * 1024.0 * 1024.0) as i64;
        loop {
            if sqlite_used_bytes(tx).await? <= limit_bytes {
                break;
            }
            // drop the oldest rows in fixed-size slices until under the ceiling
            let oldest = Query::select()
                .from(self.tables.data())
                .column(DataColumn::Ts)
                .order_by(DataColumn::Ts, SeaOrder::Asc)
                .limit(100)
                .to_owned();
            let delete = Query::delete()
                .from_table(self.tables.data())
                .and_where(Expr::col(DataColumn::Ts).in_subquery(oldest))
                .to_owned();
            if exec_count(tx, &delete).await? == 0 {
                break;
            }
        }
        Ok(())
    }
}

struct SingleRowData {
    tables: TableNames,
}

#[async_trait]
impl DataInserter for SingleRowData {
    async fn insert(
        &mut self,
        tx: &DatabaseTransaction,
        ts: DateTime<Utc>,
        topic_id: i64,
        value: &Value,
    ) -> HistorianResult<bool> {
        let encoded =
            serde_json::to_string(value).map_err(|err| HistorianError::invalid(err.to_string()))?;
        let insert = Query::insert()
            .into_table(self.tables.data())
            .columns([DataColumn::Ts, DataColumn::TopicId, DataColumn::ValueString])
            .values_panic([
                ts.timestamp_micros().into(),
                topic_id.into(),
                encoded.into(),
            ])
            .to_owned();
        exec(tx, &insert).await?;
        Ok(true)
    }
}

struct SingleRowMeta {
    tables: TableNames,
}

#[async_trait]
impl MetaInserter for SingleRowMeta {
    async fn insert(
        &mut self,
        tx: &DatabaseTransaction,
        topic_id: i64,
        meta: &TopicMeta,
    ) -> HistorianResult<bool> {
        let insert = meta_upsert(&self.tables, topic_id, meta)?;
        exec(tx, &insert).await?;
        Ok(true)
    }
}

fn meta_upsert(
    tables: &TableNames,
    topic_id: i64,
    meta: &TopicMeta,
) -> HistorianResult<InsertStatement> {
    Ok(Query::insert()
        .into_table(tables.meta())
        .columns([MetaColumn::TopicId, MetaColumn::Metadata])
        .values_panic([topic_id.into(), encode_meta(meta)?.into()])
        .on_conflict(
            OnConflict::column(MetaColumn::TopicId)
                .update_column(MetaColumn::Metadata)
                .to_owned(),
        )
        .to_owned())
}

fn encode_meta(meta: &TopicMeta) -> HistorianResult<String> {
    serde_json::to_string(meta).map_err(|err| HistorianError::invalid(err.to_string()))
}

fn decode_meta(raw: &str) -> HistorianResult<TopicMeta> {
    serde_json::from_str(raw)
        .map_err(|err| HistorianError::statement(format!("malformed stored metadata: {err}")))
}

fn decode_sample(row: &QueryResult, ts_col: &Alias, value_col: &Alias) -> HistorianResult<Sample> {
    let micros: i64 = row.try_get("", &col_name(ts_col.clone()))?;
    let raw: String = row.try_get("", &col_name(value_col.clone()))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| HistorianError::statement(format!("malformed stored value: {err}")))?;
    let ts = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| HistorianError::statement(format!("timestamp out of range: {micros}")))?;
    Ok((ts, value))
}

fn numeric_type(backend: DatabaseBackend) -> Alias {
    match backend {
        DatabaseBackend::Postgres => Alias::new("double precision"),
        DatabaseBackend::MySql => Alias::new("double"),
        _ => Alias::new("real"),
    }
}

fn col_name(column: impl Iden) -> String {
    column.to_string()
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

fn build_schema_stmt<S: SchemaStatementBuilder>(backend: DatabaseBackend, stmt: &S) -> String {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

async fn exec<C, S>(conn: &C, stmt: &S) -> HistorianResult<()>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    exec_count(conn, stmt).await.map(|_| ())
}

async fn exec_count<C, S>(conn: &C, stmt: &S) -> HistorianResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

async fn exec_schema<C, S>(conn: &C, stmt: &S) -> HistorianResult<()>
where
    C: ConnectionTrait,
    S: SchemaStatementBuilder,
{
    let backend = conn.get_database_backend();
    let sql = build_schema_stmt(backend, stmt);
    conn.execute(Statement::from_string(backend, sql)).await?;
    Ok(())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> HistorianResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> HistorianResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}

/// Run an insert and hand back the row id the backend assigned. Dialects
/// without `RETURNING` report it through their last-insert-id channel.
async fn insert_returning_id<C>(
    conn: &C,
    mut insert: InsertStatement,
    id_column: &str,
) -> HistorianResult<i64>
where
    C: ConnectionTrait,
{
    let backend = conn.get_database_backend();
    if backend == DatabaseBackend::MySql {
        let (sql, values) = build_stmt(backend, &insert);
        let result = conn
            .execute(Statement::from_sql_and_values(backend, sql, values))
            .await?;
        return Ok(result.last_insert_id() as i64);
    }
    insert.returning_col(Alias::new(id_column));
    let (sql, values) = build_stmt(backend, &insert);
    let row = conn
        .query_one(Statement::from_sql_and_values(backend, sql, values))
        .await?
        .ok_or_else(|| HistorianError::statement("insert returned no row id"))?;
    Ok(row.try_get("", id_column)?)
}

async fn sqlite_used_bytes<C: ConnectionTrait>(conn: &C) -> HistorianResult<i64> {
    let page_count = sqlite_pragma(conn, "page_count").await?;
    let freelist = sqlite_pragma(conn, "freelist_count").await?;
    let page_size = sqlite_pragma(conn, "page_size").await?;
    Ok((page_count - freelist).max(0) * page_size)
}

async fn sqlite_pragma<C: ConnectionTrait>(conn: &C, name: &str) -> HistorianResult<i64> {
    let row = conn
        .query_one(Statement::from_string(
            DatabaseBackend::Sqlite,
            format!("PRAGMA {name}"),
        ))
        .await?
        .ok_or_else(|| HistorianError::statement(format!("pragma {name} returned no row")))?;
    Ok(row.try_get("", name)?)
}
