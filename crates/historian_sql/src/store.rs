use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use historian_core::types::{
    topic_key, AggTopicKey, AggregateTopic, Aggregation, HistorianQuery, HistorianValues, Record,
    TopicMeta,
};
use historian_core::{HistorianError, HistorianResult};

use crate::backend::{HistorianBackend, RangeRequest, SqlBackend};
use crate::cache::{CatalogUpdate, TopicCatalog};
use crate::config::HistorianConfig;
use crate::connection::ConnectionManager;
use crate::db::TableNames;

/// SQL-backed historian engine.
///
/// Holds two independent connection managers: one used exclusively by the
/// context answering read queries, one used exclusively by the context
/// ingesting publish batches. Both share the in-memory topic catalog.
#[derive(Debug)]
pub struct SqlHistorian<B: HistorianBackend = SqlBackend> {
    backend: Arc<B>,
    catalog: Arc<TopicCatalog>,
    reader: Mutex<ConnectionManager>,
    writer: Mutex<WriterState>,
    readonly: bool,
}

/// The publish context's connection plus the catalog changes its open
/// transaction carries. Entries move to the shared catalog when that
/// transaction commits and are dropped when it rolls back.
#[derive(Debug)]
struct WriterState {
    manager: ConnectionManager,
    pending: CatalogUpdate,
}

impl SqlHistorian<SqlBackend> {
    /// Open a historian backed by the sea-query statement generators.
    pub async fn connect(config: &HistorianConfig, base_dir: &Path) -> HistorianResult<Self> {
        let backend = SqlBackend::new(TableNames::new(&config.tables()));
        Self::with_backend(backend, config, base_dir).await
    }

    /// Open a historian from `historian.json` in `base_dir`, writing a
    /// default sqlite configuration on first run.
    pub async fn open(base_dir: &Path) -> HistorianResult<Self> {
        let config = HistorianConfig::load_or_init(base_dir)?;
        Self::connect(&config, base_dir).await
    }
}

impl<B: HistorianBackend> SqlHistorian<B> {
    /// Open a historian with a caller-supplied backend implementation.
    pub async fn with_backend(
        backend: B,
        config: &HistorianConfig,
        base_dir: &Path,
    ) -> HistorianResult<Self> {
        let historian = Self {
            backend: Arc::new(backend),
            catalog: Arc::new(TopicCatalog::default()),
            reader: Mutex::new(ConnectionManager::new(
                &config.connection,
                config.pool.as_ref(),
                base_dir,
            )),
            writer: Mutex::new(WriterState {
                manager: ConnectionManager::new(&config.connection, config.pool.as_ref(), base_dir),
                pending: CatalogUpdate::default(),
            }),
            readonly: config.readonly(),
        };
        historian.setup().await?;
        Ok(historian)
    }

    /// Bootstrap the schema (unless readonly) and load the catalog from the
    /// backing store's three map-producing operations.
    async fn setup(&self) -> HistorianResult<()> {
        let mut writer = self.writer.lock().await;
        let result = self.load_catalog(&mut writer.manager).await;
        self.finish_write(&mut writer, result).await
    }

    async fn load_catalog(&self, writer: &mut ConnectionManager) -> HistorianResult<()> {
        let tx = writer.cursor().await?;
        if !self.readonly {
            self.backend.setup_historian_tables(tx).await?;
            self.backend.setup_aggregate_tables(tx).await?;
        }
        let (ids, names) = self.backend.topic_map(tx).await?;
        let metas = self.backend.topic_meta_map(tx).await?;
        let agg_ids = self.backend.agg_topic_map(tx).await?;
        log::debug!(
            "loaded {} topics and {} metadata entries at startup",
            ids.len(),
            metas.len()
        );
        self.catalog.load(ids, names, metas, agg_ids);
        Ok(())
    }

    /// Persist one ordered batch of records, committing or rolling back the
    /// whole batch as a unit. Returns the number of records published.
    ///
    /// A mid-batch statement failure rolls everything back and propagates;
    /// the caller may treat the batch as unhandled and redeliver it. Catalog
    /// changes become visible to readers only after the commit succeeds.
    pub async fn publish_batch(&self, batch: &[Record]) -> HistorianResult<usize> {
        let mut writer = self.writer.lock().await;
        let mut published = 0usize;
        if let Err(err) = self.run_batch(&mut writer, batch, &mut published).await {
            self.abandon_write(&mut writer).await;
            return Err(err);
        }
        if published == 0 {
            // nothing to commit; pending statements stay on the open
            // transaction and ride along with the next batch
            log::warn!("unable to publish any of {} records", batch.len());
            return Ok(0);
        }
        match writer.manager.commit().await {
            Ok(_) => {
                self.catalog.apply(std::mem::take(&mut writer.pending));
                Ok(published)
            }
            Err(err) => {
                log::warn!("commit error; rolling back {published} values");
                self.abandon_write(&mut writer).await;
                Err(err)
            }
        }
    }

    async fn run_batch(
        &self,
        writer: &mut WriterState,
        batch: &[Record],
        published: &mut usize,
    ) -> HistorianResult<()> {
        let WriterState { manager, pending } = writer;
        let staged = pending;
        let tx = manager.cursor().await?;
        let mut insert_data = self.backend.bulk_insert();
        let mut insert_meta = self.backend.bulk_insert_meta();
        for record in batch {
            let key = topic_key(&record.topic);
            let known = staged
                .staged_topic(&key)
                .or_else(|| self.catalog.topic(&key));
            let old_meta = match &known {
                Some((id, _)) => staged
                    .staged_meta(*id)
                    .cloned()
                    .or_else(|| self.catalog.meta_for(*id))
                    .unwrap_or_default(),
                None => TopicMeta::new(),
            };
            // Tracks whether a same-table metadata update is still owed for
            // this record; separate-table metadata always goes through the
            // bulk channel below.
            let mut update_topic_meta = true;
            let topic_id = match known {
                None => {
                    let id = self
                        .backend
                        .insert_topic(tx, &record.topic, Some(&record.meta))
                        .await?;
                    staged.record_topic(key.clone(), id, record.topic.clone());
                    update_topic_meta = false;
                    id
                }
                Some((id, db_topic_name)) => {
                    if db_topic_name != record.topic {
                        if old_meta != record.meta {
                            log::debug!(
                                "display name and metadata changed for {}",
                                record.topic
                            );
                            self.backend
                                .update_topic(tx, &record.topic, id, Some(&record.meta))
                                .await?;
                            update_topic_meta = false;
                        } else {
                            self.backend.update_topic(tx, &record.topic, id, None).await?;
                        }
                        staged.record_topic(key.clone(), id, record.topic.clone());
                    }
                    id
                }
            };
            if old_meta != record.meta {
                if !self.backend.colocated() {
                    insert_meta.insert(tx, topic_id, &record.meta).await?;
                } else if update_topic_meta {
                    self.backend.update_meta(tx, topic_id, &record.meta).await?;
                }
                staged.record_meta(topic_id, record.meta.clone());
            }
            if insert_data
                .insert(tx, record.timestamp, topic_id, &record.value)
                .await?
            {
                *published += 1;
            }
        }
        insert_data.finish(tx).await?;
        insert_meta.finish(tx).await?;
        Ok(())
    }

    /// Resolve topic names, delegate the range query and assemble results.
    /// Unresolvable names are logged and excluded; when nothing resolves the
    /// result is empty rather than an error.
    pub async fn query_historian(&self, query: &HistorianQuery) -> HistorianResult<HistorianValues> {
        let multi_topic_query = query.topics.len() > 1;
        let aggregate = match (&query.agg_type, &query.agg_period) {
            (Some(agg_type), Some(agg_period)) => {
                Some((agg_type.to_lowercase(), agg_period.clone()))
            }
            (None, None) => None,
            _ => {
                return Err(HistorianError::invalid(
                    "aggregate queries need both agg_type and agg_period",
                ));
            }
        };

        let mut reader = self.reader.lock().await;

        let mut topic_ids = Vec::new();
        let mut id_name_map = HashMap::new();
        let mut refreshed = false;
        for topic in &query.topics {
            let resolved = match &aggregate {
                Some((agg_type, agg_period)) => {
                    let agg_key = AggTopicKey::new(topic, agg_type, agg_period);
                    let mut agg_id = self.catalog.agg_topic_id(&agg_key);
                    if agg_id.is_none() && !refreshed {
                        // the aggregation may have been configured after startup
                        let map = {
                            let tx = reader.cursor().await?;
                            self.backend.agg_topic_map(tx).await
                        };
                        reader.release().await;
                        let map = map?;
                        log::debug!("aggregate topic map refreshed with {} entries", map.len());
                        self.catalog.merge_agg_map(map);
                        refreshed = true;
                        agg_id = self.catalog.agg_topic_id(&agg_key);
                    }
                    agg_id
                }
                None => self.catalog.topic_id(&topic_key(topic)),
            };
            match resolved {
                Some(id) => {
                    topic_ids.push(id);
                    id_name_map.insert(id, topic.clone());
                }
                None => log::warn!("no such topic {topic}"),
            }
        }

        if topic_ids.is_empty() {
            log::warn!(
                "no topic ids found for {:?}; returning empty result",
                query.topics
            );
            return Ok(HistorianValues::Empty);
        }

        let request = RangeRequest {
            start: query.start,
            end: query.end,
            aggregate: aggregate.clone(),
            skip: query.skip,
            count: query.count,
            order: query.order,
        };
        let values = {
            let tx = reader.cursor().await?;
            self.backend
                .query(tx, &topic_ids, &id_name_map, &request)
                .await
        };
        reader.release().await;
        let values = values?;

        if values.is_empty() {
            return Ok(HistorianValues::Empty);
        }
        if multi_topic_query {
            return Ok(HistorianValues::Multi(values));
        }
        // Single-topic result: attach metadata from the underlying raw topic.
        // An aggregation spanning several topics has no raw counterpart and
        // gets none.
        let meta_tid = if aggregate.is_some() {
            query
                .topics
                .first()
                .and_then(|topic| self.catalog.topic_id(&topic_key(topic)))
        } else {
            topic_ids.first().copied()
        };
        let metadata = meta_tid
            .and_then(|id| self.catalog.meta_for(id))
            .unwrap_or_default();
        let values = values.into_values().next().unwrap_or_default();
        if values.is_empty() {
            return Ok(HistorianValues::Empty);
        }
        Ok(HistorianValues::Single { values, metadata })
    }

    /// Display names of every known topic, served from the catalog.
    pub fn query_topic_list(&self) -> Vec<String> {
        self.catalog.display_names()
    }

    /// Cached metadata for each requested topic name; unknown names are
    /// left out of the result.
    pub fn query_topics_metadata(&self, topics: &[String]) -> HashMap<String, TopicMeta> {
        self.catalog.topics_metadata(topics)
    }

    /// `name_key -> id` for topics matching an SQL LIKE pattern; answered by
    /// the backing store rather than the catalog.
    pub async fn query_topics_by_pattern(
        &self,
        pattern: &str,
    ) -> HistorianResult<HashMap<String, i64>> {
        let mut reader = self.reader.lock().await;
        let result = {
            let tx = reader.cursor().await?;
            self.backend.topics_by_pattern(tx, pattern).await
        };
        reader.release().await;
        result
    }

    /// Configured aggregate topics with their source metadata.
    pub async fn query_aggregate_topics(&self) -> HistorianResult<Vec<AggregateTopic>> {
        let mut reader = self.reader.lock().await;
        let result = {
            let tx = reader.cursor().await?;
            self.backend.agg_topics(tx).await
        };
        reader.release().await;
        result
    }

    /// Retention pass-through: drop data older than `cutoff` and/or oldest
    /// rows until the store fits under `size_limit_gb`.
    pub async fn manage_db_size(
        &self,
        cutoff: Option<DateTime<Utc>>,
        size_limit_gb: Option<f64>,
    ) -> HistorianResult<()> {
        let mut writer = self.writer.lock().await;
        let result = {
            let tx = writer.manager.cursor().await?;
            self.backend.manage_db_size(tx, cutoff, size_limit_gb).await
        };
        self.finish_write(&mut writer, result).await
    }

    pub fn supported_aggregations(&self) -> &'static [Aggregation] {
        self.backend.aggregations()
    }

    /// Close both physical connections.
    pub async fn close(&self) {
        self.reader.lock().await.close().await;
        self.writer.lock().await.manager.close().await;
    }

    /// Commit on success (publishing any catalog entries the transaction
    /// carried), roll back on failure.
    async fn finish_write(
        &self,
        writer: &mut WriterState,
        result: HistorianResult<()>,
    ) -> HistorianResult<()> {
        match result {
            Ok(()) => match writer.manager.commit().await {
                Ok(_) => {
                    self.catalog.apply(std::mem::take(&mut writer.pending));
                    Ok(())
                }
                Err(err) => {
                    writer.pending = CatalogUpdate::default();
                    Err(err)
                }
            },
            Err(err) => {
                self.abandon_write(writer).await;
                Err(err)
            }
        }
    }

    /// Roll back the open transaction and drop the catalog entries it
    /// carried.
    async fn abandon_write(&self, writer: &mut WriterState) {
        if let Err(rollback_err) = writer.manager.rollback().await {
            log::warn!("rollback after failed write also failed: {rollback_err}");
        }
        writer.pending = CatalogUpdate::default();
    }
}

// Aggregate manager: per-period aggregate storage and the aggregate-topic
// catalog. These writes are not batched with raw-data publishing and commit
// immediately.
impl<B: HistorianBackend> SqlHistorian<B> {
    /// Idempotent creation of the `{agg_type}_{agg_period}` storage.
    pub async fn create_aggregate_store(
        &self,
        agg_type: &str,
        agg_period: &str,
    ) -> HistorianResult<()> {
        let mut writer = self.writer.lock().await;
        let result = {
            let tx = writer.manager.cursor().await?;
            self.backend
                .create_aggregate_store(tx, agg_type, agg_period)
                .await
        };
        self.finish_write(&mut writer, result).await
    }

    /// Write one computed aggregate. `end` is the exclusive boundary of the
    /// aggregation window.
    pub async fn insert_aggregate(
        &self,
        agg_topic_id: i64,
        agg_type: &str,
        agg_period: &str,
        end: DateTime<Utc>,
        value: f64,
        topic_ids: &[i64],
    ) -> HistorianResult<()> {
        let mut writer = self.writer.lock().await;
        let result = {
            let tx = writer.manager.cursor().await?;
            self.backend
                .insert_aggregate(tx, agg_topic_id, agg_type, agg_period, end, value, topic_ids)
                .await
        };
        self.finish_write(&mut writer, result).await
    }

    /// Insert an aggregate topic and cache its id. Re-inserting the same
    /// triple yields the existing id.
    pub async fn insert_agg_topic(
        &self,
        name: &str,
        agg_type: &str,
        agg_period: &str,
    ) -> HistorianResult<i64> {
        let mut writer = self.writer.lock().await;
        let result = {
            let tx = writer.manager.cursor().await?;
            self.backend.insert_agg_topic(tx, name, agg_type, agg_period).await
        };
        match result {
            Ok(agg_id) => {
                self.finish_write(&mut writer, Ok(())).await?;
                self.catalog
                    .insert_agg_topic(AggTopicKey::new(name, agg_type, agg_period), agg_id);
                Ok(agg_id)
            }
            Err(err) => {
                self.abandon_write(&mut writer).await;
                Err(err)
            }
        }
    }

    pub async fn update_agg_topic(&self, agg_id: i64, name: &str) -> HistorianResult<()> {
        let mut writer = self.writer.lock().await;
        let result = {
            let tx = writer.manager.cursor().await?;
            self.backend.update_agg_topic(tx, agg_id, name).await
        };
        self.finish_write(&mut writer, result).await
    }

    /// Replace the metadata of an aggregate topic.
    pub async fn insert_agg_meta(&self, agg_id: i64, meta: &TopicMeta) -> HistorianResult<()> {
        let mut writer = self.writer.lock().await;
        let result = {
            let tx = writer.manager.cursor().await?;
            self.backend.insert_agg_meta(tx, agg_id, meta).await
        };
        self.finish_write(&mut writer, result).await
    }

    /// Compute an aggregate over raw data in a time window, returning the
    /// value and the number of samples it covers.
    pub async fn collect_aggregate(
        &self,
        topic_ids: &[i64],
        aggregation: Aggregation,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> HistorianResult<(f64, u64)> {
        let mut reader = self.reader.lock().await;
        let result = {
            let tx = reader.cursor().await?;
            self.backend
                .collect_aggregate(tx, topic_ids, aggregation, start, end)
                .await
        };
        reader.release().await;
        result
    }

    /// Catalog id for a raw topic name, if known.
    pub fn resolve_topic(&self, topic: &str) -> Option<i64> {
        self.catalog.topic_id(&topic_key(topic))
    }
}
