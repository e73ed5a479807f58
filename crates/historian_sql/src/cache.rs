use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use historian_core::types::{AggTopicKey, TopicMeta};

#[derive(Debug, Default)]
struct CatalogState {
    ids: HashMap<String, i64>,
    names: HashMap<String, String>,
    metas: HashMap<i64, TopicMeta>,
    agg_ids: HashMap<AggTopicKey, i64>,
}

/// In-memory topic catalog shared by the query and publish contexts.
///
/// Loaded once at startup from the backing store. Topic entries are written
/// only by the publish pipeline; readers observe either the state before or
/// after a batch, never a torn entry. Changes made during a batch arrive as a
/// [`CatalogUpdate`] applied after the batch commit succeeds, so a rolled
/// back batch leaves no trace here. The aggregate map may additionally be
/// refreshed from the query context when a lookup misses.
#[derive(Debug, Default)]
pub struct TopicCatalog {
    state: RwLock<CatalogState>,
}

impl TopicCatalog {
    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(|err| err.into_inner())
    }

    /// Replace the whole catalog with freshly loaded maps.
    pub fn load(
        &self,
        ids: HashMap<String, i64>,
        names: HashMap<String, String>,
        metas: HashMap<i64, TopicMeta>,
        agg_ids: HashMap<AggTopicKey, i64>,
    ) {
        *self.write() = CatalogState {
            ids,
            names,
            metas,
            agg_ids,
        };
    }

    /// Id and display name for a topic key.
    pub fn topic(&self, key: &str) -> Option<(i64, String)> {
        let state = self.read();
        let id = *state.ids.get(key)?;
        let name = state.names.get(key)?.clone();
        Some((id, name))
    }

    pub fn topic_id(&self, key: &str) -> Option<i64> {
        self.read().ids.get(key).copied()
    }

    pub fn meta_for(&self, id: i64) -> Option<TopicMeta> {
        self.read().metas.get(&id).cloned()
    }

    /// Display names of every known topic, most recently published casing.
    pub fn display_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().names.values().cloned().collect();
        names.sort();
        names
    }

    /// Cached metadata for each resolvable name in `topics`, keyed by the
    /// name as the caller spelled it. Unknown names are left out.
    pub fn topics_metadata(&self, topics: &[String]) -> HashMap<String, TopicMeta> {
        let state = self.read();
        let mut out = HashMap::new();
        for topic in topics {
            let key = historian_core::topic_key(topic);
            if let Some(id) = state.ids.get(&key) {
                let meta = state.metas.get(id).cloned().unwrap_or_default();
                out.insert(topic.clone(), meta);
            }
        }
        out
    }

    pub fn agg_topic_id(&self, key: &AggTopicKey) -> Option<i64> {
        self.read().agg_ids.get(key).copied()
    }

    pub fn insert_agg_topic(&self, key: AggTopicKey, agg_id: i64) {
        self.write().agg_ids.insert(key, agg_id);
    }

    /// Merge a freshly loaded aggregate map over the cached one.
    pub fn merge_agg_map(&self, map: HashMap<AggTopicKey, i64>) {
        self.write().agg_ids.extend(map);
    }

    /// Apply the catalog changes of one committed batch.
    pub fn apply(&self, update: CatalogUpdate) {
        if update.is_empty() {
            return;
        }
        let mut state = self.write();
        for (key, (id, name)) in update.topics {
            state.ids.insert(key.clone(), id);
            state.names.insert(key, name);
        }
        for (id, meta) in update.metas {
            state.metas.insert(id, meta);
        }
    }
}

/// Catalog changes accumulated while a publish batch is in flight. Lookups
/// during the batch consult this staging view before the shared catalog, so
/// repeated topics within one batch resolve consistently.
#[derive(Debug, Default)]
pub struct CatalogUpdate {
    topics: HashMap<String, (i64, String)>,
    metas: HashMap<i64, TopicMeta>,
}

impl CatalogUpdate {
    pub fn record_topic(&mut self, key: String, id: i64, name: String) {
        self.topics.insert(key, (id, name));
    }

    pub fn record_meta(&mut self, id: i64, meta: TopicMeta) {
        self.metas.insert(id, meta);
    }

    pub fn staged_topic(&self, key: &str) -> Option<(i64, String)> {
        self.topics.get(key).cloned()
    }

    pub fn staged_meta(&self, id: i64) -> Option<&TopicMeta> {
        self.metas.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.metas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{CatalogUpdate, TopicCatalog};
    use historian_core::types::AggTopicKey;
    use std::collections::HashMap;

    #[test]
    fn staged_changes_are_invisible_until_applied() {
        let catalog = TopicCatalog::default();
        let mut update = CatalogUpdate::default();
        update.record_topic("device/temp".to_string(), 7, "Device/Temp".to_string());
        update.record_meta(7, serde_json::Map::new());

        assert!(catalog.topic("device/temp").is_none());
        assert_eq!(update.staged_topic("device/temp"), Some((7, "Device/Temp".to_string())));

        catalog.apply(update);
        assert_eq!(
            catalog.topic("device/temp"),
            Some((7, "Device/Temp".to_string()))
        );
        assert_eq!(catalog.meta_for(7), Some(serde_json::Map::new()));
    }

    #[test]
    fn display_names_track_last_applied_casing() {
        let catalog = TopicCatalog::default();
        let mut update = CatalogUpdate::default();
        update.record_topic("device/temp".to_string(), 1, "Device/Temp".to_string());
        catalog.apply(update);

        let mut update = CatalogUpdate::default();
        update.record_topic("device/temp".to_string(), 1, "device/temp".to_string());
        catalog.apply(update);

        assert_eq!(catalog.display_names(), vec!["device/temp".to_string()]);
    }

    #[test]
    fn aggregate_map_merges_over_existing_entries() {
        let catalog = TopicCatalog::default();
        let key = AggTopicKey::new("All/Temp", "AVG", "1h");
        catalog.insert_agg_topic(key.clone(), 3);
        assert_eq!(catalog.agg_topic_id(&key), Some(3));

        let mut refreshed = HashMap::new();
        refreshed.insert(AggTopicKey::new("all/temp", "avg", "1h"), 3);
        refreshed.insert(AggTopicKey::new("all/rh", "avg", "1h"), 4);
        catalog.merge_agg_map(refreshed);
        assert_eq!(
            catalog.agg_topic_id(&AggTopicKey::new("ALL/RH", "avg", "1h")),
            Some(4)
        );
    }

    #[test]
    fn topics_metadata_keys_results_by_requested_spelling() {
        let catalog = TopicCatalog::default();
        let mut update = CatalogUpdate::default();
        update.record_topic("device/temp".to_string(), 1, "Device/Temp".to_string());
        let mut meta = serde_json::Map::new();
        meta.insert("unit".to_string(), serde_json::Value::String("C".to_string()));
        update.record_meta(1, meta.clone());
        catalog.apply(update);

        let out = catalog.topics_metadata(&["DEVICE/TEMP".to_string(), "other".to_string()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("DEVICE/TEMP"), Some(&meta));
    }
}
