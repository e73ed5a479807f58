use sea_orm::sea_query::Alias;
use sea_orm::DeriveIden;

use crate::config::TablesConfig;

#[derive(DeriveIden, Clone, Copy)]
pub enum TopicsColumn {
    TopicId,
    TopicName,
    Metadata,
}

#[derive(DeriveIden, Clone, Copy)]
pub enum MetaColumn {
    TopicId,
    Metadata,
}

#[derive(DeriveIden, Clone, Copy)]
pub enum DataColumn {
    Ts,
    TopicId,
    ValueString,
}

#[derive(DeriveIden, Clone, Copy)]
pub enum AggTopicsColumn {
    AggTopicId,
    AggTopicName,
    AggType,
    AggTimePeriod,
}

#[derive(DeriveIden, Clone, Copy)]
pub enum AggMetaColumn {
    AggTopicId,
    Metadata,
}

#[derive(DeriveIden, Clone, Copy)]
pub enum AggDataColumn {
    Ts,
    AggTopicId,
    ValueString,
    TopicsList,
}

/// Resolved table names for one deployment: the configured base names with
/// the optional prefix applied. Aggregate data tables are named
/// `{agg_type}_{agg_period}` under the same prefix.
#[derive(Clone, Debug)]
pub struct TableNames {
    prefix: String,
    data: String,
    topics: String,
    meta: String,
    agg_topics: String,
    agg_meta: String,
}

impl TableNames {
    pub fn new(tables: &TablesConfig) -> Self {
        let prefix = match tables.table_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}_"),
            _ => String::new(),
        };
        Self {
            prefix,
            data: tables.data_table.clone(),
            topics: tables.topics_table.clone(),
            meta: tables.meta_table.clone(),
            agg_topics: tables.agg_topics_table.clone(),
            agg_meta: tables.agg_meta_table.clone(),
        }
    }

    fn resolve(&self, base: &str) -> Alias {
        Alias::new(format!("{}{}", self.prefix, base))
    }

    pub fn data(&self) -> Alias {
        self.resolve(&self.data)
    }

    pub fn topics(&self) -> Alias {
        self.resolve(&self.topics)
    }

    pub fn meta(&self) -> Alias {
        self.resolve(&self.meta)
    }

    pub fn agg_topics(&self) -> Alias {
        self.resolve(&self.agg_topics)
    }

    pub fn agg_meta(&self) -> Alias {
        self.resolve(&self.agg_meta)
    }

    /// Per-period aggregate storage, e.g. `avg_1h`.
    pub fn aggregate(&self, agg_type: &str, agg_period: &str) -> Alias {
        let base = format!(
            "{}_{}",
            sanitize_identifier(agg_type),
            sanitize_identifier(agg_period)
        );
        self.resolve(&base)
    }

    /// Index names must be unique per deployment, so they carry the resolved
    /// table name.
    pub fn index_name(&self, base: &str, suffix: &str) -> String {
        format!("idx_{}{}_{}", self.prefix, base, suffix)
    }

    pub fn data_index(&self) -> String {
        self.index_name(&self.data, "ts")
    }

    pub fn agg_topics_index(&self) -> String {
        self.index_name(&self.agg_topics, "identity")
    }

    pub fn aggregate_index(&self, agg_type: &str, agg_period: &str) -> String {
        let base = format!(
            "{}_{}",
            sanitize_identifier(agg_type),
            sanitize_identifier(agg_period)
        );
        self.index_name(&base, "slot")
    }

    /// Topics and metadata share one physical table.
    pub fn colocated(&self) -> bool {
        self.topics == self.meta
    }
}

fn sanitize_identifier(part: &str) -> String {
    part.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::TableNames;
    use crate::config::TablesConfig;
    use sea_orm::sea_query::Iden;

    #[test]
    fn prefix_is_applied_with_underscore() {
        let names = TableNames::new(&TablesConfig {
            table_prefix: Some("plant1".to_string()),
            ..TablesConfig::default()
        });
        assert_eq!(names.data().to_string(), "plant1_data");
        assert_eq!(names.topics().to_string(), "plant1_topics");
        assert_eq!(names.aggregate("avg", "1h").to_string(), "plant1_avg_1h");
    }

    #[test]
    fn default_names_have_no_prefix() {
        let names = TableNames::new(&TablesConfig::default());
        assert_eq!(names.data().to_string(), "data");
        assert_eq!(names.meta().to_string(), "meta");
        assert!(!names.colocated());
    }

    #[test]
    fn coinciding_topics_and_meta_tables_are_colocated() {
        let names = TableNames::new(&TablesConfig {
            meta_table: "topics".to_string(),
            ..TablesConfig::default()
        });
        assert!(names.colocated());
    }

    #[test]
    fn aggregate_names_reject_unsafe_characters() {
        let names = TableNames::new(&TablesConfig::default());
        assert_eq!(names.aggregate("AVG", "1 h;--").to_string(), "avg_1h");
    }
}
