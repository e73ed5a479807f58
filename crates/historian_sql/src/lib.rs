pub mod backend;
pub mod cache;
pub mod config;
pub mod connection;
mod db;
pub mod store;

pub use historian_core::*;

pub use backend::{DataInserter, HistorianBackend, MetaInserter, RangeRequest, SqlBackend};
pub use cache::{CatalogUpdate, TopicCatalog};
pub use config::{
    ConnectionConfig, HistorianConfig, NetworkParams, PoolConfig, SqliteParams, TablesConfig,
};
pub use connection::ConnectionManager;
pub use db::TableNames;
pub use store::SqlHistorian;
