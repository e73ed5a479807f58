use std::path::Path;
use std::time::Duration;

use sea_orm::{
    ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, TransactionTrait,
};

use historian_core::{HistorianError, HistorianResult};

use crate::config::{ConnectionConfig, PoolConfig};

/// One physical connection and at most one open transaction, exclusively
/// owned by a single execution context. The query and publish contexts each
/// hold their own manager; a manager is never shared between contexts.
#[derive(Debug)]
pub struct ConnectionManager {
    options: ConnectOptions,
    conn: Option<DatabaseConnection>,
    tx: Option<DatabaseTransaction>,
}

impl ConnectionManager {
    pub fn new(connection: &ConnectionConfig, pool: Option<&PoolConfig>, base_dir: &Path) -> Self {
        let mut options = ConnectOptions::new(connection.connection_url(base_dir));
        // The calling context owns exactly one physical connection.
        options.max_connections(1).min_connections(0);
        if let Some(timeout_ms) = connection.statement_timeout_ms() {
            options.acquire_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(pool) = pool {
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        options.sqlx_logging(false);
        Self {
            options,
            conn: None,
            tx: None,
        }
    }

    /// The open transaction for this context, beginning one if needed. If a
    /// transaction cannot be opened on the existing connection, the
    /// connection is discarded and re-established once before giving up.
    pub async fn cursor(&mut self) -> HistorianResult<&DatabaseTransaction> {
        if self.tx.is_none() {
            let tx = self.open_transaction().await?;
            self.tx = Some(tx);
        }
        self.tx
            .as_ref()
            .ok_or_else(|| HistorianError::connection("no open transaction"))
    }

    async fn open_transaction(&mut self) -> HistorianResult<DatabaseTransaction> {
        if let Some(conn) = &self.conn {
            match conn.begin().await {
                Ok(tx) => return Ok(tx),
                Err(err) => {
                    log::warn!(
                        "an error occurred while opening a transaction ({err}); \
                         will try establishing the connection again"
                    );
                    self.conn = None;
                }
            }
        }
        let conn = Database::connect(self.options.clone()).await.map_err(|err| {
            log::error!("could not connect to database: {err}");
            HistorianError::connection(format!("could not connect to database: {err}"))
        })?;
        let tx = conn.begin().await?;
        self.conn = Some(conn);
        Ok(tx)
    }

    /// Commit the open transaction. Returns `Ok(false)` when there is
    /// nothing to commit. A commit rejected because the store reports lock
    /// contention is logged with remediation guidance and surfaced to the
    /// caller, who decides whether to retry the batch.
    pub async fn commit(&mut self) -> HistorianResult<bool> {
        let Some(tx) = self.tx.take() else {
            log::warn!("connection had no open transaction during commit phase");
            return Ok(false);
        };
        match tx.commit().await {
            Ok(()) => Ok(true),
            Err(err) => {
                let err = HistorianError::from(err);
                if err.is_lock_contention() {
                    log::error!(
                        "commit failed because the database reports it is locked. This can \
                         happen when simultaneous read and write requests make individual \
                         requests wait longer than the backend timeout. If this store serves \
                         frequent reads and writes, configure a higher timeout in the \
                         connection params (for sqlite: connection.params.timeout_ms)."
                    );
                }
                Err(err)
            }
        }
    }

    /// Roll back the open transaction. Returns `Ok(false)` when there is
    /// nothing to roll back.
    pub async fn rollback(&mut self) -> HistorianResult<bool> {
        let Some(tx) = self.tx.take() else {
            log::warn!("connection had no open transaction during rollback phase");
            return Ok(false);
        };
        tx.rollback().await?;
        Ok(true)
    }

    /// Release the cursor after a read-only operation; errors at this point
    /// do not indicate a defect and are only logged.
    pub async fn release(&mut self) {
        if self.tx.is_some() {
            if let Err(err) = self.rollback().await {
                log::warn!("an error was raised while releasing the cursor and is being ignored: {err}");
            }
        }
    }

    /// Close the physical connection if one is open.
    pub async fn close(&mut self) {
        self.tx = None;
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.close().await {
                log::warn!("error while closing database connection: {err}");
            }
        }
    }
}
