use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistorianError {
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("statement error: {message}")]
    Statement { message: String },
    #[error("database locked: {message}")]
    LockContention { message: String },
    #[error("invalid input: {message}")]
    Invalid { message: String },
}

impl HistorianError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
        }
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::LockContention {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

pub type HistorianResult<T> = Result<T, HistorianError>;

fn describes_lock_contention(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("lock wait timeout")
        || message.contains("could not obtain lock")
}

impl From<sea_orm::DbErr> for HistorianError {
    fn from(value: sea_orm::DbErr) -> Self {
        let message = value.to_string();
        if describes_lock_contention(&message) {
            return HistorianError::LockContention { message };
        }
        match value {
            sea_orm::DbErr::Conn(_) | sea_orm::DbErr::ConnectionAcquire(_) => {
                HistorianError::Connection { message }
            }
            _ => HistorianError::Statement { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HistorianError;

    #[test]
    fn helper_constructors_set_variants() {
        let err = HistorianError::connection("refused");
        assert!(matches!(err, HistorianError::Connection { .. }));
        let err = HistorianError::statement("syntax");
        assert!(matches!(err, HistorianError::Statement { .. }));
        let err = HistorianError::locked("busy");
        assert!(err.is_lock_contention());
        let err = HistorianError::invalid("bad period");
        assert!(matches!(err, HistorianError::Invalid { .. }));
    }

    #[test]
    fn lock_contention_is_classified_from_backend_errors() {
        let err = HistorianError::from(sea_orm::DbErr::Custom(
            "error returned from database: database is locked".to_string(),
        ));
        assert!(err.is_lock_contention());

        let err = HistorianError::from(sea_orm::DbErr::Custom("syntax error".to_string()));
        assert!(matches!(err, HistorianError::Statement { .. }));
    }
}
