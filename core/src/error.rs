use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Stale write on {entity} '{id}': expected version {expected}")]
    StaleWrite {
        entity: &'static str,
        id: Uuid,
        expected: i64,
    },

    #[error("Illegal {entity} transition: {from} -> {to}")]
    StateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Usage limit '{limit}' exceeded: {used} used + {requested} requested > {cap}")]
    LimitExceeded {
        limit: &'static str,
        used: i64,
        requested: i64,
        cap: i64,
    },

    #[error("Plan '{plan_id}' is not available for new subscriptions")]
    InvalidPlan { plan_id: Uuid },

    #[error("User '{user_id}' already holds an active subscription")]
    DuplicateActiveSubscription { user_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Caller-facing error classes. Every `LedgerError` maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    StateTransition,
    LimitExceeded,
    Storage,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::InvalidPlan { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. }
            | Self::StaleWrite { .. }
            | Self::DuplicateActiveSubscription { .. } => ErrorKind::Conflict,
            Self::StateTransition { .. } => ErrorKind::StateTransition,
            Self::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            Self::Database(_) | Self::Serialization(_) | Self::Other(_) => ErrorKind::Storage,
        }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Reclassify a SQLite constraint failure raised while writing `entity`.
    /// Anything that is not a constraint violation passes through unchanged.
    pub fn from_constraint(err: rusqlite::Error, entity: &'static str) -> Self {
        use rusqlite::ffi;
        if let rusqlite::Error::SqliteFailure(ref code, ref msg) = err {
            let detail = msg.clone().unwrap_or_default();
            match code.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return Self::Conflict {
                        reason: format!("duplicate {entity}: {detail}"),
                    };
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return Self::NotFound {
                        entity,
                        id: format!("parent reference ({detail})"),
                    };
                }
                ffi::SQLITE_CONSTRAINT_CHECK | ffi::SQLITE_CONSTRAINT_NOTNULL => {
                    return Self::Validation {
                        field: entity,
                        reason: detail,
                    };
                }
                _ => {}
            }
        }
        Self::Database(err)
    }
}
