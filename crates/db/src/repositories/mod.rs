use mailroom_core::errors::StoreError;

pub mod event;
pub mod suggestion;
pub mod workflow_log;

pub use event::SqlEventStore;
pub use suggestion::SqlSuggestionStore;
pub use workflow_log::SqlWorkflowStore;

/// Map driver errors onto the storage-port error the core services
/// understand.
pub(crate) fn map_sqlx(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::RowNotFound => StoreError::NotFound(error.to_string()),
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            StoreError::DuplicateKey(db_error.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(error.to_string())
        }
        _ => StoreError::Unavailable(error.to_string()),
    }
}

pub(crate) fn decode<T>(result: Result<T, sqlx::Error>) -> Result<T, StoreError> {
    result.map_err(|error| StoreError::Decode(error.to_string()))
}
