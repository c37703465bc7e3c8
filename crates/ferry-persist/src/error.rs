use ferry_queue::StoreError;

/// Errors raised while opening a store
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Migration failed: {0}")]
    Migration(String),
}

#[cfg(feature = "sqlx")]
pub(crate) fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub(crate) fn parse_job_id(raw: &str) -> Result<uuid::Uuid, StoreError> {
    uuid::Uuid::parse_str(raw).map_err(|_| StoreError::Backend(format!("Invalid job id in DB: {raw}")))
}

/// Attempt counters are stored as signed integers
pub(crate) fn parse_count(column: &str, raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Backend(format!("Invalid {column} in DB: {raw}")))
}
