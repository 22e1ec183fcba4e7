use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::conf::{AppConfig, TokenBackend};
use crate::db::SqliteTokenStore;
use crate::errors::StoreError;
use crate::json_store::JsonFileStore;
use crate::token::{DownloadToken, TokenPatch};

/// Durable home for download tokens, looked up by token value.
///
/// Calls are blocking; async callers should go through `spawn_blocking`.
pub trait TokenStore: Send + Sync {
    fn insert(&self, token: &DownloadToken) -> Result<(), StoreError>;

    fn find(&self, token: &str) -> Result<Option<DownloadToken>, StoreError>;

    /// Apply `patch` and persist, returning the token as stored afterward.
    fn update(&self, token: &str, patch: &TokenPatch) -> Result<DownloadToken, StoreError>;

    /// Delete tokens that expired, or were completed, before `cutoff`.
    /// Returns the number of deleted tokens.
    fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub fn open_store(conf: &AppConfig) -> Result<Arc<dyn TokenStore>, StoreError> {
    match conf.token_backend {
        TokenBackend::Sqlite => {
            log::info!("using sqlite token store at {}", conf.database_url);
            Ok(Arc::new(SqliteTokenStore::connect(&conf.database_url)?))
        }
        TokenBackend::Json => {
            log::info!(
                "using json token store at {}",
                conf.token_file.to_string_lossy()
            );
            Ok(Arc::new(JsonFileStore::new(conf.token_file.clone())))
        }
    }
}
