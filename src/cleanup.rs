use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::errors::StoreError;
use crate::store::TokenStore;

/// Delete tokens that expired, or were completed, more than `retention` ago.
pub fn cleanup_once(
    store: &dyn TokenStore,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<usize, StoreError> {
    log::debug!("cleaning up download tokens");
    let cutoff = now - retention;
    let n = store.purge(cutoff)?;
    log::info!("deleted a total of {} tokens older than {}", n, cutoff);
    Ok(n)
}

/// Run a cleanup right away, then every `every`. Failures are logged and the
/// loop keeps going.
pub async fn run_periodically(
    store: Arc<dyn TokenStore>,
    every: std::time::Duration,
    retention: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let store = store.clone();
        let result =
            tokio::task::spawn_blocking(move || cleanup_once(&*store, Utc::now(), retention))
                .await;
        match result {
            Ok(Ok(_)) => (),
            Ok(Err(err)) => log::error!("token cleanup failed: {:?}", err),
            Err(err) => log::error!("token cleanup task panicked: {:?}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteTokenStore;
    use crate::token::{DownloadToken, TokenPatch};

    fn tok(value: &str, created_at: DateTime<Utc>) -> DownloadToken {
        DownloadToken::new(
            value.to_string(),
            "a.zip".to_string(),
            "a.zip".to_string(),
            None,
            created_at,
            60,
        )
    }

    #[test]
    fn only_removes_tokens_past_retention() {
        let store = SqliteTokenStore::connect(":memory:").unwrap();
        let now = Utc::now();
        // expired two hours ago
        store.insert(&tok("recently-expired", now - Duration::hours(3))).unwrap();
        // expired nine days ago
        store.insert(&tok("ancient", now - Duration::days(9))).unwrap();
        store.insert(&tok("active", now)).unwrap();
        store.update("active", &TokenPatch::started(now)).unwrap();

        let n = cleanup_once(&store, now, Duration::days(7)).unwrap();
        assert_eq!(n, 1);
        assert!(store.find("ancient").unwrap().is_none());
        assert!(store.find("recently-expired").unwrap().is_some());
        assert!(store.find("active").unwrap().is_some());
    }
}
