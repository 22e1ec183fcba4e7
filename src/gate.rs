use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::http::Status;
use thiserror::Error;

use crate::errors::StoreError;
use crate::object_store::{ObjectError, ObjectStore, StoredObject};
use crate::store::TokenStore;
use crate::token::DownloadToken;

/// Every reason the gate can refuse to release a file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid download token")]
    InvalidToken,

    #[error("This download link has already been used")]
    AlreadyUsed,

    #[error("This download link has expired")]
    Expired,

    #[error("File not found")]
    FileNotFound,

    #[error("Download tokens are unavailable")]
    Persistence,

    #[error("File storage is unavailable")]
    UpstreamUnavailable,
}

impl Rejection {
    pub fn status(&self) -> Status {
        match self {
            Rejection::MissingParameter(_) => Status::BadRequest,
            Rejection::InvalidToken | Rejection::AlreadyUsed | Rejection::Expired => {
                Status::Forbidden
            }
            Rejection::FileNotFound => Status::NotFound,
            Rejection::Persistence | Rejection::UpstreamUnavailable => {
                Status::InternalServerError
            }
        }
    }
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            Rejection::InvalidToken
        } else {
            log::error!("token store failure: {:?}", err);
            Rejection::Persistence
        }
    }
}

impl From<ObjectError> for Rejection {
    fn from(err: ObjectError) -> Self {
        match err {
            ObjectError::NotFound(key) => {
                log::warn!("object {} is gone from storage", key);
                Rejection::FileNotFound
            }
            err => {
                log::error!("object store failure: {:?}", err);
                Rejection::UpstreamUnavailable
            }
        }
    }
}

/// A granted download: the token it was granted for and the bytes to send.
#[derive(Debug)]
pub struct Download {
    pub token: DownloadToken,
    pub object: StoredObject,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Both query parameters must be there before anything is looked up.
pub fn require_params<'a>(
    token: Option<&'a str>,
    file: Option<&'a str>,
) -> Result<(&'a str, &'a str), Rejection> {
    let token = present(token).ok_or(Rejection::MissingParameter("token"))?;
    let file = present(file).ok_or(Rejection::MissingParameter("file"))?;
    Ok((token, file))
}

/// Check a token against the store without touching it.
///
/// Expiry is checked before use, so a link past its deadline always reports
/// `Expired`.
pub fn authorize(
    store: &dyn TokenStore,
    token: &str,
    file: &str,
    now: DateTime<Utc>,
) -> Result<DownloadToken, Rejection> {
    let found = store.find(token)?.ok_or(Rejection::InvalidToken)?;
    if found.file_name != file {
        log::warn!(
            "token {} is for {:?}, not {:?}",
            found.token,
            found.file_name,
            file
        );
        return Err(Rejection::InvalidToken);
    }
    if found.is_expired_at(now) {
        return Err(Rejection::Expired);
    }
    if found.download_completed {
        return Err(Rejection::AlreadyUsed);
    }
    Ok(found)
}

/// Validate the token and open the file it grants.
///
/// Never marks the token as completed; that is the tracker's job once the
/// client confirms the transfer.
pub async fn serve(
    store: Arc<dyn TokenStore>,
    objects: &dyn ObjectStore,
    token: Option<&str>,
    file: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Download, Rejection> {
    let (token, file) = require_params(token, file)?;
    let (token, file) = (token.to_string(), file.to_string());

    let granted = tokio::task::spawn_blocking(move || authorize(&*store, &token, &file, now))
        .await
        .map_err(|err| {
            log::error!("token lookup task failed: {:?}", err);
            Rejection::Persistence
        })??;

    let object = objects.fetch(&granted.file_path).await?;
    log::info!(
        "serving {} for token {} (order {:?})",
        granted.file_path,
        granted.token,
        granted.order_id
    );
    Ok(Download {
        token: granted,
        object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_store::JsonFileStore;
    use crate::object_store::LocalObjectStore;
    use crate::token::TokenPatch;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lookups so tests can tell whether the store was consulted.
    struct CountingStore {
        inner: JsonFileStore,
        finds: AtomicUsize,
    }

    impl TokenStore for CountingStore {
        fn insert(&self, token: &DownloadToken) -> Result<(), StoreError> {
            self.inner.insert(token)
        }
        fn find(&self, token: &str) -> Result<Option<DownloadToken>, StoreError> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            self.inner.find(token)
        }
        fn update(&self, token: &str, patch: &TokenPatch) -> Result<DownloadToken, StoreError> {
            self.inner.update(token, patch)
        }
        fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.purge(cutoff)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<CountingStore>,
        objects: LocalObjectStore,
        t0: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/album.zip"), b"PK zipped album").unwrap();
        let store = Arc::new(CountingStore {
            inner: JsonFileStore::new(dir.path().join("tokens.json")),
            finds: AtomicUsize::new(0),
        });
        let t0 = Utc.ymd(2022, 10, 1).and_hms(20, 0, 0);
        store
            .insert(&DownloadToken::new(
                "tok-1".to_string(),
                "album.zip".to_string(),
                "album.zip".to_string(),
                Some("order-7".to_string()),
                t0,
                60,
            ))
            .unwrap();
        store
            .insert(&DownloadToken::new(
                "tok-gone".to_string(),
                "bonus.zip".to_string(),
                "bonus.zip".to_string(),
                None,
                t0,
                60,
            ))
            .unwrap();
        let objects = LocalObjectStore::new(dir.path().join("files"));
        Fixture {
            _dir: dir,
            store,
            objects,
            t0,
        }
    }

    async fn serve_at(
        fx: &Fixture,
        token: Option<&str>,
        file: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Download, Rejection> {
        serve(fx.store.clone(), &fx.objects, token, file, now).await
    }

    #[rocket::async_test]
    async fn missing_params_are_rejected_before_lookup() {
        let fx = fixture();
        let now = fx.t0;
        for (tok, file, missing) in [
            (None, Some("album.zip"), "token"),
            (Some("tok-1"), None, "file"),
            (Some(""), Some("album.zip"), "token"),
            (Some("tok-1"), Some("  "), "file"),
        ] {
            let err = serve_at(&fx, tok, file, now).await.unwrap_err();
            assert_eq!(err, Rejection::MissingParameter(missing));
            assert_eq!(err.status(), Status::BadRequest);
        }
        assert_eq!(fx.store.finds.load(Ordering::SeqCst), 0);
    }

    #[rocket::async_test]
    async fn unknown_token_is_invalid() {
        let fx = fixture();
        let err = serve_at(&fx, Some("who"), Some("album.zip"), fx.t0)
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::InvalidToken);
        assert_eq!(err.status(), Status::Forbidden);
    }

    #[rocket::async_test]
    async fn token_for_another_file_is_invalid() {
        let fx = fixture();
        let err = serve_at(&fx, Some("tok-1"), Some("bonus.zip"), fx.t0)
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::InvalidToken);
    }

    #[rocket::async_test]
    async fn valid_until_the_expiry_window_closes() {
        let fx = fixture();
        let ok = serve_at(
            &fx,
            Some("tok-1"),
            Some("album.zip"),
            fx.t0 + Duration::minutes(59),
        )
        .await
        .unwrap();
        assert_eq!(ok.token.order_id.as_deref(), Some("order-7"));
        assert_eq!(ok.object.size, Some(15));

        let err = serve_at(
            &fx,
            Some("tok-1"),
            Some("album.zip"),
            fx.t0 + Duration::minutes(61),
        )
        .await
        .unwrap_err();
        assert_eq!(err, Rejection::Expired);
    }

    #[rocket::async_test]
    async fn expiry_wins_over_completion() {
        let fx = fixture();
        fx.store
            .update("tok-1", &TokenPatch::completed(fx.t0))
            .unwrap();
        let err = serve_at(&fx, Some("tok-1"), Some("album.zip"), fx.t0 + Duration::hours(1))
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::Expired);
    }

    #[rocket::async_test]
    async fn completed_token_is_already_used() {
        let fx = fixture();
        fx.store
            .update("tok-1", &TokenPatch::completed(fx.t0))
            .unwrap();
        let err = serve_at(&fx, Some("tok-1"), Some("album.zip"), fx.t0 + Duration::minutes(5))
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::AlreadyUsed);
    }

    #[rocket::async_test]
    async fn serving_does_not_complete_the_token() {
        let fx = fixture();
        serve_at(&fx, Some("tok-1"), Some("album.zip"), fx.t0)
            .await
            .unwrap();
        let stored = fx.store.find("tok-1").unwrap().unwrap();
        assert!(!stored.download_completed);
        serve_at(&fx, Some("tok-1"), Some("album.zip"), fx.t0)
            .await
            .unwrap();
    }

    #[rocket::async_test]
    async fn missing_object_is_file_not_found() {
        let fx = fixture();
        let err = serve_at(&fx, Some("tok-gone"), Some("bonus.zip"), fx.t0)
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::FileNotFound);
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn store_errors_map_to_statuses() {
        assert_eq!(
            Rejection::from(StoreError::NotFound("x".into())),
            Rejection::InvalidToken
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let rej = Rejection::from(StoreError::IoError(io));
        assert_eq!(rej, Rejection::Persistence);
        assert_eq!(rej.status(), Status::InternalServerError);
    }
}
