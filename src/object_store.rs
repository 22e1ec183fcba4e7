use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use rocket::http::ContentType;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncRead;

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store unavailable for {key}: {source}")]
    Unavailable {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Bytes of a stored object, ready to be streamed.
pub struct StoredObject {
    pub content_type: ContentType,
    pub size: Option<u64>,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish()
    }
}

/// Where the deliverables live, keyed by object name.
#[rocket::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<StoredObject, ObjectError>;
}

/// Objects are plain files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Self {
        LocalObjectStore { root }
    }

    /// Map a key to a path under the root, refusing anything that could
    /// escape it.
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.root.join(rel))
    }
}

pub fn content_type_for(key: &str) -> ContentType {
    Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ContentType::from_extension)
        .unwrap_or(ContentType::Binary)
}

#[rocket::async_trait]
impl ObjectStore for LocalObjectStore {
    async fn fetch(&self, key: &str) -> Result<StoredObject, ObjectError> {
        let path = match self.resolve(key) {
            Some(p) => p,
            None => {
                log::warn!("refusing to resolve object key {:?}", key);
                return Err(ObjectError::NotFound(key.to_string()));
            }
        };

        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ObjectError::NotFound(key.to_string()))
            }
            Err(err) => {
                return Err(ObjectError::Unavailable {
                    key: key.to_string(),
                    source: err,
                })
            }
        };
        let meta = file.metadata().await.map_err(|err| ObjectError::Unavailable {
            key: key.to_string(),
            source: err,
        })?;
        if !meta.is_file() {
            return Err(ObjectError::NotFound(key.to_string()));
        }

        Ok(StoredObject {
            content_type: content_type_for(key),
            size: Some(meta.len()),
            body: Box::new(file),
        })
    }
}
