use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::{MerchError, Result};
use crate::store::TokenStore;
use crate::token::{expiry_deadline, DownloadToken};

/// What the fulfillment side asks for when an order contains a digital item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub file_name: String,
    /// key in the object store, same as the file name when absent
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub expires_in_minutes: Option<i64>,
}

fn is_relative_key(key: &str) -> bool {
    !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Create and persist a fresh token for `grant`.
pub fn issue(
    store: &dyn TokenStore,
    grant: Grant,
    default_expires_in_minutes: i64,
    now: DateTime<Utc>,
) -> Result<DownloadToken> {
    let file_name = grant.file_name.trim().to_string();
    if file_name.is_empty() {
        return Err(MerchError::InvalidGrant("fileName is required".to_string()));
    }
    if file_name.contains('/') || file_name.contains('\\') {
        return Err(MerchError::InvalidGrant(format!(
            "fileName {:?} must not contain path separators",
            file_name
        )));
    }
    let file_path = grant.file_path.unwrap_or_else(|| file_name.clone());
    if !is_relative_key(&file_path) {
        return Err(MerchError::InvalidGrant(format!(
            "filePath {:?} must be a relative path",
            file_path
        )));
    }
    let expires_in_minutes = grant
        .expires_in_minutes
        .unwrap_or(default_expires_in_minutes);
    if expires_in_minutes <= 0 {
        return Err(MerchError::InvalidGrant(format!(
            "expiresInMinutes must be positive, got {}",
            expires_in_minutes
        )));
    }
    if expiry_deadline(now, expires_in_minutes).is_none() {
        return Err(MerchError::InvalidGrant(format!(
            "expiresInMinutes {} is too far in the future",
            expires_in_minutes
        )));
    }

    let token = DownloadToken::new(
        Uuid::new_v4().to_string(),
        file_name,
        file_path,
        grant.order_id,
        now,
        expires_in_minutes,
    );
    store.insert(&token)?;
    log::info!(
        "issued token {} for {} (order {:?}), expires at {}",
        token.token,
        token.file_path,
        token.order_id,
        token.expires_at
    );
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_store::JsonFileStore;
    use chrono::Duration;

    fn grant(file_name: &str) -> Grant {
        Grant {
            file_name: file_name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn issues_with_default_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("tokens.json"));
        let now = Utc::now();

        let tok = issue(&store, grant("album.zip"), 60, now).unwrap();
        assert_eq!(tok.file_path, "album.zip");
        assert_eq!(tok.expires_at, now + Duration::minutes(60));
        assert!(tok.is_valid_at(now));
        assert_eq!(store.find(&tok.token).unwrap(), Some(tok));
    }

    #[test]
    fn every_grant_gets_its_own_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("tokens.json"));
        let now = Utc::now();
        let g = Grant {
            file_name: "live.flac".to_string(),
            file_path: Some("shows/2022/live.flac".to_string()),
            order_id: Some("order-1".to_string()),
            expires_in_minutes: Some(15),
        };
        let a = issue(&store, g.clone(), 60, now).unwrap();
        let b = issue(&store, g, 60, now).unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(a.expires_in_minutes, 15);
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[test]
    fn rejects_bad_grants() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("tokens.json"));
        let now = Utc::now();
        let bad = vec![
            grant(""),
            grant("../album.zip"),
            Grant {
                file_path: Some("/etc/passwd".to_string()),
                ..grant("passwd")
            },
            Grant {
                file_path: Some("a/../../b".to_string()),
                ..grant("b")
            },
            Grant {
                expires_in_minutes: Some(0),
                ..grant("album.zip")
            },
            Grant {
                expires_in_minutes: Some(1_000_000_000_000),
                ..grant("album.zip")
            },
            Grant {
                expires_in_minutes: Some(i64::MAX),
                ..grant("album.zip")
            },
        ];
        for g in bad {
            match issue(&store, g.clone(), 60, now) {
                Err(MerchError::InvalidGrant(_)) => (),
                other => panic!("expected InvalidGrant for {:?}, got {:?}", g, other),
            }
        }
        assert!(store.all().unwrap().is_empty());
    }
}
