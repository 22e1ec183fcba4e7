use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// beyond this chrono can't hold the window as a Duration
const MAX_WINDOW_MINUTES: i64 = i64::MAX / 60_000;

/// When a token created at `created_at` and valid for `minutes` expires, or
/// `None` if that instant can't be represented.
pub fn expiry_deadline(created_at: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    if minutes.checked_abs()? > MAX_WINDOW_MINUTES {
        return None;
    }
    created_at.checked_add_signed(Duration::minutes(minutes))
}

/// A one-time grant to download a single file.
///
/// The serialized shape (camelCase) is the on-disk layout of the JSON token
/// file, and also what the admin API returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "StoredToken")]
pub struct DownloadToken {
    pub token: String,
    pub file_path: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_in_minutes: i64,
    pub expires_at: DateTime<Utc>,
    pub download_started: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub download_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Token entries as found in token files, old ones included.
///
/// Older files carry only one of `expiresAt` / `expiresInMinutes`, and a
/// coarse `isUsed` flag instead of `downloadCompleted`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredToken {
    token: String,
    file_path: String,
    file_name: String,
    #[serde(default)]
    order_id: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    expires_in_minutes: Option<i64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    download_started: bool,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    download_completed: bool,
    #[serde(default)]
    is_used: bool,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StoredToken> for DownloadToken {
    type Error = String;

    fn try_from(raw: StoredToken) -> Result<Self, Self::Error> {
        let (expires_in_minutes, expires_at) = match (raw.expires_in_minutes, raw.expires_at) {
            (Some(minutes), Some(at)) => (minutes, at),
            (None, Some(at)) => ((at - raw.created_at).num_minutes(), at),
            (Some(minutes), None) => {
                let at = expiry_deadline(raw.created_at, minutes).ok_or_else(|| {
                    format!(
                        "token {}: expiresInMinutes {} is out of range",
                        raw.token, minutes
                    )
                })?;
                (minutes, at)
            }
            (None, None) => {
                return Err(format!(
                    "token {} has neither expiresAt nor expiresInMinutes",
                    raw.token
                ))
            }
        };
        Ok(DownloadToken {
            token: raw.token,
            file_path: raw.file_path,
            file_name: raw.file_name,
            order_id: raw.order_id,
            created_at: raw.created_at,
            expires_in_minutes,
            expires_at,
            download_started: raw.download_started,
            started_at: raw.started_at,
            download_completed: raw.download_completed || raw.is_used,
            completed_at: raw.completed_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Issued,
    Started,
    Completed,
    Expired,
}

impl DownloadToken {
    /// A fresh token. A window too large to represent expires at creation,
    /// callers validate with [`expiry_deadline`] first.
    pub fn new(
        token: String,
        file_name: String,
        file_path: String,
        order_id: Option<String>,
        created_at: DateTime<Utc>,
        expires_in_minutes: i64,
    ) -> Self {
        DownloadToken {
            token,
            file_path,
            file_name,
            order_id,
            created_at,
            expires_in_minutes,
            expires_at: expiry_deadline(created_at, expires_in_minutes).unwrap_or(created_at),
            download_started: false,
            started_at: None,
            download_completed: false,
            completed_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now) && !self.download_completed
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> TokenState {
        if self.download_completed {
            TokenState::Completed
        } else if self.is_expired_at(now) {
            TokenState::Expired
        } else if self.download_started {
            TokenState::Started
        } else {
            TokenState::Issued
        }
    }
}

/// Partial update of the mutable part of a token.
///
/// Both flags only ever move from false to true: applying a patch to a token
/// that already carries a flag keeps the original timestamp.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TokenPatch {
    pub fn started(at: DateTime<Utc>) -> Self {
        TokenPatch {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn completed(at: DateTime<Utc>) -> Self {
        TokenPatch {
            completed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.started_at.is_none() && self.completed_at.is_none()
    }

    pub fn apply_to(&self, token: &mut DownloadToken) {
        if let Some(at) = self.started_at {
            if !token.download_started {
                token.download_started = true;
                token.started_at = Some(at);
            }
        }
        if let Some(at) = self.completed_at {
            if !token.download_completed {
                token.download_completed = true;
                token.completed_at = Some(at);
            }
        }
    }
}
