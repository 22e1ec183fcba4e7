use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::store::TokenStore;
use crate::token::TokenPatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    /// The token was just marked as completed.
    Completed { completed_at: DateTime<Utc> },
    /// Already marked earlier, `completed_at` is the original mark (absent
    /// for records that only carried a used flag).
    AlreadyCompleted { completed_at: Option<DateTime<Utc>> },
    /// The token isn't known to this store, nothing to record.
    Noted,
}

impl CompletionResult {
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CompletionResult::Completed { completed_at } => Some(*completed_at),
            CompletionResult::AlreadyCompleted { completed_at } => *completed_at,
            CompletionResult::Noted => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CompletionResult::Completed { .. } => "Download marked as completed",
            CompletionResult::AlreadyCompleted { .. } => "Download was already marked as completed",
            CompletionResult::Noted => "Download noted",
        }
    }
}

/// Record that the client finished downloading the file behind `token`.
///
/// Safe to call repeatedly: only the first call stamps `completed_at`.
pub fn mark_completed(
    store: &dyn TokenStore,
    token: &str,
    now: DateTime<Utc>,
) -> Result<CompletionResult, StoreError> {
    let found = match store.find(token)? {
        Some(t) => t,
        None => {
            log::info!("completion for unknown token {}, nothing to record", token);
            return Ok(CompletionResult::Noted);
        }
    };
    if found.download_completed {
        return Ok(CompletionResult::AlreadyCompleted {
            completed_at: found.completed_at,
        });
    }

    match store.update(token, &TokenPatch::completed(now)) {
        Ok(updated) => {
            log::info!("token {} completed (order {:?})", token, updated.order_id);
            Ok(CompletionResult::Completed {
                completed_at: updated.completed_at.unwrap_or(now),
            })
        }
        // purged between the lookup and the write
        Err(err) if err.is_not_found() => Ok(CompletionResult::Noted),
        Err(err) => Err(err),
    }
}

/// Record the first time bytes were served for `token`. Later calls and
/// unknown tokens are no-ops.
pub fn mark_started(store: &dyn TokenStore, token: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
    match store.find(token)? {
        Some(t) if !t.download_started => {
            store.update(token, &TokenPatch::started(now))?;
            log::debug!("token {} started", token);
            Ok(())
        }
        _ => Ok(()),
    }
}
