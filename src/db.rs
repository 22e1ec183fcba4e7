use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;

use crate::errors::StoreError;
use crate::schema::download_token;
use crate::schema::download_token::dsl;
use crate::store::TokenStore;
use crate::token::{DownloadToken, TokenPatch};

embed_migrations!("migrations");

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[table_name = "download_token"]
#[primary_key(token)]
#[changeset_options(treat_none_as_null = "true")]
struct TokenRow {
    token: String,
    order_id: Option<String>,
    file_path: String,
    file_name: String,
    created_at: NaiveDateTime,
    expires_in_minutes: i64,
    expires_at: NaiveDateTime,
    download_started: bool,
    started_at: Option<NaiveDateTime>,
    download_completed: bool,
    completed_at: Option<NaiveDateTime>,
}

fn utc(dt: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&dt)
}

impl From<TokenRow> for DownloadToken {
    fn from(row: TokenRow) -> Self {
        DownloadToken {
            token: row.token,
            file_path: row.file_path,
            file_name: row.file_name,
            order_id: row.order_id,
            created_at: utc(row.created_at),
            expires_in_minutes: row.expires_in_minutes,
            expires_at: utc(row.expires_at),
            download_started: row.download_started,
            started_at: row.started_at.map(utc),
            download_completed: row.download_completed,
            completed_at: row.completed_at.map(utc),
        }
    }
}

impl From<&DownloadToken> for TokenRow {
    fn from(tok: &DownloadToken) -> Self {
        TokenRow {
            token: tok.token.clone(),
            order_id: tok.order_id.clone(),
            file_path: tok.file_path.clone(),
            file_name: tok.file_name.clone(),
            created_at: tok.created_at.naive_utc(),
            expires_in_minutes: tok.expires_in_minutes,
            expires_at: tok.expires_at.naive_utc(),
            download_started: tok.download_started,
            started_at: tok.started_at.map(|t| t.naive_utc()),
            download_completed: tok.download_completed,
            completed_at: tok.completed_at.map(|t| t.naive_utc()),
        }
    }
}

/// Tokens as rows of the `download_token` table.
///
/// A single connection is shared behind a mutex, so there is only ever one
/// writer at a time.
pub struct SqliteTokenStore {
    conn: Mutex<SqliteConnection>,
}

impl SqliteTokenStore {
    /// Open (or create) the database at `database_url` and bring the schema
    /// up to date.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let conn = SqliteConnection::establish(database_url)?;
        embedded_migrations::run(&conn)?;
        Ok(SqliteTokenStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, SqliteConnection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl TokenStore for SqliteTokenStore {
    fn insert(&self, tok: &DownloadToken) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let row = TokenRow::from(tok);
        match diesel::insert_into(dsl::download_token)
            .values(&row)
            .execute(&*conn)
        {
            Ok(_) => Ok(()),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(StoreError::AlreadyExists(tok.token.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn find(&self, tok: &str) -> Result<Option<DownloadToken>, StoreError> {
        let conn = self.conn()?;
        let row = dsl::download_token
            .find(tok)
            .first::<TokenRow>(&*conn)
            .optional()?;
        Ok(row.map(DownloadToken::from))
    }

    fn update(&self, tok: &str, patch: &TokenPatch) -> Result<DownloadToken, StoreError> {
        let conn = self.conn()?;
        conn.transaction::<_, StoreError, _>(|| {
            let mut current: DownloadToken = match dsl::download_token
                .find(tok)
                .first::<TokenRow>(&*conn)
                .optional()?
            {
                Some(row) => row.into(),
                None => return Err(StoreError::NotFound(tok.to_string())),
            };
            if patch.is_empty() {
                return Ok(current);
            }
            patch.apply_to(&mut current);
            diesel::update(dsl::download_token.find(tok))
                .set(&TokenRow::from(&current))
                .execute(&*conn)?;
            Ok(current)
        })
    }

    fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let cutoff = cutoff.naive_utc();
        conn.transaction::<_, StoreError, _>(|| {
            let expired = diesel::delete(dsl::download_token.filter(dsl::expires_at.lt(cutoff)))
                .execute(&*conn)?;
            let completed = diesel::delete(
                dsl::download_token
                    .filter(dsl::download_completed.eq(true))
                    .filter(dsl::completed_at.lt(cutoff)),
            )
            .execute(&*conn)?;
            Ok(expired + completed)
        })
    }
}
