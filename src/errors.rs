use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::response;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MerchError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Token not found: {0}")]
    NotFound(String),

    #[error("Token already exists: {0}")]
    AlreadyExists(String),

    #[error("database error {0:?}")]
    DbError(#[from] diesel::result::Error),

    #[error("database connection error {0:?}")]
    ConnectionError(#[from] diesel::result::ConnectionError),

    #[error("database migration error {0:?}")]
    MigrationError(#[from] diesel_migrations::RunMigrationsError),

    #[error("IO error on token file")]
    IoError(#[from] std::io::Error),

    #[error("malformed token file {0:?}")]
    JsonError(#[from] serde_json::Error),

    #[error("token store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Anything the caller cannot fix by changing its input.
    pub fn is_persistence(&self) -> bool {
        !matches!(self, StoreError::NotFound(_) | StoreError::AlreadyExists(_))
    }
}

#[derive(Error, Debug)]
pub enum MerchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid download grant: {0}")]
    InvalidGrant(String),

    #[error("configuration error {0}")]
    Config(#[from] figment::Error),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl<'r> response::Responder<'r, 'static> for MerchError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> response::Result<'static> {
        let (err_str, status) = match &self {
            MerchError::InvalidGrant(_) => (format!("{}", self), Status::BadRequest),
            MerchError::Store(StoreError::AlreadyExists(_)) => {
                (format!("{}", self), Status::Conflict)
            }
            MerchError::Store(StoreError::NotFound(_)) => (format!("{}", self), Status::NotFound),
            _ => {
                log::error!("got a generic error! {:?}", self);
                ("internal error".to_string(), Status::InternalServerError)
            }
        };
        response::Response::build()
            .sized_body(err_str.len(), Cursor::new(err_str))
            .status(status)
            .header(ContentType::Text)
            .ok()
    }
}
