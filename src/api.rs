use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::figment::Figment;
use rocket::http::{ContentType, Header, RawStr, Status};
use rocket::outcome::Outcome;
use rocket::serde::json::{self, Json};
use rocket::serde::{Deserialize, Serialize};
use rocket::{request, response, Build, Request, Rocket, State};
use scrypt::password_hash::{PasswordHash, PasswordVerifier};
use scrypt::Scrypt;

use crate::conf::AppConfig;
use crate::errors::{self, StoreError};
use crate::gate::{self, Download, Rejection};
use crate::issuer::{self, Grant};
use crate::object_store::{LocalObjectStore, ObjectStore};
use crate::rate_limit::{Decision, FixedWindowLimiter, RateLimiter};
use crate::store::{self, TokenStore};
use crate::token::{DownloadToken, TokenState};
use crate::tracker;

/// Everything the routes share.
pub struct AppState {
    pub config: AppConfig,
    pub tokens: Arc<dyn TokenStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub limiter: Arc<dyn RateLimiter>,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> Result<Self, StoreError> {
        let tokens = store::open_store(&config)?;
        let objects = Arc::new(LocalObjectStore::new(config.root_path.clone()));
        let limiter = Arc::new(FixedWindowLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_window(),
        ));
        Ok(AppState {
            config,
            tokens,
            objects,
            limiter,
        })
    }
}

#[rocket::get("/")]
fn index() -> &'static str {
    "ok"
}

/// A file sent as a download, never cached.
pub struct Attachment(Download);

impl<'r> response::Responder<'r, 'static> for Attachment {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let Download { token, object } = self.0;
        let disposition = format!(
            "attachment; filename=\"{}\"",
            token.file_name.replace('"', "'")
        );
        response::Response::build()
            .header(object.content_type)
            .raw_header("Content-Disposition", disposition)
            .raw_header("Cache-Control", "no-cache")
            .streamed_body(object.body)
            .ok()
    }
}

impl<'r> response::Responder<'r, 'static> for Rejection {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let message = self.to_string();
        response::Response::build()
            .status(self.status())
            .header(ContentType::Text)
            .sized_body(message.len(), Cursor::new(message))
            .ok()
    }
}

/// Request guard counting the caller against the rate limiter.
pub struct Throttled;

// seconds until the caller may try again, read back by the 429 catcher
struct RetryAfter(Option<i64>);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for Throttled {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let state = match request.rocket().state::<AppState>() {
            Some(s) => s,
            None => return Outcome::Error((Status::InternalServerError, ())),
        };
        let client = request
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match state.limiter.check(&client, Utc::now()) {
            Decision::Allow { .. } => Outcome::Success(Throttled),
            Decision::Deny { retry_after } => {
                let secs = retry_after.num_seconds().max(1);
                request.local_cache(|| RetryAfter(Some(secs)));
                Outcome::Error((Status::TooManyRequests, ()))
            }
        }
    }
}

struct TooManyRequests(Option<i64>);

impl<'r> response::Responder<'r, 'static> for TooManyRequests {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let message = "Too many requests, slow down";
        let mut builder = response::Response::build();
        builder
            .status(Status::TooManyRequests)
            .header(ContentType::Text)
            .sized_body(message.len(), Cursor::new(message));
        if let Some(secs) = self.0 {
            builder.raw_header("Retry-After", secs.to_string());
        }
        builder.ok()
    }
}

#[rocket::catch(429)]
fn too_many_requests(request: &Request<'_>) -> TooManyRequests {
    TooManyRequests(request.local_cache(|| RetryAfter(None)).0)
}

#[rocket::get("/download?<token>&<file>")]
async fn download(
    token: Option<String>,
    file: Option<String>,
    _throttled: Throttled,
    state: &State<AppState>,
) -> Result<Attachment, Rejection> {
    let now = Utc::now();
    let granted = gate::serve(
        state.tokens.clone(),
        &*state.objects,
        token.as_deref(),
        file.as_deref(),
        now,
    )
    .await?;

    let tokens = state.tokens.clone();
    let tok = granted.token.token.clone();
    match tokio::task::spawn_blocking(move || tracker::mark_started(&*tokens, &tok, now)).await {
        Ok(Ok(())) => (),
        Ok(Err(err)) => log::error!(
            "could not record download start for {}: {:?}",
            granted.token.token,
            err
        ),
        Err(err) => log::error!("download start task failed: {:?}", err),
    }
    Ok(Attachment(granted))
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
struct MarkDownloaded {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
pub struct MarkDownloadedReply {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl MarkDownloadedReply {
    fn new(success: bool, message: &str, completed_at: Option<DateTime<Utc>>) -> Json<Self> {
        Json(MarkDownloadedReply {
            success,
            message: message.to_string(),
            completed_at,
        })
    }
}

/// Always answers 200: recording a completion is bookkeeping, the client
/// already has its file.
#[rocket::post("/mark-downloaded", data = "<body>")]
async fn mark_downloaded(
    body: Result<Json<MarkDownloaded>, json::Error<'_>>,
    _throttled: Throttled,
    state: &State<AppState>,
) -> Json<MarkDownloadedReply> {
    let token = match body {
        Ok(Json(MarkDownloaded { token: Some(t) })) if !t.trim().is_empty() => t,
        Ok(_) => return MarkDownloadedReply::new(false, "Missing token", None),
        Err(err) => {
            log::warn!("malformed mark-downloaded body: {:?}", err);
            return MarkDownloadedReply::new(false, "Malformed request body", None);
        }
    };

    let tokens = state.tokens.clone();
    let tok = token.clone();
    let result =
        tokio::task::spawn_blocking(move || tracker::mark_completed(&*tokens, &tok, Utc::now()))
            .await;
    match result {
        Ok(Ok(done)) => MarkDownloadedReply::new(true, done.message(), done.completed_at()),
        Ok(Err(err)) => {
            log::error!("could not record completion for {}: {:?}", token, err);
            MarkDownloadedReply::new(true, "Download noted", None)
        }
        Err(err) => {
            log::error!("completion task failed for {}: {:?}", token, err);
            MarkDownloadedReply::new(true, "Download noted", None)
        }
    }
}

struct RequiresBasicAuth;

impl<'r> response::Responder<'r, 'static> for RequiresBasicAuth {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        let hdr = Header::new("WWW-Authenticate", r#"Basic realm="merchdl""#);
        Ok(response::Response::build()
            .status(Status::Unauthorized)
            .header(hdr)
            .finalize())
    }
}

pub struct AdminUser;

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for AdminUser {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let state = match request.rocket().state::<AppState>() {
            Some(s) => s,
            None => return Outcome::Forward(Status::InternalServerError),
        };
        let encoded_creds = match request
            .headers()
            .get_one("Authorization")
            .and_then(|auth| auth.strip_prefix("Basic "))
        {
            Some(creds) => creds.to_string(),
            None => return Outcome::Forward(Status::Unauthorized),
        };
        let username = state.config.admin_username.clone();
        let phc = state.config.admin_phc.clone();

        // scrypt is deliberately slow, keep it off the async workers
        let valid = tokio::task::spawn_blocking(move || {
            is_basic_auth_valid(&username, phc.as_deref(), &encoded_creds)
        })
        .await
        .unwrap_or(false);
        if valid {
            log::debug!("auth is valid!");
            Outcome::Success(AdminUser)
        } else {
            log::debug!("auth is invalid!");
            Outcome::Forward(Status::Unauthorized)
        }
    }
}

fn is_basic_auth_valid(username: &str, phc: Option<&str>, encoded_creds: &str) -> bool {
    let f = || -> std::result::Result<(), Box<dyn std::error::Error>> {
        let phc = phc.ok_or("No admin password configured")?;
        let bytes = base64::decode(encoded_creds)?;
        let s = std::str::from_utf8(&bytes[..])?;
        let (user, password) = s.split_once(':').ok_or("Cannot find separator :")?;
        if user != username {
            return Err(format!("unknown user {}", user).into());
        }
        let parsed_hash = PasswordHash::new(phc)?;
        Scrypt.verify_password(password.as_bytes(), &parsed_hash)?;
        Ok(())
    };

    match f() {
        Ok(_) => true,
        Err(err) => {
            log::error!("{err:?}");
            false
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
pub struct IssuedToken {
    token: String,
    download_url: String,
    expires_at: DateTime<Utc>,
}

pub fn download_url(public_url: &str, token: &DownloadToken) -> String {
    format!(
        "{}/download?token={}&file={}",
        public_url.trim_end_matches('/'),
        RawStr::new(&token.token).percent_encode().as_str(),
        RawStr::new(&token.file_name).percent_encode().as_str()
    )
}

#[rocket::post("/tokens", data = "<grant>")]
async fn issue_token(
    grant: Json<Grant>,
    _admin: AdminUser,
    state: &State<AppState>,
) -> errors::Result<(Status, Json<IssuedToken>)> {
    let tokens = state.tokens.clone();
    let default_expiry = state.config.default_expires_in_minutes;
    let grant = grant.into_inner();
    let token = tokio::task::spawn_blocking(move || {
        issuer::issue(&*tokens, grant, default_expiry, Utc::now())
    })
    .await
    .map_err(anyhow::Error::from)??;

    Ok((
        Status::Created,
        Json(IssuedToken {
            download_url: download_url(&state.config.public_url, &token),
            token: token.token,
            expires_at: token.expires_at,
        }),
    ))
}

#[rocket::post("/tokens", rank = 2)]
fn issue_token_unauthorized() -> RequiresBasicAuth {
    RequiresBasicAuth
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct TokenView {
    #[serde(flatten)]
    token: DownloadToken,
    state: TokenState,
}

#[rocket::get("/tokens/<token>")]
async fn show_token(
    token: String,
    _admin: AdminUser,
    state: &State<AppState>,
) -> errors::Result<Option<Json<TokenView>>> {
    let tokens = state.tokens.clone();
    let found = tokio::task::spawn_blocking(move || tokens.find(&token))
        .await
        .map_err(anyhow::Error::from)?
        .map_err(errors::MerchError::from)?;
    Ok(found.map(|token| {
        let state = token.state_at(Utc::now());
        Json(TokenView { token, state })
    }))
}

#[rocket::get("/tokens/<_token>", rank = 2)]
fn show_token_unauthorized(_token: &str) -> RequiresBasicAuth {
    RequiresBasicAuth
}

/// Mount the routes on `rocket` with `state` as managed state.
pub fn mount(rocket: Rocket<Build>, state: AppState) -> Rocket<Build> {
    rocket
        .mount(
            "/",
            rocket::routes![
                index,
                download,
                mark_downloaded,
                issue_token,
                issue_token_unauthorized,
                show_token,
                show_token_unauthorized,
            ],
        )
        .register("/", rocket::catchers![too_many_requests])
        .manage(state)
}

/// Build the app from a figment holding both rocket's and our settings.
pub fn build_app(figment: Figment) -> errors::Result<Rocket<Build>> {
    let config = AppConfig::extract(&figment)?;
    log::info!(
        "serving files from {} with {:?} token store",
        config.root_path.to_string_lossy(),
        config.token_backend
    );
    let state = AppState::from_config(config)?;
    Ok(mount(rocket::custom(figment), state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrypt::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};

    fn phc(password: &str) -> String {
        let salt = SaltString::generate(&mut OsRng);
        Scrypt
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    #[test]
    fn basic_auth_checks_user_and_password() {
        let hash = phc("hunter2");
        let good = base64::encode("admin:hunter2");
        let wrong_pw = base64::encode("admin:hunter3");
        let wrong_user = base64::encode("root:hunter2");

        assert!(is_basic_auth_valid("admin", Some(&hash), &good));
        assert!(!is_basic_auth_valid("admin", Some(&hash), &wrong_pw));
        assert!(!is_basic_auth_valid("admin", Some(&hash), &wrong_user));
        assert!(!is_basic_auth_valid("admin", None, &good));
        assert!(!is_basic_auth_valid("admin", Some(&hash), "%%%not base64"));
    }

    #[test]
    fn download_url_points_at_the_gate() {
        let tok = DownloadToken::new(
            "1234".to_string(),
            "album.zip".to_string(),
            "a/album.zip".to_string(),
            None,
            Utc::now(),
            60,
        );
        assert_eq!(
            download_url("https://shop.example.com/", &tok),
            "https://shop.example.com/download?token=1234&file=album.zip"
        );
    }
}
