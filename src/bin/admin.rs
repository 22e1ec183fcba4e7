use std::path::PathBuf;

use anyhow::{anyhow, Context};
use chrono::Utc;
use chrono_humanize::HumanTime;
use clap::Parser;
use scrypt::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Scrypt,
};

use merchdl::api::download_url;
use merchdl::cleanup;
use merchdl::conf::AppConfig;
use merchdl::errors::StoreError;
use merchdl::issuer::{self, Grant};
use merchdl::json_store::JsonFileStore;
use merchdl::store::{self, TokenStore};
use merchdl::token::DownloadToken;
use merchdl::tracker;

/// Utility binary to manage download tokens.
#[derive(Debug, Parser)]
#[clap(version, author, about)]
struct Opts {
    /// configuration file, same format as the server's Rocket.toml
    #[clap(short, long, default_value = "Rocket.toml")]
    config: String,

    #[clap(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    /// Issue a download token for a file
    Issue {
        /// name the buyer sees, and must pass as `file` when downloading
        #[clap(short, long)]
        file: String,

        /// key in the file storage, defaults to the file name
        #[clap(short, long)]
        path: Option<String>,

        #[clap(short, long)]
        order: Option<String>,

        /// defaults to default_expires_in_minutes from the configuration
        #[clap(short, long)]
        expires_in: Option<i64>,
    },
    /// Show a token and where it is in its lifecycle
    Show { token: String },
    /// Mark a token as downloaded
    Complete { token: String },
    /// Force a cleanup of expired and completed tokens
    Cleanup {
        /// defaults to retention_hours from the configuration
        #[clap(long)]
        retention_hours: Option<i64>,
    },
    /// Print the scrypt hash to put in admin_phc
    HashPassword {
        #[clap(short, long)]
        password: String,
    },
    /// Copy every token of a JSON token file into the configured store
    Import {
        #[clap(short, long)]
        from: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();
    match opts.cmd {
        SubCommand::HashPassword { password } => hash_password(&password),
        cmd => {
            let conf = AppConfig::from_file(&opts.config)
                .with_context(|| format!("Cannot read configuration from {}", opts.config))?;
            let store = store::open_store(&conf).context("Cannot open the token store")?;
            run(cmd, &conf, &*store)
        }
    }
}

fn run(cmd: SubCommand, conf: &AppConfig, store: &dyn TokenStore) -> anyhow::Result<()> {
    match cmd {
        SubCommand::Issue {
            file,
            path,
            order,
            expires_in,
        } => {
            let grant = Grant {
                file_name: file,
                file_path: path,
                order_id: order,
                expires_in_minutes: expires_in,
            };
            let tok = issuer::issue(store, grant, conf.default_expires_in_minutes, Utc::now())?;
            print_token(&tok);
            println!("link: {}", download_url(&conf.public_url, &tok));
        }
        SubCommand::Show { token } => match store.find(&token)? {
            Some(tok) => print_token(&tok),
            None => return Err(anyhow!("No token {}", token)),
        },
        SubCommand::Complete { token } => {
            let result = tracker::mark_completed(store, &token, Utc::now())?;
            println!("{}", result.message());
        }
        SubCommand::Cleanup { retention_hours } => {
            let conf = AppConfig {
                retention_hours: retention_hours.unwrap_or(conf.retention_hours),
                ..conf.clone()
            };
            conf.validate()?;
            let n = cleanup::cleanup_once(store, Utc::now(), conf.retention())?;
            println!("deleted {} tokens", n);
        }
        SubCommand::Import { from } => import(store, from)?,
        SubCommand::HashPassword { password } => hash_password(&password)?,
    }
    Ok(())
}

fn print_token(tok: &DownloadToken) {
    let now = Utc::now();
    println!("token:   {}", tok.token);
    println!("file:    {} ({})", tok.file_name, tok.file_path);
    if let Some(order) = &tok.order_id {
        println!("order:   {}", order);
    }
    println!(
        "expires: {} ({})",
        tok.expires_at.format("%F %r"),
        HumanTime::from(tok.expires_at - now)
    );
    println!("state:   {:?}", tok.state_at(now));
}

fn hash_password(password: &str) -> anyhow::Result<()> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Scrypt
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("Cannot hash password: {}", err))?
        .to_string();
    println!("{}", hash);
    Ok(())
}

fn import(store: &dyn TokenStore, from: PathBuf) -> anyhow::Result<()> {
    let source = JsonFileStore::new(from);
    let tokens = source
        .all()
        .with_context(|| format!("Cannot read {}", source.path().to_string_lossy()))?;
    let mut imported = 0;
    let mut skipped = 0;
    for tok in &tokens {
        match store.insert(tok) {
            Ok(()) => imported += 1,
            Err(StoreError::AlreadyExists(t)) => {
                log::info!("token {} already in the store, skipping", t);
                skipped += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    println!(
        "imported {} tokens, skipped {} already present",
        imported, skipped
    );
    Ok(())
}
