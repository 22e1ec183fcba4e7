use futures::future::{self, Either};

use merchdl::api;
use merchdl::cleanup;
use merchdl::conf::AppConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let figment = AppConfig::server_figment();
    let config = AppConfig::extract(&figment)?;
    let state = api::AppState::from_config(config.clone())?;
    let tokens = state.tokens.clone();

    let app = api::mount(rocket::custom(figment), state).ignite().await?;

    let web_server = async {
        app.launch().await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    };

    let background_job = cleanup::run_periodically(
        tokens,
        std::time::Duration::from_secs(config.cleanup_interval_secs.max(1)),
        config.retention(),
    );

    futures::pin_mut!(web_server, background_job);
    match future::select(web_server, background_job).await {
        Either::Left((res, _)) => res,
        Either::Right(((), _)) => Ok(()),
    }
}
