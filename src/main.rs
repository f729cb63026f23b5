use anyhow::Result;
use clap::Parser;
use pbxgate::{
    app::{self, AppStateBuilder},
    config::{Cli, Config},
    event::{spawn_observer, LoggingObserver},
    version,
};
use std::fs::File;
use std::sync::Arc;
use tokio::select;
use tracing::{error, info, level_filters::LevelFilter, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.conf {
        println!("Loading config from: {}", path);
        Config::load(path)?
    } else {
        println!("Loading default config");
        Config::default()
    };
    println!("{}", version::get_version_info());

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        log_fmt = log_fmt.with_max_level(level);
    }

    let mut _log_guard = None;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _log_guard = Some(guard);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let state = AppStateBuilder::new().with_config(config).build()?;
    info!(
        http_addr = %state.config.http_addr,
        ami = %state.config.ami.addr(),
        "starting pbxgate"
    );

    spawn_observer(
        state.client.subscribe(),
        Arc::new(LoggingObserver),
        state.token.child_token(),
    );

    if let Err(e) = state.client.initialize().await {
        warn!(error = %e, "manager interface unavailable, retrying in background");
        state.client.start_reconnect();
    }

    select! {
        result = app::run(state.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "http server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
        }
    }
    state.client.disconnect().await;
    state.shutdown();
    Ok(())
}
