use crate::ami::AmiClient;
use crate::config::Config;
use anyhow::Result;
use axum::Router;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub client: AmiClient,
    pub token: CancellationToken,
    pub started_at: DateTime<Utc>,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub client: Option<AmiClient>,
}

impl AppStateInner {
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    /// Stop the HTTP server, the reconnect loop and every observer.
    pub fn shutdown(&self) {
        self.client.shutdown();
        self.token.cancel();
    }
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            client: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_client(mut self, client: AmiClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        config
            .http_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid http_addr {}: {}", config.http_addr, e))?;
        let token = CancellationToken::new();

        let client = match self.client {
            Some(client) => client,
            None => AmiClient::builder()
                .with_config(config.ami.clone())
                .with_sip_config(config.sip.clone())
                .with_ice_servers(config.ice_servers.clone())
                .with_cancel_token(token.child_token())
                .build(),
        };

        Ok(Arc::new(AppStateInner {
            config,
            client,
            token,
            started_at: Utc::now(),
        }))
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();
    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };
    info!(%addr, "http server listening");

    let http_task = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => info!("Server shut down gracefully"),
                Err(e) => {
                    error!("Server error: {}", e);
                    return Err(anyhow::anyhow!("Server error: {}", e));
                }
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    state.shutdown();
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    crate::handler::ami_router(state).layer(cors)
}
