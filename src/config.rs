use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version = crate::version::get_short_version(),
    about = "Telephony gateway for the Asterisk manager interface",
    long_about = crate::version::get_version_info()
)]
pub struct Cli {
    /// Path to the configuration file (TOML format)
    #[clap(long)]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub ami: AmiConfig,
    pub sip: SipWebConfig,
    pub ice_servers: Option<Vec<IceServerItem>>,
}

/// Connection and behaviour settings for the manager interface client.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AmiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// Extensions managed by this gateway.
    pub extensions: Vec<String>,
    pub channel_tech: String,
    pub default_context: String,
    /// Contexts whose channels originate from a trunk; calls created in
    /// them are classified as incoming.
    pub trunk_contexts: Vec<String>,
    pub event_mask: String,
    pub reconnect_interval_secs: u64,
    pub action_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub originate_timeout_secs: u64,
    pub ended_call_grace_secs: u64,
    /// Calls without an update for this long are dropped after a reconnect
    pub stale_call_secs: u64,
    pub extension_cache_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SipWebConfig {
    pub ws_url: String,
    pub domain: String,
    pub default_password: Option<String>,
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct IceServerItem {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl AmiConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn originate_timeout(&self) -> Duration {
        Duration::from_secs(self.originate_timeout_secs)
    }

    pub fn ended_call_grace(&self) -> Duration {
        Duration::from_secs(self.ended_call_grace_secs)
    }

    pub fn stale_call_age(&self) -> Duration {
        Duration::from_secs(self.stale_call_secs)
    }

    pub fn extension_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.extension_cache_secs)
    }

    pub fn is_trunk_context(&self, context: &str) -> bool {
        self.trunk_contexts
            .iter()
            .any(|c| context == c || context.starts_with(c.as_str()))
    }

    pub fn is_managed_extension(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: "admin".to_string(),
            secret: String::new(),
            extensions: vec![],
            channel_tech: "PJSIP".to_string(),
            default_context: "from-internal".to_string(),
            trunk_contexts: vec![
                "from-trunk".to_string(),
                "from-pstn".to_string(),
                "from-external".to_string(),
            ],
            event_mask: "call,system".to_string(),
            reconnect_interval_secs: 5,
            action_timeout_secs: 5,
            login_timeout_secs: 10,
            originate_timeout_secs: 30,
            ended_call_grace_secs: 5,
            stale_call_secs: 4 * 3600,
            extension_cache_secs: 5,
        }
    }
}

impl Default for SipWebConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://127.0.0.1:8089/ws".to_string(),
            domain: "127.0.0.1".to_string(),
            default_password: None,
            credentials: HashMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            ami: AmiConfig::default(),
            sip: SipWebConfig::default(),
            ice_servers: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
