use crate::config::{IceServerItem, SipWebConfig};
use serde::{Deserialize, Serialize};

/// Registration settings handed to a browser softphone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SipClientConfig {
    pub ws_server: String,
    pub domain: String,
    pub uri: String,
    pub extension: String,
    pub password: String,
    pub ice_servers: Vec<IceServerItem>,
    pub hack_ip_in_contact: bool,
    pub hack_via_tcp: bool,
    pub hack_wss_in_transport: bool,
}

pub fn default_ice_servers() -> Vec<IceServerItem> {
    vec![
        IceServerItem {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        },
        IceServerItem {
            urls: vec!["stun:stun1.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        },
    ]
}

pub fn build_sip_config(
    config: &SipWebConfig,
    ice_servers: Option<&Vec<IceServerItem>>,
    extension: &str,
) -> SipClientConfig {
    let password = config
        .credentials
        .get(extension)
        .cloned()
        .or_else(|| config.default_password.clone())
        .unwrap_or_default();

    SipClientConfig {
        ws_server: config.ws_url.clone(),
        domain: config.domain.clone(),
        uri: format!("sip:{}@{}", extension, config.domain),
        extension: extension.to_string(),
        password,
        ice_servers: ice_servers.cloned().unwrap_or_else(default_ice_servers),
        hack_ip_in_contact: true,
        hack_via_tcp: true,
        hack_wss_in_transport: true,
    }
}
