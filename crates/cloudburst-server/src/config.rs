use serde::Deserialize;

use crate::handlers::{DEFAULT_NONCE_HEADER, DEFAULT_RECLAIM_PATH};

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Path the infrastructure calls before reclaiming this instance.
    #[serde(default = "ServerConfig::default_reclaim_path")]
    pub reclaim_path: String,
    /// Header carrying the per-request nonce on reclaim callbacks.
    #[serde(default = "ServerConfig::default_nonce_header")]
    pub nonce_header: String,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            reclaim_path: Self::default_reclaim_path(),
            nonce_header: Self::default_nonce_header(),
        }
    }

    fn default_reclaim_path() -> String {
        DEFAULT_RECLAIM_PATH.to_string()
    }

    fn default_nonce_header() -> String {
        DEFAULT_NONCE_HEADER.to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:8080")
    }
}
