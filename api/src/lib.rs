mod server;
mod handlers;
mod error;

pub use server::{create_router, Server};
pub use handlers::AppState;
pub use error::{ApiError, ApiResult};

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_ip: IpAddr,
    pub port: u16,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.node_ip, self.port)
    }
}

/// Prefix of request headers that are stored as object metadata.
pub const METADATA_HEADER_PREFIX: &str = "x-meta-";
