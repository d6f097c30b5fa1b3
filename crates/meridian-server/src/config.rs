use std::time::Duration;

use meridian_transport::TransportConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported in logs
    pub service_name: String,
    /// Hostname to bind to
    pub hostname: String,
    /// REST port (0 for OS-assigned, None to disable)
    pub http_port: Option<u16>,
    /// Native RPC port (0 for OS-assigned, None to disable)
    pub rpc_port: Option<u16>,
    /// How long `stop` waits for in-flight calls before abandoning them
    pub shutdown_timeout: Duration,
    /// Middleware run before each method's own list, for every method
    pub default_middlewares: Vec<String>,
    /// Enable CORS on the HTTP listener
    pub enable_cors: bool,
    /// Maximum concurrent RPC connections
    pub max_connections: Option<usize>,
    /// Largest HTTP request body accepted
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: "meridian".into(),
            hostname: "127.0.0.1".into(),
            http_port: Some(9282),
            rpc_port: Some(9281),
            shutdown_timeout: Duration::from_secs(15),
            default_middlewares: Vec::new(),
            enable_cors: false,
            max_connections: Some(256),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            hostname: self.hostname.clone(),
            http_port: self.http_port,
            rpc_port: self.rpc_port,
            max_connections: self.max_connections,
            enable_cors: self.enable_cors,
            max_body_bytes: self.max_body_bytes,
        }
    }
}
