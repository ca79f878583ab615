//! Environment-driven configuration.

use std::env;
use tracing::info;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for the HTTP+WebSocket listener.
    pub port: u16,
    /// TCP port for the Prometheus metrics exporter.
    pub metrics_port: u16,
    /// KVPS connection URL.
    pub kvps_url: String,
    /// Services enabled on this node.
    pub enabled_services: Vec<String>,
    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,
}

/// All known fan-out services, in registration order.
pub const ALL_SERVICES: [&str; 4] = ["chat", "presence", "cursor", "reaction"];

impl Config {
    /// Build the configuration from the environment.
    pub fn from_env() -> Self {
        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .expect("PORT must be a number");
        let metrics_port: u16 = env::var("METRICS_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .expect("METRICS_PORT must be a number");

        let kvps_url = env::var("KVPS_URL").unwrap_or_else(|_| {
            let host = env::var("KVPS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
            let kvps_port = env::var("KVPS_PORT").unwrap_or_else(|_| "6379".to_string());
            format!("redis://{}:{}", host, kvps_port)
        });

        let enabled_services = match env::var("ENABLED_SERVICES") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| ALL_SERVICES.contains(&s.as_str()))
                .collect(),
            Err(_) => ALL_SERVICES.iter().map(|s| s.to_string()).collect(),
        };

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Self {
            port,
            metrics_port,
            kvps_url,
            enabled_services,
            log_level,
        }
    }

    /// Log the effective configuration at startup.
    pub fn log(&self) {
        info!("Configuration:");
        info!("  PORT: {}", self.port);
        info!("  METRICS_PORT: {}", self.metrics_port);
        info!("  KVPS_URL: {}", self.kvps_url);
        info!("  ENABLED_SERVICES: {}", self.enabled_services.join(","));
        info!("  LOG_LEVEL: {}", self.log_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_services_are_known() {
        assert_eq!(ALL_SERVICES, ["chat", "presence", "cursor", "reaction"]);
    }
}
