use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("Could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Server subnet {0} is too small for an address pool")]
    SubnetTooSmall(Ipv4Network),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    /// Internal subnet virtual IPs are leased from; the server takes the
    /// first host address.
    pub subnet: Ipv4Network,
    pub secret: String,

    #[serde(default = "default_true")]
    pub encryption: bool,
    #[serde(default)]
    pub padding_to: usize,
    #[serde(default = "default_rotation_secs")]
    pub rotation_interval_secs: u64,

    /// When set, `hello` must carry a user named in `quotas`.
    #[serde(default)]
    pub authentication: bool,
    /// Byte budget per user; exceeding it ends the session.
    #[serde(default)]
    pub quotas: HashMap<String, u64>,
    /// Users pinned to fixed virtual IPs.
    #[serde(default)]
    pub static_hosts: HashMap<String, Ipv4Addr>,

    #[serde(default = "default_tunnel_prefix")]
    pub tunnel_prefix: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Network + server + one client + broadcast.
        if self.subnet.size() < 4 {
            return Err(ConfigError::SubnetTooSmall(self.subnet));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// `host:port` of the server's control channel.
    pub server_addr: String,
    pub secret: String,
    #[serde(default)]
    pub user: Option<String>,

    // Must match the server's control-channel settings.
    #[serde(default = "default_true")]
    pub encryption: bool,
    #[serde(default)]
    pub padding_to: usize,

    #[serde(default = "default_tunnel_prefix")]
    pub tunnel_prefix: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_true")]
    pub stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: default_log_level(), path: String::new(), stdout: true }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfigFile {
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClientConfigFile {
    pub client: ClientConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl ServerConfigFile {
    pub fn load(path: &str) -> Result<ServerConfigFile, ConfigError> {
        let content = fs::read_to_string(path)?;
        let file: ServerConfigFile = toml::from_str(&content)?;
        file.server.validate()?;
        Ok(file)
    }
}

impl ClientConfigFile {
    pub fn load(path: &str) -> Result<ClientConfigFile, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn default_true() -> bool {
    true
}

fn default_rotation_secs() -> u64 {
    60
}

fn default_tunnel_prefix() -> String {
    "stun".to_string()
}

fn default_mtu() -> u16 {
    1280
}

fn default_log_level() -> String {
    "info".to_string()
}

pub const SAMPLE_SERVER_CONFIG: &str = r#"# stun server config
[server]
port = 2859
subnet = "10.100.0.0/24"
secret = "change-me"
encryption = true
padding_to = 0
rotation_interval_secs = 60
authentication = false

# Per-user byte budgets; required for every user when authentication = true.
[server.quotas]
# alice = 10000000000

# Users pinned to fixed virtual IPs.
[server.static_hosts]
# alice = "10.100.0.50"

[log]
level = "info"
path = ""
stdout = true
"#;

pub const SAMPLE_CLIENT_CONFIG: &str = r#"# stun client config
[client]
server_addr = "vpn.example.com:2859"
secret = "change-me"
# user = "alice"
encryption = true
padding_to = 0

[log]
level = "info"
path = ""
stdout = true
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_server_config_parses() {
        let file: ServerConfigFile = toml::from_str(SAMPLE_SERVER_CONFIG).unwrap();
        assert_eq!(file.server.port, 2859);
        assert_eq!(file.server.subnet.to_string(), "10.100.0.0/24");
        assert!(file.server.encryption);
        assert_eq!(file.server.rotation_interval_secs, 60);
        file.server.validate().unwrap();
    }

    #[test]
    fn sample_client_config_parses() {
        let file: ClientConfigFile = toml::from_str(SAMPLE_CLIENT_CONFIG).unwrap();
        assert_eq!(file.client.server_addr, "vpn.example.com:2859");
        assert!(file.client.user.is_none());
        assert_eq!(file.client.mtu, 1280);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let minimal = r#"
[server]
port = 1
subnet = "10.0.0.0/24"
secret = "s"
"#;
        let file: ServerConfigFile = toml::from_str(minimal).unwrap();
        assert!(file.server.encryption);
        assert_eq!(file.server.padding_to, 0);
        assert!(!file.server.authentication);
        assert!(file.server.quotas.is_empty());
        assert_eq!(file.log.level, "info");
        assert!(file.log.stdout);
    }

    #[test]
    fn tiny_subnet_is_rejected() {
        let config = r#"
[server]
port = 1
subnet = "10.0.0.0/31"
secret = "s"
"#;
        let file: ServerConfigFile = toml::from_str(config).unwrap();
        assert!(matches!(file.server.validate(), Err(ConfigError::SubnetTooSmall(_))));
    }

    #[test]
    fn quota_and_static_host_tables_parse() {
        let config = r#"
[server]
port = 1
subnet = "10.0.0.0/24"
secret = "s"
authentication = true

[server.quotas]
alice = 1000000

[server.static_hosts]
alice = "10.0.0.50"
"#;
        let file: ServerConfigFile = toml::from_str(config).unwrap();
        assert_eq!(file.server.quotas["alice"], 1_000_000);
        assert_eq!(file.server.static_hosts["alice"], "10.0.0.50".parse::<Ipv4Addr>().unwrap());
    }
}
