// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Daemon configuration and advertised-identity resolution.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sluice_nat::{default_private_cidrs, Cidr};
use sluice_transaction::TimerDefaults;
use std::time::Duration;
use tracing::info;

/// Sentinel requesting public-address auto-detection at startup.
pub const AUTO_HOST: &str = "AUTO";

/// JSON config file shape. Every field has a default so a bare daemon runs
/// on loopback without a file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub bind_address: String,
    pub bind_port: u16,
    pub enable_tcp: bool,
    /// Explicit address, or "AUTO" to detect the local address at startup.
    pub advertised_host: String,
    /// Externally visible port; 0 means "same as bind_port".
    pub advertised_port: u16,
    /// `udp:host:port` or `unix:/path` for the rtpproxy control socket.
    pub rtpproxy_control: String,
    /// CIDRs classified as private for NAT detection; empty means the
    /// RFC 1918 + loopback default set.
    pub private_cidrs: Vec<String>,
    /// AoR user -> shared secret for digest auth; empty disables auth.
    pub users: HashMap<String, String>,
    pub realm: String,
    pub registration_max_expiry: u32,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_owned(),
            bind_port: 5060,
            enable_tcp: false,
            advertised_host: AUTO_HOST.to_owned(),
            advertised_port: 0,
            rtpproxy_control: "udp:127.0.0.1:7722".to_owned(),
            private_cidrs: Vec::new(),
            users: HashMap::new(),
            realm: "sluice.local".to_owned(),
            registration_max_expiry: 3600,
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<ConfigFile> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub enable_tcp: bool,
    pub identity: Identity,
    pub rtpproxy_control: String,
    pub private_cidrs: Vec<Cidr>,
    pub users: HashMap<String, String>,
    pub realm: String,
    pub registration_max_expiry: Duration,
    /// Transaction-layer base timers; shrunk in tests.
    pub timers: TimerDefaults,
    /// Absolute ceiling for reaching Connected from Initiating.
    pub answer_timeout: Duration,
    /// Window for the A-leg ACK after a 2xx.
    pub ack_timeout: Duration,
}

/// Process-wide advertised identity: where peers should address signalling.
#[derive(Debug, Clone)]
pub struct Identity {
    pub advertised_host: String,
    pub advertised_port: u16,
    /// User part placed in Contact headers the B2BUA originates.
    pub user: String,
}

impl Identity {
    pub fn contact_value(&self) -> String {
        format!(
            "<sip:{}@{}:{}>",
            self.user, self.advertised_host, self.advertised_port
        )
    }

    pub fn via_value(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/UDP {}:{};branch={}",
            self.advertised_host, self.advertised_port, branch
        )
    }
}

impl Config {
    /// Resolves a config file into the runtime configuration, performing
    /// AUTO address detection when requested.
    pub fn resolve(file: ConfigFile) -> Result<Config> {
        let bind_ip: IpAddr = file
            .bind_address
            .parse()
            .map_err(|_| anyhow!("invalid bind_address {:?}", file.bind_address))?;
        let bind_addr = SocketAddr::new(bind_ip, file.bind_port);

        let advertised_host = if file.advertised_host == AUTO_HOST {
            let detected = detect_local_address()?;
            info!(%detected, "advertised address auto-detected");
            detected.to_string()
        } else {
            file.advertised_host.clone()
        };
        let advertised_port = if file.advertised_port == 0 {
            file.bind_port
        } else {
            file.advertised_port
        };

        let private_cidrs = if file.private_cidrs.is_empty() {
            default_private_cidrs()
        } else {
            file.private_cidrs
                .iter()
                .map(|raw| {
                    Cidr::parse(raw).ok_or_else(|| anyhow!("invalid private CIDR {:?}", raw))
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Config {
            bind_addr,
            enable_tcp: file.enable_tcp,
            identity: Identity {
                advertised_host,
                advertised_port,
                user: "sluice".to_owned(),
            },
            rtpproxy_control: file.rtpproxy_control,
            private_cidrs,
            users: file.users,
            realm: file.realm,
            registration_max_expiry: Duration::from_secs(file.registration_max_expiry as u64),
            timers: TimerDefaults::default(),
            answer_timeout: Duration::from_secs(32),
            ack_timeout: Duration::from_secs(5),
        })
    }
}

/// Discovers the local address a default route would use, by "connecting" a
/// UDP socket to a well-known public address. No packet is sent.
fn detect_local_address() -> Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("198.51.100.1:5060")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_on_loopback() {
        let config = Config::resolve(ConfigFile {
            advertised_host: "203.0.113.1".to_owned(),
            ..ConfigFile::default()
        })
        .unwrap();
        assert_eq!(config.bind_addr.port(), 5060);
        assert_eq!(config.identity.advertised_port, 5060);
        assert_eq!(config.identity.advertised_host, "203.0.113.1");
        assert!(!config.private_cidrs.is_empty());
    }

    #[test]
    fn advertised_port_defaults_to_bind_port() {
        let config = Config::resolve(ConfigFile {
            advertised_host: "203.0.113.1".to_owned(),
            bind_port: 5070,
            advertised_port: 0,
            ..ConfigFile::default()
        })
        .unwrap();
        assert_eq!(config.identity.advertised_port, 5070);

        let tunneled = Config::resolve(ConfigFile {
            advertised_host: "tunnel.example.net".to_owned(),
            bind_port: 5060,
            advertised_port: 7000,
            ..ConfigFile::default()
        })
        .unwrap();
        assert_eq!(tunneled.identity.advertised_port, 7000);
        assert_eq!(
            tunneled.identity.contact_value(),
            "<sip:sluice@tunnel.example.net:7000>"
        );
    }

    #[test]
    fn bad_cidrs_are_rejected() {
        let result = Config::resolve(ConfigFile {
            advertised_host: "203.0.113.1".to_owned(),
            private_cidrs: vec!["not-a-cidr".to_owned()],
            ..ConfigFile::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn config_file_parses_json() {
        let raw = r#"{
            "bind_address": "10.0.0.5",
            "bind_port": 5080,
            "enable_tcp": true,
            "advertised_host": "203.0.113.9",
            "rtpproxy_control": "unix:/run/rtpproxy.sock",
            "users": {"1001": "secret"},
            "registration_max_expiry": 600
        }"#;
        let file: ConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.bind_port, 5080);
        assert!(file.enable_tcp);
        assert_eq!(file.users.get("1001").map(String::as_str), Some("secret"));
        let config = Config::resolve(file).unwrap();
        assert_eq!(config.registration_max_expiry, Duration::from_secs(600));
    }
}
