//! Broker configuration.
//!
//! The config file is JSON that may carry `//` and `/* */` comments; the
//! loader strips them before deserializing. CLI flags override the listen
//! address, the cluster self name and the varz path.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_listen() -> String {
    "127.0.0.1:6060".to_owned()
}

fn default_varz_path() -> String {
    "/varz".to_owned()
}

fn default_logging_level() -> String {
    "info".to_owned()
}

/// Top-level configuration for the broker runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the client listener binds; TCP, TLS handshakes, WebSocket
    /// upgrades and the varz endpoint share it through the protocol demux.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Certificates enabling TLS termination on the client listener.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Optional listener speaking the protobuf stream framing.
    #[serde(default)]
    pub grpc_listen: Option<String>,
    #[serde(default = "default_varz_path")]
    pub varz_path: String,
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls: None,
            grpc_listen: None,
            varz_path: default_varz_path(),
            logging_level: default_logging_level(),
            store: StoreConfig::default(),
            cluster: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Adapter name; the in-memory adapter is the default.
    #[serde(default)]
    pub adapter: String,
    #[serde(default)]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            adapter: "mem".to_owned(),
            path: String::new(),
        }
    }
}

/// Cluster membership: this node's name and every peer's RPC endpoint,
/// including our own (the ring is built from the full node list).
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(rename = "self")]
    pub self_name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
}

impl Config {
    /// Load a config file, stripping comments before parsing.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Parse config text that may contain comments.
    pub fn parse(raw: &str) -> Result<Self> {
        let stripped = strip_comments(raw);
        let config: Config = serde_json::from_str(&stripped)?;
        Ok(config)
    }
}

/// Remove `//` line comments and `/* */` block comments outside of strings.
fn strip_comments(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push('"');
        } else if c == '/' && chars.peek() == Some(&'/') {
            for next in chars.by_ref() {
                if next == '\n' {
                    out.push('\n');
                    break;
                }
            }
        } else if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut prev = ' ';
            for next in chars.by_ref() {
                if prev == '*' && next == '/' {
                    break;
                }
                prev = next;
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commented_json() {
        let raw = r#"
        {
            // client listener
            "listen": "127.0.0.1:6060",
            /* stats endpoint */
            "varz_path": "/varz",
            "logging_level": "debug",
            "cluster": {
                "self": "a",
                "nodes": [
                    { "name": "a", "addr": "127.0.0.1:6061" },
                    { "name": "b", "addr": "127.0.0.1:6062" }
                ]
            }
        }
        "#;
        let cfg = Config::parse(raw).expect("parse");
        assert_eq!(cfg.listen, "127.0.0.1:6060");
        assert_eq!(cfg.logging_level, "debug");
        let cluster = cfg.cluster.expect("cluster");
        assert_eq!(cluster.self_name, "a");
        assert_eq!(cluster.nodes.len(), 2);
    }

    #[test]
    fn slashes_inside_strings_survive() {
        let raw = r#"{ "varz_path": "/varz//stats" }"#;
        let cfg = Config::parse(raw).expect("parse");
        assert_eq!(cfg.varz_path, "/varz//stats");
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg = Config::parse("{}").expect("parse");
        assert_eq!(cfg.listen, "127.0.0.1:6060");
        assert_eq!(cfg.store.adapter, "mem");
        assert!(cfg.cluster.is_none());
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("unitd.conf");
        std::fs::write(&path, "{ \"listen\": \"127.0.0.1:7070\" } // broker\n").expect("write");
        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.listen, "127.0.0.1:7070");

        assert!(Config::load(&dir.path().join("missing.conf")).is_err());
    }
}
