//! Runtime configuration
//!
//! Assembled from argv by the binary; the engine itself reads no environment
//! variables. Validation collects every problem in one pass so the operator
//! can fix the whole invocation at once.

use std::path::PathBuf;

use anyhow::Result;
use url::Url;

/// Diagnostic verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Process configuration for the query server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sorted-set backend: `redis://host:port` or
    /// `redis-cluster://node1,node2[+addr=...]`.
    pub redis_url: String,
    /// Pass `$SSET` emissions through as normal view rows as well, keeping
    /// a rebuildable backup of the index inside the view.
    pub emit_sset: bool,
    /// Append diagnostics to this file.
    pub log_file: Option<PathBuf>,
    /// Send diagnostics over TCP syslog (`tcp://host:port`).
    pub syslog_url: Option<String>,
    /// Diagnostic level.
    pub log_level: LogLevel,
}

impl Config {
    /// Validate the whole configuration, reporting every error at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let known_scheme = ["redis://", "rediss://", "redis-cluster://"]
            .iter()
            .any(|scheme| self.redis_url.starts_with(scheme));
        if !known_scheme {
            errors.push(format!(
                "redis url '{}' must use redis://, rediss:// or redis-cluster://",
                self.redis_url
            ));
        }

        if let Some(syslog) = &self.syslog_url {
            match Url::parse(syslog) {
                Ok(url) if url.scheme() == "tcp" => {
                    if url.host_str().is_none() || url.port().is_none() {
                        errors.push(format!("syslog url '{}' needs a host and port", syslog));
                    }
                }
                Ok(url) if url.scheme() == "udp" => {
                    errors.push("udp syslog is not supported, use tcp://host:port".to_string());
                }
                Ok(url) => {
                    errors.push(format!(
                        "syslog url scheme '{}' is not supported, use tcp://host:port",
                        url.scheme()
                    ));
                }
                Err(e) => errors.push(format!("syslog url '{}' is invalid: {}", syslog, e)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }
}
