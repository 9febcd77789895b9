//! Diagnostics wiring
//!
//! Standard output belongs to the view-server protocol, so every diagnostic
//! sink writes elsewhere: stderr always, plus an optional append-only file
//! and an optional TCP syslog stream.

use std::fs::OpenOptions;
use std::net::TcpStream;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

use crate::config::Config;

/// Install the global subscriber according to the configuration.
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::new(format!("supercouch={}", config.log_level.as_str()));

    let file_layer = config
        .log_file
        .as_ref()
        .map(|path| {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file '{}'", path.display()))?;
            Ok::<_, anyhow::Error>(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        })
        .transpose()?;

    let syslog_layer = config
        .syslog_url
        .as_ref()
        .map(|syslog| {
            let stream = connect_syslog(syslog)?;
            Ok::<_, anyhow::Error>(fmt::layer().with_ansi(false).with_writer(Arc::new(stream)))
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(syslog_layer)
        .init();

    Ok(())
}

/// Open the TCP stream behind a `tcp://host:port` syslog URL. The URL was
/// validated by [`Config::validate`]; this re-checks the pieces it needs.
fn connect_syslog(syslog: &str) -> Result<TcpStream> {
    let url = Url::parse(syslog).with_context(|| format!("invalid syslog url '{}'", syslog))?;
    let host = url
        .host_str()
        .with_context(|| format!("syslog url '{}' has no host", syslog))?;
    let port = url
        .port()
        .with_context(|| format!("syslog url '{}' has no port", syslog))?;
    TcpStream::connect((host, port))
        .with_context(|| format!("failed to connect to syslog at {}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_syslog_rejects_bad_urls() {
        assert!(connect_syslog("not a url").is_err());
        assert!(connect_syslog("tcp://hostonly").is_err());
    }
}
