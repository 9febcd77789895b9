//! SuperCouch query server
//!
//! Launched by the database (via `COUCHDB_QUERY_SERVER_SUPERCOUCH`) as a
//! long-lived child process speaking the view-server protocol on stdio.
//! Exits 0 when stdin closes, 1 on usage or startup errors; per-line
//! protocol errors never terminate the process.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use supercouch::config::{Config, LogLevel};
use supercouch::engine::{serve_stdio, Engine};
use supercouch::logging;
use supercouch::sset::RedisStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "supercouch")]
#[command(about = "CouchDB query server backing $SSET emissions with a sorted-set store")]
#[command(version)]
struct Cli {
    /// Sorted-set backend: redis://host:port or redis-cluster://node1,node2
    #[arg(long, value_name = "URL")]
    redis_url: String,

    /// Also pass $SSET emissions through as normal view rows
    #[arg(long)]
    emit_sset: bool,

    /// Append diagnostics to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Send diagnostics over TCP syslog (tcp://host:port)
    #[arg(long, value_name = "URL")]
    syslog_url: Option<String>,

    /// Raise diagnostics to debug
    #[arg(long)]
    verbose: bool,

    /// Raise diagnostics to trace
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let log_level = if self.debug {
            LogLevel::Trace
        } else if self.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };
        Config {
            redis_url: self.redis_url,
            emit_sset: self.emit_sset,
            log_file: self.log_file,
            syslog_url: self.syslog_url,
            log_level,
        }
    }
}

fn main() -> ExitCode {
    // Usage problems (and --help) exit 1; the database treats any non-zero
    // exit as a failed server launch.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    let config = cli.into_config();
    if let Err(err) = config.validate() {
        eprintln!("{}", err);
        return ExitCode::from(1);
    }

    if let Err(err) = logging::init(&config) {
        eprintln!("{}", err);
        return ExitCode::from(1);
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::from(1)
        }
    }
}

/// The protocol is strictly sequential and the evaluator is thread-bound,
/// so everything runs on a current-thread runtime.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        info!(url = %config.redis_url, "connected to sorted-set backend");

        let mut engine = Engine::new(store, config.emit_sset)?;
        serve_stdio(&mut engine).await
    })
}
