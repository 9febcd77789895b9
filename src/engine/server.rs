//! Stdio request/response loop
//!
//! The host database drives a strictly sequential interaction: one line in,
//! one line out, in order. Each line is fully processed (including the
//! sorted-set batch commit) before its reply is written; queued diagnostic
//! lines are flushed ahead of the reply. The loop ends when stdin closes.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use super::handler::Engine;
use super::protocol::{Reply, ERR_PARSE};

/// Serve the protocol over arbitrary line-oriented streams.
///
/// Lines are read as raw bytes: a line that is not valid UTF-8 cannot be
/// JSON and is answered with a `parse_error` reply, the same containment as
/// any other malformed line.
pub async fn serve<R, W>(engine: &mut Engine, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        debug!(len = line.len(), "request line");

        let replies = match std::str::from_utf8(&line) {
            Ok(text) => engine.handle_line(text).await,
            Err(e) => vec![Reply::error(
                ERR_PARSE,
                format!("request line is not valid UTF-8: {}", e),
            )],
        };
        for reply in replies {
            writer.write_all(reply.encode().as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
    }
    info!("stdin closed, shutting down");
    Ok(())
}

/// Serve the protocol over this process's standard input and output.
pub async fn serve_stdio(engine: &mut Engine) -> Result<()> {
    serve(
        engine,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
