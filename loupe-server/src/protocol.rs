//! JSON-line protocol for interactive mode.
//!
//! After the model is loaded the server prints [`READY_MARKER`], then answers
//! one JSON line per request line. Blank and unparseable lines get no reply;
//! `exit` or end of input stops the loop.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use loupe_core::Result;

use crate::service::{CaptionRequest, ErrorResponse, Reply, RequestHandler};

pub const READY_MARKER: &str = "[CLIPtion] Ready.";

#[derive(Debug)]
pub enum Command {
    Exit,
    Caption(CaptionRequest),
    Skip,
}

pub fn parse_line(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Skip;
    }
    if line == "exit" {
        return Command::Exit;
    }
    match serde_json::from_str::<CaptionRequest>(line) {
        Ok(request) => Command::Caption(request),
        Err(e) => {
            warn!(error = %e, "skipping malformed request line");
            Command::Skip
        }
    }
}

/// Serve requests from `reader` until `exit` or EOF, writing replies to
/// `writer`. Each request runs on the blocking pool; requests are answered
/// in arrival order.
pub async fn serve_lines<R, W, H>(reader: R, mut writer: W, handler: Arc<H>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    H: RequestHandler,
{
    writer.write_all(READY_MARKER.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut lines = reader.lines();
    let mut served = 0usize;
    while let Some(line) = lines.next_line().await? {
        let request = match parse_line(&line) {
            Command::Exit => {
                info!(served, "exit requested");
                return Ok(());
            }
            Command::Skip => continue,
            Command::Caption(request) => request,
        };

        debug!(image = %request.image, "request received");
        let worker = handler.clone();
        let reply = match tokio::task::spawn_blocking(move || worker.handle(&request)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "caption worker panicked");
                Reply::Error(ErrorResponse {
                    error: format!("internal error: {e}"),
                })
            }
        };

        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
        served += 1;
    }

    info!(served, "input closed");
    Ok(())
}
