//! SSE framing for the stream path: event writes and the keepalive task.
//!
//! The stream handler and the keepalive task share one HTTP response
//! writer; a per-request mutex serialises every `(write, flush)` pair so
//! frames never interleave.

use crate::envelope::Envelope;
use crate::error::Result;
use crate::transport::ServerExchange;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub(crate) type SharedWriter = Arc<Mutex<Box<dyn ServerExchange>>>;

const PING_FRAME: &[u8] = b": ping\n\n";

/// Write one `data: <envelope-json>\n\n` frame and flush.
pub(crate) async fn write_event(writer: &SharedWriter, env: &Envelope<Value>) -> Result<()> {
    let json = serde_json::to_string(env)?;
    let mut frame = Vec::with_capacity(json.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(json.as_bytes());
    frame.extend_from_slice(b"\n\n");

    let mut guard = writer.lock().await;
    guard.write(&frame).await?;
    guard.flush().await
}

/// Emit a `: ping` comment frame every `interval` until cancelled or the
/// client goes away.
pub(crate) async fn keepalive(writer: SharedWriter, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let result = {
                    let mut guard = writer.lock().await;
                    match guard.write(PING_FRAME).await {
                        Ok(_) => guard.flush().await,
                        Err(e) => Err(e),
                    }
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "keepalive ping failed, stopping");
                    break;
                }
            }
        }
    }
}
