//! Line-delimited JSON bridge, for hosting the router behind a
//! native-messaging style pipe.
//!
//! Each input line is a frame `{ "id": ..., "origin": {...}, "message": {...} }`;
//! each output line is `{ "id": ..., "reply": {...} }` with the same `id`.
//! Frames from one origin are handled in line order; replies to different
//! origins may come back out of order.

use aegis_core::Origin;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    protocol::{ErrorCode, Reply},
    router::{RouterHandle, TransportError},
};

/// Inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    /// Caller's correlation id, echoed back verbatim.
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub origin: Origin,
    pub message: Value,
}

/// Outbound frame.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub id: Value,
    pub reply: Reply,
}

/// Serve frames from `reader` until EOF, writing replies to `writer`.
///
/// Returns once every in-flight request has been answered.
///
/// # Errors
/// Returns error if reading input fails.
pub async fn serve<R, W>(handle: RouterHandle, reader: R, writer: W) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    // Single writer so frames never interleave
    let write_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = rx.recv().await {
            let mut line = match serde_json::to_vec(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Failed to serialize reply: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = writer.write_all(&line).await {
                tracing::error!("Failed to write reply: {e}");
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let frame: InboundFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Invalid frame: {e}");
                let _ = tx.send(OutboundFrame {
                    id: Value::Null,
                    reply: Reply::error(ErrorCode::MalformedRequest, format!("Invalid frame: {e}")),
                });
                continue;
            }
        };

        // Queue in line order; only the wait for the reply runs concurrently
        let InboundFrame {
            id,
            origin,
            message,
        } = frame;
        let pending = handle.enqueue(message, origin);
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = match pending {
                Ok(rx) => rx
                    .await
                    .unwrap_or_else(|_| Reply::error(ErrorCode::ChannelClosed, "Router stopped")),
                Err(e) => Reply::error(ErrorCode::ChannelClosed, e.to_string()),
            };
            let _ = tx.send(OutboundFrame { id, reply });
        });
    }

    tracing::debug!("input closed; draining in-flight replies");
    drop(tx);
    let _ = write_task.await;
    Ok(())
}
