//! Request/reply exchange over the transport.
//!
//! All traffic goes through [`PumpLink::exchange`], which holds the transport
//! lock for the whole write-then-read cycle. Concurrent callers (an operation's
//! own wait loop and an external status poller) are therefore serialized per
//! exchange and the read cursor always stays on a command boundary.

use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::protocol::{Command, TERMINATOR};
use crate::adapters::Transport;
use crate::error::{PumpError, PumpResult};

/// Owns the open transport, if any.
#[derive(Default)]
pub struct PumpLink {
    transport: Mutex<Option<Box<dyn Transport>>>,
}

impl PumpLink {
    /// Create an unattached link.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly opened transport.
    pub async fn attach(&self, transport: Box<dyn Transport>) {
        *self.transport.lock().await = Some(transport);
    }

    /// Close and remove the transport.
    pub async fn detach(&self) -> PumpResult<()> {
        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.close().await?;
        }
        Ok(())
    }

    /// Send `command` and read exactly the number of reply frames it defines.
    ///
    /// # Errors
    /// [`PumpError::NotConnected`] without a transport; otherwise whatever the
    /// transport reports, typically [`PumpError::Timeout`].
    pub async fn exchange(&self, command: &Command) -> PumpResult<Vec<Vec<u8>>> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(PumpError::NotConnected)?;

        let frame = command.encode();
        trace!(port = transport.port_name(), frame = %frame.escape_debug(), "tx");
        transport.write(frame.as_bytes()).await?;

        let mut replies = Vec::with_capacity(command.reply_frames());
        for _ in 0..command.reply_frames() {
            let reply = transport.read_until(TERMINATOR).await?;
            trace!(
                port = transport.port_name(),
                frame = %String::from_utf8_lossy(&reply).escape_debug(),
                "rx"
            );
            replies.push(reply);
        }
        debug!(command = ?command, frames = replies.len(), "Exchange complete");
        Ok(replies)
    }

    /// Like [`exchange`](Self::exchange) but returns only the final (data) frame.
    pub async fn query(&self, command: &Command) -> PumpResult<Vec<u8>> {
        self.exchange(command)
            .await?
            .pop()
            .ok_or_else(|| PumpError::Protocol(format!("no reply to {command:?}")))
    }
}
