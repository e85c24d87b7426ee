//! Viewer connections as seen by a session
//!
//! A session never touches a socket directly. Each viewer registers a
//! [`ViewerSink`] behind its own async mutex, which serializes writes to that
//! transport independently of the session state lock.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::SplitSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

static NEXT_VIEWER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(u64);

impl ViewerId {
    pub fn next() -> Self {
        ViewerId(NEXT_VIEWER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// One frame headed to a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
    Close,
}

#[async_trait]
pub trait ViewerSink: Send {
    async fn send(&mut self, frame: Outbound) -> Result<()>;
}

/// Write-serialized handle to a viewer's transport
pub type SharedSink = Arc<Mutex<Box<dyn ViewerSink>>>;

pub fn shared(sink: impl ViewerSink + 'static) -> SharedSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

/// Outbound half of an axum WebSocket
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ViewerSink for WsSink {
    async fn send(&mut self, frame: Outbound) -> Result<()> {
        let message = match frame {
            Outbound::Binary(bytes) => Message::Binary(bytes.to_vec()),
            Outbound::Text(text) => Message::Text(text),
            Outbound::Close => Message::Close(None),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Sink that records every frame into a channel
    pub struct ChannelSink {
        tx: mpsc::UnboundedSender<Outbound>,
    }

    #[async_trait]
    impl ViewerSink for ChannelSink {
        async fn send(&mut self, frame: Outbound) -> Result<()> {
            self.tx
                .send(frame)
                .map_err(|_| RelayError::Transport("receiver dropped".to_string()))
        }
    }

    pub fn channel_sink() -> (SharedSink, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (shared(ChannelSink { tx }), rx)
    }

    /// Sink whose transport is already gone
    pub struct BrokenSink;

    #[async_trait]
    impl ViewerSink for BrokenSink {
        async fn send(&mut self, _frame: Outbound) -> Result<()> {
            Err(RelayError::Transport("broken pipe".to_string()))
        }
    }

    /// Sink whose peer stopped reading; every send hangs
    pub struct StuckSink;

    #[async_trait]
    impl ViewerSink for StuckSink {
        async fn send(&mut self, _frame: Outbound) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Drain whatever has been sent so far
    pub fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
