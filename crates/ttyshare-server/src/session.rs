//! Session: one process, one screen, one scrollback, many viewers
//!
//! All mutation goes through the per-session `RwLock`. Writes to a viewer go
//! through that viewer's own sink mutex and always happen after the state lock
//! is released, with one exception: a joining viewer's sink is claimed while
//! the state lock is still held, so live output queued behind it cannot
//! overtake the resync.
//!
//! A viewer whose write fails or times out is marked failed and skipped by
//! later fan-outs; its own read loop detaches it. The session never signals
//! processes itself. It publishes which generation owns it, and the output
//! pump that holds the child stops any process that loses ownership.

use crate::config::{Program, ServerConfig};
use crate::error::{RelayError, Result};
use crate::lifecycle::ProcessState;
use crate::process::ProcessHandle;
use crate::ring_buffer::RingBuffer;
use crate::screen::{ScreenModel, Vt100Screen};
use crate::snapshot::{compress, generate_snapshot};
use crate::viewer::{Outbound, SharedSink, ViewerId, ViewerSink};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{watch, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};
use ttyshare_proto::{chunk, validate_session_name, ServerMessage, TermSize, DEFAULT_TERM_SIZE};

/// Per-session knobs taken from [`ServerConfig`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ring_buffer_bytes: usize,
    pub max_chunk_size: usize,
    pub write_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            ring_buffer_bytes: config.ring_buffer_bytes,
            max_chunk_size: config.max_chunk_size,
            write_timeout: config.write_timeout(),
        }
    }
}

struct Viewer {
    sink: SharedSink,
    /// Last reported size; `None` until the viewer sends one
    size: Option<TermSize>,
    /// A write failed or timed out; only the close frame is still attempted
    failed: bool,
}

struct SessionState {
    process: Option<ProcessHandle>,
    process_state: ProcessState,
    /// Bumped for every process installed; output from older ones is dropped
    generation: u64,
    size: TermSize,
    screen: Box<dyn ScreenModel>,
    ring: RingBuffer,
    viewers: HashMap<ViewerId, Viewer>,
    name: Option<String>,
    last_activity: DateTime<Utc>,
    closed: bool,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The process exited and will not be restarted
    Exited(i32),
    /// Reaped, deleted or shut down while the process may still be alive.
    /// Its pump terminates it.
    TornDown,
}

/// Serializable view for the session listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub program: String,
    pub assistant: String,
    pub viewers: usize,
    pub rows: u16,
    pub cols: u16,
    pub pid: Option<u32>,
    pub process: ProcessState,
    pub scrollback_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

pub struct Session {
    id: String,
    program: Program,
    recording_id: String,
    created_at: DateTime<Utc>,
    settings: SessionSettings,
    state: RwLock<SessionState>,
    /// Generation that owns the session, `None` once it has ended
    owner: watch::Sender<Option<u64>>,
}

/// Component-wise minimum of the reported sizes, 80x24 if nobody reported
pub fn negotiated_size<'a>(sizes: impl IntoIterator<Item = &'a TermSize>) -> TermSize {
    sizes
        .into_iter()
        .copied()
        .reduce(TermSize::min)
        .unwrap_or(DEFAULT_TERM_SIZE)
}

impl SessionState {
    /// Recompute the negotiated size and apply it if it moved
    fn renegotiate(&mut self, session_id: &str) -> bool {
        let size = negotiated_size(self.viewers.values().filter_map(|v| v.size.as_ref()));
        if size == self.size {
            return false;
        }

        debug!("Session {} resized {} -> {}", session_id, self.size, size);
        self.size = size;
        if let Some(process) = &self.process {
            if let Err(e) = process.resize(size) {
                warn!("Session {}: {}", session_id, e);
            }
        }
        self.screen.resize(size.rows, size.cols);
        true
    }

    /// Viewers still worth writing to
    fn targets(&self) -> Vec<(ViewerId, SharedSink)> {
        self.viewers
            .iter()
            .filter(|(_, viewer)| !viewer.failed)
            .map(|(id, viewer)| (*id, viewer.sink.clone()))
            .collect()
    }

    fn all_targets(&self) -> Vec<(ViewerId, SharedSink)> {
        self.viewers
            .iter()
            .map(|(id, viewer)| (*id, viewer.sink.clone()))
            .collect()
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

impl Session {
    pub fn new(id: impl Into<String>, program: Program, settings: SessionSettings) -> Self {
        let now = Utc::now();
        let size = DEFAULT_TERM_SIZE;
        Self {
            id: id.into(),
            program,
            recording_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            state: RwLock::new(SessionState {
                process: None,
                process_state: ProcessState::Starting,
                generation: 0,
                size,
                screen: Box::new(Vt100Screen::new(size.rows, size.cols)),
                ring: RingBuffer::new(settings.ring_buffer_bytes),
                viewers: HashMap::new(),
                name: None,
                last_activity: now,
                closed: false,
            }),
            settings,
            owner: watch::channel(None).0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Stable identifier handed to the recording wrapper
    pub fn recording_id(&self) -> &str {
        &self.recording_id
    }

    /// Follow which generation owns the session
    pub fn watch_owner(&self) -> watch::Receiver<Option<u64>> {
        self.owner.subscribe()
    }

    /// Install the first process before the session is shared
    pub fn set_initial_process(&mut self, process: ProcessHandle) -> u64 {
        let state = self.state.get_mut();
        state.process = Some(process);
        state.process_state = ProcessState::Starting;
        state.generation += 1;
        let generation = state.generation;
        self.owner.send_replace(Some(generation));
        generation
    }

    /// Install a restarted process, unless the session moved on while it was
    /// being spawned. Returns the new generation; on `None` the caller still
    /// owns the child and must stop it.
    pub async fn install_process(
        &self,
        process: ProcessHandle,
        spawned_at: TermSize,
        expected_generation: u64,
    ) -> Option<u64> {
        let mut state = self.state.write().await;
        if state.closed || state.generation != expected_generation {
            return None;
        }

        if state.size != spawned_at {
            if let Err(e) = process.resize(state.size) {
                warn!("Session {}: {}", self.id, e);
            }
        }
        state.process = Some(process);
        state.process_state = ProcessState::Starting;
        state.generation += 1;
        self.owner.send_replace(Some(state.generation));
        Some(state.generation)
    }

    /// Put `process` in place of the current one. The displaced process's
    /// pump sees the new owner and stops it.
    pub async fn swap_process(&self, process: ProcessHandle, spawned_at: TermSize) -> Result<u64> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }

        if state.size != spawned_at {
            if let Err(e) = process.resize(state.size) {
                warn!("Session {}: {}", self.id, e);
            }
        }
        if let Some(old) = state.process.replace(process) {
            info!("Session {}: replacing PID {:?}", self.id, old.pid());
        }
        state.process_state = ProcessState::Replaced;
        state.generation += 1;
        state.touch();
        self.owner.send_replace(Some(state.generation));
        Ok(state.generation)
    }

    /// The pump reaped `generation`'s process. Drops its handle so nothing
    /// resizes or writes to a dead PTY. Returns whether `generation` still
    /// owns the session.
    pub async fn release_exited(&self, generation: u64, exit_code: i32) -> bool {
        let mut state = self.state.write().await;
        if state.closed || state.generation != generation {
            return false;
        }
        state.process = None;
        state.process_state = ProcessState::Exited(exit_code);
        true
    }

    /// Output from `generation` has started flowing
    pub async fn mark_running(&self, generation: u64) {
        let mut state = self.state.write().await;
        if state.generation == generation && !state.closed {
            state.process_state = ProcessState::Running;
        }
    }

    /// Whether `generation` still owns the session
    pub async fn is_current(&self, generation: u64) -> bool {
        let state = self.state.read().await;
        !state.closed && state.generation == generation
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    pub async fn size(&self) -> TermSize {
        self.state.read().await.size
    }

    pub async fn viewer_count(&self) -> usize {
        self.state.read().await.viewers.len()
    }

    /// Register a viewer. With `resync`, the viewer first receives the
    /// scrollback and then a snapshot of the screen, both as chunk frames.
    pub async fn attach(
        &self,
        sink: SharedSink,
        initial_size: Option<TermSize>,
        resync: bool,
    ) -> Result<ViewerId> {
        let id = ViewerId::next();
        let mut state = self.state.write().await;
        if state.closed {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }

        state.viewers.insert(
            id,
            Viewer {
                sink: sink.clone(),
                size: initial_size.filter(|size| !size.is_empty()),
                failed: false,
            },
        );
        state.renegotiate(&self.id);
        state.touch();

        let frames = if resync {
            match self.resync_frames(&state) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("Session {}: resync for {} failed: {}", self.id, id, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // Nobody else can hold a brand new sink
        let mut guard = sink.lock_owned().await;
        let status = self.status_frame(&state);
        let targets = state.targets();
        drop(state);

        info!(
            "Session {}: {} attached ({} resync frames)",
            self.id,
            id,
            frames.len()
        );
        let resynced = send_all(id, &mut guard, &frames, self.settings.write_timeout).await;
        drop(guard);
        if !resynced {
            self.mark_failed(&[id]).await;
        }

        self.deliver(targets, &[status]).await;
        Ok(id)
    }

    pub async fn detach(&self, viewer: ViewerId) {
        let mut state = self.state.write().await;
        if state.viewers.remove(&viewer).is_none() {
            return;
        }
        state.renegotiate(&self.id);
        state.touch();
        info!(
            "Session {}: {} detached, {} remaining",
            self.id,
            viewer,
            state.viewers.len()
        );
        if state.closed {
            return;
        }

        let status = self.status_frame(&state);
        let targets = state.targets();
        drop(state);
        self.deliver(targets, &[status]).await;
    }

    /// Record a viewer's size. Returns whether the negotiated size changed.
    pub async fn update_viewer_size(&self, viewer: ViewerId, size: TermSize) -> bool {
        if size.is_empty() {
            debug!("Session {}: ignoring empty size from {}", self.id, viewer);
            return false;
        }

        let mut state = self.state.write().await;
        let Some(entry) = state.viewers.get_mut(&viewer) else {
            return false;
        };
        entry.size = Some(size);
        state.touch();
        if !state.renegotiate(&self.id) {
            return false;
        }

        let status = self.status_frame(&state);
        let targets = state.targets();
        drop(state);
        self.deliver(targets, &[status]).await;
        true
    }

    /// Queue viewer input for the process
    pub async fn write_input(&self, data: Vec<u8>) -> Result<()> {
        let input = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(RelayError::SessionClosed(self.id.clone()));
            }
            state.touch();
            state.process.as_ref().map(|process| process.input())
        };

        let input = input.ok_or_else(|| RelayError::Pty("no process attached".to_string()))?;
        input
            .send(data)
            .await
            .map_err(|_| RelayError::Pty("input stream closed".to_string()))
    }

    /// Apply one read of process output and fan it out. Returns `false` once
    /// `generation` no longer owns the session.
    pub async fn feed_output(&self, generation: u64, data: Bytes) -> bool {
        let mut state = self.state.write().await;
        if state.closed || state.generation != generation {
            return false;
        }
        state.screen.process(&data);
        state.ring.write(&data);
        let targets = state.targets();
        drop(state);

        self.deliver(targets, &[Outbound::Binary(data)]).await;
        true
    }

    /// Write a server notice into the terminal stream itself
    pub async fn narrate(&self, text: &str) {
        let data = Bytes::copy_from_slice(text.as_bytes());
        let mut state = self.state.write().await;
        if state.closed {
            return;
        }
        state.screen.process(&data);
        state.ring.write(&data);
        let targets = state.targets();
        drop(state);

        self.deliver(targets, &[Outbound::Binary(data)]).await;
    }

    pub async fn broadcast(&self, message: &ServerMessage) {
        let frame = match message.to_text() {
            Ok(text) => Outbound::Text(text),
            Err(e) => {
                warn!("Session {}: failed to encode message: {}", self.id, e);
                return;
            }
        };
        let targets = self.state.read().await.targets();
        self.deliver(targets, &[frame]).await;
    }

    /// Send a message to one viewer only
    pub async fn send_to(&self, viewer: ViewerId, message: &ServerMessage) {
        let frame = match message.to_text() {
            Ok(text) => Outbound::Text(text),
            Err(e) => {
                warn!("Session {}: failed to encode message: {}", self.id, e);
                return;
            }
        };
        let sink = {
            let state = self.state.read().await;
            match state.viewers.get(&viewer) {
                Some(entry) => entry.sink.clone(),
                None => return,
            }
        };
        let mut sink = sink.lock().await;
        let sent = send_all(viewer, &mut sink, &[frame], self.settings.write_timeout).await;
        drop(sink);
        if !sent {
            self.mark_failed(&[viewer]).await;
        }
    }

    pub async fn chat(&self, user_name: String, text: String) {
        self.touch().await;
        self.broadcast(&ServerMessage::chat(user_name, text)).await;
    }

    /// Set the display name and announce it
    pub async fn rename(&self, name: &str) -> Result<()> {
        validate_session_name(name)?;

        let mut state = self.state.write().await;
        state.name = Some(name.to_string());
        state.touch();
        info!("Session {} renamed to {:?}", self.id, name);
        let status = self.status_frame(&state);
        let targets = state.targets();
        drop(state);

        self.deliver(targets, &[status]).await;
        Ok(())
    }

    pub async fn touch(&self) {
        self.state.write().await.touch();
    }

    /// End the session and close every viewer. Returns `false` if it had
    /// already ended.
    pub async fn finish(&self, reason: EndReason) -> bool {
        let state = self.state.write().await;
        if state.closed {
            return false;
        }
        self.close(state, reason).await;
        true
    }

    /// Tear the session down if nobody is attached and it has been idle for
    /// longer than `ttl`. Checked and closed under one lock, so a viewer
    /// joining concurrently either keeps it alive or sees it closed.
    pub async fn finish_if_idle(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let state = self.state.write().await;
        if state.closed || !state.viewers.is_empty() {
            return false;
        }
        let idle = (now - state.last_activity).to_std().unwrap_or(Duration::ZERO);
        if idle <= ttl {
            return false;
        }

        info!("Session {} idle for {:?}, reaping", self.id, idle);
        self.close(state, EndReason::TornDown).await;
        true
    }

    async fn close(&self, mut state: RwLockWriteGuard<'_, SessionState>, reason: EndReason) {
        state.closed = true;
        if let EndReason::Exited(code) = reason {
            state.process_state = ProcessState::Exited(code);
        }
        let process = state.process.take();
        self.owner.send_replace(None);
        let targets = state.all_targets();
        drop(state);
        drop(process);

        info!("Session {} finished ({:?})", self.id, reason);
        self.deliver(targets, &[Outbound::Close]).await;
    }

    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    pub async fn summary(&self) -> SessionSummary {
        let state = self.state.read().await;
        SessionSummary {
            id: self.id.clone(),
            name: state.name.clone(),
            program: self.program.selector.clone(),
            assistant: self.program.display_name.clone(),
            viewers: state.viewers.len(),
            rows: state.size.rows,
            cols: state.size.cols,
            pid: state.process.as_ref().and_then(|p| p.pid()),
            process: state.process_state,
            scrollback_bytes: state.ring.len(),
            created_at: self.created_at,
            last_activity: state.last_activity,
        }
    }

    fn status_frame(&self, state: &SessionState) -> Outbound {
        let status = ServerMessage::Status {
            viewers: state.viewers.len(),
            cols: state.size.cols,
            rows: state.size.rows,
            assistant: self.program.display_name.clone(),
            session_name: state.name.clone(),
        };
        // Status has no fields that can fail to encode
        Outbound::Text(status.to_text().unwrap_or_default())
    }

    /// Scrollback first, then the screen, so the snapshot's cursor wins
    fn resync_frames(&self, state: &SessionState) -> Result<Vec<Outbound>> {
        let scrollback = compress(&state.ring.contents())?;
        let screen = compress(&generate_snapshot(state.screen.as_ref()))?;

        let frames = chunk(&scrollback, self.settings.max_chunk_size)
            .into_iter()
            .chain(chunk(&screen, self.settings.max_chunk_size))
            .map(|frame| Outbound::Binary(frame.encode()))
            .collect();
        Ok(frames)
    }

    async fn deliver(&self, targets: Vec<(ViewerId, SharedSink)>, frames: &[Outbound]) {
        let timeout = self.settings.write_timeout;
        let sends = targets.into_iter().map(|(id, sink)| async move {
            let mut sink = sink.lock().await;
            (id, send_all(id, &mut sink, frames, timeout).await)
        });
        let failed: Vec<ViewerId> = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|(_, sent)| !sent)
            .map(|(id, _)| id)
            .collect();
        if !failed.is_empty() {
            self.mark_failed(&failed).await;
        }
    }

    async fn mark_failed(&self, viewers: &[ViewerId]) {
        let mut state = self.state.write().await;
        for id in viewers {
            if let Some(viewer) = state.viewers.get_mut(id) {
                if !viewer.failed {
                    info!("Session {}: skipping {} until it disconnects", self.id, id);
                    viewer.failed = true;
                }
            }
        }
    }
}

#[cfg(test)]
impl Session {
    /// Rendered screen, uncompressed
    pub(crate) async fn snapshot(&self) -> Vec<u8> {
        let state = self.state.read().await;
        generate_snapshot(state.screen.as_ref())
    }

    pub(crate) async fn scrollback(&self) -> Vec<u8> {
        self.state.read().await.ring.contents()
    }
}

/// Write frames in order, giving up on this viewer at the first failure.
/// Returns whether every frame went out.
async fn send_all(
    viewer: ViewerId,
    sink: &mut Box<dyn ViewerSink>,
    frames: &[Outbound],
    timeout: Duration,
) -> bool {
    for frame in frames {
        match tokio::time::timeout(timeout, sink.send(frame.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", viewer, e);
                return false;
            }
            Err(_) => {
                warn!("Write to {} timed out after {:?}", viewer, timeout);
                return false;
            }
        }
    }
    true
}
