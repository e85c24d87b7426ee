//! Session registry, output pumps and the idle reaper
//!
//! The registry owns every live session. Each session gets one pump task that
//! drains its process output and, when the process exits, carries out the
//! lifecycle decision: announce and end, end silently, or restart. The pump
//! also owns the child, so it is the one that stops a process its session
//! replaced or tore down.

use crate::config::ServerConfig;
use crate::error::{RelayError, Result};
use crate::lifecycle::{self, ExitAction};
use crate::process::{self, CommandSpec, SpawnedProcess};
use crate::session::{EndReason, Session, SessionSettings, SessionSummary};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portable_pty::Child;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use ttyshare_proto::{ServerMessage, DEFAULT_TERM_SIZE};

/// Time between SIGHUP and SIGKILL for a process being stopped
const KILL_GRACE: Duration = Duration::from_millis(500);

/// How long shutdown waits for pumps to reap their processes
const SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    config: Arc<ServerConfig>,
    pumps: TaskTracker,
}

impl SessionRegistry {
    pub fn new(config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            config,
            pumps: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Find the session for `id`, creating it with `selector`'s program if it
    /// does not exist. Returns the session and whether it was just created.
    ///
    /// The map entry stays locked while the process spawns, so concurrent
    /// first attaches to one id spawn exactly one process.
    pub fn resolve_or_create(
        self: &Arc<Self>,
        id: &str,
        selector: &str,
    ) -> Result<(Arc<Session>, bool)> {
        let program = self.config.program(selector)?;

        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                let session = entry.get().clone();
                if session.program().selector != selector {
                    debug!(
                        "Session {} runs '{}', ignoring selector '{}'",
                        id,
                        session.program().selector,
                        selector
                    );
                }
                Ok((session, false))
            }
            Entry::Vacant(entry) => {
                let mut session =
                    Session::new(id, program, SessionSettings::from_config(&self.config));
                let command = self.prepare_command(&session, &session.program().start, 0);
                let SpawnedProcess {
                    handle,
                    reader,
                    child,
                } = process::spawn(&command, DEFAULT_TERM_SIZE)?;

                let generation = session.set_initial_process(handle);
                let session = Arc::new(session);
                entry.insert(session.clone());
                info!(
                    "Created session {} running '{}'",
                    id,
                    session.program().selector
                );

                self.start_pump(session.clone(), generation, reader, child);
                Ok((session, true))
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Operator-initiated swap: spawn `command` and put it in place of the
    /// current process, keeping viewers, screen and scrollback
    pub async fn replace_process(self: &Arc<Self>, id: &str, command: CommandSpec) -> Result<()> {
        let session = self
            .get(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;

        let size = session.size().await;
        let attempt = session.generation().await;
        let command = self.prepare_command(&session, &command, attempt);
        let SpawnedProcess {
            handle,
            reader,
            child,
        } = process::spawn(&command, size)?;

        let generation = match session.swap_process(handle, size).await {
            Ok(generation) => generation,
            Err(e) => {
                drop(reader);
                self.pumps.spawn(process::terminate(child, KILL_GRACE));
                return Err(e);
            }
        };

        info!("Session {}: replaced process with `{}`", id, command.display());
        session
            .narrate(&lifecycle::replaced_notice(&command.display()))
            .await;
        self.start_pump(session, generation, reader, child);
        Ok(())
    }

    /// Kill and remove one session
    pub async fn teardown(&self, id: &str) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;
        session.finish(EndReason::TornDown).await;
        Ok(())
    }

    /// Tear down every session with no viewers that has been idle past the
    /// TTL. A live process alone does not keep a session around.
    pub async fn reap_idle(&self) -> usize {
        let ttl = self.config.idle_ttl();
        let now = Utc::now();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut reaped = 0;
        for session in sessions {
            if session.finish_if_idle(ttl, now).await {
                self.remove_if_same(&session);
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!("Reaped {} idle sessions, {} remaining", reaped, self.len());
        }
        reaped
    }

    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.reap_interval());
            loop {
                interval.tick().await;
                registry.reap_idle().await;
            }
        })
    }

    /// Tear down everything and wait for the processes to be reaped, for
    /// server shutdown
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("Shutting down {} sessions", sessions.len());

        for session in sessions {
            self.remove_if_same(&session);
            session.finish(EndReason::TornDown).await;
        }

        self.pumps.close();
        if tokio::time::timeout(SHUTDOWN_WAIT, self.pumps.wait())
            .await
            .is_err()
        {
            warn!("{} output pumps still running at shutdown", self.pumps.len());
        }
    }

    fn remove_if_same(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));
    }

    /// Remove first so new attaches create a fresh session, then close
    async fn end(&self, session: &Arc<Session>, reason: EndReason) {
        self.remove_if_same(session);
        session.finish(reason).await;
    }

    fn prepare_command(&self, session: &Session, command: &CommandSpec, attempt: u64) -> CommandSpec {
        match &self.config.recording {
            Some(recording) => {
                let recording_id = match attempt {
                    0 => session.recording_id().to_string(),
                    n => format!("{}-{}", session.recording_id(), n),
                };
                recording.wrap(command, &recording_id)
            }
            None => command.clone(),
        }
    }

    fn start_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        generation: u64,
        reader: Box<dyn Read + Send>,
        child: Box<dyn Child + Send + Sync>,
    ) {
        let registry = self.clone();
        self.pumps.spawn(async move {
            registry.run_pump(session, generation, reader, child).await;
        });
    }

    async fn run_pump(
        self: Arc<Self>,
        session: Arc<Session>,
        mut generation: u64,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn Child + Send + Sync>,
    ) {
        let id = session.id().to_string();
        loop {
            let mut output = process::pump_output(reader, self.config.read_buffer_size);
            let mut owner = session.watch_owner();
            session.mark_running(generation).await;
            let mut wanted = true;
            loop {
                tokio::select! {
                    data = output.recv() => match data {
                        Some(data) => {
                            if !session.feed_output(generation, data).await {
                                wanted = false;
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = retired(&mut owner, generation) => {
                        wanted = false;
                        break;
                    }
                }
            }
            drop(output);

            let (exit_code, stopped) = if wanted {
                process::wait_or_terminate(child, retired(&mut owner, generation), KILL_GRACE)
                    .await
            } else {
                (process::terminate(child, KILL_GRACE).await, true)
            };
            if stopped || !session.release_exited(generation, exit_code).await {
                debug!(
                    "Session {}: process generation {} gone (code {})",
                    id, generation, exit_code
                );
                return;
            }

            let viewers = session.viewer_count().await;
            match lifecycle::decide(exit_code, viewers) {
                ExitAction::Announce { exit_code } => {
                    info!("Session {}: process exited with code {}", id, exit_code);
                    session.narrate(&lifecycle::exit_notice(exit_code)).await;
                    session.broadcast(&ServerMessage::Exit { exit_code }).await;
                    self.end(&session, EndReason::Exited(exit_code)).await;
                    return;
                }
                ExitAction::EndSilently => {
                    info!(
                        "Session {}: process exited with code {} and nobody is watching",
                        id, exit_code
                    );
                    self.end(&session, EndReason::Exited(exit_code)).await;
                    return;
                }
                ExitAction::Restart { exit_code } => {
                    let delay = self.config.restart_delay();
                    warn!(
                        "Session {}: process exited with code {}, restarting in {:?}",
                        id, exit_code, delay
                    );
                    session
                        .narrate(&lifecycle::restart_notice(exit_code, delay))
                        .await;
                    tokio::time::sleep(delay).await;
                    if !session.is_current(generation).await {
                        return;
                    }

                    let size = session.size().await;
                    let command =
                        self.prepare_command(&session, &session.program().restart, generation);
                    let spawned = match process::spawn(&command, size) {
                        Ok(spawned) => spawned,
                        Err(e) => {
                            error!("Session {}: restart failed: {}", id, e);
                            session
                                .narrate(&lifecycle::restart_failed_notice(&e.to_string()))
                                .await;
                            session
                                .broadcast(&ServerMessage::Error {
                                    message: e.to_string(),
                                })
                                .await;
                            session.broadcast(&ServerMessage::Exit { exit_code }).await;
                            self.end(&session, EndReason::Exited(exit_code)).await;
                            return;
                        }
                    };

                    match session
                        .install_process(spawned.handle, size, generation)
                        .await
                    {
                        Some(next) => {
                            info!("Session {}: restarted as generation {}", id, next);
                            generation = next;
                            reader = spawned.reader;
                            child = spawned.child;
                        }
                        None => {
                            // Replaced or torn down during the spawn
                            drop(spawned.reader);
                            process::terminate(spawned.child, KILL_GRACE).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Resolves once `generation` no longer owns the session
async fn retired(owner: &mut watch::Receiver<Option<u64>>, generation: u64) {
    loop {
        let current = *owner.borrow_and_update();
        if current != Some(generation) {
            return;
        }
        if owner.changed().await.is_err() {
            return;
        }
    }
}
