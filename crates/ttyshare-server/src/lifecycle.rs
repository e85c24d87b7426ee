//! Process lifecycle state machine
//!
//! ```text
//! Starting -> Running -> Exited(code)
//!                 \----> Replaced -> Running
//! ```
//!
//! The decision taken when a process exits is a pure function of the exit
//! code and how many viewers are attached; the session registry carries out
//! the side effects.

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "code")]
pub enum ProcessState {
    Starting,
    Running,
    Exited(i32),
    /// Killed by an operator so another command can take its place
    Replaced,
}

/// What to do after the process exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Narrate the exit, send one `exit` event, end the session
    Announce { exit_code: i32 },
    /// Nobody is watching; end without a word
    EndSilently,
    /// Narrate, wait, then respawn with the restart command
    Restart { exit_code: i32 },
}

pub fn decide(exit_code: i32, viewers: usize) -> ExitAction {
    match (exit_code, viewers) {
        (0, _) => ExitAction::Announce { exit_code },
        (_, 0) => ExitAction::EndSilently,
        _ => ExitAction::Restart { exit_code },
    }
}

pub fn exit_notice(exit_code: i32) -> String {
    format!("\r\n\x1b[0m[Process exited with code {}]\r\n", exit_code)
}

pub fn restart_notice(exit_code: i32, delay: Duration) -> String {
    format!(
        "\r\n\x1b[0m[Process exited with code {}, restarting in {}ms...]\r\n",
        exit_code,
        delay.as_millis()
    )
}

pub fn restart_failed_notice(error: &str) -> String {
    format!("\r\n\x1b[0m[Restart failed: {}]\r\n", error)
}

pub fn replaced_notice(command: &str) -> String {
    format!("\r\n\x1b[0m[Switching to `{}`]\r\n", command)
}
