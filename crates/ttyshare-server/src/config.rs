//! Server configuration
//!
//! Layered through the `config` crate: built-in defaults, an optional config
//! file, then `TTYSHARE__*` environment variables. CLI flags are applied on top
//! by the binary.

use crate::error::{RelayError, Result};
use crate::process::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TTYSHARE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Fixed directory viewer uploads are written to
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Idle time after which a session with no viewers is reaped
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Pause between a crash and the restart attempt
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_ring_buffer_bytes")]
    pub ring_buffer_bytes: usize,
    /// Payload limit per resync chunk frame
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Size of each PTY read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Selector used when a viewer does not name one
    #[serde(default = "default_program")]
    pub default_program: String,
    #[serde(default = "default_programs")]
    pub programs: HashMap<String, ProgramConfig>,
    #[serde(default)]
    pub recording: Option<RecordingConfig>,
}

/// One entry of the program table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Name shown to viewers in status messages
    #[serde(default)]
    pub display_name: Option<String>,
    /// Command for a fresh session
    pub start: Vec<String>,
    /// Command used after a crash; falls back to `start`
    #[serde(default)]
    pub restart: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment as `KEY=VALUE` entries. A list keeps key case intact
    /// through the config loader.
    #[serde(default)]
    pub env: Vec<String>,
}

/// Wraps the spawned command for capture. Placeholders:
/// `{command}` is the shell-quoted original command line,
/// `{file}` is `<dir>/<recording id>.cast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub dir: PathBuf,
    pub wrapper: Vec<String>,
}

/// Resolved program entry handed to a session
#[derive(Debug, Clone)]
pub struct Program {
    pub selector: String,
    pub display_name: String,
    pub start: CommandSpec,
    pub restart: CommandSpec,
}

fn default_bind_address() -> String {
    "0.0.0.0:7681".to_string()
}

fn default_upload_dir() -> PathBuf {
    std::env::temp_dir().join("ttyshare-uploads")
}

fn default_idle_ttl_secs() -> u64 {
    3600
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_ring_buffer_bytes() -> usize {
    1024 * 1024
}

fn default_max_chunk_size() -> usize {
    16 * 1024
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_max_upload_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_programs() -> HashMap<String, ProgramConfig> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let mut programs = HashMap::new();
    programs.insert(
        "claude".to_string(),
        ProgramConfig {
            display_name: Some("Claude".to_string()),
            start: vec!["claude".to_string()],
            restart: Some(vec!["claude".to_string(), "--continue".to_string()]),
            working_dir: None,
            env: Vec::new(),
        },
    );
    programs.insert(
        "shell".to_string(),
        ProgramConfig {
            display_name: Some("Shell".to_string()),
            start: vec![shell],
            restart: None,
            working_dir: None,
            env: Vec::new(),
        },
    );
    programs
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            upload_dir: default_upload_dir(),
            idle_ttl_secs: default_idle_ttl_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            restart_delay_ms: default_restart_delay_ms(),
            ring_buffer_bytes: default_ring_buffer_bytes(),
            max_chunk_size: default_max_chunk_size(),
            read_buffer_size: default_read_buffer_size(),
            write_timeout_ms: default_write_timeout_ms(),
            max_upload_bytes: default_max_upload_bytes(),
            default_program: default_program(),
            programs: default_programs(),
            recording: None,
        }
    }
}

impl ServerConfig {
    /// Load from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.programs.is_empty() {
            return Err(RelayError::Config("no programs configured".into()));
        }
        for (selector, program) in &self.programs {
            if program.start.is_empty() {
                return Err(RelayError::Config(format!(
                    "program '{}' has an empty start command",
                    selector
                )));
            }
            if let Some(bad) = program.env.iter().find(|entry| !entry.contains('=')) {
                return Err(RelayError::Config(format!(
                    "program '{}' has an env entry without '=': {}",
                    selector, bad
                )));
            }
            if matches!(&program.restart, Some(restart) if restart.is_empty()) {
                return Err(RelayError::Config(format!(
                    "program '{}' has an empty restart command",
                    selector
                )));
            }
        }
        if !self.programs.contains_key(&self.default_program) {
            return Err(RelayError::Config(format!(
                "default program '{}' is not in the program table",
                self.default_program
            )));
        }
        if self.ring_buffer_bytes == 0 || self.read_buffer_size == 0 || self.max_chunk_size == 0 {
            return Err(RelayError::Config(
                "buffer and chunk sizes must be non-zero".into(),
            ));
        }
        if let Some(recording) = &self.recording {
            if recording.wrapper.is_empty() {
                return Err(RelayError::Config("recording wrapper is empty".into()));
            }
        }
        Ok(())
    }

    /// Look up a program selector
    pub fn program(&self, selector: &str) -> Result<Program> {
        let entry = self
            .programs
            .get(selector)
            .ok_or_else(|| RelayError::UnknownProgram(selector.to_string()))?;

        let env: Vec<(String, String)> = entry
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let build = |argv: &[String]| CommandSpec {
            argv: argv.to_vec(),
            working_dir: entry.working_dir.clone(),
            env: env.clone(),
        };

        Ok(Program {
            selector: selector.to_string(),
            display_name: entry
                .display_name
                .clone()
                .unwrap_or_else(|| selector.to_string()),
            start: build(&entry.start),
            restart: build(entry.restart.as_deref().unwrap_or(&entry.start)),
        })
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl RecordingConfig {
    /// Rewrite `command` so the wrapper records it under `recording_id`
    pub fn wrap(&self, command: &CommandSpec, recording_id: &str) -> CommandSpec {
        let original = shell_words::join(&command.argv);
        let file = self
            .dir
            .join(format!("{}.cast", recording_id))
            .to_string_lossy()
            .to_string();

        let argv = self
            .wrapper
            .iter()
            .map(|arg| arg.replace("{command}", &original).replace("{file}", &file))
            .collect();

        CommandSpec {
            argv,
            working_dir: command.working_dir.clone(),
            env: command.env.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.programs.contains_key("claude"));
    }

    #[test]
    fn test_program_lookup_uses_restart_variant() {
        let config = ServerConfig::default();
        let program = config.program("claude").unwrap();
        assert_eq!(program.display_name, "Claude");
        assert_eq!(program.start.argv, vec!["claude"]);
        assert_eq!(program.restart.argv, vec!["claude", "--continue"]);
    }

    #[test]
    fn test_restart_falls_back_to_start() {
        let config = ServerConfig::default();
        let program = config.program("shell").unwrap();
        assert_eq!(program.start.argv, program.restart.argv);
    }

    #[test]
    fn test_unknown_program() {
        let config = ServerConfig::default();
        assert!(matches!(
            config.program("vim"),
            Err(RelayError::UnknownProgram(name)) if name == "vim"
        ));
    }

    #[test]
    fn test_validate_rejects_missing_default_program() {
        let mut config = ServerConfig::default();
        config.default_program = "missing".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_env_entry() {
        let mut config = ServerConfig::default();
        config
            .programs
            .get_mut("shell")
            .unwrap()
            .env
            .push("NOEQUALS".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_start() {
        let mut config = ServerConfig::default();
        config.programs.get_mut("claude").unwrap().start.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
bind_address = "127.0.0.1:9000"
default_program = "bash"
idle_ttl_secs = 5

[programs.bash]
display_name = "Bash"
start = ["/bin/bash"]
restart = ["/bin/bash", "-l"]
env = ["PROJECT_ROOT=/srv/App"]
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.idle_ttl(), Duration::from_secs(5));
        assert_eq!(config.programs.len(), 1);
        let program = config.program("bash").unwrap();
        assert_eq!(program.restart.argv, vec!["/bin/bash", "-l"]);
        assert_eq!(
            program.start.env,
            vec![("PROJECT_ROOT".to_string(), "/srv/App".to_string())]
        );
        // Untouched fields keep their defaults
        assert_eq!(config.max_chunk_size, 16 * 1024);
    }

    #[test]
    fn test_recording_wrap() {
        let recording = RecordingConfig {
            dir: PathBuf::from("/var/rec"),
            wrapper: vec![
                "asciinema".into(),
                "rec".into(),
                "--command".into(),
                "{command}".into(),
                "{file}".into(),
            ],
        };
        let command = CommandSpec::new(vec!["claude".into(), "--model".into(), "a b".into()]);
        let wrapped = recording.wrap(&command, "rec-1");
        assert_eq!(
            wrapped.argv,
            vec![
                "asciinema",
                "rec",
                "--command",
                "claude --model 'a b'",
                "/var/rec/rec-1.cast"
            ]
        );
    }
}
