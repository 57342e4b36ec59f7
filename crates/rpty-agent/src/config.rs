//! Agent configuration: TOML file + CLI overrides.

use crate::metrics::Metrics;
use crate::pty::CommandSpec;
use crate::session::{Options, ScreenOptions};
use rpty_core::{BackendType, RptyError, RptyResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub screen: ScreenSection,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub backend: BackendType,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            idle_timeout: default_idle_timeout(),
            backend: BackendType::Auto,
            buffer_size: default_buffer_size(),
            max_sessions: default_max_sessions(),
            shell: None,
        }
    }
}

/// `[screen]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenSection {
    #[serde(default = "default_screen_program")]
    pub program: String,
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Seconds.
    #[serde(default = "default_attach_timeout")]
    pub attach_timeout: u64,
}

impl Default for ScreenSection {
    fn default() -> Self {
        Self {
            program: default_screen_program(),
            state_dir: None,
            retry_interval_ms: default_retry_interval_ms(),
            attach_timeout: default_attach_timeout(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:4423".to_string()
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_buffer_size() -> usize {
    64 * 1024
}
fn default_max_sessions() -> usize {
    100
}
fn default_screen_program() -> String {
    "screen".to_string()
}
fn default_retry_interval_ms() -> u64 {
    250
}
fn default_attach_timeout() -> u64 {
    30
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub idle_timeout: Option<u64>,
    pub backend: Option<BackendType>,
    pub buffer_size: Option<usize>,
}

/// Resolved agent configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen: String,
    pub idle_timeout: Duration,
    pub backend: BackendType,
    pub buffer_size: usize,
    pub max_sessions: usize,
    pub shell: String,
    pub screen: ScreenOptions,
}

impl AgentConfig {
    /// Load config from TOML file, then apply CLI overrides. A missing file
    /// means defaults.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> RptyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, overrides))
    }

    fn resolve(file: ConfigFile, overrides: Overrides) -> Self {
        let defaults = ScreenOptions::default();
        let screen = ScreenOptions {
            program: file.screen.program,
            state_dir: file
                .screen
                .state_dir
                .map(|dir| expand_tilde_str(&dir))
                .unwrap_or(defaults.state_dir),
            retry_interval: Duration::from_millis(file.screen.retry_interval_ms),
            attach_timeout: Duration::from_secs(file.screen.attach_timeout),
            ..defaults
        };

        Self {
            listen: overrides.listen.unwrap_or(file.agent.listen),
            idle_timeout: Duration::from_secs(
                overrides.idle_timeout.unwrap_or(file.agent.idle_timeout),
            ),
            backend: overrides.backend.unwrap_or(file.agent.backend),
            buffer_size: overrides.buffer_size.unwrap_or(file.agent.buffer_size),
            max_sessions: file.agent.max_sessions,
            shell: file.agent.shell.unwrap_or_else(CommandSpec::default_shell),
            screen,
        }
    }

    /// Session options for this config, reporting failures to `metrics`.
    pub fn session_options(&self, metrics: Arc<dyn Metrics>) -> Options {
        Options {
            timeout: self.idle_timeout,
            backend_type: self.backend,
            buffer_size: self.buffer_size,
            metrics,
            screen: self.screen.clone(),
            ..Options::default()
        }
    }
}

fn parse(content: &str) -> RptyResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RptyError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
