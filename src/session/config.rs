use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::session::error::Error;

/// Session behavior knobs. All defaults reproduce the behavior of a plain
/// gdb backend; a TOML file may override any subset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signals that never surface a visible stop; the session silently
    /// resumes when one is reported.
    pub quiet_signals: Vec<String>,
    /// Signal the backend raises in response to an interrupt request.
    pub async_break_signal: String,
    /// Treat the first reason-less stop as an unannounced entry-point stop
    /// and resume once. Known quirk of gdb<->gdbserver and MinGW attach.
    pub implicit_entry_stop: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quiet_signals: [
                "SIG32", "SIG33", "SIGALRM", "SIGURG", "SIGCHLD", "SIGIO", "SIGVTALRM", "SIGPROF",
            ]
            .map(str::to_string)
            .to_vec(),
            async_break_signal: "SIGINT".to_string(),
            implicit_entry_stop: true,
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn is_quiet_signal(&self, name: &str) -> bool {
        self.quiet_signals.iter().any(|s| s == name)
    }
}
