//! JSON configuration file loading.
//!
//! Replaces the SQLite-backed `ConfigStore` this crate's ambient stack would
//! otherwise carry: this system's configuration surface is a static file
//! read once at startup, not a hot-reloadable runtime store, so a plain
//! `serde_json` load is the right fit rather than `sqlx` + `arc-swap`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    7000
}

fn default_mtu() -> usize {
    1400
}

fn default_frame_period_ms() -> u64 {
    33
}

fn default_queue_capacity() -> usize {
    240
}

fn default_ice_disconnect_grace_secs() -> u64 {
    10
}

fn default_stun_server() -> String {
    "stun:stun.l.google.com:19302".to_string()
}

/// Top-level application configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Encoder binary, looked up on `PATH` if not absolute.
    pub app: String,
    /// Arguments passed to the encoder binary.
    pub args: Vec<String>,
    /// Currently only `"rtp"` is implemented.
    pub stream_type: String,
    /// When set, the encoder writes to this named pipe instead of stdout.
    #[serde(default)]
    pub pipe_name: Option<String>,
    /// When true, the reader only begins draining the encoder once a
    /// viewer is connected (see the fan-out's connected-viewer latch).
    #[serde(default)]
    pub from_file: bool,
    /// When true, encoder stderr is forwarded to this process's stderr;
    /// otherwise it's written to `<app>.log`.
    #[serde(default)]
    pub stderr: bool,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default = "default_frame_period_ms")]
    pub frame_period_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_ice_disconnect_grace_secs")]
    pub ice_disconnect_grace_secs: u64,
    #[serde(default = "default_stun_server")]
    pub stun_server: String,
}

impl Settings {
    /// Load and validate a configuration file. Missing required keys or
    /// malformed JSON is a fatal startup error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::Config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;

        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("malformed config JSON: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.app.trim().is_empty() {
            return Err(AppError::Config("`app` must not be empty".into()));
        }
        if self.args.is_empty() {
            return Err(AppError::Config(
                "`args` must contain at least one element".into(),
            ));
        }
        if self.stream_type != "rtp" {
            return Err(AppError::Config(format!(
                "unsupported stream_type '{}': only 'rtp' is implemented",
                self.stream_type
            )));
        }
        if which(&self.app).is_none() {
            return Err(AppError::Config(format!(
                "encoder binary '{}' not found on PATH",
                self.app
            )));
        }
        Ok(())
    }
}

/// Minimal `PATH` lookup, avoiding a dependency on the `which` crate for a
/// single startup check.
fn which(binary: &str) -> Option<std::path::PathBuf> {
    let candidate = Path::new(binary);
    if candidate.is_absolute() || binary.contains('/') {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(binary))
            .find(|full| full.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    #[test]
    fn rejects_missing_required_keys() {
        let f = write_config(r#"{"app": "", "args": [], "stream_type": "rtp"}"#);
        assert!(Settings::load(f.path()).is_err());
    }

    #[test]
    fn rejects_unsupported_stream_type() {
        let f = write_config(
            r#"{"app": "sh", "args": ["-c", "true"], "stream_type": "mjpeg"}"#,
        );
        assert!(Settings::load(f.path()).is_err());
    }

    #[test]
    fn applies_ambient_defaults() {
        let f = write_config(r#"{"app": "sh", "args": ["-c", "true"], "stream_type": "rtp"}"#);
        let settings = Settings::load(f.path()).unwrap();
        assert_eq!(settings.listen_port, 7000);
        assert_eq!(settings.mtu, 1400);
        assert_eq!(settings.ice_disconnect_grace_secs, 10);
    }
}
