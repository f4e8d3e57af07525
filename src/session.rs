//! On-disk capture sessions.
//!
//! A session is one directory under the configured base directory holding the
//! captures of a run:
//! - unique directory per session
//! - automatic cleanup unless explicitly preserved
//! - a `.session.json` metadata file

use std::fs;
use std::path::{Path, PathBuf};

use crate::config;

/// A capture session with organized file management
#[derive(Debug)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Whether to keep files after session ends
    pub keep: bool,
}

impl Session {
    /// Create a session under the configured base directory
    pub fn new() -> Self {
        Self::in_base(config::session_base_dir())
    }

    /// Create a session with a fresh ID under `base`
    pub fn in_base(base: impl AsRef<Path>) -> Self {
        let id = generate_session_id();
        let dir = base.as_ref().join(&id);
        Self {
            id,
            dir,
            keep: false,
        }
    }

    /// Use an explicit directory. It is kept by default.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(generate_session_id);

        Self { id, dir, keep: true }
    }

    /// Set whether to keep files after session ends
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Initialize the session directory
    pub fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
        });
        fs::write(
            self.dir.join(".session.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        Ok(())
    }

    /// Path for a capture file
    pub fn capture_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.png", sanitize_name(name)))
    }

    /// Write PNG bytes under `name` and return the path
    pub fn write_capture(&self, name: &str, png: &[u8]) -> std::io::Result<PathBuf> {
        if !self.dir.exists() {
            self.init()?;
        }
        let path = self.capture_path(name);
        fs::write(&path, png)?;
        Ok(path)
    }

    /// List all PNG files in the session
    pub fn list_captures(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut captures = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "png") {
                    captures.push(path);
                }
            }
        }
        captures.sort();
        Ok(captures)
    }

    /// Clean up the session directory
    pub fn cleanup(&self) -> std::io::Result<()> {
        if self.dir.exists() && !self.keep {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

fn generate_session_id() -> String {
    format!(
        "session_{}_{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

/// Sanitize a name for use in filenames
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}
