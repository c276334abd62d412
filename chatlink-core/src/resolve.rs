//! Turn a typed path into an existing regular file.

use std::fs;
use std::path::PathBuf;

pub trait PathResolver: Send + Sync {
    /// `Some(canonical path)` only when `raw` names an existing regular file.
    fn resolve(&self, raw: &str) -> Option<PathBuf>;
}

/// Expands a leading `~` from `$HOME`; relative paths resolve against the working directory.
#[derive(Debug, Clone)]
pub struct HomePathResolver {
    home: Option<PathBuf>,
}

impl HomePathResolver {
    pub fn new() -> Self {
        Self {
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
        }
    }

    fn expand(&self, raw: &str) -> PathBuf {
        let raw = raw.trim();
        if let (Some(rest), Some(home)) = (raw.strip_prefix('~'), &self.home) {
            if rest.is_empty() {
                return home.clone();
            }
            if let Some(rest) = rest.strip_prefix('/') {
                return home.join(rest);
            }
        }
        PathBuf::from(raw)
    }
}

impl Default for HomePathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver for HomePathResolver {
    fn resolve(&self, raw: &str) -> Option<PathBuf> {
        let path = fs::canonicalize(self.expand(raw)).ok()?;
        path.is_file().then_some(path)
    }
}
