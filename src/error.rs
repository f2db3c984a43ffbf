use std::fmt::{self, Display};

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors in the declared configuration: the task graph, globs, transform
/// options or the config file itself. These are reported before (or instead
/// of) running anything.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task '{0}' is defined more than once")]
    DuplicateTask(String),

    #[error("Task '{0}' is not defined")]
    UnknownTask(String),

    #[error("Task '{task}' depends on unknown task '{missing}'")]
    UnknownDependency { task: String, missing: String },

    #[error("Cycle detected in task graph: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Glob root '{0}' does not exist")]
    MissingGlobRoot(Utf8PathBuf),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("Invalid options for transform '{name}': {source}")]
    Options {
        name: String,
        source: serde_json::Error,
    },

    #[error("Invalid browser target '{0}'")]
    BrowserQuery(String),

    #[error("Couldn't read config file '{path}': {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse config file '{path}': {source}")]
    Parse {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },

    #[error("Refusing to delete '{0}', it is not inside the project root")]
    CleanOutsideRoot(Utf8PathBuf),
}

/// A failure of a single transform on a single file.
///
/// In multi-file pipelines this removes only the offending file from the
/// stream; the remaining files keep flowing through the steps.
#[derive(Debug, Clone)]
pub struct TransformError {
    /// Name of the transform that failed.
    pub transform: String,
    /// Path of the offending file.
    pub path: Utf8PathBuf,
    /// 1-based line, if known.
    pub line: Option<u32>,
    /// 1-based column, if known.
    pub column: Option<u32>,
    pub message: String,
}

impl TransformError {
    pub fn new(
        transform: impl Into<String>,
        path: impl Into<Utf8PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            transform: transform.into(),
            path: path.into(),
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.transform, self.path)?;
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, ":{line}:{column}")?,
            (Some(line), None) => write!(f, ":{line}")?,
            _ => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for TransformError {}

/// Errors raised while running a task.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't write '{path}': {source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("{} file(s) failed", .0.len())]
    Files(Vec<TransformError>),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Watch channel closed unexpectedly")]
    Disconnected,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Top-level error returned by the orchestrator.
#[derive(Debug, Error)]
pub enum NagareError {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while building:\n{0}")]
    Build(#[from] BuildError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_error_display_includes_location() {
        let err = TransformError::new("sass", "app/styles/main.scss", "expected \";\"").at(3, 14);
        assert_eq!(
            err.to_string(),
            "[sass] app/styles/main.scss:3:14: expected \";\""
        );
    }

    #[test]
    fn cycle_display_lists_path() {
        let err = ConfigError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Cycle detected in task graph: a -> b -> a");
    }
}
