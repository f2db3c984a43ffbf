#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod clean;
pub mod config;
mod core;
pub mod engine;
mod error;
mod file;
pub mod pipeline;
pub mod recipe;
mod source;
mod sourcemap;
pub mod transform;

#[cfg(feature = "live")]
use std::time::Duration;

use console::style;

pub use crate::clean::clean;
pub use crate::config::Config;
pub use crate::core::{Environment, Mode};
pub use crate::engine::{
    Action, Diagnostics, Plan, ServeOptions, Stage, Status, TaskContext, TaskGraph, TaskReport,
    WatchBinding,
};
pub use crate::error::*;
pub use crate::file::{File, FileSet};
pub use crate::pipeline::{Pipeline, PipelineReport, Step};
pub use crate::source::{Source, glob_base};
pub use crate::sourcemap::{PositionMap, Segment, SourceMap};
pub use crate::transform::{FileTransform, Registry, SetTransform, StepContext, Transform};

/// A configured project: its settings and its task graph.
pub struct Nagare {
    config: Config,
    graph: TaskGraph,
}

impl Nagare {
    pub fn new(config: Config, graph: TaskGraph) -> Self {
        Self { config, graph }
    }

    /// The standard recipe with every built-in transform.
    pub fn standard(config: Config) -> Result<Self, ConfigError> {
        let graph = recipe::standard(&config, &Registry::builtin())?;
        Ok(Self::new(config, graph))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn plan<I, S>(&self, targets: I) -> Result<Plan, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.graph.resolve_many(targets)
    }

    /// Resolve and run the targets.
    ///
    /// A plan containing a serving task with watch bindings runs in
    /// [`Mode::Watch`]: the live-reload server starts first, the plan runs
    /// once and then the watch loop takes over until Ctrl-C. Otherwise the
    /// plan runs once in [`Mode::Build`] and serving tasks (if any) keep
    /// serving until Ctrl-C.
    ///
    /// Failed tasks don't make this an error, check
    /// [`Diagnostics::failed`].
    pub fn run<I, S>(&self, targets: I) -> Result<Diagnostics, NagareError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let plan = self.plan(targets)?;
        let servers = engine::servers(&self.graph, &plan);
        let watching = servers.iter().any(|s| !s.bindings.is_empty());
        let mode = if watching { Mode::Watch } else { Mode::Build };

        let root = self
            .config
            .root
            .canonicalize_utf8()
            .unwrap_or_else(|_| self.config.root.clone());
        let env = Environment::new(root, mode).with_cache(&self.config.cache);

        #[cfg(feature = "live")]
        let (env, reload) = if watching {
            let reload =
                engine::ReloadServer::bind(self.config.serve.reload_port).map_err(WatchError::Io)?;
            (env.with_reload_port(reload.port()), Some(reload))
        } else {
            (env, None)
        };
        #[cfg(not(feature = "live"))]
        if watching {
            tracing::warn!("built without the `live` feature, changes won't be watched");
        }

        tracing::info!(
            "Running {} task(s) in {} stage(s)",
            style(plan.len()).cyan(),
            style(plan.stages().len()).cyan()
        );
        let diagnostics = engine::execute(&self.graph, &plan, &env);
        diagnostics.summary();

        if servers.is_empty() || (mode == Mode::Build && diagnostics.failed()) {
            return Ok(diagnostics);
        }

        #[cfg(feature = "live")]
        if let Some(reload) = reload {
            let debounce = Duration::from_millis(self.config.serve.debounce_ms);
            engine::watch(&self.graph, &servers, &env, reload, debounce)?;
            return Ok(diagnostics);
        }

        engine::serve(&servers, &env)?;
        Ok(diagnostics)
    }
}
