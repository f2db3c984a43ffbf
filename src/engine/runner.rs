mod diagnostics;
#[cfg(feature = "server")]
mod http;
#[cfg(feature = "live")]
pub(crate) mod reload;
#[cfg(feature = "live")]
pub(crate) mod watch;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Instant;

use console::style;
use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::clean::clean;
use crate::core::{Environment, Mode};
use crate::error::BuildError;

use super::{Action, Plan, ServeOptions, Stage, Task, TaskContext, TaskGraph};

pub use diagnostics::{Diagnostics, Status, TaskReport};

#[derive(Debug, Default)]
struct Outcome {
    files: usize,
    bytes: u64,
    failures: usize,
}

/// Run every stage of the plan in order.
///
/// Tasks of a parallel stage run on the rayon pool and the stage finishes
/// when all of them do. In [`Mode::Build`] the first failure raises an abort
/// flag: tasks that haven't started yet are skipped, the ones already running
/// finish. In [`Mode::Watch`] failures are logged and the plan carries on.
pub fn execute(graph: &TaskGraph, plan: &Plan, env: &Environment) -> Diagnostics {
    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(plan.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        root_span.pb_set_style(&style.progress_chars("=>-"));
    }
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let abort = AtomicBool::new(false);
    let mut reports = Vec::with_capacity(plan.len());

    for stage in plan.stages() {
        match stage {
            Stage::Single(name) => reports.push(run_task(graph, name, env, &abort)),
            Stage::Parallel(names) => {
                let (sender, receiver) = mpsc::channel();

                rayon::scope(|s| {
                    for name in names {
                        let sender = sender.clone();
                        let abort = &abort;
                        s.spawn(move |_| {
                            let _ = sender.send(run_task(graph, name, env, abort));
                        });
                    }
                });

                drop(sender);
                let mut done: Vec<TaskReport> = receiver.into_iter().collect();
                done.sort_by_key(|r| names.iter().position(|n| *n == r.name));
                reports.extend(done);
            }
        }

        root_span.pb_inc(stage.tasks().len() as u64);
    }

    Diagnostics { reports }
}

fn run_task(graph: &TaskGraph, name: &str, env: &Environment, abort: &AtomicBool) -> TaskReport {
    let start = Instant::now();

    if abort.load(Ordering::SeqCst) {
        tracing::warn!("Skipping '{}'", style(name).cyan());
        return TaskReport::new(name, start, Status::Skipped);
    }

    let span = tracing::span!(Level::INFO, "task", name = %name);
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} {pos}/{len}") {
        span.pb_set_style(&style);
    }
    span.pb_set_message(name);
    let _enter = span.enter();

    tracing::info!("Starting '{}'...", style(name).cyan());

    let result = match graph.get(name) {
        Some(task) => match catch_unwind(AssertUnwindSafe(|| perform(task, env))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };
                Err(BuildError::Task(name.to_string(), anyhow::anyhow!(msg)))
            }
        },
        None => Err(BuildError::Config(crate::error::ConfigError::UnknownTask(
            name.to_string(),
        ))),
    };

    let mut report = TaskReport::new(name, start, Status::Done);
    report.duration = start.elapsed();

    match result {
        Ok(outcome) => {
            tracing::info!(
                "Finished '{}' after {}",
                style(name).cyan(),
                style(format!("{:.2?}", report.duration)).magenta()
            );
            report.files = outcome.files;
            report.bytes = outcome.bytes;
            report.failures = outcome.failures;
        }
        Err(e) => {
            tracing::error!(
                "'{}' errored after {}\n{e}",
                style(name).cyan(),
                style(format!("{:.2?}", report.duration)).magenta()
            );
            if let BuildError::Files(failures) = &e {
                report.failures = failures.len();
            }
            if env.mode == Mode::Build {
                abort.store(true, Ordering::SeqCst);
            }
            report.status = Status::Failed(e.to_string());
        }
    }

    report
}

fn perform(task: &Task, env: &Environment) -> Result<Outcome, BuildError> {
    match &task.action {
        Action::Noop => Ok(Outcome::default()),
        Action::Pipeline(pipeline) => {
            let report = pipeline.run(env)?;
            Ok(Outcome {
                files: report.files,
                bytes: report.bytes,
                failures: report.failures.len(),
            })
        }
        Action::Clean(source) => Ok(Outcome {
            files: clean(env, source)?,
            ..Outcome::default()
        }),
        Action::Serve(options) => {
            tracing::debug!("serving {} on port {} once the plan is done", options.dir, options.port);
            Ok(Outcome::default())
        }
        Action::Custom(f) => {
            let ctx = TaskContext {
                name: &task.name,
                env,
            };
            f(&ctx).map_err(|e| BuildError::Task(task.name.clone(), e))?;
            Ok(Outcome::default())
        }
    }
}

/// Serve actions of the planned tasks, in plan order.
pub(crate) fn servers(graph: &TaskGraph, plan: &Plan) -> Vec<ServeOptions> {
    plan.tasks()
        .filter_map(|name| graph.get(name))
        .filter_map(|task| match &task.action {
            Action::Serve(options) => Some(options.clone()),
            _ => None,
        })
        .collect()
}

type ServerHandle = JoinHandle<anyhow::Result<()>>;

/// Start an HTTP server per entry, `on_shutdown` runs when one stops.
#[cfg(feature = "server")]
fn start_servers<F>(servers: &[ServeOptions], env: &Environment, on_shutdown: F) -> Vec<ServerHandle>
where
    F: Fn() + Clone + Send + 'static,
{
    servers
        .iter()
        .map(|server| http::start(env.resolve(&server.dir), server.port, on_shutdown.clone()))
        .collect()
}

#[cfg(not(feature = "server"))]
fn start_servers<F>(servers: &[ServeOptions], _: &Environment, _: F) -> Vec<ServerHandle>
where
    F: Fn() + Clone + Send + 'static,
{
    if !servers.is_empty() {
        tracing::warn!("built without the `server` feature, nothing will be served");
    }
    Vec::new()
}

fn join_servers(handles: Vec<ServerHandle>) -> Result<(), BuildError> {
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BuildError::Task("serve".into(), e)),
            Err(_) => {
                return Err(BuildError::Task(
                    "serve".into(),
                    anyhow::anyhow!("HTTP server thread panicked"),
                ));
            }
        }
    }
    Ok(())
}

/// Serve without watching, until Ctrl-C.
pub(crate) fn serve(servers: &[ServeOptions], env: &Environment) -> Result<(), BuildError> {
    join_servers(start_servers(servers, env, || {}))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::pipeline::Pipeline;
    use crate::source::Source;
    use crate::transform::{FileTransform, StepContext, Transform};
    use crate::{File, TransformError};

    struct Fail;

    impl FileTransform for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        fn transform(&self, _: &StepContext<'_>, file: File) -> Result<Option<File>, TransformError> {
            Err(TransformError::new("fail", file.path(), "always"))
        }
    }

    fn project() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(root.join("app/a.txt"), "a").unwrap();
        (dir, root)
    }

    fn failing_graph() -> TaskGraph {
        let mut graph = TaskGraph::new();
        let failing = Pipeline::new(Source::new(["app/*.txt"])).apply(Transform::file(Fail));
        let copying = Pipeline::new(Source::new(["app/*.txt"])).dest("build");

        graph.define("first", [] as [&str; 0], Action::Pipeline(failing)).unwrap();
        graph.define("second", ["first"], Action::Pipeline(copying)).unwrap();
        graph
    }

    #[test]
    fn build_mode_skips_after_a_failure() {
        let (_dir, root) = project();
        let graph = failing_graph();
        let plan = graph.resolve_order("second").unwrap();

        let diagnostics = execute(&graph, &plan, &Environment::new(&root, Mode::Build));

        assert!(diagnostics.failed());
        assert!(matches!(diagnostics.get("first").unwrap().status, Status::Failed(_)));
        assert_eq!(diagnostics.get("first").unwrap().failures, 1);
        assert_eq!(diagnostics.get("second").unwrap().status, Status::Skipped);
        assert!(!root.join("build").exists());
    }

    #[test]
    fn watch_mode_keeps_going() {
        let (_dir, root) = project();
        let graph = failing_graph();
        let plan = graph.resolve_order("second").unwrap();

        let diagnostics = execute(&graph, &plan, &Environment::new(&root, Mode::Watch));

        assert!(!diagnostics.failed());
        assert_eq!(diagnostics.get("first").unwrap().failures, 1);
        assert_eq!(diagnostics.get("second").unwrap().files, 1);
        assert!(root.join("build/a.txt").is_file());
    }

    #[test]
    fn parallel_stage_runs_everything() {
        let (_dir, root) = project();
        let mut graph = TaskGraph::new();
        for name in ["a", "b", "c"] {
            let target = format!("{name}.txt");
            graph
                .define(
                    name,
                    [] as [&str; 0],
                    Action::custom(move |ctx| {
                        fs::write(ctx.env.root.join(&target), ctx.name)?;
                        Ok(())
                    }),
                )
                .unwrap();
        }
        graph.define("all", ["a", "b", "c"], Action::Noop).unwrap();

        let plan = graph.resolve_order("all").unwrap();
        let diagnostics = execute(&graph, &plan, &Environment::new(&root, Mode::Build));

        assert!(!diagnostics.failed());
        let names: Vec<_> = diagnostics.reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "all"]);
        assert_eq!(fs::read_to_string(root.join("b.txt")).unwrap(), "b");
    }

    #[test]
    fn panics_become_failures() {
        let (_dir, root) = project();
        let mut graph = TaskGraph::new();
        graph
            .define("boom", [] as [&str; 0], Action::custom(|_| panic!("kaboom")))
            .unwrap();

        let plan = graph.resolve_order("boom").unwrap();
        let diagnostics = execute(&graph, &plan, &Environment::new(&root, Mode::Build));

        let Status::Failed(message) = &diagnostics.get("boom").unwrap().status else {
            panic!("expected a failure");
        };
        assert!(message.contains("kaboom"));
    }

    #[test]
    fn serve_actions_are_collected() {
        let mut graph = TaskGraph::new();
        graph.define("build", [] as [&str; 0], Action::Noop).unwrap();
        graph
            .define(
                "serve",
                ["build"],
                Action::Serve(ServeOptions {
                    dir: "build".into(),
                    port: 3000,
                    bindings: vec![],
                }),
            )
            .unwrap();

        let plan = graph.resolve_order("serve").unwrap();
        let servers = servers(&graph, &plan);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].port, 3000);
    }
}
