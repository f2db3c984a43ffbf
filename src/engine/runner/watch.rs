//! Watch mode is implemented as a three-part system:
//!
//! 1. **File watcher**: a [`Watcher`] wraps the `notify` debouncer and turns
//!    filesystem events into [`WatchEvent`]s on a channel. Dropping it
//!    releases every watch.
//! 2. **Loop**: a small state machine reads the channel, gathers changes
//!    until the debounce window is quiet, and re-runs the tasks bound to the
//!    changed paths. Changes arriving mid-run are folded into at most one
//!    follow-up run.
//! 3. **Reload**: after every run the [`ReloadServer`] broadcasts `"reload"`
//!    to the browsers, which got a small client script injected into their
//!    HTML while building.
//!
//! The HTTP server thread sends [`WatchEvent::Shutdown`] on Ctrl-C, which
//! stops the loop.

use std::collections::{BTreeSet, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use glob::{MatchOptions, Pattern};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};

use crate::core::Environment;
use crate::engine::{ServeOptions, TaskGraph, WatchBinding};
use crate::error::{ConfigError, NagareError, WatchError};

use super::reload::ReloadServer;

/// Messages driving the watch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Absolute paths that changed.
    Changed(Vec<Utf8PathBuf>),
    Error(String),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Watching,
    Triggered,
    Running,
    Stopped,
}

/// Holds the filesystem watches, they are released when this is dropped.
pub struct Watcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    roots: Vec<Utf8PathBuf>,
}

impl Watcher {
    /// Watch `roots` recursively, sending every debounced batch to `sender`.
    pub fn new(
        roots: impl IntoIterator<Item = Utf8PathBuf>,
        debounce: Duration,
        sender: Sender<WatchEvent>,
    ) -> Result<Self, WatchError> {
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            let event = match result {
                Ok(events) => WatchEvent::Changed(
                    events
                        .iter()
                        .flat_map(|de| de.event.paths.iter())
                        .filter_map(|path| Utf8PathBuf::from_path_buf(path.clone()).ok())
                        .collect(),
                ),
                Err(errors) => WatchEvent::Error(
                    errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
            };
            let _ = sender.send(event);
        })?;

        let roots = watch_roots(roots);
        for root in &roots {
            tracing::info!("watching {}", root);
            debouncer.watch(root, RecursiveMode::Recursive)?;
        }

        Ok(Self {
            _debouncer: debouncer,
            roots,
        })
    }

    pub fn roots(&self) -> &[Utf8PathBuf] {
        &self.roots
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        tracing::debug!("releasing {} watch root(s)", self.roots.len());
    }
}

/// A compiled [`WatchBinding`].
#[derive(Debug)]
pub(crate) struct Trigger {
    patterns: Vec<Pattern>,
    tasks: Vec<String>,
}

impl Trigger {
    fn matches(&self, path: &Utf8Path) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.patterns
            .iter()
            .any(|p| p.matches_path_with(path.as_std_path(), options))
    }
}

/// Compile bindings against the project root. Globs whose static part
/// doesn't exist yet are reported and left out.
pub(crate) fn triggers(root: &Utf8Path, bindings: &[WatchBinding]) -> (Vec<Trigger>, HashSet<Utf8PathBuf>) {
    let mut triggers = Vec::with_capacity(bindings.len());
    let mut roots = HashSet::new();

    for binding in bindings {
        let mut patterns = Vec::new();
        for glob in binding.globs.iter().filter(|g| !g.starts_with('!')) {
            match resolve_watch_path(root, glob) {
                Ok((dir, pattern)) => {
                    roots.insert(dir);
                    patterns.push(pattern);
                }
                Err(e) => tracing::warn!("not watching '{glob}': {e}"),
            }
        }
        triggers.push(Trigger {
            patterns,
            tasks: binding.tasks.clone(),
        });
    }

    (triggers, roots)
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub(crate) fn resolve_watch_path(root: &Utf8Path, glob: &str) -> Result<(Utf8PathBuf, Pattern), ConfigError> {
    let path = Utf8Path::new(glob.trim_start_matches("./"));

    // Split path into static root and dynamic suffix (containing wildcards)
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let static_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix: Utf8PathBuf = components.iter().skip(split_idx).collect();

    let absolute = root
        .join(&static_part)
        .canonicalize_utf8()
        .map_err(|_| ConfigError::MissingGlobRoot(static_part.clone()))?;

    // A concrete file is matched exactly but its parent is watched, so that
    // atomic writes (write to temp, rename over) are still seen.
    let (watch_root, pattern) = if suffix.as_str().is_empty() && absolute.is_file() {
        let parent = absolute.parent().unwrap_or(&absolute).to_path_buf();
        (parent, Pattern::escape(absolute.as_str()))
    } else if suffix.as_str().is_empty() {
        (absolute.clone(), format!("{}/**/*", Pattern::escape(absolute.as_str())))
    } else {
        let pattern = format!("{}/{}", Pattern::escape(absolute.as_str()), suffix);
        (absolute, pattern)
    };

    Ok((watch_root, Pattern::new(&pattern)?))
}

/// The directories to watch recursively. Directories nested in another one
/// are already covered by it.
fn watch_roots(paths: impl IntoIterator<Item = Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    // component order puts every directory right before its descendants
    let sorted: BTreeSet<Utf8PathBuf> = paths.into_iter().collect();

    sorted.into_iter().fold(Vec::new(), |mut roots, path| {
        if !roots.last().is_some_and(|root: &Utf8PathBuf| path.starts_with(root)) {
            roots.push(path);
        }
        roots
    })
}

/// Add the tasks bound to any of `paths` to `pending`.
fn absorb(triggers: &[Trigger], paths: &[Utf8PathBuf], pending: &mut BTreeSet<String>) {
    for trigger in triggers {
        if paths.iter().any(|p| trigger.matches(p)) {
            pending.extend(trigger.tasks.iter().cloned());
        }
    }
}

/// Drive the watch state machine until shutdown or until every sender is
/// gone. Returns the number of runs.
pub(crate) fn watch_loop<F>(
    receiver: &Receiver<WatchEvent>,
    triggers: &[Trigger],
    debounce: Duration,
    mut rebuild: F,
) -> usize
where
    F: FnMut(&BTreeSet<String>),
{
    let mut state = State::Idle;
    let mut pending = BTreeSet::new();
    let mut runs = 0;

    loop {
        state = match state {
            State::Idle => State::Watching,
            State::Watching => match receiver.recv() {
                Ok(WatchEvent::Changed(paths)) => {
                    absorb(triggers, &paths, &mut pending);
                    if pending.is_empty() {
                        State::Watching
                    } else {
                        State::Triggered
                    }
                }
                Ok(WatchEvent::Error(e)) => {
                    tracing::error!("watch error: {e}");
                    State::Watching
                }
                Ok(WatchEvent::Shutdown) | Err(_) => State::Stopped,
            },
            // wait for the window to go quiet
            State::Triggered => match receiver.recv_timeout(debounce) {
                Ok(WatchEvent::Changed(paths)) => {
                    absorb(triggers, &paths, &mut pending);
                    State::Triggered
                }
                Ok(WatchEvent::Error(e)) => {
                    tracing::error!("watch error: {e}");
                    State::Triggered
                }
                Err(RecvTimeoutError::Timeout) => State::Running,
                Ok(WatchEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => State::Stopped,
            },
            State::Running => {
                let tasks = std::mem::take(&mut pending);
                tracing::info!(
                    "change detected, re-running {}...",
                    style(tasks.iter().cloned().collect::<Vec<_>>().join(", ")).cyan()
                );
                rebuild(&tasks);
                runs += 1;

                // whatever arrived meanwhile makes one follow-up run
                let mut stop = false;
                for event in receiver.try_iter() {
                    match event {
                        WatchEvent::Changed(paths) => absorb(triggers, &paths, &mut pending),
                        WatchEvent::Error(e) => tracing::error!("watch error: {e}"),
                        WatchEvent::Shutdown => stop = true,
                    }
                }

                if stop {
                    State::Stopped
                } else if pending.is_empty() {
                    tracing::info!("watching for changes...");
                    State::Watching
                } else {
                    State::Triggered
                }
            }
            State::Stopped => break,
        };
    }

    if !pending.is_empty() {
        tracing::debug!("dropping {} pending task(s) on shutdown", pending.len());
    }

    runs
}

/// Watch the bindings of every server, rebuilding and reloading on change
/// until Ctrl-C.
pub(crate) fn session(
    graph: &TaskGraph,
    servers: &[ServeOptions],
    env: &Environment,
    reload: ReloadServer,
    debounce: Duration,
) -> Result<(), NagareError> {
    let bindings: Vec<WatchBinding> = servers
        .iter()
        .flat_map(|s| s.bindings.iter().cloned())
        .collect();
    let (triggers, roots) = triggers(&env.root, &bindings);

    let (sender, receiver) = mpsc::channel();
    let watcher = Watcher::new(roots, debounce, sender.clone())?;

    let shutdown = sender.clone();
    let http = super::start_servers(servers, env, move || {
        let _ = shutdown.send(WatchEvent::Shutdown);
    });
    drop(sender);

    tracing::info!("initial build completed, now watching for changes...");

    watch_loop(&receiver, &triggers, debounce, |tasks| {
        match graph.resolve_many(tasks) {
            Ok(plan) => super::execute(graph, &plan, env).summary(),
            Err(e) => tracing::error!("{e}"),
        }
        let clients = reload.broadcast("reload");
        tracing::info!("rebuild complete, reloaded {clients} client(s)");
    });

    drop(watcher);
    reload.shutdown();
    super::join_servers(http)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn styles() -> Vec<Trigger> {
        vec![
            Trigger {
                patterns: vec![Pattern::new("/p/app/styles/**/*.scss").unwrap()],
                tasks: vec!["styles".into()],
            },
            Trigger {
                patterns: vec![Pattern::new("/p/app/scripts/**/*.js").unwrap()],
                tasks: vec!["lint".into(), "scripts".into()],
            },
        ]
    }

    fn changed(path: &str) -> WatchEvent {
        WatchEvent::Changed(vec![Utf8PathBuf::from(path)])
    }

    #[test]
    fn rapid_changes_make_one_run() {
        let (sender, receiver) = mpsc::channel();
        let debounce = Duration::from_millis(50);

        let feeder = thread::spawn(move || {
            sender.send(changed("/p/app/styles/main.scss")).unwrap();
            sender.send(changed("/p/app/styles/_vars.scss")).unwrap();
            thread::sleep(debounce * 6);
            sender.send(WatchEvent::Shutdown).unwrap();
        });

        let mut seen = Vec::new();
        let runs = watch_loop(&receiver, &styles(), debounce, |tasks| seen.push(tasks.clone()));
        feeder.join().unwrap();

        assert_eq!(runs, 1);
        assert_eq!(seen[0], BTreeSet::from(["styles".to_string()]));
    }

    #[test]
    fn changes_during_a_run_coalesce_into_one_follow_up() {
        let (sender, receiver) = mpsc::channel();
        sender.send(changed("/p/app/styles/main.scss")).unwrap();

        let mut seen = Vec::new();
        let runs = watch_loop(&receiver, &styles(), Duration::from_millis(10), |tasks| {
            seen.push(tasks.clone());
            match seen.len() {
                1 => {
                    for path in ["/p/app/scripts/a.js", "/p/app/scripts/b.js", "/p/app/styles/x.scss"] {
                        sender.send(changed(path)).unwrap();
                    }
                }
                _ => sender.send(WatchEvent::Shutdown).unwrap(),
            }
        });

        assert_eq!(runs, 2);
        assert_eq!(
            seen[1],
            BTreeSet::from(["lint".to_string(), "scripts".to_string(), "styles".to_string()])
        );
    }

    #[test]
    fn unrelated_paths_and_errors_trigger_nothing() {
        let (sender, receiver) = mpsc::channel();
        sender.send(changed("/p/README.md")).unwrap();
        sender.send(WatchEvent::Error("overflow".into())).unwrap();
        sender.send(WatchEvent::Shutdown).unwrap();

        let runs = watch_loop(&receiver, &styles(), Duration::from_millis(10), |_| {});
        assert_eq!(runs, 0);
    }

    #[test]
    fn shutdown_drops_the_pending_batch() {
        let (sender, receiver) = mpsc::channel();
        sender.send(changed("/p/app/styles/main.scss")).unwrap();
        sender.send(WatchEvent::Shutdown).unwrap();

        let runs = watch_loop(&receiver, &styles(), Duration::from_secs(5), |_| {});
        assert_eq!(runs, 0);
    }

    #[test]
    fn disconnected_channel_stops() {
        let (sender, receiver) = mpsc::channel::<WatchEvent>();
        drop(sender);
        assert_eq!(watch_loop(&receiver, &styles(), Duration::from_millis(10), |_| {}), 0);
    }

    fn project() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf())
            .unwrap()
            .canonicalize_utf8()
            .unwrap();
        std::fs::create_dir_all(root.join("app/styles")).unwrap();
        std::fs::write(root.join("app/styles/main.scss"), "a { b: c }").unwrap();
        (dir, root)
    }

    #[test]
    fn wildcard_glob() {
        let (_dir, root) = project();
        let (watch, pattern) = resolve_watch_path(&root, "app/styles/**/*.scss").unwrap();

        assert_eq!(watch, root.join("app/styles"));
        assert!(pattern.matches_path(root.join("app/styles/a/b.scss").as_std_path()));
        assert!(!pattern.matches_path(root.join("app/styles/a.css").as_std_path()));
    }

    #[test]
    fn concrete_file_watches_its_parent() {
        let (_dir, root) = project();
        let (watch, pattern) = resolve_watch_path(&root, "./app/styles/main.scss").unwrap();

        assert_eq!(watch, root.join("app/styles"));
        assert_eq!(pattern.as_str(), root.join("app/styles/main.scss"));
    }

    #[test]
    fn concrete_directory_matches_its_contents() {
        let (_dir, root) = project();
        let (watch, pattern) = resolve_watch_path(&root, "app").unwrap();

        assert_eq!(watch, root.join("app"));
        assert!(pattern.matches_path(root.join("app/styles/main.scss").as_std_path()));
    }

    #[test]
    fn missing_root_is_reported() {
        let (_dir, root) = project();
        let err = resolve_watch_path(&root, "app/images/**/*").unwrap_err();
        assert!(matches!(err, ConfigError::MissingGlobRoot(path) if path == "app/images"));

        let (triggers, roots) = triggers(
            &root,
            &[WatchBinding::new(["app/images/**/*", "app/styles/**/*.scss"], ["images"])],
        );
        assert_eq!(triggers[0].patterns.len(), 1);
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn recipe_bindings_share_one_root() {
        let (_dir, root) = project();
        for dir in ["app/scripts", "app/images"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }

        let graph = crate::recipe::standard(&crate::Config::default(), &crate::Registry::builtin()).unwrap();
        let Some(crate::engine::Action::Serve(serve)) = graph.get("serve").map(|t| &t.action) else {
            panic!("serve is not a server");
        };

        let (_, roots) = triggers(&root, &serve.bindings);
        assert_eq!(roots.len(), 4);
        assert_eq!(watch_roots(roots), vec![root.join("app")]);
    }

    #[test]
    fn similar_names_are_not_nested() {
        let roots = watch_roots(
            ["app/styles-legacy", "app/styles/vendor", "app/styles", "app/scripts"].map(Utf8PathBuf::from),
        );
        assert_eq!(
            roots,
            ["app/scripts", "app/styles", "app/styles-legacy"].map(Utf8PathBuf::from).to_vec()
        );
    }

    #[test]
    fn watcher_releases_on_drop() {
        let (_dir, root) = project();
        let (sender, receiver) = mpsc::channel();

        let watcher = Watcher::new([root.join("app")], Duration::from_millis(20), sender).unwrap();
        assert_eq!(watcher.roots(), &[root.join("app")]);
        drop(watcher);

        // the debouncer thread owned the only sender
        loop {
            match receiver.recv_timeout(Duration::from_secs(5)) {
                Ok(_) => continue,
                Err(e) => {
                    assert_eq!(e, RecvTimeoutError::Disconnected);
                    break;
                }
            }
        }
    }
}
