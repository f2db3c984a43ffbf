//! The standard front-end recipe: lint, styles, scripts, html, images,
//! copy, clean and the two servers, wired from a [`Config`].

use serde_json::json;

use crate::config::Config;
use crate::engine::{Action, ServeOptions, TaskGraph, WatchBinding};
use crate::error::ConfigError;
use crate::pipeline::{Pipeline, Step};
use crate::source::Source;
use crate::transform::Registry;

const NONE: [&str; 0] = [];

/// Build the standard task graph.
///
/// Transforms missing from the registry (e.g. `sass` without the `grass`
/// feature) are left out of their pipelines, files pass through instead.
pub fn standard(config: &Config, registry: &Registry) -> Result<TaskGraph, ConfigError> {
    let paths = &config.paths;
    let build = &config.build;
    let mut graph = TaskGraph::new();

    let lint = Pipeline::new(Source::new(
        paths.scripts.iter().cloned().chain(["!node_modules/**".to_string()]),
    ))
    .apply(registry.lookup("lint-js")?);
    graph.define("lint", NONE, Action::Pipeline(lint))?;

    let mut images = Pipeline::new(Source::new(paths.images.clone()));
    if registry.contains("optimize-images") {
        images = images.apply(registry.lookup("optimize-images")?);
    }
    let images = images.size("images", false).dest(build.join("images"));
    graph.define("images", NONE, Action::Pipeline(images))?;

    let copy = Pipeline::new(Source::new(paths.copy.clone()).dot(true))
        .size("copy", false)
        .dest(build);
    graph.define("copy", NONE, Action::Pipeline(copy))?;

    let mut styles =
        Pipeline::new(Source::new(paths.scss.iter().chain(&paths.css).cloned())).maps_init();
    if registry.contains("sass") {
        styles = styles.when("*.scss", registry.lookup("sass")?)?;
    }
    let styles = styles
        .apply(registry.create("autoprefix", json!({ "browsers": config.styles.browsers }))?)
        .when("*.css", registry.lookup("minify-css")?)?
        .size("styles", false)
        .maps_write("./")
        .dest(build.join("styles"));
    graph.define("styles", NONE, Action::Pipeline(styles))?;

    let mut scripts = Pipeline::new(Source::new(paths.entry_scripts.clone())).maps_init();
    if let Some(command) = &config.scripts.transpiler {
        scripts = scripts.when("*.js", registry.create("exec", json!({ "command": command }))?)?;
    }
    let scripts = scripts
        .apply(registry.create("concat", json!({ "file": config.scripts.bundle }))?)
        .apply(registry.create(
            "minify-js",
            json!({ "preserve_comments": config.scripts.preserve_comments }),
        )?)
        .size("scripts", false)
        .maps_write(".")
        .dest(build.join("scripts"));
    graph.define("scripts", NONE, Action::Pipeline(scripts))?;

    let html = Pipeline::new(Source::new(paths.html.clone()))
        .apply(registry.lookup("useref")?)
        .when("*.html", registry.lookup("minify-html")?)?
        .apply(registry.lookup("live-reload")?)
        .when("*.html", Step::size("html", true))?
        .dest(build);
    graph.define("html", NONE, Action::Pipeline(html))?;

    let clean = Source::new([
        config.tmp.to_string(),
        format!("{build}/*"),
        format!("!{build}/.git"),
    ])
    .dot(true);
    graph.define("clean", NONE, Action::Clean(clean))?;

    let serve = ServeOptions {
        dir: build.clone(),
        port: config.serve.port,
        bindings: vec![
            WatchBinding::new(paths.html.clone(), ["html"]),
            WatchBinding::new(paths.scss.iter().chain(&paths.css).cloned(), ["styles"]),
            WatchBinding::new(paths.scripts.clone(), ["lint", "scripts"]),
            WatchBinding::new(paths.images.clone(), ["images"]),
        ],
    };
    graph.define(
        "serve",
        ["styles", "scripts", "html", "images", "copy"],
        Action::Serve(serve),
    )?;

    let preview = ServeOptions {
        dir: build.clone(),
        port: config.serve.build_port,
        bindings: Vec::new(),
    };
    graph.define("serve:build", ["default"], Action::Serve(preview))?;

    graph
        .task("default")
        .depends_on(["clean"])
        .then(["styles"])
        .then(["lint", "html", "scripts", "images", "copy"])
        .define()?;

    graph.validate()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::core::{Environment, Mode};
    use crate::engine::{Diagnostics, Stage, execute};

    fn graph() -> TaskGraph {
        standard(&Config::default(), &Registry::builtin()).unwrap()
    }

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        for (path, text) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        (dir, root)
    }

    fn run(graph: &TaskGraph, task: &str, root: &Utf8Path) -> Diagnostics {
        let plan = graph.resolve_order(task).unwrap();
        execute(graph, &plan, &Environment::new(root, Mode::Build))
    }

    fn read(root: &Utf8Path, path: &str) -> String {
        fs::read_to_string(root.join(path)).unwrap()
    }

    #[test]
    fn every_task_is_defined() {
        let graph = graph();
        for name in [
            "lint",
            "images",
            "copy",
            "styles",
            "scripts",
            "html",
            "clean",
            "serve",
            "serve:build",
            "default",
        ] {
            assert!(graph.contains(name), "{name}");
        }
    }

    #[test]
    fn default_plan_shape() {
        let plan = graph().resolve_order("default").unwrap();
        assert_eq!(
            plan.stages(),
            &[
                Stage::Single("clean".into()),
                Stage::Single("styles".into()),
                Stage::Parallel(
                    ["lint", "images", "copy", "scripts", "html"]
                        .map(String::from)
                        .to_vec()
                ),
                Stage::Single("default".into()),
            ]
        );
    }

    #[test]
    fn preview_runs_the_full_build_first() {
        let plan = graph().resolve_order("serve:build").unwrap();
        let tasks: Vec<_> = plan.tasks().collect();
        assert_eq!(tasks.first(), Some(&"clean"));
        assert_eq!(tasks.last(), Some(&"serve:build"));
        assert_eq!(tasks.len(), 9);
    }

    #[test]
    fn added_cycle_is_rejected() {
        let mut graph = graph();
        graph.define("x", ["y"], Action::Noop).unwrap();
        graph.define("y", ["x"], Action::Noop).unwrap();
        assert!(matches!(graph.validate(), Err(ConfigError::Cycle(_))));
    }

    #[test]
    fn bad_comment_option_is_a_config_error() {
        let mut config = Config::default();
        config.scripts.preserve_comments = "most".into();
        let err = standard(&config, &Registry::builtin()).unwrap_err();
        assert!(matches!(err, ConfigError::Options { name, .. } if name == "minify-js"));
    }

    #[cfg(feature = "grass")]
    #[test]
    fn styles_are_compiled_prefixed_and_mapped() {
        let (_dir, root) = project(&[
            ("app/styles/_vars.scss", "$accent: #c00;\n"),
            (
                "app/styles/main.scss",
                "@use 'vars';\n\n.box {\n  display: flex;\n  color: vars.$accent;\n}\n",
            ),
        ]);

        let diagnostics = run(&graph(), "styles", &root);
        assert!(!diagnostics.failed());

        let css = read(&root, "build/styles/main.css");
        assert!(css.contains("display:-webkit-flex"));
        assert!(css.contains("display:-ms-flexbox"));
        assert!(css.contains("display:flex"));
        assert!(css.ends_with("/*# sourceMappingURL=main.css.map */"));
        assert!(!root.join("build/styles/_vars.css").exists());

        let map: serde_json::Value =
            serde_json::from_str(&read(&root, "build/styles/main.css.map")).unwrap();
        assert_eq!(map["sources"][0], "app/styles/main.scss");
    }

    #[test]
    fn compact_css_is_prefixed() {
        let (_dir, root) = project(&[("app/styles/plain.css", "nav{display:flex}\n")]);

        let diagnostics = run(&graph(), "styles", &root);
        assert!(!diagnostics.failed());

        let css = read(&root, "build/styles/plain.css");
        assert!(css.contains("display:-webkit-flex"));
        assert!(css.contains("display:-ms-flexbox"));
        assert!(css.contains("display:flex"));
    }

    #[test]
    fn scripts_are_bundled_and_minified() {
        let source = "/*! acme v1 | MIT */\n// helpers\nfunction add(a, b) {\n    debugger;\n    return a + b;\n}\n\n/* unused */\nfunction unused() {\n    return 42;\n}\n\nfunction guard(x) {\n    if (x) debugger;\n    return x.debugger;\n}\n";
        let (_dir, root) = project(&[("app/scripts/main.js", source)]);

        let diagnostics = run(&graph(), "scripts", &root);
        assert!(!diagnostics.failed());
        assert_eq!(diagnostics.get("scripts").unwrap().files, 2);

        let js = read(&root, "build/scripts/main.min.js");
        let code = js.split("\n//# sourceMappingURL=").next().unwrap();
        assert!(code.len() < source.len());
        assert!(code.starts_with("/*! acme v1 | MIT */"));
        assert!(code.contains("function add(a,b){return a+b;}"));
        assert!(code.contains("if(x);return x.debugger;}"));
        assert!(!code.contains("helpers"));
        assert!(js.ends_with("//# sourceMappingURL=main.min.js.map"));

        let map: serde_json::Value =
            serde_json::from_str(&read(&root, "build/scripts/main.min.js.map")).unwrap();
        assert_eq!(map["file"], "main.min.js");
        assert_eq!(map["sources"][0], "app/scripts/main.js");
    }

    #[test]
    fn lint_errors_fail_the_build() {
        let (_dir, root) = project(&[("app/scripts/main.js", "if (a == b) { go(); }\n")]);
        let diagnostics = run(&graph(), "lint", &root);
        assert!(diagnostics.failed());
    }

    #[test]
    fn clean_then_build_over_existing_output() {
        let (_dir, root) = project(&[
            ("app/index.html", "<!doctype html>\n<html>\n<head>\n<!-- build:css styles/main.css -->\n<link rel=\"stylesheet\" href=\"styles/a.css\">\n<link rel=\"stylesheet\" href=\"styles/b.css\">\n<!-- endbuild -->\n</head>\n<body>\n  <p>hi</p>\n</body>\n</html>\n"),
            ("app/robots.txt", "User-agent: *\n"),
            ("app/scripts/main.js", "const a = 1;\n"),
            ("app/styles/main.css", "a {\n  color: red;\n}\n"),
            ("build/stale.txt", "old"),
            ("build/.git/HEAD", "ref: refs/heads/main"),
            (".tmp/x", "scratch"),
        ]);

        let graph = graph();
        for _ in 0..2 {
            let diagnostics = run(&graph, "default", &root);
            assert!(!diagnostics.failed(), "{:?}", diagnostics.reports);
        }

        assert!(!root.join("build/stale.txt").exists());
        assert!(!root.join(".tmp").exists());
        assert!(root.join("build/.git/HEAD").is_file());
        assert!(root.join("build/robots.txt").is_file());
        assert!(root.join("build/scripts/main.min.js").is_file());
        assert!(root.join("build/styles/main.css").is_file());

        let html = read(&root, "build/index.html");
        assert!(html.contains("href=styles/main.css"));
        assert!(!html.contains("styles/a.css"));
        assert!(!html.contains("<script>"));
    }
}
