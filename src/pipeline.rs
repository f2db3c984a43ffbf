//! The pipeline executor: source globs, an ordered list of steps and an
//! optional destination.

use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use console::style;
use glob::Pattern;
use indicatif::HumanBytes;
use rayon::prelude::*;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Environment, Mode};
use crate::error::{BuildError, ConfigError, TransformError};
use crate::file::{File, FileSet};
use crate::source::Source;
use crate::transform::{StepContext, Transform};

/// A single step of a pipeline.
#[derive(Debug, Clone)]
pub enum Step {
    /// Run a transform, file by file or over the whole set.
    Apply(Transform),
    /// Run `step` only on files whose name matches `pattern`. Other files
    /// pass through untouched.
    When { pattern: Pattern, step: Box<Step> },
    /// Start accumulating source maps.
    MapsInit,
    /// Write accumulated maps as `.map` sidecars into a directory relative
    /// to the destination, and link them from the files.
    MapsWrite(Utf8PathBuf),
    /// Log the size of the file set.
    Size { title: String, show_files: bool },
}

impl Step {
    pub fn when(pattern: &str, step: Step) -> Result<Self, ConfigError> {
        Ok(Step::When {
            pattern: Pattern::new(pattern)?,
            step: Box::new(step),
        })
    }

    pub fn size(title: impl Into<String>, show_files: bool) -> Self {
        Step::Size {
            title: title.into(),
            show_files,
        }
    }
}

impl From<Transform> for Step {
    fn from(transform: Transform) -> Self {
        Step::Apply(transform)
    }
}

/// What a pipeline run produced.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Files that made it through every step.
    pub files: usize,
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Per-file failures, only returned like this in watch mode.
    pub failures: Vec<TransformError>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    source: Source,
    steps: Vec<Step>,
    dest: Option<Utf8PathBuf>,
}

impl Pipeline {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            steps: Vec::new(),
            dest: None,
        }
    }

    pub fn step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn apply(self, transform: Transform) -> Self {
        self.step(Step::Apply(transform))
    }

    pub fn when(self, pattern: &str, step: impl Into<Step>) -> Result<Self, ConfigError> {
        let step = Step::when(pattern, step.into())?;
        Ok(self.step(step))
    }

    pub fn maps_init(self) -> Self {
        self.step(Step::MapsInit)
    }

    pub fn maps_write(self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.step(Step::MapsWrite(dir.into()))
    }

    pub fn size(self, title: impl Into<String>, show_files: bool) -> Self {
        self.step(Step::size(title, show_files))
    }

    /// Write the results under `dir`, relative to the project root.
    pub fn dest(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.dest = Some(dir.into());
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Read the sources, apply every step and write the results.
    ///
    /// A failing file is dropped from the stream and the rest keep going.
    /// In [`Mode::Build`] any failure fails the run once the good files are
    /// written, in [`Mode::Watch`] failures are logged and reported back.
    pub fn run(&self, env: &Environment) -> Result<PipelineReport, BuildError> {
        let mut files = self.source.resolve(&env.root)?;
        if files.is_empty() {
            tracing::debug!(patterns = ?self.source.patterns(), "no files matched");
            return Ok(PipelineReport::default());
        }

        let ctx = StepContext { env };
        let mut failures = Vec::new();

        for step in &self.steps {
            files = apply(step, &ctx, files, &mut failures);
        }

        let bytes = match &self.dest {
            Some(dest) => write(env, &env.resolve(dest), &files)?,
            None => 0,
        };

        for failure in &failures {
            tracing::error!("{failure}");
        }

        if env.mode == Mode::Build && !failures.is_empty() {
            return Err(BuildError::Files(failures));
        }

        Ok(PipelineReport {
            files: files.len(),
            bytes,
            failures,
        })
    }
}

fn apply(
    step: &Step,
    ctx: &StepContext<'_>,
    files: FileSet,
    failures: &mut Vec<TransformError>,
) -> FileSet {
    match step {
        Step::Apply(Transform::File(transform)) => {
            let results: Vec<_> = files
                .into_vec()
                .into_par_iter()
                .map(|file| transform.transform(ctx, file))
                .collect();

            let mut out = FileSet::new();
            for result in results {
                match result {
                    Ok(Some(file)) => out.push(file),
                    Ok(None) => {}
                    Err(e) => failures.push(e),
                }
            }
            out
        }
        Step::Apply(Transform::Set(transform)) => match transform.transform(ctx, files) {
            Ok(files) => files,
            Err(e) => {
                failures.push(e);
                FileSet::new()
            }
        },
        Step::When { pattern, step } => {
            let files = files.into_vec();
            let Some(first) = files.iter().position(|f| pattern.matches(f.name())) else {
                return files.into();
            };

            let mut before = Vec::new();
            let mut matched = Vec::new();
            let mut after = Vec::new();
            for (i, file) in files.into_iter().enumerate() {
                if pattern.matches(file.name()) {
                    matched.push(file);
                } else if i < first {
                    before.push(file);
                } else {
                    after.push(file);
                }
            }

            let matched = apply(step, ctx, matched.into(), failures);
            before.into_iter().chain(matched).chain(after).collect()
        }
        Step::MapsInit => {
            let mut files = files;
            for file in files.iter_mut() {
                file.begin_map(&ctx.env.root);
            }
            files
        }
        Step::MapsWrite(dir) => write_maps(dir, files, failures),
        Step::Size { title, show_files } => {
            if *show_files {
                for file in &files {
                    tracing::info!(
                        "{} {} {}",
                        style(title).cyan(),
                        file.relative,
                        style(HumanBytes(file.contents.len() as u64)).magenta()
                    );
                }
            }
            tracing::info!(
                "{} all files {}",
                style(title).cyan(),
                style(HumanBytes(files.bytes())).magenta()
            );
            files
        }
    }
}

fn write_maps(dir: &Utf8Path, files: FileSet, failures: &mut Vec<TransformError>) -> FileSet {
    let dir = normalize(dir);
    let mut out = FileSet::new();

    for mut file in files {
        let Some(map) = file.map.take() else {
            out.push(file);
            continue;
        };

        let relative = dir.join(format!("{}.map", file.relative));
        let json = match map.to_json(file.name()) {
            Ok(json) => json,
            Err(e) => {
                failures.push(TransformError::new("sourcemaps", file.path(), e.to_string()));
                continue;
            }
        };

        let from = file.relative.parent().unwrap_or(Utf8Path::new(""));
        let url = relative_url(from, &relative);
        let comment = match file.extension() {
            Some("css") => Some(format!("\n/*# sourceMappingURL={url} */")),
            Some("js") => Some(format!("\n//# sourceMappingURL={url}")),
            _ => None,
        };
        if let Some(comment) = comment {
            file.contents.extend_from_slice(comment.as_bytes());
        }

        let sidecar = File::new(file.base.clone(), relative, json);
        out.push(file);
        out.push(sidecar);
    }

    out
}

/// Drop `.` components, `./` and `.` both name the destination itself.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    path.components()
        .filter(|c| !matches!(c, Utf8Component::CurDir))
        .collect()
}

/// Path of `to` as seen from the directory `from`, both relative to the
/// destination root.
fn relative_url(from: &Utf8Path, to: &Utf8Path) -> String {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut parts: Vec<&str> = vec![".."; from.len() - common];
    parts.extend(to[common..].iter().map(|c| c.as_str()));
    parts.join("/")
}

fn write(env: &Environment, dest: &Utf8Path, files: &FileSet) -> Result<u64, BuildError> {
    let span = Span::current();
    span.pb_set_length(files.len() as u64);

    files
        .iter()
        .collect::<Vec<_>>()
        .par_iter()
        .map(|file| {
            let path = dest.join(&file.relative);
            let lock = env.writes.get(&path);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| BuildError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&path, &file.contents).map_err(|source| BuildError::Write {
                path: path.clone(),
                source,
            })?;

            span.pb_inc(1);
            Ok(file.contents.len() as u64)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{FileTransform, Registry, SetTransform};

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

    /// Uppercases every file, fails on names starting with `bad`.
    struct Shout;

    impl FileTransform for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        fn transform(&self, _: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
            if file.name().starts_with("bad") {
                return Err(TransformError::new("shout", file.path(), "refusing").at(1, 1));
            }
            let text = file.text("shout")?.to_uppercase();
            file.replace(text, None);
            Ok(Some(file))
        }
    }

    struct Broken;

    impl SetTransform for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn transform(&self, _: &StepContext<'_>, files: FileSet) -> Result<FileSet, TransformError> {
            let path = files.iter().next().map(File::path).unwrap_or_default();
            Err(TransformError::new("broken", path, "nope"))
        }
    }

    fn read(root: &Utf8Path, path: &str) -> String {
        fs::read_to_string(root.join(path)).unwrap()
    }

    #[test]
    fn empty_match_is_a_noop() {
        let (_dir, root) = project(&[]);
        let env = Environment::new(&root, Mode::Build);
        let report = Pipeline::new(Source::new(["app/images/**/*"]))
            .apply(Transform::file(Shout))
            .dest("build/images")
            .run(&env)
            .unwrap();

        assert_eq!(report.files, 0);
        assert!(!root.join("build").exists());
    }

    #[test]
    fn failure_is_isolated_per_file() {
        let (_dir, root) = project(&[("app/a.txt", "a"), ("app/bad.txt", "b"), ("app/c.txt", "c")]);
        let pipeline = Pipeline::new(Source::new(["app/*.txt"]))
            .apply(Transform::file(Shout))
            .dest("build");

        let err = pipeline.run(&Environment::new(&root, Mode::Build)).unwrap_err();
        let BuildError::Files(failures) = err else {
            panic!("expected file failures, got {err:?}");
        };
        assert_eq!(failures.len(), 1);
        assert!(failures[0].path.ends_with("bad.txt"));

        // the good files were still written
        assert_eq!(read(&root, "build/a.txt"), "A");
        assert_eq!(read(&root, "build/c.txt"), "C");
        assert!(!root.join("build/bad.txt").exists());
    }

    #[test]
    fn watch_mode_reports_instead_of_failing() {
        let (_dir, root) = project(&[("app/a.txt", "a"), ("app/bad.txt", "b")]);
        let report = Pipeline::new(Source::new(["app/*.txt"]))
            .apply(Transform::file(Shout))
            .dest("build")
            .run(&Environment::new(&root, Mode::Watch))
            .unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(report.bytes, 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn failing_set_transform_empties_the_stream() {
        let (_dir, root) = project(&[("app/a.js", "a")]);
        let report = Pipeline::new(Source::new(["app/*.js"]))
            .apply(Transform::set(Broken))
            .dest("build")
            .run(&Environment::new(&root, Mode::Watch))
            .unwrap();

        assert_eq!(report.files, 0);
        assert_eq!(report.failures[0].transform, "broken");
    }

    #[test]
    fn when_only_touches_matching_files_and_keeps_order() {
        let (_dir, root) = project(&[]);
        let env = Environment::new(&root, Mode::Build);
        let files: FileSet = ["a.txt", "b.css", "c.txt", "d.css"]
            .iter()
            .map(|name| File::new(&root, *name, *name))
            .collect();

        let step = Step::when("*.css", Step::Apply(Transform::file(Shout))).unwrap();
        let mut failures = Vec::new();
        let out = apply(&step, &StepContext { env: &env }, files, &mut failures);

        let contents: Vec<_> = out
            .iter()
            .map(|f| String::from_utf8(f.contents.clone()).unwrap())
            .collect();
        assert_eq!(contents, vec!["a.txt", "B.CSS", "D.CSS", "c.txt"]);
        assert!(failures.is_empty());
    }

    #[test]
    fn maps_are_written_beside_the_output() {
        let (_dir, root) = project(&[("app/styles/main.css", "a {\n  color: red;\n}\n")]);
        let registry = Registry::builtin();
        Pipeline::new(Source::new(["app/styles/**/*.css"]))
            .maps_init()
            .apply(registry.lookup("minify-css").unwrap())
            .maps_write("./")
            .dest("build/styles")
            .run(&Environment::new(&root, Mode::Build))
            .unwrap();

        let css = read(&root, "build/styles/main.css");
        assert_eq!(css, "a{color:red}\n/*# sourceMappingURL=main.css.map */");

        let map: serde_json::Value = serde_json::from_str(&read(&root, "build/styles/main.css.map")).unwrap();
        assert_eq!(map["version"], 3);
        assert_eq!(map["file"], "main.css");
        assert_eq!(map["sources"][0], "app/styles/main.css");
    }

    #[test]
    fn maps_in_a_separate_directory() {
        let (_dir, root) = project(&[("app/scripts/lib/util.js", "var a = 1;\n")]);
        Pipeline::new(Source::new(["app/scripts/**/*.js"]))
            .maps_init()
            .maps_write("maps")
            .dest("build")
            .run(&Environment::new(&root, Mode::Build))
            .unwrap();

        let js = read(&root, "build/lib/util.js");
        assert!(js.ends_with("//# sourceMappingURL=../maps/lib/util.js.map"));
        assert!(root.join("build/maps/lib/util.js.map").is_file());
    }

    #[test]
    fn relative_urls() {
        assert_eq!(relative_url(Utf8Path::new(""), Utf8Path::new("a.css.map")), "a.css.map");
        assert_eq!(
            relative_url(Utf8Path::new("lib"), Utf8Path::new("lib/a.js.map")),
            "a.js.map"
        );
        assert_eq!(
            relative_url(Utf8Path::new("a/b"), Utf8Path::new("maps/a/b/c.map")),
            "../../maps/a/b/c.map"
        );
    }
}
