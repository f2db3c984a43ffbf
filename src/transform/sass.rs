use std::path::PathBuf;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::Deserialize;

use crate::error::TransformError;
use crate::file::File;
use crate::sourcemap::PositionMap;

use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "sass";

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SassStyle {
    #[default]
    Expanded,
    Compressed,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SassOptions {
    pub style: SassStyle,
    /// Extra directories for `@import`/`@use`, relative to the project root.
    pub load_paths: Vec<Utf8PathBuf>,
}

/// Compiles `.scss` files to CSS with `grass`.
///
/// Partials (`_name.scss`) are only ever imported, they are dropped from the
/// stream.
pub struct Sass {
    options: SassOptions,
}

impl Sass {
    pub fn new(options: SassOptions) -> Self {
        Self { options }
    }
}

impl FileTransform for Sass {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(
        &self,
        ctx: &StepContext<'_>,
        mut file: File,
    ) -> Result<Option<File>, TransformError> {
        if file.name().starts_with('_') {
            return Ok(None);
        }

        let path = file.path();
        let input = file.text(NAME)?.to_string();

        let mut dirs: Vec<PathBuf> = Vec::with_capacity(self.options.load_paths.len() + 1);
        if let Some(parent) = path.parent() {
            dirs.push(parent.as_std_path().to_path_buf());
        }
        for dir in &self.options.load_paths {
            dirs.push(ctx.env.resolve(dir).into_std_path_buf());
        }

        let style = match self.options.style {
            SassStyle::Expanded => grass::OutputStyle::Expanded,
            SassStyle::Compressed => grass::OutputStyle::Compressed,
        };

        let mut options = grass::Options::default().style(style);
        for dir in &dirs {
            options = options.load_path(dir.as_path());
        }

        let css = grass::from_string(input.clone(), &options).map_err(|e| {
            let (message, location) = describe(&e.to_string());
            let err = TransformError::new(NAME, path.clone(), message);
            match location {
                Some((line, column)) => err.at(line, column),
                None => err,
            }
        })?;

        let positions = approximate(&input, &css);
        file.replace(css, Some(positions));
        file.set_extension("css");

        Ok(Some(file))
    }
}

static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\s(\d+):(\d+)\s+root stylesheet\s*$").expect("valid regex"));

/// Split a grass error report into its first line and the 1-based location
/// from the trailing `file line:col  root stylesheet` row.
fn describe(report: &str) -> (String, Option<(u32, u32)>) {
    let message = report
        .lines()
        .next()
        .unwrap_or(report)
        .trim_start_matches("Error: ")
        .to_string();

    let location = LOCATION.captures(report).and_then(|c| {
        let line = c[1].parse::<u32>().ok()?;
        let column = c[2].parse::<u32>().ok()?;
        Some((line, column))
    });

    (message, location)
}

/// Line-level positions for compiled output.
///
/// The compiler does not report where its output came from, so each output
/// line is matched to the first following source line that contains the
/// same selector or declaration. Unmatched lines inherit the last match.
fn approximate(source: &str, output: &str) -> PositionMap {
    let source: Vec<&str> = source.lines().map(str::trim).collect();
    let mut positions = PositionMap::new();
    let mut cursor = 0;

    for (i, line) in output.split('\n').enumerate() {
        if i > 0 {
            positions.newline();
        }

        let key = line.trim().trim_end_matches(['{', ';']).trim();
        if !key.is_empty()
            && let Some(offset) = source[cursor.min(source.len())..]
                .iter()
                .position(|s| s.starts_with(key))
        {
            cursor += offset;
        }

        let indent = line.len() - line.trim_start().len();
        positions.mark(indent as u32, cursor as u32, 0);
    }

    positions
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::core::{Environment, Mode};

    fn run(file: File) -> Result<Option<File>, TransformError> {
        let env = Environment::new("/p", Mode::Build);
        Sass::new(SassOptions::default()).transform(&StepContext { env: &env }, file)
    }

    #[test]
    fn compiles_nesting_and_renames() {
        let file = File::new("/p/app/styles", "main.scss", "$c: red;\na {\n  b { color: $c; }\n}\n");
        let out = run(file).unwrap().unwrap();
        let css = String::from_utf8(out.contents).unwrap();
        assert!(css.contains("a b {"));
        assert!(css.contains("color: red;"));
        assert_eq!(out.relative, "main.css");
    }

    #[test]
    fn partials_are_dropped() {
        let file = File::new("/p/app/styles", "_vars.scss", "$c: red;");
        assert!(run(file).unwrap().is_none());
    }

    #[test]
    fn syntax_error_names_the_file() {
        let file = File::new("/p/app/styles", "main.scss", "a {\n  color: red\n  b: c;\n");
        let err = run(file).unwrap_err();
        assert_eq!(err.transform, "sass");
        assert_eq!(err.path, Utf8Path::new("/p/app/styles/main.scss"));
    }

    #[test]
    fn map_points_at_scss_lines() {
        let mut file = File::new("/p/app/styles", "main.scss", "a {\n  color: red;\n}\n\nb {\n  margin: 0;\n}\n");
        file.begin_map(Utf8Path::new("/p"));
        let out = run(file).unwrap().unwrap();
        let map = out.map.unwrap();

        let css = String::from_utf8(out.contents).unwrap();
        let b_line = css.lines().position(|l| l.starts_with("b {")).unwrap() as u32;
        assert_eq!(map.lookup(b_line, 0).unwrap().src_line, 4);
        assert_eq!(map.sources, vec!["app/styles/main.scss".to_string()]);
    }

    #[test]
    fn error_location_from_report() {
        let report = "Error: expected \";\".\n  ╷\n3 │   b: c;\n  │   ^\n  ╵\n  main.scss 3:3  root stylesheet";
        let (message, location) = describe(report);
        assert_eq!(message, "expected \";\".");
        assert_eq!(location, Some((3, 3)));
    }
}
