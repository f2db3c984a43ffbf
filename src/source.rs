//! Resolving glob patterns into a [`FileSet`].

use std::collections::HashSet;
use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern, glob_with};

use crate::error::{BuildError, ConfigError};
use crate::file::{File, FileSet};

/// A list of glob patterns, `!`-prefixed patterns exclude matches.
#[derive(Debug, Clone)]
pub struct Source {
    patterns: Vec<String>,
    dot: bool,
}

impl Source {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            dot: false,
        }
    }

    /// Let wildcards match names starting with a dot.
    pub fn dot(mut self, dot: bool) -> Self {
        self.dot = dot;
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Patterns that select files (the ones without `!`).
    pub fn positive(&self) -> impl Iterator<Item = &str> {
        self.patterns
            .iter()
            .map(String::as_str)
            .filter(|p| !p.starts_with('!'))
    }

    fn options(&self) -> MatchOptions {
        MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: !self.dot,
        }
    }

    fn negations(&self, root: &Utf8Path) -> Result<Vec<Pattern>, ConfigError> {
        self.patterns
            .iter()
            .filter_map(|p| p.strip_prefix('!'))
            .map(|p| Pattern::new(&anchor(root, p)).map_err(ConfigError::from))
            .collect()
    }

    /// Read every file matched by the patterns, in pattern order, without
    /// duplicates. Directories are skipped and a pattern matching nothing
    /// contributes nothing.
    pub fn resolve(&self, root: &Utf8Path) -> Result<FileSet, BuildError> {
        let options = self.options();
        let negations = self.negations(root)?;
        // negations match hidden files too, `!node_modules/**` must cover `.bin`
        let negation_options = MatchOptions {
            require_literal_leading_dot: false,
            ..options
        };

        let mut seen = HashSet::new();
        let mut files = FileSet::new();

        for pattern in self.positive() {
            let base = root.join(glob_base(pattern));
            let full = anchor(root, pattern);

            let mut matched = Vec::new();
            for entry in glob_with(&full, options).map_err(ConfigError::from)? {
                let path = Utf8PathBuf::try_from(entry?)?;

                if !path.is_file()
                    || negations
                        .iter()
                        .any(|n| n.matches_path_with(path.as_std_path(), negation_options))
                {
                    continue;
                }

                if seen.insert(path.clone()) {
                    matched.push(path);
                }
            }

            for path in matched {
                let relative = match path.strip_prefix(&base) {
                    Ok(relative) => relative.to_path_buf(),
                    Err(_) => Utf8PathBuf::from(path.file_name().unwrap_or(path.as_str())),
                };
                let contents = fs::read(&path)?;
                files.push(File::new(base.clone(), relative, contents));
            }
        }

        Ok(files)
    }

    /// Every path matched by the patterns, directories included, sorted and
    /// without duplicates.
    pub(crate) fn entries(&self, root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BuildError> {
        let options = self.options();
        let negations = self.negations(root)?;
        let negation_options = MatchOptions {
            require_literal_leading_dot: false,
            ..options
        };

        let mut paths = Vec::new();
        for pattern in self.positive() {
            for entry in glob_with(&anchor(root, pattern), options).map_err(ConfigError::from)? {
                let path = Utf8PathBuf::try_from(entry?)?;
                if !negations
                    .iter()
                    .any(|n| n.matches_path_with(path.as_std_path(), negation_options))
                {
                    paths.push(path);
                }
            }
        }

        paths.sort();
        paths.dedup();
        Ok(paths)
    }
}

/// Join a project-relative pattern onto the (escaped) root.
pub(crate) fn anchor(root: &Utf8Path, pattern: &str) -> String {
    if Utf8Path::new(pattern).is_absolute() {
        return pattern.to_string();
    }
    let root = Pattern::escape(root.as_str());
    let pattern = pattern.trim_start_matches("./");
    if root.ends_with('/') {
        format!("{root}{pattern}")
    } else {
        format!("{root}/{pattern}")
    }
}

/// The static directory prefix of a glob: every component before the first
/// one with a wildcard. A pattern without wildcards names a file, its base is
/// the parent directory.
pub fn glob_base(pattern: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(pattern.trim_start_matches("./"));
    let components: Vec<_> = path.components().collect();

    match components.iter().position(|c| is_magic(c)) {
        Some(index) => components[..index].iter().collect(),
        None => path.parent().map(Utf8Path::to_path_buf).unwrap_or_default(),
    }
}

fn is_magic(component: &Utf8Component<'_>) -> bool {
    component.as_str().contains(['*', '?', '[', '{'])
}
