use std::collections::BTreeMap;

use console::style;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::core::Mode;
use crate::error::TransformError;
use crate::file::File;

use super::js::{Kind, Token, tokenize};
use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "lint-js";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Off,
    Warn,
    Error,
}

/// A single lint finding, 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub rule: &'static str,
    pub severity: Severity,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

const RULES: &[&str] = &["no-debugger", "eqeqeq", "no-var", "no-console", "no-trailing-spaces"];

fn known_rules<'de, D>(deserializer: D) -> Result<BTreeMap<String, Severity>, D::Error>
where
    D: Deserializer<'de>,
{
    let rules = BTreeMap::<String, Severity>::deserialize(deserializer)?;
    match rules.keys().find(|rule| !RULES.contains(&rule.as_str())) {
        Some(unknown) => Err(D::Error::custom(format!(
            "unknown rule `{unknown}`, expected one of {}",
            RULES.join(", ")
        ))),
        None => Ok(rules),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LintOptions {
    #[serde(deserialize_with = "known_rules")]
    pub rules: BTreeMap<String, Severity>,
    /// Fail the file when it has errors. Only honored in build mode.
    pub fail_after_error: bool,
}

impl Default for LintOptions {
    fn default() -> Self {
        let rules = [
            ("no-debugger", Severity::Error),
            ("eqeqeq", Severity::Error),
            ("no-var", Severity::Warn),
            ("no-console", Severity::Off),
            ("no-trailing-spaces", Severity::Warn),
        ]
        .into_iter()
        .map(|(name, severity)| (name.to_string(), severity))
        .collect();

        Self {
            rules,
            fail_after_error: true,
        }
    }
}

/// Reports common problems in scripts and passes them through unchanged.
pub struct LintJs {
    options: LintOptions,
}

impl LintJs {
    pub fn new(options: LintOptions) -> Self {
        Self { options }
    }

    fn severity(&self, rule: &str) -> Severity {
        self.options.rules.get(rule).copied().unwrap_or(Severity::Off)
    }

    /// Check a script, problems are sorted by position.
    pub fn lint(&self, src: &str) -> Result<Vec<Problem>, TransformError> {
        let tokens = tokenize(src).map_err(|e| {
            TransformError::new(NAME, "", format!("Parsing error: {}", e.message))
                .at(e.line + 1, e.column + 1)
        })?;

        let mut problems = Vec::new();
        let mut report = |rule: &'static str, line: u32, column: u32, message: String| {
            let severity = self.severity(rule);
            if severity != Severity::Off {
                problems.push(Problem {
                    rule,
                    severity,
                    line: line + 1,
                    column: column + 1,
                    message,
                });
            }
        };

        let significant: Vec<&Token<'_>> = tokens
            .iter()
            .filter(|t| {
                !matches!(
                    t.kind,
                    Kind::Whitespace { .. } | Kind::LineComment | Kind::BlockComment
                )
            })
            .collect();

        for (i, token) in significant.iter().enumerate() {
            match (token.kind, token.text) {
                (Kind::Word, "debugger") => {
                    report("no-debugger", token.line, token.column, "Unexpected 'debugger' statement.".into())
                }
                (Kind::Word, "var") => report(
                    "no-var",
                    token.line,
                    token.column,
                    "Unexpected var, use let or const instead.".into(),
                ),
                (Kind::Punct, op @ ("==" | "!=")) => report(
                    "eqeqeq",
                    token.line,
                    token.column,
                    format!("Expected '{op}=' and instead saw '{op}'."),
                ),
                (Kind::Word, "console")
                    if significant.get(i + 1).is_some_and(|t| t.text == ".")
                        && significant.get(i.wrapping_sub(1)).is_none_or(|t| t.text != ".") =>
                {
                    report("no-console", token.line, token.column, "Unexpected console statement.".into())
                }
                _ => {}
            }
        }

        for (line, text) in src.split('\n').enumerate() {
            let text = text.strip_suffix('\r').unwrap_or(text);
            let trimmed = text.trim_end();
            if trimmed.len() != text.len() {
                report(
                    "no-trailing-spaces",
                    line as u32,
                    trimmed.chars().count() as u32,
                    "Trailing spaces not allowed.".into(),
                );
            }
        }

        problems.sort_by_key(|p| (p.line, p.column));
        Ok(problems)
    }
}

impl FileTransform for LintJs {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, ctx: &StepContext<'_>, file: File) -> Result<Option<File>, TransformError> {
        let path = file.path();
        let problems = self
            .lint(file.text(NAME)?)
            .map_err(|e| TransformError { path: path.clone(), ..e })?;

        if problems.is_empty() {
            return Ok(Some(file));
        }

        let errors = problems.iter().filter(|p| p.severity == Severity::Error).count();
        let warnings = problems.len() - errors;

        let mut report = format!("{}\n", style(&path).underlined());
        for p in &problems {
            let severity = match p.severity {
                Severity::Error => style("error").red(),
                _ => style("warning").yellow(),
            };
            report.push_str(&format!(
                "  {:>4}:{:<3} {severity}  {}  {}\n",
                p.line,
                p.column,
                p.message,
                style(p.rule).dim()
            ));
        }
        report.push_str(&format!(
            "✖ {} problem{} ({errors} error{}, {warnings} warning{})",
            problems.len(),
            if problems.len() == 1 { "" } else { "s" },
            if errors == 1 { "" } else { "s" },
            if warnings == 1 { "" } else { "s" },
        ));

        if errors > 0 {
            tracing::error!("{report}");
        } else {
            tracing::warn!("{report}");
        }

        if errors > 0 && self.options.fail_after_error && ctx.env.mode == Mode::Build {
            let first = problems
                .iter()
                .find(|p| p.severity == Severity::Error)
                .map(|p| (p.line, p.column, format!("{} ({})", p.message, p.rule)));

            let err = TransformError::new(NAME, path, format!("{errors} lint error(s)"));
            return Err(match first {
                Some((line, column, message)) => TransformError { message, ..err.at(line, column) },
                None => err,
            });
        }

        Ok(Some(file))
    }
}
