use serde::Deserialize;

use crate::error::TransformError;
use crate::file::File;
use crate::sourcemap::PositionMap;

use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "minify-css";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinifyCssOptions {
    /// Keep `/*! ... */` comments.
    pub keep_important_comments: bool,
}

impl Default for MinifyCssOptions {
    fn default() -> Self {
        Self {
            keep_important_comments: true,
        }
    }
}

/// Whitespace and comment removal for CSS.
///
/// Only the textual representation changes: no rules are merged or
/// reordered, so the result is always equivalent to the input.
pub struct MinifyCss {
    options: MinifyCssOptions,
}

impl MinifyCss {
    pub fn new(options: MinifyCssOptions) -> Self {
        Self { options }
    }

    pub fn minify(&self, css: &str) -> Result<(String, PositionMap), String> {
        minify(css, self.options.keep_important_comments)
    }
}

impl FileTransform for MinifyCss {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, _: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        let (css, positions) = self
            .minify(file.text(NAME)?)
            .map_err(|message| TransformError::new(NAME, file.path(), message))?;
        file.replace(css, Some(positions));
        Ok(Some(file))
    }
}

struct Writer {
    out: String,
    column: u32,
    positions: PositionMap,
}

impl Writer {
    fn push(&mut self, c: char) {
        self.out.push(c);
        if c == '\n' {
            self.positions.newline();
            self.column = 0;
        } else {
            self.column += 1;
        }
    }

    fn push_str(&mut self, s: &str) {
        for c in s.chars() {
            self.push(c);
        }
    }

    fn last(&self) -> Option<char> {
        self.out.chars().next_back()
    }
}

fn is_space_needed(prev: Option<char>, next: char, depth: u32) -> bool {
    let Some(prev) = prev else {
        return false;
    };

    if matches!(prev, '{' | '}' | ';' | ',' | ':' | '(' | '\n') {
        return false;
    }
    if matches!(next, '{' | '}' | ';' | ',' | '!' | ')') {
        return false;
    }
    if depth == 0 && (matches!(prev, '>' | '+' | '~') || matches!(next, '>' | '+' | '~')) {
        return false;
    }

    true
}

fn minify(css: &str, keep_important: bool) -> Result<(String, PositionMap), String> {
    let chars: Vec<char> = css.chars().collect();
    let mut w = Writer {
        out: String::with_capacity(css.len()),
        column: 0,
        positions: PositionMap::new(),
    };

    let (mut line, mut column) = (0u32, 0u32);
    let mut pending_space = false;
    let mut pending_semicolon = false;
    let mut depth = 0u32;
    let mut i = 0;

    // advance the input cursor over `n` chars
    let advance = |i: &mut usize, line: &mut u32, column: &mut u32, n: usize| {
        for _ in 0..n {
            if chars.get(*i) == Some(&'\n') {
                *line += 1;
                *column = 0;
            } else {
                *column += 1;
            }
            *i += 1;
        }
    };

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            pending_space = true;
            advance(&mut i, &mut line, &mut column, 1);
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let end = (i + 2..chars.len().saturating_sub(1))
                .find(|&j| chars[j] == '*' && chars[j + 1] == '/')
                .ok_or_else(|| format!("unclosed comment at {}:{}", line + 1, column + 1))?;
            let len = end + 2 - i;

            if keep_important && chars.get(i + 2) == Some(&'!') {
                if w.last().is_some_and(|l| l != '\n') {
                    w.push('\n');
                }
                w.positions.mark(w.column, line, column);
                w.push_str(&chars[i..i + len].iter().collect::<String>());
                w.push('\n');
                pending_space = false;
            }

            advance(&mut i, &mut line, &mut column, len);
            continue;
        }

        if c == ';' {
            pending_semicolon = true;
            pending_space = false;
            advance(&mut i, &mut line, &mut column, 1);
            continue;
        }

        if pending_semicolon {
            if c != '}' {
                w.push(';');
            }
            pending_semicolon = false;
        }

        if pending_space && is_space_needed(w.last(), c, depth) {
            w.push(' ');
        }
        pending_space = false;

        if w.last().is_none_or(|l| matches!(l, '{' | '}' | ';' | ',' | ' ' | '\n')) {
            w.positions.mark(w.column, line, column);
        }

        match c {
            '"' | '\'' => {
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        Some('\\') => j += 2,
                        Some(&q) if q == c => break,
                        Some('\n') | None => {
                            return Err(format!("unclosed string at {}:{}", line + 1, column + 1));
                        }
                        Some(_) => j += 1,
                    }
                }
                let len = j + 1 - i;
                w.push_str(&chars[i..i + len].iter().collect::<String>());
                advance(&mut i, &mut line, &mut column, len);
                continue;
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }

        w.push(c);
        advance(&mut i, &mut line, &mut column, 1);
    }

    while w.out.ends_with('\n') {
        w.out.pop();
    }

    Ok((w.out, w.positions))
}
