//! JavaScript tokenizer and minifier.
//!
//! The minifier works on tokens only: comments and insignificant whitespace
//! are removed, everything else is written back unchanged. A line break is
//! kept wherever dropping it could change how automatic semicolon insertion
//! reads the code. Names are not mangled and no dead code is removed.

use serde::Deserialize;

use crate::error::TransformError;
use crate::file::File;
use crate::sourcemap::PositionMap;

use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "minify-js";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Whitespace { newline: bool },
    LineComment,
    BlockComment,
    Word,
    Number,
    Str,
    Template,
    Regex,
    Punct,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Token<'a> {
    pub kind: Kind,
    pub text: &'a str,
    /// 0-based line of the first character.
    pub line: u32,
    /// 0-based column of the first character.
    pub column: u32,
}

impl Token<'_> {
    fn is(&self, kind: Kind, text: &str) -> bool {
        self.kind == kind && self.text == text
    }

    fn is_significant(&self) -> bool {
        !matches!(
            self.kind,
            Kind::Whitespace { .. } | Kind::LineComment | Kind::BlockComment
        )
    }
}

/// A tokenizer failure, with a 0-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LexError {
    pub message: &'static str,
    pub line: u32,
    pub column: u32,
}

const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "<<", ">>", "**",
];

/// Keywords after which a `/` starts a regular expression.
const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$' || !c.is_ascii()
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

fn regex_allowed(prev: Option<&Token<'_>>) -> bool {
    match prev {
        None => true,
        Some(t) => match t.kind {
            Kind::Punct => !matches!(t.text, ")" | "]"),
            Kind::Word => REGEX_KEYWORDS.contains(&t.text),
            _ => false,
        },
    }
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn peek(&self, offset: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.src[self.pos..].chars().next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: &'static str, line: u32, column: u32) -> LexError {
        LexError {
            message,
            line,
            column,
        }
    }

    fn string(&mut self, quote: char, line: u32, column: u32) -> Result<(), LexError> {
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some(c) if c == quote => return Ok(()),
                Some('\n') | None => return Err(self.error("unterminated string", line, column)),
                Some(_) => {}
            }
        }
    }

    fn template(&mut self, line: u32, column: u32) -> Result<(), LexError> {
        let mut depth = 0usize;
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated template", line, column)),
                Some('\\') => {
                    self.bump();
                }
                Some('`') if depth == 0 => return Ok(()),
                Some('$') if depth == 0 && self.peek(0) == Some('{') => {
                    self.bump();
                    depth = 1;
                }
                Some('{') if depth > 0 => depth += 1,
                Some('}') if depth > 0 => depth -= 1,
                Some(q @ ('"' | '\'')) if depth > 0 => self.string(q, line, column)?,
                Some('`') => self.template(line, column)?,
                Some(_) => {}
            }
        }
    }

    fn regex(&mut self, line: u32, column: u32) -> Result<(), LexError> {
        let mut class = false;
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some('[') => class = true,
                Some(']') => class = false,
                Some('/') if !class => break,
                Some('\n') | None => {
                    return Err(self.error("unterminated regular expression", line, column));
                }
                Some(_) => {}
            }
        }
        while self.peek(0).is_some_and(is_ident_part) {
            self.bump();
        }
        Ok(())
    }
}

/// Split JavaScript source into tokens, whitespace and comments included.
pub(crate) fn tokenize(src: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut lexer = Lexer {
        src,
        pos: 0,
        line: 0,
        column: 0,
    };
    let mut tokens: Vec<Token<'_>> = Vec::new();
    let mut prev: Option<usize> = None;

    while let Some(c) = lexer.peek(0) {
        let (start, line, column) = (lexer.pos, lexer.line, lexer.column);

        let kind = if c.is_whitespace() {
            let mut newline = false;
            while let Some(c) = lexer.peek(0).filter(|c| c.is_whitespace()) {
                newline |= c == '\n';
                lexer.bump();
            }
            Kind::Whitespace { newline }
        } else if c == '/' && lexer.peek(1) == Some('/') {
            while lexer.peek(0).is_some_and(|c| c != '\n') {
                lexer.bump();
            }
            Kind::LineComment
        } else if c == '/' && lexer.peek(1) == Some('*') {
            lexer.bump();
            lexer.bump();
            loop {
                match lexer.bump() {
                    Some('*') if lexer.peek(0) == Some('/') => {
                        lexer.bump();
                        break;
                    }
                    Some(_) => {}
                    None => return Err(lexer.error("unterminated comment", line, column)),
                }
            }
            Kind::BlockComment
        } else if c == '"' || c == '\'' {
            lexer.bump();
            lexer.string(c, line, column)?;
            Kind::Str
        } else if c == '`' {
            lexer.bump();
            lexer.template(line, column)?;
            Kind::Template
        } else if c.is_ascii_digit() || (c == '.' && lexer.peek(1).is_some_and(|n| n.is_ascii_digit())) {
            let mut last = c;
            lexer.bump();
            while let Some(n) = lexer.peek(0) {
                let exponent = matches!(n, '+' | '-')
                    && matches!(last, 'e' | 'E')
                    && !lexer.src[start..lexer.pos].starts_with("0x");
                if !(n.is_ascii_alphanumeric() || n == '.' || n == '_' || exponent) {
                    break;
                }
                last = n;
                lexer.bump();
            }
            Kind::Number
        } else if is_ident_start(c) || c == '#' || c == '\\' {
            lexer.bump();
            while lexer.peek(0).is_some_and(|c| is_ident_part(c) || c == '\\') {
                lexer.bump();
            }
            Kind::Word
        } else if c == '/' && regex_allowed(prev.map(|i| &tokens[i])) {
            lexer.bump();
            lexer.regex(line, column)?;
            Kind::Regex
        } else {
            let rest = &lexer.src[lexer.pos..];
            let len = PUNCTUATORS
                .iter()
                .find(|p| rest.starts_with(**p))
                .map(|p| p.chars().count())
                .unwrap_or(1);
            for _ in 0..len {
                lexer.bump();
            }
            Kind::Punct
        };

        let token = Token {
            kind,
            text: &src[start..lexer.pos],
            line,
            column,
        };
        if token.is_significant() {
            prev = Some(tokens.len());
        }
        tokens.push(token);
    }

    Ok(tokens)
}

/// Which comments survive minification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preserve {
    None,
    /// License comments: `/*!`, `//!`, `@license`, `@preserve`, `@cc_on`.
    #[default]
    Some,
    All,
}

impl Preserve {
    fn keeps(self, comment: &str) -> bool {
        match self {
            Preserve::None => false,
            Preserve::All => true,
            Preserve::Some => {
                comment.starts_with("/*!")
                    || comment.starts_with("//!")
                    || ["@license", "@preserve", "@cc_on"]
                        .iter()
                        .any(|tag| comment.contains(tag))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinifyJsOptions {
    pub preserve_comments: Preserve,
    /// Remove `debugger` statements.
    pub drop_debugger: bool,
}

impl Default for MinifyJsOptions {
    fn default() -> Self {
        Self {
            preserve_comments: Preserve::Some,
            drop_debugger: true,
        }
    }
}

pub struct MinifyJs {
    options: MinifyJsOptions,
}

impl MinifyJs {
    pub fn new(options: MinifyJsOptions) -> Self {
        Self { options }
    }

    pub fn minify(&self, src: &str) -> Result<(String, PositionMap), TransformError> {
        let tokens = tokenize(src).map_err(|e| {
            TransformError::new(NAME, "", e.message).at(e.line + 1, e.column + 1)
        })?;
        Ok(minify(&tokens, self.options.preserve_comments, self.options.drop_debugger))
    }
}

impl FileTransform for MinifyJs {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, _: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        let (js, positions) = self.minify(file.text(NAME)?).map_err(|e| TransformError {
            path: file.path(),
            ..e
        })?;
        file.replace(js, Some(positions));
        Ok(Some(file))
    }
}

fn is_wordlike(token: &Token<'_>) -> bool {
    matches!(token.kind, Kind::Word | Kind::Number)
}

/// Keywords that end a statement when followed by a line break.
fn is_restricted(token: &Token<'_>) -> bool {
    token.kind == Kind::Word
        && matches!(token.text, "return" | "throw" | "break" | "continue" | "yield")
}

/// Whether a line break between `prev` and `next` may act as a semicolon.
fn keeps_newline(prev: &Token<'_>, next: &Token<'_>) -> bool {
    if is_restricted(prev) {
        return !matches!(next.text, ";" | "}");
    }

    let ends_expression = match prev.kind {
        Kind::Word | Kind::Number | Kind::Str | Kind::Template | Kind::Regex => true,
        Kind::Punct => matches!(prev.text, ")" | "]" | "}" | "++" | "--"),
        _ => false,
    };
    let starts_statement = match next.kind {
        Kind::Word | Kind::Number | Kind::Str | Kind::Template | Kind::Regex => true,
        Kind::Punct => matches!(next.text, "++" | "--" | "{" | "!" | "~"),
        _ => false,
    };

    ends_expression && starts_statement
}

fn separator(prev: &Token<'_>, next: &Token<'_>, newline: bool) -> &'static str {
    if newline && keeps_newline(prev, next) {
        return "\n";
    }

    let left_word = is_wordlike(prev) || prev.kind == Kind::Regex;
    if left_word && is_wordlike(next) {
        return " ";
    }
    if prev.kind == Kind::Number && next.text.starts_with('.') {
        return " ";
    }
    if prev.kind == Kind::Punct {
        let (a, b) = (prev.text, next.text);
        if (a.ends_with('+') && b.starts_with('+'))
            || (a.ends_with('-') && b.starts_with('-'))
            || (a.ends_with('/') && b.starts_with('/'))
        {
            return " ";
        }
    }

    ""
}

struct Writer {
    out: String,
    column: u32,
    positions: PositionMap,
}

impl Writer {
    fn write(&mut self, text: &str) {
        for c in text.chars() {
            self.out.push(c);
            if c == '\n' {
                self.positions.newline();
                self.column = 0;
            } else {
                self.column += 1;
            }
        }
    }
}

fn next_significant<'t, 'a>(tokens: &'t [Token<'a>], i: usize) -> Option<(usize, &'t Token<'a>)> {
    tokens
        .iter()
        .enumerate()
        .skip(i + 1)
        .find(|(_, t)| t.is_significant())
}

/// `debugger` in statement position, not a property name or a method.
fn is_debugger_statement(tokens: &[Token<'_>], i: usize, prev: Option<&Token<'_>>) -> bool {
    if !tokens[i].is(Kind::Word, "debugger") {
        return false;
    }
    if prev.is_some_and(|p| p.is(Kind::Punct, ".") || p.is(Kind::Punct, "?.")) {
        return false;
    }
    !next_significant(tokens, i).is_some_and(|(_, t)| t.is(Kind::Punct, ":") || t.is(Kind::Punct, "("))
}

fn minify<'a>(tokens: &[Token<'a>], preserve: Preserve, drop_debugger: bool) -> (String, PositionMap) {
    let mut w = Writer {
        out: String::new(),
        column: 0,
        positions: PositionMap::new(),
    };

    let mut prev: Option<Token<'a>> = None;
    let mut pending: Option<bool> = None;
    let mut skip: Option<usize> = None;

    for (i, token) in tokens.iter().enumerate() {
        if skip == Some(i) {
            skip = None;
            continue;
        }

        match token.kind {
            Kind::Whitespace { newline } => {
                pending = Some(pending.unwrap_or(false) || newline);
            }
            Kind::LineComment | Kind::BlockComment if preserve.keeps(token.text) => {
                if !w.out.is_empty() && !w.out.ends_with('\n') {
                    w.write("\n");
                }
                w.positions.mark(w.column, token.line, token.column);
                w.write(token.text);
                w.write("\n");
                pending = None;
            }
            Kind::LineComment => {
                pending = Some(pending.unwrap_or(false));
            }
            Kind::BlockComment => {
                pending = Some(pending.unwrap_or(false) || token.text.contains('\n'));
            }
            Kind::Word if drop_debugger && is_debugger_statement(tokens, i, prev.as_ref()) => {
                let following = match next_significant(tokens, i) {
                    Some((j, t)) if t.is(Kind::Punct, ";") => {
                        skip = Some(j);
                        next_significant(tokens, j).map(|(_, t)| t)
                    }
                    next => next.map(|(_, t)| t),
                };

                // An empty statement keeps `if (x) debugger;` bodies intact.
                let redundant = (w.out.is_empty() || w.out.ends_with([';', '{', '}']))
                    && !following.is_some_and(|t| t.is(Kind::Word, "else"));
                if !redundant {
                    w.positions.mark(w.column, token.line, token.column);
                    w.write(";");
                    prev = Some(Token {
                        kind: Kind::Punct,
                        text: ";",
                        ..*token
                    });
                    pending = None;
                }
            }
            _ => {
                if let Some(prev) = &prev
                    && !w.out.ends_with('\n')
                {
                    w.write(separator(prev, token, pending.unwrap_or(false)));
                }

                w.positions.mark(w.column, token.line, token.column);
                w.write(token.text);
                pending = None;
                prev = Some(*token);
            }
        }
    }

    while w.out.ends_with('\n') {
        w.out.pop();
    }

    (w.out, w.positions)
}
