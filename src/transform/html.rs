//! HTML transforms: build-block replacement and minification.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::error::TransformError;
use crate::file::File;

use super::{FileTransform, StepContext};

pub(super) const USEREF: &str = "useref";
pub(super) const MINIFY: &str = "minify-html";

static BUILD_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<!--\s*build:(\w+)(?:\(([^)]*)\))?(?:\s+(\S+))?\s*-->.*?<!--\s*endbuild\s*-->",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserefOptions {
    /// Only rewrite the HTML, the referenced assets are built by their own
    /// tasks. The only supported mode.
    pub no_assets: bool,
}

impl Default for UserefOptions {
    fn default() -> Self {
        Self { no_assets: true }
    }
}

/// Replaces `<!-- build:css|js path -->…<!-- endbuild -->` blocks with a
/// single reference to the built asset and drops `build:remove` blocks.
pub struct Useref;

impl Useref {
    pub fn new(options: UserefOptions) -> Self {
        if !options.no_assets {
            tracing::warn!("useref only rewrites HTML, referenced assets are built by their own tasks");
        }
        Self
    }

    pub fn rewrite(html: &str) -> Result<String, String> {
        let mut error = None;

        let out = BUILD_BLOCK.replace_all(html, |caps: &Captures<'_>| {
            let kind = &caps[1];
            let target = caps.get(3).map(|m| m.as_str());

            match (kind, target) {
                ("remove", _) => String::new(),
                ("css", Some(path)) => format!(r#"<link rel="stylesheet" href="{path}">"#),
                ("js", Some(path)) => format!(r#"<script src="{path}"></script>"#),
                (kind, _) => {
                    error.get_or_insert_with(|| format!("unsupported build block '{kind}'"));
                    caps[0].to_string()
                }
            }
        });

        match error {
            Some(error) => Err(error),
            None => Ok(out.into_owned()),
        }
    }
}

impl FileTransform for Useref {
    fn name(&self) -> &str {
        USEREF
    }

    fn transform(&self, _: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        let html = Self::rewrite(file.text(USEREF)?)
            .map_err(|message| TransformError::new(USEREF, file.path(), message))?;
        file.replace(html, None);
        Ok(Some(file))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinifyHtmlOptions {
    pub remove_comments: bool,
    pub collapse_whitespace: bool,
    pub collapse_boolean_attributes: bool,
    pub remove_attribute_quotes: bool,
    pub remove_redundant_attributes: bool,
    pub remove_empty_attributes: bool,
    pub remove_script_type_attributes: bool,
    pub remove_style_link_type_attributes: bool,
    pub remove_optional_tags: bool,
}

impl Default for MinifyHtmlOptions {
    fn default() -> Self {
        Self {
            remove_comments: true,
            collapse_whitespace: true,
            collapse_boolean_attributes: true,
            remove_attribute_quotes: true,
            remove_redundant_attributes: true,
            remove_empty_attributes: true,
            remove_script_type_attributes: true,
            remove_style_link_type_attributes: true,
            remove_optional_tags: true,
        }
    }
}

const INLINE: &[&str] = &[
    "a", "abbr", "acronym", "b", "bdi", "bdo", "big", "br", "button", "cite", "code", "data",
    "del", "dfn", "em", "font", "i", "img", "input", "ins", "kbd", "label", "mark", "math",
    "meter", "nobr", "object", "output", "picture", "progress", "q", "rp", "rt", "ruby", "s",
    "samp", "select", "small", "span", "strike", "strong", "sub", "sup", "svg", "textarea",
    "time", "tt", "u", "var", "video", "audio", "wbr",
];

const VOID: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Elements whose content is copied verbatim.
const RAW: &[&str] = &["script", "style", "pre", "textarea"];

const BOOLEAN: &[&str] = &[
    "allowfullscreen", "async", "autofocus", "autoplay", "checked", "compact", "controls",
    "declare", "default", "defer", "disabled", "formnovalidate", "hidden", "inert", "ismap",
    "itemscope", "loop", "multiple", "muted", "nomodule", "novalidate", "nowrap", "open",
    "readonly", "required", "reversed", "selected",
];

const OPTIONAL_START: &[&str] = &["html", "head", "body"];

const OPTIONAL_END: &[&str] = &[
    "html", "head", "body", "li", "dt", "dd", "option", "tr", "td", "th", "thead", "tbody",
    "tfoot",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attr<'a> {
    name: String,
    value: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node<'a> {
    Text(String),
    Comment(&'a str),
    /// Doctypes and other `<!...>` declarations.
    Declaration(&'a str),
    Start {
        name: String,
        attrs: Vec<Attr<'a>>,
        self_closing: bool,
    },
    End(String),
    /// Contents of a raw text element.
    Raw(&'a str),
}

impl Node<'_> {
    /// Whether whitespace next to this node can be dropped.
    fn is_block(&self) -> bool {
        match self {
            Node::Start { name, .. } | Node::End(name) => !INLINE.contains(&name.as_str()),
            Node::Declaration(_) => true,
            _ => false,
        }
    }
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

fn parse_tag(src: &str) -> Option<(Node<'_>, usize)> {
    let bytes = src.as_bytes();
    let mut i = 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-' || bytes[i] == b':') {
        i += 1;
    }
    let name = src[1..i].to_ascii_lowercase();

    let mut attrs = Vec::new();
    let mut self_closing = false;

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match bytes.get(i)? {
            b'>' => return Some((Node::Start { name, attrs, self_closing }, i + 1)),
            b'/' => {
                self_closing = true;
                i += 1;
                continue;
            }
            _ => self_closing = false,
        }

        let start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'>' | b'/') {
            i += 1;
        }
        let attr = src[start..i].to_ascii_lowercase();
        if attr.is_empty() {
            i += 1;
            continue;
        }

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            attrs.push(Attr { name: attr, value: None });
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let value = match bytes.get(i)? {
            &q @ (b'"' | b'\'') => {
                let end = i + 1 + src[i + 1..].find(q as char)?;
                let value = &src[i + 1..end];
                i = end + 1;
                value
            }
            _ => {
                let start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                &src[start..i]
            }
        };
        attrs.push(Attr {
            name: attr,
            value: Some(value),
        });
    }
}

fn parse(html: &str) -> Vec<Node<'_>> {
    let mut nodes = Vec::new();
    let mut rest = html;

    while !rest.is_empty() {
        let bytes = rest.as_bytes();

        if rest.starts_with("<!--") {
            let end = rest.find("-->").map(|e| e + 3).unwrap_or(rest.len());
            nodes.push(Node::Comment(&rest[..end]));
            rest = &rest[end..];
        } else if rest.starts_with("<!") || rest.starts_with("<?") {
            let end = rest.find('>').map(|e| e + 1).unwrap_or(rest.len());
            nodes.push(Node::Declaration(&rest[..end]));
            rest = &rest[end..];
        } else if rest.starts_with("</") && bytes.get(2).is_some_and(u8::is_ascii_alphabetic) {
            let end = rest.find('>').map(|e| e + 1).unwrap_or(rest.len());
            let name = rest[2..end].trim_end_matches('>').trim().to_ascii_lowercase();
            nodes.push(Node::End(name));
            rest = &rest[end..];
        } else if bytes[0] == b'<'
            && bytes.get(1).is_some_and(u8::is_ascii_alphabetic)
            && let Some((node, len)) = parse_tag(rest)
        {
            let raw = match &node {
                Node::Start { name, self_closing: false, .. } if RAW.contains(&name.as_str()) => {
                    Some(name.clone())
                }
                _ => None,
            };
            nodes.push(node);
            rest = &rest[len..];

            if let Some(name) = raw {
                let end = find_ci(rest, &format!("</{name}")).unwrap_or(rest.len());
                nodes.push(Node::Raw(&rest[..end]));
                rest = &rest[end..];
            }
        } else {
            let first = rest.chars().next().map_or(1, char::len_utf8);
            let end = rest[first..].find('<').map_or(rest.len(), |e| e + first);
            let text = &rest[..end];
            match nodes.last_mut() {
                Some(Node::Text(prev)) => prev.push_str(text),
                _ => nodes.push(Node::Text(text.to_string())),
            }
            rest = &rest[end..];
        }
    }

    nodes
}

fn collapse(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut space = false;
    for c in text.chars() {
        if c.is_ascii_whitespace() {
            space = true;
        } else {
            if space {
                out.push(' ');
                space = false;
            }
            out.push(c);
        }
    }
    if space {
        out.push(' ');
    }
    out
}

/// html-minifier style minification. Contents of `pre`, `textarea`,
/// `script` and `style` are never touched.
pub struct MinifyHtml {
    options: MinifyHtmlOptions,
}

impl MinifyHtml {
    pub fn new(options: MinifyHtmlOptions) -> Self {
        Self { options }
    }

    fn keep_attr(&self, tag: &str, attr: &Attr<'_>, attrs: &[Attr<'_>]) -> bool {
        let o = &self.options;
        let value = attr.value.map(|v| v.trim().to_ascii_lowercase());
        let value = value.as_deref();
        let has = |name: &str| attrs.iter().any(|a| a.name == name);

        if o.remove_script_type_attributes
            && tag == "script"
            && attr.name == "type"
            && matches!(value, Some("" | "text/javascript" | "application/javascript"))
        {
            return false;
        }

        if o.remove_style_link_type_attributes
            && attr.name == "type"
            && value == Some("text/css")
            && (tag == "style"
                || (tag == "link"
                    && attrs
                        .iter()
                        .any(|a| a.name == "rel" && a.value.is_some_and(|v| v.eq_ignore_ascii_case("stylesheet")))))
        {
            return false;
        }

        if o.remove_redundant_attributes {
            let redundant = match (tag, attr.name.as_str()) {
                ("form", "method") => value == Some("get"),
                ("input", "type") => value == Some("text"),
                ("button", "type") => false,
                ("area", "shape") => value == Some("rect"),
                ("script", "language") => value == Some("javascript"),
                ("script", "charset") => !has("src"),
                _ => false,
            };
            if redundant {
                return false;
            }
        }

        if o.remove_empty_attributes
            && value == Some("")
            && (matches!(attr.name.as_str(), "class" | "id" | "style" | "title" | "lang" | "dir")
                || attr.name.starts_with("on"))
        {
            return false;
        }

        true
    }

    fn write_attr(&self, out: &mut String, attr: &Attr<'_>) {
        out.push(' ');
        out.push_str(&attr.name);

        let Some(value) = attr.value else {
            return;
        };
        if self.options.collapse_boolean_attributes && BOOLEAN.contains(&attr.name.as_str()) {
            return;
        }

        out.push('=');
        let bare = self.options.remove_attribute_quotes
            && !value.is_empty()
            && !value.ends_with('/')
            && !value.contains(|c: char| c.is_ascii_whitespace() || "\"'`=<>".contains(c));

        if bare {
            out.push_str(value);
        } else if value.contains('"') {
            out.push('\'');
            out.push_str(value);
            out.push('\'');
        } else {
            out.push('"');
            out.push_str(value);
            out.push('"');
        }
    }

    /// The node written after `i`, skipping whitespace that collapses away.
    fn next_written<'n, 'a>(&self, nodes: &'n [Node<'a>], i: usize) -> Option<&'n Node<'a>> {
        (i + 1..nodes.len()).map(|j| (j, &nodes[j])).find_map(|(j, node)| match node {
            Node::Text(text)
                if self.options.collapse_whitespace
                    && text.trim().is_empty()
                    && (nodes[j - 1].is_block() || nodes.get(j + 1).is_none_or(Node::is_block)) =>
            {
                None
            }
            node => Some(node),
        })
    }

    /// HTML's omission rules for `html`, `head` and `body`.
    fn omit_start(&self, name: &str, next: Option<&Node<'_>>) -> bool {
        let leading_space = |text: &str| {
            !self.options.collapse_whitespace && text.starts_with(|c: char| c.is_ascii_whitespace())
        };
        match (name, next) {
            ("html", next) => !matches!(next, Some(Node::Comment(_))),
            ("head", next) => matches!(next, None | Some(Node::Start { .. } | Node::End(_))),
            ("body", None | Some(Node::End(_))) => true,
            ("body", Some(Node::Start { name, .. })) => {
                !matches!(name.as_str(), "meta" | "link" | "script" | "style" | "template")
            }
            ("body", Some(Node::Text(text))) => !leading_space(text),
            _ => false,
        }
    }

    fn omit_end(&self, name: &str, next: Option<&Node<'_>>) -> bool {
        match (name, next) {
            (_, Some(Node::Comment(_))) => false,
            ("head", Some(Node::Text(text))) => {
                self.options.collapse_whitespace || !text.starts_with(|c: char| c.is_ascii_whitespace())
            }
            _ => OPTIONAL_END.contains(&name),
        }
    }

    pub fn minify(&self, html: &str) -> String {
        let o = &self.options;

        let mut nodes: Vec<Node<'_>> = Vec::new();
        for node in parse(html) {
            let keep_comment = |c: &str| !o.remove_comments || c.starts_with("<!--[if") || c.starts_with("<!--<![");
            match node {
                Node::Comment(c) if !keep_comment(c) => {}
                Node::Text(text) => match nodes.last_mut() {
                    Some(Node::Text(prev)) => prev.push_str(&text),
                    _ => nodes.push(Node::Text(text)),
                },
                node => nodes.push(node),
            }
        }

        let mut out = String::with_capacity(html.len());

        for (i, node) in nodes.iter().enumerate() {
            match node {
                Node::Text(text) if o.collapse_whitespace => {
                    let mut text = collapse(text);
                    let prev_block = i == 0 || nodes[i - 1].is_block();
                    let next_block = nodes.get(i + 1).is_none_or(Node::is_block);
                    if prev_block {
                        text = text.trim_start().to_string();
                    }
                    if next_block {
                        text = text.trim_end().to_string();
                    }
                    out.push_str(&text);
                }
                Node::Text(text) => out.push_str(text),
                Node::Comment(c) | Node::Declaration(c) | Node::Raw(c) => out.push_str(c),
                Node::Start {
                    name,
                    attrs,
                    self_closing,
                } => {
                    if o.remove_optional_tags
                        && attrs.is_empty()
                        && OPTIONAL_START.contains(&name.as_str())
                        && self.omit_start(name, self.next_written(&nodes, i))
                    {
                        continue;
                    }
                    out.push('<');
                    out.push_str(name);
                    for attr in attrs.iter().filter(|a| self.keep_attr(name, a, attrs)) {
                        self.write_attr(&mut out, attr);
                    }
                    if *self_closing && !VOID.contains(&name.as_str()) {
                        out.push('/');
                    }
                    out.push('>');
                }
                Node::End(name) => {
                    if o.remove_optional_tags && self.omit_end(name, self.next_written(&nodes, i)) {
                        continue;
                    }
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
        }

        out
    }
}

impl FileTransform for MinifyHtml {
    fn name(&self) -> &str {
        MINIFY
    }

    fn transform(&self, _: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        let html = self.minify(file.text(MINIFY)?);
        file.replace(html, None);
        Ok(Some(file))
    }
}
