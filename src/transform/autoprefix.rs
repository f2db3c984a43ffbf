//! Vendor prefixes for the configured browser targets.
//!
//! Every declaration with a known prefixed form that one of the targets
//! still needs gets the prefixed declarations inserted before it, unless the
//! same block already spells them out. A declaration alone on its line (the
//! expanded style the Sass step emits) gets them as lines above, compact rules
//! get them inline, so line numbers never move.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{ConfigError, TransformError};
use crate::file::File;
use crate::sourcemap::PositionMap;

use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "autoprefix";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Browser {
    Ie,
    IeMobile,
    Edge,
    Firefox,
    Chrome,
    Safari,
    Opera,
    Ios,
    Android,
    BlackBerry,
}

impl Browser {
    fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "ie" | "explorer" => Browser::Ie,
            "ie_mob" | "iemobile" | "explorermobile" => Browser::IeMobile,
            "edge" => Browser::Edge,
            "ff" | "firefox" => Browser::Firefox,
            "chrome" | "and_chr" => Browser::Chrome,
            "safari" => Browser::Safari,
            "opera" => Browser::Opera,
            "ios" | "ios_saf" => Browser::Ios,
            "android" => Browser::Android,
            "bb" | "blackberry" => Browser::BlackBerry,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Version(u32, u32);

impl Version {
    fn parse(text: &str) -> Option<Self> {
        let (major, minor) = match text.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (text, "0"),
        };
        Some(Version(major.parse().ok()?, minor.parse().ok()?))
    }
}

/// A browser and the oldest version of it that must be supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub browser: Browser,
    oldest: Version,
}

static QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_]+)\s*(>=|<=|>|<|=)?\s*(\d+(?:\.\d+)?)\s*$").expect("valid regex")
});

impl Target {
    /// Parse a `name [op] version` query such as `ie >= 10` or
    /// `android >= 4.4`. An upper bound (`<`, `<=`) keeps every old version.
    pub fn parse(query: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::BrowserQuery(query.to_string());

        let caps = QUERY.captures(query).ok_or_else(invalid)?;
        let browser = Browser::parse(&caps[1]).ok_or_else(invalid)?;
        let version = Version::parse(&caps[3]).ok_or_else(invalid)?;

        let oldest = match caps.get(2).map(|m| m.as_str()) {
            None | Some("=") | Some(">=") => version,
            Some(">") => Version(version.0, version.1 + 1),
            _ => Version(0, 0),
        };

        Ok(Self { browser, oldest })
    }
}

/// Browsers and the first version that no longer needs the prefix.
type Needs = &'static [(Browser, u32, u32)];

enum Emit {
    /// `<prefix><property>: <value>`
    Prefix(&'static str),
    /// `<property>: <replacement value>`
    Value(&'static str),
    /// A renamed property with a value mapping, the 2012 IE flexbox syntax.
    Renamed(&'static str, fn(&str) -> Option<String>),
}

struct Rule {
    property: &'static str,
    value: Option<&'static str>,
    emit: Emit,
    needs: Needs,
}

use Browser::*;

const FLEX_OLD: Needs = &[(Safari, 6, 1), (Ios, 7, 0), (Android, 4, 4), (Chrome, 21, 0)];
const FLEX_WEBKIT: Needs = &[
    (Safari, 9, 0),
    (Ios, 9, 0),
    (Chrome, 29, 0),
    (Opera, 17, 0),
    (BlackBerry, 11, 0),
];
const FLEX_MS: Needs = &[(Ie, 11, 0), (IeMobile, 11, 0)];
const TRANSFORM_WEBKIT: Needs = &[
    (Safari, 9, 0),
    (Ios, 9, 0),
    (Android, 5, 0),
    (Chrome, 36, 0),
    (Opera, 23, 0),
    (BlackBerry, 11, 0),
];
const TRANSFORM_MS: Needs = &[(Ie, 10, 0)];
const TRANSITION_WEBKIT: Needs = &[
    (Safari, 6, 1),
    (Ios, 7, 0),
    (Android, 4, 4),
    (Chrome, 26, 0),
    (Opera, 15, 0),
    (BlackBerry, 10, 0),
];
const ANIMATION_WEBKIT: Needs = &[
    (Chrome, 43, 0),
    (Safari, 9, 0),
    (Ios, 9, 0),
    (Android, 5, 0),
    (Opera, 30, 0),
    (BlackBerry, 11, 0),
];
const USER_SELECT_WEBKIT: Needs = &[
    (Chrome, 54, 0),
    (Safari, 999, 0),
    (Ios, 999, 0),
    (Android, 999, 0),
    (Opera, 41, 0),
    (BlackBerry, 999, 0),
];
const USER_SELECT_MOZ: Needs = &[(Firefox, 69, 0)];
const MS_ALWAYS: Needs = &[(Ie, 999, 0), (IeMobile, 999, 0), (Edge, 79, 0)];
const APPEARANCE_WEBKIT: Needs = &[
    (Chrome, 84, 0),
    (Safari, 15, 4),
    (Ios, 15, 4),
    (Android, 999, 0),
    (Opera, 70, 0),
    (BlackBerry, 999, 0),
];
const APPEARANCE_MOZ: Needs = &[(Firefox, 80, 0)];
const BACKFACE_WEBKIT: Needs = &[
    (Chrome, 36, 0),
    (Safari, 15, 4),
    (Ios, 15, 4),
    (Android, 5, 0),
    (Opera, 23, 0),
    (BlackBerry, 999, 0),
];
const HYPHENS_WEBKIT: Needs = &[(Safari, 17, 0), (Ios, 17, 0)];
const HYPHENS_MOZ: Needs = &[(Firefox, 43, 0)];
const COLUMNS_WEBKIT: Needs = &[
    (Chrome, 50, 0),
    (Safari, 9, 0),
    (Ios, 9, 0),
    (Android, 5, 0),
    (Opera, 37, 0),
    (BlackBerry, 999, 0),
];
const COLUMNS_MOZ: Needs = &[(Firefox, 52, 0)];
const FILTER_WEBKIT: Needs = &[
    (Chrome, 53, 0),
    (Safari, 9, 1),
    (Ios, 9, 3),
    (Android, 5, 0),
    (Opera, 40, 0),
    (BlackBerry, 999, 0),
];
const TEXT_SIZE_WEBKIT: Needs = &[(Ios, 999, 0)];
const TEXT_SIZE_MS: Needs = &[(IeMobile, 999, 0)];
const STICKY_WEBKIT: Needs = &[(Safari, 13, 0), (Ios, 13, 0)];

fn same(value: &str) -> Option<String> {
    Some(value.to_string())
}

fn pack(value: &str) -> Option<String> {
    Some(
        match value {
            "flex-start" | "start" => "start",
            "flex-end" | "end" => "end",
            "center" => "center",
            "space-between" => "justify",
            "space-around" => "distribute",
            _ => return None,
        }
        .to_string(),
    )
}

fn align(value: &str) -> Option<String> {
    Some(
        match value {
            "flex-start" | "start" => "start",
            "flex-end" | "end" => "end",
            "center" | "baseline" | "stretch" => value,
            _ => return None,
        }
        .to_string(),
    )
}

fn item_align(value: &str) -> Option<String> {
    match value {
        "auto" => Some("auto".to_string()),
        _ => align(value),
    }
}

fn line_pack(value: &str) -> Option<String> {
    match value {
        "stretch" => Some("stretch".to_string()),
        _ => pack(value),
    }
}

macro_rules! rule {
    ($property:literal, $emit:expr, $needs:expr) => {
        Rule {
            property: $property,
            value: None,
            emit: $emit,
            needs: $needs,
        }
    };
    ($property:literal = $value:literal, $emit:expr, $needs:expr) => {
        Rule {
            property: $property,
            value: Some($value),
            emit: $emit,
            needs: $needs,
        }
    };
}

static RULES: &[Rule] = &[
    rule!("display" = "flex", Emit::Value("-webkit-box"), FLEX_OLD),
    rule!("display" = "flex", Emit::Value("-webkit-flex"), FLEX_WEBKIT),
    rule!("display" = "flex", Emit::Value("-ms-flexbox"), FLEX_MS),
    rule!("display" = "inline-flex", Emit::Value("-webkit-inline-box"), FLEX_OLD),
    rule!("display" = "inline-flex", Emit::Value("-webkit-inline-flex"), FLEX_WEBKIT),
    rule!("display" = "inline-flex", Emit::Value("-ms-inline-flexbox"), FLEX_MS),
    rule!("flex-direction", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("flex-direction", Emit::Renamed("-ms-flex-direction", same), FLEX_MS),
    rule!("flex-wrap", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("flex-wrap", Emit::Renamed("-ms-flex-wrap", same), FLEX_MS),
    rule!("flex-flow", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("flex-flow", Emit::Renamed("-ms-flex-flow", same), FLEX_MS),
    rule!("flex", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("flex", Emit::Renamed("-ms-flex", same), FLEX_MS),
    rule!("flex-grow", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("flex-grow", Emit::Renamed("-ms-flex-positive", same), FLEX_MS),
    rule!("flex-shrink", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("flex-shrink", Emit::Renamed("-ms-flex-negative", same), FLEX_MS),
    rule!("flex-basis", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("flex-basis", Emit::Renamed("-ms-flex-preferred-size", same), FLEX_MS),
    rule!("order", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("order", Emit::Renamed("-ms-flex-order", same), FLEX_MS),
    rule!("justify-content", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("justify-content", Emit::Renamed("-ms-flex-pack", pack), FLEX_MS),
    rule!("align-items", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("align-items", Emit::Renamed("-ms-flex-align", align), FLEX_MS),
    rule!("align-self", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("align-self", Emit::Renamed("-ms-flex-item-align", item_align), FLEX_MS),
    rule!("align-content", Emit::Prefix("-webkit-"), FLEX_WEBKIT),
    rule!("align-content", Emit::Renamed("-ms-flex-line-pack", line_pack), FLEX_MS),
    rule!("transform", Emit::Prefix("-webkit-"), TRANSFORM_WEBKIT),
    rule!("transform", Emit::Prefix("-ms-"), TRANSFORM_MS),
    rule!("transform-origin", Emit::Prefix("-webkit-"), TRANSFORM_WEBKIT),
    rule!("transform-origin", Emit::Prefix("-ms-"), TRANSFORM_MS),
    rule!("transition", Emit::Prefix("-webkit-"), TRANSITION_WEBKIT),
    rule!("transition-property", Emit::Prefix("-webkit-"), TRANSITION_WEBKIT),
    rule!("transition-duration", Emit::Prefix("-webkit-"), TRANSITION_WEBKIT),
    rule!("transition-delay", Emit::Prefix("-webkit-"), TRANSITION_WEBKIT),
    rule!("transition-timing-function", Emit::Prefix("-webkit-"), TRANSITION_WEBKIT),
    rule!("animation", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("animation-name", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("animation-duration", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("animation-delay", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("animation-direction", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("animation-fill-mode", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("animation-iteration-count", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("animation-timing-function", Emit::Prefix("-webkit-"), ANIMATION_WEBKIT),
    rule!("user-select", Emit::Prefix("-webkit-"), USER_SELECT_WEBKIT),
    rule!("user-select", Emit::Prefix("-moz-"), USER_SELECT_MOZ),
    rule!("user-select", Emit::Prefix("-ms-"), MS_ALWAYS),
    rule!("appearance", Emit::Prefix("-webkit-"), APPEARANCE_WEBKIT),
    rule!("appearance", Emit::Prefix("-moz-"), APPEARANCE_MOZ),
    rule!("backface-visibility", Emit::Prefix("-webkit-"), BACKFACE_WEBKIT),
    rule!("hyphens", Emit::Prefix("-webkit-"), HYPHENS_WEBKIT),
    rule!("hyphens", Emit::Prefix("-moz-"), HYPHENS_MOZ),
    rule!("hyphens", Emit::Prefix("-ms-"), MS_ALWAYS),
    rule!("columns", Emit::Prefix("-webkit-"), COLUMNS_WEBKIT),
    rule!("columns", Emit::Prefix("-moz-"), COLUMNS_MOZ),
    rule!("column-count", Emit::Prefix("-webkit-"), COLUMNS_WEBKIT),
    rule!("column-count", Emit::Prefix("-moz-"), COLUMNS_MOZ),
    rule!("column-gap", Emit::Prefix("-webkit-"), COLUMNS_WEBKIT),
    rule!("column-gap", Emit::Prefix("-moz-"), COLUMNS_MOZ),
    rule!("column-rule", Emit::Prefix("-webkit-"), COLUMNS_WEBKIT),
    rule!("column-rule", Emit::Prefix("-moz-"), COLUMNS_MOZ),
    rule!("column-width", Emit::Prefix("-webkit-"), COLUMNS_WEBKIT),
    rule!("column-width", Emit::Prefix("-moz-"), COLUMNS_MOZ),
    rule!("filter", Emit::Prefix("-webkit-"), FILTER_WEBKIT),
    rule!("text-size-adjust", Emit::Prefix("-webkit-"), TEXT_SIZE_WEBKIT),
    rule!("text-size-adjust", Emit::Prefix("-ms-"), TEXT_SIZE_MS),
    rule!("position" = "sticky", Emit::Value("-webkit-sticky"), STICKY_WEBKIT),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoprefixOptions {
    pub browsers: Vec<String>,
}

pub struct Autoprefix {
    targets: Vec<Target>,
}

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)([-A-Za-z]+)\s*:\s*(.*?)\s*;?\s*$").expect("valid regex")
});

static TRANSFORM_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[\s,])transform\b").expect("valid regex"));

struct Declaration<'a> {
    indent: &'a str,
    property: String,
    /// Value without `!important`.
    value: &'a str,
    important: bool,
}

fn declaration(line: &str) -> Option<Declaration<'_>> {
    let caps = DECLARATION.captures(line)?;
    let indent = caps.get(1)?.as_str();
    let raw = caps.get(3)?.as_str();

    let (value, important) = match raw.strip_suffix("!important") {
        Some(value) => (value.trim_end(), true),
        None => (raw, false),
    };

    Some(Declaration {
        indent,
        property: caps[2].to_ascii_lowercase(),
        value,
        important,
    })
}

/// A piece of a line inside a block, delimited by braces or `;`.
struct Slot {
    line: usize,
    start: usize,
    end: usize,
    block: usize,
    /// The only piece on a line without braces.
    whole_line: bool,
}

/// Split the lines into declaration slots. Strings, comments and
/// parentheses (`url(data:...;base64,...)`) never delimit.
fn slots(lines: &[&str]) -> Vec<Slot> {
    let mut slots = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut next = 0;
    let mut comment = false;
    let mut quote: Option<u8> = None;
    let mut parens = 0usize;

    for (n, line) in lines.iter().enumerate() {
        let bytes = line.as_bytes();
        let first = slots.len();
        let mut braces = false;
        let mut start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            if comment {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    comment = false;
                    i += 1;
                }
            } else if let Some(q) = quote {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            } else {
                match b {
                    b'/' if bytes.get(i + 1) == Some(&b'*') => {
                        comment = true;
                        i += 1;
                    }
                    b'"' | b'\'' => quote = Some(b),
                    b'(' => parens += 1,
                    b')' => parens = parens.saturating_sub(1),
                    b'{' if parens == 0 => {
                        next += 1;
                        stack.push(next);
                        braces = true;
                        start = i + 1;
                    }
                    b'}' if parens == 0 => {
                        if let Some(&block) = stack.last() {
                            slots.push(Slot { line: n, start, end: i, block, whole_line: false });
                        }
                        stack.pop();
                        braces = true;
                        start = i + 1;
                    }
                    b';' if parens == 0 => {
                        if let Some(&block) = stack.last() {
                            slots.push(Slot { line: n, start, end: i + 1, block, whole_line: false });
                        }
                        start = i + 1;
                    }
                    _ => {}
                }
            }
            i += 1;
        }

        // a declaration without `;` before a `}` on a later line
        if !braces
            && let Some(&block) = stack.last()
            && !line[start..].trim().is_empty()
        {
            slots.push(Slot { line: n, start, end: bytes.len(), block, whole_line: false });
        }

        if !braces && slots.len() == first + 1 {
            slots[first].whole_line = true;
        }
    }

    slots
}

impl Autoprefix {
    pub fn new(options: AutoprefixOptions) -> Result<Self, ConfigError> {
        let targets = options
            .browsers
            .iter()
            .map(|q| Target::parse(q))
            .collect::<Result<_, _>>()?;

        Ok(Self { targets })
    }

    fn needed(&self, needs: Needs) -> bool {
        self.targets.iter().any(|t| {
            needs
                .iter()
                .any(|&(b, major, minor)| b == t.browser && t.oldest < Version(major, minor))
        })
    }

    /// Insert prefixed declarations, returning the new text and the
    /// position of every output line in the input.
    pub fn prefix(&self, css: &str) -> (String, PositionMap) {
        let lines: Vec<&str> = css.split('\n').collect();
        let slots = slots(&lines);

        // what each block already declares
        let mut declared: HashSet<(usize, String, String)> = HashSet::new();
        for slot in &slots {
            if let Some(decl) = declaration(&lines[slot.line][slot.start..slot.end]) {
                declared.insert((slot.block, decl.property.clone(), decl.value.to_ascii_lowercase()));
                declared.insert((slot.block, decl.property, String::new()));
            }
        }

        let mut out = String::with_capacity(css.len());
        let mut positions = PositionMap::new();
        let mut first = true;
        let mut emit = |text: &str, source: usize| {
            if !first {
                out.push('\n');
                positions.newline();
            }
            first = false;
            positions.mark(0, source as u32, 0);
            out.push_str(text);
        };

        let mut slots = slots.iter().peekable();
        for (i, line) in lines.iter().enumerate() {
            let mut inline: Option<(String, usize)> = None;

            while let Some(slot) = slots.next_if(|s| s.line == i) {
                let Some(decl) = declaration(&line[slot.start..slot.end]) else {
                    continue;
                };

                let important = if decl.important { " !important" } else { "" };
                let added: Vec<String> = self
                    .expand(&decl)
                    .into_iter()
                    .filter(|(property, value)| {
                        !(declared.contains(&(slot.block, property.clone(), String::new()))
                            && (decl.property != *property
                                || declared.contains(&(
                                    slot.block,
                                    property.clone(),
                                    value.to_ascii_lowercase(),
                                ))))
                    })
                    .map(|(property, value)| format!("{property}: {value}{important};"))
                    .collect();

                if added.is_empty() {
                    continue;
                }
                if slot.whole_line {
                    for text in &added {
                        emit(&format!("{}{text}", decl.indent), i);
                    }
                } else {
                    let (text, copied) = inline.get_or_insert_with(|| (String::new(), 0));
                    let at = slot.start + decl.indent.len();
                    text.push_str(&line[*copied..at]);
                    for decl in &added {
                        text.push_str(decl);
                        text.push(' ');
                    }
                    *copied = at;
                }
            }

            match inline {
                Some((mut text, copied)) => {
                    text.push_str(&line[copied..]);
                    emit(&text, i);
                }
                None => emit(line, i),
            }
        }

        (out, positions)
    }

    fn expand(&self, decl: &Declaration<'_>) -> Vec<(String, String)> {
        let value = decl.value.to_ascii_lowercase();

        RULES
            .iter()
            .filter(|r| r.property == decl.property)
            .filter(|r| r.value.is_none_or(|v| v == value))
            .filter(|r| self.needed(r.needs))
            .filter_map(|r| match r.emit {
                Emit::Prefix(prefix) => {
                    let value = if decl.property.starts_with("transition") && prefix == "-webkit-" {
                        TRANSFORM_WORD
                            .replace_all(decl.value, "${1}-webkit-transform")
                            .into_owned()
                    } else {
                        decl.value.to_string()
                    };
                    Some((format!("{prefix}{}", decl.property), value))
                }
                Emit::Value(replacement) => {
                    Some((decl.property.clone(), replacement.to_string()))
                }
                Emit::Renamed(property, map) => map(&value).map(|v| (property.to_string(), v)),
            })
            .collect()
    }
}

impl FileTransform for Autoprefix {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, _: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        let (css, positions) = self.prefix(file.text(NAME)?);
        file.replace(css, Some(positions));
        Ok(Some(file))
    }
}
