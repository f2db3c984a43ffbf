//! Source map accumulation.
//!
//! A [`SourceMap`] maps positions in the current contents of a file back to
//! positions in the original sources. It starts as an identity map when the
//! pipeline begins mapping, and every transform that rewrites the contents
//! hands over a [`PositionMap`] describing where each output position came
//! from *in its own input*. Composing the two keeps the map pointing at the
//! original sources no matter how many steps ran in between.
//!
//! Only the line/column part of the Source Map v3 format is produced, there
//! are no symbol names.

use serde::Serialize;

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// A single mapping from a generated column to an original position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// 0-based column in the generated line.
    pub column: u32,
    /// Index into [`SourceMap::sources`].
    pub source: u32,
    /// 0-based line in the original source.
    pub src_line: u32,
    /// 0-based column in the original source.
    pub src_column: u32,
}

/// Where each position of a transform's output came from in its input.
///
/// Lines are generated lines, each holding `(generated column, input line,
/// input column)` triples sorted by generated column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionMap {
    lines: Vec<Vec<(u32, u32, u32)>>,
}

impl PositionMap {
    pub fn new() -> Self {
        Self { lines: vec![vec![]] }
    }

    /// Each output line maps to the same line of the input.
    pub fn identity(output: &str) -> Self {
        Self {
            lines: (0..line_count(output)).map(|i| vec![(0, i, 0)]).collect(),
        }
    }

    /// Used when a transform can't tell where its output came from: every
    /// output line points at the start of the input.
    pub fn coarse(output: &str) -> Self {
        Self {
            lines: (0..line_count(output)).map(|_| vec![(0, 0, 0)]).collect(),
        }
    }

    /// Record that the output at `column` of the current line came from the
    /// given input position.
    pub fn mark(&mut self, column: u32, line: u32, src_column: u32) {
        match self.lines.last_mut() {
            Some(current) if current.last().is_some_and(|&(c, _, _)| c == column) => {}
            Some(current) => current.push((column, line, src_column)),
            None => self.lines.push(vec![(column, line, src_column)]),
        }
    }

    /// Start a new generated line.
    pub fn newline(&mut self) {
        self.lines.push(vec![]);
    }

    pub fn lines(&self) -> usize {
        self.lines.len()
    }
}

/// An accumulated source map for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMap {
    /// Original source paths.
    pub sources: Vec<String>,
    /// Original source contents, inlined into the written map.
    pub contents: Vec<Option<String>>,
    lines: Vec<Vec<Segment>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap<'a> {
    version: u8,
    file: &'a str,
    sources: &'a [String],
    sources_content: &'a [Option<String>],
    names: [&'a str; 0],
    mappings: String,
}

impl SourceMap {
    /// A map where every line of `text` points at itself in `source`.
    pub fn identity(source: impl Into<String>, text: &str) -> Self {
        let lines = (0..line_count(text))
            .map(|line| {
                vec![Segment {
                    column: 0,
                    source: 0,
                    src_line: line,
                    src_column: 0,
                }]
            })
            .collect();

        Self {
            sources: vec![source.into()],
            contents: vec![Some(text.to_string())],
            lines,
        }
    }

    /// Number of generated lines covered by the map.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Find the original position of a generated position: the segment with
    /// the greatest column not after `column`, falling back to the first
    /// segment of the line.
    pub fn lookup(&self, line: u32, column: u32) -> Option<Segment> {
        let segments = self.lines.get(line as usize)?;
        segments
            .iter()
            .rev()
            .find(|s| s.column <= column)
            .or_else(|| segments.first())
            .copied()
    }

    /// Compose this map with the positions reported by a transform that
    /// rewrote the contents it describes.
    pub fn apply(&self, positions: &PositionMap) -> SourceMap {
        let lines = positions
            .lines
            .iter()
            .map(|marks| {
                let mut out: Vec<Segment> = Vec::with_capacity(marks.len());
                for &(column, line, src_column) in marks {
                    if let Some(seg) = self.lookup(line, src_column) {
                        out.push(Segment { column, ..seg });
                    }
                }
                out
            })
            .collect();

        SourceMap {
            sources: self.sources.clone(),
            contents: self.contents.clone(),
            lines,
        }
    }

    /// Append another map below this one, shifted down by `line_offset`
    /// generated lines. Used when files are concatenated.
    pub fn append(&mut self, other: &SourceMap, line_offset: usize) {
        let remap: Vec<u32> = other
            .sources
            .iter()
            .zip(&other.contents)
            .map(|(source, content)| {
                let index = match self.sources.iter().position(|s| s == source) {
                    Some(index) => index,
                    None => {
                        self.sources.push(source.clone());
                        self.contents.push(content.clone());
                        self.sources.len() - 1
                    }
                };
                index as u32
            })
            .collect();

        if self.lines.len() < line_offset {
            self.lines.resize_with(line_offset, Vec::new);
        }
        self.lines.truncate(line_offset);

        for segments in &other.lines {
            self.lines.push(
                segments
                    .iter()
                    .map(|s| Segment {
                        source: remap[s.source as usize],
                        ..*s
                    })
                    .collect(),
            );
        }
    }

    /// Encode the `mappings` field.
    pub fn mappings(&self) -> String {
        let mut out = String::new();
        let (mut source, mut src_line, mut src_column) = (0i64, 0i64, 0i64);

        for (i, segments) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }

            let mut column = 0i64;
            for (j, seg) in segments.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                encode_vlq(&mut out, seg.column as i64 - column);
                encode_vlq(&mut out, seg.source as i64 - source);
                encode_vlq(&mut out, seg.src_line as i64 - src_line);
                encode_vlq(&mut out, seg.src_column as i64 - src_column);

                column = seg.column as i64;
                source = seg.source as i64;
                src_line = seg.src_line as i64;
                src_column = seg.src_column as i64;
            }
        }

        out
    }

    /// Serialize as a Source Map v3 JSON document for the generated `file`.
    pub fn to_json(&self, file: &str) -> serde_json::Result<String> {
        serde_json::to_string(&RawSourceMap {
            version: 3,
            file,
            sources: &self.sources,
            sources_content: &self.contents,
            names: [],
            mappings: self.mappings(),
        })
    }
}

/// Number of lines in `text`, a trailing newline opens one more (empty) line.
pub(crate) fn line_count(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32 + 1
}

fn encode_vlq(out: &mut String, value: i64) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };

    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlq_known_values() {
        let cases = [(0, "A"), (1, "C"), (-1, "D"), (15, "e"), (16, "gB"), (-16, "hB")];
        for (value, expected) in cases {
            let mut out = String::new();
            encode_vlq(&mut out, value);
            assert_eq!(out, expected, "value {value}");
        }
    }

    #[test]
    fn identity_mappings() {
        let map = SourceMap::identity("a.css", "a\nb\nc");
        assert_eq!(map.mappings(), "AAAA;AACA;AACA");
    }

    #[test]
    fn composition_points_at_original_lines() {
        // original: 3 lines, step 1 duplicates line 1, step 2 joins everything
        let original = SourceMap::identity("a.css", "x\ny\nz");

        let mut dup = PositionMap::new();
        dup.mark(0, 0, 0);
        dup.newline();
        dup.mark(0, 1, 0);
        dup.newline();
        dup.mark(0, 1, 0);
        dup.newline();
        dup.mark(0, 2, 0);
        let after_dup = original.apply(&dup);
        assert_eq!(after_dup.line_count(), 4);

        let mut join = PositionMap::new();
        for (i, line) in [0u32, 1, 2, 3].into_iter().enumerate() {
            join.mark(i as u32 * 2, line, 0);
        }
        let joined = after_dup.apply(&join);

        assert_eq!(joined.line_count(), 1);
        let lines: Vec<_> = (0..4).map(|i| joined.lookup(0, i * 2).unwrap().src_line).collect();
        assert_eq!(lines, vec![0, 1, 1, 2]);
        assert_eq!(joined.sources, vec!["a.css".to_string()]);
    }

    #[test]
    fn append_offsets_and_merges_sources() {
        let mut a = SourceMap::identity("a.js", "1\n2");
        let b = SourceMap::identity("b.js", "3");
        a.append(&b, 2);

        assert_eq!(a.sources, vec!["a.js".to_string(), "b.js".to_string()]);
        let seg = a.lookup(2, 0).unwrap();
        assert_eq!((seg.source, seg.src_line), (1, 0));
    }

    #[test]
    fn json_references_sources() {
        let map = SourceMap::identity("app/styles/main.scss", "a{}");
        let json = map.to_json("main.css").unwrap();
        assert!(json.contains(r#""version":3"#));
        assert!(json.contains(r#""file":"main.css""#));
        assert!(json.contains(r#""sources":["app/styles/main.scss"]"#));
        assert!(json.contains(r#""sourcesContent":["a{}"]"#));
    }
}
