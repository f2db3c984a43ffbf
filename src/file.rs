use camino::{Utf8Path, Utf8PathBuf};

use crate::error::TransformError;
use crate::sourcemap::{PositionMap, SourceMap};

/// A file flowing through a pipeline.
///
/// `base` is the static part of the glob that matched it and `relative` is
/// the rest, which is also where the file lands under the destination.
#[derive(Debug, Clone)]
pub struct File {
    pub base: Utf8PathBuf,
    pub relative: Utf8PathBuf,
    pub contents: Vec<u8>,
    /// Accumulated source map, present between `MapsInit` and `MapsWrite`.
    pub map: Option<SourceMap>,
}

impl File {
    pub fn new(
        base: impl Into<Utf8PathBuf>,
        relative: impl Into<Utf8PathBuf>,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            base: base.into(),
            relative: relative.into(),
            contents: contents.into(),
            map: None,
        }
    }

    /// Full path of the file as it was read (or would be, after renames).
    pub fn path(&self) -> Utf8PathBuf {
        self.base.join(&self.relative)
    }

    pub fn name(&self) -> &str {
        self.relative.file_name().unwrap_or(self.relative.as_str())
    }

    pub fn extension(&self) -> Option<&str> {
        self.relative.extension()
    }

    pub fn set_extension(&mut self, extension: &str) {
        self.relative.set_extension(extension);
    }

    /// Borrow the contents as UTF-8, failing on behalf of `transform`.
    pub fn text(&self, transform: &str) -> Result<&str, TransformError> {
        std::str::from_utf8(&self.contents).map_err(|e| {
            TransformError::new(transform, self.path(), format!("file is not UTF-8: {e}"))
        })
    }

    /// Replace the contents. If a source map is being accumulated it is
    /// composed with `positions`, or with a coarse map when the transform
    /// could not report positions.
    pub fn replace(&mut self, contents: impl Into<Vec<u8>>, positions: Option<PositionMap>) {
        let contents = contents.into();

        if let Some(map) = &self.map {
            let positions = positions.unwrap_or_else(|| {
                PositionMap::coarse(&String::from_utf8_lossy(&contents))
            });
            self.map = Some(map.apply(&positions));
        }

        self.contents = contents;
    }

    /// Start accumulating a source map, naming the source relative to `root`.
    pub fn begin_map(&mut self, root: &Utf8Path) {
        let path = self.path();
        let source = path.strip_prefix(root).unwrap_or(&path);
        let text = String::from_utf8_lossy(&self.contents);
        self.map = Some(SourceMap::identity(source.as_str(), &text));
    }
}

/// An ordered collection of files.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    files: Vec<File>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, file: File) {
        self.files.push(file);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, File> {
        self.files.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, File> {
        self.files.iter_mut()
    }

    /// Sum of the contents sizes.
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.contents.len() as u64).sum()
    }

    pub fn into_vec(self) -> Vec<File> {
        self.files
    }
}

impl From<Vec<File>> for FileSet {
    fn from(files: Vec<File>) -> Self {
        Self { files }
    }
}

impl FromIterator<File> for FileSet {
    fn from_iter<I: IntoIterator<Item = File>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FileSet {
    type Item = File;
    type IntoIter = std::vec::IntoIter<File>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a File;
    type IntoIter = std::slice::Iter<'a, File>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_without_map_keeps_map_absent() {
        let mut file = File::new("/p/app", "a.css", "a { }");
        file.replace("a{}", None);
        assert!(file.map.is_none());
        assert_eq!(file.contents, b"a{}");
    }

    #[test]
    fn replace_composes_map() {
        let mut file = File::new("/p/app/styles", "main.scss", "a {\n  b: c;\n}\n");
        file.begin_map(Utf8Path::new("/p"));
        file.replace("a{b:c}", None);

        let map = file.map.unwrap();
        assert_eq!(map.sources, vec!["app/styles/main.scss".to_string()]);
        assert_eq!(map.line_count(), 1);
    }

    #[test]
    fn non_utf8_is_a_transform_error() {
        let file = File::new("/p", "x.css", vec![0xff, 0xfe]);
        let err = file.text("minify-css").unwrap_err();
        assert_eq!(err.transform, "minify-css");
        assert_eq!(err.path, Utf8PathBuf::from("/p/x.css"));
    }
}
