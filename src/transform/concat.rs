use serde::Deserialize;

use crate::error::TransformError;
use crate::file::{File, FileSet};
use crate::sourcemap::SourceMap;

use super::{SetTransform, StepContext};

pub(super) const NAME: &str = "concat";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcatOptions {
    /// Name of the combined file.
    pub file: String,
    pub separator: String,
}

impl Default for ConcatOptions {
    fn default() -> Self {
        Self {
            file: "bundle.js".into(),
            separator: "\n".into(),
        }
    }
}

/// Joins every file of the set into one, in stream order.
pub struct Concat {
    options: ConcatOptions,
}

impl Concat {
    pub fn new(options: ConcatOptions) -> Self {
        Self { options }
    }
}

impl SetTransform for Concat {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, _: &StepContext<'_>, files: FileSet) -> Result<FileSet, TransformError> {
        let mut files = files.into_iter();
        let Some(first) = files.next() else {
            return Ok(FileSet::new());
        };

        let mapped = first.map.is_some();
        let mut contents = first.contents;
        let mut map = first.map;

        for file in files {
            contents.extend_from_slice(self.options.separator.as_bytes());

            if mapped {
                let offset = contents.iter().filter(|&&b| b == b'\n').count();
                let text = String::from_utf8_lossy(&file.contents);
                let other = file
                    .map
                    .unwrap_or_else(|| SourceMap::identity(file.relative.as_str(), &text));
                if let Some(map) = &mut map {
                    map.append(&other, offset);
                }
            }

            contents.extend_from_slice(&file.contents);
        }

        let mut out = File::new(first.base, self.options.file.as_str(), contents);
        out.map = map;

        Ok(FileSet::from(vec![out]))
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::core::{Environment, Mode};

    fn concat(files: Vec<File>) -> FileSet {
        let env = Environment::new("/p", Mode::Build);
        let concat = Concat::new(ConcatOptions {
            file: "main.min.js".into(),
            ..Default::default()
        });
        concat
            .transform(&StepContext { env: &env }, FileSet::from(files))
            .unwrap()
    }

    #[test]
    fn joins_in_order() {
        let out = concat(vec![
            File::new("/p/app/scripts", "a.js", "var a = 1;"),
            File::new("/p/app/scripts", "b.js", "var b = 2;"),
        ]);
        assert_eq!(out.len(), 1);

        let file = out.iter().next().unwrap();
        assert_eq!(file.relative, "main.min.js");
        assert_eq!(file.base, "/p/app/scripts");
        assert_eq!(file.contents, b"var a = 1;\nvar b = 2;");
    }

    #[test]
    fn empty_set_produces_nothing() {
        assert!(concat(vec![]).is_empty());
    }

    #[test]
    fn maps_cover_every_source() {
        let root = Utf8Path::new("/p");
        let mut a = File::new("/p/app/scripts", "a.js", "one();\ntwo();\n");
        let mut b = File::new("/p/app/scripts", "b.js", "three();");
        a.begin_map(root);
        b.begin_map(root);

        let out = concat(vec![a, b]);
        let map = out.iter().next().unwrap().map.clone().unwrap();

        assert_eq!(
            map.sources,
            vec!["app/scripts/a.js".to_string(), "app/scripts/b.js".to_string()]
        );
        // "one();\ntwo();\n" + "\n" puts b.js on line 3
        let seg = map.lookup(3, 0).unwrap();
        assert_eq!((seg.source, seg.src_line), (1, 0));
        assert_eq!(map.lookup(1, 0).unwrap().src_line, 1);
    }
}
