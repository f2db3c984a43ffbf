use std::fs;
use std::io::{self, ErrorKind};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Environment;
use crate::error::{BuildError, ConfigError};
use crate::source::Source;

/// Delete everything matched by `source`, files and whole directories.
///
/// Negated patterns protect the entries they match, e.g. `!build/.git`.
/// Nothing outside the project root is ever removed. Deleting what is
/// already gone is not an error, so cleaning twice in a row succeeds.
///
/// Returns the number of removed entries.
pub fn clean(env: &Environment, source: &Source) -> Result<usize, BuildError> {
    let root = canonical(&env.root)?;
    let mut removed: Vec<Utf8PathBuf> = Vec::new();

    for path in source.entries(&env.root)? {
        // parents sort first, their contents are already gone
        if removed.iter().any(|r| path.starts_with(r)) {
            continue;
        }

        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let full = location(&path, &meta)?;
        if full == root || !full.starts_with(&root) {
            return Err(ConfigError::CleanOutsideRoot(path).into());
        }

        // a link to a directory is removed as a file, its target stays
        let result = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };

        match result {
            Ok(()) => {
                tracing::debug!("removed {path}");
                removed.push(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(removed.len())
}

fn canonical(path: &Utf8Path) -> Result<Utf8PathBuf, BuildError> {
    Ok(path.canonicalize_utf8()?)
}

/// Where the entry itself lives, symlinks are not followed.
fn location(path: &Utf8Path, meta: &fs::Metadata) -> io::Result<Utf8PathBuf> {
    if !meta.file_type().is_symlink() {
        return path.canonicalize_utf8();
    }

    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_str().is_empty() { Utf8Path::new(".") } else { parent };
            Ok(parent.canonicalize_utf8()?.join(name))
        }
        _ => path.canonicalize_utf8(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Mode;

    fn project() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        for path in [
            ".tmp/styles/main.css",
            "build/index.html",
            "build/scripts/main.min.js",
            "build/.git/HEAD",
            "build/.htaccess",
            "app/index.html",
        ] {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }
        (dir, Environment::new(root, Mode::Build))
    }

    fn standard() -> Source {
        Source::new([".tmp", "build/*", "!build/.git"]).dot(true)
    }

    #[test]
    fn removes_output_but_keeps_protected_entries() {
        let (_dir, env) = project();
        let removed = clean(&env, &standard()).unwrap();

        assert_eq!(removed, 4);
        assert!(!env.root.join(".tmp").exists());
        assert!(!env.root.join("build/index.html").exists());
        assert!(!env.root.join("build/scripts").exists());
        assert!(!env.root.join("build/.htaccess").exists());
        assert!(env.root.join("build/.git/HEAD").is_file());
        assert!(env.root.join("app/index.html").is_file());
    }

    #[test]
    fn cleaning_twice_is_fine() {
        let (_dir, env) = project();
        clean(&env, &standard()).unwrap();
        assert_eq!(clean(&env, &standard()).unwrap(), 0);
    }

    #[test]
    fn missing_directories_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let env = Environment::new(root, Mode::Build);
        assert_eq!(clean(&env, &standard()).unwrap(), 0);
    }

    #[test]
    fn refuses_to_leave_the_root() {
        let (_dir, env) = project();
        let inner = Environment::new(env.root.join("app"), Mode::Build);

        let err = clean(&inner, &Source::new(["../build"])).unwrap_err();
        assert!(matches!(err, BuildError::Config(ConfigError::CleanOutsideRoot(_))));
        assert!(env.root.join("build/index.html").exists());
    }

    #[cfg(unix)]
    #[test]
    fn links_to_outside_the_root_are_unlinked() {
        let (_dir, env) = project();
        let outside = tempfile::tempdir().unwrap();
        let target = Utf8PathBuf::try_from(outside.path().to_path_buf()).unwrap();
        fs::write(target.join("keep.txt"), "x").unwrap();

        let link = env.root.join("build/shared");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        clean(&env, &standard()).unwrap();

        assert!(fs::symlink_metadata(&link).is_err());
        assert!(target.join("keep.txt").is_file());
        assert!(env.root.join("build/.git/HEAD").is_file());
    }
}
