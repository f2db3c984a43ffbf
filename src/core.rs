use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

/// A 32-byte BLAKE3 hash used for content addressing.
///
/// The image optimizer keys its on-disk cache by the hash of the source path
/// and the source bytes, so an unchanged file never gets re-encoded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Hash several buffers as one stream, each prefixed with its length so
    /// that `("ab", "c")` and `("a", "bc")` differ.
    pub(crate) fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The mode in which the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A one-time build. Any failed file fails its task and the process.
    Build,
    /// A continuous watch session. Failures are reported and the session
    /// keeps running.
    Watch,
}

/// Per-path write locks for the destination tree.
///
/// Tasks running in the same parallel stage share the destination directory,
/// two writers targeting the same file are serialized here.
#[derive(Default)]
pub(crate) struct WriteLocks {
    locks: Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>,
}

impl WriteLocks {
    pub(crate) fn get(&self, path: &Utf8Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }
}

/// Global state available to every task and transform.
#[derive(Clone)]
pub struct Environment {
    /// Project root, every glob and destination is resolved against it.
    pub root: Utf8PathBuf,
    /// The current run mode.
    pub mode: Mode,
    /// Port of the live-reload WebSocket server (if running).
    pub reload_port: Option<u16>,
    /// Directory for persistent caches, relative to `root`.
    pub cache: Utf8PathBuf,
    pub(crate) writes: Arc<WriteLocks>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .field("reload_port", &self.reload_port)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Environment {
    pub fn new(root: impl Into<Utf8PathBuf>, mode: Mode) -> Self {
        Self {
            root: root.into(),
            mode,
            reload_port: None,
            cache: Utf8PathBuf::from(".cache"),
            writes: Arc::default(),
        }
    }

    pub fn with_cache(mut self, cache: impl Into<Utf8PathBuf>) -> Self {
        self.cache = cache.into();
        self
    }

    pub fn with_reload_port(mut self, port: u16) -> Self {
        self.reload_port = Some(port);
        self
    }

    /// Resolve a project-relative path against the root.
    pub fn resolve(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Returns a JavaScript snippet that reloads the page on a `"reload"`
    /// message, or `None` outside of watch mode.
    pub fn refresh_script(&self) -> Option<String> {
        if self.mode != Mode::Watch {
            return None;
        }

        self.reload_port.map(|port| {
            format!(
                r#"(function(){{var s=new WebSocket("ws://"+location.hostname+":{port}");s.addEventListener("message",function(e){{if(e.data==="reload")location.reload();}});}})();"#
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_parts_is_length_prefixed() {
        let a = Hash32::hash_parts([b"ab".as_slice(), b"c".as_slice()]);
        let b = Hash32::hash_parts([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn refresh_script_only_in_watch_mode() {
        let env = Environment::new("/tmp", Mode::Build).with_reload_port(35729);
        assert!(env.refresh_script().is_none());

        let env = Environment::new("/tmp", Mode::Watch).with_reload_port(35729);
        let script = env.refresh_script().unwrap();
        assert!(script.contains(":35729"));
        assert!(script.contains("location.reload()"));
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let env = Environment::new("/project", Mode::Build);
        assert_eq!(env.resolve("build"), Utf8PathBuf::from("/project/build"));
        assert_eq!(env.resolve("/abs"), Utf8PathBuf::from("/abs"));
    }
}
