//! Project configuration loaded from `nagare.toml`.
//!
//! Every field has a default, so a project that follows the conventional
//! `app/` → `build/` layout needs no configuration file at all.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// Name of the configuration file looked up in the project root.
pub const CONFIG_FILE: &str = "nagare.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Project root; every other path is relative to it.
    pub root: Utf8PathBuf,
    /// Output tree.
    pub build: Utf8PathBuf,
    /// Scratch directory for intermediate output, removed by `clean`.
    pub tmp: Utf8PathBuf,
    /// Persistent cache directory (image optimization).
    pub cache: Utf8PathBuf,
    pub paths: Paths,
    pub styles: Styles,
    pub scripts: Scripts,
    pub serve: Serve,
}

/// Glob patterns for each source family.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    /// Scripts checked by the linter and watched for changes.
    pub scripts: Vec<String>,
    /// Entry scripts concatenated into the bundle.
    pub entry_scripts: Vec<String>,
    pub scss: Vec<String>,
    pub css: Vec<String>,
    pub images: Vec<String>,
    pub html: Vec<String>,
    /// Files copied verbatim to the build root (dotfiles included).
    pub copy: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Styles {
    /// Browser targets for the vendor prefixer, e.g. `"ie >= 10"`.
    pub browsers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scripts {
    /// File name of the concatenated bundle.
    pub bundle: String,
    /// Optional transpiler command line, `{path}` is replaced with the
    /// source path and the contents are piped through stdin.
    pub transpiler: Option<Vec<String>>,
    /// Comment preservation for the minifier: `"some"`, `"all"` or `"none"`.
    pub preserve_comments: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Serve {
    /// Port of the development server (`serve`).
    pub port: u16,
    /// Port of the production preview server (`serve:build`).
    pub build_port: u16,
    /// Port of the live-reload WebSocket server.
    pub reload_port: u16,
    /// Quiet period before a batch of file changes triggers a rebuild.
    pub debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            build: Utf8PathBuf::from("build"),
            tmp: Utf8PathBuf::from(".tmp"),
            cache: Utf8PathBuf::from(".cache"),
            paths: Paths::default(),
            styles: Styles::default(),
            scripts: Scripts::default(),
            serve: Serve::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            scripts: vec!["app/scripts/**/*.js".into()],
            entry_scripts: vec!["app/scripts/main.js".into()],
            scss: vec!["app/styles/**/*.scss".into()],
            css: vec!["app/styles/**/*.css".into()],
            images: vec!["app/images/**/*".into()],
            html: vec!["app/**/*.html".into()],
            copy: vec![
                "app/*".into(),
                "!app/*.html".into(),
                "node_modules/apache-server-configs/build/.htaccess".into(),
            ],
        }
    }
}

impl Default for Styles {
    fn default() -> Self {
        Self {
            browsers: [
                "ie >= 10",
                "ie_mob >= 10",
                "ff >= 30",
                "chrome >= 34",
                "safari >= 7",
                "opera >= 23",
                "ios >= 7",
                "android >= 4.4",
                "bb >= 10",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            bundle: "main.min.js".into(),
            transpiler: None,
            preserve_comments: "some".into(),
        }
    }
}

impl Default for Serve {
    fn default() -> Self {
        Self {
            port: 3000,
            build_port: 3001,
            reload_port: 35729,
            debounce_ms: 250,
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str, path: &Utf8Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the configuration.
    ///
    /// With an explicit `path` the file must exist. Without one, `nagare.toml`
    /// in the current directory is used when present and the defaults
    /// otherwise.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Utf8PathBuf::from(CONFIG_FILE), false),
        };

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let mut config = Self::from_toml(&text, &path)?;

        // A relative root is relative to the file that declared it.
        if config.root.is_relative()
            && let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            config.root = parent.join(&config.root);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_conventional_layout() {
        let config = Config::default();
        assert_eq!(config.build, "build");
        assert_eq!(config.serve.port, 3000);
        assert_eq!(config.serve.build_port, 3001);
        assert_eq!(config.styles.browsers.len(), 9);
        assert_eq!(config.scripts.bundle, "main.min.js");
        assert!(config.paths.copy.contains(&"!app/*.html".to_string()));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let text = r#"
            build = "dist"

            [serve]
            port = 8080

            [scripts]
            transpiler = ["babel", "--filename", "{path}"]
        "#;

        let config = Config::from_toml(text, Utf8Path::new("nagare.toml")).unwrap();
        assert_eq!(config.build, "dist");
        assert_eq!(config.serve.port, 8080);
        assert_eq!(config.serve.reload_port, 35729);
        assert_eq!(config.scripts.bundle, "main.min.js");
        assert_eq!(config.scripts.transpiler.unwrap()[0], "babel");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_toml("colour = 1", Utf8Path::new("nagare.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = Config::load(Some(Utf8Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn root_is_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let path = root.join("nagare.toml");
        fs::write(&path, "build = \"out\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.root, root.join("."));
        assert_eq!(config.build, "out");
    }
}
