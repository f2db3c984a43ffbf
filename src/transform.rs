//! Transforms and the registry that names them.
//!
//! A transform either works file by file ([`FileTransform`]), in which case
//! the pipeline isolates failures per file, or on the whole set at once
//! ([`SetTransform`]), e.g. concatenation.
//!
//! Transforms are created by name through the [`Registry`], which merges
//! caller options over each transform's defaults and deserializes them into
//! the transform's own typed options.

mod autoprefix;
mod concat;
mod css;
mod exec;
mod html;
#[cfg(feature = "image")]
mod image;
mod js;
mod lint;
mod reload;
#[cfg(feature = "grass")]
mod sass;

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::core::Environment;
use crate::error::{ConfigError, TransformError};
use crate::file::{File, FileSet};

pub use autoprefix::{Autoprefix, Browser, Target};
pub use concat::Concat;
pub use css::MinifyCss;
pub use exec::Exec;
pub use html::{MinifyHtml, Useref};
#[cfg(feature = "image")]
pub use image::OptimizeImages;
pub use js::{MinifyJs, Preserve};
pub use lint::{LintJs, Problem, Severity};
pub use reload::LiveReload;
#[cfg(feature = "grass")]
pub use sass::Sass;

/// Options passed to a transform factory, a JSON object.
pub type Options = Map<String, Value>;

/// Context shared by every step of a pipeline run.
pub struct StepContext<'a> {
    pub env: &'a Environment,
}

/// A transform applied to each file independently.
pub trait FileTransform: Send + Sync {
    fn name(&self) -> &str;

    /// Transform one file. Returning `Ok(None)` drops the file from the
    /// stream (e.g. Sass partials).
    fn transform(&self, ctx: &StepContext<'_>, file: File)
    -> Result<Option<File>, TransformError>;
}

/// A transform over the whole file set.
pub trait SetTransform: Send + Sync {
    fn name(&self) -> &str;

    fn transform(&self, ctx: &StepContext<'_>, files: FileSet) -> Result<FileSet, TransformError>;
}

#[derive(Clone)]
pub enum Transform {
    File(Arc<dyn FileTransform>),
    Set(Arc<dyn SetTransform>),
}

impl Transform {
    pub fn file(transform: impl FileTransform + 'static) -> Self {
        Transform::File(Arc::new(transform))
    }

    pub fn set(transform: impl SetTransform + 'static) -> Self {
        Transform::Set(Arc::new(transform))
    }

    pub fn name(&self) -> &str {
        match self {
            Transform::File(t) => t.name(),
            Transform::Set(t) => t.name(),
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transform({})", self.name())
    }
}

type Factory = Arc<dyn Fn(&Options) -> Result<Transform, ConfigError> + Send + Sync>;

struct Entry {
    factory: Factory,
    defaults: Options,
}

/// Maps transform names to factories and their default options.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in transform.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "grass")]
        registry.register(
            sass::NAME,
            |o| Ok(Transform::file(Sass::new(parse(sass::NAME, o)?))),
            json!({ "style": "expanded", "load_paths": [] }),
        );
        registry.register(
            autoprefix::NAME,
            |o| Ok(Transform::file(Autoprefix::new(parse(autoprefix::NAME, o)?)?)),
            json!({ "browsers": crate::config::Styles::default().browsers }),
        );
        registry.register(
            css::NAME,
            |o| Ok(Transform::file(MinifyCss::new(parse(css::NAME, o)?))),
            json!({ "keep_important_comments": true }),
        );
        registry.register(
            concat::NAME,
            |o| Ok(Transform::set(Concat::new(parse(concat::NAME, o)?))),
            json!({ "file": "bundle.js", "separator": "\n" }),
        );
        registry.register(
            js::NAME,
            |o| Ok(Transform::file(MinifyJs::new(parse(js::NAME, o)?))),
            json!({ "preserve_comments": "some", "drop_debugger": true }),
        );
        registry.register(
            lint::NAME,
            |o| Ok(Transform::file(LintJs::new(parse(lint::NAME, o)?))),
            json!({
                "fail_after_error": true,
                "rules": {
                    "no-debugger": "error",
                    "eqeqeq": "error",
                    "no-var": "warn",
                    "no-console": "off",
                    "no-trailing-spaces": "warn"
                }
            }),
        );
        #[cfg(feature = "image")]
        registry.register(
            image::NAME,
            |o| Ok(Transform::file(OptimizeImages::new(parse(image::NAME, o)?))),
            json!({ "progressive": true, "interlaced": true, "jpeg_quality": null, "cache": true }),
        );
        registry.register(
            html::USEREF,
            |o| Ok(Transform::file(Useref::new(parse(html::USEREF, o)?))),
            json!({ "no_assets": true }),
        );
        registry.register(
            html::MINIFY,
            |o| Ok(Transform::file(MinifyHtml::new(parse(html::MINIFY, o)?))),
            json!({
                "remove_comments": true,
                "collapse_whitespace": true,
                "collapse_boolean_attributes": true,
                "remove_attribute_quotes": true,
                "remove_redundant_attributes": true,
                "remove_empty_attributes": true,
                "remove_script_type_attributes": true,
                "remove_style_link_type_attributes": true,
                "remove_optional_tags": true
            }),
        );
        registry.register(
            reload::NAME,
            |_| Ok(Transform::file(LiveReload)),
            json!({}),
        );
        registry.register(
            exec::NAME,
            |o| Ok(Transform::file(Exec::new(parse(exec::NAME, o)?)?)),
            json!({ "command": [], "extension": null }),
        );

        registry
    }

    /// Register a transform factory under `name` with default options.
    /// Registering an existing name replaces it.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F, defaults: Value)
    where
        F: Fn(&Options) -> Result<Transform, ConfigError> + Send + Sync + 'static,
    {
        let defaults = match defaults {
            Value::Object(map) => map,
            _ => Options::new(),
        };

        self.entries.insert(
            name.into(),
            Entry {
                factory: Arc::new(factory),
                defaults,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Default options of a transform.
    pub fn defaults(&self, name: &str) -> Option<&Options> {
        self.entries.get(name).map(|e| &e.defaults)
    }

    /// Create a transform with its default options.
    pub fn lookup(&self, name: &str) -> Result<Transform, ConfigError> {
        self.create(name, Value::Null)
    }

    /// Create a transform, with `overrides` (a JSON object) merged over the
    /// defaults key by key.
    pub fn create(&self, name: &str, overrides: Value) -> Result<Transform, ConfigError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTransform(name.to_string()))?;

        let mut options = entry.defaults.clone();
        if let Value::Object(overrides) = overrides {
            options.extend(overrides);
        }

        (entry.factory)(&options)
    }
}

/// Deserialize a transform's typed options.
pub(crate) fn parse<T: DeserializeOwned>(name: &str, options: &Options) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(options.clone())).map_err(|source| ConfigError::Options {
        name: name.to_string(),
        source,
    })
}
