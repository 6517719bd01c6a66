//! Document rewriter: derive a temporary YAML document from a template
//!
//! 1. read the source document
//! 2. replace placeholder tokens in the raw text (this reaches keys too)
//! 3. parse the result
//! 4. apply key rewrites, optionally coercing scalars to typed values
//! 5. optionally nest everything under a root key
//! 6. write the result to a temporary file owned by the execution

use crate::config::condition::{should_run, Condition};
use crate::config::launch_file::ArgValue;
use crate::config::substitution::{EvalContext, Substitution, SubstitutionError};
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::TempPath;

/// Literal text replacement applied before parsing
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    /// Token searched in the raw document, e.g. `<robot_namespace>`
    pub token: String,
    /// Text that replaces every occurrence of the token
    pub value: Substitution,
    /// Replacement is skipped when this evaluates false
    pub condition: Option<Condition>,
}

/// How to derive a document from a template
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteSpec {
    /// Path of the template document
    pub source: Substitution,
    /// Wrap the document under this key when it resolves non-empty
    pub root_key: Option<Substitution>,
    /// Key rewrites; dotted keys address a path from the root
    pub rewrites: IndexMap<String, Substitution>,
    /// Raw text replacements
    pub replacements: Vec<Replacement>,
    /// Turn boolean and numeric strings into typed values
    pub convert_types: bool,
}

impl RewriteSpec {
    pub fn new(source: impl Into<Substitution>) -> Self {
        Self {
            source: source.into(),
            root_key: None,
            rewrites: IndexMap::new(),
            replacements: Vec::new(),
            convert_types: false,
        }
    }

    pub fn with_rewrite(mut self, key: impl Into<String>, value: impl Into<Substitution>) -> Self {
        self.rewrites.insert(key.into(), value.into());
        self
    }

    pub fn with_replacement(
        mut self,
        token: impl Into<String>,
        value: impl Into<Substitution>,
        condition: Option<Condition>,
    ) -> Self {
        self.replacements.push(Replacement {
            token: token.into(),
            value: value.into(),
            condition,
        });
        self
    }

    pub fn with_root_key(mut self, root_key: impl Into<Substitution>) -> Self {
        self.root_key = Some(root_key.into());
        self
    }

    pub fn with_convert_types(mut self, convert_types: bool) -> Self {
        self.convert_types = convert_types;
        self
    }

    /// Evaluate every substitution of this rewrite in the given scope
    pub fn resolve(&self, ctx: &EvalContext<'_>) -> Result<ResolvedRewrite, RewriteError> {
        let context = |what: String| {
            move |e: SubstitutionError| RewriteError::Substitution {
                context: what,
                source: Box::new(e),
            }
        };

        let source = self.source.evaluate(ctx).map_err(context("source".into()))?;

        let mut replacements = Vec::new();
        for replacement in &self.replacements {
            let enabled = should_run(replacement.condition.as_ref(), ctx)
                .map_err(context(format!("condition of '{}'", replacement.token)))?;
            if enabled {
                let value = replacement
                    .value
                    .evaluate(ctx)
                    .map_err(context(format!("replacement '{}'", replacement.token)))?;
                replacements.push((replacement.token.clone(), value));
            }
        }

        let mut rewrites = IndexMap::new();
        for (key, value) in &self.rewrites {
            let value = value
                .evaluate(ctx)
                .map_err(context(format!("rewrite '{}'", key)))?;
            rewrites.insert(key.clone(), value);
        }

        let root_key = match &self.root_key {
            Some(key) => Some(key.evaluate(ctx).map_err(context("root_key".into()))?),
            None => None,
        };

        Ok(ResolvedRewrite {
            source: ctx.resolve_path(&source),
            root_key: root_key.filter(|key| !key.is_empty()),
            rewrites,
            replacements,
            convert_types: self.convert_types,
        })
    }

    pub fn arg_references(&self, out: &mut Vec<String>) {
        self.source.arg_references(out);
        if let Some(key) = &self.root_key {
            key.arg_references(out);
        }
        for value in self.rewrites.values() {
            value.arg_references(out);
        }
        for replacement in &self.replacements {
            replacement.value.arg_references(out);
            if let Some(condition) = &replacement.condition {
                condition.expression().arg_references(out);
            }
        }
    }

    /// Parse the document as it would be materialized, without writing it.
    ///
    /// Returns `Ok(false)` when the spec cannot be resolved yet (it reads
    /// values only known later in the walk) or its source cannot be read.
    pub fn precheck(&self, ctx: &EvalContext<'_>) -> Result<bool, RewriteError> {
        let Ok(resolved) = self.resolve(ctx) else {
            return Ok(false);
        };
        let Ok(text) = std::fs::read_to_string(&resolved.source) else {
            return Ok(false);
        };

        let label = resolved.source.to_string_lossy().into_owned();
        match rewrite_text(&text, &label, &resolved) {
            Err(e @ RewriteError::DocumentParse { .. }) => Err(e),
            _ => Ok(true),
        }
    }
}

/// A rewrite spec with every value already resolved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRewrite {
    pub source: PathBuf,
    pub root_key: Option<String>,
    pub rewrites: IndexMap<String, String>,
    pub replacements: Vec<(String, String)>,
    pub convert_types: bool,
}

/// Apply a resolved rewrite to raw document text and return the new text
pub fn rewrite_text(text: &str, label: &str, resolved: &ResolvedRewrite) -> Result<String, RewriteError> {
    let mut text = text.to_string();
    for (token, value) in &resolved.replacements {
        text = text.replace(token.as_str(), value);
    }

    let mut document: Value =
        serde_yaml::from_str(&text).map_err(|source| RewriteError::DocumentParse {
            path: label.to_string(),
            source,
        })?;
    if document.is_null() {
        document = Value::Mapping(Mapping::new());
    }

    apply_rewrites(&mut document, &resolved.rewrites, resolved.convert_types)?;

    if let Some(root_key) = &resolved.root_key {
        let mut wrapped = Mapping::new();
        wrapped.insert(Value::String(root_key.clone()), document);
        document = Value::Mapping(wrapped);
    }

    serde_yaml::to_string(&document).map_err(RewriteError::Serialize)
}

/// Overwrite or insert each key; later keys win over earlier ones
pub fn apply_rewrites(
    document: &mut Value,
    rewrites: &IndexMap<String, String>,
    convert_types: bool,
) -> Result<(), RewriteError> {
    for (key, value) in rewrites {
        let value = typed_value(value, convert_types);

        if key.contains('.') {
            let path: Vec<&str> = key.split('.').collect();
            let root = root_mapping(document, key)?;
            insert_path(root, &path, value);
            continue;
        }

        if replace_key(document, key, &value) == 0 {
            root_mapping(document, key)?.insert(Value::String(key.clone()), value);
        }
    }
    Ok(())
}

fn root_mapping<'a>(document: &'a mut Value, key: &str) -> Result<&'a mut Mapping, RewriteError> {
    document
        .as_mapping_mut()
        .ok_or_else(|| RewriteError::RootNotMapping(key.to_string()))
}

fn typed_value(value: &str, convert_types: bool) -> Value {
    if !convert_types {
        return Value::String(value.to_string());
    }
    match ArgValue::parse(value) {
        ArgValue::Bool(b) => Value::Bool(b),
        ArgValue::Int(i) => Value::Number(i.into()),
        ArgValue::Float(f) => Value::Number(f.into()),
        ArgValue::String(s) => Value::String(s),
    }
}

/// Replace the value of every `key` at any depth; returns the number of hits
fn replace_key(node: &mut Value, key: &str, value: &Value) -> usize {
    match node {
        Value::Mapping(mapping) => {
            let mut hits = 0;
            for (k, v) in mapping.iter_mut() {
                if k.as_str() == Some(key) {
                    *v = value.clone();
                    hits += 1;
                } else {
                    hits += replace_key(v, key, value);
                }
            }
            hits
        }
        Value::Sequence(items) => items.iter_mut().map(|item| replace_key(item, key, value)).sum(),
        Value::Tagged(tagged) => replace_key(&mut tagged.value, key, value),
        _ => 0,
    }
}

fn insert_path(mapping: &mut Mapping, path: &[&str], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            mapping.insert(Value::String(leaf.to_string()), value);
        }
        [head, rest @ ..] => {
            let entry = mapping
                .entry(Value::String(head.to_string()))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if !entry.is_mapping() {
                *entry = Value::Mapping(Mapping::new());
            }
            if let Some(child) = entry.as_mapping_mut() {
                insert_path(child, rest, value);
            }
        }
    }
}

/// Writes rewritten documents into temporary files and owns them.
///
/// Files are deleted on [`DocumentRewriter::cleanup`] or drop, unless the
/// rewriter was told to keep them for debugging.
#[derive(Debug, Default)]
pub struct DocumentRewriter {
    temp_dir: Option<PathBuf>,
    keep_files: bool,
    artifacts: Mutex<Vec<TempPath>>,
    kept: Mutex<Vec<PathBuf>>,
}

impl DocumentRewriter {
    pub fn new(temp_dir: Option<PathBuf>, keep_files: bool) -> Self {
        Self {
            temp_dir,
            keep_files,
            ..Self::default()
        }
    }

    /// Resolve `spec` in the given scope and materialize the result
    pub fn rewrite(&self, spec: &RewriteSpec, ctx: &EvalContext<'_>) -> Result<PathBuf, RewriteError> {
        let resolved = spec.resolve(ctx)?;
        self.rewrite_resolved(&resolved)
    }

    /// Materialize an already resolved rewrite
    pub fn rewrite_resolved(&self, resolved: &ResolvedRewrite) -> Result<PathBuf, RewriteError> {
        let label = resolved.source.to_string_lossy().into_owned();
        let text = std::fs::read_to_string(&resolved.source).map_err(|source| RewriteError::Io {
            path: label.clone(),
            source,
        })?;
        let rewritten = rewrite_text(&text, &label, resolved)?;
        self.write_temp(&rewritten)
    }

    fn write_temp(&self, contents: &str) -> Result<PathBuf, RewriteError> {
        let io_error = |source| RewriteError::Io {
            path: self
                .temp_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_else(|| "<temp>".to_string()),
            source,
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix("mobo_launch_").suffix(".yaml");
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(io_error)?;

        file.write_all(contents.as_bytes()).map_err(io_error)?;
        file.flush().map_err(io_error)?;

        let temp_path = file.into_temp_path();
        let path = temp_path.to_path_buf();
        if self.keep_files {
            temp_path.keep().map_err(|e| io_error(e.error))?;
            log::info!("Kept rewritten document: {}", path.display());
            lock(&self.kept).push(path.clone());
        } else {
            log::debug!("Wrote rewritten document: {}", path.display());
            lock(&self.artifacts).push(temp_path);
        }
        Ok(path)
    }

    /// Paths of every document written so far
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = lock(&self.artifacts)
            .iter()
            .map(|p| p.to_path_buf())
            .collect();
        paths.extend(lock(&self.kept).iter().cloned());
        paths
    }

    /// Delete every temporary document not marked to be kept
    pub fn cleanup(&self) {
        let artifacts: Vec<TempPath> = lock(&self.artifacts).drain(..).collect();
        for artifact in artifacts {
            let path = artifact.to_path_buf();
            if let Err(e) = artifact.close() {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Named rewrite specs of one graph, materialized at most once per scope
#[derive(Debug, Default)]
pub struct DocumentTable {
    specs: IndexMap<String, RewriteSpec>,
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl DocumentTable {
    pub fn new(specs: IndexMap<String, RewriteSpec>) -> Self {
        Self {
            specs,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(
        &self,
        name: &str,
        rewriter: &DocumentRewriter,
        ctx: &EvalContext<'_>,
    ) -> Result<PathBuf, SubstitutionError> {
        if let Some(path) = lock(&self.resolved).get(name) {
            return Ok(path.clone());
        }

        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| SubstitutionError::UnknownDocument(name.to_string()))?;
        let path = rewriter
            .rewrite(spec, ctx)
            .map_err(|e| SubstitutionError::Document {
                name: name.to_string(),
                source: Box::new(e),
            })?;

        let mut resolved = lock(&self.resolved);
        Ok(resolved.entry(name.to_string()).or_insert(path).clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn specs(&self) -> &IndexMap<String, RewriteSpec> {
        &self.specs
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read a document, failing with a parse error if it is not valid YAML
pub fn load_document(path: &Path) -> Result<Value, RewriteError> {
    let label = path.to_string_lossy().into_owned();
    let text = std::fs::read_to_string(path).map_err(|source| RewriteError::Io {
        path: label.clone(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| RewriteError::DocumentParse { path: label, source })
}

/// Errors that can occur while rewriting a document
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse document '{path}': {source}")]
    DocumentParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to serialize document: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("Cannot insert '{0}': document root is not a mapping")]
    RootNotMapping(String),

    #[error("Substitution failed in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: Box<SubstitutionError>,
    },
}
