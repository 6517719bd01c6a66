//! Lexical scopes of a walk: arguments, environment overlay and namespace

use crate::config::{
    CommandRunner, ConfigStore, DocumentRewriter, DocumentTable, EvalContext, RewriteSpec,
};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// State visible to the actions of one graph, group or include
#[derive(Debug, Clone)]
pub struct Scope {
    pub store: Arc<ConfigStore>,
    /// Environment overlay handed to processes spawned from this scope
    pub env: IndexMap<String, String>,
    /// Current namespace, "" at the top level
    pub namespace: String,
    /// Directory of the launch file being walked
    pub base_dir: Option<PathBuf>,
    /// Documents of the graph being walked
    pub documents: Arc<DocumentTable>,
    /// Name of the graph, for logs
    pub label: String,
    /// Include nesting depth
    pub depth: usize,
}

impl Scope {
    /// Top-level scope of an execution
    pub fn root(
        label: impl Into<String>,
        overrides: IndexMap<String, String>,
        base_dir: Option<&Path>,
        documents: IndexMap<String, RewriteSpec>,
    ) -> Self {
        Self {
            store: Arc::new(ConfigStore::with_overrides(overrides)),
            env: IndexMap::new(),
            namespace: String::new(),
            base_dir: base_dir.map(Path::to_path_buf),
            documents: Arc::new(DocumentTable::new(documents)),
            label: label.into(),
            depth: 0,
        }
    }

    /// Scope of a group: chained store, copied environment.
    ///
    /// Documents are materialized again inside the group so they see its
    /// namespace and arguments.
    pub fn child_group(&self) -> Self {
        Self {
            store: Arc::new(ConfigStore::child(&self.store)),
            documents: Arc::new(DocumentTable::new(self.documents.specs().clone())),
            ..self.clone()
        }
    }

    /// Scope of an included graph: fresh store seeded with the given overrides.
    ///
    /// The namespace and environment of the including scope carry over.
    pub fn for_include(
        &self,
        label: impl Into<String>,
        overrides: IndexMap<String, String>,
        base_dir: Option<&Path>,
        documents: IndexMap<String, RewriteSpec>,
    ) -> Self {
        Self {
            store: Arc::new(ConfigStore::with_overrides(overrides)),
            env: self.env.clone(),
            namespace: self.namespace.clone(),
            base_dir: base_dir.map(Path::to_path_buf),
            documents: Arc::new(DocumentTable::new(documents)),
            label: label.into(),
            depth: self.depth + 1,
        }
    }

    /// Evaluation context borrowing from this scope
    pub fn eval_context<'a>(
        &'a self,
        search_paths: &'a [PathBuf],
        runner: &'a dyn CommandRunner,
        rewriter: &'a DocumentRewriter,
    ) -> EvalContext<'a> {
        EvalContext::new(&self.store)
            .with_env(&self.env)
            .with_namespace(&self.namespace)
            .with_base_dir(self.base_dir.as_deref())
            .with_search_paths(search_paths)
            .with_runner(runner)
            .with_documents(&self.documents, rewriter)
    }

    /// Decorate a process name with the current namespace
    pub fn qualify_name(&self, name: &str) -> String {
        qualify_name(&self.namespace, name)
    }
}

/// Push `push` onto `current`: empty keeps `current`, a leading `/` replaces it
pub fn join_namespace(current: &str, push: &str) -> String {
    let push = push.trim();
    if push.is_empty() {
        return current.to_string();
    }
    if push.starts_with('/') {
        return push.trim_end_matches('/').to_string();
    }
    let push = push.trim_end_matches('/');
    if current.is_empty() || current == "/" {
        format!("/{}", push)
    } else {
        format!("{}/{}", current.trim_end_matches('/'), push)
    }
}

/// `name` inside `namespace`, e.g. `/r2` + `amcl` -> `/r2/amcl`
pub fn qualify_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() || name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}/{}", namespace.trim_end_matches('/'), name)
    }
}
