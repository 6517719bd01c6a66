//! Launch graph: an ordered tree of actions

use crate::config::{
    Argument, Condition, LaunchFile, LaunchFileError, RewriteSpec, StoreError, Substitution,
};
use crate::runtime::process::OutputMode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A launch graph: ordered actions plus the documents they may reference
#[derive(Debug, Clone, Default)]
pub struct LaunchGraph {
    /// Display name (file stem for graphs loaded from disk)
    pub name: String,
    /// File the graph was loaded from
    pub source: Option<PathBuf>,
    /// Top-level actions in declaration order
    pub actions: Vec<Action>,
    /// Named document rewrites, referenced as `$(document name)`
    pub documents: IndexMap<String, RewriteSpec>,
}

impl LaunchGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load and convert a YAML launch file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LaunchFileError> {
        LaunchFile::from_file(path.as_ref())?.into_graph()
    }

    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn with_document(mut self, name: impl Into<String>, spec: RewriteSpec) -> Self {
        self.documents.insert(name.into(), spec);
        self
    }

    /// Directory relative paths and `$(dirname)` resolve against
    pub fn base_dir(&self) -> Option<&Path> {
        self.source.as_deref().and_then(Path::parent)
    }

    /// Arguments this graph declares, groups included, in declaration order
    pub fn declared_arguments(&self) -> Vec<&Argument> {
        fn collect<'a>(actions: &'a [Action], out: &mut Vec<&'a Argument>) {
            for action in actions {
                match action {
                    Action::DeclareArgument(declare) => out.push(&declare.argument),
                    Action::Group(group) => collect(&group.actions, out),
                    _ => {}
                }
            }
        }

        let mut out = Vec::new();
        collect(&self.actions, &mut out);
        out
    }

    /// Static checks run before anything executes: no duplicate declaration in
    /// one scope, and every argument read after its declaration in a scope
    /// that can see it.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut check = ScopeCheck {
            documents: &self.documents,
            scopes: vec![HashSet::new()],
            used_documents: HashSet::new(),
        };
        check.actions(&self.actions)?;

        // documents no action reads are checked against the top-level declarations
        let root = check.scopes.first().cloned().unwrap_or_default();
        for (name, spec) in &self.documents {
            if check.used_documents.contains(name) {
                continue;
            }
            let mut referenced = Vec::new();
            spec.arg_references(&mut referenced);
            if let Some(name) = referenced.into_iter().find(|n| !root.contains(n)) {
                return Err(StoreError::UndeclaredArgument(name));
            }
        }
        Ok(())
    }
}

/// In-order walk of a graph tracking which declarations each action can see
struct ScopeCheck<'a> {
    documents: &'a IndexMap<String, RewriteSpec>,
    /// Innermost scope last; a group pushes one
    scopes: Vec<HashSet<String>>,
    used_documents: HashSet<String>,
}

impl ScopeCheck<'_> {
    fn is_visible(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn actions(&mut self, actions: &[Action]) -> Result<(), StoreError> {
        for action in actions {
            self.references(&action.own_substitutions())?;

            match action {
                Action::DeclareArgument(declare) => {
                    let name = &declare.argument.name;
                    let fresh = self
                        .scopes
                        .last_mut()
                        .is_some_and(|scope| scope.insert(name.clone()));
                    if !fresh {
                        return Err(StoreError::DuplicateArgument(name.clone()));
                    }
                }
                Action::Group(group) => {
                    self.scopes.push(HashSet::new());
                    let result = self.actions(&group.actions);
                    self.scopes.pop();
                    result?;
                }
                Action::IncludeGraph(IncludeGraph {
                    source: IncludeSource::Graph(graph),
                    ..
                }) => graph.validate()?,
                _ => {}
            }
        }
        Ok(())
    }

    fn references(&mut self, substitutions: &[&Substitution]) -> Result<(), StoreError> {
        let mut args = Vec::new();
        let mut documents = Vec::new();
        for substitution in substitutions {
            substitution.arg_references(&mut args);
            substitution.document_references(&mut documents);
        }
        for name in documents {
            if let Some(spec) = self.documents.get(&name) {
                spec.arg_references(&mut args);
            }
            self.used_documents.insert(name);
        }

        match args.into_iter().find(|name| !self.is_visible(name)) {
            Some(name) => Err(StoreError::UndeclaredArgument(name)),
            None => Ok(()),
        }
    }
}

/// A unit of orchestration work
#[derive(Debug, Clone)]
pub enum Action {
    SpawnProcess(SpawnProcess),
    IncludeGraph(IncludeGraph),
    Group(Group),
    SetEnvironment(SetEnvironment),
    DeclareArgument(DeclareArgument),
}

impl Action {
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            Action::SpawnProcess(a) => a.condition.as_ref(),
            Action::IncludeGraph(a) => a.condition.as_ref(),
            Action::Group(a) => a.condition.as_ref(),
            Action::SetEnvironment(a) => a.condition.as_ref(),
            Action::DeclareArgument(a) => a.condition.as_ref(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::SpawnProcess(_) => ActionKind::SpawnProcess,
            Action::IncludeGraph(_) => ActionKind::IncludeGraph,
            Action::Group(_) => ActionKind::Group,
            Action::SetEnvironment(_) => ActionKind::SetEnvironment,
            Action::DeclareArgument(_) => ActionKind::DeclareArgument,
        }
    }

    /// Short label used in logs and reports, e.g. `spawn:gzserver` or `group#5`
    pub fn describe(&self, index: usize) -> String {
        let name = match self {
            Action::SpawnProcess(a) => a.name.clone(),
            Action::SetEnvironment(a) => Some(a.name.clone()),
            Action::DeclareArgument(a) => Some(a.argument.name.clone()),
            Action::IncludeGraph(IncludeGraph {
                source: IncludeSource::Graph(graph),
                ..
            }) => Some(graph.name.clone()),
            _ => None,
        };
        match name {
            Some(name) => format!("{}:{}", self.kind(), name),
            None => format!("{}#{}", self.kind(), index),
        }
    }

    /// Expressions this action evaluates in its enclosing scope; children of
    /// a group are not included
    fn own_substitutions(&self) -> Vec<&Substitution> {
        let mut out = Vec::new();
        if let Some(condition) = self.condition() {
            out.push(condition.expression());
        }
        match self {
            Action::SpawnProcess(spawn) => {
                out.extend(&spawn.cmd);
                out.extend(spawn.env.values());
                out.extend(&spawn.cwd);
            }
            Action::IncludeGraph(include) => {
                if let IncludeSource::File(path) = &include.source {
                    out.push(path);
                }
                out.extend(include.args.values());
            }
            Action::Group(group) => {
                if let Some(push) = &group.namespace {
                    out.push(&push.namespace);
                    if let Some(condition) = &push.condition {
                        out.push(condition.expression());
                    }
                }
            }
            Action::SetEnvironment(set) => out.push(&set.value),
            Action::DeclareArgument(declare) => out.extend(&declare.argument.default),
        }
        out
    }
}

/// Discriminant of [`Action`], for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SpawnProcess,
    IncludeGraph,
    Group,
    SetEnvironment,
    DeclareArgument,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::SpawnProcess => "spawn",
            ActionKind::IncludeGraph => "include",
            ActionKind::Group => "group",
            ActionKind::SetEnvironment => "set_env",
            ActionKind::DeclareArgument => "declare_arg",
        };
        f.write_str(name)
    }
}

/// Start an external process
#[derive(Debug, Clone)]
pub struct SpawnProcess {
    /// Process name, prefixed by the enclosing namespace
    pub name: Option<String>,
    /// Executable followed by its arguments
    pub cmd: Vec<Substitution>,
    /// Extra environment on top of the scope environment
    pub env: IndexMap<String, Substitution>,
    /// Working directory
    pub cwd: Option<Substitution>,
    pub condition: Option<Condition>,
    /// Wait for the process to exit before starting the next sibling
    pub blocking: bool,
    /// A failure of this process shuts the whole launch down
    pub critical: bool,
    /// Restart after exit, waiting this long first
    pub respawn: Option<Duration>,
    pub output: OutputMode,
}

impl SpawnProcess {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Substitution>,
    {
        Self {
            name: None,
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: IndexMap::new(),
            cwd: None,
            condition: None,
            blocking: false,
            critical: false,
            respawn: None,
            output: OutputMode::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<Substitution>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn respawn(mut self, delay: Duration) -> Self {
        self.respawn = Some(delay);
        self
    }
}

/// Where an included graph comes from
#[derive(Debug, Clone)]
pub enum IncludeSource {
    /// Launch file path, relative to the including file
    File(Substitution),
    /// Graph built in code
    Graph(Arc<LaunchGraph>),
}

/// How an included graph is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncludeMode {
    /// Walk to completion before the next sibling starts
    #[default]
    Inline,
    /// Walk concurrently with the including graph
    Background,
}

/// Run another graph with its own argument store
#[derive(Debug, Clone)]
pub struct IncludeGraph {
    pub source: IncludeSource,
    /// Overrides handed to the included graph, resolved in the including scope
    pub args: IndexMap<String, Substitution>,
    pub condition: Option<Condition>,
    pub mode: IncludeMode,
    /// For background includes: launch only succeeds once the sub-walk finished
    pub join: bool,
}

impl IncludeGraph {
    pub fn file(path: impl Into<Substitution>) -> Self {
        Self::from_source(IncludeSource::File(path.into()))
    }

    pub fn graph(graph: LaunchGraph) -> Self {
        Self::from_source(IncludeSource::Graph(Arc::new(graph)))
    }

    fn from_source(source: IncludeSource) -> Self {
        Self {
            source,
            args: IndexMap::new(),
            condition: None,
            mode: IncludeMode::Inline,
            join: false,
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Substitution>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn in_background(mut self, join: bool) -> Self {
        self.mode = IncludeMode::Background;
        self.join = join;
        self
    }
}

/// Namespace pushed onto every namespaced child of a group
#[derive(Debug, Clone)]
pub struct NamespacePush {
    pub namespace: Substitution,
    pub condition: Option<Condition>,
}

/// Children run in order inside a nested scope
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub actions: Vec<Action>,
    pub namespace: Option<NamespacePush>,
    pub condition: Option<Condition>,
}

impl Group {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<Substitution>, condition: Option<Condition>) -> Self {
        self.namespace = Some(NamespacePush {
            namespace: namespace.into(),
            condition,
        });
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Set a variable for every process spawned later in this scope
#[derive(Debug, Clone)]
pub struct SetEnvironment {
    pub name: String,
    pub value: Substitution,
    pub condition: Option<Condition>,
}

impl SetEnvironment {
    pub fn new(name: impl Into<String>, value: impl Into<Substitution>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            condition: None,
        }
    }
}

/// Register an argument in the current store
#[derive(Debug, Clone)]
pub struct DeclareArgument {
    pub argument: Argument,
    pub condition: Option<Condition>,
}

impl From<Argument> for DeclareArgument {
    fn from(argument: Argument) -> Self {
        Self {
            argument,
            condition: None,
        }
    }
}

impl From<SpawnProcess> for Action {
    fn from(action: SpawnProcess) -> Self {
        Action::SpawnProcess(action)
    }
}

impl From<IncludeGraph> for Action {
    fn from(action: IncludeGraph) -> Self {
        Action::IncludeGraph(action)
    }
}

impl From<Group> for Action {
    fn from(action: Group) -> Self {
        Action::Group(action)
    }
}

impl From<SetEnvironment> for Action {
    fn from(action: SetEnvironment) -> Self {
        Action::SetEnvironment(action)
    }
}

impl From<DeclareArgument> for Action {
    fn from(action: DeclareArgument) -> Self {
        Action::DeclareArgument(action)
    }
}

impl From<Argument> for Action {
    fn from(argument: Argument) -> Self {
        Action::DeclareArgument(argument.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> LaunchGraph {
        LaunchGraph::new("sample")
            .with_action(Argument::new("use_rviz").with_default("True"))
            .with_action(
                SpawnProcess::new(["rviz2"])
                    .named("rviz")
                    .when(Condition::if_true(Substitution::arg("use_rviz"))),
            )
            .with_action(Group::new(vec![
                Argument::new("slam").with_default("False").into(),
            ]))
    }

    #[test]
    fn test_declared_arguments_include_groups() {
        let graph = sample_graph();
        let names: Vec<_> = graph
            .declared_arguments()
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, vec!["use_rviz", "slam"]);
    }

    #[test]
    fn test_validate_accepts_sample() {
        sample_graph().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_in_same_scope() {
        let graph = sample_graph().with_action(Argument::new("use_rviz"));
        assert_eq!(
            graph.validate(),
            Err(StoreError::DuplicateArgument("use_rviz".into()))
        );
    }

    #[test]
    fn test_validate_allows_shadowing_in_group() {
        let graph = sample_graph().with_action(Group::new(vec![Argument::new("use_rviz").into()]));
        graph.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_undeclared_reference() {
        let graph = sample_graph().with_action(
            SpawnProcess::new([Substitution::literal("gzserver"), Substitution::arg("world")]),
        );
        assert_eq!(
            graph.validate(),
            Err(StoreError::UndeclaredArgument("world".into()))
        );
    }

    #[test]
    fn test_validate_rejects_read_before_declaration() {
        let graph = LaunchGraph::new("late")
            .with_action(SpawnProcess::new(["sleep", "30"]).named("one"))
            .with_action(SpawnProcess::new([
                Substitution::literal("echo"),
                Substitution::arg("late"),
            ]))
            .with_action(Argument::new("late").with_default("1"));
        assert_eq!(
            graph.validate(),
            Err(StoreError::UndeclaredArgument("late".into()))
        );
    }

    #[test]
    fn test_validate_group_declarations_do_not_leak() {
        let graph = LaunchGraph::new("scoped")
            .with_action(Group::new(vec![Argument::new("inner").with_default("x").into()]))
            .with_action(SpawnProcess::new(["sleep", "30"]).named("one"))
            .with_action(SpawnProcess::new([
                Substitution::literal("echo"),
                Substitution::arg("inner"),
            ]));
        assert_eq!(
            graph.validate(),
            Err(StoreError::UndeclaredArgument("inner".into()))
        );
    }

    #[test]
    fn test_validate_group_sees_outer_and_own_declarations() {
        let graph = LaunchGraph::new("scoped")
            .with_action(Argument::new("outer").with_default("a"))
            .with_action(Group::new(vec![
                Argument::new("inner").with_default(Substitution::arg("outer")).into(),
                SpawnProcess::new([Substitution::arg("outer"), Substitution::arg("inner")]).into(),
            ]));
        graph.validate().unwrap();
    }

    #[test]
    fn test_validate_checks_documents_where_they_are_read() {
        let spec = RewriteSpec::new("params.yaml").with_rewrite("use_sim_time", Substitution::arg("sim"));
        let amcl = || {
            SpawnProcess::new([
                Substitution::literal("amcl"),
                Substitution::Document("params".into()),
            ])
        };

        let inside = LaunchGraph::new("docs")
            .with_document("params", spec.clone())
            .with_action(Group::new(vec![
                Argument::new("sim").with_default("true").into(),
                amcl().into(),
            ]));
        inside.validate().unwrap();

        let outside = LaunchGraph::new("docs")
            .with_document("params", spec)
            .with_action(Group::new(vec![Argument::new("sim").with_default("true").into()]))
            .with_action(amcl());
        assert_eq!(
            outside.validate(),
            Err(StoreError::UndeclaredArgument("sim".into()))
        );
    }

    #[test]
    fn test_validate_descends_into_included_graphs() {
        let inner = LaunchGraph::new("inner")
            .with_action(SpawnProcess::new([Substitution::arg("missing")]));
        let graph = LaunchGraph::new("outer").with_action(IncludeGraph::graph(inner));
        assert_eq!(
            graph.validate(),
            Err(StoreError::UndeclaredArgument("missing".into()))
        );
    }

    #[test]
    fn test_describe() {
        let graph = sample_graph();
        assert_eq!(graph.actions[0].describe(0), "declare_arg:use_rviz");
        assert_eq!(graph.actions[1].describe(1), "spawn:rviz");
        assert_eq!(graph.actions[2].describe(2), "group#2");
    }
}
