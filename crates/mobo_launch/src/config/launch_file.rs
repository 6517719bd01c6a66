//! Launch file YAML schema definitions

use crate::config::condition::Condition;
use crate::config::rewrite::RewriteSpec;
use crate::config::store::{Argument, StoreError};
use crate::config::substitution::{Substitution, SubstitutionError};
use crate::runtime::graph::{
    Action, DeclareArgument, Group, IncludeGraph, IncludeMode, IncludeSource, LaunchGraph,
    NamespacePush, SetEnvironment, SpawnProcess,
};
use crate::runtime::process::OutputMode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root launch file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchFile {
    /// Launch file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Argument definitions, declared before any action runs
    #[serde(default)]
    pub args: IndexMap<String, ArgDefinition>,

    /// Named document rewrites, referenced as `$(document name)`
    #[serde(default)]
    pub documents: IndexMap<String, DocumentDefinition>,

    /// Actions, executed in order
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,

    /// File this launch file was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Argument definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgDefinition {
    /// Default value; may contain substitutions
    #[serde(default)]
    pub default: Option<ArgValue>,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Allowed values
    #[serde(default)]
    pub choices: Vec<ArgValue>,
}

/// Argument values can be strings, booleans, or numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    /// Convert to string representation
    pub fn as_str(&self) -> String {
        match self {
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(f) => f.to_string(),
            ArgValue::String(s) => s.clone(),
        }
    }

    /// Parse from string, picking the narrowest type
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("true") {
            return ArgValue::Bool(true);
        }
        if s.eq_ignore_ascii_case("false") {
            return ArgValue::Bool(false);
        }
        if let Ok(i) = s.parse::<i64>() {
            return ArgValue::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return ArgValue::Float(f);
        }
        ArgValue::String(s.to_string())
    }

    fn to_substitution(&self) -> Result<Substitution, SubstitutionError> {
        match self {
            ArgValue::String(s) => Substitution::parse(s),
            other => Ok(Substitution::Literal(other.as_str())),
        }
    }
}

/// A value position: a scalar with substitutions, or a boolean composite
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueDefinition {
    Scalar(ArgValue),
    Not { not: Box<ValueDefinition> },
    All { all: Vec<ValueDefinition> },
    Any { any: Vec<ValueDefinition> },
    Equals { equals: Vec<ValueDefinition> },
}

impl ValueDefinition {
    pub fn to_substitution(&self) -> Result<Substitution, LaunchFileError> {
        let convert = |values: &[ValueDefinition]| {
            values
                .iter()
                .map(ValueDefinition::to_substitution)
                .collect::<Result<Vec<_>, _>>()
        };

        match self {
            ValueDefinition::Scalar(value) => value
                .to_substitution()
                .map_err(|source| LaunchFileError::Substitution {
                    context: value.as_str(),
                    source,
                }),
            ValueDefinition::Not { not } => Ok(Substitution::not(not.to_substitution()?)),
            ValueDefinition::All { all } => Ok(Substitution::and(convert(all)?)),
            ValueDefinition::Any { any } => Ok(Substitution::or(convert(any)?)),
            ValueDefinition::Equals { equals } => match equals.as_slice() {
                [left, right] => Ok(Substitution::equals(
                    left.to_substitution()?,
                    right.to_substitution()?,
                )),
                _ => Err(LaunchFileError::Validation(format!(
                    "'equals' takes exactly two operands, got {}",
                    equals.len()
                ))),
            },
        }
    }
}

/// Document rewrite definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDefinition {
    /// Template path, relative to the launch file
    pub source: String,
    #[serde(default)]
    pub root_key: Option<String>,
    #[serde(default)]
    pub rewrites: IndexMap<String, ValueDefinition>,
    #[serde(default)]
    pub replacements: Vec<ReplacementDefinition>,
    #[serde(default)]
    pub convert_types: bool,
}

/// Placeholder replacement inside a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementDefinition {
    pub token: String,
    pub value: ValueDefinition,
    #[serde(default, rename = "if")]
    pub if_true: Option<ValueDefinition>,
    #[serde(default)]
    pub unless: Option<ValueDefinition>,
}

/// One entry of the `actions` list, tagged by `action:`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionDefinition {
    DeclareArg {
        name: String,
        #[serde(default)]
        default: Option<ArgValue>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        choices: Vec<ArgValue>,
        #[serde(default, rename = "if")]
        if_true: Option<ValueDefinition>,
        #[serde(default)]
        unless: Option<ValueDefinition>,
    },
    SetEnv {
        name: String,
        value: ValueDefinition,
        #[serde(default, rename = "if")]
        if_true: Option<ValueDefinition>,
        #[serde(default)]
        unless: Option<ValueDefinition>,
    },
    Spawn {
        #[serde(default)]
        name: Option<String>,
        /// Executable followed by its arguments
        cmd: Vec<ArgValue>,
        #[serde(default)]
        env: IndexMap<String, ValueDefinition>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        blocking: bool,
        #[serde(default)]
        critical: bool,
        #[serde(default)]
        respawn: bool,
        #[serde(default)]
        respawn_delay_ms: Option<u64>,
        #[serde(default)]
        output: OutputMode,
        #[serde(default, rename = "if")]
        if_true: Option<ValueDefinition>,
        #[serde(default)]
        unless: Option<ValueDefinition>,
    },
    Include {
        file: String,
        #[serde(default)]
        args: IndexMap<String, ValueDefinition>,
        #[serde(default)]
        mode: IncludeMode,
        #[serde(default)]
        join: bool,
        #[serde(default, rename = "if")]
        if_true: Option<ValueDefinition>,
        #[serde(default)]
        unless: Option<ValueDefinition>,
    },
    Group {
        #[serde(default)]
        namespace: Option<String>,
        /// Condition for the namespace push only
        #[serde(default)]
        namespace_if: Option<ValueDefinition>,
        #[serde(default)]
        actions: Vec<ActionDefinition>,
        #[serde(default, rename = "if")]
        if_true: Option<ValueDefinition>,
        #[serde(default)]
        unless: Option<ValueDefinition>,
    },
}

impl LaunchFile {
    /// Load launch file from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, LaunchFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| LaunchFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut launch_file = Self::from_yaml(&content)?;
        launch_file.source = Some(path.to_path_buf());
        Ok(launch_file)
    }

    /// Parse launch file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, LaunchFileError> {
        let launch_file: LaunchFile =
            serde_yaml::from_str(content).map_err(LaunchFileError::Parse)?;
        launch_file.validate()?;
        Ok(launch_file)
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self) -> Result<(), LaunchFileError> {
        fn check(actions: &[ActionDefinition]) -> Result<(), LaunchFileError> {
            for action in actions {
                match action {
                    ActionDefinition::Spawn { name, cmd, .. } if cmd.is_empty() => {
                        return Err(LaunchFileError::Validation(format!(
                            "Spawn '{}': 'cmd' must not be empty",
                            name.as_deref().unwrap_or("<unnamed>")
                        )));
                    }
                    ActionDefinition::Include {
                        file,
                        mode: IncludeMode::Inline,
                        join: true,
                        ..
                    } => {
                        return Err(LaunchFileError::Validation(format!(
                            "Include '{}': 'join' only applies to background includes",
                            file
                        )));
                    }
                    ActionDefinition::Group {
                        namespace: None,
                        namespace_if: Some(_),
                        ..
                    } => {
                        return Err(LaunchFileError::Validation(
                            "Group: 'namespace_if' requires 'namespace'".to_string(),
                        ));
                    }
                    ActionDefinition::Group { actions, .. } => check(actions)?,
                    _ => {}
                }
            }
            Ok(())
        }

        check(&self.actions)
    }

    /// Convert into an executable graph; `args` become leading declarations
    pub fn into_graph(self) -> Result<LaunchGraph, LaunchFileError> {
        let name = self
            .source
            .as_deref()
            .and_then(Path::file_stem)
            .map(|stem| stem.to_string_lossy().trim_end_matches(".launch").to_string())
            .unwrap_or_else(|| "launch".to_string());

        let mut actions = Vec::with_capacity(self.args.len() + self.actions.len());
        for (arg_name, definition) in &self.args {
            let argument = argument(
                arg_name,
                definition.default.as_ref(),
                definition.description.as_ref(),
                &definition.choices,
            )?;
            actions.push(Action::from(argument));
        }
        for action in &self.actions {
            actions.push(convert_action(action)?);
        }

        let mut documents = IndexMap::new();
        for (doc_name, definition) in &self.documents {
            documents.insert(doc_name.clone(), convert_document(definition)?);
        }

        Ok(LaunchGraph {
            name,
            source: self.source,
            actions,
            documents,
        })
    }
}

fn parse_str(value: &str) -> Result<Substitution, LaunchFileError> {
    Substitution::parse(value).map_err(|source| LaunchFileError::Substitution {
        context: value.to_string(),
        source,
    })
}

fn condition(
    if_true: Option<&ValueDefinition>,
    unless: Option<&ValueDefinition>,
) -> Result<Option<Condition>, LaunchFileError> {
    Ok(Condition::from_parts(
        if_true.map(ValueDefinition::to_substitution).transpose()?,
        unless.map(ValueDefinition::to_substitution).transpose()?,
    ))
}

fn argument(
    name: &str,
    default: Option<&ArgValue>,
    description: Option<&String>,
    choices: &[ArgValue],
) -> Result<Argument, LaunchFileError> {
    let mut argument = Argument::new(name).with_choices(choices.iter().map(ArgValue::as_str));
    if let Some(default) = default {
        let default = default
            .to_substitution()
            .map_err(|source| LaunchFileError::Substitution {
                context: format!("default of argument '{}'", name),
                source,
            })?;
        argument = argument.with_default(default);
    }
    if let Some(description) = description {
        argument = argument.with_description(description.clone());
    }
    Ok(argument)
}

fn convert_map(
    values: &IndexMap<String, ValueDefinition>,
) -> Result<IndexMap<String, Substitution>, LaunchFileError> {
    values
        .iter()
        .map(|(key, value)| Ok((key.clone(), value.to_substitution()?)))
        .collect()
}

fn convert_action(definition: &ActionDefinition) -> Result<Action, LaunchFileError> {
    let action = match definition {
        ActionDefinition::DeclareArg {
            name,
            default,
            description,
            choices,
            if_true,
            unless,
        } => Action::DeclareArgument(DeclareArgument {
            argument: argument(name, default.as_ref(), description.as_ref(), choices)?,
            condition: condition(if_true.as_ref(), unless.as_ref())?,
        }),
        ActionDefinition::SetEnv {
            name,
            value,
            if_true,
            unless,
        } => Action::SetEnvironment(SetEnvironment {
            name: name.clone(),
            value: value.to_substitution()?,
            condition: condition(if_true.as_ref(), unless.as_ref())?,
        }),
        ActionDefinition::Spawn {
            name,
            cmd,
            env,
            cwd,
            blocking,
            critical,
            respawn,
            respawn_delay_ms,
            output,
            if_true,
            unless,
        } => Action::SpawnProcess(SpawnProcess {
            name: name.clone(),
            cmd: cmd
                .iter()
                .map(|part| {
                    part.to_substitution()
                        .map_err(|source| LaunchFileError::Substitution {
                            context: part.as_str(),
                            source,
                        })
                })
                .collect::<Result<_, _>>()?,
            env: convert_map(env)?,
            cwd: cwd.as_deref().map(parse_str).transpose()?,
            condition: condition(if_true.as_ref(), unless.as_ref())?,
            blocking: *blocking,
            critical: *critical,
            respawn: respawn
                .then(|| Duration::from_millis(respawn_delay_ms.unwrap_or_default())),
            output: *output,
        }),
        ActionDefinition::Include {
            file,
            args,
            mode,
            join,
            if_true,
            unless,
        } => Action::IncludeGraph(IncludeGraph {
            source: IncludeSource::File(parse_str(file)?),
            args: convert_map(args)?,
            condition: condition(if_true.as_ref(), unless.as_ref())?,
            mode: *mode,
            join: *join,
        }),
        ActionDefinition::Group {
            namespace,
            namespace_if,
            actions,
            if_true,
            unless,
        } => Action::Group(Group {
            actions: actions
                .iter()
                .map(convert_action)
                .collect::<Result<_, _>>()?,
            namespace: namespace
                .as_deref()
                .map(|ns| {
                    Ok::<_, LaunchFileError>(NamespacePush {
                        namespace: parse_str(ns)?,
                        condition: condition(namespace_if.as_ref(), None)?,
                    })
                })
                .transpose()?,
            condition: condition(if_true.as_ref(), unless.as_ref())?,
        }),
    };
    Ok(action)
}

fn convert_document(definition: &DocumentDefinition) -> Result<RewriteSpec, LaunchFileError> {
    let mut spec = RewriteSpec::new(parse_str(&definition.source)?)
        .with_convert_types(definition.convert_types);
    if let Some(root_key) = &definition.root_key {
        spec = spec.with_root_key(parse_str(root_key)?);
    }
    for (key, value) in &definition.rewrites {
        spec = spec.with_rewrite(key.clone(), value.to_substitution()?);
    }
    for replacement in &definition.replacements {
        spec = spec.with_replacement(
            replacement.token.clone(),
            replacement.value.to_substitution()?,
            condition(replacement.if_true.as_ref(), replacement.unless.as_ref())?,
        );
    }
    Ok(spec)
}

/// Errors that can occur when loading a launch file
#[derive(Debug, thiserror::Error)]
pub enum LaunchFileError {
    #[error("Failed to read launch file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse launch file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid substitution in '{context}': {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAZEBO_LAUNCH: &str = r#"
version: "1.0"
args:
  use_simulator:
    default: true
  headless:
    default: "False"
  world:
    default: "$(dirname)/worlds/test.world"
    description: Full path to world model file to load
documents:
  nav2_params:
    source: params/nav2_params.yaml
    root_key: "$(arg namespace)"
    convert_types: true
    rewrites:
      use_sim_time: "$(arg use_sim_time)"
    replacements:
      - token: "<robot_namespace>"
        value: "$(arg namespace)"
        if: "$(arg use_namespace)"
actions:
  - action: declare_arg
    name: use_sim_time
    default: "True"
  - action: declare_arg
    name: namespace
    default: ""
  - action: declare_arg
    name: use_namespace
    default: false
  - action: spawn
    name: gzserver
    cmd: [gzserver, -s, libgazebo_ros_init.so, "$(arg world)"]
    if: "$(arg use_simulator)"
  - action: spawn
    name: gzclient
    cmd: [gzclient]
    if:
      all: ["$(arg use_simulator)", { not: "$(arg headless)" }]
  - action: group
    namespace: "$(arg namespace)"
    namespace_if: "$(arg use_namespace)"
    actions:
      - action: set_env
        name: RCUTILS_LOGGING_BUFFERED_STREAM
        value: "1"
      - action: include
        file: rsp.launch.yaml
        args:
          use_sim_time: "$(arg use_sim_time)"
"#;

    #[test]
    fn test_parse_launch_file() {
        let launch_file = LaunchFile::from_yaml(GAZEBO_LAUNCH).unwrap();
        assert_eq!(launch_file.args.len(), 3);
        assert_eq!(launch_file.documents.len(), 1);
        assert_eq!(launch_file.actions.len(), 6);
        assert!(matches!(
            launch_file.actions[5],
            ActionDefinition::Group { ref actions, .. } if actions.len() == 2
        ));
    }

    #[test]
    fn test_into_graph_prepends_arguments() {
        let graph = LaunchFile::from_yaml(GAZEBO_LAUNCH)
            .unwrap()
            .into_graph()
            .unwrap();

        assert_eq!(graph.name, "launch");
        assert_eq!(graph.actions.len(), 9);
        let names: Vec<_> = graph
            .declared_arguments()
            .iter()
            .map(|a| a.name.clone())
            .collect();
        assert_eq!(
            names,
            vec!["use_simulator", "headless", "world", "use_sim_time", "namespace", "use_namespace"]
        );
        graph.validate().unwrap();

        let Action::SpawnProcess(gzclient) = &graph.actions[7] else {
            panic!("expected spawn");
        };
        let expected = Condition::if_true(Substitution::and(vec![
            Substitution::arg("use_simulator"),
            Substitution::not(Substitution::arg("headless")),
        ]));
        assert_eq!(gzclient.condition.as_ref(), Some(&expected));
    }

    #[test]
    fn test_typed_defaults_become_literals() {
        let graph = LaunchFile::from_yaml(GAZEBO_LAUNCH)
            .unwrap()
            .into_graph()
            .unwrap();
        let use_simulator = graph.declared_arguments()[0].clone();
        assert_eq!(use_simulator.default, Some(Substitution::literal("true")));
    }

    #[test]
    fn test_arg_value_parsing() {
        assert!(matches!(ArgValue::parse("true"), ArgValue::Bool(true)));
        assert!(matches!(ArgValue::parse("False"), ArgValue::Bool(false)));
        assert!(matches!(ArgValue::parse("42"), ArgValue::Int(42)));
        assert!(matches!(ArgValue::parse("3.14"), ArgValue::Float(_)));
        assert!(matches!(ArgValue::parse("hello"), ArgValue::String(_)));
    }

    #[test]
    fn test_validation_empty_cmd() {
        let yaml = r#"
actions:
  - action: spawn
    name: bad
    cmd: []
"#;
        assert!(matches!(
            LaunchFile::from_yaml(yaml),
            Err(LaunchFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_join_requires_background() {
        let yaml = r#"
actions:
  - action: include
    file: other.launch.yaml
    join: true
"#;
        assert!(matches!(
            LaunchFile::from_yaml(yaml),
            Err(LaunchFileError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let yaml = r#"
actions:
  - action: teleport
    name: r2
"#;
        assert!(matches!(
            LaunchFile::from_yaml(yaml),
            Err(LaunchFileError::Parse(_))
        ));
    }

    #[test]
    fn test_equals_arity() {
        let yaml = r#"
actions:
  - action: spawn
    cmd: [rviz2]
    if:
      equals: ["a"]
"#;
        let err = LaunchFile::from_yaml(yaml).unwrap().into_graph().unwrap_err();
        assert!(matches!(err, LaunchFileError::Validation(_)));
    }

    #[test]
    fn test_bad_substitution_reported_with_context() {
        let yaml = r#"
actions:
  - action: spawn
    cmd: ["$(bogus x)"]
"#;
        let err = LaunchFile::from_yaml(yaml).unwrap().into_graph().unwrap_err();
        assert!(matches!(err, LaunchFileError::Substitution { .. }));
    }
}
