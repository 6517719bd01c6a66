//! Substitution engine: lazy `$(arg)`, `$(env)`, `$(command)` ... expressions
//!
//! Strings from launch files are parsed once into a [`Substitution`] tree and
//! only evaluated when the executor reaches the action that uses them.

use crate::config::rewrite::{DocumentRewriter, DocumentTable, RewriteError};
use crate::config::store::{ConfigStore, StoreError};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Regex for matching substitution patterns: $(type value)
static SUBSTITUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\(([\w-]+)\s+([^)]+)\)|\$\(([\w-]+)\)").unwrap());

/// A lazily evaluated expression producing a string
#[derive(Debug, Clone, PartialEq)]
pub enum Substitution {
    /// Plain text
    Literal(String),
    /// Value of a declared launch argument
    Arg(String),
    /// Environment variable, optionally with a fallback
    Env {
        name: String,
        default: Option<String>,
    },
    /// Standard output of an external command (the only leaf with side effects)
    Command(Box<Substitution>),
    /// Namespace of the enclosing scope
    Namespace,
    /// Directory of the launch file being executed
    Dirname,
    /// Directory of a package found on the search path
    Find(String),
    /// Path of a rewritten document declared in the launch file
    Document(String),
    /// Local time, formatted with a chrono format string
    Timestamp(String),
    /// Local date, formatted with a chrono format string
    Date(String),
    /// Concatenation of parts
    Concat(Vec<Substitution>),
    /// Boolean and; stops at the first false operand
    And(Vec<Substitution>),
    /// Boolean or; stops at the first true operand
    Or(Vec<Substitution>),
    /// Boolean negation
    Not(Box<Substitution>),
    /// String equality (boolean tokens compare by truth value)
    Equals(Box<Substitution>, Box<Substitution>),
}

impl From<&str> for Substitution {
    fn from(value: &str) -> Self {
        Substitution::Literal(value.to_string())
    }
}

impl From<String> for Substitution {
    fn from(value: String) -> Self {
        Substitution::Literal(value)
    }
}

impl Substitution {
    pub fn literal(value: impl Into<String>) -> Self {
        Substitution::Literal(value.into())
    }

    pub fn arg(name: impl Into<String>) -> Self {
        Substitution::Arg(name.into())
    }

    pub fn env(name: impl Into<String>) -> Self {
        Substitution::Env {
            name: name.into(),
            default: None,
        }
    }

    pub fn command(line: impl Into<Substitution>) -> Self {
        Substitution::Command(Box::new(line.into()))
    }

    pub fn and(operands: Vec<Substitution>) -> Self {
        Substitution::And(operands)
    }

    pub fn or(operands: Vec<Substitution>) -> Self {
        Substitution::Or(operands)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(operand: impl Into<Substitution>) -> Self {
        Substitution::Not(Box::new(operand.into()))
    }

    pub fn equals(left: impl Into<Substitution>, right: impl Into<Substitution>) -> Self {
        Substitution::Equals(Box::new(left.into()), Box::new(right.into()))
    }

    /// Parse a launch-file string such as `"$(arg pkg)/maps/$(arg map)"`
    pub fn parse(input: &str) -> Result<Self, SubstitutionError> {
        let mut parts = Vec::new();
        let mut last = 0;

        for caps in SUBSTITUTION_PATTERN.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                parts.push(Substitution::Literal(input[last..whole.start()].to_string()));
            }
            parts.push(Self::parse_capture(&caps)?);
            last = whole.end();
        }

        if last < input.len() {
            parts.push(Substitution::Literal(input[last..].to_string()));
        }

        Ok(match parts.len() {
            0 => Substitution::Literal(String::new()),
            1 => parts.remove(0),
            _ => Substitution::Concat(parts),
        })
    }

    /// Turn a single capture group into a leaf
    fn parse_capture(caps: &Captures) -> Result<Self, SubstitutionError> {
        // Pattern 1: $(type value) - e.g., $(arg world)
        if let (Some(kind), Some(value)) = (caps.get(1), caps.get(2)) {
            return Self::leaf(kind.as_str(), value.as_str().trim());
        }

        // Pattern 2: $(type) - e.g., $(namespace)
        if let Some(kind) = caps.get(3) {
            return Self::leaf(kind.as_str(), "");
        }

        Err(SubstitutionError::InvalidPattern(
            caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
        ))
    }

    fn leaf(kind: &str, value: &str) -> Result<Self, SubstitutionError> {
        let required = |what: &str| {
            if value.is_empty() {
                Err(SubstitutionError::InvalidPattern(format!(
                    "$({}) requires {}",
                    kind, what
                )))
            } else {
                Ok(value.to_string())
            }
        };

        match kind {
            "arg" => Ok(Substitution::Arg(required("an argument name")?)),
            "env" | "optenv" => {
                let spec = required("a variable name")?;
                let (name, default) = match spec.split_once(char::is_whitespace) {
                    Some((name, rest)) => (name.to_string(), Some(rest.trim().to_string())),
                    None => (spec, None),
                };
                let default = match kind {
                    "optenv" => Some(default.unwrap_or_default()),
                    _ => default,
                };
                Ok(Substitution::Env { name, default })
            }
            "command" => Ok(Substitution::command(required("a command line")?)),
            "namespace" => Ok(Substitution::Namespace),
            "dirname" => Ok(Substitution::Dirname),
            "find" => Ok(Substitution::Find(required("a package name")?)),
            "document" => Ok(Substitution::Document(required("a document name")?)),
            "timestamp" => Ok(Substitution::Timestamp(value.to_string())),
            "date" => Ok(Substitution::Date(value.to_string())),
            _ => Err(SubstitutionError::UnknownType(kind.to_string())),
        }
    }

    /// Evaluate to a string against the current scope
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<String, SubstitutionError> {
        match self {
            Substitution::Literal(text) => Ok(text.clone()),
            Substitution::Arg(name) => ctx.store.resolve(name, ctx),
            Substitution::Env { name, default } => ctx
                .lookup_env(name)
                .or_else(|| default.clone())
                .ok_or_else(|| SubstitutionError::UndefinedEnv(name.clone())),
            Substitution::Command(line) => {
                let line = line.evaluate(ctx)?;
                let argv = shlex::split(&line)
                    .ok_or_else(|| SubstitutionError::InvalidPattern(line.clone()))?;
                ctx.runner.run(&argv, ctx.env.unwrap_or(&*EMPTY_ENV))
            }
            Substitution::Namespace => Ok(ctx.namespace.to_string()),
            Substitution::Dirname => ctx
                .base_dir
                .map(|dir| dir.to_string_lossy().into_owned())
                .ok_or(SubstitutionError::NoLaunchFileDir),
            Substitution::Find(package) => ctx
                .find_package(package)
                .map(|dir| dir.to_string_lossy().into_owned()),
            Substitution::Document(name) => {
                let (table, rewriter) = ctx
                    .documents
                    .ok_or_else(|| SubstitutionError::UnknownDocument(name.clone()))?;
                table
                    .resolve(name, rewriter, ctx)
                    .map(|path| path.to_string_lossy().into_owned())
            }
            Substitution::Timestamp(format) => Ok(format_now(format, "%Y%m%d_%H%M%S")),
            Substitution::Date(format) => Ok(format_now(format, "%Y-%m-%d")),
            Substitution::Concat(parts) => parts.iter().map(|part| part.evaluate(ctx)).collect(),
            Substitution::And(operands) => {
                for operand in operands {
                    if !operand.evaluate_bool(ctx)? {
                        return Ok(bool_token(false));
                    }
                }
                Ok(bool_token(true))
            }
            Substitution::Or(operands) => {
                for operand in operands {
                    if operand.evaluate_bool(ctx)? {
                        return Ok(bool_token(true));
                    }
                }
                Ok(bool_token(false))
            }
            Substitution::Not(operand) => Ok(bool_token(!operand.evaluate_bool(ctx)?)),
            Substitution::Equals(left, right) => {
                let left = left.evaluate(ctx)?;
                let right = right.evaluate(ctx)?;
                let equal = match (parse_bool(&left), parse_bool(&right)) {
                    (Ok(l), Ok(r)) => l == r,
                    _ => left == right,
                };
                Ok(bool_token(equal))
            }
        }
    }

    /// Evaluate and interpret the result as a boolean token
    pub fn evaluate_bool(&self, ctx: &EvalContext<'_>) -> Result<bool, SubstitutionError> {
        parse_bool(&self.evaluate(ctx)?)
    }

    /// Collect every argument name this expression reads
    pub fn arg_references(&self, out: &mut Vec<String>) {
        match self {
            Substitution::Arg(name) => out.push(name.clone()),
            Substitution::Command(inner) | Substitution::Not(inner) => inner.arg_references(out),
            Substitution::Concat(parts) | Substitution::And(parts) | Substitution::Or(parts) => {
                parts.iter().for_each(|part| part.arg_references(out))
            }
            Substitution::Equals(left, right) => {
                left.arg_references(out);
                right.arg_references(out);
            }
            _ => {}
        }
    }

    /// Collect every `$(document ...)` name this expression reads
    pub fn document_references(&self, out: &mut Vec<String>) {
        match self {
            Substitution::Document(name) => out.push(name.clone()),
            Substitution::Command(inner) | Substitution::Not(inner) => inner.document_references(out),
            Substitution::Concat(parts) | Substitution::And(parts) | Substitution::Or(parts) => {
                parts.iter().for_each(|part| part.document_references(out))
            }
            Substitution::Equals(left, right) => {
                left.document_references(out);
                right.document_references(out);
            }
            _ => {}
        }
    }
}

fn format_now(format: &str, fallback: &str) -> String {
    let now = chrono::Local::now();
    if format.is_empty() {
        now.format(fallback).to_string()
    } else {
        now.format(format).to_string()
    }
}

fn bool_token(value: bool) -> String {
    value.to_string()
}

/// Interpret a string as a boolean token.
///
/// `true|1|yes|on` and `false|0|no|off|""` (any case); anything else is an error.
pub fn parse_bool(value: &str) -> Result<bool, SubstitutionError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(SubstitutionError::InvalidBoolean(value.to_string())),
    }
}

static EMPTY_ENV: LazyLock<IndexMap<String, String>> = LazyLock::new(IndexMap::new);

/// Everything a substitution may read while being evaluated
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    /// Arguments visible from the current scope
    pub store: &'a ConfigStore,
    /// Environment overlay of the current scope
    pub env: Option<&'a IndexMap<String, String>>,
    /// Current namespace ("" at the top level)
    pub namespace: &'a str,
    /// Directory of the launch file being executed
    pub base_dir: Option<&'a Path>,
    /// Roots searched by `$(find ...)`
    pub search_paths: &'a [PathBuf],
    /// Runs `$(command ...)` leaves
    pub runner: &'a dyn CommandRunner,
    /// Named documents of the current graph and the rewriter that materializes them
    pub documents: Option<(&'a DocumentTable, &'a DocumentRewriter)>,
}

impl<'a> EvalContext<'a> {
    /// Context with nothing but a store; commands go through the shell runner
    pub fn new(store: &'a ConfigStore) -> Self {
        Self {
            store,
            env: None,
            namespace: "",
            base_dir: None,
            search_paths: &[],
            runner: &ShellCommandRunner,
            documents: None,
        }
    }

    pub fn with_env(mut self, env: &'a IndexMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_namespace(mut self, namespace: &'a str) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_base_dir(mut self, base_dir: Option<&'a Path>) -> Self {
        self.base_dir = base_dir;
        self
    }

    pub fn with_search_paths(mut self, search_paths: &'a [PathBuf]) -> Self {
        self.search_paths = search_paths;
        self
    }

    pub fn with_runner(mut self, runner: &'a dyn CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_documents(mut self, table: &'a DocumentTable, rewriter: &'a DocumentRewriter) -> Self {
        self.documents = Some((table, rewriter));
        self
    }

    /// Look up an environment variable: scope overlay first, then the process
    fn lookup_env(&self, name: &str) -> Option<String> {
        if let Some(value) = self.env.and_then(|env| env.get(name)) {
            return Some(value.clone());
        }
        std::env::var(name).ok()
    }

    fn find_package(&self, package: &str) -> Result<PathBuf, SubstitutionError> {
        self.search_paths
            .iter()
            .map(|root| root.join(package))
            .find(|candidate| candidate.is_dir())
            .ok_or_else(|| SubstitutionError::PackageNotFound(package.to_string()))
    }

    /// Resolve a possibly relative path against the launch file directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        match self.base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }
}

/// Runs the external commands behind `$(command ...)`
///
/// Runs synchronously; the executor calls it from `block_in_place` on a
/// multi-threaded runtime
pub trait CommandRunner: Send + Sync {
    /// Run `argv` with `env` layered over the inherited environment and return stdout
    fn run(&self, argv: &[String], env: &IndexMap<String, String>)
        -> Result<String, SubstitutionError>;
}

/// Default runner: spawns the command and captures its standard output
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run(
        &self,
        argv: &[String],
        env: &IndexMap<String, String>,
    ) -> Result<String, SubstitutionError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SubstitutionError::InvalidPattern("$(command) with empty command".into()));
        };
        let command = argv.join(" ");

        log::debug!("Running substitution command: {}", command);
        let output = std::process::Command::new(program)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|source| SubstitutionError::CommandSpawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SubstitutionError::ExecutionFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim_end_matches(['\n', '\r']).to_string())
    }
}

/// Retry wrapper around another runner.
///
/// The resolver never retries on its own; callers opt in by wrapping.
#[derive(Debug, Clone)]
pub struct RetryingRunner<R> {
    inner: R,
    attempts: u32,
    delay: Duration,
}

impl<R: CommandRunner> RetryingRunner<R> {
    pub fn new(inner: R, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl<R: CommandRunner> CommandRunner for RetryingRunner<R> {
    fn run(
        &self,
        argv: &[String],
        env: &IndexMap<String, String>,
    ) -> Result<String, SubstitutionError> {
        let mut attempt = 1;
        loop {
            match self.inner.run(argv, env) {
                Ok(output) => return Ok(output),
                Err(e) if attempt < self.attempts && e.is_command_failure() => {
                    log::warn!(
                        "Command '{}' failed (attempt {}/{}): {}",
                        argv.join(" "),
                        attempt,
                        self.attempts,
                        e
                    );
                    attempt += 1;
                    std::thread::sleep(self.delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Invalid substitution pattern: {0}")]
    InvalidPattern(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Expected a boolean, got '{0}'")]
    InvalidBoolean(String),

    #[error("Failed to run command '{command}': {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' exited with code {code:?}: {stderr}")]
    ExecutionFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command '{0}' is not run outside of a walk")]
    CommandDeferred(String),

    #[error("$(dirname) used outside of a launch file")]
    NoLaunchFileDir,

    #[error("Package '{0}' not found on the search path")]
    PackageNotFound(String),

    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    #[error("Failed to rewrite document '{name}': {source}")]
    Document {
        name: String,
        #[source]
        source: Box<RewriteError>,
    },
}

impl SubstitutionError {
    /// Whether this came from an external command leaf
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self,
            SubstitutionError::CommandSpawn { .. } | SubstitutionError::ExecutionFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::Argument;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runner that counts invocations and echoes its arguments
    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    impl CommandRunner for CountingRunner {
        fn run(
            &self,
            argv: &[String],
            _env: &IndexMap<String, String>,
        ) -> Result<String, SubstitutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(argv[1..].join(" "))
        }
    }

    /// Fails `failures` times before succeeding
    struct FlakyRunner {
        failures: AtomicUsize,
    }

    impl CommandRunner for FlakyRunner {
        fn run(
            &self,
            _argv: &[String],
            _env: &IndexMap<String, String>,
        ) -> Result<String, SubstitutionError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SubstitutionError::ExecutionFailed {
                    command: "flaky".into(),
                    code: Some(1),
                    stderr: String::new(),
                });
            }
            Ok("ok".into())
        }
    }

    fn store_with(args: &[(&str, &str)]) -> ConfigStore {
        let store = ConfigStore::new();
        for (name, default) in args {
            store
                .declare(Argument::new(*name).with_default(*default))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_arg_substitution() {
        let store = store_with(&[("config", "my_config.yaml")]);
        let ctx = EvalContext::new(&store);

        let subst = Substitution::parse("$(arg config)").unwrap();
        assert_eq!(subst, Substitution::arg("config"));
        assert_eq!(subst.evaluate(&ctx).unwrap(), "my_config.yaml");
    }

    #[test]
    fn test_env_substitution_prefers_overlay() {
        let store = ConfigStore::new();
        let mut env = IndexMap::new();
        env.insert("MOBO_TEST_VAR".to_string(), "my_value".to_string());
        let ctx = EvalContext::new(&store).with_env(&env);

        let result = Substitution::parse("$(env MOBO_TEST_VAR)")
            .unwrap()
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(result, "my_value");
    }

    #[test]
    fn test_optenv_default() {
        let store = ConfigStore::new();
        let ctx = EvalContext::new(&store);

        let with_default = Substitution::parse("$(optenv MOBO_SURELY_UNSET_VAR fallback)").unwrap();
        assert_eq!(with_default.evaluate(&ctx).unwrap(), "fallback");

        let empty = Substitution::parse("$(optenv MOBO_SURELY_UNSET_VAR)").unwrap();
        assert_eq!(empty.evaluate(&ctx).unwrap(), "");

        let strict = Substitution::parse("$(env MOBO_SURELY_UNSET_VAR)").unwrap();
        assert!(matches!(
            strict.evaluate(&ctx),
            Err(SubstitutionError::UndefinedEnv(_))
        ));
    }

    #[test]
    fn test_mixed_text_and_substitutions() {
        let store = store_with(&[("prefix", "data"), ("suffix", "log")]);
        let ctx = EvalContext::new(&store);

        let subst = Substitution::parse("$(arg prefix)_$(timestamp)_$(arg suffix)").unwrap();
        let result = subst.evaluate(&ctx).unwrap();
        assert!(result.starts_with("data_"));
        assert!(result.ends_with("_log"));
    }

    #[test]
    fn test_unknown_type_and_missing_value() {
        assert!(matches!(
            Substitution::parse("$(bogus thing)"),
            Err(SubstitutionError::UnknownType(_))
        ));
        assert!(matches!(
            Substitution::parse("$(arg)"),
            Err(SubstitutionError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_no_substitution_needed() {
        let subst = Substitution::parse("plain string").unwrap();
        assert_eq!(subst, Substitution::literal("plain string"));
    }

    #[test]
    fn test_and_short_circuits() {
        let store = store_with(&[("use_simulator", "false")]);
        let runner = CountingRunner::default();
        let ctx = EvalContext::new(&store).with_runner(&runner);

        let expr = Substitution::and(vec![
            Substitution::arg("use_simulator"),
            Substitution::command("echo true"),
        ]);
        assert!(!expr.evaluate_bool(&ctx).unwrap());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        let expr = Substitution::or(vec![
            Substitution::not(Substitution::arg("use_simulator")),
            Substitution::command("echo false"),
        ]);
        assert!(expr.evaluate_bool(&ctx).unwrap());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_and_evaluates_second_operand_when_first_true() {
        let store = store_with(&[("use_simulator", "True")]);
        let runner = CountingRunner::default();
        let ctx = EvalContext::new(&store).with_runner(&runner);

        let expr = Substitution::and(vec![
            Substitution::arg("use_simulator"),
            Substitution::command("echo yes"),
        ]);
        assert!(expr.evaluate_bool(&ctx).unwrap());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_equals_normalizes_booleans() {
        let store = store_with(&[("headless", "False")]);
        let ctx = EvalContext::new(&store);

        assert!(Substitution::equals(Substitution::arg("headless"), "false")
            .evaluate_bool(&ctx)
            .unwrap());
        assert!(!Substitution::equals("r1", "r2").evaluate_bool(&ctx).unwrap());
    }

    #[test]
    fn test_invalid_boolean() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("").unwrap());
        assert!(matches!(
            parse_bool("maybe"),
            Err(SubstitutionError::InvalidBoolean(_))
        ));
    }

    #[test]
    fn test_namespace_and_dirname() {
        let store = ConfigStore::new();
        let dir = PathBuf::from("/opt/mobo/launch");
        let ctx = EvalContext::new(&store)
            .with_namespace("/r2")
            .with_base_dir(Some(&dir));

        let subst = Substitution::parse("$(dirname)/params.yaml:$(namespace)").unwrap();
        assert_eq!(subst.evaluate(&ctx).unwrap(), "/opt/mobo/launch/params.yaml:/r2");

        let no_dir = EvalContext::new(&store);
        assert!(matches!(
            Substitution::Dirname.evaluate(&no_dir),
            Err(SubstitutionError::NoLaunchFileDir)
        ));
    }

    #[test]
    fn test_find_package_on_search_path() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("mobo_bot_nav2d")).unwrap();
        let paths = vec![root.path().to_path_buf()];
        let store = ConfigStore::new();
        let ctx = EvalContext::new(&store).with_search_paths(&paths);

        let found = Substitution::parse("$(find mobo_bot_nav2d)")
            .unwrap()
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(PathBuf::from(found), root.path().join("mobo_bot_nav2d"));

        assert!(matches!(
            Substitution::Find("missing".into()).evaluate(&ctx),
            Err(SubstitutionError::PackageNotFound(_))
        ));
    }

    #[test]
    fn test_arg_references() {
        let subst = Substitution::and(vec![
            Substitution::parse("$(arg use_simulator)").unwrap(),
            Substitution::not(Substitution::parse("x$(arg headless)").unwrap()),
        ]);
        let mut refs = Vec::new();
        subst.arg_references(&mut refs);
        assert_eq!(refs, vec!["use_simulator".to_string(), "headless".to_string()]);
    }

    #[test]
    fn test_retrying_runner() {
        let runner = RetryingRunner::new(
            FlakyRunner {
                failures: AtomicUsize::new(2),
            },
            3,
            Duration::from_millis(1),
        );
        let argv = vec!["flaky".to_string()];
        assert_eq!(runner.run(&argv, &IndexMap::new()).unwrap(), "ok");

        let runner = RetryingRunner::new(
            FlakyRunner {
                failures: AtomicUsize::new(5),
            },
            2,
            Duration::from_millis(1),
        );
        assert!(runner.run(&argv, &IndexMap::new()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_substitution() {
        let store = ConfigStore::new();
        let ctx = EvalContext::new(&store);

        let out = Substitution::parse("$(command echo hello)")
            .unwrap()
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(out, "hello");

        let failed = Substitution::parse("$(command false)").unwrap().evaluate(&ctx);
        assert!(matches!(
            failed,
            Err(SubstitutionError::ExecutionFailed { code: Some(1), .. })
        ));
    }
}
