//! Launch executor - walks the action graph, spawns processes and shuts down

use crate::config::{
    should_run, CommandRunner, EvalContext, LaunchFileError, ShellCommandRunner, StoreError,
    SubstitutionError, DocumentRewriter, RewriteError,
};
use crate::runtime::graph::{
    Action, Group, IncludeGraph, IncludeMode, IncludeSource, LaunchGraph, SpawnProcess,
};
use crate::runtime::process::{ExitStatus, ProcessConfig, ProcessError, ProcessEvent, ProcessHandle, ProcessMessage};
use crate::runtime::scope::{join_namespace, Scope};
use crate::runtime::state::{ActionRecord, ActionState, ExecutionReport, TransitionError};
use crate::runtime::supervisor::ProcessSupervisor;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Environment variable holding extra `$(find ...)` roots
pub const SEARCH_PATH_ENV: &str = "MOBO_LAUNCH_PATH";

/// Launch executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Time a process gets between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// Leave rewritten documents on disk after the run
    pub keep_temp_files: bool,
    /// Directory for rewritten documents (system default if unset)
    pub temp_dir: Option<PathBuf>,
    /// Roots searched by `$(find ...)`
    pub search_paths: Vec<PathBuf>,
    /// Working directory of processes that do not set their own
    pub working_dir: Option<PathBuf>,
    /// Maximum include nesting
    pub max_include_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            keep_temp_files: false,
            temp_dir: None,
            search_paths: std::env::var_os(SEARCH_PATH_ENV)
                .map(|paths| std::env::split_paths(&paths).collect())
                .unwrap_or_default(),
            working_dir: None,
            max_include_depth: 32,
        }
    }
}

/// A sub-walk started by a background include
struct BackgroundWalk {
    label: String,
    join: bool,
    task: JoinHandle<Result<(), ExecutorError>>,
}

/// State shared by the control task and background sub-walks
struct Shared {
    config: ExecutorConfig,
    supervisor: ProcessSupervisor,
    rewriter: DocumentRewriter,
    runner: Arc<dyn CommandRunner>,
    abort: watch::Sender<bool>,
    abort_reason: Mutex<Option<String>>,
    report: Mutex<ExecutionReport>,
    background: Mutex<Vec<BackgroundWalk>>,
    /// Set in dry-run mode: spawns are recorded here instead of started
    plan: Option<Mutex<Vec<LaunchPlanNode>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(
        config: ExecutorConfig,
        runner: Arc<dyn CommandRunner>,
        dry_run: bool,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessMessage>) {
        let (supervisor, events) = ProcessSupervisor::new();
        let rewriter = DocumentRewriter::new(config.temp_dir.clone(), config.keep_temp_files);
        let (abort, _) = watch::channel(false);
        let shared = Self {
            config,
            supervisor,
            rewriter,
            runner,
            abort,
            abort_reason: Mutex::new(None),
            report: Mutex::new(ExecutionReport::default()),
            background: Mutex::new(Vec::new()),
            plan: dry_run.then(|| Mutex::new(Vec::new())),
        };
        (shared, events)
    }

    fn context<'a>(&'a self, scope: &'a Scope) -> EvalContext<'a> {
        scope.eval_context(&self.config.search_paths, self.runner.as_ref(), &self.rewriter)
    }

    fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Stop the execution; the first reason wins
    fn abort(&self, reason: impl Into<String>) {
        let mut current = lock(&self.abort_reason);
        if current.is_none() {
            let reason = reason.into();
            log::error!("Aborting launch: {}", reason);
            *current = Some(reason);
        }
        self.abort.send_replace(true);
    }

    fn aborted_error(&self) -> ExecutorError {
        ExecutorError::Aborted(
            lock(&self.abort_reason)
                .clone()
                .unwrap_or_else(|| "shutdown requested".to_string()),
        )
    }

    fn record(&self, record: ActionRecord) -> usize {
        lock(&self.report).push(record)
    }

    fn transition(&self, index: usize, state: ActionState) -> Result<(), TransitionError> {
        match lock(&self.report).actions.get_mut(index) {
            Some(record) => record.transition(state),
            None => Ok(()),
        }
    }

    fn set_handle(&self, index: usize, handle: &ProcessHandle) {
        if let Some(record) = lock(&self.report).actions.get_mut(index) {
            record.handle = Some(handle.id);
        }
    }
}

/// Resolves once the abort flag is raised
async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Launch executor state
pub struct Executor {
    graph: Arc<LaunchGraph>,
    overrides: IndexMap<String, String>,
    shared: Arc<Shared>,
    events: Option<mpsc::UnboundedReceiver<ProcessMessage>>,
    forwarder: Option<JoinHandle<()>>,
    root: Option<Scope>,
}

/// Launch plan for dry-run mode
#[derive(Debug, Clone, Serialize)]
pub struct LaunchPlan {
    /// Processes in launch order
    pub nodes: Vec<LaunchPlanNode>,
    /// Resolved top-level arguments
    pub args: IndexMap<String, String>,
    /// Rewritten documents
    pub documents: Vec<PathBuf>,
}

/// A process in the launch plan
#[derive(Debug, Clone, Serialize)]
pub struct LaunchPlanNode {
    pub name: String,
    /// Graph the spawn belongs to
    pub scope: String,
    pub namespace: String,
    pub executable: String,
    pub args: Vec<String>,
    pub env: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub blocking: bool,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub respawn_delay_ms: Option<u64>,
}

impl Executor {
    /// Create a new executor; `$(command ...)` leaves run through the shell runner
    pub fn new(
        graph: LaunchGraph,
        config: ExecutorConfig,
        overrides: IndexMap<String, String>,
    ) -> Result<Self, ExecutorError> {
        Self::with_runner(graph, config, overrides, Arc::new(ShellCommandRunner))
    }

    /// Create a new executor with a custom command runner
    pub fn with_runner(
        graph: LaunchGraph,
        config: ExecutorConfig,
        overrides: IndexMap<String, String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ExecutorError> {
        graph.validate()?;

        let declared: HashSet<&str> = graph
            .declared_arguments()
            .into_iter()
            .map(|a| a.name.as_str())
            .collect();
        if let Some(unknown) = overrides.keys().find(|name| !declared.contains(name.as_str())) {
            return Err(ExecutorError::UnknownArgument(unknown.clone()));
        }

        let (shared, events) = Shared::new(config, runner, false);
        Ok(Self {
            graph: Arc::new(graph),
            overrides,
            shared: Arc::new(shared),
            events: Some(events),
            forwarder: None,
            root: None,
        })
    }

    pub fn graph(&self) -> &LaunchGraph {
        &self.graph
    }

    fn root_scope(&self) -> Scope {
        Scope::root(
            self.graph.name.clone(),
            self.overrides.clone(),
            self.graph.base_dir(),
            self.graph.documents.clone(),
        )
    }

    /// Walk the graph without spawning anything
    pub async fn plan(&self) -> Result<LaunchPlan, ExecutorError> {
        let (shared, _events) = Shared::new(
            self.shared.config.clone(),
            Arc::clone(&self.shared.runner),
            true,
        );
        let shared = Arc::new(shared);

        let mut root = self.root_scope();
        let result = match check_documents(&shared, &root, &self.graph) {
            Ok(()) => walk(&shared, &mut root, &self.graph.actions).await,
            Err(e) => Err(e),
        };
        let documents = shared.rewriter.artifacts();
        shared.rewriter.cleanup();
        result?;

        let ctx = shared.context(&root);
        let mut args = IndexMap::new();
        for argument in root.store.arguments() {
            let value = blocking(|| root.store.resolve(&argument.name, &ctx))
                .map_err(subst_error(format!("argument '{}'", argument.name)))?;
            args.insert(argument.name, value);
        }

        let nodes = shared
            .plan
            .as_ref()
            .map(|nodes| lock(nodes).clone())
            .unwrap_or_default();

        Ok(LaunchPlan {
            nodes,
            args,
            documents,
        })
    }

    /// Walk the graph, starting processes as they are reached.
    ///
    /// On error every process started so far is terminated.
    pub async fn launch(&mut self, shutdown_rx: watch::Receiver<()>) -> Result<(), ExecutorError> {
        if let Some(events) = self.events.take() {
            self.forwarder = Some(tokio::spawn(forward_events(
                Arc::clone(&self.shared),
                events,
            )));
        }

        let watcher = {
            let shared = Arc::clone(&self.shared);
            let mut shutdown_rx = shutdown_rx;
            tokio::spawn(async move {
                if shutdown_rx.changed().await.is_ok() {
                    shared.abort("shutdown requested");
                }
            })
        };

        log::info!("Launching '{}'...", self.graph.name);
        let mut root = self.root_scope();
        let mut result = check_documents(&self.shared, &root, &self.graph);
        if result.is_ok() {
            result = walk(&self.shared, &mut root, &self.graph.actions).await;
        }
        if result.is_ok() {
            result = join_background(&self.shared).await;
        }
        if result.is_ok() && self.shared.is_aborted() {
            result = Err(self.shared.aborted_error());
        }
        watcher.abort();
        self.root = Some(root);

        match result {
            Ok(()) => {
                log::info!(
                    "Launch complete: {} process(es) running",
                    self.shared.supervisor.running().len()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Launch failed: {}", e);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    /// Wait for a shutdown signal, a fatal failure, or every process to stop
    pub async fn wait(&mut self, mut shutdown_rx: watch::Receiver<()>) -> Result<(), ExecutorError> {
        let mut abort = self.shared.abort.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::info!("Shutdown signal received");
                    return Ok(());
                }

                _ = wait_for_abort(&mut abort) => {
                    return Err(self.shared.aborted_error());
                }

                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let idle = lock(&self.shared.background).iter().all(|b| b.task.is_finished());
                    if idle && self.shared.supervisor.running().is_empty() {
                        log::info!("All processes have stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop background walks, terminate every process and remove temp files
    pub async fn shutdown(&mut self) {
        log::info!("Shutting down...");
        self.shared.abort.send_replace(true);

        let background: Vec<BackgroundWalk> = lock(&self.shared.background).drain(..).collect();
        for walk in background {
            walk.task.abort();
            let _ = walk.task.await;
        }

        self.shared
            .supervisor
            .shutdown(self.shared.config.grace_period)
            .await;
        self.shared.rewriter.cleanup();

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        log::info!("All processes shut down");
    }

    /// Launch, wait, then shut down
    pub async fn run(&mut self, shutdown_rx: watch::Receiver<()>) -> Result<(), ExecutorError> {
        self.launch(shutdown_rx.clone()).await?;
        let result = self.wait(shutdown_rx).await;
        self.shutdown().await;
        result
    }

    /// Every process handle created so far
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.shared.supervisor.handles()
    }

    /// Process status summary
    pub fn status(&self) -> Vec<(String, ExitStatus)> {
        self.handles()
            .into_iter()
            .map(|h| {
                let status = h.status();
                (h.name, status)
            })
            .collect()
    }

    /// Record of every action attempt so far
    pub fn report(&self) -> ExecutionReport {
        lock(&self.shared.report).clone()
    }

    /// Top-level argument values fixed by the last launch
    pub fn resolved_arguments(&self) -> IndexMap<String, String> {
        self.root
            .as_ref()
            .map(|root| root.store.resolved_values())
            .unwrap_or_default()
    }

    /// Rewritten documents currently on disk
    pub fn documents(&self) -> Vec<PathBuf> {
        self.shared.rewriter.artifacts()
    }
}

/// Log process events; a critical process failing outside shutdown aborts the run
async fn forward_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ProcessMessage>) {
    while let Some(message) = events.recv().await {
        match message.event {
            ProcessEvent::Output { .. } => {}
            ProcessEvent::Started { pid } => {
                log::info!("[{}] Process started with PID: {}", message.name, pid);
            }
            ProcessEvent::Respawning { attempt } => {
                log::debug!("[{}] Respawn attempt {}", message.name, attempt);
            }
            ProcessEvent::Failed { error } => {
                log::error!("[{}] Process failed: {}", message.name, error);
            }
            ProcessEvent::Exited { status } => {
                log::debug!("[{}] Process exited ({})", message.name, status);
                let critical = shared
                    .supervisor
                    .handle(message.id)
                    .is_some_and(|h| h.critical);
                if critical && !status.is_success() && !shared.is_aborted() {
                    shared.abort(format!(
                        "critical process '{}' exited ({})",
                        message.name, status
                    ));
                }
            }
        }
    }
}

/// Await background walks marked `join`, including ones they start themselves
async fn join_background(shared: &Arc<Shared>) -> Result<(), ExecutorError> {
    loop {
        let joinable: Vec<BackgroundWalk> = {
            let mut background = lock(&shared.background);
            let (joinable, rest) = background.drain(..).partition(|b| b.join);
            *background = rest;
            joinable
        };
        if joinable.is_empty() {
            return Ok(());
        }

        for walk in joinable {
            match walk.task.await {
                Ok(Ok(())) => log::debug!("Background include '{}' finished", walk.label),
                Ok(Err(e)) => {
                    return Err(ExecutorError::BackgroundFailed {
                        label: walk.label,
                        source: Box::new(e),
                    })
                }
                Err(_) => return Err(ExecutorError::BackgroundPanicked(walk.label)),
            }
        }
    }
}

/// Run `f`, which may wait on external commands, without holding up other
/// tasks of a multi-threaded runtime
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Runner for checks made ahead of the walk; commands only run during the walk
struct DeferredCommands;

impl CommandRunner for DeferredCommands {
    fn run(
        &self,
        argv: &[String],
        _env: &IndexMap<String, String>,
    ) -> Result<String, SubstitutionError> {
        Err(SubstitutionError::CommandDeferred(argv.join(" ")))
    }
}

/// Parse every document of `graph` whose values are known before its first
/// action runs: literals, overrides and unconditional top-level defaults.
fn check_documents(shared: &Shared, scope: &Scope, graph: &LaunchGraph) -> Result<(), ExecutorError> {
    if graph.documents.is_empty() {
        return Ok(());
    }

    let scratch = scope.child_group();
    for action in &graph.actions {
        if let Action::DeclareArgument(declare) = action {
            if declare.condition.is_none() {
                scratch.store.declare(declare.argument.clone())?;
            }
        }
    }

    let runner = DeferredCommands;
    let rewriter = DocumentRewriter::new(shared.config.temp_dir.clone(), false);
    let ctx = scratch.eval_context(&shared.config.search_paths, &runner, &rewriter);
    for (name, spec) in &graph.documents {
        match spec.precheck(&ctx) {
            Ok(true) => log::debug!("Document '{}' parsed ahead of the walk", name),
            Ok(false) => log::debug!("Document '{}' is checked when first used", name),
            Err(source) => {
                return Err(ExecutorError::InvalidDocument {
                    name: name.clone(),
                    source,
                })
            }
        }
    }
    Ok(())
}

fn subst_error(context: impl Into<String>) -> impl FnOnce(SubstitutionError) -> ExecutorError {
    let context = context.into();
    move |source| ExecutorError::SubstitutionFailed { context, source }
}

/// Depth-first walk of `actions` in declaration order
fn walk<'a>(
    shared: &'a Arc<Shared>,
    scope: &'a mut Scope,
    actions: &'a [Action],
) -> BoxFuture<'a, Result<(), ExecutorError>> {
    async move {
        for (index, action) in actions.iter().enumerate() {
            if shared.is_aborted() {
                return Err(shared.aborted_error());
            }
            execute_action(shared, scope, action, index).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn execute_action(
    shared: &Arc<Shared>,
    scope: &mut Scope,
    action: &Action,
    index: usize,
) -> Result<(), ExecutorError> {
    let label = format!("{}/{}", scope.label, action.describe(index));
    let record = shared.record(ActionRecord::new(label.clone(), action.kind()));

    let result = run_action(shared, scope, action, &label, record).await;
    let state = match &result {
        Ok(state) => *state,
        Err(_) => ActionState::Failed,
    };
    let transition = shared.transition(record, state);
    let state = result?;
    transition?;

    if state == ActionState::Failed {
        log::warn!("{} failed", label);
    }
    Ok(())
}

async fn run_action(
    shared: &Arc<Shared>,
    scope: &mut Scope,
    action: &Action,
    label: &str,
    record: usize,
) -> Result<ActionState, ExecutorError> {
    let run = blocking(|| should_run(action.condition(), &shared.context(scope)))
        .map_err(subst_error(format!("condition of {}", label)))?;
    shared.transition(record, ActionState::ConditionEvaluated)?;
    if !run {
        log::debug!("Skipping {}", label);
        return Ok(ActionState::Skipped);
    }

    match action {
        Action::DeclareArgument(declare) => {
            shared.transition(record, ActionState::Running)?;
            scope.store.declare(declare.argument.clone())?;
            Ok(ActionState::Succeeded)
        }
        Action::SetEnvironment(set) => {
            shared.transition(record, ActionState::Running)?;
            let value = blocking(|| set.value.evaluate(&shared.context(scope)))
                .map_err(subst_error(format!("environment variable '{}'", set.name)))?;
            log::debug!("{}: {}={}", label, set.name, value);
            scope.env.insert(set.name.clone(), value);
            Ok(ActionState::Succeeded)
        }
        Action::SpawnProcess(spawn) => {
            let config = blocking(|| resolve_spawn(shared, scope, spawn, label))?;
            shared.transition(record, ActionState::Running)?;
            run_spawn(shared, scope, spawn, config, record).await
        }
        Action::IncludeGraph(include) => run_include(shared, scope, include, label, record).await,
        Action::Group(group) => run_group(shared, scope, group, label, record).await,
    }
}

/// Evaluate command, environment and working directory of a spawn
fn resolve_spawn(
    shared: &Shared,
    scope: &Scope,
    spawn: &SpawnProcess,
    label: &str,
) -> Result<ProcessConfig, ExecutorError> {
    let ctx = shared.context(scope);

    let mut cmd = Vec::with_capacity(spawn.cmd.len());
    for part in &spawn.cmd {
        cmd.push(
            part.evaluate(&ctx)
                .map_err(subst_error(format!("command of {}", label)))?,
        );
    }
    let mut cmd = cmd.into_iter();
    let executable = cmd
        .next()
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ExecutorError::InvalidAction(format!("{}: empty command", label)))?;

    let base_name = spawn.name.clone().unwrap_or_else(|| {
        Path::new(&executable)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.clone())
    });

    let mut env = scope.env.clone();
    for (key, value) in &spawn.env {
        let value = value
            .evaluate(&ctx)
            .map_err(subst_error(format!("environment '{}' of {}", key, label)))?;
        env.insert(key.clone(), value);
    }

    let working_dir = match &spawn.cwd {
        Some(cwd) => Some(
            ctx.resolve_path(
                &cwd.evaluate(&ctx)
                    .map_err(subst_error(format!("working directory of {}", label)))?,
            ),
        ),
        None => shared.config.working_dir.clone(),
    };

    Ok(ProcessConfig {
        name: scope.qualify_name(&base_name),
        executable,
        args: cmd.collect(),
        env,
        working_dir,
        output: spawn.output,
        respawn: spawn.respawn,
        critical: spawn.critical,
    })
}

async fn run_spawn(
    shared: &Arc<Shared>,
    scope: &Scope,
    spawn: &SpawnProcess,
    config: ProcessConfig,
    record: usize,
) -> Result<ActionState, ExecutorError> {
    if let Some(plan) = &shared.plan {
        lock(plan).push(LaunchPlanNode {
            name: config.name,
            scope: scope.label.clone(),
            namespace: scope.namespace.clone(),
            executable: config.executable,
            args: config.args,
            env: config.env,
            working_dir: config.working_dir,
            blocking: spawn.blocking,
            critical: spawn.critical,
            respawn_delay_ms: spawn.respawn.map(|d| d.as_millis() as u64),
        });
        return Ok(ActionState::Succeeded);
    }

    let name = config.name.clone();
    let handle = shared
        .supervisor
        .spawn(config)
        .map_err(|source| ExecutorError::ProcessSpawnFailed {
            name: name.clone(),
            source,
        })?;
    shared.set_handle(record, &handle);

    if !spawn.blocking {
        return Ok(ActionState::Succeeded);
    }

    let mut abort = shared.abort.subscribe();
    let status = tokio::select! {
        status = handle.wait() => status,
        _ = wait_for_abort(&mut abort) => return Err(shared.aborted_error()),
    };

    if status.is_success() {
        Ok(ActionState::Succeeded)
    } else if spawn.critical {
        Err(ExecutorError::ProcessExitedNonZero { name, status })
    } else {
        log::warn!("[{}] Blocking process exited ({})", name, status);
        Ok(ActionState::Failed)
    }
}

async fn run_include(
    shared: &Arc<Shared>,
    scope: &mut Scope,
    include: &IncludeGraph,
    label: &str,
    record: usize,
) -> Result<ActionState, ExecutorError> {
    let (graph, overrides) = blocking(|| prepare_include(shared, scope, include, label))?;

    let mut child = scope.for_include(
        graph.name.clone(),
        overrides,
        graph.base_dir(),
        graph.documents.clone(),
    );
    check_documents(shared, &child, &graph)?;
    shared.transition(record, ActionState::Running)?;

    if include.mode == IncludeMode::Inline || shared.plan.is_some() {
        log::info!("Including '{}'", graph.name);
        walk(shared, &mut child, &graph.actions).await?;
        warn_unused_overrides(&child);
        return Ok(ActionState::Succeeded);
    }

    log::info!("Including '{}' in the background", graph.name);
    let task_shared = Arc::clone(shared);
    let task_label = label.to_string();
    let task = tokio::spawn(async move {
        let mut child = child;
        let result = walk(&task_shared, &mut child, &graph.actions).await;
        match &result {
            Ok(()) => warn_unused_overrides(&child),
            Err(ExecutorError::Aborted(_)) => {}
            Err(e) => task_shared.abort(format!("background include {} failed: {}", task_label, e)),
        }
        result
    });
    lock(&shared.background).push(BackgroundWalk {
        label: label.to_string(),
        join: include.join,
        task,
    });
    Ok(ActionState::Succeeded)
}

/// Load the included graph and evaluate its arguments in the including scope
fn prepare_include(
    shared: &Shared,
    scope: &Scope,
    include: &IncludeGraph,
    label: &str,
) -> Result<(Arc<LaunchGraph>, IndexMap<String, String>), ExecutorError> {
    let ctx = shared.context(scope);

    let graph = match &include.source {
        IncludeSource::File(path) => {
            let path = path
                .evaluate(&ctx)
                .map_err(subst_error(format!("path of {}", label)))?;
            let path = ctx.resolve_path(&path);
            let graph = LaunchGraph::from_file(&path).map_err(|source| ExecutorError::Include {
                path: path.display().to_string(),
                source: Box::new(source),
            })?;
            Arc::new(graph)
        }
        IncludeSource::Graph(graph) => Arc::clone(graph),
    };

    if scope.depth + 1 > shared.config.max_include_depth {
        return Err(ExecutorError::IncludeDepthExceeded {
            graph: graph.name.clone(),
            depth: scope.depth + 1,
        });
    }
    graph.validate()?;

    let mut overrides = IndexMap::new();
    for (name, value) in &include.args {
        let value = value
            .evaluate(&ctx)
            .map_err(subst_error(format!("argument '{}' of {}", name, label)))?;
        overrides.insert(name.clone(), value);
    }
    Ok((graph, overrides))
}

fn warn_unused_overrides(scope: &Scope) {
    for name in scope.store.unused_overrides() {
        log::warn!("'{}' was given argument '{}' it never declares", scope.label, name);
    }
}

async fn run_group(
    shared: &Arc<Shared>,
    scope: &mut Scope,
    group: &Group,
    label: &str,
    record: usize,
) -> Result<ActionState, ExecutorError> {
    let mut child = scope.child_group();

    if let Some(push) = &group.namespace {
        let pushed = blocking(|| -> Result<Option<String>, ExecutorError> {
            let ctx = shared.context(scope);
            let apply = should_run(push.condition.as_ref(), &ctx)
                .map_err(subst_error(format!("namespace condition of {}", label)))?;
            if !apply {
                return Ok(None);
            }
            push.namespace
                .evaluate(&ctx)
                .map(Some)
                .map_err(subst_error(format!("namespace of {}", label)))
        })?;
        if let Some(namespace) = pushed {
            child.namespace = join_namespace(&scope.namespace, &namespace);
        }
    }

    shared.transition(record, ActionState::Running)?;
    walk(shared, &mut child, &group.actions).await?;
    Ok(ActionState::Succeeded)
}

/// Errors that can occur in the executor
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Substitution failed in {context}: {source}")]
    SubstitutionFailed {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error("Failed to include '{path}': {source}")]
    Include {
        path: String,
        #[source]
        source: Box<LaunchFileError>,
    },

    #[error("Document '{name}' is invalid: {source}")]
    InvalidDocument {
        name: String,
        #[source]
        source: RewriteError,
    },

    #[error("Including '{graph}' exceeds the maximum include depth ({depth})")]
    IncludeDepthExceeded { graph: String, depth: usize },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Failed to start '{name}': {source}")]
    ProcessSpawnFailed {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("Process '{name}' exited with {status}")]
    ProcessExitedNonZero { name: String, status: ExitStatus },

    #[error("Background include {label} failed: {source}")]
    BackgroundFailed {
        label: String,
        #[source]
        source: Box<ExecutorError>,
    },

    #[error("Background include {0} panicked")]
    BackgroundPanicked(String),

    #[error("Launch aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Display the launch plan in a human-readable format
impl std::fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        if !self.args.is_empty() {
            writeln!(f, "Arguments:")?;
            for (key, value) in &self.args {
                writeln!(f, "  {}: {}", key, value)?;
            }
            writeln!(f)?;
        }

        if !self.documents.is_empty() {
            writeln!(f, "Documents:")?;
            for path in &self.documents {
                writeln!(f, "  {}", path.display())?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Processes (in launch order):")?;
        for (i, node) in self.nodes.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "  {}. {} [{}]", i + 1, node.name, node.scope)?;
            writeln!(f, "     Command: {} {}", node.executable, node.args.join(" "))?;

            let mut flags = Vec::new();
            if node.blocking {
                flags.push("blocking".to_string());
            }
            if node.critical {
                flags.push("critical".to_string());
            }
            if let Some(delay) = node.respawn_delay_ms {
                flags.push(format!("respawn after {}ms", delay));
            }
            if !flags.is_empty() {
                writeln!(f, "     Flags: {}", flags.join(", "))?;
            }

            if let Some(dir) = &node.working_dir {
                writeln!(f, "     Working dir: {}", dir.display())?;
            }

            if !node.env.is_empty() {
                writeln!(f, "     Environment:")?;
                for (key, value) in &node.env {
                    writeln!(f, "       {}={}", key, value)?;
                }
            }
        }

        Ok(())
    }
}
