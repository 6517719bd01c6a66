//! mobo_launch
//!
//! Declarative bring-up of a simulated mobile robot: simulator, visualizer,
//! state publishers and a navigation stack, described as a launch graph.
//!
//! # Overview
//!
//! - Launch arguments are declared once, overridden from the command line or
//!   by an including file, and resolved lazily the first time they are read
//! - Strings carry `$(arg ...)`, `$(env ...)`, `$(command ...)` and friends,
//!   evaluated only when the action using them runs
//! - Every action can be gated by an `if`/`unless` condition
//! - Parameter documents are rewritten into temporary files scoped to the run
//! - Spawned processes are supervised and terminated (SIGTERM, then SIGKILL)
//!   on shutdown or on the first fatal error
//!
//! # Example Launch File
//!
//! ```yaml
//! version: "1.0"
//!
//! args:
//!   use_simulator:
//!     default: true
//!   headless:
//!     default: false
//!   namespace:
//!     default: ""
//!
//! documents:
//!   nav2_params:
//!     source: ../params/nav2_params.yaml
//!     root_key: "$(arg namespace)"
//!     convert_types: true
//!     rewrites:
//!       use_sim_time: "True"
//!
//! actions:
//!   - action: spawn
//!     name: gzserver
//!     cmd: [gzserver, -s, libgazebo_ros_init.so]
//!     if: "$(arg use_simulator)"
//!
//!   - action: spawn
//!     name: gzclient
//!     cmd: [gzclient]
//!     if:
//!       all: ["$(arg use_simulator)", { not: "$(arg headless)" }]
//!
//!   - action: group
//!     namespace: "$(arg namespace)"
//!     actions:
//!       - action: spawn
//!         name: amcl
//!         cmd: [amcl, --params-file, "$(document nav2_params)"]
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{
    Argument, CommandRunner, Condition, ConfigStore, DocumentRewriter, EvalContext, LaunchFile,
    LaunchFileError, RewriteError, RewriteSpec, ShellCommandRunner, StoreError, Substitution,
    SubstitutionError,
};
pub use runtime::{
    Action, ActionState, ExecutionReport, Executor, ExecutorConfig, ExecutorError, ExitStatus,
    Group, IncludeGraph, LaunchGraph, LaunchPlan, ProcessConfig, ProcessError, ProcessEvent,
    ProcessHandle, ProcessSupervisor, SetEnvironment, SpawnProcess,
};
