//! Command-line interface for mobo_launch

use crate::runtime::ExecutorConfig;
use argh::FromArgs;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;

/// Declarative launcher for robot bring-up
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to the launch file
    #[argh(positional)]
    pub launch_file: PathBuf,

    /// launch argument overrides (format: name:=value)
    #[argh(positional, from_str_fn(parse_arg_override))]
    pub overrides: Vec<(String, String)>,

    /// override a launch argument (format: name:=value or name=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// list the arguments the launch file declares and exit
    #[argh(switch)]
    pub show_args: bool,

    /// validate launch file and exit
    #[argh(switch)]
    pub validate: bool,

    /// show launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// print the launch plan as JSON (with --dry-run)
    #[argh(switch)]
    pub json: bool,

    /// milliseconds between SIGTERM and SIGKILL on shutdown (default: 5000)
    #[argh(option)]
    pub grace_period_ms: Option<u64>,

    /// keep rewritten documents after exit
    #[argh(switch)]
    pub keep_temp_files: bool,

    /// directory for rewritten documents
    #[argh(option)]
    pub temp_dir: Option<PathBuf>,

    /// extra root for $(find ...), may be repeated
    #[argh(option)]
    pub search_path: Vec<PathBuf>,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse argument override in format "name:=value" (or "name=value")
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(":=")
        .or_else(|| s.split_once('='))
        .ok_or_else(|| format!("Invalid argument format '{}'. Expected 'name:=value'", s))?;

    if name.is_empty() {
        return Err(format!("Invalid argument format '{}'. Missing name", s));
    }
    Ok((name.to_string(), value.to_string()))
}

impl LaunchArgs {
    /// Positional and `-a` overrides, later ones winning
    pub fn arg_overrides(&self) -> IndexMap<String, String> {
        self.overrides.iter().chain(&self.arg).cloned().collect()
    }

    /// Executor configuration from the command line and the environment
    pub fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        if let Some(ms) = self.grace_period_ms {
            config.grace_period = Duration::from_millis(ms);
        }
        config.keep_temp_files = self.keep_temp_files;
        config.temp_dir = self.temp_dir.clone();

        let mut search_paths = self.search_path.clone();
        search_paths.append(&mut config.search_paths);
        config.search_paths = search_paths;
        config
    }

    /// Log filter, falling back to `info` for unknown levels
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}
