//! mobo_launch CLI
//!
//! Usage:
//!   mobo_launch launch/amcl_localization.launch.yaml
//!   mobo_launch launch/amcl_localization.launch.yaml use_rviz:=false headless:=True
//!   mobo_launch launch/amcl_localization.launch.yaml --dry-run --json

use anyhow::Context;
use mobo_launch::{Executor, LaunchArgs, LaunchGraph};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: LaunchArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    log::info!("Loading launch file: {}", args.launch_file.display());
    let graph = LaunchGraph::from_file(&args.launch_file)
        .with_context(|| format!("Failed to load {}", args.launch_file.display()))?;

    if args.show_args {
        println!("Arguments for '{}':", graph.name);
        for argument in graph.declared_arguments() {
            let default = match &argument.default {
                Some(_) => "has default",
                None => "required",
            };
            println!(
                "  {} ({}){}",
                argument.name,
                default,
                argument
                    .description
                    .as_ref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default()
            );
            if !argument.choices.is_empty() {
                println!("      choices: {}", argument.choices.join(", "));
            }
        }
        return Ok(());
    }

    if args.validate {
        graph.validate().context("Launch file is invalid")?;
        println!("Launch file '{}' is valid", args.launch_file.display());
        println!("  Arguments: {}", graph.declared_arguments().len());
        println!("  Actions: {}", graph.actions.len());
        println!("  Documents: {}", graph.documents.len());
        return Ok(());
    }

    let mut executor = Executor::new(graph, args.executor_config(), args.arg_overrides())
        .context("Failed to create executor")?;

    if args.dry_run {
        let plan = executor
            .plan()
            .await
            .context("Failed to generate launch plan")?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            println!("{}", plan);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, initiating shutdown...");
        let _ = shutdown_tx.send(());
    })
    .context("Error setting Ctrl+C handler")?;

    executor.run(shutdown_rx).await?;

    log::info!("mobo_launch exiting");
    Ok(())
}
