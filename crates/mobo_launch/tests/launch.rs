//! End-to-end launch tests against real processes

#![cfg(unix)]

use indexmap::IndexMap;
use mobo_launch::runtime::ActionKind;
use mobo_launch::{
    ActionState, Argument, Condition, Executor, ExecutorConfig, ExecutorError, ExitStatus, Group,
    IncludeGraph, LaunchGraph, RewriteSpec, SpawnProcess, StoreError, Substitution,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn sleeper(name: &str) -> SpawnProcess {
    SpawnProcess::new(["sleep", "30"]).named(name)
}

fn quick_config() -> ExecutorConfig {
    ExecutorConfig {
        grace_period: Duration::from_secs(2),
        ..ExecutorConfig::default()
    }
}

fn demo_launch_file() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("launch/amcl_localization.launch.yaml")
}

fn overrides(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_group_skips_process_with_false_condition() {
    let graph = LaunchGraph::new("group").with_action(Group::new(vec![
        sleeper("first").into(),
        sleeper("second")
            .when(Condition::if_true("false"))
            .into(),
        sleeper("third").into(),
    ]));

    let mut executor = Executor::new(graph, quick_config(), IndexMap::new()).unwrap();
    let (_tx, rx) = watch::channel(());
    executor.launch(rx).await.unwrap();

    let names: Vec<String> = executor.handles().into_iter().map(|h| h.name).collect();
    assert_eq!(names, vec!["first", "third"]);

    let report = executor.report();
    assert_eq!(report.count(ActionState::Skipped), 1);

    executor.shutdown().await;
    assert!(executor.handles().iter().all(|h| h.is_finished()));
}

#[tokio::test]
async fn test_failed_substitution_stops_earlier_processes() {
    let graph = LaunchGraph::new("fatal")
        .with_action(sleeper("one"))
        .with_action(sleeper("two"))
        .with_action(
            SpawnProcess::new([Substitution::literal("echo"), Substitution::command("false")])
                .named("three"),
        )
        .with_action(sleeper("four"))
        .with_action(sleeper("five"));

    let mut executor = Executor::new(graph, quick_config(), IndexMap::new()).unwrap();
    let (_tx, rx) = watch::channel(());

    let started = Instant::now();
    let result = executor.launch(rx).await;
    assert!(matches!(result, Err(ExecutorError::SubstitutionFailed { .. })));
    assert!(started.elapsed() < Duration::from_secs(4));

    let handles = executor.handles();
    assert_eq!(handles.len(), 2);
    for handle in &handles {
        assert_eq!(handle.status(), ExitStatus::Killed);
    }

    // actions after the failing one were never attempted
    let report = executor.report();
    assert_eq!(report.actions.len(), 3);
    assert_eq!(report.actions[2].state, ActionState::Failed);
    assert_eq!(report.count(ActionState::Succeeded), 2);
}

#[tokio::test]
async fn test_critical_exit_aborts_run() {
    let graph = LaunchGraph::new("critical")
        .with_action(sleeper("rviz2"))
        .with_action(
            SpawnProcess::new(["sh", "-c", "sleep 0.2; exit 3"])
                .named("gzserver")
                .critical(),
        );

    let mut executor = Executor::new(graph, quick_config(), IndexMap::new()).unwrap();
    let (_tx, rx) = watch::channel(());

    let result = tokio::time::timeout(Duration::from_secs(10), executor.run(rx))
        .await
        .expect("run should stop on its own");
    match result {
        Err(ExecutorError::Aborted(reason)) => assert!(reason.contains("gzserver")),
        other => panic!("expected abort, got {:?}", other),
    }

    let status = executor.status();
    assert!(status.contains(&("gzserver".to_string(), ExitStatus::Failure(3))));
    assert!(status.contains(&("rviz2".to_string(), ExitStatus::Killed)));
}

#[tokio::test]
async fn test_blocking_spawn_orders_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ready");

    let graph = LaunchGraph::new("blocking")
        .with_action(
            SpawnProcess::new([
                "sh".to_string(),
                "-c".to_string(),
                format!("sleep 0.2; touch {}", marker.display()),
            ])
            .named("setup")
            .blocking(),
        )
        .with_action(
            SpawnProcess::new([
                "sh".to_string(),
                "-c".to_string(),
                format!("test -f {}", marker.display()),
            ])
            .named("check")
            .blocking()
            .critical(),
        );

    let mut executor = Executor::new(graph, quick_config(), IndexMap::new()).unwrap();
    let (_tx, rx) = watch::channel(());
    executor.launch(rx).await.unwrap();

    for (name, status) in executor.status() {
        assert_eq!(status, ExitStatus::Success, "{} did not succeed", name);
    }
    executor.shutdown().await;
}

#[tokio::test]
async fn test_background_include_with_join() {
    let inner = LaunchGraph::new("inner")
        .with_action(SpawnProcess::new(["sh", "-c", "sleep 0.2"]).named("warmup").blocking());

    let graph = LaunchGraph::new("outer")
        .with_action(IncludeGraph::graph(inner).in_background(true))
        .with_action(sleeper("main"));

    let mut executor = Executor::new(graph, quick_config(), IndexMap::new()).unwrap();
    let (_tx, rx) = watch::channel(());
    executor.launch(rx).await.unwrap();

    let status = executor.status();
    assert!(status.contains(&("warmup".to_string(), ExitStatus::Success)));
    assert!(status.contains(&("main".to_string(), ExitStatus::Pending)));
    assert_eq!(executor.report().of_kind(ActionKind::IncludeGraph).count(), 1);

    executor.shutdown().await;
}

#[tokio::test]
async fn test_ctrl_c_during_launch_aborts() {
    let graph = LaunchGraph::new("interrupted")
        .with_action(sleeper("first"))
        .with_action(SpawnProcess::new(["sleep", "30"]).named("blocker").blocking())
        .with_action(sleeper("never"));

    let mut executor = Executor::new(graph, quick_config(), IndexMap::new()).unwrap();
    let (tx, rx) = watch::channel(());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tx.send(());
    });

    let result = executor.launch(rx).await;
    assert!(matches!(result, Err(ExecutorError::Aborted(_))));

    let names: Vec<String> = executor.handles().into_iter().map(|h| h.name).collect();
    assert_eq!(names, vec!["first", "blocker"]);
    assert!(executor.handles().iter().all(|h| h.is_finished()));
}

#[test]
fn test_demo_launch_file_validates() {
    let graph = LaunchGraph::from_file(demo_launch_file()).unwrap();
    graph.validate().unwrap();

    assert_eq!(graph.name, "amcl_localization");
    let names: Vec<&str> = graph
        .declared_arguments()
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert!(names.contains(&"use_simulator"));
    assert!(names.contains(&"map_yaml_file"));
    assert_eq!(graph.documents.len(), 1);
}

#[tokio::test]
async fn test_demo_launch_file_plan() {
    let graph = LaunchGraph::from_file(demo_launch_file()).unwrap();
    let executor = Executor::new(
        graph,
        ExecutorConfig::default(),
        overrides(&[("headless", "True"), ("use_rviz", "false")]),
    )
    .unwrap();

    let plan = executor.plan().await.unwrap();
    let names: Vec<&str> = plan.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "robot_state_publisher",
            "gzserver",
            "spawn_entity",
            "nav2_container",
            "load_localization",
            "lifecycle_manager_localization",
        ]
    );

    let gzserver = &plan.nodes[1];
    assert!(gzserver.critical);
    assert!(gzserver.args.last().unwrap().ends_with("worlds/test_world.world"));
    assert_eq!(gzserver.env["RCUTILS_LOGGING_BUFFERED_STREAM"], "1");

    let container = &plan.nodes[3];
    assert!(container.args.contains(&"info".to_string()));
    assert_eq!(plan.args["headless"], "True");
    assert_eq!(plan.documents.len(), 1);
}

#[tokio::test]
async fn test_demo_document_rewrite_with_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExecutorConfig {
        keep_temp_files: true,
        temp_dir: Some(dir.path().to_path_buf()),
        ..ExecutorConfig::default()
    };

    let graph = LaunchGraph::from_file(demo_launch_file()).unwrap();
    let executor = Executor::new(
        graph,
        config,
        overrides(&[
            ("use_namespace", "true"),
            ("namespace", "robot1"),
            ("use_composition", "False"),
            ("map_yaml_file", "/maps/office.yaml"),
        ]),
    )
    .unwrap();

    let plan = executor.plan().await.unwrap();
    let names: Vec<&str> = plan.nodes.iter().map(|n| n.name.as_str()).collect();
    assert!(names.contains(&"/robot1/map_server"));
    assert!(names.contains(&"/robot1/amcl"));
    assert!(!names.contains(&"/robot1/nav2_container"));

    assert_eq!(plan.documents.len(), 1);
    let rewritten = std::fs::read_to_string(&plan.documents[0]).unwrap();
    let document: serde_yaml::Value = serde_yaml::from_str(&rewritten).unwrap();

    let amcl = &document["robot1"]["amcl"]["ros__parameters"];
    assert_eq!(amcl["use_sim_time"], serde_yaml::Value::Bool(true));
    assert_eq!(amcl["scan_topic"].as_str(), Some("/robot1/scan"));

    let map_server = &document["robot1"]["map_server"]["ros__parameters"];
    assert_eq!(map_server["yaml_filename"].as_str(), Some("/maps/office.yaml"));
}

#[tokio::test]
async fn test_malformed_document_fails_before_any_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let params = dir.path().join("params.yaml");
    std::fs::write(&params, "key: [unclosed\n").unwrap();

    let graph = LaunchGraph::new("broken_params")
        .with_document("params", RewriteSpec::new(params.display().to_string()))
        .with_action(sleeper("one"))
        .with_action(SpawnProcess::new([
            Substitution::literal("echo"),
            Substitution::Document("params".into()),
        ]));

    let mut executor = Executor::new(graph, quick_config(), IndexMap::new()).unwrap();
    let (_tx, rx) = watch::channel(());
    let result = executor.launch(rx).await;

    assert!(matches!(result, Err(ExecutorError::InvalidDocument { ref name, .. }) if name == "params"));
    assert!(executor.handles().is_empty());
    assert!(executor.report().actions.is_empty());
}

#[tokio::test]
async fn test_read_before_declaration_rejected_before_any_spawn() {
    let graph = LaunchGraph::new("late")
        .with_action(sleeper("one"))
        .with_action(SpawnProcess::new([
            Substitution::literal("echo"),
            Substitution::arg("late"),
        ]))
        .with_action(Argument::new("late").with_default("1"));

    let result = Executor::new(graph, quick_config(), IndexMap::new());
    assert!(matches!(
        result,
        Err(ExecutorError::Store(StoreError::UndeclaredArgument(ref name))) if name == "late"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_slow_command_substitution_leaves_runtime_responsive() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let graph = LaunchGraph::new("slow_command")
        .with_action(
            Argument::new("stamp")
                .with_default(Substitution::command("sh -c 'sleep 0.5; echo ready'")),
        )
        .with_action(
            SpawnProcess::new([Substitution::literal("echo"), Substitution::arg("stamp")])
                .named("echo")
                .blocking(),
        );

    // the walk shares the single worker with the ticker
    let before = ticks.load(Ordering::Relaxed);
    let launch = tokio::spawn(async move {
        let mut executor = Executor::new(graph, quick_config(), IndexMap::new())?;
        let (_tx, rx) = watch::channel(());
        executor.launch(rx).await?;
        let status = executor.status();
        executor.shutdown().await;
        Ok::<_, ExecutorError>(status)
    });
    let status = launch.await.unwrap().unwrap();
    let advanced = ticks.load(Ordering::Relaxed) - before;
    ticker.abort();

    assert_eq!(status, vec![("echo".to_string(), ExitStatus::Success)]);
    assert!(advanced >= 10, "ticker advanced only {} times", advanced);
}
