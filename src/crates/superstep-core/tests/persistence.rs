//! Threads stored in real savers, history and out-of-band state updates

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use superstep_checkpoint::{
    CheckpointSaver, FileCheckpointSaver, InMemoryCheckpointSaver, LastValueChannel,
    SqliteCheckpointSaver,
};
use superstep_core::{
    CheckpointSource, CompiledGraph, GraphBuilder, GraphError, NodeBuilder, NodeOutput,
    RunConfig, TaskContext,
};

fn thread(id: &str) -> RunConfig {
    RunConfig::new().with_thread_id(id)
}

/// `inc` keeps adding one to `n` until it reaches 5
fn counter(saver: Arc<dyn CheckpointSaver>) -> CompiledGraph {
    let mut builder = GraphBuilder::new();
    builder
        .add_channel("n", LastValueChannel::new())
        .add_node(
            NodeBuilder::new("inc", |input: Value, _ctx: TaskContext| async move {
                let n = input["n"].as_i64().unwrap_or(0);
                if n >= 5 {
                    return Ok::<_, GraphError>(NodeOutput::empty());
                }
                Ok(NodeOutput::update(json!(n + 1)))
            })
            .subscribe_to(["n"])
            .write_to(["n"]),
        );
    builder.compile().unwrap().with_checkpointer(saver)
}

fn ask(saver: Arc<dyn CheckpointSaver>) -> CompiledGraph {
    let mut builder = GraphBuilder::new();
    builder
        .add_channel("question", LastValueChannel::new())
        .add_channel("answer", LastValueChannel::new())
        .add_node(
            NodeBuilder::new("ask", |input: Value, ctx: TaskContext| async move {
                let answer = ctx.suspend(input["question"].clone())?;
                Ok::<_, GraphError>(NodeOutput::update(answer))
            })
            .subscribe_to(["question"])
            .write_to(["answer"]),
        )
        .set_input_channels(["question"]);
    builder.compile().unwrap().with_checkpointer(saver)
}

/// `first` copies `in` to `mid`, `second` copies `mid` to `out`
fn relay() -> CompiledGraph {
    let copy = |from: &'static str| {
        move |input: Value, _ctx: TaskContext| async move {
            Ok::<_, GraphError>(NodeOutput::update(input[from].clone()))
        }
    };
    let mut builder = GraphBuilder::new();
    builder
        .add_channel("in", LastValueChannel::new())
        .add_channel("mid", LastValueChannel::new())
        .add_channel("out", LastValueChannel::new())
        .add_node(
            NodeBuilder::new("first", copy("in"))
                .subscribe_to(["in"])
                .write_to(["mid"]),
        )
        .add_node(
            NodeBuilder::new("second", copy("mid"))
                .subscribe_to(["mid"])
                .write_to(["out"]),
        )
        .set_input_channels(["in"]);
    builder.compile().unwrap()
}

async fn trail(graph: &CompiledGraph, config: &RunConfig) -> Vec<(Option<i64>, Value)> {
    let mut history = graph.get_state_history(config).await.unwrap();
    history.reverse();
    history.into_iter().map(|s| (s.step(), s.values)).collect()
}

/// Stopping a thread, then continuing it from storage with a new graph
/// instance, gives the same checkpoints as an uninterrupted run
async fn continuation_matches_uninterrupted_run(saver: Arc<dyn CheckpointSaver>) {
    let graph = counter(saver.clone());
    let straight = thread("straight");
    let out = graph.invoke(json!({"n": 0}), &straight).await.unwrap();
    assert_eq!(out.values, json!({"n": 5}));

    let paused = thread("paused").with_interrupt_after(["inc"]);
    let out = graph.invoke(json!({"n": 0}), &paused).await.unwrap();
    assert!(out.is_interrupted());
    assert_eq!(out.values, json!({"n": 1}));
    drop(graph);

    let restarted = counter(saver);
    let out = restarted.invoke(Value::Null, &thread("paused")).await.unwrap();
    assert_eq!(out.values, json!({"n": 5}));

    let expected = trail(&restarted, &straight).await;
    assert_eq!(expected.len(), 7);
    assert_eq!(trail(&restarted, &thread("paused")).await, expected);
}

/// Interrupts and their pending writes survive a restart
async fn interrupt_survives_restart(saver: Arc<dyn CheckpointSaver>) {
    let config = thread("asking");
    let out = ask(saver.clone())
        .invoke(json!({"question": "ready?"}), &config)
        .await
        .unwrap();
    assert_eq!(out.interrupts[0].value, json!("ready?"));

    let graph = ask(saver);
    let state = graph.get_state(&config, false).await.unwrap();
    assert_eq!(state.interrupts().len(), 1);
    let out = graph.resume(vec![json!("yes")], &config).await.unwrap();
    assert_eq!(out.values, json!({"question": "ready?", "answer": "yes"}));
}

#[tokio::test]
async fn test_memory_saver_continuation() {
    let saver: Arc<dyn CheckpointSaver> = Arc::new(InMemoryCheckpointSaver::new());
    continuation_matches_uninterrupted_run(saver.clone()).await;
    interrupt_survives_restart(saver).await;
}

#[tokio::test]
async fn test_file_saver_continuation() {
    let dir = tempfile::tempdir().unwrap();
    let saver: Arc<dyn CheckpointSaver> = Arc::new(FileCheckpointSaver::new(dir.path()));
    continuation_matches_uninterrupted_run(saver.clone()).await;
    interrupt_survives_restart(saver).await;
}

#[tokio::test]
async fn test_sqlite_saver_continuation() {
    let saver: Arc<dyn CheckpointSaver> = Arc::new(SqliteCheckpointSaver::in_memory().await.unwrap());
    continuation_matches_uninterrupted_run(saver.clone()).await;
    interrupt_survives_restart(saver).await;
}

#[tokio::test]
async fn test_history_records_sources_and_lineage() {
    let graph = relay();
    let config = thread("lineage").with_metadata("user", json!("ada"));
    graph.invoke(json!({"in": "x"}), &config).await.unwrap();

    let history = graph.get_state_history(&config).await.unwrap();
    let sources: Vec<_> = history.iter().map(|s| s.metadata.source).collect();
    assert_eq!(
        sources,
        vec![
            Some(CheckpointSource::Loop),
            Some(CheckpointSource::Loop),
            Some(CheckpointSource::Input)
        ]
    );
    for pair in history.windows(2) {
        assert_eq!(
            pair[0].parent_config.as_ref().and_then(|p| p.checkpoint_id.clone()),
            pair[1].config.checkpoint_id
        );
    }
    assert!(history[2].parent_config.is_none());
    assert!(history.iter().all(|s| s.metadata.extra["user"] == json!("ada")));
    assert_eq!(history[1].next, vec!["second".to_string()]);
    assert!(history[0].next.is_empty());
}

#[tokio::test]
async fn test_filtered_history() {
    let graph = relay();
    let config = thread("filtered");
    graph
        .invoke(json!({"in": 1}), &config.clone().with_metadata("run", json!(1)))
        .await
        .unwrap();
    graph
        .invoke(json!({"in": 2}), &config.clone().with_metadata("run", json!(2)))
        .await
        .unwrap();

    let second_run = graph
        .get_state_history_filtered(&config, Some(HashMap::from([("run".to_string(), json!(2))])), None, None)
        .await
        .unwrap();
    assert_eq!(second_run.len(), 3);
    assert_eq!(second_run[0].values["out"], json!(2));

    let latest = graph
        .get_state_history_filtered(&config, None, None, Some(1))
        .await
        .unwrap();
    assert_eq!(latest.len(), 1);

    let before_latest = graph
        .get_state_history_filtered(&config, None, Some(&latest[0].config), None)
        .await
        .unwrap();
    assert_eq!(before_latest.len(), 5);
}

#[tokio::test]
async fn test_get_state_of_unknown_thread() {
    let graph = relay();
    let err = graph.get_state(&thread("ghost"), false).await.unwrap_err();
    assert!(matches!(err, GraphError::NoCheckpoint(t) if t == "ghost"));
    let err = graph.get_state(&RunConfig::new(), false).await.unwrap_err();
    assert!(matches!(err, GraphError::Configuration(_)));
}

#[tokio::test]
async fn test_update_state_triggers_subscribers() {
    let graph = relay();
    let config = thread("update");
    graph.invoke(json!({"in": "a"}), &config).await.unwrap();

    let saved = graph.update_state(&config, json!({"mid": "patched"})).await.unwrap();
    let state = graph.get_state(&config, false).await.unwrap();
    assert_eq!(state.config.checkpoint_id, saved.checkpoint_id);
    assert_eq!(state.metadata.source, Some(CheckpointSource::Update));
    assert_eq!(state.step(), Some(3));
    assert_eq!(state.next, vec!["second".to_string()]);

    let out = graph.invoke(Value::Null, &config).await.unwrap();
    assert_eq!(out.values, json!({"in": "a", "mid": "patched", "out": "patched"}));
}

#[tokio::test]
async fn test_update_state_rejects_unknown_channel() {
    let graph = relay();
    let config = thread("bad-update");
    graph.invoke(json!({"in": 1}), &config).await.unwrap();

    let err = graph.update_state(&config, json!({"nope": 1})).await.unwrap_err();
    assert!(matches!(err, GraphError::InvalidInput(_)), "unexpected error: {err}");
    assert_eq!(graph.get_state_history(&config).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_update_state_as_node() {
    let graph = relay();
    let config = thread("as-node");

    graph
        .update_state_as_node(&config, json!("injected"), "first")
        .await
        .unwrap();
    let state = graph.get_state(&config, false).await.unwrap();
    assert_eq!(state.step(), Some(0));
    assert_eq!(state.values, json!({"mid": "injected"}));
    assert_eq!(state.next, vec!["second".to_string()]);

    let out = graph.invoke(Value::Null, &config).await.unwrap();
    assert_eq!(out.values, json!({"mid": "injected", "out": "injected"}));

    let err = graph
        .update_state_as_node(&config, json!("x"), "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidInput(_)));
}

#[tokio::test]
async fn test_fork_copies_checkpoint_into_new_branch() {
    let graph = relay();
    let config = thread("fork");
    graph.invoke(json!({"in": 7}), &config).await.unwrap();
    let history = graph.get_state_history(&config).await.unwrap();
    let after_first = history.iter().find(|s| s.step() == Some(1)).unwrap();

    let forked = graph
        .update_state(&config.at_checkpoint(&after_first.config), Value::Null)
        .await
        .unwrap();
    assert_ne!(forked.checkpoint_id, after_first.config.checkpoint_id);

    let state = graph.get_state(&config, false).await.unwrap();
    assert_eq!(state.config.checkpoint_id, forked.checkpoint_id);
    assert_eq!(state.metadata.source, Some(CheckpointSource::Fork));
    assert_eq!(state.step(), Some(2));
    assert_eq!(state.values, after_first.values);
    assert_eq!(state.next, vec!["second".to_string()]);
    assert_eq!(
        state.parent_config.and_then(|p| p.checkpoint_id),
        after_first.config.checkpoint_id
    );

    let out = graph.invoke(Value::Null, &config).await.unwrap();
    assert_eq!(out.get("out"), Some(&json!(7)));
}
