//! Behaviour every checkpoint saver must share, run against each backend.

use serde_json::json;
use std::collections::HashMap;
use superstep_checkpoint::{
    AesGcmCipher, ChannelVersion, Checkpoint, CheckpointConfig, CheckpointError,
    CheckpointMetadata, CheckpointSaver, CheckpointSource, EncryptedSerializer,
    FileCheckpointSaver, InMemoryCheckpointSaver, JsonSerializer, PendingWrite,
    SqliteCheckpointSaver,
};

fn thread(id: &str) -> CheckpointConfig {
    CheckpointConfig::new().with_thread_id(id)
}

fn checkpoint_with(channel: &str, value: serde_json::Value, version: i64) -> Checkpoint {
    Checkpoint::new(
        HashMap::from([(channel.to_string(), value)]),
        HashMap::from([(channel.to_string(), ChannelVersion::Int(version))]),
        HashMap::new(),
    )
}

async fn history_is_newest_first(saver: &dyn CheckpointSaver) {
    let mut parent = thread("history");
    let mut saved = Vec::new();
    for step in 0..4 {
        parent = saver
            .put(
                &parent,
                checkpoint_with("count", json!(step), step + 1),
                CheckpointMetadata::new()
                    .with_source(if step == 0 { CheckpointSource::Input } else { CheckpointSource::Loop })
                    .with_step(step),
                HashMap::new(),
            )
            .await
            .unwrap();
        saved.push(parent.checkpoint_id.clone().unwrap());
    }

    let history = saver.list(Some(&thread("history")), None, None, None).await.unwrap();
    let ids: Vec<_> = history.iter().filter_map(|t| t.config.checkpoint_id.clone()).collect();
    let mut expected = saved.clone();
    expected.reverse();
    assert_eq!(ids, expected);

    assert_eq!(history[0].metadata.step, Some(3));
    assert_eq!(
        history[0].parent_config.as_ref().and_then(|p| p.checkpoint_id.clone()),
        Some(saved[2].clone())
    );
    assert!(history[3].parent_config.is_none());

    let before = thread("history").with_checkpoint_id(saved[2].clone());
    let older = saver.list(Some(&thread("history")), None, Some(&before), Some(1)).await.unwrap();
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].config.checkpoint_id.as_deref(), Some(saved[1].as_str()));

    let latest = saver.get_tuple(&thread("history")).await.unwrap().unwrap();
    assert_eq!(latest.checkpoint.channel_values["count"], json!(3));
}

async fn metadata_filter(saver: &dyn CheckpointSaver) {
    let first = saver
        .put(
            &thread("filter"),
            Checkpoint::empty(),
            CheckpointMetadata::new().with_extra("user", json!("ada")),
            HashMap::new(),
        )
        .await
        .unwrap();
    saver
        .put(
            &first,
            Checkpoint::empty(),
            CheckpointMetadata::new().with_extra("user", json!("grace")),
            HashMap::new(),
        )
        .await
        .unwrap();

    let filter = HashMap::from([("user".to_string(), json!("ada"))]);
    let matched = saver
        .list(Some(&thread("filter")), Some(filter), None, None)
        .await
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].config.checkpoint_id, first.checkpoint_id);
}

async fn write_once_and_pending_writes(saver: &dyn CheckpointSaver) {
    let checkpoint = Checkpoint::empty();
    let saved = saver
        .put(&thread("writes"), checkpoint.clone(), CheckpointMetadata::new(), HashMap::new())
        .await
        .unwrap();
    let duplicate = saver
        .put(&thread("writes"), checkpoint, CheckpointMetadata::new(), HashMap::new())
        .await;
    assert!(matches!(duplicate, Err(CheckpointError::AlreadyExists { .. })));

    saver
        .put_writes(&saved, vec![("a".into(), json!(1)), ("b".into(), json!(2))], "task-1")
        .await
        .unwrap();
    saver
        .put_writes(&saved, vec![("a".into(), json!("again"))], "task-1")
        .await
        .unwrap();
    saver
        .put_writes(&saved, vec![("__interrupt__".into(), json!({"value": "ask"}))], "task-2")
        .await
        .unwrap();

    let tuple = saver.get_tuple(&saved).await.unwrap().unwrap();
    let mut writes = tuple.pending_writes;
    writes.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    assert_eq!(
        writes,
        vec![
            PendingWrite::new("task-1", "a", json!("again")),
            PendingWrite::new("task-2", "__interrupt__", json!({"value": "ask"})),
        ]
    );

    let missing = thread("writes").with_checkpoint_id("missing");
    assert!(saver.put_writes(&missing, vec![], "task").await.is_err());
}

async fn namespaces_and_deletion(saver: &dyn CheckpointSaver) {
    let child = thread("ns").with_checkpoint_ns("child:abc");
    saver
        .put(&thread("ns"), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
        .await
        .unwrap();
    saver
        .put(&child, checkpoint_with("inner", json!(true), 1), CheckpointMetadata::new(), HashMap::new())
        .await
        .unwrap();

    let root = saver.get_tuple(&thread("ns")).await.unwrap().unwrap();
    assert!(root.checkpoint.channel_values.is_empty());
    let nested = saver.get_tuple(&child).await.unwrap().unwrap();
    assert_eq!(nested.checkpoint.channel_values["inner"], json!(true));
    assert_eq!(nested.config.ns(), "child:abc");

    saver.delete_thread("ns").await.unwrap();
    assert!(saver.get_tuple(&thread("ns")).await.unwrap().is_none());
    assert!(saver.get_tuple(&child).await.unwrap().is_none());
}

async fn pruning(saver: &dyn CheckpointSaver) {
    let mut parent = thread("prune");
    for step in 0..5 {
        parent = saver
            .put(&parent, Checkpoint::empty(), CheckpointMetadata::new().with_step(step), HashMap::new())
            .await
            .unwrap();
    }
    assert_eq!(saver.prune(&thread("prune"), 2).await.unwrap(), 3);
    let remaining = saver.list(Some(&thread("prune")), None, None, None).await.unwrap();
    let steps: Vec<_> = remaining.iter().filter_map(|t| t.metadata.step).collect();
    assert_eq!(steps, vec![4, 3]);
    assert_eq!(saver.prune(&thread("prune"), 2).await.unwrap(), 0);
}

async fn missing_thread(saver: &dyn CheckpointSaver) {
    assert!(saver.get_tuple(&thread("nobody")).await.unwrap().is_none());
    assert!(saver
        .list(Some(&thread("nobody")), None, None, None)
        .await
        .unwrap()
        .is_empty());
    assert!(saver.get_tuple(&CheckpointConfig::new()).await.is_err());
}

async fn conformance(saver: &dyn CheckpointSaver) {
    history_is_newest_first(saver).await;
    metadata_filter(saver).await;
    write_once_and_pending_writes(saver).await;
    namespaces_and_deletion(saver).await;
    pruning(saver).await;
    missing_thread(saver).await;
}

#[tokio::test]
async fn memory_saver_conforms() {
    conformance(&InMemoryCheckpointSaver::new()).await;
}

#[tokio::test]
async fn file_saver_conforms() {
    let dir = tempfile::tempdir().unwrap();
    conformance(&FileCheckpointSaver::new(dir.path())).await;
}

#[tokio::test]
async fn encrypted_file_saver_conforms() {
    let dir = tempfile::tempdir().unwrap();
    let serializer =
        EncryptedSerializer::new(JsonSerializer::new(), AesGcmCipher::new(&[42u8; 32]).unwrap());
    conformance(&FileCheckpointSaver::with_serializer(dir.path(), serializer)).await;
}

#[tokio::test]
async fn sqlite_saver_conforms() {
    conformance(&SqliteCheckpointSaver::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn sqlite_saver_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("checkpoints.db").display());

    let saved = {
        let saver = SqliteCheckpointSaver::connect(&url).await.unwrap();
        saver
            .put(&thread("durable"), checkpoint_with("k", json!("v"), 1), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap()
    };

    let reopened = SqliteCheckpointSaver::connect(&url).await.unwrap();
    let tuple = reopened.get_tuple(&thread("durable")).await.unwrap().unwrap();
    assert_eq!(tuple.config, saved);
    assert_eq!(tuple.checkpoint.channel_values["k"], json!("v"));
}
