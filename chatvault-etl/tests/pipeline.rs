//! End-to-end pipeline tests: archive in, relational rows out, with
//! checkpointing and resume along the way.

use std::fs;
use std::path::{Path, PathBuf};

use chatvault_core::config::EtlConfig;
use chatvault_core::context::{Phase, PhaseStatus};
use chatvault_etl::EtlPipeline;
use serde_json::json;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn export_json() -> String {
    json!({
        "userId": "8:live:owner",
        "exportDate": "2024-03-01T00:00:00Z",
        "conversations": [
            {
                "id": "19:group1",
                "displayName": "Weekend Plans",
                "messages": [
                    {
                        "id": "m1",
                        "senderId": "8:live:owner",
                        "arrivalTime": "2024-02-01T09:00:00Z",
                        "type": "RichText",
                        "content": "shall we go <b>hiking</b>?"
                    },
                    {
                        "id": "m2",
                        "senderId": "8:alice",
                        "senderName": "Alice",
                        "arrivalTime": "2024-02-01T09:05:00Z",
                        "type": "RichText",
                        "content": "<quote authorname=\"Owner\">shall we go hiking?</quote>yes!"
                    },
                    {
                        "id": "m3",
                        "senderId": "8:alice",
                        "arrivalTime": "2024-02-01T09:06:00Z",
                        "type": "Mystery/Unknown",
                        "content": "opaque"
                    }
                ]
            },
            {
                "id": "8:alice",
                "messages": [
                    {
                        "id": "m4",
                        "senderId": "8:alice",
                        "arrivalTime": "2024-02-02T10:00:00Z",
                        "type": "Event/Call",
                        "content": "<partlist type=\"ended\"><part identity=\"8:alice\"><duration>60</duration></part></partlist>"
                    }
                ]
            }
        ]
    })
    .to_string()
}

fn tar_fixture(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let file = fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);
    let content = export_json();
    let mut header = tar::Header::new_ustar();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "export/messages.json", content.as_bytes())
        .unwrap();
    builder.into_inner().unwrap();
    path
}

fn test_config(dir: &Path) -> EtlConfig {
    let mut config = EtlConfig::default();
    config.checkpoint_dir = dir.join("checkpoints");
    config.work_dir = dir.join("work");
    config.database_url = format!("sqlite://{}", dir.join("chatvault.db").display());
    config.batch_size = 2;
    config
}

async fn message_count(database_url: &str) -> i64 {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .unwrap();
    sqlx::query_scalar("select count(*) from messages")
        .fetch_one(&pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_tar_to_database_end_to_end() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let archive = tar_fixture(dir.path(), "export.tar");
    let config = test_config(dir.path());
    let database_url = config.database_url.clone();

    let mut pipeline = EtlPipeline::new(config).unwrap();
    let result = pipeline.run(&archive, "Owner", false).await.unwrap();

    assert_eq!(result.conversations_loaded, 2);
    assert_eq!(result.messages_loaded, 4);
    assert_eq!(result.failed_batches, 0);
    assert!(result.errors.is_empty());
    for phase in Phase::ALL {
        assert_eq!(result.phases[&phase].status, PhaseStatus::Completed);
    }

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
        .unwrap();

    // owner's own message resolved to the supplied display name
    let owner_name: String = sqlx::query_scalar(
        "select sender_name from messages where message_id = 'm1'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(owner_name, "Owner");

    // quote markup rewritten into attribution form
    let quoted: String = sqlx::query_scalar(
        "select cleaned_content from messages where message_id = 'm2'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(quoted.contains("Owner wrote:"));
    assert!(quoted.contains("> shall we go hiking?"));

    // unknown type got the description template, not the raw payload
    let unknown: String = sqlx::query_scalar(
        "select cleaned_content from messages where message_id = 'm3'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(unknown, "Sent a Mystery/Unknown message");

    // call handler pulled structured fields
    let call: String = sqlx::query_scalar(
        "select structured_data from messages where message_id = 'm4'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    let call: serde_json::Value = serde_json::from_str(&call).unwrap();
    assert_eq!(call["duration_seconds"], json!(60.0));
    assert_eq!(call["call_state"], json!("ended"));

    // the archive label was already tar-suffixed
    let label: String = sqlx::query_scalar("select file_source from raw_exports")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(label, "export.tar");

    // small exports keep their raw body alongside the provenance row
    let raw: Option<String> = sqlx::query_scalar("select raw_document from raw_exports")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(raw.unwrap().contains("\"userId\""));

    // a checkpoint exists for every completed phase boundary
    let checkpoints = fs::read_dir(dir.path().join("checkpoints")).unwrap().count();
    assert_eq!(checkpoints, 3);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let json_path = dir.path().join("export.json");
    fs::write(&json_path, export_json()).unwrap();
    let config = test_config(dir.path());
    let database_url = config.database_url.clone();

    let mut pipeline = EtlPipeline::new(config).unwrap();
    pipeline.run(&json_path, "Owner", false).await.unwrap();
    let second = pipeline.run(&json_path, "Owner", false).await.unwrap();

    assert_eq!(second.messages_loaded, 4);
    assert_eq!(message_count(&database_url).await, 4);

    // a plain json source gets the tar suffix appended to its label
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
        .unwrap();
    let label: String = sqlx::query_scalar("select file_source from raw_exports limit 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(label, "export.json.tar");
}

#[tokio::test]
async fn test_resume_after_load_failure_matches_uninterrupted_run() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let json_path = dir.path().join("export.json");
    fs::write(&json_path, export_json()).unwrap();

    // first attempt: unreachable database, load fails after the transform
    // checkpoint was written
    let mut broken = test_config(dir.path());
    broken.database_url = format!(
        "sqlite://{}",
        dir.path().join("missing/nested/db.sqlite").display()
    );
    let mut pipeline = EtlPipeline::new(broken).unwrap();
    let err = pipeline.run(&json_path, "Owner", false).await;
    assert!(err.is_err());
    assert_eq!(
        pipeline.available_checkpoints(),
        vec![Phase::Extract, Phase::Transform]
    );

    // resume from the latest checkpoint with a working database
    let config = test_config(dir.path());
    let database_url = config.database_url.clone();
    let mut resumed = EtlPipeline::new(config).unwrap();
    assert!(resumed.load_latest_checkpoint().unwrap());
    let result = resumed.run(&json_path, "Owner", true).await.unwrap();

    assert_eq!(result.conversations_loaded, 2);
    assert_eq!(result.messages_loaded, 4);
    assert_eq!(message_count(&database_url).await, 4);

    // reference: an uninterrupted run over the same input
    let fresh_dir = TempDir::new().unwrap();
    let fresh_config = test_config(fresh_dir.path());
    let fresh_url = fresh_config.database_url.clone();
    let fresh_json = fresh_dir.path().join("export.json");
    fs::write(&fresh_json, export_json()).unwrap();
    let mut fresh = EtlPipeline::new(fresh_config).unwrap();
    let reference = fresh.run(&fresh_json, "Owner", false).await.unwrap();

    assert_eq!(result.conversations_loaded, reference.conversations_loaded);
    assert_eq!(result.messages_loaded, reference.messages_loaded);
    assert_eq!(message_count(&database_url).await, message_count(&fresh_url).await);
}

#[tokio::test]
async fn test_checkpoint_interval_writes_intra_load_checkpoints() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let json_path = dir.path().join("export.json");
    fs::write(&json_path, export_json()).unwrap();
    let mut config = test_config(dir.path());
    config.checkpoint_interval = Some(1);
    config.batch_size = 1;

    let mut pipeline = EtlPipeline::new(config).unwrap();
    let result = pipeline.run(&json_path, "Owner", false).await.unwrap();
    assert_eq!(result.messages_loaded, 4);

    // three phase-boundary checkpoints plus mid-load snapshots
    let checkpoints = fs::read_dir(dir.path().join("checkpoints")).unwrap().count();
    assert!(
        checkpoints > 3,
        "expected intra-load checkpoints beyond the phase boundaries, found {checkpoints}"
    );
}

#[tokio::test]
async fn test_corrupt_transform_artifact_fails_load_with_checkpoint() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let json_path = dir.path().join("export.json");
    fs::write(&json_path, export_json()).unwrap();

    // get as far as a transform-complete checkpoint, failing at load
    let mut broken = test_config(dir.path());
    broken.database_url = format!(
        "sqlite://{}",
        dir.path().join("missing/nested/db.sqlite").display()
    );
    let mut pipeline = EtlPipeline::new(broken).unwrap();
    assert!(pipeline.run(&json_path, "Owner", false).await.is_err());

    // corrupt the artifact the checkpoint points at; it still exists, so
    // the resumed run skips transform and trips over it during load
    let artifact = fs::read_dir(dir.path().join("work"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.extension().and_then(|e| e.to_str()) == Some("ndjson"))
        .expect("transform artifact present");
    fs::write(&artifact, "not json\n").unwrap();

    let mut resumed = EtlPipeline::new(test_config(dir.path())).unwrap();
    assert!(resumed.load_latest_checkpoint().unwrap());
    assert!(resumed.run(&json_path, "Owner", true).await.is_err());
    assert_eq!(
        resumed.context().phase_state(Phase::Load).status,
        PhaseStatus::Failed
    );

    // the on-disk checkpoint explains the failure
    let latest = chatvault_core::Checkpoint::latest_in_dir(&dir.path().join("checkpoints"))
        .expect("failure checkpoint written");
    assert_eq!(latest.phases[&Phase::Load].status, PhaseStatus::Failed);
    assert!(latest
        .errors
        .iter()
        .any(|record| record.phase == Phase::Load && record.message.contains("artifact")));
}

#[tokio::test]
async fn test_resume_skips_completed_load() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let json_path = dir.path().join("export.json");
    fs::write(&json_path, export_json()).unwrap();
    let config = test_config(dir.path());
    let database_url = config.database_url.clone();

    let mut pipeline = EtlPipeline::new(config).unwrap();
    let first = pipeline.run(&json_path, "Owner", false).await.unwrap();

    let mut resumed = EtlPipeline::new(test_config(dir.path())).unwrap();
    assert!(resumed.load_latest_checkpoint().unwrap());
    let second = resumed.run(&json_path, "Owner", true).await.unwrap();

    // nothing re-loaded, and the original export id is reported
    assert_eq!(second.messages_loaded, 0);
    assert_eq!(second.export_id, first.export_id);
    assert_eq!(message_count(&database_url).await, 4);
}

#[tokio::test]
async fn test_missing_source_fails_extract_phase() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut pipeline = EtlPipeline::new(test_config(dir.path())).unwrap();

    let err = pipeline.run(dir.path().join("absent.tar"), "Owner", false).await;
    assert!(err.is_err());
    assert_eq!(
        pipeline.context().phase_state(Phase::Extract).status,
        PhaseStatus::Failed
    );
    assert_eq!(pipeline.context().errors().len(), 1);
}
