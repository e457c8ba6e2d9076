//! Load phase: batched, idempotent writes into the relational store.
//!
//! Three tables: `raw_exports` records each import run, `conversations` and
//! `messages` hold normalized data keyed by natural identifiers so re-running
//! a load updates rows in place instead of duplicating them. Messages go in
//! batches of `batch_size`, one transaction per batch; a failed batch is
//! rolled back and recorded, and loading continues with the next one.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

use chatvault_core::context::{Phase, RunContext};
use chatvault_core::model::{ExportHeader, NormalizedConversation, NormalizedMessage};

pub struct Loader {
    pool: SqlitePool,
    batch_size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOutcome {
    pub export_id: i64,
    pub conversations_loaded: u64,
    pub messages_loaded: u64,
    pub failed_batches: u64,
}

/// Result of loading one conversation's messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationLoad {
    pub messages_loaded: u64,
    pub failed_batches: u64,
}

impl Loader {
    /// Open (creating if necessary) the target database. A single
    /// connection keeps transactional batches strictly ordered.
    pub async fn connect(database_url: &str, batch_size: usize) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open database")?;
        Ok(Self { pool, batch_size })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            create table if not exists raw_exports (
                export_id integer primary key autoincrement,
                owner_id text not null,
                owner_display_name text not null,
                export_timestamp text,
                file_source text not null check (file_source like '%.tar'),
                imported_at text not null,
                raw_document text
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            create table if not exists conversations (
                conversation_id text primary key,
                export_id integer not null references raw_exports(export_id),
                display_name text,
                first_message_time text,
                last_message_time text,
                message_count integer not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            create table if not exists messages (
                conversation_id text not null references conversations(conversation_id),
                message_id text not null,
                timestamp text,
                sender_id text,
                sender_name text,
                message_type text not null,
                cleaned_content text not null,
                raw_content text not null,
                edited integer not null,
                structured_data text not null,
                primary key (conversation_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load one transformed export. The raw-export record and conversation
    /// upserts are fatal on failure; message batches fail independently.
    #[instrument(skip_all, fields(conversations = conversations.len()))]
    pub async fn load_export(
        &self,
        header: &ExportHeader,
        owner_display_name: &str,
        source_label: Option<&str>,
        raw_document: Option<&str>,
        conversations: &[NormalizedConversation],
        ctx: &mut RunContext,
    ) -> Result<LoadOutcome> {
        let export_id = self
            .insert_raw_export(header, owner_display_name, source_label, raw_document)
            .await?;
        let mut outcome = LoadOutcome {
            export_id,
            ..Default::default()
        };

        for conversation in conversations {
            let load = self.load_conversation(export_id, conversation, ctx).await?;
            outcome.conversations_loaded += 1;
            outcome.messages_loaded += load.messages_loaded;
            outcome.failed_batches += load.failed_batches;
        }

        info!(
            export_id,
            conversations = outcome.conversations_loaded,
            messages = outcome.messages_loaded,
            failed_batches = outcome.failed_batches,
            "load complete"
        );
        Ok(outcome)
    }

    /// Load a single conversation: the conversation row is fatal on
    /// failure, message batches are not.
    pub async fn load_conversation(
        &self,
        export_id: i64,
        conversation: &NormalizedConversation,
        ctx: &mut RunContext,
    ) -> Result<ConversationLoad> {
        self.upsert_conversation(export_id, conversation).await?;
        let mut load = ConversationLoad::default();

        for (batch_idx, batch) in conversation.messages.chunks(self.batch_size).enumerate() {
            match self.insert_message_batch(batch).await {
                Ok(()) => {
                    load.messages_loaded += batch.len() as u64;
                    ctx.update_progress(0, batch.len() as u64);
                }
                Err(err) => {
                    load.failed_batches += 1;
                    warn!(
                        conversation_id = %conversation.id,
                        batch = batch_idx,
                        error = %err,
                        "message batch failed, continuing"
                    );
                    ctx.record_error(
                        Phase::Load,
                        format!(
                            "conversation '{}' batch {batch_idx} ({} messages): {err}",
                            conversation.id,
                            batch.len()
                        ),
                    );
                }
            }
        }
        ctx.update_progress(1, 0);
        Ok(load)
    }

    /// `raw_document` is the export JSON body; callers pass `None` when the
    /// document was too large to materialize (streaming mode), in which
    /// case the checkpoint's artifact path is the raw record of reference.
    pub async fn insert_raw_export(
        &self,
        header: &ExportHeader,
        owner_display_name: &str,
        source_label: Option<&str>,
        raw_document: Option<&str>,
    ) -> Result<i64> {
        let file_source = normalize_source_label(source_label);
        let export_id: i64 = sqlx::query_scalar(
            r#"
            insert into raw_exports
                (owner_id, owner_display_name, export_timestamp, file_source,
                 imported_at, raw_document)
            values ($1, $2, $3, $4, $5, $6)
            returning export_id
            "#,
        )
        .bind(&header.owner_id)
        .bind(owner_display_name)
        .bind(&header.export_timestamp)
        .bind(&file_source)
        .bind(Utc::now().to_rfc3339())
        .bind(raw_document)
        .fetch_one(&self.pool)
        .await
        .context("failed to record raw export")?;
        Ok(export_id)
    }

    async fn upsert_conversation(
        &self,
        export_id: i64,
        conversation: &NormalizedConversation,
    ) -> Result<()> {
        sqlx::query(
            r#"
            insert into conversations
                (conversation_id, export_id, display_name,
                 first_message_time, last_message_time, message_count)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (conversation_id)
            do update set
                export_id = excluded.export_id,
                display_name = excluded.display_name,
                first_message_time = excluded.first_message_time,
                last_message_time = excluded.last_message_time,
                message_count = excluded.message_count
            "#,
        )
        .bind(&conversation.id)
        .bind(export_id)
        .bind(&conversation.display_name)
        .bind(conversation.first_message_time.map(|t| t.to_rfc3339()))
        .bind(conversation.last_message_time.map(|t| t.to_rfc3339()))
        .bind(conversation.message_count as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert conversation '{}'", conversation.id))?;
        Ok(())
    }

    /// One transaction per batch. Any failure rolls the whole batch back.
    async fn insert_message_batch(&self, batch: &[NormalizedMessage]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in batch {
            let structured = serde_json::to_string(&message.structured_data)?;
            sqlx::query(
                r#"
                insert into messages
                    (conversation_id, message_id, timestamp, sender_id, sender_name,
                     message_type, cleaned_content, raw_content, edited, structured_data)
                values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                on conflict (conversation_id, message_id)
                do update set
                    timestamp = excluded.timestamp,
                    sender_id = excluded.sender_id,
                    sender_name = excluded.sender_name,
                    message_type = excluded.message_type,
                    cleaned_content = excluded.cleaned_content,
                    raw_content = excluded.raw_content,
                    edited = excluded.edited,
                    structured_data = excluded.structured_data
                "#,
            )
            .bind(&message.conversation_id)
            .bind(&message.message_id)
            .bind(message.timestamp.map(|t| t.to_rfc3339()))
            .bind(&message.sender_id)
            .bind(&message.sender_name)
            .bind(&message.message_type)
            .bind(&message.cleaned_content)
            .bind(&message.raw_content)
            .bind(message.edited)
            .bind(&structured)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Source labels must end in `.tar`. Labels that do not are suffixed rather
/// than replaced, so the original name stays recognizable; a missing label
/// gets a timestamped placeholder.
pub fn normalize_source_label(label: Option<&str>) -> String {
    match label {
        Some(label) if label.ends_with(".tar") => label.to_string(),
        Some(label) => {
            let normalized = format!("{label}.tar");
            warn!(original = %label, %normalized, "source label missing .tar suffix");
            normalized
        }
        None => format!("chatvault-export-{}.tar", Utc::now().timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_core::config::EtlConfig;
    use chatvault_core::model::parse_timestamp;
    use serde_json::Map;

    fn header() -> ExportHeader {
        ExportHeader {
            owner_id: "8:me".into(),
            export_timestamp: Some("2024-03-01T00:00:00Z".into()),
        }
    }

    fn message(conversation_id: &str, message_id: &str) -> NormalizedMessage {
        NormalizedMessage {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            timestamp: parse_timestamp("2024-03-01T10:00:00Z"),
            sender_id: Some("8:alice".into()),
            sender_name: Some("Alice".into()),
            message_type: "RichText".into(),
            cleaned_content: "hello".into(),
            raw_content: "hello".into(),
            edited: false,
            structured_data: Map::new(),
        }
    }

    fn conversation(id: &str, message_ids: &[&str]) -> NormalizedConversation {
        let messages: Vec<_> = message_ids.iter().map(|m| message(id, m)).collect();
        NormalizedConversation {
            id: id.into(),
            display_name: Some("Test".into()),
            first_message_time: parse_timestamp("2024-03-01T10:00:00Z"),
            last_message_time: parse_timestamp("2024-03-01T10:00:00Z"),
            message_count: messages.len() as u64,
            messages,
        }
    }

    async fn memory_loader(batch_size: usize) -> Loader {
        let loader = Loader::connect("sqlite::memory:", batch_size).await.unwrap();
        loader.ensure_schema().await.unwrap();
        loader
    }

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(EtlConfig::default());
        ctx.start_phase(Phase::Load, 0, 0).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_load_and_count() {
        let loader = memory_loader(2).await;
        let mut ctx = ctx();
        let conversations = vec![conversation("c1", &["m1", "m2", "m3"])];

        let outcome = loader
            .load_export(&header(), "Me", Some("export.tar"), None, &conversations, &mut ctx)
            .await
            .unwrap();
        assert_eq!(outcome.conversations_loaded, 1);
        assert_eq!(outcome.messages_loaded, 3);
        assert_eq!(outcome.failed_batches, 0);

        let count: i64 = sqlx::query_scalar("select count(*) from messages")
            .fetch_one(loader.pool())
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_reload_is_idempotent() {
        let loader = memory_loader(100).await;
        let mut ctx = ctx();
        let conversations = vec![conversation("c1", &["m1", "m2"])];

        loader
            .load_export(&header(), "Me", Some("a.tar"), None, &conversations, &mut ctx)
            .await
            .unwrap();
        loader
            .load_export(&header(), "Me", Some("a.tar"), None, &conversations, &mut ctx)
            .await
            .unwrap();

        let messages: i64 = sqlx::query_scalar("select count(*) from messages")
            .fetch_one(loader.pool())
            .await
            .unwrap();
        assert_eq!(messages, 2);
        let convs: i64 = sqlx::query_scalar("select count(*) from conversations")
            .fetch_one(loader.pool())
            .await
            .unwrap();
        assert_eq!(convs, 1);
        // every import run is still recorded
        let exports: i64 = sqlx::query_scalar("select count(*) from raw_exports")
            .fetch_one(loader.pool())
            .await
            .unwrap();
        assert_eq!(exports, 2);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_load() {
        let loader = Loader::connect("sqlite::memory:", 2).await.unwrap();
        // Stricter message table than the loader would create; ensure_schema
        // keeps it because of `if not exists`.
        sqlx::query(
            r#"
            create table messages (
                conversation_id text not null,
                message_id text not null check (length(message_id) < 10),
                timestamp text,
                sender_id text,
                sender_name text,
                message_type text not null,
                cleaned_content text not null,
                raw_content text not null,
                edited integer not null,
                structured_data text not null,
                primary key (conversation_id, message_id)
            )
            "#,
        )
        .execute(loader.pool())
        .await
        .unwrap();
        loader.ensure_schema().await.unwrap();

        let mut ctx = ctx();
        // batches of 2: [m1, m2] ok, [bad, m3] fails, [m4, m5] ok
        let conversations = vec![conversation(
            "c1",
            &["m1", "m2", "a-very-long-message-id", "m3", "m4", "m5"],
        )];
        let outcome = loader
            .load_export(&header(), "Me", Some("a.tar"), None, &conversations, &mut ctx)
            .await
            .unwrap();

        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.messages_loaded, 4);
        let count: i64 = sqlx::query_scalar("select count(*) from messages")
            .fetch_one(loader.pool())
            .await
            .unwrap();
        assert_eq!(count, 4);
        // the whole failing batch rolled back, including its valid row
        let m3: i64 = sqlx::query_scalar("select count(*) from messages where message_id = 'm3'")
            .fetch_one(loader.pool())
            .await
            .unwrap();
        assert_eq!(m3, 0);

        assert_eq!(ctx.errors().len(), 1);
        assert!(ctx.errors()[0].message.contains("batch 1"));
    }

    #[tokio::test]
    async fn test_source_label_constraint_enforced() {
        let loader = memory_loader(100).await;
        let result = sqlx::query(
            r#"
            insert into raw_exports
                (owner_id, owner_display_name, file_source, imported_at)
            values ('8:me', 'Me', 'export.zip', '2024-03-01T00:00:00Z')
            "#,
        )
        .execute(loader.pool())
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_source_label() {
        assert_eq!(normalize_source_label(Some("a.tar")), "a.tar");
        assert_eq!(normalize_source_label(Some("export.zip")), "export.zip.tar");
        assert_eq!(normalize_source_label(Some("plain")), "plain.tar");
        assert!(normalize_source_label(None).starts_with("chatvault-export-"));
        assert!(normalize_source_label(None).ends_with(".tar"));
    }
}
