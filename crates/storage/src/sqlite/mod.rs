use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, DecodeRecordSnafu, EncodeRecordSnafu,
    InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, FolderId, MessageId};
use super::types::{
    ConversationRecord, FolderRecord, MessageRecord, MessageRole, WriteBatch, WriteOp,
};
use super::{BatchWriter, BoxFuture, ConversationStore, FolderStore, MessageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database and runs pending migrations.
    /// `:memory:` and `sqlite:` URLs are accepted as well as plain paths.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single connection serializes writers and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { pool, database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl ConversationStore for SqliteStorage {
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, folder_id, root_message_id, created_at, updated_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, folder_id, root_message_id, created_at, updated_at FROM conversations ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }
}

impl MessageStore for SqliteStorage {
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, role, content_json, parent_id, child_ids_json, active_child_index, created_at FROM messages WHERE id = ?",
            )
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-get-query",
            })?;

            row.map(message_row_to_record).transpose()
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, role, content_json, parent_id, child_ids_json, active_child_index, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

impl FolderStore for SqliteStorage {
    fn get_folder(&self, folder_id: FolderId) -> BoxFuture<'_, StorageResult<Option<FolderRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, FolderRow>(
                "SELECT id, name, position, created_at FROM folders WHERE id = ?",
            )
            .bind(folder_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "folder-get-query",
            })?;

            row.map(folder_row_to_record).transpose()
        })
    }

    fn list_folders(&self) -> BoxFuture<'_, StorageResult<Vec<FolderRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, FolderRow>(
                "SELECT id, name, position, created_at FROM folders ORDER BY position ASC, id ASC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "folder-list-query",
            })?;

            rows.into_iter().map(folder_row_to_record).collect()
        })
    }
}

impl BatchWriter for SqliteStorage {
    fn ping(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-ping",
                })?;
            Ok(())
        })
    }

    fn commit(&self, batch: WriteBatch) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let op_count = batch.len();
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "batch-begin",
            })?;

            // Dropping `tx` on an early return rolls every preceding op back.
            for op in batch.into_ops() {
                apply_op(&mut tx, op).await?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "batch-commit",
            })?;

            tracing::trace!(op_count, "sqlite batch committed");
            Ok(())
        })
    }
}

async fn apply_op(tx: &mut Transaction<'static, Sqlite>, op: WriteOp) -> StorageResult<()> {
    match op {
        WriteOp::CreateConversation(record) => {
            let result = sqlx::query(
                "INSERT INTO conversations (id, title, folder_id, root_message_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(record.id.to_string())
            .bind(&record.title)
            .bind(record.folder_id.map(|id| id.to_string()))
            .bind(record.root_message_id.map(|id| id.to_string()))
            .bind(u64_to_i64(record.created_at_unix_ms, "conversation-create-created-at")?)
            .bind(u64_to_i64(record.updated_at_unix_ms, "conversation-create-updated-at")?)
            .execute(&mut **tx)
            .await;
            map_insert_result(
                result,
                "conversation-create-insert",
                "conversation",
                record.id.to_string(),
            )?;
        }
        WriteOp::PutConversation(record) => {
            sqlx::query(
                "INSERT INTO conversations (id, title, folder_id, root_message_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, folder_id = excluded.folder_id, \
                 root_message_id = excluded.root_message_id, updated_at = excluded.updated_at",
            )
            .bind(record.id.to_string())
            .bind(&record.title)
            .bind(record.folder_id.map(|id| id.to_string()))
            .bind(record.root_message_id.map(|id| id.to_string()))
            .bind(u64_to_i64(record.created_at_unix_ms, "conversation-put-created-at")?)
            .bind(u64_to_i64(record.updated_at_unix_ms, "conversation-put-updated-at")?)
            .execute(&mut **tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-put-upsert",
            })?;
        }
        WriteOp::DeleteConversation(conversation_id) => {
            // Messages cascade through the foreign key.
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.to_string())
                .execute(&mut **tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete",
                })?;
        }
        WriteOp::CreateMessage(record) => {
            let child_ids_json = encode_child_ids(&record.child_ids)?;
            let result = sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content_json, parent_id, child_ids_json, active_child_index, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.id.to_string())
            .bind(record.conversation_id.to_string())
            .bind(record.role.as_str())
            .bind(&record.content_json)
            .bind(record.parent_id.map(|id| id.to_string()))
            .bind(child_ids_json)
            .bind(record.active_child_index.map(i64::from))
            .bind(u64_to_i64(record.created_at_unix_ms, "message-create-created-at")?)
            .execute(&mut **tx)
            .await;
            map_insert_result(
                result,
                "message-create-insert",
                "message",
                record.id.to_string(),
            )?;
        }
        WriteOp::PutMessage(record) => {
            let child_ids_json = encode_child_ids(&record.child_ids)?;
            let result = sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content_json, parent_id, child_ids_json, active_child_index, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET role = excluded.role, content_json = excluded.content_json, \
                 parent_id = excluded.parent_id, child_ids_json = excluded.child_ids_json, \
                 active_child_index = excluded.active_child_index \
                 WHERE messages.conversation_id = excluded.conversation_id",
            )
            .bind(record.id.to_string())
            .bind(record.conversation_id.to_string())
            .bind(record.role.as_str())
            .bind(&record.content_json)
            .bind(record.parent_id.map(|id| id.to_string()))
            .bind(child_ids_json)
            .bind(record.active_child_index.map(i64::from))
            .bind(u64_to_i64(record.created_at_unix_ms, "message-put-created-at")?)
            .execute(&mut **tx)
            .await;

            let rows_affected = map_insert_result(
                result,
                "message-put-upsert",
                "message",
                record.id.to_string(),
            )?;
            if rows_affected == 0 {
                return InvariantViolationSnafu {
                    stage: "message-put-cross-conversation",
                    details: format!(
                        "message '{}' does not belong to conversation '{}'",
                        record.id, record.conversation_id
                    ),
                }
                .fail();
            }
        }
        WriteOp::DeleteMessage {
            conversation_id,
            message_id,
        } => {
            let owner = sqlx::query_scalar::<_, String>(
                "SELECT conversation_id FROM messages WHERE id = ?",
            )
            .bind(message_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-delete-load-owner",
            })?;

            let Some(owner) = owner else {
                return Ok(());
            };
            if owner != conversation_id.to_string() {
                return InvariantViolationSnafu {
                    stage: "message-delete-cross-conversation",
                    details: format!(
                        "message '{message_id}' does not belong to conversation '{conversation_id}'"
                    ),
                }
                .fail();
            }

            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(message_id.to_string())
                .execute(&mut **tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete",
                })?;
        }
        WriteOp::PutFolder(record) => {
            sqlx::query(
                "INSERT INTO folders (id, name, position, created_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, position = excluded.position",
            )
            .bind(record.id.to_string())
            .bind(&record.name)
            .bind(i64::from(record.position))
            .bind(u64_to_i64(record.created_at_unix_ms, "folder-put-created-at")?)
            .execute(&mut **tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "folder-put-upsert",
            })?;
        }
        WriteOp::DeleteFolder(folder_id) => {
            sqlx::query("DELETE FROM folders WHERE id = ?")
                .bind(folder_id.to_string())
                .execute(&mut **tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "folder-delete",
                })?;
        }
    }

    Ok(())
}

fn map_insert_result(
    result: Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
    stage: &'static str,
    entity: &'static str,
    id: String,
) -> StorageResult<u64> {
    match result {
        Ok(done) => Ok(done.rows_affected()),
        Err(source) => {
            let (unique, foreign_key) = source
                .as_database_error()
                .map(|error| (error.is_unique_violation(), error.is_foreign_key_violation()))
                .unwrap_or((false, false));

            if unique {
                return ConflictSnafu {
                    stage,
                    entity,
                    details: format!("{entity} '{id}' already exists"),
                }
                .fail();
            }
            if foreign_key {
                return InvariantViolationSnafu {
                    stage,
                    details: format!("{entity} '{id}' references a missing conversation"),
                }
                .fail();
            }

            Err(StorageError::SqliteQuery { stage, source })
        }
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    folder_id: Option<String>,
    root_message_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content_json: String,
    parent_id: Option<String>,
    child_ids_json: String,
    active_child_index: Option<i64>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct FolderRow {
    id: String,
    name: String,
    position: i64,
    created_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        folder_id: row.folder_id.as_deref().map(FolderId::parse).transpose()?,
        root_message_id: row
            .root_message_id
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
        created_at_unix_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let raw_child_ids: Vec<String> =
        serde_json::from_str(&row.child_ids_json).context(DecodeRecordSnafu {
            stage: "message-row-child-ids",
            entity: "message",
            id: row.id.clone(),
        })?;
    let child_ids = raw_child_ids
        .iter()
        .map(|raw| MessageId::parse(raw))
        .collect::<StorageResult<Vec<_>>>()?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        role: MessageRole::parse(&row.role).context(InvariantViolationSnafu {
            stage: "message-row-role",
            details: format!("unknown message role '{}'", row.role),
        })?,
        content_json: row.content_json,
        parent_id: row.parent_id.as_deref().map(MessageId::parse).transpose()?,
        child_ids,
        active_child_index: row
            .active_child_index
            .map(|value| i64_to_u32(value, "message-row-active-child-index"))
            .transpose()?,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn folder_row_to_record(row: FolderRow) -> StorageResult<FolderRecord> {
    Ok(FolderRecord {
        id: FolderId::parse(&row.id)?,
        name: row.name,
        position: i64_to_u32(row.position, "folder-row-position")?,
        created_at_unix_ms: i64_to_u64(row.created_at, "folder-row-created-at")?,
    })
}

fn encode_child_ids(child_ids: &[MessageId]) -> StorageResult<String> {
    let raw = child_ids.iter().map(ToString::to_string).collect::<Vec<_>>();
    serde_json::to_string(&raw).context(EncodeRecordSnafu {
        stage: "message-encode-child-ids",
        entity: "message",
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    u64::try_from(value).ok().context(InvariantViolationSnafu {
        stage,
        details: format!("expected non-negative integer, got {value}"),
    })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    u32::try_from(value).ok().context(InvariantViolationSnafu {
        stage,
        details: format!("expected u32-compatible integer, got {value}"),
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    i64::try_from(value).ok().context(InvariantViolationSnafu {
        stage,
        details: format!("integer {value} exceeds sqlite range"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(id: ConversationId) -> ConversationRecord {
        ConversationRecord {
            id,
            title: "Sqlite".to_string(),
            folder_id: None,
            root_message_id: None,
            created_at_unix_ms: 5,
            updated_at_unix_ms: 5,
        }
    }

    fn message(conversation_id: ConversationId, child_ids: Vec<MessageId>) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            conversation_id,
            role: MessageRole::Assistant,
            content_json: r#"[{"type":"text","text":"hi"}]"#.to_string(),
            parent_id: None,
            active_child_index: if child_ids.is_empty() { None } else { Some(0) },
            child_ids,
            created_at_unix_ms: 7,
        }
    }

    async fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("nested").join("arbor.sqlite3");
        let storage = SqliteStorage::open(&path.display().to_string())
            .await
            .expect("sqlite opens");
        (directory, storage)
    }

    #[tokio::test]
    async fn message_records_survive_a_write_read_cycle() {
        let (_directory, storage) = open_temp().await;
        let conversation_id = ConversationId::new_v7();
        let child = MessageId::new_v7();
        let record = message(conversation_id, vec![child]);

        let mut batch = WriteBatch::new();
        batch
            .create_conversation(conversation(conversation_id))
            .create_message(record.clone());
        storage.commit(batch).await.expect("batch commits");

        let loaded = storage
            .get_message(record.id)
            .await
            .expect("read succeeds")
            .expect("message exists");
        assert_eq!(loaded, record);
        assert_eq!(
            storage.list_messages(conversation_id).await.expect("list"),
            vec![record]
        );
    }

    #[tokio::test]
    async fn failing_op_rolls_back_the_whole_batch() {
        let (_directory, storage) = open_temp().await;
        let conversation_id = ConversationId::new_v7();

        let mut batch = WriteBatch::new();
        batch
            .create_conversation(conversation(conversation_id))
            .create_message(message(ConversationId::new_v7(), Vec::new()));

        let error = storage.commit(batch).await.expect_err("orphan message fails");
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
        assert!(
            storage
                .get_conversation(conversation_id)
                .await
                .expect("read succeeds")
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict_and_delete_cascades() {
        let (_directory, storage) = open_temp().await;
        let conversation_id = ConversationId::new_v7();
        let record = message(conversation_id, Vec::new());

        let mut batch = WriteBatch::new();
        batch
            .create_conversation(conversation(conversation_id))
            .create_message(record.clone());
        storage.commit(batch).await.expect("seed commits");

        let mut duplicate = WriteBatch::new();
        duplicate.create_message(record.clone());
        let error = storage.commit(duplicate).await.expect_err("duplicate fails");
        assert!(matches!(error, StorageError::Conflict { .. }));

        let mut delete = WriteBatch::new();
        delete
            .delete_message(conversation_id, record.id)
            .delete_conversation(conversation_id);
        storage.commit(delete).await.expect("delete commits");

        assert!(storage.get_message(record.id).await.expect("read").is_none());
        assert!(storage.list_conversations().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn folders_list_by_position() {
        let (_directory, storage) = open_temp().await;
        let second = FolderRecord {
            id: FolderId::new_v7(),
            name: "Later".to_string(),
            position: 1,
            created_at_unix_ms: 1,
        };
        let first = FolderRecord {
            id: FolderId::new_v7(),
            name: "Sooner".to_string(),
            position: 0,
            created_at_unix_ms: 2,
        };

        let mut batch = WriteBatch::new();
        batch.put_folder(second.clone()).put_folder(first.clone());
        storage.commit(batch).await.expect("folders commit");

        assert_eq!(
            storage.list_folders().await.expect("list"),
            vec![first, second]
        );
    }
}
