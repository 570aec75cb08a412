use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::state::{ExecutionState, HumanInputContext, StateField};
use conflux_core::traits::ExecutionStore;
use conflux_core::types::{ExecutionId, ExecutionStatus, Message, MessageMetadata};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        graph_json TEXT NOT NULL,
        initial_input TEXT NOT NULL,
        project TEXT,
        conversation_history TEXT NOT NULL DEFAULT '',
        executed_nodes_json TEXT NOT NULL DEFAULT '{}',
        human_input_context_json TEXT,
        error TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS execution_messages (
        execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL,
        agent_name TEXT NOT NULL,
        agent_type TEXT NOT NULL,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        UNIQUE(execution_id, sequence)
    );

    CREATE INDEX IF NOT EXISTS idx_exec_status ON executions(status);";

/// Execution store backed by SQLite.
///
/// Messages live in their own table keyed by `(execution_id, sequence)`;
/// everything else is one row per execution carrying a version counter.
pub struct SqliteExecutionStore {
    conn: Mutex<Connection>,
}

impl SqliteExecutionStore {
    /// Open or create the execution database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             {SCHEMA}"
        ))
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(&format!("PRAGMA foreign_keys=ON;\n{SCHEMA}"))
            .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recently updated executions, newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<(ExecutionId, ExecutionStatus)>> {
        let conn = self.conn.lock().map_err(|e| ConfluxError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT id, status FROM executions ORDER BY updated_at DESC LIMIT ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, status) = row.map_err(db_err)?;
            out.push((ExecutionId(id), parse_status(&status)?));
        }
        Ok(out)
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn insert(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();

        Box::pin(async move {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| ConfluxError::Database(e.to_string()))?;
            let tx = conn.transaction().map_err(db_err)?;

            tx.execute(
                "INSERT INTO executions (id, status, graph_json, initial_input, project,
                     conversation_history, executed_nodes_json, human_input_context_json,
                     error, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    state.id.0,
                    state.status.as_str(),
                    serde_json::to_string(&state.graph)?,
                    state.initial_input,
                    state.project,
                    state.conversation_history,
                    serde_json::to_string(&state.executed_nodes)?,
                    encode_context(state.human_input_context.as_ref())?,
                    state.error,
                    state.version as i64,
                    state.created_at.to_rfc3339(),
                    state.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;

            for msg in &state.messages {
                insert_message(&tx, &state.id, msg)?;
            }

            tx.commit().map_err(db_err)?;
            debug!(execution_id = %state.id, "Execution inserted");
            Ok(())
        })
    }

    fn load(&self, id: &ExecutionId) -> BoxFuture<'_, Result<ExecutionState>> {
        let id = id.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| ConfluxError::Database(e.to_string()))?;

            let row = conn
                .query_row(
                    "SELECT status, graph_json, initial_input, project, conversation_history,
                            executed_nodes_json, human_input_context_json, error, version,
                            created_at, updated_at
                     FROM executions WHERE id = ?1",
                    params![id.0],
                    |row| {
                        Ok(ExecutionRow {
                            status: row.get(0)?,
                            graph_json: row.get(1)?,
                            initial_input: row.get(2)?,
                            project: row.get(3)?,
                            conversation_history: row.get(4)?,
                            executed_nodes_json: row.get(5)?,
                            human_input_context_json: row.get(6)?,
                            error: row.get(7)?,
                            version: row.get(8)?,
                            created_at: row.get(9)?,
                            updated_at: row.get(10)?,
                        })
                    },
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| ConfluxError::ExecutionNotFound(id.0.clone()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT sequence, agent_name, agent_type, content, kind, timestamp, metadata_json
                     FROM execution_messages
                     WHERE execution_id = ?1
                     ORDER BY sequence ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![id.0], |row| {
                    Ok(MessageRow {
                        sequence: row.get(0)?,
                        agent_name: row.get(1)?,
                        agent_type: row.get(2)?,
                        content: row.get(3)?,
                        kind: row.get(4)?,
                        timestamp: row.get(5)?,
                        metadata_json: row.get(6)?,
                    })
                })
                .map_err(db_err)?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.map_err(db_err)?.into_message()?);
            }

            let executed_nodes: BTreeMap<String, String> =
                serde_json::from_str(&row.executed_nodes_json)?;
            let human_input_context: Option<HumanInputContext> = row
                .human_input_context_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;

            Ok(ExecutionState {
                id,
                status: parse_status(&row.status)?,
                graph: serde_json::from_str(&row.graph_json)?,
                initial_input: row.initial_input,
                project: row.project,
                conversation_history: row.conversation_history,
                executed_nodes,
                messages,
                human_input_context,
                error: row.error,
                version: row.version as u64,
                created_at: parse_time(&row.created_at),
                updated_at: parse_time(&row.updated_at),
            })
        })
    }

    fn save(&self, state: &ExecutionState, fields: &[StateField]) -> BoxFuture<'_, Result<u64>> {
        let state = state.clone();
        let fields = fields.to_vec();

        Box::pin(async move {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| ConfluxError::Database(e.to_string()))?;
            let tx = conn.transaction().map_err(db_err)?;

            let found: i64 = tx
                .query_row(
                    "SELECT version FROM executions WHERE id = ?1",
                    params![state.id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| ConfluxError::ExecutionNotFound(state.id.0.clone()))?;

            if found as u64 != state.version {
                return Err(ConfluxError::StoreConflict {
                    execution: state.id.0.clone(),
                    expected: state.version,
                    found: found as u64,
                });
            }

            for field in &fields {
                match field {
                    StateField::Status => update_column(&tx, &state.id, "status", state.status.as_str())?,
                    StateField::ConversationHistory => {
                        update_column(&tx, &state.id, "conversation_history", &state.conversation_history)?
                    }
                    StateField::ExecutedNodes => update_column(
                        &tx,
                        &state.id,
                        "executed_nodes_json",
                        &serde_json::to_string(&state.executed_nodes)?,
                    )?,
                    StateField::HumanInputContext => {
                        tx.execute(
                            "UPDATE executions SET human_input_context_json = ?2 WHERE id = ?1",
                            params![state.id.0, encode_context(state.human_input_context.as_ref())?],
                        )
                        .map_err(db_err)?;
                    }
                    StateField::Error => {
                        tx.execute(
                            "UPDATE executions SET error = ?2 WHERE id = ?1",
                            params![state.id.0, state.error],
                        )
                        .map_err(db_err)?;
                    }
                    StateField::Messages => {
                        // Append-only: persist whatever is past the stored tail.
                        let tail: i64 = tx
                            .query_row(
                                "SELECT COALESCE(MAX(sequence), 0) FROM execution_messages
                                 WHERE execution_id = ?1",
                                params![state.id.0],
                                |row| row.get(0),
                            )
                            .map_err(db_err)?;
                        for msg in state.messages.iter().filter(|m| m.sequence as i64 > tail) {
                            insert_message(&tx, &state.id, msg)?;
                        }
                    }
                }
            }

            let new_version = state.version + 1;
            tx.execute(
                "UPDATE executions SET version = ?2, updated_at = ?3 WHERE id = ?1",
                params![state.id.0, new_version as i64, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            Ok(new_version)
        })
    }
}

struct ExecutionRow {
    status: String,
    graph_json: String,
    initial_input: String,
    project: Option<String>,
    conversation_history: String,
    executed_nodes_json: String,
    human_input_context_json: Option<String>,
    error: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

struct MessageRow {
    sequence: i64,
    agent_name: String,
    agent_type: String,
    content: String,
    kind: String,
    timestamp: String,
    metadata_json: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let metadata: MessageMetadata = serde_json::from_str(&self.metadata_json)?;
        Ok(Message {
            sequence: self.sequence as u64,
            agent_name: self.agent_name,
            agent_type: decode_tag(&self.agent_type)?,
            content: self.content,
            kind: decode_tag(&self.kind)?,
            timestamp: parse_time(&self.timestamp),
            metadata,
        })
    }
}

fn insert_message(tx: &Transaction<'_>, id: &ExecutionId, msg: &Message) -> Result<()> {
    tx.execute(
        "INSERT INTO execution_messages
             (execution_id, sequence, agent_name, agent_type, content, kind, timestamp, metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id.0,
            msg.sequence as i64,
            msg.agent_name,
            encode_tag(&msg.agent_type)?,
            msg.content,
            encode_tag(&msg.kind)?,
            msg.timestamp.to_rfc3339(),
            serde_json::to_string(&msg.metadata)?,
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ConfluxError::SequenceConflict(msg.sequence)
        }
        other => db_err(other),
    })?;
    Ok(())
}

fn update_column(tx: &Transaction<'_>, id: &ExecutionId, column: &str, value: &str) -> Result<()> {
    tx.execute(
        &format!("UPDATE executions SET {column} = ?2 WHERE id = ?1"),
        params![id.0, value],
    )
    .map_err(db_err)?;
    Ok(())
}

fn encode_context(ctx: Option<&HumanInputContext>) -> Result<Option<String>> {
    Ok(ctx.map(serde_json::to_string).transpose()?)
}

/// Unit enums are stored by their serde name.
fn encode_tag<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(ConfluxError::Database(format!("unexpected tag value: {}", other))),
    }
}

fn decode_tag<T: DeserializeOwned>(tag: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(tag.to_string()))?)
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    ExecutionStatus::parse(s).ok_or_else(|| ConfluxError::Database(format!("unknown status '{}'", s)))
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> ConfluxError {
    ConfluxError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::graph::{Edge, Graph, Node, NodeKind};
    use conflux_core::types::{MessageDraft, MessageKind};

    fn sample_state() -> ExecutionState {
        let graph = Graph::new(
            vec![Node::start("start"), Node::assistant("writer"), Node::end("end")],
            vec![Edge::sequential("start", "writer"), Edge::sequential("writer", "end")],
        );
        ExecutionState::new(graph, "write a haiku").with_project("acme")
    }

    #[tokio::test]
    async fn test_insert_and_load_roundtrip() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let mut state = sample_state();
        state.executed_nodes.insert("start".into(), "write a haiku".into());
        state.messages.push(
            MessageDraft::new("start", NodeKind::Start, MessageKind::WorkflowStart, "write a haiku")
                .into_message(1),
        );

        store.insert(&state).await.unwrap();
        let loaded = store.load(&state.id).await.unwrap();

        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.graph, state.graph);
        assert_eq!(loaded.project.as_deref(), Some("acme"));
        assert_eq!(loaded.output_of("start"), Some("write a haiku"));
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].kind, MessageKind::WorkflowStart);
        assert_eq!(loaded.messages[0].agent_type, NodeKind::Start);
    }

    #[tokio::test]
    async fn test_load_missing_execution() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let err = store.load(&ExecutionId::from_str("nope")).await.unwrap_err();
        assert!(matches!(err, ConfluxError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn test_partial_save_only_writes_listed_fields() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let mut state = sample_state();
        store.insert(&state).await.unwrap();

        state.status = ExecutionStatus::Stopped;
        state.conversation_history = "not saved".into();
        let version = store.save(&state, &[StateField::Status]).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.load(&state.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Stopped);
        assert_eq!(loaded.conversation_history, "");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let state = sample_state();
        store.insert(&state).await.unwrap();

        store.save(&state, &[StateField::Status]).await.unwrap();
        // Same snapshot again: version 0 is now stale.
        let err = store.save(&state, &[StateField::Status]).await.unwrap_err();
        match err {
            ConfluxError::StoreConflict { expected, found, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(found, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_messages_are_appended_past_tail() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let mut state = sample_state();
        store.insert(&state).await.unwrap();

        for seq in 1..=2 {
            state.messages.push(
                MessageDraft::new("writer", NodeKind::Assistant, MessageKind::Chat, format!("m{seq}"))
                    .into_message(seq),
            );
        }
        state.version = store.save(&state, &[StateField::Messages]).await.unwrap();

        state.messages.push(
            MessageDraft::new("writer", NodeKind::Assistant, MessageKind::Chat, "m3").into_message(3),
        );
        store.save(&state, &[StateField::Messages]).await.unwrap();

        let loaded = store.load(&state.id).await.unwrap();
        let seqs: Vec<u64> = loaded.messages.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_file_backed_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("executions.db");
        let state = sample_state();
        {
            let store = SqliteExecutionStore::open(&path).unwrap();
            store.insert(&state).await.unwrap();
        }
        let store = SqliteExecutionStore::open(&path).unwrap();
        let loaded = store.load(&state.id).await.unwrap();
        assert_eq!(loaded.initial_input, "write a haiku");

        let recent = store.list_recent(10).unwrap();
        assert_eq!(recent, vec![(state.id.clone(), ExecutionStatus::Running)]);
    }
}
