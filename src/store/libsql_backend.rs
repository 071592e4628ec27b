//! libSQL store for processed messages.
//!
//! One row per message id. Saving the same id twice replaces the earlier
//! extraction so a redelivered message never creates a duplicate.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{ExtractedFields, ExtractionAction, ExtractionDecision, InboundMessage};
use crate::store::migrations;
use crate::store::traits::{MessageStore, ReviewStatus, StoredMessage};

/// libSQL database backend.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and one-shot runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Fetch one processed message by id.
    pub async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_message(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    /// Messages waiting for a human, oldest first.
    pub async fn list_pending_review(&self) -> Result<Vec<StoredMessage>, DatabaseError> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = ?1 ORDER BY received_at ASC"
                ),
                params![ReviewStatus::PendingReview.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_review: {e}")))?;

        collect_messages(rows, "list_pending_review").await
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "id, sender, subject, raw_body, received_at, action, confidence, requires_review, reasoning, extracted_fields, status, processed_at";

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let received_str: String = row.get(4).map_err(parse)?;
    let action_str: String = row.get(5).map_err(parse)?;
    let fields_str: String = row.get(9).map_err(parse)?;
    let status_str: String = row.get(10).map_err(parse)?;
    let processed_str: String = row.get(11).map_err(parse)?;

    let extracted_fields: ExtractedFields = serde_json::from_str(&fields_str)
        .map_err(|e| DatabaseError::Serialization(format!("extracted_fields: {e}")))?;
    let status = status_str
        .parse::<ReviewStatus>()
        .map_err(DatabaseError::Serialization)?;

    Ok(StoredMessage {
        id: row.get(0).map_err(parse)?,
        sender: row.get(1).map_err(parse)?,
        subject: row.get(2).map_err(parse)?,
        raw_body: row.get(3).map_err(parse)?,
        received_at: parse_datetime(&received_str),
        action: ExtractionAction::from_label(&action_str),
        confidence: row.get(6).map_err(parse)?,
        requires_review: row.get::<i64>(7).map_err(parse)? != 0,
        reasoning: row.get(8).map_err(parse)?,
        extracted_fields,
        status,
        processed_at: parse_datetime(&processed_str),
    })
}

/// Drain a row stream. Unparseable rows are skipped; a failing step is an error.
async fn collect_messages(
    mut rows: libsql::Rows,
    op: &str,
) -> Result<Vec<StoredMessage>, DatabaseError> {
    let mut messages = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            },
            Ok(None) => return Ok(messages),
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlStore {
    async fn save_message(
        &self,
        message: &InboundMessage,
        decision: &ExtractionDecision,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let status = ReviewStatus::for_decision(decision);
        let fields = serde_json::to_string(decision.extracted_fields())
            .map_err(|e| DatabaseError::Serialization(format!("extracted_fields: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO messages (id, sender, subject, raw_body, received_at, action,
                    confidence, requires_review, reasoning, extracted_fields, status,
                    processed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    sender = excluded.sender,
                    subject = excluded.subject,
                    raw_body = excluded.raw_body,
                    received_at = excluded.received_at,
                    action = excluded.action,
                    confidence = excluded.confidence,
                    requires_review = excluded.requires_review,
                    reasoning = excluded.reasoning,
                    extracted_fields = excluded.extracted_fields,
                    status = excluded.status,
                    processed_at = excluded.processed_at,
                    updated_at = excluded.updated_at",
                params![
                    message.id.as_str(),
                    message.sender.as_str(),
                    message.subject.as_str(),
                    message.body.as_str(),
                    message.received_at.to_rfc3339(),
                    decision.action().label(),
                    decision.confidence(),
                    i64::from(decision.requires_human_review()),
                    decision.reasoning(),
                    fields,
                    status.as_str(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_message: {e}")))?;

        debug!(id = %message.id, status = status.as_str(), "Message saved");
        Ok(())
    }
}
