//! libSQL backend for `TaskStore`.
//!
//! Supports local file and in-memory databases. All status writes are single
//! conditional `UPDATE`s so the affected-row count is the CAS result. Writes
//! that touch more than one row set run in a transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::events::TaskEvent;
use crate::tasks::model::{AuthorKind, Comment, EntityKind, EntityRef, Task, TaskStatus};
use crate::tasks::state::StatusFields;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
/// Writes hold `write_lock` so no statement lands inside another writer's
/// open transaction.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Fill a task's relationship sets from `task_entities`.
    async fn load_links(&self, task: &mut Task) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT entity_id, kind FROM task_entities WHERE task_id = ?1 ORDER BY rowid",
                params![task.id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_links: {e}")))?;

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_links row: {e}")))?
        {
            let id_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("task_entities.entity_id: {e}")))?;
            let kind_str: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("task_entities.kind: {e}")))?;
            let entity_id = parse_uuid(&id_str, "task_entities.entity_id")?;
            let kind = parse_entity_kind(&kind_str)?;
            match kind {
                EntityKind::Person => task.people.push(entity_id),
                EntityKind::Project => task.projects.push(entity_id),
                EntityKind::Chat => task.chats.push(entity_id),
                EntityKind::Artifact => task.artifacts.push(entity_id),
            }
        }
        Ok(())
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams + Send,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        for task in &mut tasks {
            self.load_links(task).await?;
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width, so text ordering is time ordering.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str, field: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "{field}: unparseable datetime {s:?}"
    )))
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

fn parse_entity_kind(s: &str) -> Result<EntityKind, DatabaseError> {
    EntityKind::parse(s)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown entity kind: {s}")))
}

/// SQLite reports the partial unique index on `in_progress` this way.
fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

const TASK_COLUMNS: &str = "id, title, description, summary, status, needs_decision, decision_type, tags, created_at, updated_at, completed_at";

const COMMENT_COLUMNS: &str = "id, task_id, author, content, created_at";

const EVENT_COLUMNS: &str = "id, task_id, event_type, timestamp, data, source";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = parse_uuid(&id_str, "task.id")?;
    let title: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.title: {e}")))?;
    let description: Option<String> = row.get(2).ok();
    let summary: Option<String> = row.get(3).ok();

    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown task status: {status_str}")))?;

    let needs_decision: i64 = row.get(5).unwrap_or(0);
    let decision_type: Option<String> = row.get(6).ok();

    let tags_str: String = row.get(7).unwrap_or_else(|_| "[]".to_string());
    let tags: Vec<String> = serde_json::from_str(&tags_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.tags: {e}")))?;

    let created_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("task.created_at: {e}")))?;
    let updated_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Query(format!("task.updated_at: {e}")))?;
    let completed_str: Option<String> = row.get(10).ok();

    Ok(Task {
        id,
        title,
        description,
        comments: Vec::new(),
        summary,
        status,
        needs_decision: needs_decision != 0,
        decision_type,
        tags,
        people: Vec::new(),
        projects: Vec::new(),
        chats: Vec::new(),
        artifacts: Vec::new(),
        created_at: parse_datetime(&created_str, "task.created_at")?,
        updated_at: parse_datetime(&updated_str, "task.updated_at")?,
        completed_at: completed_str
            .map(|s| parse_datetime(&s, "task.completed_at"))
            .transpose()?,
    })
}

fn row_to_comment(row: &libsql::Row) -> Result<Comment, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("comment.id: {e}")))?;
    let task_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("comment.task_id: {e}")))?;
    let author_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("comment.author: {e}")))?;
    let content: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("comment.content: {e}")))?;
    let created_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("comment.created_at: {e}")))?;

    let author = AuthorKind::parse(&author_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown author: {author_str}")))?;

    Ok(Comment {
        id: parse_uuid(&id_str, "comment.id")?,
        task_id: parse_uuid(&task_str, "comment.task_id")?,
        author,
        content,
        created_at: parse_datetime(&created_str, "comment.created_at")?,
    })
}

fn row_to_event(row: &libsql::Row) -> Result<TaskEvent, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("event.id: {e}")))?;
    let task_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("event.task_id: {e}")))?;
    let event_type: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("event.event_type: {e}")))?;
    let ts_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("event.timestamp: {e}")))?;
    let data_str: String = row.get(4).unwrap_or_else(|_| "{}".to_string());
    let source: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("event.source: {e}")))?;

    Ok(TaskEvent {
        id: parse_uuid(&id_str, "event.id")?,
        event_type,
        timestamp: parse_datetime(&ts_str, "event.timestamp")?,
        task_id: parse_uuid(&task_str, "event.task_id")?,
        data: serde_json::from_str(&data_str)
            .map_err(|e| DatabaseError::Serialization(format!("event.data: {e}")))?,
        source,
    })
}

// ── Statements ──────────────────────────────────────────────────────
//
// Take a `&Connection` so they run the same on the shared connection and
// inside a `Transaction`.

async fn insert_task(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    let tags = serde_json::to_string(&task.tags)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
        params![
            task.id.to_string(),
            task.title.as_str(),
            task.description.clone(),
            task.summary.clone(),
            task.status.as_str(),
            task.needs_decision as i64,
            task.decision_type.clone(),
            tags,
            fmt_datetime(&task.created_at),
            fmt_datetime(&task.updated_at),
            task.completed_at.as_ref().map(fmt_datetime),
        ],
    )
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DatabaseError::Constraint(format!("create_task: {e}"))
        } else {
            DatabaseError::Query(format!("create_task: {e}"))
        }
    })?;
    Ok(())
}

async fn exec_update_status(
    conn: &Connection,
    id: Uuid,
    expected: TaskStatus,
    target: TaskStatus,
    fields: &StatusFields,
) -> Result<bool, DatabaseError> {
    let result = conn
        .execute(
            "UPDATE tasks SET status = ?1, needs_decision = ?2, decision_type = ?3,
                summary = COALESCE(?4, summary),
                completed_at = COALESCE(completed_at, ?5),
                updated_at = ?6
             WHERE id = ?7 AND status = ?8",
            params![
                target.as_str(),
                fields.needs_decision as i64,
                fields.decision_type.clone(),
                fields.summary.clone(),
                fields.completed_at.as_ref().map(fmt_datetime),
                fmt_datetime(&fields.updated_at),
                id.to_string(),
                expected.as_str(),
            ],
        )
        .await;

    match result {
        Ok(count) => Ok(count == 1),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(DatabaseError::Query(format!("update_status: {e}"))),
    }
}

async fn insert_comment(conn: &Connection, comment: &Comment) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO comments ({COMMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
        params![
            comment.id.to_string(),
            comment.task_id.to_string(),
            comment.author.as_str(),
            comment.content.as_str(),
            fmt_datetime(&comment.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("append_comment: {e}")))?;
    Ok(())
}

async fn insert_link(
    conn: &Connection,
    task_id: Uuid,
    entity_id: Uuid,
    kind: EntityKind,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO task_entities (task_id, entity_id, kind) VALUES (?1, ?2, ?3)",
        params![task_id.to_string(), entity_id.to_string(), kind.as_str()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("link_entity: {e}")))?;
    Ok(())
}

async fn rollback(tx: libsql::Transaction, op: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(op, error = %e, "Rollback failed");
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task begin: {e}")))?;

        let written = async {
            insert_task(&tx, task).await?;
            for comment in &task.comments {
                insert_comment(&tx, comment).await?;
            }
            for kind in [
                EntityKind::Person,
                EntityKind::Project,
                EntityKind::Chat,
                EntityKind::Artifact,
            ] {
                for entity_id in task.related(kind) {
                    insert_link(&tx, task.id, *entity_id, kind).await?;
                }
            }
            Ok::<(), DatabaseError>(())
        }
        .await;

        if let Err(e) = written {
            rollback(tx, "create_task").await;
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task commit: {e}")))?;

        debug!(task_id = %task.id, status = %task.status, "Task created");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        let mut task = match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_task row: {e}"))),
        };
        self.load_links(&mut task).await?;
        task.comments = self.list_comments(id, None).await?;
        Ok(Some(task))
    }

    async fn get_next_eligible(&self) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get_next_eligible",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ('new', 'todo') \
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                (),
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn claim(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = fmt_datetime(&Utc::now());
        let result = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'in_progress', needs_decision = 0, decision_type = NULL, updated_at = ?2
                 WHERE id = ?1 AND status IN ('new', 'todo')
                   AND NOT EXISTS (SELECT 1 FROM tasks WHERE status = 'in_progress')",
                params![id.to_string(), now],
            )
            .await;

        match result {
            Ok(count) => Ok(count == 1),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("claim: {e}"))),
        }
    }

    async fn release(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = fmt_datetime(&Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'todo', updated_at = ?2 WHERE id = ?1 AND status = 'in_progress'",
                params![id.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release: {e}")))?;
        Ok(count == 1)
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        target: TaskStatus,
        fields: &StatusFields,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        exec_update_status(self.conn(), id, expected, target, fields).await
    }

    async fn update_status_with_comment(
        &self,
        id: Uuid,
        expected: TaskStatus,
        target: TaskStatus,
        fields: &StatusFields,
        comment: &Comment,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status_with_comment begin: {e}")))?;

        match exec_update_status(&tx, id, expected, target, fields).await {
            Ok(true) => {}
            Ok(false) => {
                rollback(tx, "update_status_with_comment").await;
                return Ok(false);
            }
            Err(e) => {
                rollback(tx, "update_status_with_comment").await;
                return Err(e);
            }
        }
        if let Err(e) = insert_comment(&tx, comment).await {
            rollback(tx, "update_status_with_comment").await;
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status_with_comment commit: {e}")))?;

        debug!(task_id = %id, from = %expected, to = %target, author = comment.author.as_str(), "Status and comment written");
        Ok(true)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_by_status",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC"
            ),
            params![status.as_str()],
        )
        .await
    }

    async fn count_in_progress(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE status = 'in_progress'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_in_progress: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_in_progress: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_in_progress: {e}"))),
        }
    }

    // ── Comments ────────────────────────────────────────────────────

    async fn append_comment(&self, comment: &Comment) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_comment(self.conn(), comment).await?;
        debug!(task_id = %comment.task_id, author = comment.author.as_str(), "Comment appended");
        Ok(())
    }

    async fn list_comments(
        &self,
        task_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Comment>, DatabaseError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM (
                        SELECT {COMMENT_COLUMNS}, rowid AS seq FROM comments
                        WHERE task_id = ?1
                        ORDER BY created_at DESC, seq DESC
                        LIMIT ?2
                     ) ORDER BY created_at ASC, seq ASC"
                ),
                params![task_id.to_string(), limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_comments: {e}")))?;

        let mut comments = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_comments row: {e}")))?
        {
            comments.push(row_to_comment(&row)?);
        }
        Ok(comments)
    }

    // ── Entities ────────────────────────────────────────────────────

    async fn upsert_entity(&self, entity: &EntityRef) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO entities (id, kind, name, summary) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET kind = ?2, name = ?3, summary = ?4",
                params![
                    entity.id.to_string(),
                    entity.kind.as_str(),
                    entity.name.as_str(),
                    entity.summary.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_entity: {e}")))?;
        Ok(())
    }

    async fn link_entity(
        &self,
        task_id: Uuid,
        entity_id: Uuid,
        kind: EntityKind,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_link(self.conn(), task_id, entity_id, kind).await
    }

    async fn related_entities(&self, task_id: Uuid) -> Result<Vec<EntityRef>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT e.id, e.kind, e.name, e.summary
                 FROM task_entities te JOIN entities e ON e.id = te.entity_id
                 WHERE te.task_id = ?1
                 ORDER BY te.rowid",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("related_entities: {e}")))?;

        let mut entities = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("related_entities row: {e}")))?
        {
            let id_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("entity.id: {e}")))?;
            let kind_str: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("entity.kind: {e}")))?;
            let name: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("entity.name: {e}")))?;
            let summary: Option<String> = row.get(3).ok();
            entities.push(EntityRef {
                id: parse_uuid(&id_str, "entity.id")?,
                kind: parse_entity_kind(&kind_str)?,
                name,
                summary,
            });
        }
        Ok(entities)
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn save_event(&self, event: &TaskEvent) -> Result<(), DatabaseError> {
        let data = serde_json::to_string(&event.data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!("INSERT INTO task_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    event.id.to_string(),
                    event.task_id.to_string(),
                    event.event_type.as_str(),
                    fmt_datetime(&event.timestamp),
                    data,
                    event.source.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_event: {e}")))?;
        Ok(())
    }

    async fn list_events(&self, task_id: Uuid) -> Result<Vec<TaskEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM task_events WHERE task_id = ?1 ORDER BY timestamp ASC, rowid ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events row: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn task_at(title: &str, minutes_ago: i64) -> Task {
        Task::new(title).with_created_at(Utc::now() - Duration::minutes(minutes_ago))
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get() {
        let db = test_db().await;
        let task = Task::new("Email Bob")
            .with_description("About the invoice")
            .with_tag("email")
            .with_tag("billing");
        db.create_task(&task).await.unwrap();

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Email Bob");
        assert_eq!(fetched.description.as_deref(), Some("About the invoice"));
        assert_eq!(fetched.tags, vec!["email", "billing"]);
        assert_eq!(fetched.status, TaskStatus::New);
        assert!(!fetched.needs_decision);
        assert!(fetched.completed_at.is_none());
    }

    #[tokio::test]
    async fn get_not_found() {
        let db = test_db().await;
        assert!(db.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_eligible_is_oldest_new_or_todo() {
        let db = test_db().await;
        let newest = task_at("newest", 1);
        let oldest = task_at("oldest", 30);
        let mut done = task_at("done", 60);
        done.status = TaskStatus::Done;
        db.create_task(&newest).await.unwrap();
        db.create_task(&oldest).await.unwrap();
        db.create_task(&done).await.unwrap();

        let next = db.get_next_eligible().await.unwrap().unwrap();
        assert_eq!(next.id, oldest.id);
    }

    #[tokio::test]
    async fn next_eligible_none_when_empty() {
        let db = test_db().await;
        assert!(db.get_next_eligible().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let db = test_db().await;
        let a = task_at("a", 10);
        let b = task_at("b", 5);
        db.create_task(&a).await.unwrap();
        db.create_task(&b).await.unwrap();

        assert!(db.claim(a.id).await.unwrap());
        assert!(!db.claim(b.id).await.unwrap());
        // Already claimed.
        assert!(!db.claim(a.id).await.unwrap());
        assert_eq!(db.count_in_progress().await.unwrap(), 1);

        assert!(db.release(a.id).await.unwrap());
        assert!(db.claim(b.id).await.unwrap());
        assert_eq!(db.get(a.id).await.unwrap().unwrap().status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn concurrent_claims_single_winner() {
        let db = Arc::new(test_db().await);
        let mut ids = Vec::new();
        for i in 0..8 {
            let task = task_at(&format!("t{i}"), 10 - i);
            db.create_task(&task).await.unwrap();
            ids.push(task.id);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let db = Arc::clone(&db);
                let id = *id;
                tokio::spawn(async move { db.claim(id).await.unwrap() })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(db.count_in_progress().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_requires_in_progress() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();
        assert!(!db.release(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn update_status_is_cas() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();
        db.claim(task.id).await.unwrap();

        let fields = StatusFields {
            needs_decision: true,
            decision_type: Some("email_approval".into()),
            ..StatusFields::default()
        };
        assert!(
            db.update_status(task.id, TaskStatus::InProgress, TaskStatus::AwaitingDecision, &fields)
                .await
                .unwrap()
        );
        // Second writer expecting the old status loses.
        assert!(
            !db.update_status(task.id, TaskStatus::InProgress, TaskStatus::Done, &StatusFields::default())
                .await
                .unwrap()
        );

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::AwaitingDecision);
        assert!(fetched.needs_decision);
        assert_eq!(fetched.decision_type.as_deref(), Some("email_approval"));
    }

    #[tokio::test]
    async fn completed_at_never_rewritten() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();
        db.claim(task.id).await.unwrap();

        let first = Utc::now() - Duration::hours(1);
        let done = StatusFields {
            summary: Some("sent".into()),
            completed_at: Some(first),
            ..StatusFields::default()
        };
        db.update_status(task.id, TaskStatus::InProgress, TaskStatus::Done, &done)
            .await
            .unwrap();

        // A stray write with a later completion time cannot move it.
        let later = StatusFields {
            completed_at: Some(Utc::now()),
            ..StatusFields::default()
        };
        db.update_status(task.id, TaskStatus::Done, TaskStatus::Done, &later)
            .await
            .unwrap();

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.summary.as_deref(), Some("sent"));
        assert_eq!(
            fetched.completed_at.unwrap().timestamp_micros(),
            first.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let db = test_db().await;
        let a = task_at("a", 3);
        let mut b = task_at("b", 2);
        b.status = TaskStatus::Failed;
        db.create_task(&a).await.unwrap();
        db.create_task(&b).await.unwrap();

        let failed = db.list_by_status(TaskStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, b.id);
        assert_eq!(db.list_by_status(TaskStatus::New).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_with_comment_commits_both() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();
        db.claim(task.id).await.unwrap();

        let fields = StatusFields {
            needs_decision: true,
            decision_type: Some("missing_info".into()),
            ..StatusFields::default()
        };
        let prompt = Comment::agent(task.id, "Which account?");
        assert!(
            db.update_status_with_comment(
                task.id,
                TaskStatus::InProgress,
                TaskStatus::AwaitingDecision,
                &fields,
                &prompt,
            )
            .await
            .unwrap()
        );

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::AwaitingDecision);
        assert_eq!(fetched.comments.len(), 1);
        assert_eq!(fetched.comments[0].content, "Which account?");
    }

    #[tokio::test]
    async fn lost_cas_writes_no_comment() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();

        let comment = Comment::agent(task.id, "Task failed: model_error: boom");
        assert!(
            !db.update_status_with_comment(
                task.id,
                TaskStatus::InProgress,
                TaskStatus::Failed,
                &StatusFields::default(),
                &comment,
            )
            .await
            .unwrap()
        );

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::New);
        assert!(fetched.comments.is_empty());
    }

    #[tokio::test]
    async fn failed_comment_rolls_back_status() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();
        db.claim(task.id).await.unwrap();

        // Reusing a comment id makes the INSERT fail after the UPDATE won.
        let reply = Comment::human(task.id, "yes");
        db.append_comment(&reply).await.unwrap();
        let result = db
            .update_status_with_comment(
                task.id,
                TaskStatus::InProgress,
                TaskStatus::Todo,
                &StatusFields::default(),
                &reply,
            )
            .await;
        assert!(matches!(result, Err(DatabaseError::Query(_))));

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::InProgress);
        assert_eq!(fetched.comments.len(), 1);

        // The connection is usable after the rollback.
        assert!(db.release(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_timestamp_is_an_error() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();
        db.conn()
            .execute(
                "UPDATE tasks SET created_at = 'yesterday' WHERE id = ?1",
                params![task.id.to_string()],
            )
            .await
            .unwrap();

        assert!(matches!(
            db.get(task.id).await,
            Err(DatabaseError::Serialization(_))
        ));
        assert!(matches!(
            db.get_next_eligible().await,
            Err(DatabaseError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn create_task_is_all_or_nothing() {
        let db = test_db().await;
        let first = Task::new("first");
        db.create_task(&first).await.unwrap();

        let taken = Comment::human(first.id, "hello");
        db.append_comment(&taken).await.unwrap();

        // Second task carries a comment whose id is already taken.
        let mut second = Task::new("second");
        second.comments.push(Comment {
            task_id: second.id,
            ..taken
        });
        assert!(db.create_task(&second).await.is_err());
        assert!(db.get(second.id).await.unwrap().is_none());
    }

    // ── Comment tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn comments_chronological_with_limit() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();

        let base = Utc::now() - Duration::minutes(10);
        for i in 0..5 {
            let mut comment = Comment::human(task.id, format!("c{i}"));
            comment.created_at = base + Duration::minutes(i);
            db.append_comment(&comment).await.unwrap();
        }

        let latest: Vec<_> = db
            .list_comments(task.id, Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.content)
            .collect();
        assert_eq!(latest, vec!["c3", "c4"]);

        let all = db.list_comments(task.id, None).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].content, "c0");
    }

    #[tokio::test]
    async fn comment_ties_keep_insertion_order() {
        let db = test_db().await;
        let task = Task::new("T");
        db.create_task(&task).await.unwrap();

        let at = Utc::now();
        for text in ["first", "second", "third"] {
            let mut comment = Comment::agent(task.id, text);
            comment.created_at = at;
            db.append_comment(&comment).await.unwrap();
        }

        let fetched = db.get(task.id).await.unwrap().unwrap();
        let texts: Vec<_> = fetched.comments.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(fetched.comments[0].author, AuthorKind::Agent);
    }

    // ── Entity tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn related_entities_roundtrip() {
        let db = test_db().await;
        let alice = EntityRef::new(EntityKind::Person, "Alice").with_summary("Finance lead");
        let roadmap = EntityRef::new(EntityKind::Project, "Roadmap");
        db.upsert_entity(&alice).await.unwrap();
        db.upsert_entity(&roadmap).await.unwrap();

        let task = Task::new("Plan")
            .with_related(&alice)
            .with_related(&roadmap);
        db.create_task(&task).await.unwrap();
        // Duplicate link is ignored.
        db.link_entity(task.id, alice.id, EntityKind::Person).await.unwrap();

        let related = db.related_entities(task.id).await.unwrap();
        assert_eq!(related, vec![alice.clone(), roadmap.clone()]);

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.people, vec![alice.id]);
        assert_eq!(fetched.projects, vec![roadmap.id]);
    }

    #[tokio::test]
    async fn unknown_entities_skipped() {
        let db = test_db().await;
        let ghost = EntityRef::new(EntityKind::Chat, "ghost");
        let task = Task::new("T").with_related(&ghost);
        db.create_task(&task).await.unwrap();

        assert!(db.related_entities(task.id).await.unwrap().is_empty());
        assert_eq!(db.get(task.id).await.unwrap().unwrap().chats, vec![ghost.id]);
    }

    #[tokio::test]
    async fn upsert_entity_updates_summary() {
        let db = test_db().await;
        let bob = EntityRef::new(EntityKind::Person, "Bob");
        db.upsert_entity(&bob).await.unwrap();
        let bob = bob.with_summary("Vendor contact");
        db.upsert_entity(&bob).await.unwrap();

        let task = Task::new("T").with_related(&bob);
        db.create_task(&task).await.unwrap();
        let related = db.related_entities(task.id).await.unwrap();
        assert_eq!(related[0].summary.as_deref(), Some("Vendor contact"));
    }

    // ── Event tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn events_roundtrip_in_order() {
        let db = test_db().await;
        let task_id = Uuid::new_v4();
        let base = Utc::now();
        for (i, event_type) in ["task_claimed", "task_completed"].iter().enumerate() {
            let event = TaskEvent {
                id: Uuid::new_v4(),
                event_type: event_type.to_string(),
                timestamp: base + Duration::seconds(i as i64),
                task_id,
                data: json!({"status": "done"}),
                source: "ai-tasker".into(),
            };
            db.save_event(&event).await.unwrap();
        }

        let events = db.list_events(task_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "task_claimed");
        assert_eq!(events[1].event_type, "task_completed");
        assert_eq!(events[1].data["status"], "done");
        assert!(db.list_events(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
