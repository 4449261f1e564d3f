//! SQLite-backed persistence for records, links, the audit trail and the
//! notification job queue. One database file serves both the tracker and
//! its worker processes, so jobs survive restarts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use actiontrack_core::error::{Result, TrackerError};
use actiontrack_core::policy::Role;
use actiontrack_core::traits::{
    BatchOutcome, EntityStore, JobFilter, JobHandle, JobKind, JobPayload, JobQueue, JobState,
    NotificationJob, Write, WriteBatch,
};
use actiontrack_core::types::{
    AuditEntry, Endpoint, Entity, EntityId, EntityKind, Link, LinkId, LinkKind, User, UserId,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};

use crate::queue::{fire_time, new_handle};

const ENTITY_COLUMNS: &str = "id, kind, title, type_id, parent_id, fields, draft, is_archive, \
     private, notifications, created_by, created_at, updated_at, relationship_updated_at, \
     relationship_updated_by";
const USER_COLUMNS: &str =
    "id, name, email, roles, relationship_updated_at, relationship_updated_by";
const LINK_COLUMNS: &str =
    "id, kind, left_type, left_id, right_type, right_id, created_by, created_at";
const JOB_COLUMNS: &str =
    "handle, kind, recipient, subject, state, enqueued_at, fire_at, claimed_at, finished_at";

/// SQLite-backed [`EntityStore`] and [`JobQueue`].
pub struct TrackerDb {
    conn: Mutex<Connection>,
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> TrackerError {
    move |e| TrackerError::Database(format!("{context}: {e}"))
}

/// Fixed-width UTC timestamps, so text comparison orders them.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn bad_value(idx: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, what.into())
}

fn endpoint_parts(endpoint: Endpoint) -> (&'static str, i64) {
    match endpoint {
        Endpoint::Entity(id) => ("entity", id.0),
        Endpoint::User(id) => ("user", id.0),
    }
}

fn endpoint_from(idx: usize, kind: &str, id: i64) -> rusqlite::Result<Endpoint> {
    match kind {
        "entity" => Ok(Endpoint::Entity(EntityId(id))),
        "user" => Ok(Endpoint::User(UserId(id))),
        other => Err(bad_value(idx, format!("unknown endpoint type '{other}'"))),
    }
}

fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
    let kind: String = row.get(1)?;
    let fields: String = row.get(5)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok(Entity {
        id: EntityId(row.get(0)?),
        kind: EntityKind::parse(&kind)
            .ok_or_else(|| bad_value(1, format!("unknown entity kind '{kind}'")))?,
        title: row.get(2)?,
        type_id: row.get(3)?,
        parent_id: row.get::<_, Option<i64>>(4)?.map(EntityId),
        fields: serde_json::from_str(&fields)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        draft: row.get(6)?,
        is_archive: row.get(7)?,
        private: row.get(8)?,
        notifications: row.get(9)?,
        created_by: row.get::<_, Option<i64>>(10)?.map(UserId),
        created_at: parse_ts(11, &created_at)?,
        updated_at: parse_ts(12, &updated_at)?,
        relationship_updated_at: parse_opt_ts(13, row.get(13)?)?,
        relationship_updated_by: row.get::<_, Option<i64>>(14)?.map(UserId),
    })
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let roles: String = row.get(3)?;
    Ok(User {
        id: UserId(row.get(0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        roles: serde_json::from_str::<Vec<Role>>(&roles)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        relationship_updated_at: parse_opt_ts(4, row.get(4)?)?,
        relationship_updated_by: row.get::<_, Option<i64>>(5)?.map(UserId),
    })
}

fn row_to_link(row: &rusqlite::Row) -> rusqlite::Result<Link> {
    let kind: String = row.get(1)?;
    let left_type: String = row.get(2)?;
    let right_type: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    Ok(Link {
        id: LinkId(row.get(0)?),
        kind: LinkKind::parse(&kind)
            .ok_or_else(|| bad_value(1, format!("unknown link kind '{kind}'")))?,
        left: endpoint_from(2, &left_type, row.get(3)?)?,
        right: endpoint_from(4, &right_type, row.get(5)?)?,
        created_by: row.get::<_, Option<i64>>(6)?.map(UserId),
        created_at: parse_ts(7, &created_at)?,
    })
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<NotificationJob> {
    let kind: String = row.get(1)?;
    let state: String = row.get(4)?;
    let enqueued_at: String = row.get(5)?;
    let fire_at: String = row.get(6)?;
    Ok(NotificationJob {
        handle: JobHandle(row.get(0)?),
        payload: JobPayload {
            kind: JobKind::parse(&kind)
                .ok_or_else(|| bad_value(1, format!("unknown job kind '{kind}'")))?,
            recipient: UserId(row.get(2)?),
            subject: EntityId(row.get(3)?),
        },
        state: JobState::parse(&state)
            .ok_or_else(|| bad_value(4, format!("unknown job state '{state}'")))?,
        enqueued_at: parse_ts(5, &enqueued_at)?,
        fire_at: parse_ts(6, &fire_at)?,
        claimed_at: parse_opt_ts(7, row.get(7)?)?,
        finished_at: parse_opt_ts(8, row.get(8)?)?,
    })
}

fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
    let created_at: String = row.get(5)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        event: row.get(1)?,
        actor: row.get::<_, Option<i64>>(2)?.map(UserId),
        subject: row.get(3)?,
        details: row.get(4)?,
        created_at: parse_ts(5, &created_at)?,
    })
}

fn job_on(conn: &Connection, handle: &JobHandle) -> Result<Option<NotificationJob>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM notification_jobs WHERE handle = ?1"),
        [&handle.0],
        row_to_job,
    )
    .optional()
    .map_err(db_err("Load job"))
}

/// Older databases predate some job columns.
fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let exists = conn
        .prepare(&format!("SELECT 1 FROM pragma_table_info('{table}') WHERE name = ?1"))
        .and_then(|mut stmt| stmt.exists([column]))
        .map_err(db_err("Migration"))?;
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
            .map_err(db_err("Migration"))?;
    }
    Ok(())
}

fn apply(conn: &Connection, write: Write, outcome: &mut BatchOutcome) -> Result<()> {
    match write {
        // The relationship stamp is only taken on insert; an existing row
        // keeps its own.
        Write::Save(e) => {
            conn.execute(
                &format!(
                    "INSERT INTO entities ({ENTITY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT(id) DO UPDATE SET
                       kind = excluded.kind, title = excluded.title,
                       type_id = excluded.type_id, parent_id = excluded.parent_id,
                       fields = excluded.fields, draft = excluded.draft,
                       is_archive = excluded.is_archive, private = excluded.private,
                       notifications = excluded.notifications,
                       created_by = excluded.created_by, created_at = excluded.created_at,
                       updated_at = excluded.updated_at"
                ),
                params![
                    e.id.0,
                    e.kind.as_str(),
                    e.title,
                    e.type_id,
                    e.parent_id.map(|p| p.0),
                    serde_json::to_string(&e.fields)?,
                    e.draft,
                    e.is_archive,
                    e.private,
                    e.notifications,
                    e.created_by.map(|u| u.0),
                    ts(e.created_at),
                    ts(e.updated_at),
                    e.relationship_updated_at.map(ts),
                    e.relationship_updated_by.map(|u| u.0),
                ],
            )
            .map_err(db_err("Save entity"))?;
        }
        Write::SaveUser(u) => {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO users ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    u.id.0,
                    u.name,
                    u.email,
                    serde_json::to_string(&u.roles)?,
                    u.relationship_updated_at.map(ts),
                    u.relationship_updated_by.map(|b| b.0),
                ],
            )
            .map_err(db_err("Save user"))?;
        }
        Write::Stamp { target, stamp } => {
            let (table, id) = match target {
                Endpoint::Entity(id) => ("entities", id.0),
                Endpoint::User(id) => ("users", id.0),
            };
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table} SET relationship_updated_at = ?1,
                         relationship_updated_by = ?2 WHERE id = ?3"
                    ),
                    params![ts(stamp.at), stamp.by.0, id],
                )
                .map_err(db_err("Stamp"))?;
            if changed > 0 {
                outcome.stamped.push(target);
            } else {
                outcome.skipped.push(target);
            }
        }
        Write::InsertLink(l) => {
            let (lt, li) = endpoint_parts(l.left);
            let (rt, ri) = endpoint_parts(l.right);
            conn.execute(
                &format!(
                    "INSERT INTO links ({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    l.id.0,
                    l.kind.as_str(),
                    lt,
                    li,
                    rt,
                    ri,
                    l.created_by.map(|u| u.0),
                    ts(l.created_at),
                ],
            )
            .map_err(db_err("Insert link"))?;
        }
        Write::ReplaceLink(l) => {
            let (lt, li) = endpoint_parts(l.left);
            let (rt, ri) = endpoint_parts(l.right);
            let changed = conn
                .execute(
                    "UPDATE links SET kind = ?2, left_type = ?3, left_id = ?4,
                     right_type = ?5, right_id = ?6 WHERE id = ?1",
                    params![l.id.0, l.kind.as_str(), lt, li, rt, ri],
                )
                .map_err(db_err("Replace link"))?;
            if changed == 0 {
                return Err(TrackerError::NotFound(l.id.to_string()));
            }
        }
        Write::RemoveLink(id) => {
            conn.execute("DELETE FROM links WHERE id = ?1", [id.0])
                .map_err(db_err("Remove link"))?;
        }
        Write::Destroy(id) => {
            conn.execute(
                "DELETE FROM links WHERE (left_type = 'entity' AND left_id = ?1)
                 OR (right_type = 'entity' AND right_id = ?1)",
                [id.0],
            )
            .map_err(db_err("Destroy links"))?;
            conn.execute("DELETE FROM entities WHERE id = ?1", [id.0])
                .map_err(db_err("Destroy entity"))?;
        }
        Write::Audit {
            event,
            actor,
            subject,
            details,
            at,
        } => {
            conn.execute(
                "INSERT INTO audit_log (event, actor, subject, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event, actor.map(|a| a.0), subject, details, ts(at)],
            )
            .map_err(db_err("Audit"))?;
        }
    }
    Ok(())
}

impl TrackerDb {
    /// Open or create the tracker database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TrackerError::Database("connection lock poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
                "
            -- Store-wide id sequence for entities, users and links
            CREATE TABLE IF NOT EXISTS id_seq (
                id INTEGER PRIMARY KEY AUTOINCREMENT
            );

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                type_id INTEGER,
                parent_id INTEGER,
                fields TEXT NOT NULL DEFAULT '{}',   -- JSON object
                draft INTEGER NOT NULL DEFAULT 0,
                is_archive INTEGER NOT NULL DEFAULT 0,
                private INTEGER NOT NULL DEFAULT 0,
                notifications INTEGER NOT NULL DEFAULT 1,
                created_by INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                relationship_updated_at TEXT,
                relationship_updated_by INTEGER    -- weak: no FK, users may go away
            );
            CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                roles TEXT NOT NULL DEFAULT '[]',  -- JSON array
                relationship_updated_at TEXT,
                relationship_updated_by INTEGER
            );

            CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                left_type TEXT NOT NULL,           -- 'entity' or 'user'
                left_id INTEGER NOT NULL,
                right_type TEXT NOT NULL,
                right_id INTEGER NOT NULL,
                created_by INTEGER,
                created_at TEXT NOT NULL,
                UNIQUE (kind, left_type, left_id, right_type, right_id)
            );
            CREATE INDEX IF NOT EXISTS idx_links_left ON links(left_type, left_id);
            CREATE INDEX IF NOT EXISTS idx_links_right ON links(right_type, right_id);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                actor INTEGER,
                subject TEXT NOT NULL,
                details TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject);

            -- Delayed task notifications
            CREATE TABLE IF NOT EXISTS notification_jobs (
                handle TEXT PRIMARY KEY,
                kind TEXT NOT NULL DEFAULT 'task_updated',  -- task_updated, assigned
                recipient INTEGER NOT NULL,
                subject INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',  -- pending, running, cancelled, sent, suppressed
                enqueued_at TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                claimed_at TEXT,                        -- lease start while running
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON notification_jobs(state, fire_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_subject ON notification_jobs(subject, state);
         ",
        )
        .map_err(db_err("Migration"))?;
        add_column_if_missing(
            &conn,
            "notification_jobs",
            "kind",
            "TEXT NOT NULL DEFAULT 'task_updated'",
        )?;
        add_column_if_missing(&conn, "notification_jobs", "claimed_at", "TEXT")?;
        Ok(())
    }

    /// Every job in any state, newest first.
    pub fn recent_jobs(&self, limit: usize) -> Result<Vec<NotificationJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM notification_jobs ORDER BY enqueued_at DESC LIMIT ?1"
            ))
            .map_err(db_err("Recent jobs"))?;
        let rows = stmt
            .query_map([limit as i64], row_to_job)
            .map_err(db_err("Recent jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Recent jobs"))
    }
}

impl EntityStore for TrackerDb {
    fn next_id(&self) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO id_seq DEFAULT VALUES", [])
            .map_err(db_err("Next id"))?;
        Ok(conn.last_insert_rowid())
    }

    fn entity(&self, id: EntityId) -> Result<Option<Entity>> {
        self.lock()?
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
                [id.0],
                row_to_entity,
            )
            .optional()
            .map_err(db_err("Load entity"))
    }

    fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1 ORDER BY id"
            ))
            .map_err(db_err("List entities"))?;
        let rows = stmt
            .query_map([kind.as_str()], row_to_entity)
            .map_err(db_err("List entities"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List entities"))
    }

    fn user(&self, id: UserId) -> Result<Option<User>> {
        self.lock()?
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id.0],
                row_to_user,
            )
            .optional()
            .map_err(db_err("Load user"))
    }

    fn link(&self, id: LinkId) -> Result<Option<Link>> {
        self.lock()?
            .query_row(
                &format!("SELECT {LINK_COLUMNS} FROM links WHERE id = ?1"),
                [id.0],
                row_to_link,
            )
            .optional()
            .map_err(db_err("Load link"))
    }

    fn links_for(&self, endpoint: Endpoint) -> Result<Vec<Link>> {
        let (t, id) = endpoint_parts(endpoint);
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LINK_COLUMNS} FROM links
                 WHERE (left_type = ?1 AND left_id = ?2) OR (right_type = ?1 AND right_id = ?2)
                 ORDER BY id"
            ))
            .map_err(db_err("Links for"))?;
        let rows = stmt
            .query_map(params![t, id], row_to_link)
            .map_err(db_err("Links for"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Links for"))
    }

    fn find_link(&self, kind: LinkKind, left: Endpoint, right: Endpoint) -> Result<Option<Link>> {
        let (lt, li) = endpoint_parts(left);
        let (rt, ri) = endpoint_parts(right);
        self.lock()?
            .query_row(
                &format!(
                    "SELECT {LINK_COLUMNS} FROM links WHERE kind = ?1
                     AND left_type = ?2 AND left_id = ?3 AND right_type = ?4 AND right_id = ?5"
                ),
                params![kind.as_str(), lt, li, rt, ri],
                row_to_link,
            )
            .optional()
            .map_err(db_err("Find link"))
    }

    fn write(&self, batch: WriteBatch) -> Result<BatchOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let mut outcome = BatchOutcome::default();
        for write in batch.into_writes() {
            apply(&tx, write, &mut outcome)?;
        }
        tx.commit().map_err(db_err("Commit"))?;
        Ok(outcome)
    }

    fn audit_trail(&self, subject: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, event, actor, subject, details, created_at FROM audit_log
                 WHERE subject = ?1 ORDER BY id",
            )
            .map_err(db_err("Audit trail"))?;
        let rows = stmt
            .query_map([subject], row_to_audit)
            .map_err(db_err("Audit trail"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Audit trail"))
    }
}

impl JobQueue for TrackerDb {
    fn enqueue(&self, delay: Duration, payload: JobPayload) -> Result<JobHandle> {
        let now = Utc::now();
        let handle = new_handle();
        self.lock()?
            .execute(
                &format!(
                    "INSERT INTO notification_jobs ({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, NULL, NULL)"
                ),
                params![
                    handle.0,
                    payload.kind.as_str(),
                    payload.recipient.0,
                    payload.subject.0,
                    ts(now),
                    ts(fire_time(now, delay)?),
                ],
            )
            .map_err(db_err("Enqueue"))?;
        Ok(handle)
    }

    fn list_pending(&self, filter: &JobFilter) -> Result<Vec<NotificationJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM notification_jobs
                 WHERE state = 'pending'
                   AND (?1 IS NULL OR subject = ?1)
                   AND (?2 IS NULL OR recipient = ?2)
                   AND (?3 IS NULL OR kind = ?3)
                 ORDER BY fire_at"
            ))
            .map_err(db_err("List pending"))?;
        let rows = stmt
            .query_map(
                params![
                    filter.subject.map(|s| s.0),
                    filter.recipient.map(|r| r.0),
                    filter.kind.map(|k| k.as_str()),
                ],
                row_to_job,
            )
            .map_err(db_err("List pending"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List pending"))
    }

    fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE notification_jobs SET state = 'cancelled', finished_at = ?2
                 WHERE handle = ?1 AND state = 'pending'",
                params![handle.0, ts(Utc::now())],
            )
            .map_err(db_err("Cancel"))?;
        Ok(changed > 0)
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<NotificationJob>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let due = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM notification_jobs
                     WHERE state = 'pending' AND fire_at <= ?1
                     ORDER BY fire_at LIMIT ?2"
                ))
                .map_err(db_err("Claim"))?;
            let rows = stmt
                .query_map(params![ts(now), limit as i64], row_to_job)
                .map_err(db_err("Claim"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Claim"))?
        };
        let mut claimed = Vec::with_capacity(due.len());
        for mut job in due {
            tx.execute(
                "UPDATE notification_jobs SET state = 'running', claimed_at = ?2 WHERE handle = ?1",
                params![job.handle.0, ts(now)],
            )
            .map_err(db_err("Claim"))?;
            job.state = JobState::Running;
            job.claimed_at = Some(now);
            claimed.push(job);
        }
        tx.commit().map_err(db_err("Commit"))?;
        Ok(claimed)
    }

    fn reclaim_expired(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        self.lock()?
            .execute(
                "UPDATE notification_jobs SET state = 'pending', claimed_at = NULL
                 WHERE state = 'running' AND (claimed_at IS NULL OR claimed_at < ?1)",
                [ts(claimed_before)],
            )
            .map_err(db_err("Reclaim"))
    }

    fn finish(&self, handle: &JobHandle, state: JobState) -> Result<()> {
        if !state.is_terminal() {
            return Err(TrackerError::Queue(format!(
                "{} is not a terminal state",
                state.as_str()
            )));
        }
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE notification_jobs SET state = ?2, finished_at = ?3
                 WHERE handle = ?1 AND state = 'running'",
                params![handle.0, state.as_str(), ts(Utc::now())],
            )
            .map_err(db_err("Finish"))?;
        if changed > 0 {
            return Ok(());
        }
        match job_on(&conn, handle)? {
            None => Err(TrackerError::NotFound(format!("job {handle}"))),
            Some(job) => Err(TrackerError::Queue(format!(
                "job {handle} is {}, not running",
                job.state.as_str()
            ))),
        }
    }

    fn job(&self, handle: &JobHandle) -> Result<Option<NotificationJob>> {
        job_on(&*self.lock()?, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actiontrack_core::types::Stamp;

    fn temp_db(name: &str) -> (std::path::PathBuf, TrackerDb) {
        let dir = std::env::temp_dir().join(format!("actiontrack-db-{name}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).ok();
        let db = TrackerDb::open(&dir.join("tracker.db")).unwrap();
        (dir, db)
    }

    fn link(id: i64, kind: LinkKind, left: Endpoint, right: Endpoint) -> Link {
        Link {
            id: LinkId(id),
            kind,
            left,
            right,
            created_by: Some(UserId(1)),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_and_migrate() {
        let (dir, db) = temp_db("migrate");
        assert!(db.entities(EntityKind::Measure).unwrap().is_empty());
        assert!(db.list_pending(&JobFilter::all()).unwrap().is_empty());
        assert_eq!(db.next_id().unwrap(), 1);
        assert_eq!(db.next_id().unwrap(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_and_load_records() {
        let (dir, db) = temp_db("records");
        let mut e = Entity::new(EntityId(3), EntityKind::Measure, "Clean the river");
        e.type_id = Some(5);
        e.fields
            .insert("description".into(), serde_json::json!("Phase one"));
        let u = User::new(UserId(4), "Ada", "ada@example.org", vec![Role::Manager]);
        let mut batch = WriteBatch::new();
        batch
            .push(Write::Save(e.clone()))
            .push(Write::SaveUser(u.clone()))
            .push(Write::InsertLink(link(
                5,
                LinkKind::UserMeasure,
                Endpoint::User(UserId(4)),
                Endpoint::Entity(EntityId(3)),
            )));
        db.write(batch).unwrap();

        let loaded = db.entity(EntityId(3)).unwrap().unwrap();
        assert_eq!(loaded.title, "Clean the river");
        assert_eq!(loaded.type_id, Some(5));
        assert_eq!(loaded.fields["description"], "Phase one");
        assert_eq!(db.user(UserId(4)).unwrap().unwrap().roles, vec![Role::Manager]);
        let found = db
            .find_link(
                LinkKind::UserMeasure,
                Endpoint::User(UserId(4)),
                Endpoint::Entity(EntityId(3)),
            )
            .unwrap();
        assert_eq!(found.map(|l| l.id), Some(LinkId(5)));
        assert_eq!(db.links_for(Endpoint::Entity(EntityId(3))).unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stamp_and_rollback() {
        let (dir, db) = temp_db("stamp");
        let a = Endpoint::Entity(EntityId(1));
        let b = Endpoint::Entity(EntityId(2));
        let mut batch = WriteBatch::new();
        batch
            .push(Write::Save(Entity::new(EntityId(1), EntityKind::Measure, "a")))
            .push(Write::InsertLink(link(10, LinkKind::MeasureMeasure, a, b)));
        db.write(batch).unwrap();

        let stamp = Stamp {
            at: Utc::now(),
            by: UserId(9),
        };
        let mut batch = WriteBatch::new();
        batch
            .push(Write::Stamp { target: a, stamp })
            .push(Write::Stamp { target: b, stamp });
        let outcome = db.write(batch).unwrap();
        assert_eq!(outcome.stamped, vec![a]);
        assert_eq!(outcome.skipped, vec![b]);
        assert_eq!(
            db.entity(EntityId(1)).unwrap().unwrap().relationship_updated_by,
            Some(UserId(9))
        );

        // Duplicate link rolls the whole batch back.
        let mut batch = WriteBatch::new();
        batch
            .push(Write::Save(Entity::new(EntityId(7), EntityKind::Actor, "x")))
            .push(Write::InsertLink(link(11, LinkKind::MeasureMeasure, a, b)));
        assert!(db.write(batch).is_err());
        assert!(db.entity(EntityId(7)).unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_destroy_removes_links_and_audit_survives() {
        let (dir, db) = temp_db("destroy");
        let a = Endpoint::Entity(EntityId(1));
        let mut batch = WriteBatch::new();
        batch
            .push(Write::Save(Entity::new(EntityId(1), EntityKind::Measure, "a")))
            .push(Write::InsertLink(link(
                10,
                LinkKind::UserMeasure,
                Endpoint::User(UserId(2)),
                a,
            )));
        db.write(batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.push(Write::Destroy(EntityId(1))).push(Write::Audit {
            event: "destroy".into(),
            actor: Some(UserId(2)),
            subject: "entity:1".into(),
            details: None,
            at: Utc::now(),
        });
        db.write(batch).unwrap();
        assert!(db.entity(EntityId(1)).unwrap().is_none());
        assert!(db.link(LinkId(10)).unwrap().is_none());
        let trail = db.audit_trail("entity:1").unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event, "destroy");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_job_lifecycle() {
        let (dir, db) = temp_db("jobs");
        let payload = JobPayload::task_updated(UserId(1), EntityId(2));
        let later = db.enqueue(Duration::from_secs(20), payload).unwrap();
        let now = db.enqueue(Duration::ZERO, payload).unwrap();

        let pending = db.list_pending(&JobFilter::subject(EntityId(2))).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(db
            .list_pending(&JobFilter::subject(EntityId(3)))
            .unwrap()
            .is_empty());

        let claimed = db.claim_due(Utc::now(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].handle, now);
        assert_eq!(claimed[0].state, JobState::Running);
        // A running job can no longer be cancelled.
        assert!(!db.cancel(&now).unwrap());
        db.finish(&now, JobState::Sent).unwrap();
        assert!(db.finish(&now, JobState::Sent).is_err());

        assert!(db.cancel(&later).unwrap());
        assert_eq!(db.job(&later).unwrap().unwrap().state, JobState::Cancelled);
        assert_eq!(db.recent_jobs(10).unwrap().len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_keeps_existing_stamp() {
        let (dir, db) = temp_db("save-stamp");
        let mut e = Entity::new(EntityId(1), EntityKind::Measure, "a");
        e.relationship_updated_by = Some(UserId(2));
        e.relationship_updated_at = Some(Utc::now());
        let mut batch = WriteBatch::new();
        batch.push(Write::Save(e.clone()));
        db.write(batch).unwrap();
        assert_eq!(
            db.entity(EntityId(1)).unwrap().unwrap().relationship_updated_by,
            Some(UserId(2))
        );

        let mut batch = WriteBatch::new();
        batch.push(Write::Stamp {
            target: Endpoint::Entity(EntityId(1)),
            stamp: Stamp {
                at: Utc::now(),
                by: UserId(3),
            },
        });
        db.write(batch).unwrap();

        // A save carrying the stale stamp changes attributes only.
        e.title = "b".into();
        let mut batch = WriteBatch::new();
        batch.push(Write::Save(e));
        db.write(batch).unwrap();
        let loaded = db.entity(EntityId(1)).unwrap().unwrap();
        assert_eq!(loaded.title, "b");
        assert_eq!(loaded.relationship_updated_by, Some(UserId(3)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_job_kinds_and_expired_lease() {
        let (dir, db) = temp_db("lease");
        let assigned = db
            .enqueue(Duration::ZERO, JobPayload::assigned(UserId(1), EntityId(2)))
            .unwrap();
        db.enqueue(
            Duration::from_secs(20),
            JobPayload::task_updated(UserId(1), EntityId(2)),
        )
        .unwrap();
        let only = db
            .list_pending(&JobFilter::all().kind(JobKind::Assigned))
            .unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].payload.kind, JobKind::Assigned);

        let claimed_at = Utc::now();
        let claimed = db.claim_due(claimed_at, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].claimed_at, Some(claimed_at));

        // The worker died holding the job. A fresh lease is left alone.
        assert_eq!(db.reclaim_expired(claimed_at).unwrap(), 0);
        let cutoff = claimed_at + chrono::Duration::seconds(1);
        assert_eq!(db.reclaim_expired(cutoff).unwrap(), 1);
        let job = db.job(&assigned).unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.claimed_at, None);
        assert_eq!(db.claim_due(Utc::now(), 10).unwrap()[0].handle, assigned);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_job_columns_added_to_older_database() {
        let dir = std::env::temp_dir().join(format!("actiontrack-db-old-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("tracker.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE notification_jobs (
                    handle TEXT PRIMARY KEY,
                    recipient INTEGER NOT NULL,
                    subject INTEGER NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    enqueued_at TEXT NOT NULL,
                    fire_at TEXT NOT NULL,
                    finished_at TEXT
                );
                INSERT INTO notification_jobs VALUES
                    ('old', 1, 2, 'pending', '2024-01-01T00:00:00.000000Z',
                     '2024-01-01T00:00:20.000000Z', NULL);",
            )
            .unwrap();

        let db = TrackerDb::open(&path).unwrap();
        let job = db.job(&JobHandle("old".into())).unwrap().unwrap();
        assert_eq!(job.payload.kind, JobKind::TaskUpdated);
        assert_eq!(job.claimed_at, None);
        std::fs::remove_dir_all(&dir).ok();
    }
}
