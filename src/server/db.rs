use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use crm_common::{
    Contact, ContactFilter, ContactUpdate, CustomFields, Deal, DealFilter, DealStatus, DealUpdate,
    ListQuery, NewContact, NewDeal, NewPipeline, NewTag, NotionSync, Page, Pipeline,
    PipelineFilter, PipelineUpdate, Plan, Stage, StageInput, Tag, TagFilter, TagUpdate, User,
};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::errors::ServerError;

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands that run outside the server, and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CrmDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Identity returned by the Notion token exchange.
#[derive(Debug, Clone)]
pub struct NotionIdentity {
    pub notion_user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub workspace_id: String,
    pub access_token: String,
}

pub struct CrmDb {
    conn: Connection,
}

const USER_COLUMNS: &str =
    "id, email, name, notion_user_id, notion_workspace_id, plan, is_active, created_at, updated_at";
const PIPELINE_COLUMNS: &str = "id, name, created_at, updated_at";
const DEAL_COLUMNS: &str = "id, user_id, pipeline_id, stage_id, name, value, status, position, \
     expected_close_date, custom_fields, notion_page_id, notion_database_id, \
     notion_last_synced_at, created_at, updated_at";
const CONTACT_COLUMNS: &str = "id, name, email, phone, company, created_at, updated_at";
const TAG_COLUMNS: &str = "id, name, color, created_at";

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT,
                    notion_user_id TEXT,
                    notion_access_token TEXT,
                    notion_workspace_id TEXT,
                    plan TEXT NOT NULL DEFAULT 'free',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS pipelines (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS stages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS deals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
                    stage_id INTEGER NOT NULL REFERENCES stages(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    value REAL NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'active',
                    position INTEGER NOT NULL DEFAULT 0,
                    expected_close_date TEXT,
                    custom_fields TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    email TEXT,
                    phone TEXT,
                    company TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tags (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    color TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS contact_tags (
                    contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                    PRIMARY KEY (contact_id, tag_id)
                );

                CREATE INDEX IF NOT EXISTS idx_pipelines_user ON pipelines(user_id);
                CREATE INDEX IF NOT EXISTS idx_stages_pipeline ON stages(pipeline_id, position);
                CREATE INDEX IF NOT EXISTS idx_deals_stage ON deals(stage_id, position);
                CREATE INDEX IF NOT EXISTS idx_deals_status ON deals(status);
                CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts(user_id);
                CREATE INDEX IF NOT EXISTS idx_tags_user ON tags(user_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations. Only "duplicate column" is tolerated.
        self.add_column("deals", "notion_page_id TEXT")?;
        self.add_column("deals", "notion_database_id TEXT")?;
        self.add_column("deals", "notion_last_synced_at TEXT")?;
        Ok(())
    }

    fn add_column(&self, table: &str, definition: &str) -> Result<()> {
        let sql = format!("ALTER TABLE {} ADD COLUMN {}", table, definition);
        match self.conn.execute(&sql, []) {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("duplicate column") => Ok(()),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to add column {}.{}: {}",
                table,
                definition,
                e
            )),
        }
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], UserRow::read)
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![email.trim()], UserRow::read)
            .optional()
            .context("Failed to query user by email")?;
        row.map(UserRow::into_user).transpose()
    }

    /// Return the user with this email, creating it when absent.
    pub fn ensure_user(&self, email: &str, name: Option<&str>) -> Result<User> {
        let email = email.trim();
        if email.is_empty() {
            return Err(bad_request("Email is required"));
        }
        if let Some(user) = self.get_user_by_email(email)? {
            return Ok(user);
        }
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO users (email, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![email, name, ts],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    /// Create or refresh the account behind a Notion login. Matches on the
    /// Notion user id first, then on email.
    pub fn upsert_notion_user(&self, identity: &NotionIdentity) -> Result<User> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM users WHERE notion_user_id = ?1 OR email = ?2
                 ORDER BY notion_user_id = ?1 DESC LIMIT 1",
                params![identity.notion_user_id, identity.email],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up Notion user")?;
        let ts = now();
        let id = match existing {
            Some(id) => {
                self.conn
                    .execute(
                        "UPDATE users SET notion_user_id = ?1, notion_access_token = ?2,
                         notion_workspace_id = ?3, name = COALESCE(?4, name), updated_at = ?5
                         WHERE id = ?6",
                        params![
                            identity.notion_user_id,
                            identity.access_token,
                            identity.workspace_id,
                            identity.name,
                            ts,
                            id
                        ],
                    )
                    .context("Failed to update Notion user")?;
                id
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO users (email, name, notion_user_id, notion_access_token,
                         notion_workspace_id, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                        params![
                            identity.email,
                            identity.name,
                            identity.notion_user_id,
                            identity.access_token,
                            identity.workspace_id,
                            ts
                        ],
                    )
                    .context("Failed to insert Notion user")?;
                self.conn.last_insert_rowid()
            }
        };
        self.get_user(id)?.context("User not found after Notion upsert")
    }

    // ── Pipelines ─────────────────────────────────────────────────────

    pub fn list_pipelines(
        &self,
        user_id: i64,
        query: &ListQuery<PipelineFilter>,
    ) -> Result<Page<Pipeline>> {
        let mut filter = Where::owned_by(user_id);
        if let Some(search) = &query.filter.search {
            filter.push("name LIKE ?", like_pattern(search));
        }
        let total = self.count("pipelines", &filter)?;
        let sql = format!(
            "SELECT {} FROM pipelines WHERE {} ORDER BY id LIMIT ? OFFSET ?",
            PIPELINE_COLUMNS,
            filter.sql()
        );
        let rows = self.query_rows(&sql, filter.window(query), PipelineRow::read)?;
        let items = rows
            .into_iter()
            .map(|r| self.hydrate_pipeline(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total))
    }

    pub fn get_pipeline(&self, user_id: i64, id: i64) -> Result<Option<Pipeline>> {
        let sql = format!(
            "SELECT {} FROM pipelines WHERE id = ?1 AND user_id = ?2",
            PIPELINE_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id, user_id], PipelineRow::read)
            .optional()
            .context("Failed to query pipeline")?;
        row.map(|r| self.hydrate_pipeline(r)).transpose()
    }

    pub fn create_pipeline(&self, user_id: i64, input: &NewPipeline) -> Result<Pipeline> {
        let name = required(&input.name, "Pipeline name")?;
        let stage_names = input
            .stages
            .iter()
            .map(|s| required(s, "Stage name"))
            .collect::<Result<Vec<_>>>()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();
        tx.execute(
            "INSERT INTO pipelines (user_id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![user_id, name, ts],
        )
        .context("Failed to insert pipeline")?;
        let id = tx.last_insert_rowid();
        for (position, stage) in stage_names.iter().enumerate() {
            tx.execute(
                "INSERT INTO stages (pipeline_id, name, position) VALUES (?1, ?2, ?3)",
                params![id, stage, position as i64],
            )
            .context("Failed to insert stage")?;
        }
        tx.commit().context("Failed to commit pipeline insert")?;
        self.get_pipeline(user_id, id)?
            .context("Pipeline not found after insert")
    }

    pub fn update_pipeline(
        &self,
        user_id: i64,
        id: i64,
        update: &PipelineUpdate,
    ) -> Result<Pipeline> {
        if self.get_pipeline(user_id, id)?.is_none() {
            return Err(not_found("Pipeline", id));
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(name) = &update.name {
            let name = required(name, "Pipeline name")?;
            tx.execute(
                "UPDATE pipelines SET name = ?1 WHERE id = ?2",
                params![name, id],
            )
            .context("Failed to update pipeline name")?;
        }
        if let Some(stages) = &update.stages {
            self.replace_stages(id, stages)?;
        }
        tx.execute(
            "UPDATE pipelines SET updated_at = ?1 WHERE id = ?2",
            params![now(), id],
        )
        .context("Failed to touch pipeline")?;
        tx.commit().context("Failed to commit pipeline update")?;
        self.get_pipeline(user_id, id)?
            .context("Pipeline not found after update")
    }

    /// Listed ids keep their row and take the list order; entries without
    /// an id are created; omitted stages are deleted if they hold no deals.
    /// Runs inside the caller's transaction.
    fn replace_stages(&self, pipeline_id: i64, stages: &[StageInput]) -> Result<()> {
        if stages.is_empty() {
            return Err(bad_request("A pipeline needs at least one stage"));
        }
        let existing = self.stage_ids(pipeline_id)?;
        let mut kept = HashSet::new();
        for input in stages {
            required(&input.name, "Stage name")?;
            if let Some(stage_id) = input.id {
                if !existing.contains(&stage_id) {
                    return Err(bad_request(format!(
                        "Stage {} does not belong to pipeline {}",
                        stage_id, pipeline_id
                    )));
                }
                if !kept.insert(stage_id) {
                    return Err(bad_request(format!("Stage {} is listed twice", stage_id)));
                }
            }
        }

        for stage_id in existing.iter().filter(|id| !kept.contains(id)) {
            let deals: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM deals WHERE stage_id = ?1",
                    params![stage_id],
                    |row| row.get(0),
                )
                .context("Failed to count stage deals")?;
            if deals > 0 {
                return Err(bad_request(format!(
                    "Stage {} still holds {} deals",
                    stage_id, deals
                )));
            }
            self.conn
                .execute("DELETE FROM stages WHERE id = ?1", params![stage_id])
                .context("Failed to delete stage")?;
        }

        for (position, input) in stages.iter().enumerate() {
            let name = input.name.trim();
            match input.id {
                Some(stage_id) => self
                    .conn
                    .execute(
                        "UPDATE stages SET name = ?1, position = ?2 WHERE id = ?3",
                        params![name, position as i64, stage_id],
                    )
                    .context("Failed to update stage")?,
                None => self
                    .conn
                    .execute(
                        "INSERT INTO stages (pipeline_id, name, position) VALUES (?1, ?2, ?3)",
                        params![pipeline_id, name, position as i64],
                    )
                    .context("Failed to insert stage")?,
            };
        }
        Ok(())
    }

    /// Deletes the pipeline with its stages and deals.
    pub fn delete_pipeline(&self, user_id: i64, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM pipelines WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete pipeline")?;
        Ok(count > 0)
    }

    fn hydrate_pipeline(&self, row: PipelineRow) -> Result<Pipeline> {
        let stages = self.stages_for(row.id)?;
        Ok(Pipeline {
            id: row.id,
            name: row.name,
            stages,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }

    fn stages_for(&self, pipeline_id: i64) -> Result<Vec<Stage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT s.id, s.name, s.pipeline_id, s.position,
                        COUNT(d.id), COALESCE(SUM(d.value), 0.0)
                 FROM stages s LEFT JOIN deals d ON d.stage_id = s.id
                 WHERE s.pipeline_id = ?1
                 GROUP BY s.id ORDER BY s.position, s.id",
            )
            .context("Failed to prepare stages_for")?;
        let rows = stmt
            .query_map(params![pipeline_id], |row| {
                Ok(Stage {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    pipeline_id: row.get(2)?,
                    position: row.get(3)?,
                    deal_count: Some(row.get(4)?),
                    deal_value: Some(row.get(5)?),
                })
            })
            .context("Failed to query stages")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read stage row")
    }

    fn stage_ids(&self, pipeline_id: i64) -> Result<Vec<i64>> {
        self.query_ids(
            "SELECT id FROM stages WHERE pipeline_id = ?1 ORDER BY position, id",
            pipeline_id,
        )
    }

    fn stage_pipeline(&self, stage_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT pipeline_id FROM stages WHERE id = ?1",
                params![stage_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up stage")
    }

    // ── Deals ─────────────────────────────────────────────────────────

    pub fn list_deals(&self, user_id: i64, query: &ListQuery<DealFilter>) -> Result<Page<Deal>> {
        let mut filter = Where::owned_by(user_id);
        if let Some(pipeline_id) = query.filter.pipeline_id {
            filter.push("pipeline_id = ?", pipeline_id);
        }
        if let Some(stage_id) = query.filter.stage_id {
            filter.push("stage_id = ?", stage_id);
        }
        if let Some(status) = query.filter.status {
            filter.push("status = ?", status.as_str().to_string());
        }
        if let Some(search) = &query.filter.search {
            filter.push("name LIKE ?", like_pattern(search));
        }
        let total = self.count("deals", &filter)?;
        let sql = format!(
            "SELECT {} FROM deals WHERE {} ORDER BY id LIMIT ? OFFSET ?",
            DEAL_COLUMNS,
            filter.sql()
        );
        let items = self
            .query_rows(&sql, filter.window(query), DealRow::read)?
            .into_iter()
            .map(DealRow::into_deal)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total))
    }

    pub fn get_deal(&self, user_id: i64, id: i64) -> Result<Option<Deal>> {
        let sql = format!(
            "SELECT {} FROM deals WHERE id = ?1 AND user_id = ?2",
            DEAL_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id, user_id], DealRow::read)
            .optional()
            .context("Failed to query deal")?;
        row.map(DealRow::into_deal).transpose()
    }

    pub fn create_deal(&self, user_id: i64, input: &NewDeal) -> Result<Deal> {
        let name = required(&input.name, "Deal name")?;
        check_value(input.value)?;
        if self.get_pipeline(user_id, input.pipeline_id)?.is_none() {
            return Err(not_found("Pipeline", input.pipeline_id));
        }
        self.check_stage(input.stage_id, input.pipeline_id)?;

        let position: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM deals WHERE stage_id = ?1",
                params![input.stage_id],
                |row| row.get(0),
            )
            .context("Failed to get next deal position")?;
        let custom_fields = serde_json::to_string(&input.custom_fields)
            .context("Failed to serialize custom fields")?;
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO deals (user_id, pipeline_id, stage_id, name, value, status, position,
                 expected_close_date, custom_fields, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    user_id,
                    input.pipeline_id,
                    input.stage_id,
                    name,
                    input.value,
                    input.status.as_str(),
                    position,
                    input.expected_close_date,
                    custom_fields,
                    ts
                ],
            )
            .context("Failed to insert deal")?;
        let id = self.conn.last_insert_rowid();
        self.get_deal(user_id, id)?.context("Deal not found after insert")
    }

    /// Field changes plus, when `stageId` or `position` is set, a move.
    /// The target stage must belong to the deal's pipeline; both the source
    /// and target stages are renumbered 0..n-1.
    pub fn update_deal(&self, user_id: i64, id: i64, patch: &DealUpdate) -> Result<Deal> {
        let deal = self
            .get_deal(user_id, id)?
            .ok_or_else(|| not_found("Deal", id))?;
        if let Some(value) = patch.value {
            check_value(value)?;
        }
        let name = patch
            .name
            .as_deref()
            .map(|n| required(n, "Deal name"))
            .transpose()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(name) = name {
            tx.execute("UPDATE deals SET name = ?1 WHERE id = ?2", params![name, id])
                .context("Failed to update deal name")?;
        }
        if let Some(value) = patch.value {
            tx.execute("UPDATE deals SET value = ?1 WHERE id = ?2", params![value, id])
                .context("Failed to update deal value")?;
        }
        if let Some(status) = patch.status {
            tx.execute(
                "UPDATE deals SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update deal status")?;
        }
        if let Some(date) = patch.expected_close_date {
            // `Some(None)` stores NULL.
            tx.execute(
                "UPDATE deals SET expected_close_date = ?1 WHERE id = ?2",
                params![date, id],
            )
            .context("Failed to update deal close date")?;
        }
        if let Some(fields) = &patch.custom_fields {
            let raw = serde_json::to_string(fields).context("Failed to serialize custom fields")?;
            tx.execute(
                "UPDATE deals SET custom_fields = ?1 WHERE id = ?2",
                params![raw, id],
            )
            .context("Failed to update deal custom fields")?;
        }
        if patch.stage_id.is_some() || patch.position.is_some() {
            let target = patch.stage_id.unwrap_or(deal.stage_id);
            self.check_stage(target, deal.pipeline_id)?;
            self.place_deal(&deal, target, patch.position)?;
        }
        tx.execute(
            "UPDATE deals SET updated_at = ?1 WHERE id = ?2",
            params![now(), id],
        )
        .context("Failed to touch deal")?;
        tx.commit().context("Failed to commit deal update")?;
        self.get_deal(user_id, id)?.context("Deal not found after update")
    }

    pub fn delete_deal(&self, user_id: i64, id: i64) -> Result<bool> {
        let Some(deal) = self.get_deal(user_id, id)? else {
            return Ok(false);
        };
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute("DELETE FROM deals WHERE id = ?1", params![id])
            .context("Failed to delete deal")?;
        let remaining = self.stage_deal_ids(deal.stage_id)?;
        self.renumber(&remaining)?;
        tx.commit().context("Failed to commit deal delete")?;
        Ok(true)
    }

    fn check_stage(&self, stage_id: i64, pipeline_id: i64) -> Result<()> {
        if self.stage_pipeline(stage_id)? != Some(pipeline_id) {
            return Err(bad_request(format!(
                "Stage {} does not belong to pipeline {}",
                stage_id, pipeline_id
            )));
        }
        Ok(())
    }

    fn place_deal(&self, deal: &Deal, target_stage: i64, position: Option<i32>) -> Result<()> {
        let mut order = self.stage_deal_ids(target_stage)?;
        order.retain(|&id| id != deal.id);
        let index = match position {
            Some(p) => p.clamp(0, order.len() as i32) as usize,
            None => order.len(),
        };
        order.insert(index, deal.id);

        self.conn
            .execute(
                "UPDATE deals SET stage_id = ?1 WHERE id = ?2",
                params![target_stage, deal.id],
            )
            .context("Failed to move deal")?;
        self.renumber(&order)?;
        if deal.stage_id != target_stage {
            let source = self.stage_deal_ids(deal.stage_id)?;
            self.renumber(&source)?;
        }
        Ok(())
    }

    fn stage_deal_ids(&self, stage_id: i64) -> Result<Vec<i64>> {
        self.query_ids(
            "SELECT id FROM deals WHERE stage_id = ?1 ORDER BY position, id",
            stage_id,
        )
    }

    fn renumber(&self, ids: &[i64]) -> Result<()> {
        for (position, id) in ids.iter().enumerate() {
            self.conn
                .execute(
                    "UPDATE deals SET position = ?1 WHERE id = ?2",
                    params![position as i64, id],
                )
                .context("Failed to renumber deals")?;
        }
        Ok(())
    }

    // ── Contacts ──────────────────────────────────────────────────────

    pub fn list_contacts(
        &self,
        user_id: i64,
        query: &ListQuery<ContactFilter>,
    ) -> Result<Page<Contact>> {
        let mut filter = Where::owned_by(user_id);
        if let Some(search) = &query.filter.search {
            let pattern = like_pattern(search);
            filter.push_many(
                "(name LIKE ? OR email LIKE ? OR company LIKE ?)",
                [pattern.clone(), pattern.clone(), pattern],
            );
        }
        if let Some(tag_id) = query.filter.tag_id {
            filter.push(
                "id IN (SELECT contact_id FROM contact_tags WHERE tag_id = ?)",
                tag_id,
            );
        }
        let total = self.count("contacts", &filter)?;
        let sql = format!(
            "SELECT {} FROM contacts WHERE {} ORDER BY id LIMIT ? OFFSET ?",
            CONTACT_COLUMNS,
            filter.sql()
        );
        let items = self
            .query_rows(&sql, filter.window(query), ContactRow::read)?
            .into_iter()
            .map(|r| self.hydrate_contact(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total))
    }

    pub fn get_contact(&self, user_id: i64, id: i64) -> Result<Option<Contact>> {
        let sql = format!(
            "SELECT {} FROM contacts WHERE id = ?1 AND user_id = ?2",
            CONTACT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id, user_id], ContactRow::read)
            .optional()
            .context("Failed to query contact")?;
        row.map(|r| self.hydrate_contact(r)).transpose()
    }

    pub fn create_contact(&self, user_id: i64, input: &NewContact) -> Result<Contact> {
        let name = required(&input.name, "Contact name")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();
        tx.execute(
            "INSERT INTO contacts (user_id, name, email, phone, company, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                user_id,
                name,
                non_blank(input.email.as_deref()),
                non_blank(input.phone.as_deref()),
                non_blank(input.company.as_deref()),
                ts
            ],
        )
        .context("Failed to insert contact")?;
        let id = tx.last_insert_rowid();
        self.set_contact_tags(user_id, id, &input.tag_ids)?;
        tx.commit().context("Failed to commit contact insert")?;
        self.get_contact(user_id, id)?
            .context("Contact not found after insert")
    }

    /// Blank optional fields clear the stored value.
    pub fn update_contact(&self, user_id: i64, id: i64, patch: &ContactUpdate) -> Result<Contact> {
        if self.get_contact(user_id, id)?.is_none() {
            return Err(not_found("Contact", id));
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(name) = &patch.name {
            let name = required(name, "Contact name")?;
            tx.execute(
                "UPDATE contacts SET name = ?1 WHERE id = ?2",
                params![name, id],
            )
            .context("Failed to update contact name")?;
        }
        for (column, value) in [
            ("email", &patch.email),
            ("phone", &patch.phone),
            ("company", &patch.company),
        ] {
            if let Some(value) = value {
                let sql = format!("UPDATE contacts SET {} = ?1 WHERE id = ?2", column);
                tx.execute(&sql, params![non_blank(Some(value.as_str())), id])
                    .with_context(|| format!("Failed to update contact {}", column))?;
            }
        }
        if let Some(tag_ids) = &patch.tag_ids {
            self.set_contact_tags(user_id, id, tag_ids)?;
        }
        tx.execute(
            "UPDATE contacts SET updated_at = ?1 WHERE id = ?2",
            params![now(), id],
        )
        .context("Failed to touch contact")?;
        tx.commit().context("Failed to commit contact update")?;
        self.get_contact(user_id, id)?
            .context("Contact not found after update")
    }

    pub fn delete_contact(&self, user_id: i64, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM contacts WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete contact")?;
        Ok(count > 0)
    }

    /// Replace the contact's tag set. Duplicate ids collapse.
    fn set_contact_tags(&self, user_id: i64, contact_id: i64, tag_ids: &[i64]) -> Result<()> {
        for tag_id in tag_ids {
            if self.get_tag(user_id, *tag_id)?.is_none() {
                return Err(bad_request(format!("Tag {} not found", tag_id)));
            }
        }
        self.conn
            .execute(
                "DELETE FROM contact_tags WHERE contact_id = ?1",
                params![contact_id],
            )
            .context("Failed to clear contact tags")?;
        for tag_id in tag_ids {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO contact_tags (contact_id, tag_id) VALUES (?1, ?2)",
                    params![contact_id, tag_id],
                )
                .context("Failed to tag contact")?;
        }
        Ok(())
    }

    fn hydrate_contact(&self, row: ContactRow) -> Result<Contact> {
        let sql = format!(
            "SELECT {} FROM tags WHERE id IN
             (SELECT tag_id FROM contact_tags WHERE contact_id = ?) ORDER BY id",
            TAG_COLUMNS
        );
        let tags = self
            .query_rows(&sql, vec![Value::Integer(row.id)], TagRow::read)?
            .into_iter()
            .map(TagRow::into_tag)
            .collect::<Result<Vec<_>>>()?;
        Ok(Contact {
            id: row.id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            company: row.company,
            tags,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }

    // ── Tags ──────────────────────────────────────────────────────────

    /// Every matching tag; the tag list is not paginated.
    pub fn list_tags(&self, user_id: i64, filter: &TagFilter) -> Result<Vec<Tag>> {
        let mut clause = Where::owned_by(user_id);
        if let Some(search) = &filter.search {
            clause.push("name LIKE ?", like_pattern(search));
        }
        let sql = format!(
            "SELECT {} FROM tags WHERE {} ORDER BY name, id",
            TAG_COLUMNS,
            clause.sql()
        );
        self.query_rows(&sql, clause.args, TagRow::read)?
            .into_iter()
            .map(TagRow::into_tag)
            .collect()
    }

    pub fn get_tag(&self, user_id: i64, id: i64) -> Result<Option<Tag>> {
        let sql = format!(
            "SELECT {} FROM tags WHERE id = ?1 AND user_id = ?2",
            TAG_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id, user_id], TagRow::read)
            .optional()
            .context("Failed to query tag")?;
        row.map(TagRow::into_tag).transpose()
    }

    pub fn create_tag(&self, user_id: i64, input: &NewTag) -> Result<Tag> {
        let name = required(&input.name, "Tag name")?;
        let color = check_color(&input.color)?;
        self.conn
            .execute(
                "INSERT INTO tags (user_id, name, color, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, name, color, now()],
            )
            .context("Failed to insert tag")?;
        let id = self.conn.last_insert_rowid();
        self.get_tag(user_id, id)?.context("Tag not found after insert")
    }

    pub fn update_tag(&self, user_id: i64, id: i64, patch: &TagUpdate) -> Result<Tag> {
        if self.get_tag(user_id, id)?.is_none() {
            return Err(not_found("Tag", id));
        }
        if let Some(name) = &patch.name {
            let name = required(name, "Tag name")?;
            self.conn
                .execute("UPDATE tags SET name = ?1 WHERE id = ?2", params![name, id])
                .context("Failed to update tag name")?;
        }
        if let Some(color) = &patch.color {
            let color = check_color(color)?;
            self.conn
                .execute(
                    "UPDATE tags SET color = ?1 WHERE id = ?2",
                    params![color, id],
                )
                .context("Failed to update tag color")?;
        }
        self.get_tag(user_id, id)?.context("Tag not found after update")
    }

    pub fn delete_tag(&self, user_id: i64, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM tags WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete tag")?;
        Ok(count > 0)
    }

    // ── Query helpers ─────────────────────────────────────────────────

    fn count(&self, table: &str, filter: &Where) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, filter.sql());
        let total: i64 = self
            .conn
            .query_row(&sql, params_from_iter(filter.args.iter()), |row| row.get(0))
            .with_context(|| format!("Failed to count {}", table))?;
        Ok(total.max(0) as u64)
    }

    fn query_rows<T>(
        &self,
        sql: &str,
        args: Vec<Value>,
        read: fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), read)
            .context("Failed to run query")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read row")
    }

    fn query_ids(&self, sql: &str, key: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare id query")?;
        let rows = stmt
            .query_map(params![key], |row| row.get(0))
            .context("Failed to query ids")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read id")
    }
}

/// Dynamic `WHERE` clause with positional arguments.
struct Where {
    clauses: Vec<&'static str>,
    args: Vec<Value>,
}

impl Where {
    fn owned_by(user_id: i64) -> Self {
        Self {
            clauses: vec!["user_id = ?"],
            args: vec![Value::Integer(user_id)],
        }
    }

    fn push(&mut self, clause: &'static str, arg: impl Into<Value>) {
        self.clauses.push(clause);
        self.args.push(arg.into());
    }

    fn push_many<const N: usize>(&mut self, clause: &'static str, args: [String; N]) {
        self.clauses.push(clause);
        self.args.extend(args.into_iter().map(Value::from));
    }

    fn sql(&self) -> String {
        self.clauses.join(" AND ")
    }

    /// Arguments followed by `LIMIT` and `OFFSET`.
    fn window<F>(&self, query: &ListQuery<F>) -> Vec<Value> {
        let mut args = self.args.clone();
        args.push(Value::Integer(i64::from(query.take)));
        args.push(Value::Integer(i64::from(query.skip)));
        args
    }
}

fn bad_request(message: impl Into<String>) -> anyhow::Error {
    ServerError::BadRequest(message.into()).into()
}

fn not_found(entity: &'static str, id: i64) -> anyhow::Error {
    ServerError::not_found(entity, id).into()
}

fn required<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(bad_request(format!("{} is required", what)));
    }
    Ok(trimmed)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn check_value(value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(bad_request("Deal value must be a non-negative number"));
    }
    Ok(())
}

fn check_color(color: &str) -> Result<String> {
    let color = color.trim();
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(bad_request(format!(
            "Invalid color '{}': expected #RRGGBB",
            color
        )));
    }
    Ok(color.to_ascii_uppercase())
}

fn like_pattern(search: &str) -> String {
    format!("%{}%", search.trim())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Accepts RFC 3339 and SQLite's `datetime('now')` format.
fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

// ── Row structs ───────────────────────────────────────────────────────

struct UserRow {
    id: i64,
    email: String,
    name: Option<String>,
    notion_user_id: Option<String>,
    notion_workspace_id: Option<String>,
    plan: String,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

impl UserRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            notion_user_id: row.get(3)?,
            notion_workspace_id: row.get(4)?,
            plan: row.get(5)?,
            is_active: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_user(self) -> Result<User> {
        let plan = Plan::from_str(&self.plan)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse user plan")?;
        Ok(User {
            id: self.id,
            email: self.email,
            name: self.name,
            notion_user_id: self.notion_user_id,
            notion_workspace_id: self.notion_workspace_id,
            plan,
            is_active: self.is_active,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct PipelineRow {
    id: i64,
    name: String,
    created_at: String,
    updated_at: String,
}

impl PipelineRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }
}

/// Intermediate row for deals before the status, custom field JSON and
/// Notion columns are turned into typed values.
struct DealRow {
    id: i64,
    user_id: i64,
    pipeline_id: i64,
    stage_id: i64,
    name: String,
    value: f64,
    status: String,
    position: i32,
    expected_close_date: Option<NaiveDate>,
    custom_fields: String,
    notion_page_id: Option<String>,
    notion_database_id: Option<String>,
    notion_last_synced_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DealRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            pipeline_id: row.get(2)?,
            stage_id: row.get(3)?,
            name: row.get(4)?,
            value: row.get(5)?,
            status: row.get(6)?,
            position: row.get(7)?,
            expected_close_date: row.get(8)?,
            custom_fields: row.get(9)?,
            notion_page_id: row.get(10)?,
            notion_database_id: row.get(11)?,
            notion_last_synced_at: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_deal(self) -> Result<Deal> {
        let status = DealStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse deal status")?;
        let custom_fields: CustomFields = serde_json::from_str(&self.custom_fields)
            .context("Failed to parse deal custom fields JSON")?;
        let notion = if self.notion_page_id.is_some() || self.notion_database_id.is_some() {
            Some(NotionSync {
                page_id: self.notion_page_id,
                database_id: self.notion_database_id,
                last_synced_at: self
                    .notion_last_synced_at
                    .as_deref()
                    .map(parse_ts)
                    .transpose()?,
            })
        } else {
            None
        };
        Ok(Deal {
            id: self.id,
            name: self.name,
            value: self.value,
            status,
            stage_id: self.stage_id,
            pipeline_id: self.pipeline_id,
            user_id: self.user_id,
            position: self.position,
            expected_close_date: self.expected_close_date,
            custom_fields,
            notion,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct ContactRow {
    id: i64,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ContactRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            company: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

struct TagRow {
    id: i64,
    name: String,
    color: String,
    created_at: String,
}

impl TagRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            color: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn into_tag(self) -> Result<Tag> {
        Ok(Tag {
            id: self.id,
            name: self.name,
            color: self.color,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
