//! Local reference engine on SQLite.
//!
//! `SqliteEngine` owns the database and engine-wide state (open connection
//! tickets, availability, clock). Each session talks to it through its own
//! `SqliteBackend`, obtained with [`SqliteEngine::connector`].
//!
//! Routing is deliberately simple: a started process enters the first
//! activity of its definition, every participant of an activity gets one
//! worklist item, and the first item completed with an action completes its
//! siblings and routes to the action's `next` activity (or ends the process).

use super::{
    Backend, CallContext, ConnectGrant, OpenMode, ProcessChanges, WorklistPage, WorklistQuery,
};
use crate::config::ConnectionConfig;
use crate::config::seed::{ActivityDefinition, EngineSeed, ProcessDefinition};
use crate::models::criteria::{CriteriaValue, WcCompare, WcField, WcLogical, WcSortOrder};
use crate::models::fields::{DataFields, FieldKind, FieldValue};
use crate::models::{
    AttachmentContent, AttachmentRecord, Comment, DEFAULT_SECURITY_LABEL, Identity, ItemRecord,
    ItemStatus, ProcessRecord, ProcessStatus, Scope, SerialNumber, split_full_name,
};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Source of timestamps for the engine.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct EngineState {
    online: bool,
    max_connections: usize,
    /// ticket -> principal
    tickets: HashMap<String, Identity>,
    clock: Clock,
}

struct EngineShared {
    conn: Mutex<Connection>,
    state: Mutex<EngineState>,
    security_label: String,
}

/// A workflow engine stored in a single SQLite database.
#[derive(Clone)]
pub struct SqliteEngine {
    shared: Arc<EngineShared>,
}

impl SqliteEngine {
    /// Open or create an engine database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, DEFAULT_SECURITY_LABEL)
    }

    /// Create an engine that lives only as long as this value and its clones.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, DEFAULT_SECURITY_LABEL)
    }

    /// Create an engine and provision it from `seed`.
    ///
    /// `path` of `None` creates an in-memory engine.
    pub fn from_seed(path: Option<&Path>, seed: &EngineSeed) -> Result<Self> {
        seed.validate()?;
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        let engine = Self::from_connection(conn, &seed.security_label)?;
        engine.set_max_connections(seed.max_connections)?;

        for user in &seed.users {
            engine.add_user(&user.name, &user.password, user.can_impersonate)?;
        }
        for user in &seed.users {
            if let Some(manager) = &user.manager {
                engine.add_report(manager, &user.name)?;
            }
        }
        for delegation in &seed.delegations {
            engine.add_delegation(&delegation.from, &delegation.to)?;
        }
        for process in &seed.processes {
            engine.deploy(process)?;
        }
        Ok(engine)
    }

    fn from_connection(conn: Connection, security_label: &str) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;

        let clock: Clock = Arc::new(Utc::now);
        Ok(Self {
            shared: Arc::new(EngineShared {
                conn: Mutex::new(conn),
                state: Mutex::new(EngineState {
                    online: true,
                    max_connections: crate::config::seed::DEFAULT_MAX_CONNECTIONS,
                    tickets: HashMap::new(),
                    clock,
                }),
                security_label: security_label.to_string(),
            }),
        })
    }

    /// A new, unconnected backend for one session.
    pub fn connector(&self) -> SqliteBackend {
        SqliteBackend {
            engine: self.clone(),
            ticket: None,
        }
    }

    // === Administration ===

    /// Register a user. `name` may omit its security label.
    pub fn add_user(&self, name: &str, password: &str, can_impersonate: bool) -> Result<Identity> {
        let user = self.identity(name)?;
        let salt = Uuid::new_v4().simple().to_string();
        let hash = password_digest(&salt, password);
        self.lock_conn()?.execute(
            "INSERT INTO users (name, salt, password_hash, can_impersonate) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET salt = ?2, password_hash = ?3, can_impersonate = ?4",
            params![user.fqn(), salt, hash, can_impersonate],
        )?;
        Ok(user)
    }

    /// Record that `subordinate` reports to `manager`.
    pub fn add_report(&self, manager: &str, subordinate: &str) -> Result<()> {
        let manager = self.identity(manager)?;
        let subordinate = self.identity(subordinate)?;
        self.lock_conn()?.execute(
            "INSERT OR IGNORE INTO reports (manager, subordinate) VALUES (?1, ?2)",
            params![manager.fqn(), subordinate.fqn()],
        )?;
        Ok(())
    }

    /// Share the items of `original_user` with `delegate`.
    pub fn add_delegation(&self, original_user: &str, delegate: &str) -> Result<()> {
        let original = self.identity(original_user)?;
        let delegate = self.identity(delegate)?;
        self.lock_conn()?.execute(
            "INSERT OR IGNORE INTO delegations (original_user, delegate) VALUES (?1, ?2)",
            params![original.fqn(), delegate.fqn()],
        )?;
        Ok(())
    }

    /// Deploy (or redeploy) a process definition.
    pub fn deploy(&self, definition: &ProcessDefinition) -> Result<()> {
        definition.validate(&self.shared.security_label)?;
        let body = serde_json::to_string(definition)?;
        self.lock_conn()?.execute(
            "INSERT INTO definitions (full_name, body) VALUES (?1, ?2)
             ON CONFLICT(full_name) DO UPDATE SET body = ?2",
            params![definition.full_name, body],
        )?;
        info!(process = %definition.full_name, "Deployed process definition");
        Ok(())
    }

    /// Take the engine off the network (or back on).
    pub fn set_online(&self, online: bool) -> Result<()> {
        self.lock_state()?.online = online;
        Ok(())
    }

    pub fn set_max_connections(&self, max_connections: usize) -> Result<()> {
        self.lock_state()?.max_connections = max_connections;
        Ok(())
    }

    /// Number of connection slots currently held.
    pub fn open_connections(&self) -> Result<usize> {
        Ok(self.lock_state()?.tickets.len())
    }

    /// Replace the engine clock.
    pub fn set_clock(&self, clock: Clock) -> Result<()> {
        self.lock_state()?.clock = clock;
        Ok(())
    }

    // === Internals ===

    fn identity(&self, name: &str) -> Result<Identity> {
        Identity::parse(name, &self.shared.security_label)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.shared
            .conn
            .lock()
            .map_err(|_| Error::Other("engine database lock poisoned".to_string()))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| Error::Other("engine state lock poisoned".to_string()))
    }

    fn now(&self) -> Result<DateTime<Utc>> {
        let clock = self.lock_state()?.clock.clone();
        Ok(clock())
    }

    /// Fail unless the engine is reachable and `ticket` is a live connection.
    fn check_ticket(&self, ticket: &str) -> Result<()> {
        let state = self.lock_state()?;
        if !state.online {
            return Err(Error::Connectivity("workflow engine is unreachable".to_string()));
        }
        if !state.tickets.contains_key(ticket) {
            return Err(Error::Authentication(
                "connection ticket is not valid".to_string(),
            ));
        }
        Ok(())
    }

    fn release_ticket(&self, ticket: &str) -> Result<()> {
        if self.lock_state()?.tickets.remove(ticket).is_some() {
            debug!("Released connection slot");
        }
        Ok(())
    }
}

/// One session's view of a [`SqliteEngine`].
pub struct SqliteBackend {
    engine: SqliteEngine,
    ticket: Option<String>,
}

impl SqliteBackend {
    /// Verify the call's ticket and lock the database.
    fn begin(&self, ctx: &CallContext) -> Result<MutexGuard<'_, Connection>> {
        if self.ticket.as_deref() != Some(ctx.ticket.as_str()) {
            return Err(Error::Authentication(
                "connection ticket does not belong to this backend".to_string(),
            ));
        }
        self.engine.check_ticket(&ctx.ticket)?;
        self.engine.lock_conn()
    }

    fn label(&self) -> &str {
        &self.engine.shared.security_label
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            let _ = self.engine.release_ticket(&ticket);
        }
    }
}

impl Backend for SqliteBackend {
    fn connect(&mut self, config: &ConnectionConfig) -> Result<ConnectGrant> {
        if !self.engine.lock_state()?.online {
            return Err(Error::Connectivity(format!(
                "endpoint {} is unreachable",
                config.endpoint()
            )));
        }
        if self.ticket.is_some() {
            return Err(Error::InvalidState("backend is already connected".to_string()));
        }

        let user = config
            .identity()?
            .ok_or_else(|| Error::Authentication("no user id supplied".to_string()))?;

        let row: Option<(String, String)> = self
            .engine
            .lock_conn()?
            .query_row(
                "SELECT salt, password_hash FROM users WHERE name = ?1",
                [user.fqn()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((salt, hash)) = row else {
            return Err(Error::Authentication(format!("unknown user {}", user)));
        };
        if config.authenticate {
            let password = config.password.as_deref().unwrap_or_default();
            if password_digest(&salt, password) != hash {
                return Err(Error::Authentication(format!(
                    "invalid credentials for {}",
                    user
                )));
            }
        }

        let mut state = self.engine.lock_state()?;
        if state.tickets.len() >= state.max_connections {
            return Err(Error::Connectivity(format!(
                "no free connection slots on {} ({} in use)",
                config.endpoint(),
                state.tickets.len()
            )));
        }
        let ticket = Uuid::new_v4().to_string();
        state.tickets.insert(ticket.clone(), user.clone());
        drop(state);

        self.ticket = Some(ticket.clone());
        info!(user = %user, endpoint = %config.endpoint(), "Connection opened");
        Ok(ConnectGrant {
            ticket,
            principal: user,
        })
    }

    fn disconnect(&mut self, ctx: &CallContext) -> Result<()> {
        if self.ticket.as_deref() != Some(ctx.ticket.as_str()) {
            return Err(Error::Authentication(
                "connection ticket does not belong to this backend".to_string(),
            ));
        }
        self.engine.release_ticket(&ctx.ticket)?;
        self.ticket = None;
        info!(user = %ctx.principal, "Connection closed");
        Ok(())
    }

    fn impersonate(&mut self, ctx: &CallContext, target: &Identity) -> Result<()> {
        let conn = self.begin(ctx)?;
        let can_impersonate: Option<bool> = conn
            .query_row(
                "SELECT can_impersonate FROM users WHERE name = ?1",
                [ctx.principal.fqn()],
                |row| row.get(0),
            )
            .optional()?;
        if can_impersonate != Some(true) {
            return Err(Error::Permission(format!(
                "{} does not have the impersonate permission",
                ctx.principal
            )));
        }
        if !user_exists(&conn, target)? {
            return Err(Error::NotFound(format!("User not found: {}", target)));
        }
        Ok(())
    }

    fn create_process(&mut self, ctx: &CallContext, full_name: &str) -> Result<ProcessRecord> {
        let conn = self.begin(ctx)?;
        let definition = load_definition(&conn, full_name)?;
        check_starter(&definition, &ctx.acting_as, self.label())?;

        Ok(ProcessRecord {
            id: 0,
            full_name: definition.full_name.clone(),
            folio: String::new(),
            priority: 1,
            status: ProcessStatus::New,
            originator: Some(ctx.acting_as.clone()),
            start_date: None,
            data_fields: definition.initial_fields(),
        })
    }

    fn start_process(
        &mut self,
        ctx: &CallContext,
        draft: &ProcessRecord,
        sync: bool,
    ) -> Result<ProcessRecord> {
        if draft.status != ProcessStatus::New {
            return Err(Error::InvalidState(format!(
                "process instance {} has already been started",
                draft.id
            )));
        }
        let now = self.engine.now()?;
        let label = self.label().to_string();
        let mut conn = self.begin(ctx)?;
        let definition = load_definition(&conn, &draft.full_name)?;
        check_starter(&definition, &ctx.acting_as, &label)?;

        let mut fields = definition.initial_fields();
        fields.apply(&draft.data_fields)?;

        let first = definition.first_activity().ok_or_else(|| {
            Error::Other(format!("definition {} has no activities", definition.full_name))
        })?;

        let (folder, name) = split_full_name(&definition.full_name);
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO processes (full_name, folder, name, folio, priority, status, originator, start_date)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7)",
            params![
                definition.full_name,
                folder,
                name,
                draft.folio,
                draft.priority,
                ctx.acting_as.fqn(),
                timestamp(&now),
            ],
        )?;
        let process_id = tx.last_insert_rowid();
        for (field, value) in fields.iter() {
            tx.execute(
                "INSERT INTO process_fields (process_id, name, kind, value) VALUES (?1, ?2, ?3, ?4)",
                params![process_id, field, value.kind().as_str(), field_to_sql(value)],
            )?;
        }
        route_to(&tx, process_id, &definition, first, &now, &label)?;
        tx.commit()?;

        // Routing above is synchronous, so both modes return at the first wait state
        info!(process_id, process = %definition.full_name, sync, "Started process instance");
        load_process(&conn, process_id, &label)
    }

    fn open_process(&mut self, ctx: &CallContext, id: i64) -> Result<ProcessRecord> {
        let conn = self.begin(ctx)?;
        load_process(&conn, id, self.label())
    }

    fn query_worklist(&mut self, ctx: &CallContext, query: &WorklistQuery) -> Result<WorklistPage> {
        let conn = self.begin(ctx)?;
        let owner = match &query.managed_user {
            Some(managed) => {
                if !is_manager(&conn, &ctx.acting_as, managed)? {
                    return Err(Error::Authorization(format!(
                        "{} has no reporting relationship to {}",
                        ctx.acting_as, managed
                    )));
                }
                managed.clone()
            }
            None => ctx.acting_as.clone(),
        };

        let mut where_params: Vec<Value> = vec![
            Value::Text(owner.fqn()),
            Value::Text(query.platform.clone()),
        ];
        let mut where_sql = String::from(
            "WHERE i.destination = ? AND i.platform = ? AND i.status <> 'completed'",
        );
        if let Some(filter) = compile_filters(&query.criteria, &mut where_params) {
            where_sql.push_str(" AND ");
            where_sql.push_str(&filter);
        }

        let count_sql = format!(
            "SELECT COUNT(*) FROM items i JOIN processes p ON p.id = i.process_id {}",
            where_sql
        );
        let total_count: i64 =
            conn.query_row(&count_sql, params_from_iter(where_params.iter()), |row| {
                row.get(0)
            })?;

        let mut params = where_params;
        let mut sql = format!("{} {} ORDER BY ", ITEM_SELECT, where_sql);
        for sort in query.criteria.sorts() {
            let column = column_expr(&sort.field, &mut params);
            let direction = match sort.order {
                WcSortOrder::Ascending => "ASC",
                WcSortOrder::Descending => "DESC",
            };
            sql.push_str(&format!("{} {}, ", column, direction));
        }
        // Stable tie-breaker so one call never shuffles equal rows
        sql.push_str("i.destination_id ASC");
        if let Some(paging) = query.criteria.paging() {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(i64::from(paging.page_size)));
            params.push(Value::Integer(i64::from(paging.start_index)));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<ItemRow> = stmt
            .query_map(params_from_iter(params.iter()), ItemRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        let items = rows
            .iter()
            .map(|row| row.summary(self.label()))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            user = %owner,
            total_count,
            returned = items.len(),
            "Queried worklist"
        );
        Ok(WorklistPage {
            items,
            total_count: u64::try_from(total_count).unwrap_or_default(),
        })
    }

    fn open_item(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        allocate: bool,
    ) -> Result<ItemRecord> {
        let label = self.label().to_string();
        let conn = self.begin(ctx)?;
        let row = load_item_row(&conn, serial)?;
        check_access(&conn, ctx, &row, mode)?;
        match row.status.as_str() {
            "completed" => {
                return Err(Error::InvalidState(format!(
                    "worklist item {} has already been completed",
                    serial
                )));
            }
            "unopened" if allocate => {
                conn.execute(
                    "UPDATE items SET status = 'opened', opened_by = ?1 WHERE destination_id = ?2",
                    params![ctx.acting_as.fqn(), row.destination_id],
                )?;
                debug!(serial = %serial, user = %ctx.acting_as, "Allocated worklist item");
            }
            _ => {}
        }
        let row = load_item_row(&conn, serial)?;
        detailed_item(&conn, &row, &label)
    }

    fn update_item(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        changes: &ProcessChanges,
    ) -> Result<ItemRecord> {
        let label = self.label().to_string();
        let mut conn = self.begin(ctx)?;
        let tx = conn.transaction()?;
        let row = load_item_row(&tx, serial)?;
        check_access(&tx, ctx, &row, mode)?;
        require_opened(&row)?;
        apply_changes(&tx, row.process_id, changes)?;
        tx.commit()?;

        let row = load_item_row(&conn, serial)?;
        detailed_item(&conn, &row, &label)
    }

    fn execute_action(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        action: &str,
        changes: &ProcessChanges,
    ) -> Result<()> {
        let now = self.engine.now()?;
        let label = self.label().to_string();
        let mut conn = self.begin(ctx)?;
        let tx = conn.transaction()?;

        let row = load_item_row(&tx, serial)?;
        check_access(&tx, ctx, &row, mode)?;
        require_opened(&row)?;

        let definition = load_definition(&tx, &row.full_name)?;
        let activity = definition.activity(&row.activity_name).ok_or_else(|| {
            Error::Other(format!(
                "activity {} is missing from definition {}",
                row.activity_name, row.full_name
            ))
        })?;
        let action_def = activity.action(action).ok_or_else(|| {
            Error::UnknownAction(format!("{} is not available on item {}", action, serial))
        })?;

        apply_changes(&tx, row.process_id, changes)?;

        // First writer wins: only an item still open can be completed
        let completed = tx.execute(
            "UPDATE items SET status = 'completed', completed_action = ?1
             WHERE destination_id = ?2 AND status = 'opened'",
            params![action, row.destination_id],
        )?;
        if completed == 0 {
            return Err(Error::InvalidState(format!(
                "worklist item {} was completed by another session",
                serial
            )));
        }
        tx.execute(
            "UPDATE items SET status = 'completed'
             WHERE process_id = ?1 AND activity_instance = ?2 AND status <> 'completed'",
            params![row.process_id, row.activity_instance],
        )?;

        match &action_def.next {
            Some(next) => {
                let next = definition.activity(next).ok_or_else(|| {
                    Error::Other(format!("route to unknown activity {}", next))
                })?;
                route_to(&tx, row.process_id, &definition, next, &now, &label)?;
            }
            None => {
                tx.execute(
                    "UPDATE processes SET status = 'completed' WHERE id = ?1",
                    [row.process_id],
                )?;
            }
        }
        tx.commit()?;

        info!(serial = %serial, action, user = %ctx.acting_as, "Executed action");
        Ok(())
    }

    fn add_comment(&mut self, ctx: &CallContext, scope: &Scope, message: &str) -> Result<Comment> {
        let now = self.engine.now()?;
        let conn = self.begin(ctx)?;
        let (process_id, destination_id) = check_scope(&conn, scope)?;
        conn.execute(
            "INSERT INTO comments (process_id, destination_id, author, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                process_id,
                destination_id,
                ctx.acting_as.fqn(),
                message,
                timestamp(&now)
            ],
        )?;
        Ok(Comment {
            id: conn.last_insert_rowid(),
            process_instance_id: process_id,
            destination_id,
            author: ctx.acting_as.clone(),
            message: message.to_string(),
            created_at: now,
        })
    }

    fn comments(&mut self, ctx: &CallContext, scope: &Scope) -> Result<Vec<Comment>> {
        let label = self.label().to_string();
        let conn = self.begin(ctx)?;
        let (process_id, destination_id) = check_scope(&conn, scope)?;
        let mut stmt = conn.prepare(
            "SELECT id, process_id, destination_id, author, message, created_at FROM comments
             WHERE process_id = ?1 AND (?2 IS NULL OR destination_id = ?2)
             ORDER BY id",
        )?;
        let rows: Vec<(i64, i64, Option<i64>, String, String, String)> = stmt
            .query_map(params![process_id, destination_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        rows.into_iter()
            .map(|(id, process_instance_id, destination_id, author, message, created_at)| {
                Ok(Comment {
                    id,
                    process_instance_id,
                    destination_id,
                    author: Identity::parse(&author, &label)?,
                    message,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    fn add_attachment(
        &mut self,
        ctx: &CallContext,
        scope: &Scope,
        file_name: &str,
        content: Option<&[u8]>,
    ) -> Result<AttachmentRecord> {
        if file_name.trim().is_empty() {
            return Err(Error::InvalidInput("attachment file name cannot be empty".to_string()));
        }
        let now = self.engine.now()?;
        let label = self.label().to_string();
        let conn = self.begin(ctx)?;
        let (process_id, destination_id) = check_scope(&conn, scope)?;
        conn.execute(
            "INSERT INTO attachments (process_id, destination_id, file_name, owner, created_at, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                process_id,
                destination_id,
                file_name,
                ctx.acting_as.fqn(),
                timestamp(&now),
                content
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, file_name, has_content = content.is_some(), "Added attachment");
        load_attachment(&conn, id, false, &label)
    }

    fn upload_attachment_content(
        &mut self,
        ctx: &CallContext,
        id: i64,
        content: &[u8],
    ) -> Result<AttachmentRecord> {
        let label = self.label().to_string();
        let conn = self.begin(ctx)?;
        let existing = load_attachment(&conn, id, false, &label)?;
        if existing.content.is_uploaded() {
            return Err(Error::AlreadyUploaded(format!(
                "attachment {} ({}) already has content",
                id, existing.file_name
            )));
        }
        let updated = conn.execute(
            "UPDATE attachments SET content = ?1 WHERE id = ?2 AND content IS NULL",
            params![content, id],
        )?;
        if updated == 0 {
            return Err(Error::AlreadyUploaded(format!(
                "attachment {} already has content",
                id
            )));
        }
        info!(id, size = content.len(), "Uploaded attachment content");
        load_attachment(&conn, id, false, &label)
    }

    fn attachments(
        &mut self,
        ctx: &CallContext,
        scope: &Scope,
        include_file: bool,
    ) -> Result<Vec<AttachmentRecord>> {
        let label = self.label().to_string();
        let conn = self.begin(ctx)?;
        let (process_id, destination_id) = check_scope(&conn, scope)?;
        let mut stmt = conn.prepare(
            "SELECT id FROM attachments
             WHERE process_id = ?1 AND (?2 IS NULL OR destination_id = ?2)
             ORDER BY id",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![process_id, destination_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        ids.into_iter()
            .map(|id| load_attachment(&conn, id, include_file, &label))
            .collect()
    }

    fn attachment(
        &mut self,
        ctx: &CallContext,
        id: i64,
        include_file: bool,
    ) -> Result<AttachmentRecord> {
        let label = self.label().to_string();
        let conn = self.begin(ctx)?;
        load_attachment(&conn, id, include_file, &label)
    }

    fn attachment_content(&mut self, ctx: &CallContext, id: i64) -> Result<Vec<u8>> {
        let conn = self.begin(ctx)?;
        let content: Option<Option<Vec<u8>>> = conn
            .query_row("SELECT content FROM attachments WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        match content {
            None => Err(Error::NotFound(format!("Attachment not found: {}", id))),
            Some(None) => Err(Error::InvalidState(format!(
                "attachment {} has no content yet",
                id
            ))),
            Some(Some(bytes)) => Ok(bytes),
        }
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

// === Schema ===

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS users (
            name TEXT PRIMARY KEY,
            salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            can_impersonate INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS reports (
            manager TEXT NOT NULL,
            subordinate TEXT NOT NULL,
            PRIMARY KEY (manager, subordinate)
        );

        CREATE TABLE IF NOT EXISTS delegations (
            original_user TEXT NOT NULL,
            delegate TEXT NOT NULL,
            PRIMARY KEY (original_user, delegate)
        );

        CREATE TABLE IF NOT EXISTS definitions (
            full_name TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            full_name TEXT NOT NULL,
            folder TEXT NOT NULL,
            name TEXT NOT NULL,
            folio TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            originator TEXT NOT NULL,
            start_date TEXT NOT NULL
        );

        -- value has no declared type so integers and text keep their storage class
        CREATE TABLE IF NOT EXISTS process_fields (
            process_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            value,
            PRIMARY KEY (process_id, name),
            FOREIGN KEY (process_id) REFERENCES processes(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS items (
            destination_id INTEGER PRIMARY KEY AUTOINCREMENT,
            process_id INTEGER NOT NULL,
            activity_instance INTEGER NOT NULL,
            activity_name TEXT NOT NULL,
            destination TEXT NOT NULL,
            platform TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'unopened',
            start_date TEXT NOT NULL,
            opened_by TEXT,
            completed_action TEXT,
            FOREIGN KEY (process_id) REFERENCES processes(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS comments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            process_id INTEGER NOT NULL,
            destination_id INTEGER,
            author TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (process_id) REFERENCES processes(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            process_id INTEGER NOT NULL,
            destination_id INTEGER,
            file_name TEXT NOT NULL,
            owner TEXT NOT NULL,
            created_at TEXT NOT NULL,
            content BLOB,
            FOREIGN KEY (process_id) REFERENCES processes(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_items_destination ON items(destination, platform, status);
        CREATE INDEX IF NOT EXISTS idx_items_process ON items(process_id, activity_instance);
        CREATE INDEX IF NOT EXISTS idx_comments_process ON comments(process_id);
        CREATE INDEX IF NOT EXISTS idx_attachments_process ON attachments(process_id);
        "#,
    )?;
    Ok(())
}

// === Row mapping ===

const ITEM_SELECT: &str = "SELECT i.destination_id, i.process_id, i.activity_instance, i.activity_name,
        i.destination, i.platform, i.status, i.start_date,
        p.full_name, p.folio, p.priority, p.status, p.originator, p.start_date
    FROM items i JOIN processes p ON p.id = i.process_id";

struct ItemRow {
    destination_id: i64,
    process_id: i64,
    activity_instance: i64,
    activity_name: String,
    destination: String,
    platform: String,
    status: String,
    start_date: String,
    full_name: String,
    folio: String,
    priority: i32,
    process_status: String,
    originator: String,
    process_start: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            destination_id: row.get(0)?,
            process_id: row.get(1)?,
            activity_instance: row.get(2)?,
            activity_name: row.get(3)?,
            destination: row.get(4)?,
            platform: row.get(5)?,
            status: row.get(6)?,
            start_date: row.get(7)?,
            full_name: row.get(8)?,
            folio: row.get(9)?,
            priority: row.get(10)?,
            process_status: row.get(11)?,
            originator: row.get(12)?,
            process_start: row.get(13)?,
        })
    }

    fn serial(&self) -> SerialNumber {
        SerialNumber::new(self.process_id, self.destination_id)
    }

    /// The item without data fields or actions, as listed in a worklist.
    fn summary(&self, label: &str) -> Result<ItemRecord> {
        Ok(ItemRecord {
            serial_number: self.serial(),
            status: parse_item_status(&self.status)?,
            activity_name: self.activity_name.clone(),
            activity_start_date: parse_timestamp(&self.start_date)?,
            destination: Identity::parse(&self.destination, label)?,
            platform: self.platform.clone(),
            process: ProcessRecord {
                id: self.process_id,
                full_name: self.full_name.clone(),
                folio: self.folio.clone(),
                priority: self.priority,
                status: parse_process_status(&self.process_status)?,
                originator: Some(Identity::parse(&self.originator, label)?),
                start_date: Some(parse_timestamp(&self.process_start)?),
                data_fields: DataFields::new(),
            },
            actions: Vec::new(),
        })
    }
}

fn load_item_row(conn: &Connection, serial: &SerialNumber) -> Result<ItemRow> {
    let sql = format!("{} WHERE i.destination_id = ?1 AND i.process_id = ?2", ITEM_SELECT);
    conn.query_row(
        &sql,
        params![serial.destination_id(), serial.process_instance_id()],
        ItemRow::from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("Worklist item not found: {}", serial)))
}

/// The item with its process data fields and, while open, its actions.
fn detailed_item(conn: &Connection, row: &ItemRow, label: &str) -> Result<ItemRecord> {
    let mut item = row.summary(label)?;
    item.process.data_fields = load_fields(conn, row.process_id)?;
    if item.status == ItemStatus::Opened {
        let definition = load_definition(conn, &row.full_name)?;
        if let Some(activity) = definition.activity(&row.activity_name) {
            item.actions = activity.action_names();
        }
    }
    Ok(item)
}

fn load_process(conn: &Connection, id: i64, label: &str) -> Result<ProcessRecord> {
    let row: Option<(String, String, i32, String, String, String)> = conn
        .query_row(
            "SELECT full_name, folio, priority, status, originator, start_date
             FROM processes WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;
    let Some((full_name, folio, priority, status, originator, start_date)) = row else {
        return Err(Error::NotFound(format!("Process instance not found: {}", id)));
    };

    Ok(ProcessRecord {
        id,
        full_name,
        folio,
        priority,
        status: parse_process_status(&status)?,
        originator: Some(Identity::parse(&originator, label)?),
        start_date: Some(parse_timestamp(&start_date)?),
        data_fields: load_fields(conn, id)?,
    })
}

fn load_fields(conn: &Connection, process_id: i64) -> Result<DataFields> {
    let mut stmt = conn.prepare(
        "SELECT name, kind, value FROM process_fields WHERE process_id = ?1 ORDER BY name",
    )?;
    let rows: Vec<(String, String, Value)> = stmt
        .query_map([process_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter()
        .map(|(name, kind, value)| {
            let value = field_from_sql(&name, &kind, value)?;
            Ok((name, value))
        })
        .collect()
}

fn load_definition(conn: &Connection, full_name: &str) -> Result<ProcessDefinition> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM definitions WHERE full_name = ?1",
            [full_name],
            |row| row.get(0),
        )
        .optional()?;
    let body =
        body.ok_or_else(|| Error::NotFound(format!("Process definition not found: {}", full_name)))?;
    Ok(serde_json::from_str(&body)?)
}

fn load_attachment(
    conn: &Connection,
    id: i64,
    include_file: bool,
    label: &str,
) -> Result<AttachmentRecord> {
    let row: Option<(i64, Option<i64>, String, String, String, Option<i64>)> = conn
        .query_row(
            "SELECT process_id, destination_id, file_name, owner, created_at, length(content)
             FROM attachments WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;
    let Some((process_instance_id, destination_id, file_name, owner, created_at, size)) = row
    else {
        return Err(Error::NotFound(format!("Attachment not found: {}", id)));
    };

    let content = match size {
        None => AttachmentContent::Pending,
        Some(size) => {
            let bytes = if include_file {
                Some(conn.query_row(
                    "SELECT content FROM attachments WHERE id = ?1",
                    [id],
                    |row| row.get::<_, Vec<u8>>(0),
                )?)
            } else {
                None
            };
            AttachmentContent::Uploaded {
                size: u64::try_from(size).unwrap_or_default(),
                bytes,
            }
        }
    };

    Ok(AttachmentRecord {
        id,
        process_instance_id,
        destination_id,
        file_name,
        owner: Identity::parse(&owner, label)?,
        created_at: parse_timestamp(&created_at)?,
        content,
    })
}

// === Engine rules ===

/// Create one item per participant of `activity`.
fn route_to(
    conn: &Connection,
    process_id: i64,
    definition: &ProcessDefinition,
    activity: &ActivityDefinition,
    now: &DateTime<Utc>,
    label: &str,
) -> Result<()> {
    let activity_instance: i64 = conn.query_row(
        "SELECT COALESCE(MAX(activity_instance), 0) + 1 FROM items WHERE process_id = ?1",
        [process_id],
        |row| row.get(0),
    )?;
    for participant in &activity.participants {
        let destination = Identity::parse(participant, label)?;
        conn.execute(
            "INSERT INTO items (process_id, activity_instance, activity_name, destination, platform, status, start_date)
             VALUES (?1, ?2, ?3, ?4, ?5, 'unopened', ?6)",
            params![
                process_id,
                activity_instance,
                activity.name,
                destination.fqn(),
                definition.platform,
                timestamp(now)
            ],
        )?;
    }
    debug!(
        process_id,
        activity = %activity.name,
        destinations = activity.participants.len(),
        "Routed process"
    );
    Ok(())
}

fn check_starter(definition: &ProcessDefinition, user: &Identity, label: &str) -> Result<()> {
    if definition.starters.is_empty() {
        return Ok(());
    }
    for starter in &definition.starters {
        if &Identity::parse(starter, label)? == user {
            return Ok(());
        }
    }
    Err(Error::Permission(format!(
        "{} may not start {}",
        user, definition.full_name
    )))
}

fn check_access(conn: &Connection, ctx: &CallContext, row: &ItemRow, mode: &OpenMode) -> Result<()> {
    let denied = |why: String| {
        Err(Error::Authorization(format!(
            "{} cannot open worklist item {}: {}",
            ctx.acting_as,
            row.serial(),
            why
        )))
    };

    match mode {
        OpenMode::Own => {
            if row.destination != ctx.acting_as.fqn() {
                return denied("the item belongs to another user".to_string());
            }
        }
        OpenMode::Managed { managed_user } => {
            if !is_manager(conn, &ctx.acting_as, managed_user)? {
                return denied(format!("no reporting relationship to {}", managed_user));
            }
            if row.destination != managed_user.fqn() {
                return denied(format!("the item is not on {}'s worklist", managed_user));
            }
        }
        OpenMode::Shared {
            original_user,
            managed_user,
        } => {
            if managed_user != &ctx.acting_as && !is_manager(conn, &ctx.acting_as, managed_user)? {
                return denied(format!("no reporting relationship to {}", managed_user));
            }
            if !is_delegated(conn, original_user, managed_user)? {
                return denied(format!(
                    "{} has not shared their worklist with {}",
                    original_user, managed_user
                ));
            }
            if row.destination != original_user.fqn() {
                return denied(format!("the item is not on {}'s worklist", original_user));
            }
        }
    }
    Ok(())
}

fn require_opened(row: &ItemRow) -> Result<()> {
    match row.status.as_str() {
        "opened" => Ok(()),
        "completed" => Err(Error::InvalidState(format!(
            "worklist item {} has already been completed",
            row.serial()
        ))),
        _ => Err(Error::InvalidState(format!(
            "worklist item {} must be opened first",
            row.serial()
        ))),
    }
}

/// Apply folio, priority and field edits to a process, validating field types.
fn apply_changes(conn: &Connection, process_id: i64, changes: &ProcessChanges) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let mut fields = load_fields(conn, process_id)?;
    fields.apply(&changes.data_fields)?;

    for (name, _) in changes.data_fields.iter() {
        let value = fields.get(name)?;
        conn.execute(
            "UPDATE process_fields SET value = ?1 WHERE process_id = ?2 AND name = ?3",
            params![field_to_sql(value), process_id, name],
        )?;
    }
    if let Some(folio) = &changes.folio {
        conn.execute(
            "UPDATE processes SET folio = ?1 WHERE id = ?2",
            params![folio, process_id],
        )?;
    }
    if let Some(priority) = changes.priority {
        conn.execute(
            "UPDATE processes SET priority = ?1 WHERE id = ?2",
            params![priority, process_id],
        )?;
    }
    Ok(())
}

/// Resolve a scope and make sure it names an existing process (and destination).
fn check_scope(conn: &Connection, scope: &Scope) -> Result<(i64, Option<i64>)> {
    let (process_id, destination_id) = scope.resolve();
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM processes WHERE id = ?1)",
        [process_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(Error::NotFound(format!(
            "Process instance not found: {}",
            process_id
        )));
    }
    if let Some(destination_id) = destination_id {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM items WHERE destination_id = ?1 AND process_id = ?2)",
            params![destination_id, process_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::NotFound(format!(
                "Activity destination {} not found in process instance {}",
                destination_id, process_id
            )));
        }
    }
    Ok((process_id, destination_id))
}

fn user_exists(conn: &Connection, user: &Identity) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE name = ?1)",
        [user.fqn()],
        |row| row.get(0),
    )?)
}

fn is_manager(conn: &Connection, manager: &Identity, subordinate: &Identity) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM reports WHERE manager = ?1 AND subordinate = ?2)",
        params![manager.fqn(), subordinate.fqn()],
        |row| row.get(0),
    )?)
}

fn is_delegated(conn: &Connection, original: &Identity, delegate: &Identity) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM delegations WHERE original_user = ?1 AND delegate = ?2)",
        params![original.fqn(), delegate.fqn()],
        |row| row.get(0),
    )?)
}

// === Criteria compilation ===

/// Compile filter clauses into one SQL predicate, pushing bound values.
///
/// Clauses fold left to right: `a AND b OR c` is `((a AND b) OR c)`.
fn compile_filters(
    criteria: &crate::models::criteria::WorklistCriteria,
    params: &mut Vec<Value>,
) -> Option<String> {
    let mut predicate: Option<String> = None;
    for clause in criteria.filters() {
        let column = column_expr(&clause.field, params);
        let op = match clause.compare {
            WcCompare::Equal => "=",
            WcCompare::NotEqual => "<>",
            WcCompare::Greater => ">",
            WcCompare::GreaterOrEqual => ">=",
            WcCompare::Less => "<",
            WcCompare::LessOrEqual => "<=",
            WcCompare::Like => "LIKE",
            WcCompare::NotLike => "NOT LIKE",
        };
        let value = match (&clause.value, clause.compare) {
            (CriteriaValue::String(s), WcCompare::Like | WcCompare::NotLike) => {
                Value::Text(like_pattern(s))
            }
            (value, _) => criteria_to_sql(value),
        };
        params.push(value);
        let expr = match clause.compare {
            WcCompare::Like | WcCompare::NotLike => {
                format!("{} {} ? ESCAPE '\\'", column, op)
            }
            _ => format!("{} {} ?", column, op),
        };

        predicate = Some(match (predicate, clause.connective) {
            (None, _) => expr,
            (Some(acc), Some(WcLogical::Or)) => format!("({} OR {})", acc, expr),
            (Some(acc), _) => format!("({} AND {})", acc, expr),
        });
    }
    predicate
}

/// Translate a `*` wildcard pattern to LIKE, escaping LIKE's own metacharacters.
fn like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => out.push('%'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn column_expr(field: &WcField, params: &mut Vec<Value>) -> String {
    match field {
        WcField::ProcessFolder => "p.folder".to_string(),
        WcField::ProcessName => "p.name".to_string(),
        WcField::ProcessFullName => "p.full_name".to_string(),
        WcField::ProcessFolio => "p.folio".to_string(),
        WcField::ProcessPriority => "p.priority".to_string(),
        WcField::ProcessStartDate => "p.start_date".to_string(),
        WcField::ProcessStatus => "p.status".to_string(),
        WcField::ActivityName => "i.activity_name".to_string(),
        WcField::ActivityStartDate => "i.start_date".to_string(),
        WcField::WorklistItemStatus => "i.status".to_string(),
        WcField::ProcessData(name) => {
            params.push(Value::Text(name.clone()));
            "(SELECT f.value FROM process_fields f WHERE f.process_id = p.id AND f.name = ?)"
                .to_string()
        }
    }
}

fn criteria_to_sql(value: &CriteriaValue) -> Value {
    match value {
        CriteriaValue::String(s) => Value::Text(s.clone()),
        CriteriaValue::Integer(i) => Value::Integer(*i),
        CriteriaValue::Date(d) => Value::Text(timestamp(d)),
    }
}

// === Value encoding ===

fn field_to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::String(s) | FieldValue::Xml(s) => Value::Text(s.clone()),
        FieldValue::Integer(i) => Value::Integer(*i),
        FieldValue::Date(d) => Value::Text(timestamp(d)),
    }
}

fn field_from_sql(name: &str, kind: &str, value: Value) -> Result<FieldValue> {
    let kind = FieldKind::parse(kind)
        .ok_or_else(|| Error::Other(format!("field {} has unknown kind {}", name, kind)))?;
    match (kind, value) {
        (FieldKind::String, Value::Text(s)) => Ok(FieldValue::String(s)),
        (FieldKind::Xml, Value::Text(s)) => Ok(FieldValue::Xml(s)),
        (FieldKind::Integer, Value::Integer(i)) => Ok(FieldValue::Integer(i)),
        (FieldKind::Date, Value::Text(s)) => Ok(FieldValue::Date(parse_timestamp(&s)?)),
        (kind, other) => Err(Error::Other(format!(
            "field {} of kind {} holds {:?}",
            name, kind, other
        ))),
    }
}

/// Fixed-width UTC timestamps so text order is time order.
fn timestamp(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp {}: {}", s, e)))
}

fn parse_item_status(s: &str) -> Result<ItemStatus> {
    ItemStatus::parse(s).ok_or_else(|| Error::Other(format!("invalid item status: {}", s)))
}

fn parse_process_status(s: &str) -> Result<ProcessStatus> {
    ProcessStatus::parse(s).ok_or_else(|| Error::Other(format!("invalid process status: {}", s)))
}

fn password_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::seed::{ActionDefinition, FieldDefinition};
    use crate::models::criteria::WorklistCriteria;
    use tempfile::TempDir;

    fn definition() -> ProcessDefinition {
        ProcessDefinition {
            full_name: "Finance\\Expense Claim".to_string(),
            starters: Vec::new(),
            fields: vec![FieldDefinition {
                name: "Amount".to_string(),
                kind: FieldKind::Integer,
            }],
            platform: "ASP".to_string(),
            activities: vec![
                ActivityDefinition {
                    name: "Approve".to_string(),
                    participants: vec!["bob".to_string(), "carol".to_string()],
                    actions: vec![
                        ActionDefinition {
                            name: "Approve".to_string(),
                            next: Some("Pay".to_string()),
                        },
                        ActionDefinition {
                            name: "Reject".to_string(),
                            next: None,
                        },
                    ],
                },
                ActivityDefinition {
                    name: "Pay".to_string(),
                    participants: vec!["bob".to_string()],
                    actions: vec![ActionDefinition {
                        name: "Paid".to_string(),
                        next: None,
                    }],
                },
            ],
        }
    }

    fn create_test_engine() -> SqliteEngine {
        let engine = SqliteEngine::in_memory().unwrap();
        engine.add_user("bob", "pw", false).unwrap();
        engine.add_user("carol", "pw", true).unwrap();
        engine.deploy(&definition()).unwrap();
        engine
    }

    fn connect(engine: &SqliteEngine, user: &str) -> (SqliteBackend, CallContext) {
        let mut backend = engine.connector();
        let config = ConnectionConfig::new("localhost").with_credentials(user, "pw");
        let grant = backend.connect(&config).unwrap();
        let ctx = CallContext {
            ticket: grant.ticket,
            principal: grant.principal.clone(),
            acting_as: grant.principal,
        };
        (backend, ctx)
    }

    fn start(backend: &mut SqliteBackend, ctx: &CallContext, folio: &str) -> ProcessRecord {
        let mut draft = backend.create_process(ctx, "Finance\\Expense Claim").unwrap();
        draft.folio = folio.to_string();
        backend.start_process(ctx, &draft, true).unwrap()
    }

    fn worklist(backend: &mut SqliteBackend, ctx: &CallContext) -> WorklistPage {
        let query = WorklistQuery {
            criteria: WorklistCriteria::default(),
            platform: "ASP".to_string(),
            managed_user: None,
        };
        backend.query_worklist(ctx, &query).unwrap()
    }

    #[test]
    fn test_connect_rejects_bad_password() {
        let engine = create_test_engine();
        let mut backend = engine.connector();
        let config = ConnectionConfig::new("localhost").with_credentials("bob", "wrong");
        assert!(matches!(
            backend.connect(&config),
            Err(Error::Authentication(_))
        ));
        assert_eq!(engine.open_connections().unwrap(), 0);
    }

    #[test]
    fn test_connect_skips_password_without_authenticate() {
        let engine = create_test_engine();
        let mut backend = engine.connector();
        let mut config = ConnectionConfig::new("localhost").with_credentials("bob", "wrong");
        config.authenticate = false;
        assert!(backend.connect(&config).is_ok());
    }

    #[test]
    fn test_connection_slots_are_limited() {
        let engine = create_test_engine();
        engine.set_max_connections(1).unwrap();
        let (_first, _) = connect(&engine, "bob");

        let mut second = engine.connector();
        let config = ConnectionConfig::new("localhost").with_credentials("bob", "pw");
        assert!(matches!(
            second.connect(&config),
            Err(Error::Connectivity(_))
        ));
    }

    #[test]
    fn test_dropping_backend_releases_slot() {
        let engine = create_test_engine();
        {
            let (_backend, _) = connect(&engine, "bob");
            assert_eq!(engine.open_connections().unwrap(), 1);
        }
        assert_eq!(engine.open_connections().unwrap(), 0);
    }

    #[test]
    fn test_offline_engine_is_unreachable() {
        let engine = create_test_engine();
        let (mut backend, ctx) = connect(&engine, "bob");
        engine.set_online(false).unwrap();
        assert!(matches!(
            backend.open_process(&ctx, 1),
            Err(Error::Connectivity(_))
        ));
        let mut other = engine.connector();
        let config = ConnectionConfig::new("localhost").with_credentials("bob", "pw");
        assert!(matches!(other.connect(&config), Err(Error::Connectivity(_))));
    }

    #[test]
    fn test_start_routes_to_every_participant() {
        let engine = create_test_engine();
        let (mut bob, bob_ctx) = connect(&engine, "bob");
        let (mut carol, carol_ctx) = connect(&engine, "carol");

        let process = start(&mut bob, &bob_ctx, "Claim 1");
        assert_eq!(process.status, ProcessStatus::Active);
        assert_eq!(process.data_fields.get_integer("Amount").unwrap(), 0);

        assert_eq!(worklist(&mut bob, &bob_ctx).total_count, 1);
        assert_eq!(worklist(&mut carol, &carol_ctx).total_count, 1);
    }

    #[test]
    fn test_first_completion_closes_siblings_and_routes() {
        let engine = create_test_engine();
        let (mut bob, bob_ctx) = connect(&engine, "bob");
        let (mut carol, carol_ctx) = connect(&engine, "carol");
        let process = start(&mut bob, &bob_ctx, "Claim 1");

        let carol_item = worklist(&mut carol, &carol_ctx).items.remove(0);
        let serial = carol_item.serial_number.clone();
        let opened = carol
            .open_item(&carol_ctx, &serial, &OpenMode::Own, true)
            .unwrap();
        assert_eq!(opened.actions, vec!["Approve".to_string(), "Reject".to_string()]);

        carol
            .execute_action(
                &carol_ctx,
                &serial,
                &OpenMode::Own,
                "Approve",
                &ProcessChanges::default(),
            )
            .unwrap();

        // Bob's Approve item is gone, his Pay item arrived
        let bob_page = worklist(&mut bob, &bob_ctx);
        assert_eq!(bob_page.total_count, 1);
        assert_eq!(bob_page.items[0].activity_name, "Pay");
        assert_eq!(bob_page.items[0].process.id, process.id);
        assert_eq!(worklist(&mut carol, &carol_ctx).total_count, 0);
    }

    #[test]
    fn test_failed_action_rolls_back_field_changes() {
        let engine = create_test_engine();
        let (mut bob, ctx) = connect(&engine, "bob");
        let process = start(&mut bob, &ctx, "Claim 1");
        let serial = worklist(&mut bob, &ctx).items[0].serial_number.clone();
        bob.open_item(&ctx, &serial, &OpenMode::Own, true).unwrap();

        let mut changes = ProcessChanges::default();
        changes.data_fields.declare("Amount", 500);
        let err = bob
            .execute_action(&ctx, &serial, &OpenMode::Own, "Escalate", &changes)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAction(_)));

        let reloaded = bob.open_process(&ctx, process.id).unwrap();
        assert_eq!(reloaded.data_fields.get_integer("Amount").unwrap(), 0);
    }

    #[test]
    fn test_upload_only_once() {
        let engine = create_test_engine();
        let (mut bob, ctx) = connect(&engine, "bob");
        let process = start(&mut bob, &ctx, "Claim 1");

        let pending = bob
            .add_attachment(&ctx, &Scope::Process(process.id), "Report1.pdf", None)
            .unwrap();
        assert_eq!(pending.content, AttachmentContent::Pending);
        assert!(matches!(
            bob.attachment_content(&ctx, pending.id),
            Err(Error::InvalidState(_))
        ));

        let uploaded = bob
            .upload_attachment_content(&ctx, pending.id, b"first")
            .unwrap();
        assert_eq!(
            uploaded.content,
            AttachmentContent::Uploaded {
                size: 5,
                bytes: None
            }
        );
        assert!(matches!(
            bob.upload_attachment_content(&ctx, pending.id, b"second"),
            Err(Error::AlreadyUploaded(_))
        ));
        assert_eq!(bob.attachment_content(&ctx, pending.id).unwrap(), b"first");
        assert!(matches!(
            bob.upload_attachment_content(&ctx, 999, b"x"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_filters_fold_left_to_right() {
        let mut criteria = WorklistCriteria::builder();
        criteria
            .add_filter(None, WcField::ProcessFolder, WcCompare::Equal, "Finance")
            .unwrap()
            .add_filter(
                Some(WcLogical::And),
                WcField::ProcessPriority,
                WcCompare::Equal,
                1,
            )
            .unwrap()
            .add_filter(
                Some(WcLogical::Or),
                WcField::ProcessFolio,
                WcCompare::Like,
                "Urgent*",
            )
            .unwrap();
        let mut params = Vec::new();
        let sql = compile_filters(&criteria.build(), &mut params).unwrap();
        assert_eq!(
            sql,
            "((p.folder = ? AND p.priority = ?) OR p.folio LIKE ? ESCAPE '\\')"
        );
        assert_eq!(
            params,
            vec![
                Value::Text("Finance".to_string()),
                Value::Integer(1),
                Value::Text("Urgent%".to_string()),
            ]
        );
    }

    #[test]
    fn test_like_pattern_escapes_literals() {
        assert_eq!(like_pattern("Urgent*"), "Urgent%");
        assert_eq!(like_pattern("50%_off*"), "50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_like_filter_treats_underscore_literally() {
        let engine = create_test_engine();
        let (mut backend, ctx) = connect(&engine, "bob");
        start(&mut backend, &ctx, "Q1_2024");
        start(&mut backend, &ctx, "Q1x2024");
        start(&mut backend, &ctx, "50%_off");
        start(&mut backend, &ctx, "50 pct off");

        let query = |pattern: &str| {
            let mut criteria = WorklistCriteria::builder();
            criteria
                .filter(WcField::ProcessFolio, WcCompare::Like, pattern)
                .unwrap();
            WorklistQuery {
                criteria: criteria.build(),
                platform: "ASP".to_string(),
                managed_user: None,
            }
        };
        let folios = |page: WorklistPage| -> Vec<String> {
            page.items.into_iter().map(|item| item.process.folio).collect()
        };

        let page = backend.query_worklist(&ctx, &query("Q1_*")).unwrap();
        assert_eq!(folios(page), vec!["Q1_2024"]);
        let page = backend.query_worklist(&ctx, &query("50%_*")).unwrap();
        assert_eq!(folios(page), vec!["50%_off"]);
    }

    #[test]
    fn test_data_field_filter_binds_name_before_value() {
        let mut criteria = WorklistCriteria::builder();
        criteria
            .filter(
                WcField::ProcessData("Amount".to_string()),
                WcCompare::Greater,
                100,
            )
            .unwrap();
        let mut params = Vec::new();
        compile_filters(&criteria.build(), &mut params).unwrap();
        assert_eq!(
            params,
            vec![Value::Text("Amount".to_string()), Value::Integer(100)]
        );
    }

    #[test]
    fn test_engine_persists_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.db");
        {
            let engine = SqliteEngine::open(&path).unwrap();
            engine.add_user("bob", "pw", false).unwrap();
            engine.deploy(&definition()).unwrap();
        }
        let engine = SqliteEngine::open(&path).unwrap();
        let (mut bob, ctx) = connect(&engine, "bob");
        let process = start(&mut bob, &ctx, "Persisted");
        assert_eq!(process.folio, "Persisted");
    }

    #[test]
    fn test_password_digest_is_salted() {
        assert_ne!(password_digest("a", "pw"), password_digest("b", "pw"));
        assert_eq!(password_digest("a", "pw"), password_digest("a", "pw"));
    }
}
