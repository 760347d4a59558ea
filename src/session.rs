//! Authenticated connection to a workflow backend.
//!
//! A [`Session`] owns one backend connection. Every handle it hands out
//! ([`ProcessInstance`], [`WorklistItem`], [`Attachment`]) keeps only a weak
//! [`SessionRef`] back to it, so closing or dropping the session invalidates
//! them all: later operations through a handle fail with
//! [`Error::StaleReference`].
//!
//! The connection is released when the session is closed or dropped,
//! whichever comes first.

use crate::attachments::Attachment;
use crate::backend::{Backend, CallContext, HttpBackend, OpenMode, WorklistQuery};
use crate::config::ConnectionConfig;
use crate::config::seed::DEFAULT_PLATFORM;
use crate::item::WorklistItem;
use crate::models::criteria::WorklistCriteria;
use crate::models::{Comment, Identity, Scope, SerialNumber};
use crate::process::ProcessInstance;
use crate::worklist::Worklist;
use crate::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Connected and acting as another user
    Impersonating,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Impersonating => "impersonating",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct SessionState {
    /// `None` once the session is closed
    backend: Option<Box<dyn Backend>>,
    ticket: Option<String>,
    principal: Identity,
    impersonating: Option<Identity>,
}

impl SessionState {
    fn context(&self) -> Option<CallContext> {
        let ticket = self.ticket.clone()?;
        Some(CallContext {
            ticket,
            principal: self.principal.clone(),
            acting_as: self
                .impersonating
                .clone()
                .unwrap_or_else(|| self.principal.clone()),
        })
    }
}

pub(crate) struct SessionShared {
    id: Uuid,
    endpoint: String,
    security_label: String,
    state: Mutex<SessionState>,
}

impl SessionShared {
    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("session lock poisoned".to_string()))
    }

    /// Run `f` against the live backend, or fail with `closed()`.
    fn call<T>(
        &self,
        closed: impl Fn() -> Error,
        f: impl FnOnce(&mut dyn Backend, &CallContext) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock()?;
        let ctx = state.context().ok_or_else(&closed)?;
        let backend = state.backend.as_deref_mut().ok_or_else(&closed)?;
        f(backend, &ctx)
    }
}

/// Weak link from a handle back to the session that produced it.
#[derive(Clone)]
pub(crate) struct SessionRef {
    id: Uuid,
    shared: Weak<SessionShared>,
}

impl SessionRef {
    fn stale(&self) -> Error {
        Error::StaleReference(format!("session {} has been closed", self.id))
    }

    /// Run `f` against the owning session's backend.
    pub(crate) fn call<T>(
        &self,
        f: impl FnOnce(&mut dyn Backend, &CallContext) -> Result<T>,
    ) -> Result<T> {
        let shared = self.shared.upgrade().ok_or_else(|| self.stale())?;
        shared.call(|| self.stale(), f)
    }

    /// Fail with `StaleReference` unless the owning session is still open.
    pub(crate) fn ensure_live(&self) -> Result<()> {
        self.call(|_, _| Ok(()))
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionRef").field(&self.id).finish()
    }
}

/// An authenticated connection to a workflow backend.
///
/// ```
/// use worklist::backend::SqliteEngine;
/// use worklist::{ConnectionConfig, Session, WorklistCriteria};
///
/// let engine = SqliteEngine::in_memory()?;
/// engine.add_user("bob", "pw", false)?;
///
/// let config = ConnectionConfig::new("localhost").with_credentials("bob", "pw");
/// let session = Session::open(&config, engine.connector())?;
/// let worklist = session.open_worklist(&WorklistCriteria::default())?;
/// assert_eq!(worklist.total_count(), 0);
/// session.close()?;
/// # Ok::<(), worklist::Error>(())
/// ```
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Authenticate against `backend` and claim a connection slot.
    pub fn open(config: &ConnectionConfig, backend: impl Backend + 'static) -> Result<Self> {
        config.validate()?;
        let mut backend: Box<dyn Backend> = Box::new(backend);
        let grant = backend.connect(config)?;

        let id = Uuid::new_v4();
        info!(
            session = %id,
            user = %grant.principal,
            endpoint = %config.endpoint(),
            backend = backend.backend_type(),
            "Session opened"
        );
        Ok(Self {
            shared: Arc::new(SessionShared {
                id,
                endpoint: config.endpoint(),
                security_label: config.security_label.clone(),
                state: Mutex::new(SessionState {
                    backend: Some(backend),
                    ticket: Some(grant.ticket),
                    principal: grant.principal,
                    impersonating: None,
                }),
            }),
        })
    }

    /// Open a session over HTTP to `config.host`.
    pub fn open_remote(config: &ConnectionConfig) -> Result<Self> {
        Self::open(config, HttpBackend::new())
    }

    /// Release the connection and invalidate every handle from this session.
    ///
    /// The session is closed even when the backend reports an error while
    /// disconnecting; that error is returned. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        let Some(mut backend) = state.backend.take() else {
            return Ok(());
        };
        let ctx = state.context();
        state.ticket = None;
        state.impersonating = None;
        drop(state);

        let result = match ctx {
            Some(ctx) => backend.disconnect(&ctx),
            None => Ok(()),
        };
        info!(session = %self.shared.id, endpoint = %self.shared.endpoint, "Session closed");
        result
    }

    pub fn state(&self) -> ConnectionState {
        match self.shared.lock() {
            Ok(state) if state.backend.is_none() => ConnectionState::Disconnected,
            Ok(state) if state.impersonating.is_some() => ConnectionState::Impersonating,
            Ok(_) => ConnectionState::Connected,
            Err(_) => ConnectionState::Disconnected,
        }
    }

    /// `host:port` this session is connected to.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// The authenticated account.
    pub fn principal(&self) -> Result<Identity> {
        Ok(self.shared.lock()?.principal.clone())
    }

    /// The identity calls currently act as.
    pub fn acting_as(&self) -> Result<Identity> {
        let state = self.shared.lock()?;
        Ok(state
            .impersonating
            .clone()
            .unwrap_or_else(|| state.principal.clone()))
    }

    /// Act as `user` until [`revert`](Self::revert).
    ///
    /// `user` is `label:name` or a bare name in this session's security label.
    pub fn impersonate(&self, user: &str) -> Result<()> {
        let target = self.identity(user)?;
        let mut state = self.shared.lock()?;
        let ctx = state.context().ok_or_else(closed)?;
        let backend = state.backend.as_deref_mut().ok_or_else(closed)?;
        backend.impersonate(&ctx, &target)?;

        info!(session = %self.shared.id, principal = %ctx.principal, user = %target, "Impersonating user");
        state.impersonating = Some(target);
        Ok(())
    }

    /// Stop impersonating and act as the principal again.
    pub fn revert(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        if state.backend.is_none() {
            return Err(closed());
        }
        let Some(previous) = state.impersonating.take() else {
            return Err(Error::InvalidState(
                "session is not impersonating anyone".to_string(),
            ));
        };
        info!(session = %self.shared.id, user = %previous, "Reverted impersonation");
        Ok(())
    }

    // === Process instances ===

    /// Load an unstarted instance of `full_name` (`Folder\Name`).
    ///
    /// Set its folio, priority and fields, then call
    /// [`ProcessInstance::start`].
    pub fn create_process_instance(&self, full_name: &str) -> Result<ProcessInstance> {
        let record = self.call(|backend, ctx| backend.create_process(ctx, full_name))?;
        Ok(ProcessInstance::new(self.handle(), record))
    }

    pub fn open_process_instance(&self, id: i64) -> Result<ProcessInstance> {
        let record = self.call(|backend, ctx| backend.open_process(ctx, id))?;
        Ok(ProcessInstance::new(self.handle(), record))
    }

    // === Worklists ===

    /// Query the acting user's worklist on the default platform.
    pub fn open_worklist(&self, criteria: &WorklistCriteria) -> Result<Worklist> {
        self.query_worklist(criteria, None, DEFAULT_PLATFORM)
    }

    /// Query the worklist of a user reporting to the acting user.
    pub fn open_managed_worklist(
        &self,
        criteria: &WorklistCriteria,
        managed_user: &str,
    ) -> Result<Worklist> {
        self.query_worklist(criteria, Some(managed_user), DEFAULT_PLATFORM)
    }

    /// Query a worklist.
    ///
    /// An empty `criteria` returns the whole worklist, which is slow for
    /// large worklists.
    pub fn query_worklist(
        &self,
        criteria: &WorklistCriteria,
        managed_user: Option<&str>,
        platform: &str,
    ) -> Result<Worklist> {
        let query = WorklistQuery {
            criteria: criteria.clone(),
            platform: platform.to_string(),
            managed_user: managed_user.map(|u| self.identity(u)).transpose()?,
        };
        if criteria.is_empty() {
            debug!(session = %self.shared.id, "Querying worklist without criteria");
        }
        let page = self.call(|backend, ctx| backend.query_worklist(ctx, &query))?;

        let mode = match query.managed_user {
            Some(managed_user) => OpenMode::Managed { managed_user },
            None => OpenMode::Own,
        };
        Ok(Worklist::new(self.handle(), mode, page))
    }

    /// Open and allocate an item from the acting user's worklist.
    pub fn open_worklist_item(&self, serial: &SerialNumber) -> Result<WorklistItem> {
        self.open_item(serial, OpenMode::Own)
    }

    /// Open an item from the worklist of a user reporting to the acting user.
    pub fn open_managed_worklist_item(
        &self,
        serial: &SerialNumber,
        managed_user: &str,
    ) -> Result<WorklistItem> {
        let mode = OpenMode::Managed {
            managed_user: self.identity(managed_user)?,
        };
        self.open_item(serial, mode)
    }

    /// Open an item of `original_user` that was shared with `managed_user`.
    pub fn open_shared_worklist_item(
        &self,
        serial: &SerialNumber,
        original_user: &str,
        managed_user: &str,
    ) -> Result<WorklistItem> {
        let mode = OpenMode::Shared {
            original_user: self.identity(original_user)?,
            managed_user: self.identity(managed_user)?,
        };
        self.open_item(serial, mode)
    }

    fn open_item(&self, serial: &SerialNumber, mode: OpenMode) -> Result<WorklistItem> {
        let record = self.call(|backend, ctx| backend.open_item(ctx, serial, &mode, true))?;
        debug!(session = %self.shared.id, serial = %serial, "Opened worklist item");
        Ok(WorklistItem::new(self.handle(), mode, record))
    }

    // === Comments and attachments ===

    pub fn add_comment(&self, scope: impl Into<Scope>, message: &str) -> Result<Comment> {
        let scope = scope.into();
        self.call(|backend, ctx| backend.add_comment(ctx, &scope, message))
    }

    pub fn comments(&self, scope: impl Into<Scope>) -> Result<Vec<Comment>> {
        let scope = scope.into();
        self.call(|backend, ctx| backend.comments(ctx, &scope))
    }

    /// Add an attachment. With no `content` the attachment is metadata-only
    /// until [`upload_attachment_content`](Self::upload_attachment_content).
    pub fn add_attachment(
        &self,
        scope: impl Into<Scope>,
        file_name: &str,
        content: Option<&[u8]>,
    ) -> Result<Attachment> {
        let scope = scope.into();
        let record =
            self.call(|backend, ctx| backend.add_attachment(ctx, &scope, file_name, content))?;
        Ok(Attachment::new(self.handle(), record))
    }

    /// Upload the content of a metadata-only attachment. Allowed once.
    pub fn upload_attachment_content(&self, id: i64, content: &[u8]) -> Result<Attachment> {
        let record =
            self.call(|backend, ctx| backend.upload_attachment_content(ctx, id, content))?;
        Ok(Attachment::new(self.handle(), record))
    }

    /// List attachments; `include_file` also fetches their content.
    pub fn attachments(&self, scope: impl Into<Scope>, include_file: bool) -> Result<Vec<Attachment>> {
        let scope = scope.into();
        let records = self.call(|backend, ctx| backend.attachments(ctx, &scope, include_file))?;
        Ok(records
            .into_iter()
            .map(|record| Attachment::new(self.handle(), record))
            .collect())
    }

    /// List the attachments in `scope` added by `owner`.
    pub fn attachments_owned_by(
        &self,
        scope: impl Into<Scope>,
        owner: &str,
        include_file: bool,
    ) -> Result<Vec<Attachment>> {
        let owner = self.identity(owner)?;
        Ok(self
            .attachments(scope, include_file)?
            .into_iter()
            .filter(|a| a.owner() == &owner)
            .collect())
    }

    pub fn attachment(&self, id: i64, include_file: bool) -> Result<Attachment> {
        let record = self.call(|backend, ctx| backend.attachment(ctx, id, include_file))?;
        Ok(Attachment::new(self.handle(), record))
    }

    // === Internals ===

    fn call<T>(&self, f: impl FnOnce(&mut dyn Backend, &CallContext) -> Result<T>) -> Result<T> {
        self.shared.call(closed, f)
    }

    fn handle(&self) -> SessionRef {
        SessionRef {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn identity(&self, user: &str) -> Result<Identity> {
        Identity::parse(user, &self.shared.security_label)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(session = %self.shared.id, error = %e, "Failed to close session cleanly");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

fn closed() -> Error {
    Error::InvalidState("session is closed".to_string())
}
