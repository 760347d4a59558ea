//! Backend trait and implementations.
//!
//! This module provides the boundary to the workflow engine:
//! - `SqliteEngine` / `SqliteBackend` - Local reference engine on SQLite
//! - `HttpBackend` - JSON-over-HTTP transport to a remote engine

pub mod http;
pub mod sqlite;

pub use http::HttpBackend;
pub use sqlite::{SqliteBackend, SqliteEngine};

use crate::Result;
use crate::config::ConnectionConfig;
use crate::models::criteria::WorklistCriteria;
use crate::models::fields::DataFields;
use crate::models::{
    AttachmentRecord, Comment, Identity, ItemRecord, ProcessRecord, Scope, SerialNumber,
};
use serde::{Deserialize, Serialize};

/// What a successful connect hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectGrant {
    /// Opaque token identifying the connection in later calls
    pub ticket: String,
    /// The authenticated account
    pub principal: Identity,
}

/// Per-call context: which connection, and who the call acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub ticket: String,
    pub principal: Identity,
    /// The principal, or the user it impersonates
    pub acting_as: Identity,
}

/// Whose worklist an item is opened from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OpenMode {
    /// The acting user's own worklist
    #[default]
    Own,
    /// The worklist of a user reporting to the acting user
    Managed { managed_user: Identity },
    /// An item of `original_user` delegated to `managed_user` while out of office
    Shared {
        original_user: Identity,
        managed_user: Identity,
    },
}

/// A worklist query as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorklistQuery {
    #[serde(default)]
    pub criteria: WorklistCriteria,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_user: Option<Identity>,
}

/// One page of worklist items plus the count of all matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorklistPage {
    pub items: Vec<ItemRecord>,
    pub total_count: u64,
}

/// Edits to a process instance made through an opened worklist item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Only the fields that changed
    #[serde(default)]
    pub data_fields: DataFields,
}

impl ProcessChanges {
    pub fn is_empty(&self) -> bool {
        self.folio.is_none() && self.priority.is_none() && self.data_fields.is_empty()
    }
}

/// Trait for backends that carry out the remote procedures of a session.
///
/// Every call is synchronous and all-or-nothing: on error the backend state
/// is as it was before the call. Calls other than `connect` carry the
/// [`CallContext`] of the session making them.
pub trait Backend: Send {
    /// Authenticate and claim a connection slot.
    fn connect(&mut self, config: &ConnectionConfig) -> Result<ConnectGrant>;

    /// Release the connection slot.
    fn disconnect(&mut self, ctx: &CallContext) -> Result<()>;

    /// Check that the principal may act as `target`.
    fn impersonate(&mut self, ctx: &CallContext, target: &Identity) -> Result<()>;

    /// Load an unstarted process instance of the named definition.
    fn create_process(&mut self, ctx: &CallContext, full_name: &str) -> Result<ProcessRecord>;

    /// Start a process created by `create_process`.
    ///
    /// With `sync` the call returns only after the instance reached its first
    /// wait state.
    fn start_process(
        &mut self,
        ctx: &CallContext,
        draft: &ProcessRecord,
        sync: bool,
    ) -> Result<ProcessRecord>;

    fn open_process(&mut self, ctx: &CallContext, id: i64) -> Result<ProcessRecord>;

    fn query_worklist(&mut self, ctx: &CallContext, query: &WorklistQuery) -> Result<WorklistPage>;

    /// Open an item, allocating it to the acting user when `allocate` is set.
    fn open_item(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        allocate: bool,
    ) -> Result<ItemRecord>;

    /// Persist edits without completing the item.
    fn update_item(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        changes: &ProcessChanges,
    ) -> Result<ItemRecord>;

    /// Apply `changes`, complete the item with `action` and route the process.
    fn execute_action(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        action: &str,
        changes: &ProcessChanges,
    ) -> Result<()>;

    fn add_comment(&mut self, ctx: &CallContext, scope: &Scope, message: &str) -> Result<Comment>;

    fn comments(&mut self, ctx: &CallContext, scope: &Scope) -> Result<Vec<Comment>>;

    /// Add an attachment; `None` content creates a metadata-only attachment.
    fn add_attachment(
        &mut self,
        ctx: &CallContext,
        scope: &Scope,
        file_name: &str,
        content: Option<&[u8]>,
    ) -> Result<AttachmentRecord>;

    /// Fill a metadata-only attachment. Fails if content is already present.
    fn upload_attachment_content(
        &mut self,
        ctx: &CallContext,
        id: i64,
        content: &[u8],
    ) -> Result<AttachmentRecord>;

    fn attachments(
        &mut self,
        ctx: &CallContext,
        scope: &Scope,
        include_file: bool,
    ) -> Result<Vec<AttachmentRecord>>;

    fn attachment(&mut self, ctx: &CallContext, id: i64, include_file: bool)
    -> Result<AttachmentRecord>;

    fn attachment_content(&mut self, ctx: &CallContext, id: i64) -> Result<Vec<u8>>;

    /// Get the backend type name.
    fn backend_type(&self) -> &'static str;
}
