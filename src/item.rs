//! Worklist item handles.
//!
//! An item moves `Unopened -> Opened -> Completed`. Process data fields can
//! only be read and edited while the item is open; edits stay local until
//! [`WorklistItem::update`] or [`WorklistItem::execute_action`] sends them.

use crate::attachments::Attachment;
use crate::backend::{OpenMode, ProcessChanges};
use crate::models::fields::{DataFields, FieldValue};
use crate::models::{Comment, Identity, ItemRecord, ItemStatus, Scope, SerialNumber};
use crate::session::SessionRef;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// A named transition available on an opened item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Action {
    name: String,
    serial_number: SerialNumber,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The item this action belongs to.
    pub fn serial_number(&self) -> &SerialNumber {
        &self.serial_number
    }

    /// Execute this action on `item`, which must be the item it came from.
    pub fn execute(&self, item: &mut WorklistItem) -> Result<()> {
        if item.serial_number() != &self.serial_number {
            return Err(Error::InvalidInput(format!(
                "action {} belongs to item {}, not {}",
                self.name,
                self.serial_number,
                item.serial_number()
            )));
        }
        item.execute_action(&self.name)
    }
}

/// Handle to one unit of work on a worklist.
#[derive(Debug, Clone)]
pub struct WorklistItem {
    session: SessionRef,
    mode: OpenMode,
    record: ItemRecord,
    /// Edits not yet sent to the backend
    pending: ProcessChanges,
}

impl WorklistItem {
    pub(crate) fn new(session: SessionRef, mode: OpenMode, record: ItemRecord) -> Self {
        Self {
            session,
            mode,
            record,
            pending: ProcessChanges::default(),
        }
    }

    pub fn serial_number(&self) -> &SerialNumber {
        &self.record.serial_number
    }

    pub fn status(&self) -> ItemStatus {
        self.record.status
    }

    pub fn activity_name(&self) -> &str {
        &self.record.activity_name
    }

    pub fn activity_start_date(&self) -> DateTime<Utc> {
        self.record.activity_start_date
    }

    /// The user the item was routed to.
    pub fn destination(&self) -> &Identity {
        &self.record.destination
    }

    pub fn platform(&self) -> &str {
        &self.record.platform
    }

    pub fn process_instance_id(&self) -> i64 {
        self.record.process.id
    }

    pub fn process_full_name(&self) -> &str {
        &self.record.process.full_name
    }

    pub fn process_folder(&self) -> &str {
        self.record.process.folder()
    }

    pub fn process_name(&self) -> &str {
        self.record.process.name()
    }

    pub fn folio(&self) -> &str {
        &self.record.process.folio
    }

    pub fn priority(&self) -> i32 {
        self.record.process.priority
    }

    pub fn process_start_date(&self) -> Option<DateTime<Utc>> {
        self.record.process.start_date
    }

    pub fn originator(&self) -> Option<&Identity> {
        self.record.process.originator.as_ref()
    }

    /// True when local edits have not been sent yet.
    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Open the item, allocating it to the acting user.
    ///
    /// Opening an item that is already open does nothing.
    pub fn open(&mut self) -> Result<()> {
        self.session.ensure_live()?;
        match self.record.status {
            ItemStatus::Opened => return Ok(()),
            ItemStatus::Completed => {
                return Err(Error::InvalidState(format!(
                    "worklist item {} is completed",
                    self.record.serial_number
                )));
            }
            ItemStatus::Unopened => {}
        }

        let serial = self.record.serial_number.clone();
        let mode = self.mode.clone();
        let record = self
            .session
            .call(|backend, ctx| backend.open_item(ctx, &serial, &mode, true))?;
        debug!(session = %self.session.id(), serial = %serial, "Opened worklist item");
        self.record = record;
        Ok(())
    }

    /// Actions available on the item. Empty unless the item is open.
    pub fn actions(&self) -> Result<Vec<Action>> {
        self.session.ensure_live()?;
        if self.record.status != ItemStatus::Opened {
            return Ok(Vec::new());
        }
        Ok(self
            .record
            .actions
            .iter()
            .map(|name| Action {
                name: name.clone(),
                serial_number: self.record.serial_number.clone(),
            })
            .collect())
    }

    // === Process data ===

    /// The process data fields, including local edits.
    pub fn data_fields(&self) -> Result<&DataFields> {
        self.require_open()?;
        Ok(&self.record.process.data_fields)
    }

    pub fn field(&self, name: &str) -> Result<&FieldValue> {
        self.data_fields()?.get(name)
    }

    /// Set a data field locally. The value's type must match the field's.
    pub fn set_field(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        self.require_open()?;
        self.record.process.data_fields.set(name, value)?;
        let stored = self.record.process.data_fields.get(name)?.clone();
        self.pending.data_fields.declare(name, stored);
        Ok(())
    }

    /// Set an XML field locally.
    pub fn set_xml_field(&mut self, name: &str, xml: impl Into<String>) -> Result<()> {
        self.set_field(name, FieldValue::Xml(xml.into()))
    }

    pub fn set_folio(&mut self, folio: impl Into<String>) -> Result<()> {
        self.require_open()?;
        let folio = folio.into();
        self.record.process.folio = folio.clone();
        self.pending.folio = Some(folio);
        Ok(())
    }

    pub fn set_priority(&mut self, priority: i32) -> Result<()> {
        self.require_open()?;
        self.record.process.priority = priority;
        self.pending.priority = Some(priority);
        Ok(())
    }

    /// Persist local edits without completing the item.
    pub fn update(&mut self) -> Result<()> {
        self.require_open()?;
        let serial = self.record.serial_number.clone();
        let mode = self.mode.clone();
        let pending = &self.pending;
        let record = self
            .session
            .call(|backend, ctx| backend.update_item(ctx, &serial, &mode, pending))?;
        self.record = record;
        self.pending = ProcessChanges::default();
        Ok(())
    }

    /// Complete the item with the named action, sending local edits with it.
    ///
    /// On failure nothing changes, locally or on the backend.
    pub fn execute_action(&mut self, name: &str) -> Result<()> {
        self.require_open()?;
        if !self.record.actions.iter().any(|a| a == name) {
            return Err(Error::UnknownAction(format!(
                "{} is not available on item {} (available: {})",
                name,
                self.record.serial_number,
                self.record.actions.join(", ")
            )));
        }

        let serial = self.record.serial_number.clone();
        let mode = self.mode.clone();
        let pending = &self.pending;
        self.session
            .call(|backend, ctx| backend.execute_action(ctx, &serial, &mode, name, pending))?;

        info!(session = %self.session.id(), serial = %serial, action = name, "Completed worklist item");
        self.record.status = ItemStatus::Completed;
        self.record.actions.clear();
        self.pending = ProcessChanges::default();
        Ok(())
    }

    // === Comments and attachments ===

    fn scope(&self) -> Scope {
        Scope::destination(self.record.process.id, self.record.serial_number.destination_id())
    }

    /// Comment on this item's activity destination.
    pub fn add_comment(&self, message: &str) -> Result<Comment> {
        let scope = self.scope();
        self.session
            .call(|backend, ctx| backend.add_comment(ctx, &scope, message))
    }

    pub fn comments(&self) -> Result<Vec<Comment>> {
        let scope = self.scope();
        self.session.call(|backend, ctx| backend.comments(ctx, &scope))
    }

    pub fn add_attachment(&self, file_name: &str, content: Option<&[u8]>) -> Result<Attachment> {
        let scope = self.scope();
        let record = self
            .session
            .call(|backend, ctx| backend.add_attachment(ctx, &scope, file_name, content))?;
        Ok(Attachment::new(self.session.clone(), record))
    }

    pub fn attachments(&self, include_file: bool) -> Result<Vec<Attachment>> {
        let scope = self.scope();
        let records = self
            .session
            .call(|backend, ctx| backend.attachments(ctx, &scope, include_file))?;
        Ok(records
            .into_iter()
            .map(|record| Attachment::new(self.session.clone(), record))
            .collect())
    }

    fn require_open(&self) -> Result<()> {
        self.session.ensure_live()?;
        match self.record.status {
            ItemStatus::Opened => Ok(()),
            ItemStatus::Unopened => Err(Error::InvalidState(format!(
                "worklist item {} must be opened first",
                self.record.serial_number
            ))),
            ItemStatus::Completed => Err(Error::InvalidState(format!(
                "worklist item {} is completed",
                self.record.serial_number
            ))),
        }
    }
}
