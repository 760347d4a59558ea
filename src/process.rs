//! Process instance handles.

use crate::attachments::Attachment;
use crate::models::fields::{DataFields, FieldValue};
use crate::models::{Comment, Identity, ProcessRecord, ProcessStatus, Scope};
use crate::session::SessionRef;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::info;

/// Handle to a process instance.
///
/// Instances from [`Session::create_process_instance`](crate::Session::create_process_instance)
/// start out `New`: folio, priority and data fields can be set until
/// [`start`](Self::start). Started instances are read-only here; they change
/// through their worklist items.
#[derive(Debug, Clone)]
pub struct ProcessInstance {
    session: SessionRef,
    record: ProcessRecord,
}

impl ProcessInstance {
    pub(crate) fn new(session: SessionRef, record: ProcessRecord) -> Self {
        Self { session, record }
    }

    /// Backend id; 0 until started.
    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn full_name(&self) -> &str {
        &self.record.full_name
    }

    pub fn folder(&self) -> &str {
        self.record.folder()
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn folio(&self) -> &str {
        &self.record.folio
    }

    pub fn priority(&self) -> i32 {
        self.record.priority
    }

    pub fn status(&self) -> ProcessStatus {
        self.record.status
    }

    pub fn originator(&self) -> Option<&Identity> {
        self.record.originator.as_ref()
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.record.start_date
    }

    pub fn data_fields(&self) -> Result<&DataFields> {
        self.session.ensure_live()?;
        Ok(&self.record.data_fields)
    }

    pub fn field(&self, name: &str) -> Result<&FieldValue> {
        self.data_fields()?.get(name)
    }

    pub fn set_folio(&mut self, folio: impl Into<String>) -> Result<()> {
        self.require_new()?;
        self.record.folio = folio.into();
        Ok(())
    }

    pub fn set_priority(&mut self, priority: i32) -> Result<()> {
        self.require_new()?;
        self.record.priority = priority;
        Ok(())
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        self.require_new()?;
        self.record.data_fields.set(name, value)
    }

    pub fn set_xml_field(&mut self, name: &str, xml: impl Into<String>) -> Result<()> {
        self.require_new()?;
        self.record.data_fields.set_xml(name, xml)
    }

    /// Start the instance.
    ///
    /// With `sync` the call waits until the instance reaches its first wait
    /// state. Either way the handle reflects the started instance afterwards.
    pub fn start(&mut self, sync: bool) -> Result<()> {
        self.require_new()?;
        let draft = &self.record;
        let started = self
            .session
            .call(|backend, ctx| backend.start_process(ctx, draft, sync))?;
        info!(
            session = %self.session.id(),
            id = started.id,
            process = %started.full_name,
            folio = %started.folio,
            "Started process instance"
        );
        self.record = started;
        Ok(())
    }

    /// Reload the instance from the backend.
    pub fn refresh(&mut self) -> Result<()> {
        let id = self.require_started()?;
        self.record = self.session.call(|backend, ctx| backend.open_process(ctx, id))?;
        Ok(())
    }

    pub fn add_comment(&self, message: &str) -> Result<Comment> {
        let scope = Scope::Process(self.require_started()?);
        self.session
            .call(|backend, ctx| backend.add_comment(ctx, &scope, message))
    }

    pub fn comments(&self) -> Result<Vec<Comment>> {
        let scope = Scope::Process(self.require_started()?);
        self.session.call(|backend, ctx| backend.comments(ctx, &scope))
    }

    pub fn add_attachment(&self, file_name: &str, content: Option<&[u8]>) -> Result<Attachment> {
        let scope = Scope::Process(self.require_started()?);
        let record = self
            .session
            .call(|backend, ctx| backend.add_attachment(ctx, &scope, file_name, content))?;
        Ok(Attachment::new(self.session.clone(), record))
    }

    pub fn attachments(&self, include_file: bool) -> Result<Vec<Attachment>> {
        let scope = Scope::Process(self.require_started()?);
        let records = self
            .session
            .call(|backend, ctx| backend.attachments(ctx, &scope, include_file))?;
        Ok(records
            .into_iter()
            .map(|record| Attachment::new(self.session.clone(), record))
            .collect())
    }

    fn require_new(&self) -> Result<()> {
        self.session.ensure_live()?;
        if self.record.status != ProcessStatus::New {
            return Err(Error::InvalidState(format!(
                "process instance {} has already been started",
                self.record.id
            )));
        }
        Ok(())
    }

    fn require_started(&self) -> Result<i64> {
        self.session.ensure_live()?;
        if self.record.status == ProcessStatus::New {
            return Err(Error::InvalidState(format!(
                "process instance of {} has not been started",
                self.record.full_name
            )));
        }
        Ok(self.record.id)
    }
}
