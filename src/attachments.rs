//! Attachment handles and content streams.

use crate::files;
use crate::models::{AttachmentContent, AttachmentRecord, Identity};
use crate::session::SessionRef;
use crate::Result;
use chrono::{DateTime, Utc};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::info;

/// Handle to an attachment on a process instance or activity destination.
#[derive(Debug, Clone)]
pub struct Attachment {
    session: SessionRef,
    record: AttachmentRecord,
}

impl Attachment {
    pub(crate) fn new(session: SessionRef, record: AttachmentRecord) -> Self {
        Self { session, record }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn file_name(&self) -> &str {
        &self.record.file_name
    }

    /// The user who added the attachment.
    pub fn owner(&self) -> &Identity {
        &self.record.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn process_instance_id(&self) -> i64 {
        self.record.process_instance_id
    }

    pub fn destination_id(&self) -> Option<i64> {
        self.record.destination_id
    }

    /// False while the attachment is metadata-only.
    pub fn is_uploaded(&self) -> bool {
        self.record.content.is_uploaded()
    }

    /// Content size in bytes, once uploaded.
    pub fn size(&self) -> Option<u64> {
        match &self.record.content {
            AttachmentContent::Uploaded { size, .. } => Some(*size),
            AttachmentContent::Pending => None,
        }
    }

    /// Content fetched together with the metadata (`include_file`), if any.
    pub fn included_content(&self) -> Option<&[u8]> {
        match &self.record.content {
            AttachmentContent::Uploaded {
                bytes: Some(bytes), ..
            } => Some(bytes),
            _ => None,
        }
    }

    /// Upload the content of a metadata-only attachment.
    ///
    /// Fails with [`AlreadyUploaded`](crate::Error::AlreadyUploaded) when content is already present.
    pub fn upload_content(&mut self, content: &[u8]) -> Result<()> {
        let id = self.record.id;
        let record = self
            .session
            .call(|backend, ctx| backend.upload_attachment_content(ctx, id, content))?;
        info!(id, file_name = %record.file_name, size = content.len(), "Uploaded attachment");
        self.record = record;
        Ok(())
    }

    /// Fetch the content from the backend.
    ///
    /// Every call fetches again; keep the returned stream to reuse it. Content
    /// uploaded through another handle or the session is picked up here.
    pub fn get_file(&mut self) -> Result<AttachmentStream> {
        let id = self.record.id;
        let bytes = self
            .session
            .call(|backend, ctx| backend.attachment_content(ctx, id))?;
        if !self.record.content.is_uploaded() {
            self.record.content = AttachmentContent::Uploaded {
                size: bytes.len() as u64,
                bytes: None,
            };
        }
        Ok(AttachmentStream {
            attachment_id: id,
            file_name: self.record.file_name.clone(),
            inner: Cursor::new(bytes),
        })
    }

    /// Fetch the content and save it as `dir/<file name>`.
    ///
    /// Refuses to overwrite an existing file.
    pub fn save_to(&mut self, dir: &Path) -> Result<PathBuf> {
        let mut stream = self.get_file()?;
        files::save_stream(dir, &self.record.file_name, &mut stream)
    }
}

/// Readable content of one attachment.
#[derive(Debug)]
pub struct AttachmentStream {
    attachment_id: i64,
    file_name: String,
    inner: Cursor<Vec<u8>>,
}

impl AttachmentStream {
    pub fn attachment_id(&self) -> i64 {
        self.attachment_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Total length of the content.
    pub fn len(&self) -> usize {
        self.inner.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.get_ref().is_empty()
    }

    /// The whole content, regardless of how much was read.
    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl Read for AttachmentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}
