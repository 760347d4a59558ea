//! JSON-over-HTTP transport to a remote workflow engine.
//!
//! Every remote procedure is a `POST {base}/api/{procedure}` with a JSON body.
//! After `connect`, calls carry the connection ticket as a bearer token and
//! name the identity they act as in the body.
//!
//! Failures come back as a non-2xx status, ideally with a body of the form
//! `{"kind": "not_found", "message": "..."}`. Bodies without a recognizable
//! kind fall back to a mapping on the status code.

use super::{
    Backend, CallContext, ConnectGrant, OpenMode, ProcessChanges, WorklistPage, WorklistQuery,
};
use crate::config::ConnectionConfig;
use crate::models::{AttachmentRecord, Comment, Identity, ItemRecord, ProcessRecord, Scope, SerialNumber};
use crate::{Error, ErrorKind, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, warn};

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!(
    "worklist-client/",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("WORKLIST_GIT_COMMIT"),
    ")"
);

/// Error body returned by the remote engine.
#[derive(Debug, Deserialize)]
struct RemoteError {
    kind: ErrorKind,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    #[serde(default, with = "crate::models::base64_bytes")]
    content: Option<Vec<u8>>,
}

/// Backend that forwards every call to a remote engine over HTTP.
pub struct HttpBackend {
    /// Overrides `http://{host}:{port}` from the connection settings
    base_url: Option<String>,
    agent: Option<ureq::Agent>,
    endpoint: String,
}

impl HttpBackend {
    /// A backend that derives its base URL from the connection settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            agent: None,
            endpoint: String::new(),
        }
    }

    /// A backend that talks to `base_url`, e.g. `https://wf.example.com`.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into().trim_end_matches('/').to_string()),
            agent: None,
            endpoint: String::new(),
        }
    }

    fn call<T: DeserializeOwned>(
        &self,
        procedure: &str,
        ticket: Option<&str>,
        body: Value,
    ) -> Result<T> {
        let agent = self
            .agent
            .as_ref()
            .ok_or_else(|| Error::InvalidState("HTTP backend is not connected".to_string()))?;
        let url = format!("{}/api/{}", self.endpoint, procedure);

        let mut request = agent
            .post(&url)
            .set("Accept", "application/json")
            .set("User-Agent", USER_AGENT);
        if let Some(ticket) = ticket {
            request = request.set("Authorization", &format!("Bearer {}", ticket));
        }

        debug!(procedure, "Calling remote procedure");
        match request.send_json(body) {
            Ok(resp) => {
                let mut text = String::new();
                resp.into_reader()
                    .read_to_string(&mut text)
                    .map_err(|e| Error::Connectivity(format!("{}: {}", url, e)))?;
                decode_body(procedure, &text)
            }
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                let err = map_status(code, &body);
                warn!(procedure, code, kind = %err.kind(), "Remote procedure failed");
                Err(err)
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(Error::Connectivity(format!("{}: {}", url, transport)))
            }
        }
    }

    fn call_with<T: DeserializeOwned>(
        &self,
        procedure: &str,
        ctx: &CallContext,
        mut body: Value,
    ) -> Result<T> {
        if let Value::Object(map) = &mut body {
            map.insert("acting_as".to_string(), json!(ctx.acting_as));
        }
        self.call(procedure, Some(&ctx.ticket), body)
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a 2xx response body. An empty body reads as `null`, which unit
/// procedures accept and record-returning procedures reject.
fn decode_body<T: DeserializeOwned>(procedure: &str, body: &str) -> Result<T> {
    let body = if body.trim().is_empty() { "null" } else { body };
    serde_json::from_str(body)
        .map_err(|e| Error::Other(format!("invalid response from {}: {}", procedure, e)))
}

/// Map a non-2xx response to an error.
fn map_status(code: u16, body: &str) -> Error {
    if let Ok(remote) = serde_json::from_str::<RemoteError>(body) {
        return Error::from_remote(remote.kind, remote.message);
    }
    let detail = if body.trim().is_empty() {
        format!("HTTP {}", code)
    } else {
        format!("HTTP {}: {}", code, body.trim())
    };
    match code {
        401 => Error::Authentication(detail),
        403 => Error::Authorization(detail),
        404 => Error::NotFound(detail),
        408 | 502 | 503 | 504 => Error::Connectivity(detail),
        _ => Error::Other(detail),
    }
}

impl Backend for HttpBackend {
    fn connect(&mut self, config: &ConnectionConfig) -> Result<ConnectGrant> {
        config.validate()?;
        self.endpoint = match &self.base_url {
            Some(url) => url.clone(),
            None => format!("http://{}", config.endpoint()),
        };
        self.agent = Some(
            ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build(),
        );

        let body = json!({
            "user_id": config.user_id,
            "password": config.password,
            "authenticate": config.authenticate,
            "is_primary_login": config.is_primary_login,
            "security_label": config.security_label,
        });
        match self.call::<ConnectGrant>("connect", None, body) {
            Ok(grant) => {
                debug!(endpoint = %self.endpoint, user = %grant.principal, "Connected");
                Ok(grant)
            }
            Err(e) => {
                self.agent = None;
                Err(e)
            }
        }
    }

    fn disconnect(&mut self, ctx: &CallContext) -> Result<()> {
        let result = self.call::<IgnoredAny>("disconnect", Some(&ctx.ticket), json!({}));
        self.agent = None;
        result.map(|_| ())
    }

    fn impersonate(&mut self, ctx: &CallContext, target: &Identity) -> Result<()> {
        self.call_with::<IgnoredAny>("impersonate", ctx, json!({ "target": target }))?;
        Ok(())
    }

    fn create_process(&mut self, ctx: &CallContext, full_name: &str) -> Result<ProcessRecord> {
        self.call_with("create_process", ctx, json!({ "full_name": full_name }))
    }

    fn start_process(
        &mut self,
        ctx: &CallContext,
        draft: &ProcessRecord,
        sync: bool,
    ) -> Result<ProcessRecord> {
        self.call_with("start_process", ctx, json!({ "draft": draft, "sync": sync }))
    }

    fn open_process(&mut self, ctx: &CallContext, id: i64) -> Result<ProcessRecord> {
        self.call_with("open_process", ctx, json!({ "id": id }))
    }

    fn query_worklist(&mut self, ctx: &CallContext, query: &WorklistQuery) -> Result<WorklistPage> {
        self.call_with("query_worklist", ctx, json!({ "query": query }))
    }

    fn open_item(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        allocate: bool,
    ) -> Result<ItemRecord> {
        self.call_with(
            "open_item",
            ctx,
            json!({ "serial_number": serial, "mode": mode, "allocate": allocate }),
        )
    }

    fn update_item(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        changes: &ProcessChanges,
    ) -> Result<ItemRecord> {
        self.call_with(
            "update_item",
            ctx,
            json!({ "serial_number": serial, "mode": mode, "changes": changes }),
        )
    }

    fn execute_action(
        &mut self,
        ctx: &CallContext,
        serial: &SerialNumber,
        mode: &OpenMode,
        action: &str,
        changes: &ProcessChanges,
    ) -> Result<()> {
        self.call_with::<IgnoredAny>(
            "execute_action",
            ctx,
            json!({
                "serial_number": serial,
                "mode": mode,
                "action": action,
                "changes": changes,
            }),
        )?;
        Ok(())
    }

    fn add_comment(&mut self, ctx: &CallContext, scope: &Scope, message: &str) -> Result<Comment> {
        self.call_with("add_comment", ctx, json!({ "scope": scope, "message": message }))
    }

    fn comments(&mut self, ctx: &CallContext, scope: &Scope) -> Result<Vec<Comment>> {
        self.call_with("comments", ctx, json!({ "scope": scope }))
    }

    fn add_attachment(
        &mut self,
        ctx: &CallContext,
        scope: &Scope,
        file_name: &str,
        content: Option<&[u8]>,
    ) -> Result<AttachmentRecord> {
        self.call_with(
            "add_attachment",
            ctx,
            json!({
                "scope": scope,
                "file_name": file_name,
                "content": content.map(|bytes| STANDARD.encode(bytes)),
            }),
        )
    }

    fn upload_attachment_content(
        &mut self,
        ctx: &CallContext,
        id: i64,
        content: &[u8],
    ) -> Result<AttachmentRecord> {
        self.call_with(
            "upload_attachment_content",
            ctx,
            json!({ "id": id, "content": STANDARD.encode(content) }),
        )
    }

    fn attachments(
        &mut self,
        ctx: &CallContext,
        scope: &Scope,
        include_file: bool,
    ) -> Result<Vec<AttachmentRecord>> {
        self.call_with(
            "attachments",
            ctx,
            json!({ "scope": scope, "include_file": include_file }),
        )
    }

    fn attachment(
        &mut self,
        ctx: &CallContext,
        id: i64,
        include_file: bool,
    ) -> Result<AttachmentRecord> {
        self.call_with(
            "attachment",
            ctx,
            json!({ "id": id, "include_file": include_file }),
        )
    }

    fn attachment_content(&mut self, ctx: &CallContext, id: i64) -> Result<Vec<u8>> {
        let resp: ContentResponse =
            self.call_with("attachment_content", ctx, json!({ "id": id }))?;
        resp.content.ok_or_else(|| {
            Error::InvalidState(format!("attachment {} has no content yet", id))
        })
    }

    fn backend_type(&self) -> &'static str {
        "http"
    }
}
