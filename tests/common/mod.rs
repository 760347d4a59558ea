//! Common test utilities for worklist integration tests.
//!
//! Provides `TestEnv`, a seeded reference engine stored in a temporary
//! directory, with a deterministic clock.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
pub use tempfile::TempDir;
use worklist::backend::SqliteEngine;
use worklist::config::EngineSeed;
use worklist::{ConnectionConfig, ProcessInstance, Session};

/// Users, reporting lines and process definitions shared by all tests.
///
/// - anthony manages bob and may impersonate
/// - bob shares his worklist with carol
/// - `Finance\Dispute` offers only a "Reject" action
pub const SEED: &str = r#"
max_connections = 8

[[users]]
name = "anthony"
password = "pw"
can_impersonate = true

[[users]]
name = "bob"
password = "pw"
manager = "anthony"

[[users]]
name = "carol"
password = "pw"

[[users]]
name = "dave"
password = "pw"

[[delegations]]
from = "bob"
to = "carol"

[[processes]]
full_name = 'Finance\Expense Claim'
fields = [
    { name = "Amount", kind = "integer" },
    { name = "Requested", kind = "date" },
    { name = "Justification", kind = "xml" },
    { name = "Requester", kind = "string" },
]

[[processes.activities]]
name = "Approve"
participants = ["bob", "carol"]
actions = [{ name = "Approve", next = "Pay" }, { name = "Reject" }]

[[processes.activities]]
name = "Pay"
participants = ["anthony"]
actions = [{ name = "Paid" }]

[[processes]]
full_name = 'Finance\Dispute'

[[processes.activities]]
name = "Review"
participants = ["bob"]
actions = [{ name = "Reject" }]

[[processes]]
full_name = 'HR\Leave Request'
fields = [{ name = "Days", kind = "integer" }]

[[processes.activities]]
name = "Review"
participants = ["bob"]
actions = [{ name = "Approve" }, { name = "Decline" }]

[[processes]]
full_name = 'HR\Kiosk Request'
platform = "Kiosk"

[[processes.activities]]
name = "Review"
participants = ["bob"]
actions = [{ name = "Done" }]

[[processes]]
full_name = 'Legal\Contract'
starters = ["anthony"]

[[processes.activities]]
name = "Sign"
participants = ["anthony"]
actions = [{ name = "Sign" }]
"#;

/// An isolated engine with a clock that advances one minute per reading.
pub struct TestEnv {
    pub dir: TempDir,
    pub engine: SqliteEngine,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let seed = EngineSeed::from_toml_str(SEED).unwrap();
        let path = dir.path().join("engine.db");
        let engine = SqliteEngine::from_seed(Some(path.as_path()), &seed).unwrap();

        let ticks = Arc::new(AtomicI64::new(0));
        engine
            .set_clock(Arc::new(move || {
                base_time() + Duration::minutes(ticks.fetch_add(1, Ordering::SeqCst))
            }))
            .unwrap();

        Self { dir, engine }
    }

    pub fn config(&self, user: &str) -> ConnectionConfig {
        ConnectionConfig::new("localhost").with_credentials(user, "pw")
    }

    /// Open a session for `user`.
    pub fn session(&self, user: &str) -> Session {
        Session::open(&self.config(user), self.engine.connector()).unwrap()
    }

    /// Directory for files written by a test.
    pub fn download_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// Create and synchronously start an instance of `full_name`.
pub fn start(session: &Session, full_name: &str, folio: &str, priority: i32) -> ProcessInstance {
    let mut process = session.create_process_instance(full_name).unwrap();
    process.set_folio(folio).unwrap();
    process.set_priority(priority).unwrap();
    process.start(true).unwrap();
    process
}
