//! TOML schema for provisioning the reference engine.
//!
//! ```toml
//! max_connections = 8
//!
//! [[users]]
//! name = 'DENALLIX\anthony'
//! password = "pw"
//! can_impersonate = true
//!
//! [[users]]
//! name = 'DENALLIX\bob'
//! password = "pw"
//! manager = 'DENALLIX\anthony'
//!
//! [[processes]]
//! full_name = 'Finance\Expense Claim'
//! fields = [{ name = "Amount", kind = "integer" }]
//!
//! [[processes.activities]]
//! name = "Approve"
//! participants = ['DENALLIX\anthony']
//! actions = [{ name = "Approve" }, { name = "Reject" }]
//! ```

use crate::models::fields::{DataFields, FieldKind};
use crate::models::{DEFAULT_SECURITY_LABEL, Identity};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Platform items are routed to when a definition names none.
pub const DEFAULT_PLATFORM: &str = "ASP";

/// Default number of concurrently open connections an engine accepts.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSeed {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Label applied to user names that do not carry one
    #[serde(default = "default_security_label")]
    pub security_label: String,

    #[serde(default)]
    pub users: Vec<UserSeed>,

    /// Out-of-office delegations
    #[serde(default)]
    pub delegations: Vec<DelegationSeed>,

    #[serde(default)]
    pub processes: Vec<ProcessDefinition>,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_security_label() -> String {
    DEFAULT_SECURITY_LABEL.to_string()
}

impl Default for EngineSeed {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            security_label: default_security_label(),
            users: Vec::new(),
            delegations: Vec::new(),
            processes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSeed {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub can_impersonate: bool,
    /// The user this one reports to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,
}

/// Items of `from` are shared with `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationSeed {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    /// Activity to route to; `None` completes the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    pub name: String,
    /// Users that get one worklist item each when the activity starts
    pub participants: Vec<String>,
    pub actions: Vec<ActionDefinition>,
}

impl ActivityDefinition {
    pub fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.name.clone()).collect()
    }
}

/// A deployable workflow: typed fields plus an ordered list of activities.
///
/// A started instance enters the first activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// `Folder\Name`
    pub full_name: String,

    /// Users allowed to start instances; empty means everyone
    #[serde(default)]
    pub starters: Vec<String>,

    #[serde(default)]
    pub fields: Vec<FieldDefinition>,

    #[serde(default = "default_platform")]
    pub platform: String,

    pub activities: Vec<ActivityDefinition>,
}

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

impl ProcessDefinition {
    pub fn first_activity(&self) -> Option<&ActivityDefinition> {
        self.activities.first()
    }

    pub fn activity(&self, name: &str) -> Option<&ActivityDefinition> {
        self.activities.iter().find(|a| a.name == name)
    }

    /// Fields of a new instance, each at its kind's default value.
    pub fn initial_fields(&self) -> DataFields {
        let mut fields = DataFields::new();
        for field in &self.fields {
            fields.declare(field.name.clone(), field.kind.default_value());
        }
        fields
    }

    /// Check names are unique and every route points at a real activity.
    pub fn validate(&self, security_label: &str) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(format!("{}: {}", self.full_name, msg)));

        if self.full_name.trim().is_empty() {
            return Err(Error::Config("process full name cannot be empty".to_string()));
        }
        if self.activities.is_empty() {
            return invalid("process has no activities".to_string());
        }

        let mut field_names = HashSet::new();
        for field in &self.fields {
            if !field_names.insert(field.name.as_str()) {
                return invalid(format!("duplicate field {}", field.name));
            }
        }

        let activity_names: HashSet<&str> =
            self.activities.iter().map(|a| a.name.as_str()).collect();
        if activity_names.len() != self.activities.len() {
            return invalid("duplicate activity name".to_string());
        }

        for activity in &self.activities {
            if activity.participants.is_empty() {
                return invalid(format!("activity {} has no participants", activity.name));
            }
            if activity.actions.is_empty() {
                return invalid(format!("activity {} has no actions", activity.name));
            }
            for participant in &activity.participants {
                Identity::parse(participant, security_label)?;
            }
            let mut action_names = HashSet::new();
            for action in &activity.actions {
                if !action_names.insert(action.name.as_str()) {
                    return invalid(format!(
                        "activity {} has duplicate action {}",
                        activity.name, action.name
                    ));
                }
                if let Some(next) = &action.next {
                    if !activity_names.contains(next.as_str()) {
                        return invalid(format!(
                            "action {} routes to unknown activity {}",
                            action.name, next
                        ));
                    }
                }
            }
        }
        for starter in &self.starters {
            Identity::parse(starter, security_label)?;
        }
        Ok(())
    }
}

impl EngineSeed {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let seed: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        seed.validate()?;
        Ok(seed)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be greater than zero".to_string()));
        }
        let mut users = HashSet::new();
        for user in &self.users {
            let id = Identity::parse(&user.name, &self.security_label)?;
            if !users.insert(id) {
                return Err(Error::Config(format!("duplicate user {}", user.name)));
            }
        }
        for user in &self.users {
            if let Some(manager) = &user.manager {
                let manager = Identity::parse(manager, &self.security_label)?;
                if !users.contains(&manager) {
                    return Err(Error::Config(format!(
                        "manager {} of {} is not a known user",
                        manager, user.name
                    )));
                }
            }
        }
        for delegation in &self.delegations {
            Identity::parse(&delegation.from, &self.security_label)?;
            Identity::parse(&delegation.to, &self.security_label)?;
        }
        let mut processes = HashSet::new();
        for process in &self.processes {
            process.validate(&self.security_label)?;
            if !processes.insert(process.full_name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate process definition {}",
                    process.full_name
                )));
            }
        }
        Ok(())
    }
}
