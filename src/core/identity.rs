//! Worker identities and the names derived from them.
//!
//! One identity has three renderings that must stay in lockstep:
//! - assignee path written on work items: `gastown/polecats/toast`
//! - agent item id in the store: `gt-gastown-polecat-toast`
//! - session name the worker runs under: `gt-gastown-toast`
//!
//! Session names are derived purely from the identity, so an assignee read
//! back from the store always maps to the session that was started for it.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Role a worker plays inside its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Polecat,
    Crew,
    Witness,
    Refinery,
}

impl Role {
    const ALL: [Role; 4] = [Role::Polecat, Role::Crew, Role::Witness, Role::Refinery];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Polecat => "polecat",
            Role::Crew => "crew",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
        }
    }

    /// Path segment used in assignee paths.
    fn path_segment(&self) -> &'static str {
        match self {
            Role::Polecat => "polecats",
            other => other.as_str(),
        }
    }

    /// Singleton roles have one instance per domain and carry no name.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Role::Witness | Role::Refinery)
    }

    fn parse(segment: &str) -> Option<Role> {
        match segment {
            "polecat" | "polecats" => Some(Role::Polecat),
            "crew" => Some(Role::Crew),
            "witness" => Some(Role::Witness),
            "refinery" => Some(Role::Refinery),
            _ => None,
        }
    }
}

/// A worker identity: `(domain, role, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub domain: String,
    pub role: Role,
    /// Empty for singleton roles.
    pub name: String,
}

impl AgentIdentity {
    pub fn polecat(domain: &str, name: &str) -> Self {
        Self {
            domain: domain.to_string(),
            role: Role::Polecat,
            name: name.to_string(),
        }
    }

    pub fn new(domain: &str, role: Role, name: &str) -> Result<Self> {
        let identity = Self {
            domain: domain.to_string(),
            role,
            name: if role.is_singleton() {
                String::new()
            } else {
                name.to_string()
            },
        };
        identity.validate()?;
        Ok(identity)
    }

    fn validate(&self) -> Result<()> {
        if self.domain.is_empty() || self.domain.contains(['/', ' ']) {
            return Err(Error::Validation(format!(
                "invalid worker domain '{}'",
                self.domain
            )));
        }
        if !self.role.is_singleton() && (self.name.is_empty() || self.name.contains(['/', ' '])) {
            return Err(Error::Validation(format!(
                "invalid worker name '{}' in domain '{}'",
                self.name, self.domain
            )));
        }
        Ok(())
    }

    /// Parse an assignee path: `domain/polecats/name`, `domain/crew/name`,
    /// `domain/witness`. The two-segment `domain/name` shorthand means a
    /// polecat.
    pub fn parse_path(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.trim().split('/').collect();
        let identity = match parts.as_slice() {
            [domain, role, name] => match Role::parse(role) {
                Some(role) if !role.is_singleton() => Self::new(domain, role, name)?,
                _ => {
                    return Err(Error::Validation(format!(
                        "unrecognized assignee path '{}'",
                        path
                    )))
                }
            },
            [domain, segment] => match Role::parse(segment) {
                Some(role) if role.is_singleton() => Self::new(domain, role, "")?,
                _ => Self::new(domain, Role::Polecat, segment)?,
            },
            _ => {
                return Err(Error::Validation(format!(
                    "unrecognized assignee path '{}'",
                    path
                )))
            }
        };
        Ok(identity)
    }

    /// Parse an agent item id: `<prefix>-<domain>-<role>[-<name>]`.
    ///
    /// Domains may contain dashes and even role words (`my-crew-rig`), so
    /// role segments are tried from the right; the first split that yields
    /// a valid identity wins. A worker name that is itself a role word
    /// falls back to the next role segment to its left.
    pub fn from_agent_item_id(id: &str, prefix: &str) -> Result<Self> {
        let rest = id
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('-'))
            .ok_or_else(|| {
                Error::Validation(format!("agent id '{}' lacks prefix '{}'", id, prefix))
            })?;
        let segments: Vec<&str> = rest.split('-').collect();
        let mut last_err = None;
        for role_at in (1..segments.len()).rev() {
            let Some(role) = Role::ALL
                .iter()
                .copied()
                .find(|r| r.as_str() == segments[role_at])
            else {
                continue;
            };
            let domain = segments[..role_at].join("-");
            let name = segments[role_at + 1..].join("-");
            if role.is_singleton() && !name.is_empty() {
                last_err = Some(Error::Validation(format!(
                    "agent id '{}' has a name on singleton role {}",
                    id,
                    role.as_str()
                )));
                continue;
            }
            match Self::new(&domain, role, &name) {
                Ok(identity) => return Ok(identity),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Validation(format!("agent id '{}' names no role", id))))
    }

    /// Assignee path written to work items.
    pub fn path(&self) -> String {
        if self.role.is_singleton() {
            format!("{}/{}", self.domain, self.role.path_segment())
        } else {
            format!("{}/{}/{}", self.domain, self.role.path_segment(), self.name)
        }
    }

    /// Id of the agent's own record in the store.
    pub fn agent_item_id(&self, prefix: &str) -> String {
        if self.role.is_singleton() {
            format!("{}-{}-{}", prefix, self.domain, self.role.as_str())
        } else {
            format!(
                "{}-{}-{}-{}",
                prefix,
                self.domain,
                self.role.as_str(),
                self.name
            )
        }
    }

    /// Session name the worker runs under. Pure function of the identity.
    pub fn session_name(&self, prefix: &str) -> String {
        let raw = match self.role {
            Role::Polecat => format!("{}-{}-{}", prefix, self.domain, self.name),
            Role::Crew => format!("{}-{}-crew-{}", prefix, self.domain, self.name),
            Role::Witness | Role::Refinery => {
                format!("{}-{}-{}", prefix, self.domain, self.role.as_str())
            }
        };
        sanitize_session_name(&raw)
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// tmux rejects `.` and `:` in target names.
fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
