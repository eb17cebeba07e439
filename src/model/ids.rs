use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use uuid::Uuid;

static ROLE_NAME: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]*$").ok());

/// Returns true when `role` can be encoded into an agent id.
pub fn is_valid_role_name(role: &str) -> bool {
    ROLE_NAME.as_ref().is_some_and(|re| re.is_match(role))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("sess_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Agent identifier, `<role>-<instance>`. Unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(role: &str, instance: u32) -> Self {
        Self(format!("{role}-{instance}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Role portion of the id. Role names may contain `-`, so the split is on the last one.
    pub fn role(&self) -> &str {
        self.0
            .rsplit_once('-')
            .map(|(role, _)| role)
            .unwrap_or(&self.0)
    }

    pub fn instance(&self) -> Option<u32> {
        self.0
            .rsplit_once('-')
            .and_then(|(_, instance)| instance.parse().ok())
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(String);

impl PhaseId {
    /// `position` is 1-based.
    pub fn at(position: usize) -> Self {
        Self(format!("phase-{position}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_encodes_role_and_instance() {
        let id = AgentId::new("backend-engineer", 3);
        assert_eq!(id.as_str(), "backend-engineer-3");
        assert_eq!(id.role(), "backend-engineer");
        assert_eq!(id.instance(), Some(3));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("sess_"));
    }

    #[test]
    fn role_names_are_validated() {
        assert!(is_valid_role_name("architect"));
        assert!(is_valid_role_name("qa_engineer.v2"));
        assert!(!is_valid_role_name(""));
        assert!(!is_valid_role_name("3d-artist"));
        assert!(!is_valid_role_name("two words"));
    }
}
