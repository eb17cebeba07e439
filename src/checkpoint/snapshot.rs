//! Versioned checkpoint documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::store::StoreError;
use crate::model::{Agent, Phase, Session, SessionId, SessionState};

pub const SCHEMA_VERSION: u32 = 1;

/// Full state of one session at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub agents: Vec<Agent>,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    SessionTransition,
    PhaseStarting,
    AgentCompleted,
    PlanExtended,
    ResumeTokenRecorded,
    BeforeRecovery,
    Recovered,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotRecord {
    Session(Session),
    Agent(Agent),
    Phase(Phase),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub session_id: SessionId,
    /// Event sequence number at capture time
    pub logical_timestamp: u64,
    pub taken_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    pub hostname: String,
    pub pid: u32,
    pub records: Vec<SnapshotRecord>,
    /// SHA-256 over the serialized records
    pub digest: String,
}

impl Checkpoint {
    pub fn capture(
        snapshot: &SessionSnapshot,
        logical_timestamp: u64,
        reason: CheckpointReason,
    ) -> Result<Self, StoreError> {
        let mut records = Vec::with_capacity(1 + snapshot.agents.len() + snapshot.phases.len());
        records.push(SnapshotRecord::Session(snapshot.session.clone()));
        records.extend(snapshot.agents.iter().cloned().map(SnapshotRecord::Agent));
        records.extend(snapshot.phases.iter().cloned().map(SnapshotRecord::Phase));
        let digest = digest_records(&records)?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            session_id: snapshot.session.id.clone(),
            logical_timestamp,
            taken_at: Utc::now(),
            reason,
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            pid: std::process::id(),
            records,
            digest,
        })
    }

    /// Parses and verifies a serialized checkpoint.
    pub fn from_json(contents: &str) -> Result<Self, StoreError> {
        let checkpoint: Checkpoint = serde_json::from_str(contents)?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn verify(&self) -> Result<(), StoreError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: self.schema_version,
            });
        }
        let actual = digest_records(&self.records)?;
        if actual != self.digest {
            return Err(StoreError::Corrupt {
                reason: format!("digest mismatch for {}", self.session_id),
            });
        }
        let sessions = self
            .records
            .iter()
            .filter(|record| matches!(record, SnapshotRecord::Session(_)))
            .count();
        if sessions != 1 {
            return Err(StoreError::Corrupt {
                reason: format!("expected one session record, found {sessions}"),
            });
        }
        Ok(())
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.records.iter().find_map(|record| match record {
            SnapshotRecord::Session(session) => Some(session.state),
            _ => None,
        })
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot, StoreError> {
        let mut session = None;
        let mut agents = Vec::new();
        let mut phases = Vec::new();
        for record in &self.records {
            match record {
                SnapshotRecord::Session(s) => session = Some(s.clone()),
                SnapshotRecord::Agent(a) => agents.push(a.clone()),
                SnapshotRecord::Phase(p) => phases.push(p.clone()),
            }
        }
        let session = session.ok_or_else(|| StoreError::Corrupt {
            reason: format!("checkpoint for {} has no session record", self.session_id),
        })?;
        Ok(SessionSnapshot {
            session,
            agents,
            phases,
        })
    }
}

fn digest_records(records: &[SnapshotRecord]) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(records)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentId, ExecutionStrategy};
    use std::collections::BTreeMap;

    fn snapshot() -> SessionSnapshot {
        let session = Session::new(
            SessionId::from("sess_cp"),
            "ship it",
            ExecutionStrategy::Adaptive,
            BTreeMap::new(),
        );
        let agent = Agent::pending(
            AgentId::from("engineer-1"),
            "engineer",
            "build",
            vec![],
            None,
            512,
        );
        SessionSnapshot {
            session,
            agents: vec![agent],
            phases: vec![],
        }
    }

    #[test]
    fn records_are_tagged_by_kind() {
        let checkpoint =
            Checkpoint::capture(&snapshot(), 7, CheckpointReason::AgentCompleted).unwrap();
        let json: serde_json::Value = serde_json::from_str(&checkpoint.to_json().unwrap()).unwrap();

        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["records"][0]["kind"], "session");
        assert_eq!(json["records"][1]["kind"], "agent");
        assert_eq!(json["records"][1]["id"], "engineer-1");
    }

    #[test]
    fn parsed_checkpoint_restores_snapshot() {
        let original = snapshot();
        let checkpoint = Checkpoint::capture(&original, 3, CheckpointReason::PlanExtended).unwrap();
        let parsed = Checkpoint::from_json(&checkpoint.to_json().unwrap()).unwrap();

        assert_eq!(parsed.snapshot().unwrap(), original);
        assert_eq!(parsed.session_state(), Some(SessionState::Created));
    }

    #[test]
    fn tampered_records_fail_verification() {
        let mut checkpoint =
            Checkpoint::capture(&snapshot(), 3, CheckpointReason::PlanExtended).unwrap();
        if let SnapshotRecord::Session(session) = &mut checkpoint.records[0] {
            session.state = SessionState::Completed;
        }
        let err = Checkpoint::from_json(&checkpoint.to_json().unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut checkpoint =
            Checkpoint::capture(&snapshot(), 3, CheckpointReason::PlanExtended).unwrap();
        checkpoint.schema_version = 2;
        assert!(matches!(
            checkpoint.verify(),
            Err(StoreError::UnsupportedVersion { found: 2 })
        ));
    }
}
