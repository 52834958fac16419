use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a participant plays in a consultation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Patient,
    Provider,
}

impl ParticipantRole {
    /// Maps the portal's user role strings onto a consultation role.
    /// Doctors and other clinical staff join as providers.
    pub fn from_user_role(role: &str) -> Self {
        match role.to_ascii_lowercase().as_str() {
            "doctor" | "provider" | "specialist" | "nurse" | "admin" => ParticipantRole::Provider,
            _ => ParticipantRole::Patient,
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRole::Patient => write!(f, "patient"),
            ParticipantRole::Provider => write!(f, "provider"),
        }
    }
}

/// Identity of the local user, as supplied by the backend before a call starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalParticipant {
    pub participant_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
}

impl LocalParticipant {
    pub fn new(participant_id: impl Into<String>, display_name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_user_role() {
        assert_eq!(ParticipantRole::from_user_role("DOCTOR"), ParticipantRole::Provider);
        assert_eq!(ParticipantRole::from_user_role("nurse"), ParticipantRole::Provider);
        assert_eq!(ParticipantRole::from_user_role("PATIENT"), ParticipantRole::Patient);
        assert_eq!(ParticipantRole::from_user_role("unknown"), ParticipantRole::Patient);
    }

    #[test]
    fn test_participant_wire_format() {
        let participant = LocalParticipant::new("p1", "John Doe", ParticipantRole::Patient);
        let value = serde_json::to_value(&participant).unwrap();
        assert_eq!(value["participantId"], "p1");
        assert_eq!(value["role"], "PATIENT");
    }
}
