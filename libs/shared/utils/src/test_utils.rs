// libs/shared/utils/src/test_utils.rs
use std::time::Duration;
use uuid::Uuid;

use shared_config::{CallSessionConfig, ReconnectPolicy, DEFAULT_ICE_SERVER};
use shared_models::participant::{LocalParticipant, ParticipantRole};

/// Session timings for tests. The reconnect schedule keeps the production
/// shape (1s, 2s, 4s capped at 10s) so paused-clock tests can assert on it.
pub struct TestConfig {
    pub negotiation_timeout: Duration,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(5),
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_attempts: 3,
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl TestConfig {
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn to_call_config(&self) -> CallSessionConfig {
        CallSessionConfig {
            negotiation_timeout: self.negotiation_timeout,
            reconnect: ReconnectPolicy {
                base_delay: self.base_delay,
                factor: self.factor,
                max_attempts: self.max_attempts,
                max_delay: self.max_delay,
                attempt_timeout: self.attempt_timeout,
            },
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        }
    }
}

pub struct TestParticipant {
    pub id: String,
    pub name: String,
    pub role: String,
}

impl Default for TestParticipant {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "Test Patient".to_string(),
            role: "patient".to_string(),
        }
    }
}

impl TestParticipant {
    pub fn new(name: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            role: role.to_string(),
        }
    }

    pub fn doctor(name: &str) -> Self {
        Self::new(name, "doctor")
    }

    pub fn patient(name: &str) -> Self {
        Self::new(name, "patient")
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn to_local_participant(&self) -> LocalParticipant {
        LocalParticipant::new(
            self.id.clone(),
            self.name.clone(),
            ParticipantRole::from_user_role(&self.role),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doctor_maps_to_provider() {
        let doctor = TestParticipant::doctor("Dr. Osei").to_local_participant();
        assert_eq!(doctor.role, ParticipantRole::Provider);
        assert_eq!(doctor.display_name, "Dr. Osei");

        let patient = TestParticipant::patient("Ama").with_id("patient-1").to_local_participant();
        assert_eq!(patient.role, ParticipantRole::Patient);
        assert_eq!(patient.participant_id, "patient-1");
    }

    #[test]
    fn test_config_keeps_backoff_shape() {
        let config = TestConfig::default().to_call_config();
        assert!(config.is_valid());
        assert_eq!(
            config.reconnect.schedule(),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }
}
