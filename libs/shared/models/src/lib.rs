pub mod participant;

pub use participant::{LocalParticipant, ParticipantRole};
