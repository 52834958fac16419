// libs/shared/utils/src/lib.rs
pub mod test_utils;

pub use test_utils::{TestConfig, TestParticipant};
