//! Runtime requirement checks for the guest daemon.

mod requirements;

pub use requirements::{RuntimeRequirements, check_all};
