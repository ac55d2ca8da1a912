pub mod algorithm;
pub mod matcher;

pub use matcher::{Cancellation, MatchSettings, Matcher, Pairing, PairingStatus};
