pub mod health;
pub mod pairing;
pub mod presence;
pub mod sessions;
