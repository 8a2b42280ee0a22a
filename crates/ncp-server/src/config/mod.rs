// crates/ncp-server/src/config/mod.rs
// Configuration and shared constants

pub mod env;
pub mod profiles;

pub use env::{ConfigValidation, EnvConfig, DEFAULT_PROFILE};
pub use profiles::{
    definition_hash, AuthConfig, ProfileDocument, ProfileStore, ServerDefinition, ALL_PROFILE,
};
