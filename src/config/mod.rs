//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup; runtime mutability lives in the
//!   registry's atomic flags, not here
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{
    FlagsConfig, GatewayConfig, ListenerConfig, ObservabilityConfig, PolicyConfig,
    PrivateServerConfig, PublicServersConfig, TimeoutConfig,
};
