//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup: load config → build registry/policies → bind front door
//!     → spawn directory load + periodic refresh → accept loop
//!
//! Shutdown: ctrl-c (or test trigger) → broadcast → accept loop exits,
//!     in-flight sessions finish on their own timeouts
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
