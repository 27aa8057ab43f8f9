//! Censorship-circumvention HTTP/HTTPS proxy gateway library.

pub mod config;
pub mod gateway;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod policy;
pub mod registry;
pub mod relay;
pub mod sniff;
pub mod upstream;

pub use config::GatewayConfig;
pub use gateway::front_door::FrontDoor;
pub use gateway::GatewayContext;
pub use lifecycle::Shutdown;
pub use registry::{GlobalFlags, ProxyRegistry};
