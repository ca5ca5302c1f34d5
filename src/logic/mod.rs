pub mod build_service;
pub mod dependency_graph;
pub mod fork_service;
pub mod instance_service;
pub mod isolation_service;
pub mod platform;
pub mod webhook_service;

pub use build_service::*;
pub use dependency_graph::*;
pub use fork_service::*;
pub use instance_service::*;
pub use isolation_service::*;
pub use platform::*;
pub use webhook_service::*;

#[cfg(test)]
pub(crate) mod test_support;
