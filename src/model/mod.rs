pub mod auto_isolation;
pub mod build;
pub mod common;
pub mod context_version;
pub mod instance;
pub mod isolation;
pub mod job;
pub mod push;
pub mod user;

pub use auto_isolation::*;
pub use build::*;
pub use common::*;
pub use context_version::*;
pub use instance::*;
pub use isolation::*;
pub use job::*;
pub use push::*;
pub use user::*;
