pub mod analytics;
pub mod events;
pub mod fingerprint;
pub mod permissions;
pub mod queue;
pub mod source_control;

pub use analytics::*;
pub use events::*;
pub use fingerprint::*;
pub use permissions::*;
pub use queue::*;
pub use source_control::*;
