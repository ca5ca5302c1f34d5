pub mod api;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod external;
pub mod logging;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

// Export orchestration components
pub use logic::{
    BuildService, DependencyGraphService, InstanceForkService, InstanceService, IsolationService,
    Platform, PlatformSettings, WebhookService,
};

pub use error::{PlatformError, Result};

// Export all model types
pub use model::*;

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};
