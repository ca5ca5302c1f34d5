pub mod handlers;
pub mod routes;
pub mod user_extractor;

pub use handlers::*;
pub use routes::*;
pub use user_extractor::GithubActor;
