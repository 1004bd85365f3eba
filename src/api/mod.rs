//! # REST API Components
//!
//! The keystash HTTP API: secrets, orders, containers and secret store
//! administration. Every route except `/health` is scoped to the project in
//! the `X-Project-Id` header.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use middleware::{ProjectContext, PROJECT_ID_HEADER};
pub use routes::{build_router, ApiState};
pub use server::start_api_server;
