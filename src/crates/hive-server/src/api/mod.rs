//! HTTP + SSE surface.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod sse;

pub use error::{ApiError, ApiResult};
pub use routes::{create_router, AppState};
