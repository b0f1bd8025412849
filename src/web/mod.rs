//! Web API for scripthost.

pub mod error;
pub mod handlers;
pub mod router;

pub use error::{ApiError, ErrorCode};
pub use handlers::AppState;
pub use router::create_router;
