pub mod config;
pub mod handlers;
mod server;

pub use config::*;
pub use handlers::*;
pub use server::{ApiHandlers, ServerError, build_api_router, serve};
