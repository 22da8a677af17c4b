//! Axum HTTP server, routing, and middleware.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Inject shared application state (`AppState`) into handlers.
//! - Bridge the blocking download interceptor onto streaming responses.

pub mod delivery;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
