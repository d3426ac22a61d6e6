//! HTTP API for the gateway.
//!
//! - `routes`: router, shared state and server lifecycle
//! - `auth`: API-token auth for relay routes, JWT auth for admin routes
//! - `videos`: submission and fetch endpoints
//! - `admin`: pricing, channels, users, tokens and logs

mod admin;
mod auth;
pub mod routes;
mod videos;

pub use routes::{router, serve, AppState};
