pub mod config;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
