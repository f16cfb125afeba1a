// Read-only status endpoints for a running extraction

pub mod api;
pub mod server;
