//! wsauth server: authenticates WebSocket clients by ECDSA challenge-response.

pub mod config;
pub mod routes;
pub mod serve;
pub mod socket;
