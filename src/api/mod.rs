//! Control API
//!
//! REST endpoints for operators, clients and drive daemons.

pub mod peer;
pub mod rest;
pub mod server;

pub use peer::PeerResolver;
pub use rest::{ApiErrorResponse, RestRouter};
pub use server::{ApiServer, ApiServerConfig};
