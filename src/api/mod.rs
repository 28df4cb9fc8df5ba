//! Control API
//!
//! HTTP/1.1 JSON interface over the forwarding manager.

mod http;
mod routes;
mod server;

pub use http::MAX_BODY_BYTES;
pub use routes::CreateMappingRequest;
pub use server::{ApiServer, ApiState};
