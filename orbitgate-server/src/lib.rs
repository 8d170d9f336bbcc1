//! orbitgate-server: service wiring and the operator HTTP API

pub mod http;
pub mod startup;

pub use http::{create_router, ApiState};
pub use startup::Services;
