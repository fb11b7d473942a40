//! HTTP basic authentication for the API

pub mod middleware;

pub use middleware::{auth_middleware, check_basic_auth, parse_basic_auth, AUTH_REALM};
