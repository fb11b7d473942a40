//! Utility modules shared across the gateway

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, outbound_ipv4};
pub use throttle::LogThrottler;
