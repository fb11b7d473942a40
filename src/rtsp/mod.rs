//! RTSP side of the relay: upstream camera sessions and their pool

mod client;
pub mod h264;
mod pool;
mod source;

pub use client::{RetinaDialer, RetinaSource};
pub use pool::{AcquireError, ConnectionPool, SourceConnection, SourceInfo};
pub use source::{source_key, MediaSample, MediaSource, SourceDialer};

#[cfg(test)]
pub(crate) use pool::testing;
