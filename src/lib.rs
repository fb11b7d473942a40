//! cam-relay - IP camera discovery and RTSP to WebRTC relay
//!
//! Finds RTSP cameras on the local network, keeps one upstream connection
//! per camera stream, and relays it to browser viewers over WebRTC.

pub mod auth;
pub mod camera;
pub mod config;
pub mod discovery;
pub mod error;
pub mod janitor;
pub mod rtsp;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
