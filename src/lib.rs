//! Core library for the camera service.
//!
//! The service drives industrial cameras from three vendor families (IDS,
//! Mshot, Hikrobot) and streams live JPEG frames to clients over a single
//! WebSocket per client. Control messages are JSON text frames; stream frames
//! are binary messages on the same socket.
//!
//! The binary in `src/main.rs` is a thin wrapper around [`server::serve`];
//! everything else lives here so integration tests can drive a
//! [`dispatcher::Dispatcher`] directly against simulated devices.

pub mod camera;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod sdk;
pub mod server;
pub mod streaming;
