#![forbid(unsafe_code)]

// Squawk library - push-to-talk room coordination and WebRTC signaling relay

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod identity;
pub mod metrics;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod store;
