//! webrtc-rs media endpoint
//!
//! This module provides:
//! - Peer connection creation from the configured ICE servers
//! - The unordered, unreliable control data channel
//! - Sample-fed outgoing tracks and in-call video track replacement

pub mod media_track;
pub mod peer_connection;

pub use peer_connection::{RtcEndpoint, RtcEndpointFactory};
