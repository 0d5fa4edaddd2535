//! Session management for tracking connected clients
//!
//! This module handles:
//! - Tracking all connected client sessions by caller address
//! - Reading length-prefixed request frames per connection
//! - Queued, non-blocking writes back to a specific client

mod connection;
mod manager;

pub use connection::ClientSession;
pub use manager::SessionManager;
