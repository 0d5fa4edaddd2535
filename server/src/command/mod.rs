//! Request handling for the server
//!
//! This module handles:
//! - Decoding request envelopes and routing them by command type
//! - Running handlers on a bounded worker pool
//! - Correlating completed tasks with the caller that submitted them
//! - Reporting tasks that stay outstanding for too long

mod correlator;
mod dispatcher;
mod envelope;
mod handlers;
mod monitor;
mod pool;
mod registry;

pub use dispatcher::Dispatcher;
pub use monitor::StallMonitor;
pub use registry::HandlerRegistry;
