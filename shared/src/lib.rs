//! cmdbroker shared protocol types
//!
//! This crate provides the wire types and framing codec used by both the
//! command broker server and its clients.

pub mod codec;
pub mod request;
pub mod result;

pub use request::{CommandRequest, COMPUTE_COMMAND, OS_COMMAND};
pub use result::{CommandResult, ResultStatus};

/// Protocol limits shared by client and server
pub mod limits {
    use std::time::Duration;

    /// Default TCP port the server listens on
    pub const DEFAULT_PORT: u16 = 5555;

    /// Default number of concurrent worker slots
    pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

    /// Default number of requests allowed to wait for a free worker slot
    pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

    /// Wall-clock bound for a single OS command
    pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

    /// How long a client waits for its reply
    pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(40);

    /// Longest accepted arithmetic expression, in bytes
    pub const MAX_EXPRESSION_LEN: usize = 4096;

    /// Deepest accepted parenthesis nesting in an arithmetic expression
    pub const MAX_EXPRESSION_DEPTH: usize = 64;
}

/// Error messages the server returns for envelope-level failures
pub mod errors {
    pub const MISSING_COMMAND_TYPE: &str = "Missing command_type";
    pub const INTERNAL_ERROR: &str = "Internal server error";
    pub const SERVER_BUSY: &str = "Server busy";
    pub const SHUTTING_DOWN: &str = "Server is shutting down";

    /// Prefix of the error returned for undecodable payloads
    pub const INVALID_JSON_PREFIX: &str = "Invalid JSON format: ";
}
