//! Command handlers for the supported command types

mod compute;
mod os;
#[cfg(test)]
mod probe;

pub use compute::MathCommandHandler;
pub use os::OsCommandHandler;
#[cfg(test)]
pub use probe::ProbeHandler;

use super::envelope::CommandEnvelope;
use cmdbroker_shared::CommandResult;

/// The closed set of command handlers
///
/// Handlers hold no per-invocation state and may run concurrently from any
/// number of worker slots. Domain failures come back as error results; a
/// panic is treated as an internal fault by the worker pool.
#[derive(Debug, Clone)]
pub enum Handler {
    Os(OsCommandHandler),
    Compute(MathCommandHandler),
    #[cfg(test)]
    Probe(ProbeHandler),
}

impl Handler {
    pub async fn process(&self, envelope: &CommandEnvelope) -> CommandResult {
        match self {
            Handler::Os(handler) => handler.process(envelope).await,
            Handler::Compute(handler) => handler.process(envelope),
            #[cfg(test)]
            Handler::Probe(handler) => handler.process(envelope).await,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Os(_) => "os",
            Handler::Compute(_) => "compute",
            #[cfg(test)]
            Handler::Probe(_) => "probe",
        }
    }
}
