use thiserror::Error;

/// Errors raised by the supervision core.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperviseError {
    /// No supervised command matches the requested fingerprint.
    #[error("no cmd found")]
    NoCmdFound,
    /// The per-child restart budget is exhausted until the next reset.
    #[error("restart limit reached")]
    LimitReached,
}
