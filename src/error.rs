//! Public error type.
//!
//! A small `thiserror` enum for the handful of failures that legitimately
//! cross the public API boundary. Everything else (transport-remote
//! timeouts, parse failures, safety-rejects, per-stage enrichment failures)
//! is absorbed internally and never becomes a `DiscoveryError`.

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    /// A request failed validation; the caller should treat this the same
    /// way it would treat any other invalid-input error (e.g. HTTP 400).
    #[error("invalid discovery request: {0}")]
    InvalidRequest(String),

    /// A transport could not even be constructed (e.g. every multicast
    /// socket failed to bind). Non-fatal at the engine level but fatal for a
    /// single `discover()` call that selected only that protocol.
    #[error("transport setup failed: {0:#}")]
    Transport(#[source] anyhow::Error),
}

pub type Result<T> = core::result::Result<T, DiscoveryError>;
