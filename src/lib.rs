//! Passive/active network discovery across SSDP/UPnP, mDNS/DNS-SD,
//! WS-Discovery, MQTT, and CoAP, plus a post-discovery enrichment pipeline
//! that turns raw protocol chatter into a best-effort device fingerprint.
//!
//! [`orchestrator::discover`] is the single entry point; everything below
//! `engines` and `enrich` is reachable from there but can also be driven
//! directly by a caller that only wants one protocol.

pub mod engines;
pub mod enrich;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod safety;
pub mod transport;

pub use error::{DiscoveryError, Result};
pub use model::{DiscoveryRequest, DiscoveryResponse, Protocol};
pub use orchestrator::discover;
