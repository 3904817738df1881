#![deny(rustdoc::broken_intra_doc_links)]

//! A multi-part payment (MPP) sender and settlement engine that runs over a simulated lightning channel network.
//!
//! A payment is split into shards, each routed over its own [`route::Route`]. The [`payment::PaymentCoordinator`]
//! dispatches every shard concurrently through a [`payment::ShardDispatcher`] (the simulated network in
//! [`sim_node::SimGraph`]), the recipient's [`invoice::InvoiceRegistry`] holds shards until the full amount has
//! arrived and then releases the preimage to all of them at once, and [`results`] folds the per-shard outcomes into
//! one payment result and keeps the sender-side payment records.

use serde::{Deserialize, Serialize};
use std::fmt::Formatter;
use std::time::SystemTimeError;
use thiserror::Error;

pub mod batched_writer;
pub mod invoice;
pub mod latency_interceptor;
pub mod payment;
pub mod results;
pub mod route;
pub mod serializers;
pub mod sim_node;
#[cfg(test)]
mod test_utils;

/// Represents a short channel ID, expressed as a struct so that we can implement display for the trait.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortChannelID(u64);

/// Utility function to easily convert from u64 to `ShortChannelID`.
impl From<u64> for ShortChannelID {
    fn from(value: u64) -> Self {
        ShortChannelID(value)
    }
}

/// Utility function to easily convert `ShortChannelID` into u64.
impl From<ShortChannelID> for u64 {
    fn from(scid: ShortChannelID) -> Self {
        scid.0
    }
}

/// See <https://github.com/lightning/bolts/blob/60de4a09727c20dea330f9ee8313034de6e50594/07-routing-gossip.md#definition-of-short_channel_id>
impl std::fmt::Display for ShortChannelID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            (self.0 >> 40) as u32,
            ((self.0 >> 16) & 0xFFFFFF) as u32,
            (self.0 & 0xFFFF) as u16,
        )
    }
}

/// Represents errors that can occur while setting up or running the simulated network and its record keeping.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Error that occurred while writing CSV data.
    #[error("CSV Error: {0:?}")]
    CsvError(#[from] csv::Error),
    /// Error that occurred during file operations.
    #[error("File Error")]
    FileError,
    /// Error that occurred in the simulated network.
    #[error("Simulated Network Error: {0}")]
    SimulatedNetworkError(String),
    /// Error that occurred while accessing system time.
    #[error("System Time Error: {0}")]
    SystemTimeError(#[from] SystemTimeError),
    /// Error that occurred when a required node was not found.
    #[error("Missing Node Error: {0}")]
    MissingNodeError(String),
}
