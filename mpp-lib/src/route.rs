use crate::serializers;
use crate::ShortChannelID;
use bitcoin::secp256k1::PublicKey;
use lightning::ln::PaymentSecret;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// The final CLTV delta that routes are built with when the caller does not have a specific requirement, matching the
/// minimum final delta that receivers require by default.
pub const DEFAULT_FINAL_CLTV_DELTA: u32 = 40;

/// RouteError represents the ways that a route can be unusable before any htlc is sent over it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// A route must have at least one hop.
    #[error("EmptyRoute")]
    EmptyRoute,
    /// Zero value routes can't carry a htlc.
    #[error("ZeroAmount")]
    ZeroAmount,
    /// Only the final hop is allowed to learn about the multi-part payment that a shard belongs to.
    #[error("MppRecordOnIntermediateHop: hop {0}")]
    MppRecordOnIntermediateHop(usize),
    /// No channel connects two consecutive nodes in the route.
    #[error("NoChannel: {0} -> {1}")]
    NoChannel(PublicKey, PublicKey),
    /// The route's first channel is not known to the network.
    #[error("UnknownChannel: {0}")]
    UnknownChannel(ShortChannelID),
    /// The route's first channel does not connect the sending node to the first hop.
    #[error("FirstHopNotFromSource: channel {0} does not connect {1}")]
    FirstHopNotFromSource(ShortChannelID, PublicKey),
    /// Adding up the amounts or timelocks in the route overflowed.
    #[error("Overflow")]
    Overflow,
}

/// The multi-part payment record that is attached to the final hop of every shard of a payment. Intermediate hops
/// never see it, only the recipient uses it to group shards into a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MppRecord {
    /// Secret chosen by the recipient when it created the invoice, shared by every shard.
    #[serde(with = "serializers::serde_payment_secret")]
    pub payment_addr: PaymentSecret,
    /// The total amount of the logical payment that this shard is a part of.
    pub total_amt_msat: u64,
}

/// A single hop in a route. Amounts and timelocks follow the usual onion convention: for intermediate hops `fee_msat`
/// and `cltv_expiry_delta` are charged by this hop for using its *outgoing* channel; for the final hop they are the
/// amount and CLTV delta that the recipient should receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// The node that the htlc is delivered to over this hop.
    pub pubkey: PublicKey,
    /// The channel that the htlc is sent over to reach `pubkey`.
    pub short_channel_id: ShortChannelID,
    pub fee_msat: u64,
    pub cltv_expiry_delta: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpp_record: Option<MppRecord>,
}

/// An ordered list of hops that a single shard travels over, starting at the first hop after the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hops: Vec<RouteHop>,
}

impl Route {
    pub fn new(hops: Vec<RouteHop>) -> Self {
        Route { hops }
    }

    /// Returns the total fees paid to intermediate hops.
    pub fn fee_msat(&self) -> u64 {
        match self.hops.split_last() {
            Some((_, intermediate)) => intermediate.iter().map(|hop| hop.fee_msat).sum(),
            None => 0,
        }
    }

    /// Returns the amount delivered to the recipient.
    pub fn final_value_msat(&self) -> u64 {
        self.hops.last().map(|hop| hop.fee_msat).unwrap_or(0)
    }

    /// Returns the amount that the sender locks up on its outgoing channel: the delivered amount plus all fees.
    pub fn total_amount_msat(&self) -> u64 {
        self.fee_msat() + self.final_value_msat()
    }

    /// Returns the timelock on the sender's outgoing htlc, expressed relative to the current height.
    pub fn total_cltv_delta(&self) -> u32 {
        self.hops.iter().map(|hop| hop.cltv_expiry_delta).sum()
    }

    pub fn destination(&self) -> Option<PublicKey> {
        self.hops.last().map(|hop| hop.pubkey)
    }

    pub fn mpp_record(&self) -> Option<&MppRecord> {
        self.hops.last().and_then(|hop| hop.mpp_record.as_ref())
    }

    /// Sets the mpp record on the final hop, replacing any record already present.
    pub fn attach_mpp_record(&mut self, record: MppRecord) -> Result<(), RouteError> {
        let last = self.hops.last_mut().ok_or(RouteError::EmptyRoute)?;
        last.mpp_record = Some(record);
        Ok(())
    }

    /// Checks that a route is usable: it must have hops, deliver a non-zero amount, only carry an mpp record on its
    /// final hop and have amounts and timelocks that can be summed.
    pub fn validate(&self) -> Result<(), RouteError> {
        let (_, intermediate) = self.hops.split_last().ok_or(RouteError::EmptyRoute)?;

        if self.final_value_msat() == 0 {
            return Err(RouteError::ZeroAmount);
        }

        if let Some(i) = intermediate.iter().position(|hop| hop.mpp_record.is_some()) {
            return Err(RouteError::MppRecordOnIntermediateHop(i));
        }

        self.hops
            .iter()
            .try_fold(0u64, |acc, hop| acc.checked_add(hop.fee_msat))
            .ok_or(RouteError::Overflow)?;

        self.hops
            .iter()
            .try_fold(0u32, |acc, hop| acc.checked_add(hop.cltv_expiry_delta))
            .ok_or(RouteError::Overflow)?;

        Ok(())
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let channels = self
            .hops
            .iter()
            .map(|hop| hop.short_channel_id.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");

        write!(
            f,
            "{} msat (fees {} msat) over [{}]",
            self.final_value_msat(),
            self.fee_msat(),
            channels
        )
    }
}
