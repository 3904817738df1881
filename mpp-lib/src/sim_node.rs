use crate::invoice::{AcceptDecision, AcceptRequest, HoldFailure, HtlcResolution, InvoiceRegistry};
use crate::payment::{FailureReason, HtlcAttempt, Shard, ShardDispatcher};
use crate::route::{Route, RouteError, RouteHop};
use crate::{ShortChannelID, SimulationError};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use lightning::ln::{PaymentHash, PaymentPreimage};
use serde::{Deserialize, Serialize};
use std::collections::{hash_map::Entry, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, timeout_at, Instant};
use triggered::{Listener, Trigger};

/// ForwardingError represents the various errors that we can run into when forwarding payments in a simulated network.
/// Since we're not using real lightning nodes, these errors are not obfuscated and can be propagated to the sending
/// node and used for analysis.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
pub enum ForwardingError {
    /// Zero amount htlcs are invalid in the protocol.
    #[error("ZeroAmountHtlc")]
    ZeroAmountHtlc,
    /// The outgoing channel id was not found in the network graph.
    #[error("ChannelNotFound: {0}")]
    ChannelNotFound(ShortChannelID),
    /// The outgoing channel is disabled, so the peer on the other end is unreachable.
    #[error("ChannelDisabled: {0}")]
    ChannelDisabled(ShortChannelID),
    /// The node pubkey provided was not associated with the channel in the network graph.
    #[error("NodeNotFound: {0:?}")]
    NodeNotFound(PublicKey),
    /// An in-flight htlc with the index provided could not be found to resolve.
    #[error("HtlcNotFound: index {0}")]
    HtlcNotFound(u64),
    /// The forwarding node did not have sufficient outgoing balance to forward the htlc (htlc amount / balance).
    #[error("InsufficientBalance: amount: {0} > balance: {1}")]
    InsufficientBalance(u64, u64),
    /// The htlc forwarded is less than the channel's advertised minimum htlc amount (htlc amount / minimum).
    #[error("LessThanMinimum: amount: {0} < minimum: {1}")]
    LessThanMinimum(u64, u64),
    /// The htlc forwarded is more than the channel's advertised maximum htlc amount (htlc amount / maximum).
    #[error("MoreThanMaximum: amount: {0} > maximum: {1}")]
    MoreThanMaximum(u64, u64),
    /// The channel has reached its maximum allowable number of htlcs in flight (total in flight / maximim).
    #[error("ExceedsInFlightCount: total in flight: {0} > maximum count: {1}")]
    ExceedsInFlightCount(u64, u64),
    /// The forwarded htlc's amount would push the channel over its maximum allowable in flight total
    /// (total in flight / maximum).
    #[error("ExceedsInFlightTotal: total in flight amount: {0} > maximum amount: {1}")]
    ExceedsInFlightTotal(u64, u64),
    /// The forwarded htlc's cltv expiry exceeds the maximum value used to express block heights in Bitcoin.
    #[error("ExpiryInSeconds: cltv expressed in seconds: {0}")]
    ExpiryInSeconds(u32, u32),
    /// The forwarded htlc has insufficient cltv delta for the channel's minimum delta (cltv delta / minimum).
    #[error("InsufficientCltvDelta: cltv delta: {0} < required: {1}")]
    InsufficientCltvDelta(u32, u32),
    /// The forwarded htlc has insufficient fee for the channel's policy (fee / expected fee / base fee / prop fee).
    #[error("InsufficientFee: offered fee: {0} (base: {1}, prop: {2}) < expected: {3}")]
    InsufficientFee(u64, u64, u64, u64),
    /// The fee policy for a htlc amount would overflow with the given fee policy (htlc amount / base fee / prop fee).
    #[error("FeeOverflow: htlc amount: {0} (base: {1}, prop: {2})")]
    FeeOverflow(u64, u64, u64),
    /// Sanity check on channel balances failed (node balances / channel capacity).
    #[error("SanityCheckFailed: node balance: {0} != capacity: {1}")]
    SanityCheckFailed(u64, u64),
    /// The shard's deadline passed while the htlc was waiting to be forwarded over the channel.
    #[error("HtlcExpired: waiting to forward over {0}")]
    HtlcExpired(ShortChannelID),
    /// An interceptor instructed the forwarding node to fail the htlc.
    #[error("InterceptorFailure: {0}")]
    InterceptorFailure(String),
}

impl ForwardingError {
    /// Returns a boolean indicating whether failure to forward a htlc is a critical error that warrants shutdown.
    fn is_critical(&self) -> bool {
        matches!(
            self,
            ForwardingError::ZeroAmountHtlc
                | ForwardingError::ChannelNotFound(_)
                | ForwardingError::NodeNotFound(_)
                | ForwardingError::HtlcNotFound(_)
                | ForwardingError::SanityCheckFailed(_, _)
                | ForwardingError::FeeOverflow(_, _, _)
        )
    }
}

/// Represents an in-flight htlc that has been forwarded over a channel that is awaiting resolution. Shards of one
/// multi-part payment share a payment hash, so htlcs are tracked by their index on the channel rather than by hash.
#[derive(Copy, Clone, Debug)]
struct Htlc {
    payment_hash: PaymentHash,
    amount_msat: u64,
    cltv_expiry: u32,
}

/// Identifies a htlc by the channel it was added to and its index on the sending side of that channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HtlcRef {
    pub channel_id: ShortChannelID,
    pub index: u64,
}

impl Display for HtlcRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.index)
    }
}

/// Represents one node in the channel's forwarding policy and restrictions. Note that this doesn't directly map to
/// a single concept in the protocol, a few things have been combined for the sake of simplicity. Used to manage the
/// lightning "state machine" and check that HTLCs are added in accordance of the advertised policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub pubkey: PublicKey,
    pub max_htlc_count: u64,
    pub max_in_flight_msat: u64,
    pub min_htlc_size_msat: u64,
    pub max_htlc_size_msat: u64,
    pub cltv_expiry_delta: u32,
    pub base_fee: u64,
    pub fee_rate_prop: u64,
}

impl ChannelPolicy {
    /// Validates that the channel policy is acceptable for the size of the channel.
    fn validate(&self, capacity_msat: u64) -> Result<(), SimulationError> {
        if self.max_in_flight_msat > capacity_msat {
            return Err(SimulationError::SimulatedNetworkError(format!(
                "max_in_flight_msat {} > capacity {}",
                self.max_in_flight_msat, capacity_msat
            )));
        }
        if self.max_htlc_size_msat > capacity_msat {
            return Err(SimulationError::SimulatedNetworkError(format!(
                "max_htlc_size_msat {} > capacity {}",
                self.max_htlc_size_msat, capacity_msat
            )));
        }
        Ok(())
    }

    /// Returns the fee that this policy charges to forward the amount provided.
    pub fn fee_for(&self, amount_msat: u64) -> Result<u64, ForwardingError> {
        amount_msat
            .checked_mul(self.fee_rate_prop)
            .and_then(|prop_fee| (prop_fee / 1_000_000).checked_add(self.base_fee))
            .ok_or(ForwardingError::FeeOverflow(
                amount_msat,
                self.base_fee,
                self.fee_rate_prop,
            ))
    }
}

/// Fails with the forwarding error provided if the value provided fails its inequality check.
macro_rules! fail_forwarding_inequality {
    ($value_1:expr, $op:tt, $value_2:expr, $error_variant:ident $(, $opt:expr)*) => {
        if $value_1 $op $value_2 {
            return Err(ForwardingError::$error_variant(
                    $value_1,
                    $value_2
                    $(
                        , $opt
                    )*
             ));
        }
    };
}

/// The internal state of one side of a simulated channel, including its forwarding parameters. This struct is
/// primarily responsible for handling our view of what's currently in-flight on the channel, and how much
/// liquidity we have.
#[derive(Clone, Debug)]
struct ChannelState {
    local_balance_msat: u64,
    in_flight: HashMap<u64, Htlc>,
    /// The index that will be assigned to the next outgoing htlc, never reused.
    next_index: u64,
    policy: ChannelPolicy,
}

impl ChannelState {
    /// Creates a new channel with local liquidity as allocated by the caller. The responsibility of ensuring that the
    /// local balance of each side of the channel equals its total capacity is on the caller, as we are only dealing
    /// with a one-sided view of the channel's state.
    fn new(policy: ChannelPolicy, local_balance_msat: u64) -> Self {
        ChannelState {
            local_balance_msat,
            in_flight: HashMap::new(),
            next_index: 0,
            policy,
        }
    }

    /// Returns the sum of all the *in flight outgoing* HTLCs on the channel.
    fn in_flight_total(&self) -> u64 {
        self.in_flight.values().map(|h| h.amount_msat).sum()
    }

    /// Checks whether the proposed HTLC abides by the channel policy advertised for using this channel as the
    /// *outgoing* link in a forward.
    fn check_htlc_forward(
        &self,
        cltv_delta: u32,
        amt: u64,
        fee: u64,
    ) -> Result<(), ForwardingError> {
        fail_forwarding_inequality!(cltv_delta, <, self.policy.cltv_expiry_delta, InsufficientCltvDelta);

        let expected_fee = self.policy.fee_for(amt)?;
        fail_forwarding_inequality!(
            fee, <, expected_fee, InsufficientFee, self.policy.base_fee, self.policy.fee_rate_prop
        );

        Ok(())
    }

    /// Checks whether the proposed HTLC can be added to the channel as an outgoing HTLC. This requires that we have
    /// sufficient liquidity, and that the restrictions on our in flight htlc balance and count are not violated by
    /// the addition of the HTLC. Specification sanity checks (such as reasonable CLTV) are also included, as this
    /// is where we'd check it in real life.
    fn check_outgoing_addition(&self, htlc: &Htlc) -> Result<(), ForwardingError> {
        fail_forwarding_inequality!(htlc.amount_msat, >, self.policy.max_htlc_size_msat, MoreThanMaximum);
        fail_forwarding_inequality!(htlc.amount_msat, <, self.policy.min_htlc_size_msat, LessThanMinimum);
        fail_forwarding_inequality!(
            self.in_flight.len() as u64 + 1, >, self.policy.max_htlc_count, ExceedsInFlightCount
        );
        fail_forwarding_inequality!(
            self.in_flight_total() + htlc.amount_msat, >, self.policy.max_in_flight_msat, ExceedsInFlightTotal
        );
        fail_forwarding_inequality!(htlc.amount_msat, >, self.local_balance_msat, InsufficientBalance);
        fail_forwarding_inequality!(htlc.cltv_expiry, >, 500000000, ExpiryInSeconds);

        Ok(())
    }

    /// Adds the HTLC to our set of outgoing in-flight HTLCs, returning the index it was assigned. Local balance is
    /// decreased by the HTLC amount, as this liquidity is no longer available. Any number of htlcs may share a
    /// payment hash, which is what allows several shards of one payment to travel over the same channel.
    fn add_outgoing_htlc(&mut self, htlc: Htlc) -> Result<u64, ForwardingError> {
        self.check_outgoing_addition(&htlc)?;

        let index = self.next_index;
        self.next_index += 1;
        self.local_balance_msat -= htlc.amount_msat;
        self.in_flight.insert(index, htlc);

        Ok(index)
    }

    /// Removes the HTLC from our set of outgoing in-flight HTLCs, failing if the index is not found.
    fn remove_outgoing_htlc(&mut self, index: u64) -> Result<Htlc, ForwardingError> {
        self.in_flight
            .remove(&index)
            .ok_or(ForwardingError::HtlcNotFound(index))
    }

    // Updates channel state to account for the resolution of an outgoing in-flight HTLC. If the HTLC failed, the
    // balance is failed back to the channel's local balance. If not, the in-flight balance is settled to the other
    // node, so there is no operation.
    fn settle_outgoing_htlc(&mut self, amt: u64, success: bool) {
        if !success {
            self.local_balance_msat += amt
        }
    }

    // Updates channel state to account for the resolution of an incoming in-flight HTLC. If the HTLC succeeded,
    // the balance is settled to the channel's local balance. If not, the in-flight balance is failed back to the
    // other node, so there is no operation.
    fn settle_incoming_htlc(&mut self, amt: u64, success: bool) {
        if success {
            self.local_balance_msat += amt
        }
    }
}

/// Represents a simulated channel, and is responsible for managing addition and removal of HTLCs from the channel and
/// sanity checks. Channel state is tracked *unidirectionally* for each participant in the channel.
///
/// Each node represented in the channel tracks only its outgoing HTLCs, and balance is transferred between the two
/// nodes as they settle or fail. Given some channel: node_1 <----> node_2:
/// * HTLC sent node_1 -> node_2: added to in-flight outgoing htlcs on node_1.
/// * HTLC sent node_2 -> node_1: added to in-flight outgoing htlcs on node_2.
///
/// Rules for managing balance are as follows:
/// * When an HTLC is in flight, the channel's local outgoing liquidity decreases (as it's locked up).
/// * When an HTLC fails, the balance is returned to the local node (the one that it was in-flight / outgoing on).
/// * When an HTLC succeeds, the balance is sent to the remote node (the one that did not track it as in-flight).
///
/// With each state transition, the simulated channel checks that the sum of its local balances and in-flight equal the
/// total channel capacity. Failure of this sanity check represents a critical failure in the state machine.
#[derive(Clone, Debug)]
pub struct SimulatedChannel {
    capacity_msat: u64,
    short_channel_id: ShortChannelID,
    /// Disabled channels refuse new htlcs but still resolve the ones already in flight.
    enabled: bool,
    node_1: ChannelState,
    node_2: ChannelState,
}

impl SimulatedChannel {
    /// Creates a new channel with the capacity and policies provided. The total capacity of the channel is evenly split
    /// between the channel participants (this is an arbitrary decision).
    pub fn new(
        capacity_msat: u64,
        short_channel_id: ShortChannelID,
        node_1: ChannelPolicy,
        node_2: ChannelPolicy,
    ) -> Self {
        SimulatedChannel {
            capacity_msat,
            short_channel_id,
            enabled: true,
            node_1: ChannelState::new(node_1, capacity_msat / 2),
            node_2: ChannelState::new(node_2, capacity_msat - capacity_msat / 2),
        }
    }

    /// Creates a new channel where node_1 holds the balance provided and node_2 holds the remainder of the capacity,
    /// for example a freshly opened channel where all funds sit with the opener.
    pub fn new_with_balance(
        capacity_msat: u64,
        short_channel_id: ShortChannelID,
        node_1: ChannelPolicy,
        node_2: ChannelPolicy,
        node_1_balance_msat: u64,
    ) -> Result<Self, SimulationError> {
        if node_1_balance_msat > capacity_msat {
            return Err(SimulationError::SimulatedNetworkError(format!(
                "node_1 balance {node_1_balance_msat} > capacity {capacity_msat} for {short_channel_id}"
            )));
        }

        Ok(SimulatedChannel {
            capacity_msat,
            short_channel_id,
            enabled: true,
            node_1: ChannelState::new(node_1, node_1_balance_msat),
            node_2: ChannelState::new(node_2, capacity_msat - node_1_balance_msat),
        })
    }

    pub fn short_channel_id(&self) -> ShortChannelID {
        self.short_channel_id
    }

    /// Returns the local balances of (node_1, node_2).
    pub fn balances(&self) -> (u64, u64) {
        (self.node_1.local_balance_msat, self.node_2.local_balance_msat)
    }

    /// Returns the number of htlcs in flight in both directions.
    pub fn in_flight_count(&self) -> usize {
        self.node_1.in_flight.len() + self.node_2.in_flight.len()
    }

    /// Returns true if this channel connects the two nodes provided, in either direction.
    fn connects(&self, a: &PublicKey, b: &PublicKey) -> bool {
        let (n1, n2) = (&self.node_1.policy.pubkey, &self.node_2.policy.pubkey);
        (n1 == a && n2 == b) || (n1 == b && n2 == a)
    }

    /// Validates that a simulated channel has distinct node pairs and valid routing policies.
    fn validate(&self) -> Result<(), SimulationError> {
        if self.node_1.policy.pubkey == self.node_2.policy.pubkey {
            return Err(SimulationError::SimulatedNetworkError(format!(
                "Channel should have distinct node pubkeys, got: {} for both nodes.",
                self.node_1.policy.pubkey
            )));
        }

        self.node_1.policy.validate(self.capacity_msat)?;
        self.node_2.policy.validate(self.capacity_msat)?;

        Ok(())
    }

    fn get_node_mut(&mut self, pubkey: &PublicKey) -> Result<&mut ChannelState, ForwardingError> {
        if pubkey == &self.node_1.policy.pubkey {
            Ok(&mut self.node_1)
        } else if pubkey == &self.node_2.policy.pubkey {
            Ok(&mut self.node_2)
        } else {
            Err(ForwardingError::NodeNotFound(*pubkey))
        }
    }

    fn get_node(&self, pubkey: &PublicKey) -> Result<&ChannelState, ForwardingError> {
        if pubkey == &self.node_1.policy.pubkey {
            Ok(&self.node_1)
        } else if pubkey == &self.node_2.policy.pubkey {
            Ok(&self.node_2)
        } else {
            Err(ForwardingError::NodeNotFound(*pubkey))
        }
    }

    /// Adds an htlc to the appropriate side of the simulated channel, checking its policy and balance are okay. The
    /// public key of the node sending the HTLC (ie, the party that would send update_add_htlc in the protocol)
    /// must be provided to add the outgoing htlc to its side of the channel. Returns the index of the new htlc.
    fn add_htlc(&mut self, sending_node: &PublicKey, htlc: Htlc) -> Result<u64, ForwardingError> {
        if !self.enabled {
            return Err(ForwardingError::ChannelDisabled(self.short_channel_id));
        }

        if htlc.amount_msat == 0 {
            return Err(ForwardingError::ZeroAmountHtlc);
        }

        let index = self.get_node_mut(sending_node)?.add_outgoing_htlc(htlc)?;
        self.sanity_check()?;

        Ok(index)
    }

    /// Performs a sanity check on the total balances in a channel. Note that we do not currently include on-chain
    /// fees or reserve so these values should exactly match.
    fn sanity_check(&self) -> Result<(), ForwardingError> {
        let node_1_total = self.node_1.local_balance_msat + self.node_1.in_flight_total();
        let node_2_total = self.node_2.local_balance_msat + self.node_2.in_flight_total();

        fail_forwarding_inequality!(node_1_total + node_2_total, !=, self.capacity_msat, SanityCheckFailed);

        Ok(())
    }

    /// Removes an htlc from the appropriate side of the simulated channel, settling balances across channel sides
    /// based on the success of the htlc. The public key of the node that originally sent the HTLC must be provided
    /// to remove the htlc from its side of the channel.
    fn remove_htlc(
        &mut self,
        sending_node: &PublicKey,
        index: u64,
        success: bool,
    ) -> Result<Htlc, ForwardingError> {
        let htlc = self.get_node_mut(sending_node)?.remove_outgoing_htlc(index)?;
        self.settle_htlc(sending_node, htlc.amount_msat, success)?;
        self.sanity_check()?;

        log::trace!(
            "Resolved htlc {}:{index} for payment {} (success: {success}).",
            self.short_channel_id,
            hex::encode(htlc.payment_hash.0)
        );

        Ok(htlc)
    }

    /// Updates the local balance of each node in the channel once a htlc has been resolved, pushing funds to the
    /// receiving nodes in the case of a successful payment and returning balance to the sender in the case of a
    /// failure.
    fn settle_htlc(
        &mut self,
        sending_node: &PublicKey,
        amount_msat: u64,
        success: bool,
    ) -> Result<(), ForwardingError> {
        if sending_node == &self.node_1.policy.pubkey {
            self.node_1.settle_outgoing_htlc(amount_msat, success);
            self.node_2.settle_incoming_htlc(amount_msat, success);
            Ok(())
        } else if sending_node == &self.node_2.policy.pubkey {
            self.node_2.settle_outgoing_htlc(amount_msat, success);
            self.node_1.settle_incoming_htlc(amount_msat, success);
            Ok(())
        } else {
            Err(ForwardingError::NodeNotFound(*sending_node))
        }
    }

    /// Checks an htlc forward against the outgoing policy of the node provided.
    fn check_htlc_forward(
        &self,
        forwarding_node: &PublicKey,
        cltv_delta: u32,
        amount_msat: u64,
        fee_msat: u64,
    ) -> Result<(), ForwardingError> {
        self.get_node(forwarding_node)?
            .check_htlc_forward(cltv_delta, amount_msat, fee_msat)
    }
}

/// Implemented by HTLC interceptors that get a say in every forward (and final delivery) in the simulated network.
/// Interceptors may delay a htlc by taking their time to return, or fail it by returning an error.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept_htlc(&self, req: InterceptRequest) -> Result<(), ForwardingError>;

    /// Returns an identifying name for the interceptor for logging, does not need to be unique.
    fn name(&self) -> String;
}

/// Request sent to an interceptor describing the htlc that a node has just received.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
    /// The node that is forwarding (or receiving) this HTLC.
    pub forwarding_node: PublicKey,

    /// The payment hash for the htlc (note that this is not unique, shards of a payment share it).
    pub payment_hash: PaymentHash,

    /// The htlc that was delivered to the forwarding node.
    pub incoming_htlc: HtlcRef,

    /// The short channel id for the outgoing channel that this htlc should be forwarded over, None if the forwarding
    /// node is the recipient.
    pub outgoing_channel_id: Option<ShortChannelID>,

    pub incoming_amount_msat: u64,
    pub outgoing_amount_msat: u64,
    pub incoming_cltv_expiry: u32,
    pub outgoing_cltv_expiry: u32,

    /// Triggered when the simulation is shutting down, interceptors should exit promptly.
    pub shutdown_listener: Listener,
}

impl Display for InterceptRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "htlc forwarded by {} over {} {} forward amounts {} {}",
            self.forwarding_node,
            self.incoming_htlc,
            {
                if let Some(c) = self.outgoing_channel_id {
                    format!("-> {c}")
                } else {
                    "receive".to_string()
                }
            },
            self.incoming_amount_msat,
            self.outgoing_amount_msat
        )
    }
}

/// SimGraph is the simulated network that shards are dispatched over. It owns the state of every channel, knows which
/// nodes can receive payments (the nodes that have an invoice registry) and is responsible for propagating htlcs hop
/// by hop, handing them to the recipient and resolving them once the recipient has made its decision.
pub struct SimGraph {
    /// nodes caches the list of nodes in the network with a vector of their channel capacities, only used for quick
    /// lookup.
    nodes: HashMap<PublicKey, Vec<u64>>,

    /// channels maps the scid of a channel to its current simulation state.
    channels: Arc<Mutex<HashMap<ShortChannelID, SimulatedChannel>>>,

    /// The invoice registries of nodes that can receive payments.
    receivers: HashMap<PublicKey, Arc<InvoiceRegistry>>,

    /// Interceptors consulted for every hop that a htlc takes.
    interceptors: Vec<Arc<dyn Interceptor>>,

    /// trigger shutdown if a critical error occurs.
    shutdown_trigger: Trigger,

    /// notified when shutdown is triggered, so that held htlcs are released.
    shutdown_listener: Listener,
}

impl SimGraph {
    /// Creates a graph on which to simulate payments.
    pub fn new(
        graph_channels: Vec<SimulatedChannel>,
        shutdown_trigger: Trigger,
        shutdown_listener: Listener,
    ) -> Result<Self, SimulationError> {
        let mut nodes: HashMap<PublicKey, Vec<u64>> = HashMap::new();
        let mut channels = HashMap::new();

        for channel in graph_channels.iter() {
            // Assert that the channel is valid and that its short channel ID is unique within the simulation, required
            // because we use scid to identify the channel.
            channel.validate()?;
            match channels.entry(channel.short_channel_id) {
                Entry::Occupied(_) => {
                    return Err(SimulationError::SimulatedNetworkError(format!(
                        "Simulated short channel ID should be unique: {} duplicated",
                        channel.short_channel_id
                    )))
                },
                Entry::Vacant(v) => v.insert(channel.clone()),
            };

            // It's okay to have duplicate pubkeys because one node can have many channels.
            for pubkey in [channel.node_1.policy.pubkey, channel.node_2.policy.pubkey] {
                match nodes.entry(pubkey) {
                    Entry::Occupied(o) => o.into_mut().push(channel.capacity_msat),
                    Entry::Vacant(v) => {
                        v.insert(vec![channel.capacity_msat]);
                    },
                }
            }
        }

        Ok(SimGraph {
            nodes,
            channels: Arc::new(Mutex::new(channels)),
            receivers: HashMap::new(),
            interceptors: Vec::new(),
            shutdown_trigger,
            shutdown_listener,
        })
    }

    /// Registers the invoice registry that handles htlcs delivered to the node that the registry belongs to.
    pub fn add_receiver(&mut self, registry: Arc<InvoiceRegistry>) -> Result<(), SimulationError> {
        let node = registry.node();
        if !self.nodes.contains_key(&node) {
            return Err(SimulationError::MissingNodeError(format!(
                "receiver {node} has no channels in the graph"
            )));
        }

        if self.receivers.insert(node, registry).is_some() {
            return Err(SimulationError::SimulatedNetworkError(format!(
                "receiver {node} registered twice"
            )));
        }

        Ok(())
    }

    pub fn add_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        log::debug!("Adding interceptor {} to simulated graph.", interceptor.name());
        self.interceptors.push(interceptor);
    }

    /// Returns the capacities of the channels that the node has in the graph.
    pub fn node_capacities(&self, node: &PublicKey) -> Option<&[u64]> {
        self.nodes.get(node).map(|c| c.as_slice())
    }

    /// Enables or disables a channel. Disabled channels refuse to forward new htlcs, as if the peer were offline.
    pub async fn set_channel_enabled(
        &self,
        scid: ShortChannelID,
        enabled: bool,
    ) -> Result<(), SimulationError> {
        match self.channels.lock().await.get_mut(&scid) {
            Some(channel) => {
                channel.enabled = enabled;
                log::info!("Channel {scid} enabled: {enabled}.");
                Ok(())
            },
            None => Err(SimulationError::SimulatedNetworkError(format!(
                "channel {scid} not found"
            ))),
        }
    }

    /// Returns a snapshot of the channel's current state.
    pub async fn channel(&self, scid: ShortChannelID) -> Option<SimulatedChannel> {
        self.channels.lock().await.get(&scid).cloned()
    }

    /// Builds a route delivering `amount_msat` from the source over the hops provided (in order, ending at the
    /// recipient). When several channels connect two hops the one with the lowest short channel id is used. Fees and
    /// CLTV deltas are computed backwards from the recipient using the forwarding policies of each intermediate node.
    pub async fn build_route(
        &self,
        source: &PublicKey,
        amount_msat: u64,
        final_cltv_delta: u32,
        hops: &[PublicKey],
    ) -> Result<Route, RouteError> {
        if hops.is_empty() {
            return Err(RouteError::EmptyRoute);
        }

        if amount_msat == 0 {
            return Err(RouteError::ZeroAmount);
        }

        let channels = self.channels.lock().await;

        let mut scids = Vec::with_capacity(hops.len());
        let mut previous = source;
        for hop in hops {
            let scid = channels
                .values()
                .filter(|c| c.connects(previous, hop))
                .map(|c| c.short_channel_id)
                .min()
                .ok_or(RouteError::NoChannel(*previous, *hop))?;

            scids.push(scid);
            previous = hop;
        }

        // Walk backwards from the recipient: each intermediate hop charges its fee on the amount that it forwards.
        let mut route_hops = Vec::with_capacity(hops.len());
        let mut forward_amount = amount_msat;
        for (i, pubkey) in hops.iter().enumerate().rev() {
            let (fee_msat, cltv_expiry_delta) = if i == hops.len() - 1 {
                (amount_msat, final_cltv_delta)
            } else {
                let policy = &channels
                    .get(&scids[i + 1])
                    .and_then(|c| c.get_node(pubkey).ok())
                    .ok_or(RouteError::NoChannel(*pubkey, hops[i + 1]))?
                    .policy;

                let fee = policy.fee_for(forward_amount).map_err(|_| RouteError::Overflow)?;
                forward_amount = forward_amount.checked_add(fee).ok_or(RouteError::Overflow)?;

                (fee, policy.cltv_expiry_delta)
            };

            route_hops.push(RouteHop {
                pubkey: *pubkey,
                short_channel_id: scids[i],
                fee_msat,
                cltv_expiry_delta,
                mpp_record: None,
            });
        }

        route_hops.reverse();
        let route = Route::new(route_hops);
        route.validate()?;

        Ok(route)
    }

    /// Checks that a shard can be sent at all: its route is well formed and its first hop leaves the source node.
    async fn check_first_hop(&self, source: &PublicKey, route: &Route) -> Result<(), RouteError> {
        route.validate()?;

        let first = &route.hops[0];
        match self.channels.lock().await.get(&first.short_channel_id) {
            Some(channel) if channel.connects(source, &first.pubkey) => Ok(()),
            Some(_) => Err(RouteError::FirstHopNotFromSource(
                first.short_channel_id,
                *source,
            )),
            None => Err(RouteError::UnknownChannel(first.short_channel_id)),
        }
    }
}

#[async_trait]
impl ShardDispatcher for SimGraph {
    async fn check_route(&self, source: PublicKey, route: &Route) -> Result<(), RouteError> {
        self.check_first_hop(&source, route).await
    }

    /// Sends the shard's htlc over its route and waits until the recipient settles or fails it (or the shard's
    /// deadline passes), then resolves the htlcs along the route accordingly.
    async fn send_shard(&self, source: PublicKey, shard: Shard) -> HtlcAttempt {
        let attempt_time = SystemTime::now();
        let deadline = Instant::now() + shard.expiry;

        if let Err(e) = self.check_first_hop(&source, &shard.route).await {
            log::debug!(
                "Shard {} for payment {} failed locally: {e}",
                shard.shard_index,
                hex::encode(shard.payment_hash.0)
            );
            return HtlcAttempt::new(
                shard,
                Err(FailureReason::LocalFailure(e.to_string())),
                attempt_time,
            );
        }

        let receiver = shard
            .route
            .destination()
            .and_then(|dest| self.receivers.get(&dest).cloned());

        let outcome = propagate_shard(PropagateShardRequest {
            channels: self.channels.clone(),
            source,
            route: &shard.route,
            payment_hash: shard.payment_hash,
            deadline,
            receiver,
            interceptors: &self.interceptors,
            listener: self.shutdown_listener.clone(),
            shutdown: self.shutdown_trigger.clone(),
        })
        .await;

        HtlcAttempt::new(shard, outcome, attempt_time)
    }
}

/// The htlcs that were locked in along a route, and the terms of the htlc delivered to the recipient.
struct LockedInRoute {
    htlcs: Vec<HtlcRef>,
    final_amount_msat: u64,
    final_cltv_expiry: u32,
}

/// Adds htlcs to the simulation state along the route provided. On failure, returns the htlcs that were successfully
/// added (which need to be failed back) along with the forwarding error.
///
/// For each hop in the route, we check both the addition of the HTLC and whether we can forward it. Take an example
/// route A --> B --> C, we will add this in two hops: A --> B then B -->C. For each hop, using A --> B as an example:
/// * Check whether A can add the outgoing HTLC (checks liquidity and in-flight restrictions).
///   * If no, fail the HTLC.
///   * If yes, add outgoing HTLC to A's channel.
/// * Check whether B will accept the forward.
///   * If no, fail the HTLC.
///   * If yes, consult interceptors and continue to the next hop.
///
/// Waiting on interceptors is bounded by the shard's deadline.
async fn add_htlcs(
    channels: Arc<Mutex<HashMap<ShortChannelID, SimulatedChannel>>>,
    source: PublicKey,
    route: &Route,
    payment_hash: PaymentHash,
    interceptors: &[Arc<dyn Interceptor>],
    deadline: Instant,
    listener: Listener,
) -> Result<LockedInRoute, (Vec<HtlcRef>, ForwardingError)> {
    let mut outgoing_node = source;
    let mut outgoing_amount = route.total_amount_msat();
    let mut outgoing_cltv = route.total_cltv_delta();

    let mut added: Vec<HtlcRef> = Vec::with_capacity(route.hops.len());
    let last_hop = route.hops.len() - 1;

    for (i, hop) in route.hops.iter().enumerate() {
        let next_scid = (i != last_hop).then(|| route.hops[i + 1].short_channel_id);

        // Lock the channels one hop at a time (rather than for the whole route) so that shards of the same payment
        // interleave on shared channels the way they would in a real network.
        let incoming_htlc = {
            let mut node_lock = channels.lock().await;

            let index = match node_lock.get_mut(&hop.short_channel_id) {
                Some(channel) => channel.add_htlc(
                    &outgoing_node,
                    Htlc {
                        payment_hash,
                        amount_msat: outgoing_amount,
                        cltv_expiry: outgoing_cltv,
                    },
                ),
                None => Err(ForwardingError::ChannelNotFound(hop.short_channel_id)),
            };

            // If we couldn't add this HTLC, only the htlcs added so far need failing back.
            let htlc_ref = match index {
                Ok(index) => HtlcRef {
                    channel_id: hop.short_channel_id,
                    index,
                },
                Err(e) => return Err((added, e)),
            };
            added.push(htlc_ref);

            // Once we've added the HTLC on this hop's channel, we want to check whether it has sufficient fee and CLTV
            // delta per the _next_ channel's policy (because fees and CLTV delta in LN are charged on the outgoing
            // link).
            if let Some(next) = next_scid {
                if let Some(channel) = node_lock.get(&next) {
                    if let Err(e) = channel.check_htlc_forward(
                        &hop.pubkey,
                        hop.cltv_expiry_delta,
                        outgoing_amount - hop.fee_msat,
                        hop.fee_msat,
                    ) {
                        return Err((added, e));
                    }
                }
            }

            htlc_ref
        };

        // The channel lock is released before we wait on interceptors, which may hold the htlc for some time.
        let (forward_amount, forward_cltv) = match next_scid {
            Some(_) => (
                outgoing_amount - hop.fee_msat,
                outgoing_cltv - hop.cltv_expiry_delta,
            ),
            None => (outgoing_amount, outgoing_cltv),
        };

        for interceptor in interceptors.iter() {
            let request = InterceptRequest {
                forwarding_node: hop.pubkey,
                payment_hash,
                incoming_htlc,
                outgoing_channel_id: next_scid,
                incoming_amount_msat: outgoing_amount,
                outgoing_amount_msat: forward_amount,
                incoming_cltv_expiry: outgoing_cltv,
                outgoing_cltv_expiry: forward_cltv,
                shutdown_listener: listener.clone(),
            };

            log::trace!("Sending HTLC to interceptor: {} {request}", interceptor.name());

            match timeout_at(deadline, interceptor.intercept_htlc(request)).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => return Err((added, e)),
                Err(_) => return Err((added, ForwardingError::HtlcExpired(hop.short_channel_id))),
            }
        }

        // Once we've taken the "hop" to the destination pubkey, it becomes the source of the next outgoing htlc.
        outgoing_node = hop.pubkey;
        outgoing_amount = forward_amount;
        outgoing_cltv = forward_cltv;
    }

    Ok(LockedInRoute {
        htlcs: added,
        final_amount_msat: outgoing_amount,
        final_cltv_expiry: outgoing_cltv,
    })
}

/// Removes the htlcs provided from the simulation state, working backwards from the last one added. We look up the
/// HTLC on the incoming node because it will have tracked it in its outgoing in-flight HTLCs.
async fn remove_htlcs(
    channels: Arc<Mutex<HashMap<ShortChannelID, SimulatedChannel>>>,
    source: PublicKey,
    route: &Route,
    htlcs: &[HtlcRef],
    success: bool,
) -> Result<(), ForwardingError> {
    for (i, htlc) in htlcs.iter().enumerate().rev() {
        let incoming_node = if i == 0 {
            source
        } else {
            route.hops[i - 1].pubkey
        };

        match channels.lock().await.get_mut(&htlc.channel_id) {
            Some(channel) => {
                channel.remove_htlc(&incoming_node, htlc.index, success)?;
            },
            None => return Err(ForwardingError::ChannelNotFound(htlc.channel_id)),
        }
    }

    Ok(())
}

struct PropagateShardRequest<'a> {
    channels: Arc<Mutex<HashMap<ShortChannelID, SimulatedChannel>>>,
    source: PublicKey,
    route: &'a Route,
    payment_hash: PaymentHash,
    deadline: Instant,
    receiver: Option<Arc<InvoiceRegistry>>,
    interceptors: &'a [Arc<dyn Interceptor>],
    listener: Listener,
    shutdown: Trigger,
}

impl PropagateShardRequest<'_> {
    /// Resolves the htlcs provided, triggering shutdown if our state machine has broken down.
    async fn resolve_htlcs(&self, htlcs: &[HtlcRef], success: bool) {
        if let Err(e) = remove_htlcs(
            self.channels.clone(),
            self.source,
            self.route,
            htlcs,
            success,
        )
        .await
        {
            if e.is_critical() {
                self.shutdown.trigger();
            }

            log::error!(
                "Could not resolve htlcs for payment {} (success: {success}): {e}.",
                hex::encode(self.payment_hash.0)
            );
        }
    }
}

/// Propagates a shard through the simulated network and hands it to the recipient, returning the preimage if the
/// recipient settled it. All htlcs that were added are resolved before returning, whatever the outcome.
async fn propagate_shard(request: PropagateShardRequest<'_>) -> Result<PaymentPreimage, FailureReason> {
    let locked_in = match add_htlcs(
        request.channels.clone(),
        request.source,
        request.route,
        request.payment_hash,
        request.interceptors,
        request.deadline,
        request.listener.clone(),
    )
    .await
    {
        Ok(locked_in) => locked_in,
        Err((added, err)) => {
            if err.is_critical() {
                request.shutdown.trigger();
            }

            // If we partially added HTLCs along the route, we need to fail them back to the source. The node that
            // failed the htlc is the last one that received it (index 0 being the sender itself).
            let failure_index = added.len();
            request.resolve_htlcs(&added, false).await;

            log::debug!(
                "Forwarding failure for shard of payment {} at index {failure_index}: {err}",
                hex::encode(request.payment_hash.0)
            );

            return Err(FailureReason::Forwarding {
                failure_index,
                error: err,
            });
        },
    };

    let final_hop = &request.route.hops[request.route.hops.len() - 1];
    let registry = match &request.receiver {
        Some(r) => r,
        None => {
            log::debug!(
                "Recipient {} has no invoices, failing shard of payment {}.",
                final_hop.pubkey,
                hex::encode(request.payment_hash.0)
            );
            request.resolve_htlcs(&locked_in.htlcs, false).await;
            return Err(FailureReason::Rejected(
                crate::invoice::RejectReason::UnknownInvoice,
            ));
        },
    };

    let final_htlc = locked_in.htlcs[locked_in.htlcs.len() - 1];
    let decision = registry
        .accept_shard(AcceptRequest {
            payment_hash: request.payment_hash,
            htlc: final_htlc,
            amount_msat: locked_in.final_amount_msat,
            expected_amount_msat: final_hop.fee_msat,
            cltv_expiry: locked_in.final_cltv_expiry,
            mpp_record: final_hop.mpp_record,
        })
        .await;

    let mut held = match decision {
        AcceptDecision::Hold(receiver) => receiver,
        AcceptDecision::Reject(reason) => {
            request.resolve_htlcs(&locked_in.htlcs, false).await;
            return Err(FailureReason::Rejected(reason));
        },
    };

    // The recipient holds the htlc until its set completes or times out. If our own deadline passes first (or we
    // shut down) we expire the htlc on the recipient, which always produces a resolution on the held channel, so we
    // never race with a settlement that happened in the meantime.
    let resolution = select! {
        biased;
        res = &mut held => res,
        _ = sleep_until(request.deadline) => {
            registry
                .expire_htlc(&request.payment_hash, final_htlc, HoldFailure::Expired)
                .await;
            held.await
        },
        _ = request.listener.clone() => {
            registry
                .expire_htlc(&request.payment_hash, final_htlc, HoldFailure::Shutdown)
                .await;
            held.await
        },
    };

    match resolution {
        Ok(HtlcResolution::Settle(preimage)) => {
            request.resolve_htlcs(&locked_in.htlcs, true).await;
            Ok(preimage)
        },
        Ok(HtlcResolution::Fail(failure)) => {
            request.resolve_htlcs(&locked_in.htlcs, false).await;
            Err(failure.into())
        },
        Err(e) => {
            request.resolve_htlcs(&locked_in.htlcs, false).await;
            Err(FailureReason::LocalFailure(format!(
                "recipient dropped held htlc {final_htlc}: {e}"
            )))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{RegistryConfig, RejectReason};
    use crate::payment::AttemptOutcome;
    use crate::route::{MppRecord, DEFAULT_FINAL_CLTV_DELTA};
    use crate::test_utils::{
        create_channel_policy, get_random_keypair, open_channel, DiamondNetwork,
        DIAMOND_CHANNEL_MSAT, DIAMOND_SHARD_MSAT,
    };
    use std::time::Duration;

    /// Creates a test channel policy with its maximum HTLC size set to half of the in flight limit of the channel.
    /// The minimum HTLC size is hardcoded to 2 so that we can fall beneath this value with a 1 msat htlc.
    fn create_test_policy(max_in_flight_msat: u64) -> ChannelPolicy {
        let (_, pk) = get_random_keypair();
        ChannelPolicy {
            pubkey: pk,
            max_htlc_count: 10,
            max_in_flight_msat,
            min_htlc_size_msat: 2,
            max_htlc_size_msat: max_in_flight_msat / 2,
            cltv_expiry_delta: 10,
            base_fee: 1000,
            fee_rate_prop: 5000,
        }
    }

    fn test_htlc(hash: PaymentHash, amount_msat: u64, cltv_expiry: u32) -> Htlc {
        Htlc {
            payment_hash: hash,
            amount_msat,
            cltv_expiry,
        }
    }

    macro_rules! assert_channel_balances {
        ($channel_state:expr, $local_balance:expr, $in_flight_len:expr, $in_flight_total:expr) => {
            assert_eq!($channel_state.local_balance_msat, $local_balance);
            assert_eq!($channel_state.in_flight.len(), $in_flight_len);
            assert_eq!($channel_state.in_flight_total(), $in_flight_total);
        };
    }

    /// Tests state updates related to adding and removing HTLCs to a channel, including several htlcs that share a
    /// payment hash as the shards of a multi-part payment would.
    #[test]
    fn test_channel_state_transitions() {
        let local_balance = 100_000_000;
        let mut channel_state =
            ChannelState::new(create_test_policy(local_balance / 2), local_balance);

        assert_channel_balances!(channel_state, local_balance, 0, 0);

        let hash = PaymentHash([1; 32]);
        let htlc_1 = test_htlc(hash, 1000, 40);
        let index_1 = channel_state.add_outgoing_htlc(htlc_1).unwrap();
        assert_channel_balances!(
            channel_state,
            local_balance - htlc_1.amount_msat,
            1,
            htlc_1.amount_msat
        );

        // A second shard of the same payment is tracked separately under a new index.
        let htlc_2 = test_htlc(hash, 2000, 40);
        let index_2 = channel_state.add_outgoing_htlc(htlc_2).unwrap();
        assert_ne!(index_1, index_2);
        assert_channel_balances!(
            channel_state,
            local_balance - htlc_1.amount_msat - htlc_2.amount_msat,
            2,
            htlc_1.amount_msat + htlc_2.amount_msat
        );

        // Remove our second htlc with a failure so that our in-flight drops and we return the balance.
        assert!(channel_state.remove_outgoing_htlc(index_2).is_ok());
        channel_state.settle_outgoing_htlc(htlc_2.amount_msat, false);
        assert_channel_balances!(
            channel_state,
            local_balance - htlc_1.amount_msat,
            1,
            htlc_1.amount_msat
        );

        // Try to remove the same htlc and assert that we fail because the htlc can't be found.
        assert!(matches!(
            channel_state.remove_outgoing_htlc(index_2),
            Err(ForwardingError::HtlcNotFound(_))
        ));

        // Finally, remove our original htlc with success and assert that our local balance is accordingly updated.
        assert!(channel_state.remove_outgoing_htlc(index_1).is_ok());
        channel_state.settle_outgoing_htlc(htlc_1.amount_msat, true);
        assert_channel_balances!(channel_state, local_balance - htlc_1.amount_msat, 0, 0);

        // Indexes are never reused, even once the channel has no htlcs in flight.
        let index_3 = channel_state.add_outgoing_htlc(htlc_1).unwrap();
        assert!(index_3 > index_2);
    }

    /// Tests policy checks applied when forwarding a htlc over a channel.
    #[test]
    fn test_htlc_forward() {
        let local_balance = 140_000;
        let channel_state = ChannelState::new(create_test_policy(local_balance / 2), local_balance);

        // CLTV delta insufficient (one less than required).
        assert!(matches!(
            channel_state.check_htlc_forward(channel_state.policy.cltv_expiry_delta - 1, 0, 0),
            Err(ForwardingError::InsufficientCltvDelta(_, _))
        ));

        // Test insufficient fee.
        let htlc_amount = 1000;
        let htlc_fee = channel_state.policy.base_fee
            + (channel_state.policy.fee_rate_prop * htlc_amount) / 1e6 as u64;
        assert_eq!(channel_state.policy.fee_for(htlc_amount), Ok(htlc_fee));

        assert!(matches!(
            channel_state.check_htlc_forward(
                channel_state.policy.cltv_expiry_delta,
                htlc_amount,
                htlc_fee - 1
            ),
            Err(ForwardingError::InsufficientFee(_, _, _, _))
        ));

        // Test exact and over-estimation of required policy.
        assert!(channel_state
            .check_htlc_forward(
                channel_state.policy.cltv_expiry_delta,
                htlc_amount,
                htlc_fee,
            )
            .is_ok());

        assert!(channel_state
            .check_htlc_forward(
                channel_state.policy.cltv_expiry_delta * 2,
                htlc_amount,
                htlc_fee * 3
            )
            .is_ok());

        assert!(matches!(
            channel_state.policy.fee_for(u64::MAX),
            Err(ForwardingError::FeeOverflow(_, _, _))
        ));
    }

    /// Test addition of outgoing htlc to local state.
    #[test]
    fn test_check_outgoing_addition() {
        // Create test channel with low local liquidity so that we run into failures.
        let local_balance = 100_000;
        let mut channel_state =
            ChannelState::new(create_test_policy(local_balance / 2), local_balance);
        let hash = PaymentHash([1; 32]);

        let mut htlc = test_htlc(
            hash,
            channel_state.policy.max_htlc_size_msat + 1,
            channel_state.policy.cltv_expiry_delta,
        );
        // HTLC maximum size exceeded.
        assert!(matches!(
            channel_state.check_outgoing_addition(&htlc),
            Err(ForwardingError::MoreThanMaximum(_, _))
        ));

        // Beneath HTLC minimum size.
        htlc.amount_msat = channel_state.policy.min_htlc_size_msat - 1;
        assert!(matches!(
            channel_state.check_outgoing_addition(&htlc),
            Err(ForwardingError::LessThanMinimum(_, _))
        ));

        // Add two large htlcs so that we will start to run into our in-flight total amount limit.
        let half_in_flight = test_htlc(
            hash,
            channel_state.policy.max_in_flight_msat / 2,
            channel_state.policy.cltv_expiry_delta,
        );
        let index_1 = channel_state.add_outgoing_htlc(half_in_flight).unwrap();
        let index_2 = channel_state.add_outgoing_htlc(half_in_flight).unwrap();

        // Now, assert that we can't add even our smallest htlc size, because we're hit our in-flight amount limit.
        htlc.amount_msat = channel_state.policy.min_htlc_size_msat;
        assert!(matches!(
            channel_state.check_outgoing_addition(&htlc),
            Err(ForwardingError::ExceedsInFlightTotal(_, _))
        ));

        // Resolve both of the htlcs successfully so that the local liquidity is no longer available.
        for index in [index_1, index_2] {
            let removed = channel_state.remove_outgoing_htlc(index).unwrap();
            channel_state.settle_outgoing_htlc(removed.amount_msat, true);
        }

        // Now we're going to add many htlcs so that we hit our in-flight count limit.
        let mut indexes = vec![];
        for _ in 0..channel_state.policy.max_htlc_count {
            indexes.push(channel_state.add_outgoing_htlc(htlc).unwrap());
        }

        assert!(matches!(
            channel_state.check_outgoing_addition(&htlc),
            Err(ForwardingError::ExceedsInFlightCount(_, _))
        ));

        for index in indexes {
            assert!(channel_state.remove_outgoing_htlc(index).is_ok());
            channel_state.settle_outgoing_htlc(htlc.amount_msat, true)
        }

        // Finally, assert that we don't have enough balance to forward our largest possible htlc (because of all the
        // htlcs that we've settled) and assert that we fail to a large htlc.
        let largest = test_htlc(
            hash,
            channel_state.policy.max_htlc_size_msat,
            channel_state.policy.cltv_expiry_delta,
        );
        assert!(channel_state.local_balance_msat < channel_state.policy.max_htlc_size_msat);
        assert!(matches!(
            channel_state.check_outgoing_addition(&largest),
            Err(ForwardingError::InsufficientBalance(_, _))
        ));
    }

    /// Tests basic functionality of a `SimulatedChannel` but does no endeavor to test the underlying
    /// `ChannelState`, as this is covered elsewhere in our tests.
    #[test]
    fn test_simulated_channel() {
        let capacity_msat = 500_000_000;
        let node_1 = create_test_policy(capacity_msat / 2);
        let node_2 = create_test_policy(capacity_msat / 2);

        let mut simulated_channel = SimulatedChannel::new_with_balance(
            capacity_msat,
            ShortChannelID::from(123),
            node_1.clone(),
            node_2.clone(),
            capacity_msat,
        )
        .unwrap();

        // Assert that we're not able to send a htlc over node_2 -> node_1 (no liquidity).
        let hash = PaymentHash([1; 32]);
        let htlc_1 = test_htlc(hash, node_2.min_htlc_size_msat, node_1.cltv_expiry_delta);
        assert!(matches!(
            simulated_channel.add_htlc(&node_2.pubkey, htlc_1),
            Err(ForwardingError::InsufficientBalance(_, _))
        ));

        // Assert that we can send a htlc over node_1 -> node_2.
        let htlc_2 = test_htlc(hash, node_1.max_htlc_size_msat, node_2.cltv_expiry_delta);
        let index = simulated_channel.add_htlc(&node_1.pubkey, htlc_2).unwrap();

        // Settle the htlc and then assert that we can send from node_2 -> node_1 because the balance has been shifted
        // across channels.
        assert!(simulated_channel
            .remove_htlc(&node_1.pubkey, index, true)
            .is_ok());
        assert_eq!(
            simulated_channel.balances(),
            (
                capacity_msat - node_1.max_htlc_size_msat,
                node_1.max_htlc_size_msat
            )
        );

        assert!(simulated_channel.add_htlc(&node_2.pubkey, htlc_2).is_ok());

        // A disabled channel refuses new htlcs.
        simulated_channel.enabled = false;
        assert!(matches!(
            simulated_channel.add_htlc(&node_1.pubkey, htlc_1),
            Err(ForwardingError::ChannelDisabled(_))
        ));
        simulated_channel.enabled = true;

        // Finally, try to add/remove htlcs for a pubkey that is not participating in the channel and assert that we
        // fail.
        let (_, pk) = get_random_keypair();
        assert!(matches!(
            simulated_channel.add_htlc(&pk, htlc_2),
            Err(ForwardingError::NodeNotFound(_))
        ));

        assert!(matches!(
            simulated_channel.remove_htlc(&pk, index, true),
            Err(ForwardingError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_channel_with_balance() {
        let policy_1 = create_test_policy(1_000);
        let policy_2 = create_test_policy(1_000);

        assert!(SimulatedChannel::new_with_balance(
            1_000,
            ShortChannelID::from(1),
            policy_1.clone(),
            policy_2.clone(),
            1_001
        )
        .is_err());

        let channel = SimulatedChannel::new_with_balance(
            1_000,
            ShortChannelID::from(1),
            policy_1,
            policy_2,
            700,
        )
        .unwrap();
        assert_eq!(channel.balances(), (700, 300));
        assert!(channel.sanity_check().is_ok());
    }

    #[test]
    fn test_graph_validation() {
        let (_, a) = get_random_keypair();
        let (_, b) = get_random_keypair();
        let (trigger, listener) = triggered::trigger();

        // Duplicate short channel ids are rejected.
        let channels = vec![open_channel(1, a, b, 1_000), open_channel(1, b, a, 1_000)];
        assert!(SimGraph::new(channels, trigger.clone(), listener.clone()).is_err());

        // As are channels with a policy that exceeds their capacity.
        let mut bad_policy = open_channel(2, a, b, 1_000);
        bad_policy.node_1.policy.max_htlc_size_msat = 2_000;
        assert!(SimGraph::new(vec![bad_policy], trigger.clone(), listener.clone()).is_err());

        // Receivers must be part of the graph.
        let mut graph = SimGraph::new(vec![open_channel(3, a, b, 1_000)], trigger, listener.clone())
            .unwrap();
        assert_eq!(graph.node_capacities(&a), Some(&[1_000u64][..]));

        let (_, stranger) = get_random_keypair();
        let registry = Arc::new(InvoiceRegistry::new(
            stranger,
            RegistryConfig::default(),
            listener,
        ));
        assert!(graph.add_receiver(registry).is_err());
    }

    #[tokio::test]
    async fn test_build_route() {
        let network = DiamondNetwork::new(DIAMOND_CHANNEL_MSAT);
        let (trigger, listener) = triggered::trigger();
        let graph = SimGraph::new(network.channels.clone(), trigger, listener).unwrap();

        let route = graph
            .build_route(
                &network.alice,
                DIAMOND_SHARD_MSAT,
                DEFAULT_FINAL_CLTV_DELTA,
                &[network.carol, network.eve, network.bob],
            )
            .await
            .unwrap();

        // Alice -- Carol (6), Carol -- Eve (5), Eve -- Bob (4).
        let scids: Vec<u64> = route.hops.iter().map(|h| h.short_channel_id.into()).collect();
        assert_eq!(scids, vec![6, 5, 4]);

        // Fees are charged backwards: Eve on the delivered amount, Carol on the amount forwarded to Eve.
        let policy = create_channel_policy(network.eve, DIAMOND_CHANNEL_MSAT);
        let eve_fee = policy.fee_for(DIAMOND_SHARD_MSAT).unwrap();
        let carol_fee = policy.fee_for(DIAMOND_SHARD_MSAT + eve_fee).unwrap();
        assert_eq!(route.hops[1].fee_msat, eve_fee);
        assert_eq!(route.hops[0].fee_msat, carol_fee);
        assert_eq!(route.final_value_msat(), DIAMOND_SHARD_MSAT);
        assert_eq!(route.total_cltv_delta(), 40 + 40 + DEFAULT_FINAL_CLTV_DELTA);
        assert_eq!(route.destination(), Some(network.bob));

        // No channel between Alice and Eve.
        assert!(matches!(
            graph
                .build_route(&network.alice, 1_000, DEFAULT_FINAL_CLTV_DELTA, &[network.eve])
                .await,
            Err(RouteError::NoChannel(_, _))
        ));

        assert_eq!(
            graph
                .build_route(&network.alice, 1_000, DEFAULT_FINAL_CLTV_DELTA, &[])
                .await,
            Err(RouteError::EmptyRoute)
        );
    }

    /// Interceptor that holds every htlc forever, used to exercise shard deadlines.
    struct BlackHoleInterceptor {}

    #[async_trait]
    impl Interceptor for BlackHoleInterceptor {
        async fn intercept_htlc(&self, _req: InterceptRequest) -> Result<(), ForwardingError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> String {
            "black hole".to_string()
        }
    }

    /// Interceptor that fails every htlc.
    struct RejectingInterceptor {}

    #[async_trait]
    impl Interceptor for RejectingInterceptor {
        async fn intercept_htlc(&self, _req: InterceptRequest) -> Result<(), ForwardingError> {
            Err(ForwardingError::InterceptorFailure("rejected".to_string()))
        }

        fn name(&self) -> String {
            "rejecting".to_string()
        }
    }

    /// Contains elements required to test shard dispatch over the diamond network.
    struct DispatchTestKit {
        network: DiamondNetwork,
        graph: SimGraph,
        registry: Arc<InvoiceRegistry>,
        shutdown: Trigger,
    }

    impl DispatchTestKit {
        fn new(dave_bob_capacity_msat: u64, cfg: RegistryConfig) -> Self {
            let network = DiamondNetwork::new(dave_bob_capacity_msat);
            let (shutdown, listener) = triggered::trigger();

            let mut graph =
                SimGraph::new(network.channels.clone(), shutdown.clone(), listener.clone())
                    .expect("could not create test graph");
            let registry = Arc::new(InvoiceRegistry::new(network.bob, cfg, listener));
            graph.add_receiver(registry.clone()).unwrap();

            DispatchTestKit {
                network,
                graph,
                registry,
                shutdown,
            }
        }

        async fn balances(&self, scid: u64) -> (u64, u64) {
            self.graph
                .channel(ShortChannelID::from(scid))
                .await
                .unwrap()
                .balances()
        }

        async fn shard(
            &self,
            hops: &[PublicKey],
            amount_msat: u64,
            mpp_record: MppRecord,
            expiry: Duration,
            payment_hash: PaymentHash,
        ) -> Shard {
            let mut route = self
                .graph
                .build_route(&self.network.alice, amount_msat, DEFAULT_FINAL_CLTV_DELTA, hops)
                .await
                .unwrap();
            route.attach_mpp_record(mpp_record).unwrap();

            Shard {
                attempt_id: 0,
                shard_index: 0,
                payment_hash,
                route,
                amount_msat,
                mpp_record,
                expiry,
            }
        }
    }

    /// A single shard paying the full invoice amount settles immediately and moves balances along its route.
    #[tokio::test]
    async fn test_single_shard_settles() {
        let kit = DispatchTestKit::new(DIAMOND_CHANNEL_MSAT, RegistryConfig::default());
        let request = kit.registry.add_invoice(DIAMOND_SHARD_MSAT, None).await.unwrap();
        let mpp = MppRecord {
            payment_addr: request.payment_addr,
            total_amt_msat: DIAMOND_SHARD_MSAT,
        };

        let shard = kit
            .shard(
                &[kit.network.dave, kit.network.bob],
                DIAMOND_SHARD_MSAT,
                mpp,
                Duration::from_secs(60),
                request.payment_hash,
            )
            .await;
        let total = shard.route.total_amount_msat();

        let attempt = kit.graph.send_shard(kit.network.alice, shard).await;
        assert!(matches!(attempt.outcome, AttemptOutcome::Succeeded { .. }));

        // Alice -- Dave (3) moved the amount plus Dave's fee, Dave -- Bob (2) moved the shard amount.
        assert_eq!(kit.balances(3).await, (DIAMOND_CHANNEL_MSAT - total, total));
        assert_eq!(
            kit.balances(2).await,
            (DIAMOND_CHANNEL_MSAT - DIAMOND_SHARD_MSAT, DIAMOND_SHARD_MSAT)
        );

        let invoice = kit.registry.lookup_invoice(&request.payment_hash).await.unwrap();
        assert!(invoice.is_settled());
        assert_eq!(invoice.amt_paid_msat, DIAMOND_SHARD_MSAT);

        kit.shutdown.trigger();
        kit.registry.wait_for_shutdown().await;
    }

    /// A shard that can't be forwarded fails with the forwarding error and leaves balances untouched.
    #[tokio::test]
    async fn test_insufficient_balance_fails_back() {
        let kit = DispatchTestKit::new(DIAMOND_SHARD_MSAT / 2, RegistryConfig::default());
        let request = kit.registry.add_invoice(DIAMOND_SHARD_MSAT, None).await.unwrap();
        let mpp = MppRecord {
            payment_addr: request.payment_addr,
            total_amt_msat: DIAMOND_SHARD_MSAT,
        };

        let shard = kit
            .shard(
                &[kit.network.dave, kit.network.bob],
                DIAMOND_SHARD_MSAT,
                mpp,
                Duration::from_secs(60),
                request.payment_hash,
            )
            .await;

        let attempt = kit.graph.send_shard(kit.network.alice, shard).await;
        match attempt.outcome {
            AttemptOutcome::Failed {
                reason: FailureReason::Forwarding {
                    failure_index,
                    error,
                },
            } => {
                // Dave (index 1) could not forward over the small Dave -- Bob channel.
                assert_eq!(failure_index, 1);
                assert!(matches!(error, ForwardingError::MoreThanMaximum(_, _)));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(kit.balances(3).await, (DIAMOND_CHANNEL_MSAT, 0));
        assert_eq!(kit.balances(2).await, (DIAMOND_SHARD_MSAT / 2, 0));

        let invoice = kit.registry.lookup_invoice(&request.payment_hash).await.unwrap();
        assert!(invoice.htlcs.is_empty());
    }

    /// A shard with the wrong payment address is rejected by the recipient and failed back without a preimage.
    #[tokio::test]
    async fn test_address_mismatch_rejected() {
        let kit = DispatchTestKit::new(DIAMOND_CHANNEL_MSAT, RegistryConfig::default());
        let request = kit.registry.add_invoice(DIAMOND_SHARD_MSAT, None).await.unwrap();
        let mpp = MppRecord {
            payment_addr: lightning::ln::PaymentSecret([9; 32]),
            total_amt_msat: DIAMOND_SHARD_MSAT,
        };

        let shard = kit
            .shard(
                &[kit.network.carol, kit.network.bob],
                DIAMOND_SHARD_MSAT,
                mpp,
                Duration::from_secs(60),
                request.payment_hash,
            )
            .await;

        let attempt = kit.graph.send_shard(kit.network.alice, shard).await;
        assert_eq!(
            attempt.failure(),
            Some(&FailureReason::Rejected(RejectReason::AddressMismatch))
        );
        assert!(attempt.preimage().is_none());
        assert_eq!(
            kit.balances(6).await,
            (DIAMOND_CHANNEL_MSAT + DIAMOND_SHARD_MSAT, 0)
        );
        assert_eq!(kit.balances(1).await, (DIAMOND_CHANNEL_MSAT, 0));
    }

    /// A route whose first hop does not leave the sender fails locally, before any htlc is added.
    #[tokio::test]
    async fn test_local_failure() {
        let kit = DispatchTestKit::new(DIAMOND_CHANNEL_MSAT, RegistryConfig::default());
        let mpp = MppRecord {
            payment_addr: lightning::ln::PaymentSecret([1; 32]),
            total_amt_msat: 1_000,
        };
        let shard = kit
            .shard(
                &[kit.network.carol, kit.network.bob],
                1_000,
                mpp,
                Duration::from_secs(60),
                PaymentHash([1; 32]),
            )
            .await;

        // Dispatch from Dave, who is not part of Alice -- Carol.
        assert_eq!(
            kit.graph.check_route(kit.network.dave, &shard.route).await,
            Err(RouteError::FirstHopNotFromSource(
                ShortChannelID::from(6),
                kit.network.dave
            ))
        );
        let attempt = kit.graph.send_shard(kit.network.dave, shard).await;
        assert!(matches!(
            attempt.failure(),
            Some(FailureReason::LocalFailure(_))
        ));
        assert_eq!(
            kit.balances(6).await,
            (DIAMOND_CHANNEL_MSAT + DIAMOND_SHARD_MSAT, 0)
        );
    }

    /// A disabled channel fails shards with a distinguishable error.
    #[tokio::test]
    async fn test_disabled_channel() {
        let kit = DispatchTestKit::new(DIAMOND_CHANNEL_MSAT, RegistryConfig::default());
        let request = kit.registry.add_invoice(DIAMOND_SHARD_MSAT, None).await.unwrap();
        let mpp = MppRecord {
            payment_addr: request.payment_addr,
            total_amt_msat: DIAMOND_SHARD_MSAT,
        };

        kit.graph
            .set_channel_enabled(ShortChannelID::from(1), false)
            .await
            .unwrap();

        let shard = kit
            .shard(
                &[kit.network.carol, kit.network.bob],
                DIAMOND_SHARD_MSAT,
                mpp,
                Duration::from_secs(60),
                request.payment_hash,
            )
            .await;

        let attempt = kit.graph.send_shard(kit.network.alice, shard).await;
        assert_eq!(
            attempt.failure(),
            Some(&FailureReason::Forwarding {
                failure_index: 1,
                error: ForwardingError::ChannelDisabled(ShortChannelID::from(1)),
            })
        );
    }

    /// A shard that is stuck at an intermediate hop fails once its deadline passes, and its htlcs are failed back.
    #[tokio::test(start_paused = true)]
    async fn test_stuck_shard_expires() {
        let mut kit = DispatchTestKit::new(DIAMOND_CHANNEL_MSAT, RegistryConfig::default());
        kit.graph.add_interceptor(Arc::new(BlackHoleInterceptor {}));

        let request = kit.registry.add_invoice(DIAMOND_SHARD_MSAT, None).await.unwrap();
        let mpp = MppRecord {
            payment_addr: request.payment_addr,
            total_amt_msat: DIAMOND_SHARD_MSAT,
        };
        let shard = kit
            .shard(
                &[kit.network.dave, kit.network.bob],
                DIAMOND_SHARD_MSAT,
                mpp,
                Duration::from_secs(30),
                request.payment_hash,
            )
            .await;

        let attempt = kit.graph.send_shard(kit.network.alice, shard).await;
        assert_eq!(
            attempt.failure(),
            Some(&FailureReason::Forwarding {
                failure_index: 1,
                error: ForwardingError::HtlcExpired(ShortChannelID::from(3)),
            })
        );
        assert_eq!(kit.balances(3).await, (DIAMOND_CHANNEL_MSAT, 0));
        assert_eq!(
            kit.graph
                .channel(ShortChannelID::from(3))
                .await
                .unwrap()
                .in_flight_count(),
            0
        );
    }

    #[tokio::test]
    async fn test_interceptor_failure() {
        let mut kit = DispatchTestKit::new(DIAMOND_CHANNEL_MSAT, RegistryConfig::default());
        kit.graph.add_interceptor(Arc::new(RejectingInterceptor {}));

        let request = kit.registry.add_invoice(DIAMOND_SHARD_MSAT, None).await.unwrap();
        let mpp = MppRecord {
            payment_addr: request.payment_addr,
            total_amt_msat: DIAMOND_SHARD_MSAT,
        };
        let shard = kit
            .shard(
                &[kit.network.dave, kit.network.bob],
                DIAMOND_SHARD_MSAT,
                mpp,
                Duration::from_secs(30),
                request.payment_hash,
            )
            .await;

        let attempt = kit.graph.send_shard(kit.network.alice, shard).await;
        assert!(matches!(
            attempt.failure(),
            Some(FailureReason::Forwarding {
                error: ForwardingError::InterceptorFailure(_),
                ..
            })
        ));
        assert_eq!(kit.balances(3).await, (DIAMOND_CHANNEL_MSAT, 0));
    }

    /// A partial shard held by the recipient is released when the sender's deadline passes before the set completes.
    #[tokio::test(start_paused = true)]
    async fn test_held_shard_expires_at_deadline() {
        let cfg = RegistryConfig {
            hold_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        let kit = DispatchTestKit::new(DIAMOND_CHANNEL_MSAT, cfg);
        let request = kit
            .registry
            .add_invoice(2 * DIAMOND_SHARD_MSAT, None)
            .await
            .unwrap();
        let mpp = MppRecord {
            payment_addr: request.payment_addr,
            total_amt_msat: 2 * DIAMOND_SHARD_MSAT,
        };

        let shard = kit
            .shard(
                &[kit.network.dave, kit.network.bob],
                DIAMOND_SHARD_MSAT,
                mpp,
                Duration::from_secs(30),
                request.payment_hash,
            )
            .await;

        let attempt = kit.graph.send_shard(kit.network.alice, shard).await;
        assert_eq!(attempt.failure(), Some(&FailureReason::ShardTimeout));
        assert_eq!(kit.balances(3).await, (DIAMOND_CHANNEL_MSAT, 0));
        assert_eq!(kit.balances(2).await, (DIAMOND_CHANNEL_MSAT, 0));

        let invoice = kit.registry.lookup_invoice(&request.payment_hash).await.unwrap();
        assert!(!invoice.is_settled());
        assert_eq!(invoice.amt_paid_msat, 0);
        assert_eq!(invoice.settled_htlc_count(), 0);
    }
}
