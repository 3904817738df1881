use crate::invoice::{HoldFailure, RejectReason};
use crate::results::{PaymentResult, PaymentStore, ResultAggregator};
use crate::route::{MppRecord, Route, RouteError};
use crate::serializers;
use crate::sim_node::ForwardingError;
use crate::SimulationError;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use lightning::ln::{PaymentHash, PaymentPreimage, PaymentSecret};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::task::TaskTracker;

/// How long a shard may be in flight before the sender gives up on it.
pub const DEFAULT_SHARD_TIMEOUT: Duration = Duration::from_secs(180);

/// Extra time that the coordinator waits past the shard timeout for dispatchers to report.
pub const DEFAULT_RESOLUTION_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub shard_timeout: Duration,
    pub resolution_grace: Duration,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        PaymentConfig {
            shard_timeout: DEFAULT_SHARD_TIMEOUT,
            resolution_grace: DEFAULT_RESOLUTION_GRACE,
        }
    }
}

/// One part of a multi-part payment, sent as a single htlc over its own route.
#[derive(Debug, Clone)]
pub struct Shard {
    pub attempt_id: u64,
    /// Position of the shard in the payment's shard list.
    pub shard_index: usize,
    pub payment_hash: PaymentHash,
    /// The route with the mpp record already attached to its final hop.
    pub route: Route,
    pub amount_msat: u64,
    pub mpp_record: MppRecord,
    /// How long the shard may be in flight before it is failed.
    pub expiry: Duration,
}

/// Why a single shard failed. Variants are kept distinct so that callers can tell a routing failure from a
/// rejection by the recipient or a timeout.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The htlc could not be forwarded. The failure index is the position in the route of the node that failed the
    /// htlc, zero being the sender.
    #[error("Forwarding failure at hop {failure_index}: {error}")]
    Forwarding {
        failure_index: usize,
        error: ForwardingError,
    },
    #[error("Rejected by recipient: {0}")]
    Rejected(RejectReason),
    /// The recipient held the htlc but its set never completed.
    #[error("MppTimeout")]
    MppTimeout,
    /// The shard was not resolved before its expiry.
    #[error("ShardTimeout")]
    ShardTimeout,
    #[error("InvoiceCanceled")]
    InvoiceCanceled,
    /// The shard failed before its htlc left the sender.
    #[error("LocalFailure: {0}")]
    LocalFailure(String),
    #[error("Shutdown")]
    Shutdown,
}

impl From<HoldFailure> for FailureReason {
    fn from(failure: HoldFailure) -> Self {
        match failure {
            HoldFailure::MppTimeout => FailureReason::MppTimeout,
            HoldFailure::Expired => FailureReason::ShardTimeout,
            HoldFailure::Canceled => FailureReason::InvoiceCanceled,
            HoldFailure::Shutdown => FailureReason::Shutdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    Succeeded {
        #[serde(with = "serializers::serde_payment_preimage")]
        preimage: PaymentPreimage,
    },
    Failed {
        reason: FailureReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HtlcStatus {
    Succeeded,
    Failed,
}

/// The terminal record of a single shard. Created once, when the shard resolves.
#[derive(Debug, Clone, Serialize)]
pub struct HtlcAttempt {
    pub attempt_id: u64,
    pub shard_index: usize,
    pub route: Route,
    pub amount_msat: u64,
    pub outcome: AttemptOutcome,
    #[serde(with = "serde_millis")]
    pub attempt_time: SystemTime,
    #[serde(with = "serde_millis")]
    pub resolve_time: SystemTime,
}

impl HtlcAttempt {
    /// Creates the record for a shard that has just resolved.
    pub fn new(
        shard: Shard,
        result: Result<PaymentPreimage, FailureReason>,
        attempt_time: SystemTime,
    ) -> Self {
        HtlcAttempt {
            attempt_id: shard.attempt_id,
            shard_index: shard.shard_index,
            route: shard.route,
            amount_msat: shard.amount_msat,
            outcome: match result {
                Ok(preimage) => AttemptOutcome::Succeeded { preimage },
                Err(reason) => AttemptOutcome::Failed { reason },
            },
            attempt_time,
            resolve_time: SystemTime::now(),
        }
    }

    pub fn status(&self) -> HtlcStatus {
        match self.outcome {
            AttemptOutcome::Succeeded { .. } => HtlcStatus::Succeeded,
            AttemptOutcome::Failed { .. } => HtlcStatus::Failed,
        }
    }

    pub fn preimage(&self) -> Option<PaymentPreimage> {
        match self.outcome {
            AttemptOutcome::Succeeded { preimage } => Some(preimage),
            AttemptOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.outcome {
            AttemptOutcome::Succeeded { .. } => None,
            AttemptOutcome::Failed { reason } => Some(reason),
        }
    }
}

/// Errors returned before any shard of a payment is dispatched.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("NoShards")]
    NoShards,
    #[error("ShardAmountMismatch: shards sum to {sum} msat, payment total is {total} msat")]
    ShardAmountMismatch { total: u64, sum: u64 },
    #[error("AmountOverflow: shard amounts overflow")]
    AmountOverflow,
    #[error("ZeroAmountShard: shard {0}")]
    ZeroAmountShard(usize),
    #[error("InvalidRoute: shard {0}: {1}")]
    InvalidRoute(usize, RouteError),
    #[error("RouteAmountMismatch: shard {shard_index} is {shard_msat} msat, route delivers {route_msat} msat")]
    RouteAmountMismatch {
        shard_index: usize,
        shard_msat: u64,
        route_msat: u64,
    },
    #[error("DestinationMismatch: shard {0} is routed to a different destination")]
    DestinationMismatch(usize),
    #[error("AlreadyPaid: {0}")]
    AlreadyPaid(String),
    #[error("PaymentInFlight: {0}")]
    PaymentInFlight(String),
    #[error("Store: {0}")]
    Store(#[from] SimulationError),
}

/// Sends a single shard and waits for it to resolve. Implementations must always produce an attempt, reporting local
/// problems as failed attempts rather than errors, so that the coordinator can account for every shard.
#[async_trait]
pub trait ShardDispatcher: Send + Sync {
    /// Checks that a route can be used from the source before anything is sent over it.
    async fn check_route(&self, source: PublicKey, route: &Route) -> Result<(), RouteError>;

    async fn send_shard(&self, source: PublicKey, shard: Shard) -> HtlcAttempt;
}

/// Checks a payment's shards before anything is sent, returning the destination that all of them pay.
fn validate_shards(total_amt_msat: u64, shards: &[(Route, u64)]) -> Result<PublicKey, PaymentError> {
    let mut destination = None;

    for (i, (route, amount_msat)) in shards.iter().enumerate() {
        if *amount_msat == 0 {
            return Err(PaymentError::ZeroAmountShard(i));
        }

        route
            .validate()
            .map_err(|e| PaymentError::InvalidRoute(i, e))?;

        if route.final_value_msat() != *amount_msat {
            return Err(PaymentError::RouteAmountMismatch {
                shard_index: i,
                shard_msat: *amount_msat,
                route_msat: route.final_value_msat(),
            });
        }

        let dest = route
            .destination()
            .ok_or(PaymentError::InvalidRoute(i, RouteError::EmptyRoute))?;
        match destination {
            None => destination = Some(dest),
            Some(d) if d != dest => return Err(PaymentError::DestinationMismatch(i)),
            Some(_) => {},
        }
    }

    let sum = shards
        .iter()
        .try_fold(0u64, |acc, (_, amount)| acc.checked_add(*amount))
        .ok_or(PaymentError::AmountOverflow)?;

    if sum != total_amt_msat {
        return Err(PaymentError::ShardAmountMismatch {
            total: total_amt_msat,
            sum,
        });
    }

    destination.ok_or(PaymentError::NoShards)
}

/// Sends multi-part payments from a single node. Every shard of a payment is dispatched as its own task, and the
/// coordinator waits for all of them to report (or for its bounded wait to expire) before producing one result.
pub struct PaymentCoordinator {
    source: PublicKey,
    dispatcher: Arc<dyn ShardDispatcher>,
    store: Arc<PaymentStore>,
    cfg: PaymentConfig,
    /// Tracks in-flight shard tasks, which may outlive a payment that gave up waiting on them.
    tasks: TaskTracker,
}

impl PaymentCoordinator {
    pub fn new(
        source: PublicKey,
        dispatcher: Arc<dyn ShardDispatcher>,
        store: Arc<PaymentStore>,
        cfg: PaymentConfig,
    ) -> Self {
        PaymentCoordinator {
            source,
            dispatcher,
            store,
            cfg,
            tasks: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> Arc<PaymentStore> {
        self.store.clone()
    }

    /// Sends a payment split over the routes provided, each delivering the amount paired with it. The amounts must
    /// add up to the payment total. All shards are dispatched concurrently, and every attempt is recorded before
    /// the aggregated result is returned.
    pub async fn send_multi_path(
        &self,
        payment_hash: PaymentHash,
        payment_addr: PaymentSecret,
        total_amt_msat: u64,
        shards: Vec<(Route, u64)>,
    ) -> Result<PaymentResult, PaymentError> {
        if shards.is_empty() {
            return Err(PaymentError::NoShards);
        }

        let destination = validate_shards(total_amt_msat, &shards)?;
        let shard_count = shards.len();

        for (i, (route, _)) in shards.iter().enumerate() {
            self.dispatcher
                .check_route(self.source, route)
                .await
                .map_err(|e| PaymentError::InvalidRoute(i, e))?;
        }

        self.store
            .init_payment(
                payment_hash,
                payment_addr,
                total_amt_msat,
                destination,
                shard_count,
            )
            .await?;

        let mpp_record = MppRecord {
            payment_addr,
            total_amt_msat,
        };

        let mut dispatched = Vec::with_capacity(shard_count);
        for (shard_index, (mut route, amount_msat)) in shards.into_iter().enumerate() {
            route
                .attach_mpp_record(mpp_record)
                .map_err(|e| PaymentError::InvalidRoute(shard_index, e))?;

            dispatched.push(Shard {
                attempt_id: self.store.next_attempt_id(),
                shard_index,
                payment_hash,
                route,
                amount_msat,
                mpp_record,
                expiry: self.cfg.shard_timeout,
            });
        }

        log::info!(
            "Sending payment {} of {total_amt_msat} msat to {destination} in {shard_count} shards.",
            hex::encode(payment_hash.0)
        );

        // Each shard reports on a channel sized to the shard count, so no dispatcher ever blocks on reporting.
        let (sender, mut receiver) = mpsc::channel(shard_count);
        let dispatch_time = SystemTime::now();
        for shard in dispatched.iter().cloned() {
            let sender = sender.clone();
            let dispatcher = self.dispatcher.clone();
            let source = self.source;

            self.tasks.spawn(async move {
                log::debug!("Dispatching shard {} over {}.", shard.shard_index, shard.route);
                let attempt = dispatcher.send_shard(source, shard).await;
                if sender.send(attempt).await.is_err() {
                    log::debug!("Payment coordinator no longer waiting for shard result.");
                }
            });
        }
        drop(sender);

        let mut aggregator = ResultAggregator::new(payment_hash, shard_count);
        let deadline = Instant::now() + self.cfg.shard_timeout + self.cfg.resolution_grace;

        while !aggregator.is_complete() {
            match timeout_at(deadline, receiver.recv()).await {
                Ok(Some(attempt)) => {
                    log::debug!(
                        "Shard {} of payment {} resolved: {:?}.",
                        attempt.shard_index,
                        hex::encode(payment_hash.0),
                        attempt.status()
                    );
                    self.record(&payment_hash, &mut aggregator, attempt, false)
                        .await;
                },
                // Every dispatcher has exited, so any shard that has not reported never will.
                Ok(None) => {
                    for index in aggregator.missing() {
                        let attempt = HtlcAttempt::new(
                            dispatched[index].clone(),
                            Err(FailureReason::LocalFailure(
                                "shard dispatcher exited without a result".to_string(),
                            )),
                            dispatch_time,
                        );
                        self.record(&payment_hash, &mut aggregator, attempt, false)
                            .await;
                    }
                },
                Err(_) => {
                    log::warn!(
                        "Payment {} gave up waiting on {} shards.",
                        hex::encode(payment_hash.0),
                        aggregator.missing().len()
                    );

                    for index in aggregator.missing() {
                        let attempt = HtlcAttempt::new(
                            dispatched[index].clone(),
                            Err(FailureReason::ShardTimeout),
                            dispatch_time,
                        );
                        self.record(&payment_hash, &mut aggregator, attempt, true)
                            .await;
                    }
                },
            }
        }

        let result = aggregator.finalize();
        // The outcome stands even if its records could not be flushed.
        if let Err(e) = self.store.complete_payment(&payment_hash, &result).await {
            log::error!(
                "Could not complete records for payment {}: {e}.",
                hex::encode(payment_hash.0)
            );
        }

        log::info!(
            "Payment {} completed: {:?} ({} of {} shards succeeded).",
            hex::encode(payment_hash.0),
            result.payment_outcome,
            result.succeeded,
            result.htlc_count
        );

        Ok(result)
    }

    async fn record(
        &self,
        payment_hash: &PaymentHash,
        aggregator: &mut ResultAggregator,
        attempt: HtlcAttempt,
        unresolved: bool,
    ) {
        if let Err(e) = self.store.record_attempt(payment_hash, attempt.clone()).await {
            log::error!(
                "Could not record attempt {} for {}: {e}.",
                attempt.attempt_id,
                hex::encode(payment_hash.0)
            );
        }

        if unresolved {
            aggregator.record_unresolved(attempt);
        } else {
            aggregator.record(attempt);
        }
    }

    /// Waits for all shard tasks to exit. Tasks that are stuck in the network only exit once shutdown is triggered.
    pub async fn wait_for_shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
