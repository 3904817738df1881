use crate::batched_writer::BatchedWriter;
use crate::payment::{FailureReason, HtlcAttempt, HtlcStatus, PaymentError};
use crate::serializers;
use crate::SimulationError;
use bitcoin::hashes::{sha256::Hash as Sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use lightning::ln::{PaymentHash, PaymentPreimage, PaymentSecret};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PaymentFailureReason {
    /// The first shard failure to be reported.
    Shard(FailureReason),
    /// Succeeded shards disagree on the preimage, or it does not match the payment hash.
    InconsistentPreimage,
    /// A shard did not report before the coordinator stopped waiting for it.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PaymentOutcome {
    Success,
    Failed(PaymentFailureReason),
}

/// The consolidated result of all shards of a payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentResult {
    #[serde(with = "serializers::serde_payment_hash")]
    pub payment_hash: PaymentHash,
    pub htlc_count: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(with = "serializers::serde_option_payment_preimage")]
    pub preimage: Option<PaymentPreimage>,
    pub payment_outcome: PaymentOutcome,
}

impl PaymentResult {
    pub fn is_success(&self) -> bool {
        self.payment_outcome == PaymentOutcome::Success
    }
}

/// Collects the attempts of a payment's shards as they arrive, in any order, into one slot per shard.
pub struct ResultAggregator {
    payment_hash: PaymentHash,
    slots: Vec<Option<HtlcAttempt>>,
    /// Shard indexes in the order that their attempts arrived.
    arrival: Vec<usize>,
    unresolved: Vec<usize>,
}

impl ResultAggregator {
    pub fn new(payment_hash: PaymentHash, shard_count: usize) -> Self {
        ResultAggregator {
            payment_hash,
            slots: vec![None; shard_count],
            arrival: Vec::with_capacity(shard_count),
            unresolved: Vec::new(),
        }
    }

    /// Records a shard's attempt, returning false if the shard is unknown or already has an attempt.
    pub fn record(&mut self, attempt: HtlcAttempt) -> bool {
        let index = attempt.shard_index;
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(attempt);
                self.arrival.push(index);
                true
            },
            Some(_) => {
                log::warn!(
                    "Duplicate attempt for shard {index} of {}.",
                    hex::encode(self.payment_hash.0)
                );
                false
            },
            None => {
                log::warn!(
                    "Attempt for unknown shard {index} of {}.",
                    hex::encode(self.payment_hash.0)
                );
                false
            },
        }
    }

    /// Records the stand-in attempt for a shard that never reported.
    pub fn record_unresolved(&mut self, attempt: HtlcAttempt) -> bool {
        let index = attempt.shard_index;
        let recorded = self.record(attempt);
        if recorded {
            self.unresolved.push(index);
        }
        recorded
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    /// Returns the indexes of shards that have not yet reported.
    pub fn missing(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Produces the payment's result. The payment only succeeds if every shard succeeded with the same preimage, and
    /// that preimage hashes to the payment hash. Otherwise the first reported failure is used.
    pub fn finalize(self) -> PaymentResult {
        let attempts: Vec<&HtlcAttempt> = self
            .arrival
            .iter()
            .filter_map(|i| self.slots[*i].as_ref())
            .collect();

        let succeeded = attempts
            .iter()
            .filter(|a| a.status() == HtlcStatus::Succeeded)
            .count();
        let failed = attempts.len() - succeeded;

        let first_failure = attempts
            .iter()
            .filter(|a| !self.unresolved.contains(&a.shard_index))
            .find_map(|a| a.failure().cloned());

        let preimages: Vec<PaymentPreimage> = attempts.iter().filter_map(|a| a.preimage()).collect();
        let consistent = preimages.windows(2).all(|w| w[0] == w[1])
            && preimages
                .first()
                .map(|p| Sha256::hash(&p.0).to_byte_array() == self.payment_hash.0)
                .unwrap_or(true);

        let payment_outcome = if self.slots.is_empty() || attempts.len() < self.slots.len() {
            PaymentOutcome::Failed(PaymentFailureReason::Unresolved)
        } else if let Some(reason) = first_failure {
            PaymentOutcome::Failed(PaymentFailureReason::Shard(reason))
        } else if !self.unresolved.is_empty() {
            PaymentOutcome::Failed(PaymentFailureReason::Unresolved)
        } else if !consistent {
            PaymentOutcome::Failed(PaymentFailureReason::InconsistentPreimage)
        } else {
            PaymentOutcome::Success
        };

        PaymentResult {
            payment_hash: self.payment_hash,
            htlc_count: attempts.len(),
            succeeded,
            failed,
            preimage: if consistent {
                preimages.first().copied()
            } else {
                None
            },
            payment_outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    InFlight,
    Succeeded,
    Failed,
}

/// The sender's record of a payment and every attempt made for it.
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    #[serde(with = "serializers::serde_payment_hash")]
    pub payment_hash: PaymentHash,
    #[serde(with = "serializers::serde_payment_secret")]
    pub payment_addr: PaymentSecret,
    pub total_amt_msat: u64,
    pub destination: PublicKey,
    /// Number of shards in the most recent send.
    pub shard_count: usize,
    pub status: PaymentStatus,
    pub attempts: Vec<HtlcAttempt>,
    #[serde(with = "serializers::serde_option_payment_preimage")]
    pub preimage: Option<PaymentPreimage>,
    pub failure_reason: Option<PaymentFailureReason>,
    pub payment_index: u64,
    #[serde(with = "serde_millis")]
    pub creation_time: SystemTime,
}

impl Payment {
    pub fn succeeded_htlcs(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status() == HtlcStatus::Succeeded)
            .count()
    }
}

/// Flattened attempt, as written to the attempts csv.
#[derive(Debug, Serialize)]
struct AttemptRecord {
    #[serde(with = "serializers::serde_payment_hash")]
    payment_hash: PaymentHash,
    attempt_id: u64,
    shard_index: usize,
    amount_msat: u64,
    fee_msat: u64,
    hops: usize,
    status: HtlcStatus,
    failure: String,
    #[serde(with = "serializers::serde_option_payment_preimage")]
    preimage: Option<PaymentPreimage>,
    #[serde(with = "serde_millis")]
    attempt_time: SystemTime,
    #[serde(with = "serde_millis")]
    resolve_time: SystemTime,
}

impl AttemptRecord {
    fn new(payment_hash: PaymentHash, attempt: &HtlcAttempt) -> Self {
        AttemptRecord {
            payment_hash,
            attempt_id: attempt.attempt_id,
            shard_index: attempt.shard_index,
            amount_msat: attempt.amount_msat,
            fee_msat: attempt.route.fee_msat(),
            hops: attempt.route.hops.len(),
            status: attempt.status(),
            failure: attempt.failure().map(|f| f.to_string()).unwrap_or_default(),
            preimage: attempt.preimage(),
            attempt_time: attempt.attempt_time,
            resolve_time: attempt.resolve_time,
        }
    }
}

#[derive(Default)]
struct StoreState {
    payments: HashMap<PaymentHash, Payment>,
    next_payment_index: u64,
}

/// Keeps the sender's payments, enforcing that a payment hash is only ever paid once. When a writer is provided,
/// every attempt is also written out as a csv record.
pub struct PaymentStore {
    state: Mutex<StoreState>,
    writer: Option<Mutex<BatchedWriter>>,
    /// Attempt ids are unique across every coordinator that shares the store.
    next_attempt_id: AtomicU64,
}

impl PaymentStore {
    pub fn new(writer: Option<BatchedWriter>) -> Self {
        PaymentStore {
            state: Mutex::new(StoreState::default()),
            writer: writer.map(Mutex::new),
            next_attempt_id: AtomicU64::new(0),
        }
    }

    pub fn next_attempt_id(&self) -> u64 {
        self.next_attempt_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Starts tracking a payment, failing if it already succeeded or is still in flight. A payment that failed may
    /// be started again, keeping the attempts of its earlier sends.
    pub async fn init_payment(
        &self,
        payment_hash: PaymentHash,
        payment_addr: PaymentSecret,
        total_amt_msat: u64,
        destination: PublicKey,
        shard_count: usize,
    ) -> Result<(), PaymentError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.payments.get_mut(&payment_hash) {
            return match existing.status {
                PaymentStatus::Succeeded => Err(PaymentError::AlreadyPaid(hex::encode(payment_hash.0))),
                PaymentStatus::InFlight => Err(PaymentError::PaymentInFlight(hex::encode(payment_hash.0))),
                PaymentStatus::Failed => {
                    log::info!(
                        "Resending failed payment {} with {shard_count} shards.",
                        hex::encode(payment_hash.0)
                    );
                    existing.payment_addr = payment_addr;
                    existing.total_amt_msat = total_amt_msat;
                    existing.destination = destination;
                    existing.shard_count = shard_count;
                    existing.status = PaymentStatus::InFlight;
                    existing.preimage = None;
                    existing.failure_reason = None;
                    Ok(())
                },
            };
        }

        state.next_payment_index += 1;
        let payment_index = state.next_payment_index;
        state.payments.insert(
            payment_hash,
            Payment {
                payment_hash,
                payment_addr,
                total_amt_msat,
                destination,
                shard_count,
                status: PaymentStatus::InFlight,
                attempts: Vec::new(),
                preimage: None,
                failure_reason: None,
                payment_index,
                creation_time: SystemTime::now(),
            },
        );

        Ok(())
    }

    /// Appends a terminal attempt to its payment, queueing it to the writer if one is configured.
    pub async fn record_attempt(
        &self,
        payment_hash: &PaymentHash,
        attempt: HtlcAttempt,
    ) -> Result<(), SimulationError> {
        let record = AttemptRecord::new(*payment_hash, &attempt);

        match self.state.lock().await.payments.get_mut(payment_hash) {
            Some(payment) => payment.attempts.push(attempt),
            None => {
                return Err(SimulationError::SimulatedNetworkError(format!(
                    "attempt for unknown payment {}",
                    hex::encode(payment_hash.0)
                )))
            },
        }

        if let Some(writer) = &self.writer {
            writer.lock().await.queue(record)?;
        }

        Ok(())
    }

    /// Moves the payment to its terminal state and flushes any attempts still waiting to be written.
    pub async fn complete_payment(
        &self,
        payment_hash: &PaymentHash,
        result: &PaymentResult,
    ) -> Result<(), SimulationError> {
        match self.state.lock().await.payments.get_mut(payment_hash) {
            Some(payment) => match &result.payment_outcome {
                PaymentOutcome::Success => {
                    payment.status = PaymentStatus::Succeeded;
                    payment.preimage = result.preimage;
                },
                PaymentOutcome::Failed(reason) => {
                    payment.status = PaymentStatus::Failed;
                    payment.failure_reason = Some(reason.clone());
                },
            },
            None => {
                return Err(SimulationError::SimulatedNetworkError(format!(
                    "completion for unknown payment {}",
                    hex::encode(payment_hash.0)
                )))
            },
        }

        if let Some(writer) = &self.writer {
            writer.lock().await.write(true)?;
        }

        Ok(())
    }

    pub async fn lookup_payment(&self, payment_hash: &PaymentHash) -> Option<Payment> {
        self.state.lock().await.payments.get(payment_hash).cloned()
    }

    /// Lists payments in the order they were created. Only succeeded payments are listed unless incomplete ones
    /// (in flight or failed) are requested.
    pub async fn list_payments(&self, include_incomplete: bool) -> Vec<Payment> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| include_incomplete || p.status == PaymentStatus::Succeeded)
            .cloned()
            .collect();

        payments.sort_by_key(|p| p.payment_index);
        payments
    }

    pub async fn list_attempts(&self, payment_hash: &PaymentHash) -> Option<Vec<HtlcAttempt>> {
        self.state
            .lock()
            .await
            .payments
            .get(payment_hash)
            .map(|p| p.attempts.clone())
    }
}
