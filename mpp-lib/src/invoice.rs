use crate::route::{MppRecord, DEFAULT_FINAL_CLTV_DELTA};
use crate::serializers;
use crate::sim_node::HtlcRef;
use bitcoin::hashes::{sha256::Hash as Sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use lightning::ln::{PaymentHash, PaymentPreimage, PaymentSecret};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::select;
use tokio::sync::{oneshot, Mutex};
use tokio_util::task::TaskTracker;
use triggered::Listener;

/// How long a partial set of htlcs is held before it is failed back, if it never reaches its total.
pub const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_secs(120);

/// Whether the recipient accepts a set of htlcs whose mpp total is larger than the invoice amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverpaymentPolicy {
    Reject,
    Accept,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub hold_timeout: Duration,
    pub overpayment: OverpaymentPolicy,
    pub min_final_cltv_expiry_delta: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            hold_timeout: DEFAULT_HOLD_TIMEOUT,
            overpayment: OverpaymentPolicy::Reject,
            min_final_cltv_expiry_delta: DEFAULT_FINAL_CLTV_DELTA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    Open,
    Settled,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceHtlcState {
    Accepted,
    Settled,
    Canceled,
}

/// A htlc that was accepted towards an invoice, and what eventually happened to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceHtlc {
    pub htlc: HtlcRef,
    pub amount_msat: u64,
    pub mpp_total_amt_msat: u64,
    pub state: InvoiceHtlcState,
    #[serde(with = "serde_millis")]
    pub accept_time: SystemTime,
    #[serde(with = "serializers::serde_option_system_time")]
    pub resolve_time: Option<SystemTime>,
}

/// Snapshot of an invoice held by the recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(with = "serializers::serde_payment_hash")]
    pub payment_hash: PaymentHash,
    #[serde(with = "serializers::serde_payment_secret")]
    pub payment_addr: PaymentSecret,
    #[serde(with = "serializers::serde_payment_preimage")]
    pub preimage: PaymentPreimage,
    pub total_amt_msat: u64,
    pub min_final_cltv_expiry_delta: u32,
    pub state: InvoiceState,
    pub htlcs: Vec<InvoiceHtlc>,
    pub amt_paid_msat: u64,
    pub add_index: u64,
    /// Zero until the invoice settles.
    pub settle_index: u64,
    #[serde(with = "serde_millis")]
    pub creation_time: SystemTime,
    #[serde(with = "serializers::serde_option_system_time")]
    pub settle_time: Option<SystemTime>,
}

impl Invoice {
    pub fn is_settled(&self) -> bool {
        self.state == InvoiceState::Settled
    }

    /// Returns the number of htlcs that the invoice was settled with.
    pub fn settled_htlc_count(&self) -> usize {
        self.htlcs
            .iter()
            .filter(|h| h.state == InvoiceHtlcState::Settled)
            .count()
    }
}

/// The terms that a sender needs to pay an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub destination: PublicKey,
    #[serde(with = "serializers::serde_payment_hash")]
    pub payment_hash: PaymentHash,
    #[serde(with = "serializers::serde_payment_secret")]
    pub payment_addr: PaymentSecret,
    pub total_amt_msat: u64,
    pub min_final_cltv_expiry_delta: u32,
}

/// A htlc that has arrived at the recipient, along with the terms that its final hop was given.
#[derive(Debug, Clone)]
pub struct AcceptRequest {
    pub payment_hash: PaymentHash,
    pub htlc: HtlcRef,
    /// The amount actually carried by the htlc.
    pub amount_msat: u64,
    /// The amount that the final hop of the route says should have arrived.
    pub expected_amount_msat: u64,
    pub cltv_expiry: u32,
    pub mpp_record: Option<MppRecord>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("UnknownInvoice")]
    UnknownInvoice,
    #[error("InvoiceCanceled")]
    InvoiceCanceled,
    #[error("MissingMppRecord")]
    MissingMppRecord,
    #[error("AddressMismatch")]
    AddressMismatch,
    #[error("AlreadySettled")]
    AlreadySettled,
    #[error("AmountMismatch")]
    AmountMismatch,
    #[error("FinalExpiryTooSoon")]
    FinalExpiryTooSoon,
    #[error("TotalTooLow")]
    TotalTooLow,
    #[error("Overpayment")]
    Overpayment,
    #[error("TotalMismatch")]
    TotalMismatch,
}

/// The reasons that a held htlc can be failed back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldFailure {
    /// The set that the htlc belongs to did not complete within the hold timeout.
    MppTimeout,
    /// The sender's deadline for the htlc passed.
    Expired,
    /// The invoice was canceled.
    Canceled,
    Shutdown,
}

/// Sent to the holder of an accepted htlc once the recipient has decided what to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcResolution {
    Settle(PaymentPreimage),
    Fail(HoldFailure),
}

#[derive(Debug)]
pub enum AcceptDecision {
    /// The htlc is held, and will be resolved through the receiver provided.
    Hold(oneshot::Receiver<HtlcResolution>),
    Reject(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleDecision {
    Settled {
        preimage: PaymentPreimage,
        htlcs: Vec<HtlcRef>,
    },
    StillWaiting {
        held_msat: u64,
        total_msat: u64,
    },
    Canceled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvoiceError {
    #[error("UnknownInvoice: {0}")]
    UnknownInvoice(String),
    #[error("DuplicateInvoice: {0}")]
    DuplicateInvoice(String),
    #[error("ZeroAmount")]
    ZeroAmount,
    #[error("AlreadySettled: {0}")]
    AlreadySettled(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListInvoiceQuery {
    /// Only invoices with an add index greater than this offset are returned.
    pub index_offset: u64,
    /// Maximum number of invoices returned, zero for no limit.
    pub num_max_invoices: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListInvoiceResponse {
    pub invoices: Vec<Invoice>,
    pub first_index_offset: u64,
    pub last_index_offset: u64,
}

struct HeldHtlc {
    htlc: HtlcRef,
    amount_msat: u64,
    resolver: oneshot::Sender<HtlcResolution>,
}

struct InvoiceEntry {
    invoice: Invoice,
    held: Vec<HeldHtlc>,
    /// The mpp total of the set currently being held, None if nothing is held.
    set_total_msat: Option<u64>,
    /// Bumped every time the held set is emptied so that stale hold timers do nothing.
    set_generation: u64,
}

impl InvoiceEntry {
    fn held_msat(&self) -> u64 {
        self.held.iter().map(|h| h.amount_msat).sum()
    }

    fn reset_set(&mut self) {
        self.set_total_msat = None;
        self.set_generation += 1;
    }

    fn mark_htlc(&mut self, htlc: HtlcRef, state: InvoiceHtlcState, now: SystemTime) {
        if let Some(h) = self
            .invoice
            .htlcs
            .iter_mut()
            .find(|h| h.htlc == htlc && h.state == InvoiceHtlcState::Accepted)
        {
            h.state = state;
            h.resolve_time = Some(now);
        }
    }

    /// Fails back every held htlc with the reason provided and starts a fresh set.
    fn fail_held(&mut self, failure: HoldFailure) -> usize {
        let now = SystemTime::now();
        let held = std::mem::take(&mut self.held);
        let count = held.len();

        for h in held {
            self.mark_htlc(h.htlc, InvoiceHtlcState::Canceled, now);
            if h.resolver.send(HtlcResolution::Fail(failure)).is_err() {
                log::debug!("Holder of htlc {} no longer waiting for failure.", h.htlc);
            }
        }

        self.reset_set();
        count
    }

    /// Settles the invoice if the held set has reached its total. This is the only place that an invoice moves to
    /// settled, and it must be called with the registry lock held so that exactly one arrival settles the set.
    fn settle_if_complete(&mut self, next_settle_index: &mut u64) -> SettleDecision {
        match self.invoice.state {
            InvoiceState::Canceled => return SettleDecision::Canceled,
            InvoiceState::Settled => {
                return SettleDecision::Settled {
                    preimage: self.invoice.preimage,
                    htlcs: self
                        .invoice
                        .htlcs
                        .iter()
                        .filter(|h| h.state == InvoiceHtlcState::Settled)
                        .map(|h| h.htlc)
                        .collect(),
                }
            },
            InvoiceState::Open => {},
        }

        let held_msat = self.held_msat();
        let total_msat = self.set_total_msat.unwrap_or(self.invoice.total_amt_msat);
        if self.held.is_empty() || held_msat < total_msat {
            return SettleDecision::StillWaiting {
                held_msat,
                total_msat,
            };
        }

        let now = SystemTime::now();
        *next_settle_index += 1;
        self.invoice.state = InvoiceState::Settled;
        self.invoice.amt_paid_msat = held_msat;
        self.invoice.settle_index = *next_settle_index;
        self.invoice.settle_time = Some(now);

        let preimage = self.invoice.preimage;
        let held = std::mem::take(&mut self.held);
        let mut htlcs = Vec::with_capacity(held.len());
        for h in held {
            self.mark_htlc(h.htlc, InvoiceHtlcState::Settled, now);
            htlcs.push(h.htlc);
            if h.resolver.send(HtlcResolution::Settle(preimage)).is_err() {
                log::warn!("Holder of settled htlc {} no longer waiting.", h.htlc);
            }
        }
        self.reset_set();

        SettleDecision::Settled { preimage, htlcs }
    }
}

#[derive(Default)]
struct RegistryState {
    invoices: HashMap<PaymentHash, InvoiceEntry>,
    /// Payment hashes in the order that invoices were added.
    order: Vec<PaymentHash>,
    next_add_index: u64,
    next_settle_index: u64,
}

/// The invoices of a single receiving node. Incoming htlcs are grouped into sets by payment hash and checked against
/// the invoice's payment address and amount. Valid htlcs are held until the set reaches its total, at which point the
/// preimage is released to all of them at once. Incomplete sets are failed back when the hold timeout expires.
pub struct InvoiceRegistry {
    node: PublicKey,
    cfg: RegistryConfig,
    state: Arc<Mutex<RegistryState>>,
    /// Tracks hold timers.
    tasks: TaskTracker,
    shutdown_listener: Listener,
}

impl InvoiceRegistry {
    pub fn new(node: PublicKey, cfg: RegistryConfig, shutdown_listener: Listener) -> Self {
        InvoiceRegistry {
            node,
            cfg,
            state: Arc::new(Mutex::new(RegistryState::default())),
            tasks: TaskTracker::new(),
            shutdown_listener,
        }
    }

    pub fn node(&self) -> PublicKey {
        self.node
    }

    /// Creates an open invoice for the amount provided. If no preimage is given, a random one is generated.
    pub async fn add_invoice(
        &self,
        amount_msat: u64,
        preimage: Option<PaymentPreimage>,
    ) -> Result<PaymentRequest, InvoiceError> {
        if amount_msat == 0 {
            return Err(InvoiceError::ZeroAmount);
        }

        let preimage = preimage.unwrap_or_else(|| PaymentPreimage(rand::random()));
        let payment_hash = PaymentHash(Sha256::hash(&preimage.0).to_byte_array());
        let payment_addr = PaymentSecret(rand::random());

        let mut state = self.state.lock().await;
        if state.invoices.contains_key(&payment_hash) {
            return Err(InvoiceError::DuplicateInvoice(hex::encode(payment_hash.0)));
        }

        state.next_add_index += 1;
        let invoice = Invoice {
            payment_hash,
            payment_addr,
            preimage,
            total_amt_msat: amount_msat,
            min_final_cltv_expiry_delta: self.cfg.min_final_cltv_expiry_delta,
            state: InvoiceState::Open,
            htlcs: Vec::new(),
            amt_paid_msat: 0,
            add_index: state.next_add_index,
            settle_index: 0,
            creation_time: SystemTime::now(),
            settle_time: None,
        };

        state.invoices.insert(
            payment_hash,
            InvoiceEntry {
                invoice,
                held: Vec::new(),
                set_total_msat: None,
                set_generation: 0,
            },
        );
        state.order.push(payment_hash);

        log::info!(
            "Node {} added invoice {} for {amount_msat} msat.",
            self.node,
            hex::encode(payment_hash.0)
        );

        Ok(PaymentRequest {
            destination: self.node,
            payment_hash,
            payment_addr,
            total_amt_msat: amount_msat,
            min_final_cltv_expiry_delta: self.cfg.min_final_cltv_expiry_delta,
        })
    }

    /// Decides whether to hold or reject an incoming htlc. Held htlcs are resolved through the receiver returned in
    /// [`AcceptDecision::Hold`], which may already be resolved if this htlc completed its set.
    pub async fn accept_shard(&self, req: AcceptRequest) -> AcceptDecision {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let entry = match state.invoices.get_mut(&req.payment_hash) {
            Some(e) => e,
            None => return self.reject(&req, RejectReason::UnknownInvoice),
        };

        let mpp = match check_htlc(entry, &req, &self.cfg) {
            Ok(mpp) => mpp,
            Err(reason) => return self.reject(&req, reason),
        };

        let (resolver, receiver) = oneshot::channel();
        entry.invoice.htlcs.push(InvoiceHtlc {
            htlc: req.htlc,
            amount_msat: req.amount_msat,
            mpp_total_amt_msat: mpp.total_amt_msat,
            state: InvoiceHtlcState::Accepted,
            accept_time: SystemTime::now(),
            resolve_time: None,
        });
        entry.held.push(HeldHtlc {
            htlc: req.htlc,
            amount_msat: req.amount_msat,
            resolver,
        });

        // The first htlc of a set fixes the set's total and starts its hold timer.
        if entry.set_total_msat.is_none() {
            entry.set_total_msat = Some(mpp.total_amt_msat);
            self.start_hold_timer(req.payment_hash, entry.set_generation);
        }

        log::debug!(
            "Node {} holding htlc {} for {}: {} of {} msat.",
            self.node,
            req.htlc,
            hex::encode(req.payment_hash.0),
            entry.held_msat(),
            mpp.total_amt_msat
        );

        if let SettleDecision::Settled { htlcs, .. } =
            entry.settle_if_complete(&mut state.next_settle_index)
        {
            log::info!(
                "Node {} settled invoice {} with {} htlcs.",
                self.node,
                hex::encode(req.payment_hash.0),
                htlcs.len()
            );
        }

        AcceptDecision::Hold(receiver)
    }

    fn reject(&self, req: &AcceptRequest, reason: RejectReason) -> AcceptDecision {
        if reason == RejectReason::AddressMismatch {
            log::warn!(
                "Node {} rejected htlc {} for {}: payment address mismatch.",
                self.node,
                req.htlc,
                hex::encode(req.payment_hash.0)
            );
        } else {
            log::debug!(
                "Node {} rejected htlc {} for {}: {reason}.",
                self.node,
                req.htlc,
                hex::encode(req.payment_hash.0)
            );
        }

        AcceptDecision::Reject(reason)
    }

    fn start_hold_timer(&self, payment_hash: PaymentHash, generation: u64) {
        let state = self.state.clone();
        let listener = self.shutdown_listener.clone();
        let hold_timeout = self.cfg.hold_timeout;
        let node = self.node;

        self.tasks.spawn(async move {
            let failure = select! {
                biased;
                _ = listener => HoldFailure::Shutdown,
                _ = tokio::time::sleep(hold_timeout) => HoldFailure::MppTimeout,
            };

            let mut state = state.lock().await;
            if let Some(entry) = state.invoices.get_mut(&payment_hash) {
                // The set was settled or emptied in the meantime.
                if entry.set_generation != generation || entry.held.is_empty() {
                    return;
                }

                let count = entry.fail_held(failure);
                log::info!(
                    "Node {node} failed back {count} held htlcs for {}: {failure:?}.",
                    hex::encode(payment_hash.0)
                );
            }
        });
    }

    /// Settles the invoice if the htlcs currently held have reached the set's total.
    pub async fn try_settle(&self, payment_hash: &PaymentHash) -> Result<SettleDecision, InvoiceError> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let entry = state
            .invoices
            .get_mut(payment_hash)
            .ok_or_else(|| InvoiceError::UnknownInvoice(hex::encode(payment_hash.0)))?;

        Ok(entry.settle_if_complete(&mut state.next_settle_index))
    }

    /// Fails back a single held htlc, returning false if it is no longer held (for example because it was settled).
    pub async fn expire_htlc(
        &self,
        payment_hash: &PaymentHash,
        htlc: HtlcRef,
        failure: HoldFailure,
    ) -> bool {
        let mut state = self.state.lock().await;
        let entry = match state.invoices.get_mut(payment_hash) {
            Some(e) => e,
            None => return false,
        };

        let position = match entry.held.iter().position(|h| h.htlc == htlc) {
            Some(p) => p,
            None => return false,
        };

        let held = entry.held.remove(position);
        entry.mark_htlc(htlc, InvoiceHtlcState::Canceled, SystemTime::now());
        if held.resolver.send(HtlcResolution::Fail(failure)).is_err() {
            log::debug!("Holder of htlc {htlc} no longer waiting for failure.");
        }

        if entry.held.is_empty() {
            entry.reset_set();
        }

        log::debug!(
            "Node {} failed back htlc {htlc} for {}: {failure:?}.",
            self.node,
            hex::encode(payment_hash.0)
        );

        true
    }

    /// Cancels an open invoice, failing back any htlcs that are held for it. Canceling twice is a no-op.
    pub async fn cancel_invoice(&self, payment_hash: &PaymentHash) -> Result<(), InvoiceError> {
        let mut state = self.state.lock().await;
        let entry = state
            .invoices
            .get_mut(payment_hash)
            .ok_or_else(|| InvoiceError::UnknownInvoice(hex::encode(payment_hash.0)))?;

        match entry.invoice.state {
            InvoiceState::Settled => Err(InvoiceError::AlreadySettled(hex::encode(payment_hash.0))),
            InvoiceState::Canceled => Ok(()),
            InvoiceState::Open => {
                entry.invoice.state = InvoiceState::Canceled;
                let count = entry.fail_held(HoldFailure::Canceled);
                log::info!(
                    "Node {} canceled invoice {}, failed back {count} htlcs.",
                    self.node,
                    hex::encode(payment_hash.0)
                );
                Ok(())
            },
        }
    }

    pub async fn lookup_invoice(&self, payment_hash: &PaymentHash) -> Result<Invoice, InvoiceError> {
        self.state
            .lock()
            .await
            .invoices
            .get(payment_hash)
            .map(|e| e.invoice.clone())
            .ok_or_else(|| InvoiceError::UnknownInvoice(hex::encode(payment_hash.0)))
    }

    /// Lists invoices in the order they were added, starting after the query's index offset.
    pub async fn list_invoices(&self, query: ListInvoiceQuery) -> ListInvoiceResponse {
        let state = self.state.lock().await;
        let limit = match query.num_max_invoices {
            0 => usize::MAX,
            n => n,
        };

        let invoices: Vec<Invoice> = state
            .order
            .iter()
            .filter_map(|hash| state.invoices.get(hash))
            .filter(|e| e.invoice.add_index > query.index_offset)
            .take(limit)
            .map(|e| e.invoice.clone())
            .collect();

        ListInvoiceResponse {
            first_index_offset: invoices.first().map(|i| i.add_index).unwrap_or(0),
            last_index_offset: invoices.last().map(|i| i.add_index).unwrap_or(0),
            invoices,
        }
    }

    /// Waits for all hold timers to exit. Timers only exit early once shutdown has been triggered.
    pub async fn wait_for_shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Runs the recipient's checks on an incoming htlc in order, returning the mpp record it carries if it may be held.
fn check_htlc(
    entry: &InvoiceEntry,
    req: &AcceptRequest,
    cfg: &RegistryConfig,
) -> Result<MppRecord, RejectReason> {
    let invoice = &entry.invoice;
    if invoice.state == InvoiceState::Canceled {
        return Err(RejectReason::InvoiceCanceled);
    }

    let mpp = req.mpp_record.ok_or(RejectReason::MissingMppRecord)?;

    // The address is checked before anything else about the invoice is revealed to the sender.
    if mpp.payment_addr != invoice.payment_addr {
        return Err(RejectReason::AddressMismatch);
    }

    if invoice.state == InvoiceState::Settled {
        return Err(RejectReason::AlreadySettled);
    }

    if req.amount_msat < req.expected_amount_msat {
        return Err(RejectReason::AmountMismatch);
    }

    if req.cltv_expiry < invoice.min_final_cltv_expiry_delta {
        return Err(RejectReason::FinalExpiryTooSoon);
    }

    if mpp.total_amt_msat < invoice.total_amt_msat {
        return Err(RejectReason::TotalTooLow);
    }

    if mpp.total_amt_msat > invoice.total_amt_msat && cfg.overpayment == OverpaymentPolicy::Reject {
        return Err(RejectReason::Overpayment);
    }

    if let Some(set_total) = entry.set_total_msat {
        if set_total != mpp.total_amt_msat {
            return Err(RejectReason::TotalMismatch);
        }
    }

    if entry.held_msat() + req.amount_msat > mpp.total_amt_msat {
        return Err(RejectReason::Overpayment);
    }

    Ok(mpp)
}
