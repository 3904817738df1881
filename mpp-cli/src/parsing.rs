use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use bitcoin::hashes::{sha256::Hash as Sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use mpp_lib::batched_writer::BatchedWriter;
use mpp_lib::invoice::{Invoice, InvoiceRegistry};
use mpp_lib::latency_interceptor::LatencyInterceptor;
use mpp_lib::payment::{PaymentCoordinator, ShardDispatcher};
use mpp_lib::results::{Payment, PaymentResult, PaymentStore};
use mpp_lib::sim_node::{ChannelPolicy, SimGraph, SimulatedChannel};
use mpp_lib::ShortChannelID;
use serde::{Deserialize, Serialize};
use triggered::{Listener, Trigger};

use crate::config::MppConfig;

/// Name of the csv file that htlc attempts are written to, inside the results directory.
pub const ATTEMPTS_FILE: &str = "htlc_attempts.csv";

/// The network and the payment to send over it, as described in a scenario file. Nodes are referred to by alias
/// throughout, and each alias is given a deterministic key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub channels: Vec<ChannelParser>,
    pub payment: PaymentParser,
    /// Channels that are disabled before the payment is sent.
    #[serde(default)]
    pub disabled_channels: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelParser {
    pub scid: u64,
    pub capacity_msat: u64,
    pub node_1: String,
    pub node_2: String,
    /// The balance held by node_1, defaults to the full capacity as if node_1 had just opened the channel.
    #[serde(default)]
    pub node_1_balance_msat: Option<u64>,
    #[serde(default)]
    pub node_1_policy: PolicyParser,
    #[serde(default)]
    pub node_2_policy: PolicyParser,
}

/// Forwarding policy of one side of a channel. Any field left out takes a permissive default sized to the channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyParser {
    pub max_htlc_count: Option<u64>,
    pub max_in_flight_msat: Option<u64>,
    pub min_htlc_size_msat: Option<u64>,
    pub max_htlc_size_msat: Option<u64>,
    pub cltv_expiry_delta: Option<u32>,
    pub base_fee: Option<u64>,
    pub fee_rate_prop: Option<u64>,
}

impl PolicyParser {
    fn into_policy(self, pubkey: PublicKey, capacity_msat: u64) -> ChannelPolicy {
        ChannelPolicy {
            pubkey,
            max_htlc_count: self.max_htlc_count.unwrap_or(483),
            max_in_flight_msat: self.max_in_flight_msat.unwrap_or(capacity_msat),
            min_htlc_size_msat: self.min_htlc_size_msat.unwrap_or(1),
            max_htlc_size_msat: self.max_htlc_size_msat.unwrap_or(capacity_msat),
            cltv_expiry_delta: self.cltv_expiry_delta.unwrap_or(40),
            base_fee: self.base_fee.unwrap_or(1_000),
            fee_rate_prop: self.fee_rate_prop.unwrap_or(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentParser {
    pub sender: String,
    pub receiver: String,
    pub amount_msat: u64,
    pub shards: Vec<ShardParser>,
}

/// One shard of the payment: the hops it takes after leaving the sender (ending at the receiver) and the amount
/// it delivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardParser {
    pub hops: Vec<String>,
    pub amount_msat: u64,
}

/// Everything that a scenario run produces, printed once the payment has completed.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub result: PaymentResult,
    pub payment: Option<Payment>,
    pub invoice: Invoice,
}

/// The engine wired up for one scenario, ready to send its payment.
pub struct ScenarioRun {
    pub graph: Arc<SimGraph>,
    pub registry: Arc<InvoiceRegistry>,
    pub coordinator: PaymentCoordinator,
    aliases: HashMap<String, PublicKey>,
    payment: PaymentParser,
}

/// Derives the key of a node from its alias, so that the same alias always maps to the same node.
pub fn node_pubkey(alias: &str) -> anyhow::Result<PublicKey> {
    let secret = Sha256::hash(alias.as_bytes()).to_byte_array();
    let sk = SecretKey::from_slice(&secret)
        .map_err(|e| anyhow!("could not derive key for alias {alias}: {e}"))?;

    Ok(PublicKey::from_secret_key(&Secp256k1::new(), &sk))
}

/// Reads the scenario at the path provided.
pub fn parse_scenario(path: &Path) -> anyhow::Result<Scenario> {
    serde_json::from_str(&fs::read_to_string(path)?).map_err(|e| {
        anyhow!(
            "Could not deserialize network or payment description from scenario file (line {}, col {}, err: {}).",
            e.line(),
            e.column(),
            e.to_string()
        )
    })
}

/// Resolves the scenario file, which may be given relative to the data directory.
pub fn read_scenario_path(data_dir: &Path, scenario_file: &Path) -> anyhow::Result<PathBuf> {
    if scenario_file.exists() {
        return Ok(scenario_file.to_path_buf());
    }

    if scenario_file.is_relative() {
        let scenario_path = data_dir.join(scenario_file);
        if scenario_path.exists() {
            return Ok(scenario_path);
        }
    }

    anyhow::bail!(
        "Scenario file '{}' does not exist.",
        scenario_file.display()
    )
}

/// Maps every alias that appears in the scenario's channels to its key, failing on empty aliases or a channel that
/// connects a node to itself.
fn alias_map(channels: &[ChannelParser]) -> anyhow::Result<HashMap<String, PublicKey>> {
    let mut aliases = HashMap::new();

    for channel in channels {
        if channel.node_1 == channel.node_2 {
            anyhow::bail!("channel {} connects {} to itself.", channel.scid, channel.node_1);
        }

        for alias in [&channel.node_1, &channel.node_2] {
            if alias.is_empty() {
                anyhow::bail!("channel {} has an empty alias.", channel.scid);
            }

            if !aliases.contains_key(alias) {
                let pubkey = node_pubkey(alias)?;
                log::info!("Node {alias} - Node ID: {pubkey}.");
                aliases.insert(alias.clone(), pubkey);
            }
        }
    }

    Ok(aliases)
}

fn lookup_alias(aliases: &HashMap<String, PublicKey>, alias: &str) -> anyhow::Result<PublicKey> {
    aliases
        .get(alias)
        .copied()
        .ok_or_else(|| anyhow!("node {alias} has no channels in the scenario."))
}

/// Builds the simulated network, the receiver's invoice registry and the sender's coordinator for a scenario.
pub async fn create_scenario(
    cfg: &MppConfig,
    scenario: Scenario,
    shutdown_trigger: Trigger,
    shutdown_listener: Listener,
) -> anyhow::Result<ScenarioRun> {
    let Scenario {
        channels,
        payment,
        disabled_channels,
    } = scenario;

    let aliases = alias_map(&channels)?;
    let sender = lookup_alias(&aliases, &payment.sender)?;
    let receiver = lookup_alias(&aliases, &payment.receiver)?;

    let mut sim_channels = Vec::with_capacity(channels.len());
    for channel in channels {
        let node_1 = lookup_alias(&aliases, &channel.node_1)?;
        let node_2 = lookup_alias(&aliases, &channel.node_2)?;

        sim_channels.push(SimulatedChannel::new_with_balance(
            channel.capacity_msat,
            ShortChannelID::from(channel.scid),
            channel.node_1_policy.into_policy(node_1, channel.capacity_msat),
            channel.node_2_policy.into_policy(node_2, channel.capacity_msat),
            channel
                .node_1_balance_msat
                .unwrap_or(channel.capacity_msat),
        )?);
    }

    let mut graph = SimGraph::new(sim_channels, shutdown_trigger, shutdown_listener.clone())?;

    if cfg.latency_ms > 0.0 {
        graph.add_interceptor(Arc::new(LatencyInterceptor::new_poisson(cfg.latency_ms)?));
    }

    let registry = Arc::new(InvoiceRegistry::new(
        receiver,
        cfg.registry_config(),
        shutdown_listener,
    ));
    graph.add_receiver(registry.clone())?;

    for scid in disabled_channels {
        graph.set_channel_enabled(ShortChannelID::from(scid), false).await?;
    }

    let writer = if !cfg.no_results {
        let results_dir = mkdir(cfg.data_dir.join("results"))?;
        Some(BatchedWriter::new(
            results_dir,
            ATTEMPTS_FILE.to_string(),
            cfg.print_batch_size,
        )?)
    } else {
        None
    };

    let graph = Arc::new(graph);
    let dispatcher: Arc<dyn ShardDispatcher> = graph.clone();
    let coordinator = PaymentCoordinator::new(
        sender,
        dispatcher,
        Arc::new(PaymentStore::new(writer)),
        cfg.payment_config(),
    );

    Ok(ScenarioRun {
        graph,
        registry,
        coordinator,
        aliases,
        payment,
    })
}

impl ScenarioRun {
    /// Creates the receiver's invoice, builds a route for every shard and sends the payment, returning the payment
    /// result along with the sender's and receiver's records of it.
    pub async fn run(&self) -> anyhow::Result<ScenarioReport> {
        let sender = lookup_alias(&self.aliases, &self.payment.sender)?;
        let request = self
            .registry
            .add_invoice(self.payment.amount_msat, None)
            .await?;

        log::info!(
            "Invoice for {} msat created at {}: {}.",
            request.total_amt_msat,
            self.payment.receiver,
            hex::encode(request.payment_hash.0)
        );

        let mut shards = Vec::with_capacity(self.payment.shards.len());
        for (i, shard) in self.payment.shards.iter().enumerate() {
            let hops = shard
                .hops
                .iter()
                .map(|alias| lookup_alias(&self.aliases, alias))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let route = self
                .graph
                .build_route(
                    &sender,
                    shard.amount_msat,
                    request.min_final_cltv_expiry_delta,
                    &hops,
                )
                .await
                .map_err(|e| anyhow!("could not build route for shard {i}: {e}"))?;

            log::debug!("Shard {i} route: {route}.");
            shards.push((route, shard.amount_msat));
        }

        let result = self
            .coordinator
            .send_multi_path(
                request.payment_hash,
                request.payment_addr,
                request.total_amt_msat,
                shards,
            )
            .await?;

        let payment = self
            .coordinator
            .store()
            .lookup_payment(&request.payment_hash)
            .await;
        let invoice = self.registry.lookup_invoice(&request.payment_hash).await?;

        Ok(ScenarioReport {
            result,
            payment,
            invoice,
        })
    }

    /// Waits for in-flight shards and hold timers to wind down.
    pub async fn wait_for_shutdown(&self) {
        self.coordinator.wait_for_shutdown().await;
        self.registry.wait_for_shutdown().await;
    }
}

fn mkdir(dir: PathBuf) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
