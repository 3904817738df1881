use rand::distributions::Uniform;
use rand::Rng;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::sim_node::{ChannelPolicy, SimulatedChannel};
use crate::ShortChannelID;

/// Utility function to create a vector of pseudo random bytes.
///
/// Mainly used for testing purposes.
pub fn get_random_bytes(size: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(Uniform::new(u8::MIN, u8::MAX))
        .take(size)
        .collect()
}

/// Gets a key pair generated in a pseudorandom way.
pub fn get_random_keypair() -> (SecretKey, PublicKey) {
    loop {
        if let Ok(sk) = SecretKey::from_slice(&get_random_bytes(32)) {
            return (sk, PublicKey::from_secret_key(&Secp256k1::new(), &sk));
        }
    }
}

/// Creates a permissive forwarding policy for the node provided: htlcs of any size up to the channel capacity,
/// 1 sat base fee and 1 ppm proportional fee.
pub fn create_channel_policy(pubkey: PublicKey, capacity_msat: u64) -> ChannelPolicy {
    ChannelPolicy {
        pubkey,
        max_htlc_count: 483,
        max_in_flight_msat: capacity_msat,
        min_htlc_size_msat: 1,
        max_htlc_size_msat: capacity_msat,
        cltv_expiry_delta: 40,
        base_fee: 1_000,
        fee_rate_prop: 1,
    }
}

/// Opens a channel from -> to with all of the capacity on the side of the opener.
pub fn open_channel(
    scid: u64,
    from: PublicKey,
    to: PublicKey,
    capacity_msat: u64,
) -> SimulatedChannel {
    SimulatedChannel::new_with_balance(
        capacity_msat,
        ShortChannelID::from(scid),
        create_channel_policy(from, capacity_msat),
        create_channel_policy(to, capacity_msat),
        capacity_msat,
    )
    .expect("opener balance within capacity")
}

/// Amount of the payment that is split over three paths in the diamond network.
pub const DIAMOND_PAYMENT_MSAT: u64 = 300_000_000;

/// Size of each of the three shards sent over the diamond network.
pub const DIAMOND_SHARD_MSAT: u64 = DIAMOND_PAYMENT_MSAT / 3;

/// Channel size used in the diamond network, chosen so that a channel can carry one shard at a time.
pub const DIAMOND_CHANNEL_MSAT: u64 = DIAMOND_SHARD_MSAT * 3 / 2;

/// The five node network used to test multi-path payments, with three distinct paths from Alice to Bob:
///
/// ```text
///              _ Eve _
///             /       \
/// Alice -- Carol ---- Bob
///      \              /
///       \__ Dave ____/
/// ```
///
/// Alice -- Carol has to carry two shards so it is larger than the other channels.
pub struct DiamondNetwork {
    pub alice: PublicKey,
    pub bob: PublicKey,
    pub carol: PublicKey,
    pub dave: PublicKey,
    pub eve: PublicKey,
    pub channels: Vec<SimulatedChannel>,
}

impl DiamondNetwork {
    /// Creates the network, allowing the Dave -- Bob channel to be sized independently so that one path can be
    /// made too small to carry a shard.
    pub fn new(dave_bob_capacity_msat: u64) -> Self {
        let (alice, bob, carol, dave, eve) = (
            get_random_keypair().1,
            get_random_keypair().1,
            get_random_keypair().1,
            get_random_keypair().1,
            get_random_keypair().1,
        );

        let channels = vec![
            open_channel(1, carol, bob, DIAMOND_CHANNEL_MSAT),
            open_channel(2, dave, bob, dave_bob_capacity_msat),
            open_channel(3, alice, dave, DIAMOND_CHANNEL_MSAT),
            open_channel(4, eve, bob, DIAMOND_CHANNEL_MSAT),
            open_channel(5, carol, eve, DIAMOND_CHANNEL_MSAT),
            open_channel(6, alice, carol, DIAMOND_CHANNEL_MSAT + DIAMOND_SHARD_MSAT),
        ];

        DiamondNetwork {
            alice,
            bob,
            carol,
            dave,
            eve,
            channels,
        }
    }

    /// The hops for each of the three shards, in the order they are dispatched.
    pub fn shard_paths(&self) -> Vec<Vec<PublicKey>> {
        vec![
            vec![self.carol, self.bob],
            vec![self.dave, self.bob],
            vec![self.carol, self.eve, self.bob],
        ]
    }
}
