//! Core domain types shared by every subsystem

use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Ledgers the relayer coordinates between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    /// Chain A: account-based EVM ledger
    Evm,
    /// Chain B: TON
    Ton,
}

impl ChainId {
    pub const ALL: [ChainId; 2] = [ChainId::Evm, ChainId::Ton];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Evm => "evm",
            ChainId::Ton => "ton",
        }
    }

    /// The other side of a cross-chain swap
    pub fn counterpart(&self) -> ChainId {
        match self {
            ChainId::Evm => ChainId::Ton,
            ChainId::Ton => ChainId::Evm,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "evm" | "ethereum" => Ok(ChainId::Evm),
            "ton" => Ok(ChainId::Ton),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

/// Which ledgers a swap touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SameChain,
    EvmToTon,
    TonToEvm,
}

impl Direction {
    pub fn derive(source: ChainId, dest: ChainId) -> Self {
        match (source, dest) {
            (ChainId::Evm, ChainId::Ton) => Direction::EvmToTon,
            (ChainId::Ton, ChainId::Evm) => Direction::TonToEvm,
            _ => Direction::SameChain,
        }
    }

    pub fn is_cross_chain(&self) -> bool {
        !matches!(self, Direction::SameChain)
    }

    fn tag(&self) -> u8 {
        match self {
            Direction::SameChain => 0,
            Direction::EvmToTon => 1,
            Direction::TonToEvm => 2,
        }
    }
}

/// Asset descriptor: token address on a specific chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub chain: ChainId,
    pub address: String,
}

impl Asset {
    pub fn new(chain: ChainId, address: impl Into<String>) -> Self {
        Self {
            chain,
            address: address.into(),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

/// Non-negative integer token amount in base units.
///
/// Serialized as a decimal string; never goes through floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    /// Parse a decimal integer string. Signs, decimal points and
    /// exponents are rejected.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.is_empty() || s.len() > 78 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid amount '{}': expected a non-negative integer", s));
        }
        U256::from_str_radix(s, 10)
            .map(Amount)
            .map_err(|e| format!("invalid amount '{}': {}", s, e))
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(U256::from(value))
    }
}

impl From<U256> for Amount {
    fn from(value: U256) -> Self {
        Amount(value)
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn parse_hex32(s: &str) -> Result<[u8; 32], String> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    if trimmed.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", trimmed.len()));
    }
    let bytes = hex::decode(trimmed).map_err(|e| e.to_string())?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

macro_rules! hex32_newtype {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex32(s).map($name)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex32_newtype!(
    /// Deterministic order identifier (keccak256 of the order fields)
    OrderId,
    "0x"
);
hex32_newtype!(
    /// 32-byte hashlock commitment, rendered as 64 hex chars on the wire
    Hashlock,
    ""
);
hex32_newtype!(
    /// Replay-ledger key for a cross-chain message
    MessageHash,
    "0x"
);

/// Chain-specific transaction reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl TxRef {
    pub fn new(value: impl Into<String>) -> Self {
        TxRef(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// HTLC preimage. Zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    inner: [u8; 32],
}

impl Secret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { inner: bytes }
    }

    /// Fresh random secret for a maker
    pub fn random() -> Self {
        use rand::RngCore;
        let mut inner = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut inner);
        Self { inner }
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        parse_hex32(s).map(Self::new)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.inner)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.inner
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.inner.ct_eq(&other.inner).into()
    }
}

impl Eq for Secret {}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Secret::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hashlock/timelock commitment attached to a cross-chain order.
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSwapSecurityParams {
    pub hashlock: Hashlock,
    pub timelock: u64,
    pub created_at: u64,
}

/// Recipient and asset on the chain the order does not originate from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationBinding {
    pub recipient: String,
    pub asset: Asset,
}

/// A maker's swap intent. Immutable once signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossChainOrder {
    pub order_id: OrderId,
    pub salt: String,
    pub maker: String,
    pub receiver: String,
    pub source_asset: Asset,
    pub dest_asset: Asset,
    pub source_amount: Amount,
    pub dest_amount: Amount,
    pub deadline: u64,
    pub direction: Direction,
    pub destination: Option<DestinationBinding>,
    pub security: Option<AtomicSwapSecurityParams>,
    pub created_at: u64,
}

impl CrossChainOrder {
    pub fn source_chain(&self) -> ChainId {
        self.source_asset.chain
    }

    pub fn dest_chain(&self) -> ChainId {
        self.destination
            .as_ref()
            .map(|d| d.asset.chain)
            .unwrap_or(self.dest_asset.chain)
    }

    pub fn hashlock(&self) -> Option<Hashlock> {
        self.security.as_ref().map(|s| s.hashlock)
    }

    /// Absolute time after which the maker may reclaim funds
    pub fn expiry(&self) -> u64 {
        self.security
            .as_ref()
            .map(|s| s.timelock)
            .unwrap_or(self.deadline)
    }
}

/// Deterministic order id: keccak256 over the length-prefixed order fields.
///
/// `order_id` and `created_at` are excluded, so the id is stable for a
/// given salt and terms.
pub fn compute_order_id(order: &CrossChainOrder) -> OrderId {
    fn field(hasher: &mut Keccak256, bytes: &[u8]) {
        hasher.update((bytes.len() as u32).to_be_bytes());
        hasher.update(bytes);
    }

    let mut hasher = Keccak256::new();
    field(&mut hasher, order.salt.as_bytes());
    field(&mut hasher, order.maker.as_bytes());
    field(&mut hasher, order.receiver.as_bytes());
    field(&mut hasher, order.source_asset.to_string().as_bytes());
    field(&mut hasher, order.dest_asset.to_string().as_bytes());
    field(&mut hasher, &order.source_amount.as_u256().to_be_bytes::<32>());
    field(&mut hasher, &order.dest_amount.as_u256().to_be_bytes::<32>());
    field(&mut hasher, &order.deadline.to_be_bytes());
    field(&mut hasher, &[order.direction.tag()]);
    match &order.destination {
        Some(binding) => {
            field(&mut hasher, binding.recipient.as_bytes());
            field(&mut hasher, binding.asset.to_string().as_bytes());
        }
        None => field(&mut hasher, &[]),
    }
    match &order.security {
        Some(params) => {
            field(&mut hasher, params.hashlock.as_bytes());
            field(&mut hasher, &params.timelock.to_be_bytes());
        }
        None => field(&mut hasher, &[]),
    }

    let mut id = [0u8; 32];
    id.copy_from_slice(&hasher.finalize());
    OrderId(id)
}

/// Source of "now" in unix seconds
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock driven by hand, for simulations and tests
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
