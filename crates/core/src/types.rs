//! Core types for Cohort.

use alloy_primitives::{hex, Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A DeFi protocol whose subgraph is crawled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Uniswap V3 (Messari subgraph).
    #[serde(rename = "uniswap-v3")]
    UniswapV3,
    /// Lido stETH submissions.
    #[serde(rename = "lido")]
    Lido,
    /// Aave V2 lending pool (Messari subgraph).
    #[serde(rename = "aave-v2")]
    AaveV2,
}

impl Protocol {
    /// Every supported protocol.
    pub const ALL: [Protocol; 3] = [Protocol::UniswapV3, Protocol::Lido, Protocol::AaveV2];

    /// Wire name, also the cursor key.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::UniswapV3 => "uniswap-v3",
            Protocol::Lido => "lido",
            Protocol::AaveV2 => "aave-v2",
        }
    }

    /// Event selectors this protocol emits, in storage order.
    pub fn selectors(&self) -> &'static [EventSelector] {
        match self {
            Protocol::UniswapV3 => &[EventSelector::UniswapV3Deposit, EventSelector::UniswapV3Swap],
            Protocol::Lido => &[EventSelector::LidoSubmission],
            Protocol::AaveV2 => &[
                EventSelector::AaveV2Deposit,
                EventSelector::AaveV2Withdraw,
                EventSelector::AaveV2Borrow,
                EventSelector::AaveV2Repay,
            ],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::UnknownProtocol(s.to_string()))
    }
}

/// Kind of on-chain activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Liquidity or collateral deposit.
    Deposit,
    /// Collateral withdrawal.
    Withdraw,
    /// Loan origination.
    Borrow,
    /// Loan repayment.
    Repay,
    /// Token swap.
    Swap,
    /// Staking submission.
    Submission,
}

impl EventKind {
    /// Wire name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::Deposit => "deposit",
            EventKind::Withdraw => "withdraw",
            EventKind::Borrow => "borrow",
            EventKind::Repay => "repay",
            EventKind::Swap => "swap",
            EventKind::Submission => "submission",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(EventKind::Deposit),
            "withdraw" => Ok(EventKind::Withdraw),
            "borrow" => Ok(EventKind::Borrow),
            "repay" => Ok(EventKind::Repay),
            "swap" => Ok(EventKind::Swap),
            "submission" => Ok(EventKind::Submission),
            _ => Err(CoreError::UnknownEventKind(s.to_string())),
        }
    }
}

/// A supported `(protocol, event kind)` pair.
///
/// Each variant owns exactly one event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventSelector {
    /// Uniswap V3 liquidity deposit (two-sided, two token legs).
    UniswapV3Deposit,
    /// Uniswap V3 swap (two-sided, two token legs).
    UniswapV3Swap,
    /// Lido submission (one-sided, no token).
    LidoSubmission,
    /// Aave V2 deposit.
    AaveV2Deposit,
    /// Aave V2 withdraw.
    AaveV2Withdraw,
    /// Aave V2 borrow.
    AaveV2Borrow,
    /// Aave V2 repay.
    AaveV2Repay,
}

impl EventSelector {
    /// Every supported selector.
    pub const ALL: [EventSelector; 7] = [
        EventSelector::UniswapV3Deposit,
        EventSelector::UniswapV3Swap,
        EventSelector::LidoSubmission,
        EventSelector::AaveV2Deposit,
        EventSelector::AaveV2Withdraw,
        EventSelector::AaveV2Borrow,
        EventSelector::AaveV2Repay,
    ];

    /// Resolve a selector, rejecting pairs the protocol does not emit.
    pub fn new(protocol: Protocol, kind: EventKind) -> Result<Self, CoreError> {
        protocol
            .selectors()
            .iter()
            .copied()
            .find(|s| s.kind() == kind)
            .ok_or_else(|| CoreError::UnsupportedSelector {
                protocol: protocol.as_str().to_string(),
                event: kind.as_str().to_string(),
            })
    }

    /// Resolve a selector from wire names.
    pub fn from_names(protocol: &str, event: &str) -> Result<Self, CoreError> {
        let protocol: Protocol = protocol.parse()?;
        let kind: EventKind = event.parse().map_err(|_| CoreError::UnsupportedSelector {
            protocol: protocol.as_str().to_string(),
            event: event.to_string(),
        })?;
        Self::new(protocol, kind)
    }

    /// Owning protocol.
    pub const fn protocol(&self) -> Protocol {
        match self {
            EventSelector::UniswapV3Deposit | EventSelector::UniswapV3Swap => Protocol::UniswapV3,
            EventSelector::LidoSubmission => Protocol::Lido,
            EventSelector::AaveV2Deposit
            | EventSelector::AaveV2Withdraw
            | EventSelector::AaveV2Borrow
            | EventSelector::AaveV2Repay => Protocol::AaveV2,
        }
    }

    /// Event kind.
    pub const fn kind(&self) -> EventKind {
        match self {
            EventSelector::UniswapV3Deposit | EventSelector::AaveV2Deposit => EventKind::Deposit,
            EventSelector::UniswapV3Swap => EventKind::Swap,
            EventSelector::LidoSubmission => EventKind::Submission,
            EventSelector::AaveV2Withdraw => EventKind::Withdraw,
            EventSelector::AaveV2Borrow => EventKind::Borrow,
            EventSelector::AaveV2Repay => EventKind::Repay,
        }
    }

    /// Storage table holding this selector's rows.
    pub const fn table(&self) -> &'static str {
        match self {
            EventSelector::UniswapV3Deposit => "uniswap_v3_deposits",
            EventSelector::UniswapV3Swap => "uniswap_v3_swaps",
            EventSelector::LidoSubmission => "lido_submissions",
            EventSelector::AaveV2Deposit => "aave_v2_deposits",
            EventSelector::AaveV2Withdraw => "aave_v2_withdraws",
            EventSelector::AaveV2Borrow => "aave_v2_borrows",
            EventSelector::AaveV2Repay => "aave_v2_repays",
        }
    }

    /// Collection name in the protocol's subgraph schema.
    pub const fn upstream_collection(&self) -> &'static str {
        match self {
            EventSelector::UniswapV3Deposit | EventSelector::AaveV2Deposit => "deposits",
            EventSelector::UniswapV3Swap => "swaps",
            EventSelector::LidoSubmission => "lidoSubmissions",
            EventSelector::AaveV2Withdraw => "withdraws",
            EventSelector::AaveV2Borrow => "borrows",
            EventSelector::AaveV2Repay => "repays",
        }
    }

    /// Whether rows carry both a `from` and a `to` participant.
    pub const fn is_two_sided(&self) -> bool {
        matches!(
            self,
            EventSelector::UniswapV3Deposit | EventSelector::UniswapV3Swap
        )
    }
}

impl fmt::Display for EventSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol(), self.kind())
    }
}

impl Serialize for EventSelector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Inclusive time window in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: i64,
    end: i64,
}

impl TimeWindow {
    /// Create a window, rejecting `start > end`.
    pub fn new(start: i64, end: i64) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvalidTimeWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Build from epoch milliseconds.
    ///
    /// Stored timestamps have second precision, so the start is rounded up
    /// and the end rounded down: a row at second `t` matches iff
    /// `start_ms <= t * 1000 <= end_ms`.
    pub fn from_millis(start_ms: i64, end_ms: i64) -> Result<Self, CoreError> {
        if start_ms > end_ms {
            return Err(CoreError::InvalidTimeWindow {
                start: start_ms.div_euclid(1000),
                end: end_ms.div_euclid(1000),
            });
        }
        let start = start_ms.div_euclid(1000) + i64::from(start_ms.rem_euclid(1000) != 0);
        let end = end_ms.div_euclid(1000);
        Ok(Self { start, end })
    }

    /// Window start (unix seconds, inclusive).
    pub const fn start(&self) -> i64 {
        self.start
    }

    /// Window end (unix seconds, inclusive).
    pub const fn end(&self) -> i64 {
        self.end
    }

    /// Whether `timestamp` falls inside the window.
    pub const fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// ERC-20 token metadata. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Contract address.
    pub id: Address,
    /// Token name.
    pub name: String,
    /// Token symbol.
    pub symbol: String,
    /// Decimal places.
    pub decimals: u32,
}

/// One amount moved by an event, with the token it is denominated in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leg {
    /// Raw integer amount as a decimal string.
    pub amount: String,
    /// Token moved, `None` for native ETH.
    pub token: Option<Token>,
}

/// A normalized event ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// `<transactionHash>-<logIndex>`.
    pub id: String,
    /// Transaction hash.
    pub hash: B256,
    /// Block number.
    pub block_number: u64,
    /// Block timestamp (unix seconds).
    pub timestamp: i64,
    /// Initiating participant.
    pub from: Address,
    /// Counterparty, two-sided kinds only.
    pub to: Option<Address>,
    /// Amounts moved (one or two).
    pub legs: Vec<Leg>,
}

impl EventRecord {
    /// Deterministic idempotency key for an event.
    pub fn make_id(hash: &B256, log_index: u64) -> String {
        format!("{}-{}", to_hex(hash), log_index)
    }

    /// Every participant address of this event.
    pub fn participants(&self) -> impl Iterator<Item = Address> + '_ {
        std::iter::once(self.from).chain(self.to)
    }

    /// Every token this event references.
    pub fn tokens(&self) -> impl Iterator<Item = &Token> + '_ {
        self.legs.iter().filter_map(|leg| leg.token.as_ref())
    }
}

/// Decoded events of one upstream call, grouped by selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    events: BTreeMap<EventSelector, Vec<EventRecord>>,
}

impl EventBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    pub fn push(&mut self, selector: EventSelector, event: EventRecord) {
        self.events.entry(selector).or_default().push(event);
    }

    /// Events stored under `selector`.
    pub fn get(&self, selector: EventSelector) -> &[EventRecord] {
        self.events.get(&selector).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate non-empty groups in selector order.
    pub fn iter(&self) -> impl Iterator<Item = (EventSelector, &[EventRecord])> + '_ {
        self.events
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(selector, events)| (*selector, events.as_slice()))
    }

    /// Total number of events.
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    /// Whether the batch holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every token referenced by any event, duplicates included.
    pub fn tokens(&self) -> impl Iterator<Item = &Token> + '_ {
        self.events.values().flatten().flat_map(EventRecord::tokens)
    }
}

/// Lowercase `0x`-prefixed hex, the canonical storage form for addresses and hashes.
pub fn to_hex<T: AsRef<[u8]>>(bytes: T) -> String {
    hex::encode_prefixed(bytes)
}

/// Parse an address in any hex casing, with or without `0x`.
pub fn parse_address(value: &str) -> Result<Address, CoreError> {
    Address::from_str(value.trim()).map_err(|_| CoreError::InvalidAddress(value.to_string()))
}
