//! In-memory [`EventSource`] for tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use cohort_core::{Address, EventBatch, EventRecord, Leg, Protocol, Token, B256};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use super::events::fetch_events;
use super::EventSource;
use crate::storage::Storage;

/// Emits one event per selector for every requested block.
///
/// Failures are scripted per block: a call touching a block with remaining
/// failures consumes one and errors.
pub(crate) struct ScriptedSource {
    protocol: Protocol,
    head: Mutex<u64>,
    head_failures: Mutex<u32>,
    block_failures: Mutex<HashMap<u64, u32>>,
    calls: Mutex<Vec<Vec<u64>>>,
    head_calls: Mutex<u32>,
}

impl ScriptedSource {
    pub(crate) fn new(protocol: Protocol, head: u64) -> Self {
        Self {
            protocol,
            head: Mutex::new(head),
            head_failures: Mutex::new(0),
            block_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            head_calls: Mutex::new(0),
        }
    }

    pub(crate) fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub(crate) fn fail_head(&self, times: u32) {
        *self.head_failures.lock().unwrap() = times;
    }

    pub(crate) fn fail_block(&self, block: u64, times: u32) {
        self.block_failures.lock().unwrap().insert(block, times);
    }

    /// Block lists of every events call, in order, failed attempts included.
    pub(crate) fn calls(&self) -> Vec<Vec<u64>> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn head_calls(&self) -> u32 {
        *self.head_calls.lock().unwrap()
    }
}

pub(crate) fn weth() -> Token {
    Token {
        id: Address::repeat_byte(0xee),
        name: "Wrapped Ether".to_string(),
        symbol: "WETH".to_string(),
        decimals: 18,
    }
}

pub(crate) fn block_event(protocol: Protocol, block: u64, log_index: u64) -> EventRecord {
    let hash = B256::left_padding_from(&block.to_be_bytes());
    let two_sided = protocol == Protocol::UniswapV3;
    let token = (protocol != Protocol::Lido).then(weth);

    let mut legs = vec![Leg {
        amount: block.to_string(),
        token: token.clone(),
    }];
    if two_sided {
        legs.push(Leg {
            amount: "1".to_string(),
            token,
        });
    }

    EventRecord {
        id: EventRecord::make_id(&hash, log_index),
        hash,
        block_number: block,
        timestamp: 1_700_000_000 + block as i64,
        from: Address::left_padding_from(&block.to_be_bytes()),
        to: two_sided.then(|| Address::repeat_byte(0xcc)),
        legs,
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn current_head(&self) -> Result<u64> {
        *self.head_calls.lock().unwrap() += 1;

        let mut failures = self.head_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            bail!("head unavailable");
        }
        Ok(*self.head.lock().unwrap())
    }

    async fn events_for_blocks(&self, blocks: &[u64]) -> Result<EventBatch> {
        self.calls.lock().unwrap().push(blocks.to_vec());

        {
            let mut failures = self.block_failures.lock().unwrap();
            for block in blocks {
                if let Some(remaining) = failures.get_mut(block) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        bail!("upstream error at block {}", block);
                    }
                }
            }
        }

        let mut batch = EventBatch::new();
        for &block in blocks {
            for (log_index, &selector) in self.protocol.selectors().iter().enumerate() {
                batch.push(selector, block_event(self.protocol, block, log_index as u64));
            }
        }
        Ok(batch)
    }
}

/// Answers every events call with the same subgraph `data` object, decoded
/// the way [`super::SubgraphProvider`] decodes a live response.
pub(crate) struct ResponseSource {
    protocol: Protocol,
    head: u64,
    data: Map<String, Value>,
}

impl ResponseSource {
    pub(crate) fn new(protocol: Protocol, head: u64, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            other => panic!("response data must be an object, got {other}"),
        };
        Self {
            protocol,
            head,
            data,
        }
    }
}

#[async_trait]
impl EventSource for ResponseSource {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn current_head(&self) -> Result<u64> {
        Ok(self.head)
    }

    async fn events_for_blocks(&self, blocks: &[u64]) -> Result<EventBatch> {
        fetch_events(self.protocol, blocks, |_query| async { Ok(self.data.clone()) }).await
    }
}

/// Closes the database pool on its first events call, then keeps failing.
pub(crate) struct ClosingSource {
    protocol: Protocol,
    head: u64,
    storage: Storage,
}

impl ClosingSource {
    pub(crate) fn new(protocol: Protocol, head: u64, storage: Storage) -> Self {
        Self {
            protocol,
            head,
            storage,
        }
    }
}

#[async_trait]
impl EventSource for ClosingSource {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn current_head(&self) -> Result<u64> {
        Ok(self.head)
    }

    async fn events_for_blocks(&self, blocks: &[u64]) -> Result<EventBatch> {
        self.storage.close().await;
        bail!("upstream error at blocks {:?}", blocks)
    }
}
