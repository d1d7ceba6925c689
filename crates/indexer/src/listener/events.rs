//! Upstream subgraph event shapes and their normalization.
//!
//! Each supported selector has a GraphQL selection set and a response type.
//! Decoded rows become [`EventRecord`]s grouped in an [`EventBatch`].

use anyhow::{anyhow, Result};
use cohort_core::{
    parse_address, Address, CoreError, EventBatch, EventRecord, EventSelector, Leg, Protocol,
    Token, B256,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::future::Future;
use std::str::FromStr;
use tracing::{debug, warn};

/// Page size requested per collection; the hosted service caps `first` at 1000.
pub const PAGE_SIZE: usize = 1000;

const TOKEN_FIELDS: &str = "{ id name symbol decimals }";

/// GraphQL query returning the subgraph's indexed head.
pub const META_QUERY: &str = "query Meta { _meta { block { number } } }";

/// GraphQL `BigInt`/`Int` value, sent either as a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(serde_json::Number),
    Text(String),
}

impl Numeric {
    fn into_decimal_string(self) -> String {
        match self {
            Numeric::Number(n) => n.to_string(),
            Numeric::Text(s) => s,
        }
    }
}

fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Numeric::deserialize(deserializer)? {
        Numeric::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned integer, got {n}"))),
        Numeric::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected unsigned integer, got {s:?}"))),
    }
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Numeric::deserialize(deserializer)? {
        Numeric::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {n}"))),
        Numeric::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected integer, got {s:?}"))),
    }
}

fn de_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Numeric::deserialize(deserializer).map(Numeric::into_decimal_string)
}

fn de_amounts<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Vec::<Numeric>::deserialize(deserializer)
        .map(|values| values.into_iter().map(Numeric::into_decimal_string).collect())
}

/// Token metadata as embedded in event rows.
#[derive(Debug, Clone, Deserialize)]
struct UpstreamToken {
    id: String,
    name: String,
    symbol: String,
    #[serde(deserialize_with = "de_u64")]
    decimals: u64,
}

impl UpstreamToken {
    fn normalize(self) -> Result<Token, CoreError> {
        Ok(Token {
            id: parse_address(&self.id)?,
            name: self.name,
            symbol: self.symbol,
            decimals: u32::try_from(self.decimals).map_err(|_| CoreError::MalformedValue {
                field: "decimals",
                value: self.decimals.to_string(),
            })?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UniswapV3DepositRow {
    hash: String,
    #[serde(deserialize_with = "de_u64")]
    log_index: u64,
    #[serde(deserialize_with = "de_u64")]
    block_number: u64,
    #[serde(deserialize_with = "de_i64")]
    timestamp: i64,
    from: String,
    to: String,
    #[serde(deserialize_with = "de_amounts")]
    input_token_amounts: Vec<String>,
    input_tokens: Vec<UpstreamToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UniswapV3SwapRow {
    hash: String,
    #[serde(deserialize_with = "de_u64")]
    log_index: u64,
    #[serde(deserialize_with = "de_u64")]
    block_number: u64,
    #[serde(deserialize_with = "de_i64")]
    timestamp: i64,
    from: String,
    to: String,
    #[serde(deserialize_with = "de_amount")]
    amount_in: String,
    #[serde(deserialize_with = "de_amount")]
    amount_out: String,
    token_in: UpstreamToken,
    token_out: UpstreamToken,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LidoSubmissionRow {
    transaction_hash: String,
    #[serde(deserialize_with = "de_u64")]
    log_index: u64,
    #[serde(deserialize_with = "de_u64")]
    block: u64,
    #[serde(deserialize_with = "de_i64")]
    block_time: i64,
    sender: String,
    #[serde(deserialize_with = "de_amount")]
    amount: String,
}

#[derive(Debug, Deserialize)]
struct AaveAccount {
    id: String,
}

/// Shared by Aave deposits, withdraws, borrows and repays.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AaveV2Row {
    hash: String,
    #[serde(deserialize_with = "de_u64")]
    log_index: u64,
    #[serde(deserialize_with = "de_u64")]
    block_number: u64,
    #[serde(deserialize_with = "de_i64")]
    timestamp: i64,
    account: AaveAccount,
    #[serde(deserialize_with = "de_amount")]
    amount: String,
    asset: UpstreamToken,
}

/// An upstream row that normalizes into one [`EventRecord`].
trait UpstreamEvent: DeserializeOwned {
    fn normalize(self) -> Result<EventRecord, CoreError>;
}

fn parse_hash(value: &str) -> Result<B256, CoreError> {
    B256::from_str(value.trim()).map_err(|_| CoreError::MalformedValue {
        field: "hash",
        value: value.to_string(),
    })
}

fn record(
    hash: &str,
    log_index: u64,
    block_number: u64,
    timestamp: i64,
    from: Address,
    to: Option<Address>,
    legs: Vec<Leg>,
) -> Result<EventRecord, CoreError> {
    let hash = parse_hash(hash)?;
    Ok(EventRecord {
        id: EventRecord::make_id(&hash, log_index),
        hash,
        block_number,
        timestamp,
        from,
        to,
        legs,
    })
}

impl UpstreamEvent for UniswapV3DepositRow {
    fn normalize(self) -> Result<EventRecord, CoreError> {
        if self.input_token_amounts.len() != self.input_tokens.len()
            || self.input_tokens.is_empty()
        {
            return Err(CoreError::MalformedValue {
                field: "inputTokens",
                value: format!(
                    "{} amounts for {} tokens",
                    self.input_token_amounts.len(),
                    self.input_tokens.len()
                ),
            });
        }

        let legs = self
            .input_token_amounts
            .into_iter()
            .zip(self.input_tokens)
            .take(2)
            .map(|(amount, token)| -> Result<Leg, CoreError> {
                Ok(Leg {
                    amount,
                    token: Some(token.normalize()?),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        record(
            &self.hash,
            self.log_index,
            self.block_number,
            self.timestamp,
            parse_address(&self.from)?,
            Some(parse_address(&self.to)?),
            legs,
        )
    }
}

impl UpstreamEvent for UniswapV3SwapRow {
    fn normalize(self) -> Result<EventRecord, CoreError> {
        let legs = vec![
            Leg {
                amount: self.amount_in,
                token: Some(self.token_in.normalize()?),
            },
            Leg {
                amount: self.amount_out,
                token: Some(self.token_out.normalize()?),
            },
        ];

        record(
            &self.hash,
            self.log_index,
            self.block_number,
            self.timestamp,
            parse_address(&self.from)?,
            Some(parse_address(&self.to)?),
            legs,
        )
    }
}

impl UpstreamEvent for LidoSubmissionRow {
    fn normalize(self) -> Result<EventRecord, CoreError> {
        record(
            &self.transaction_hash,
            self.log_index,
            self.block,
            self.block_time,
            parse_address(&self.sender)?,
            None,
            vec![Leg {
                amount: self.amount,
                token: None,
            }],
        )
    }
}

impl UpstreamEvent for AaveV2Row {
    fn normalize(self) -> Result<EventRecord, CoreError> {
        record(
            &self.hash,
            self.log_index,
            self.block_number,
            self.timestamp,
            parse_address(&self.account.id)?,
            None,
            vec![Leg {
                amount: self.amount,
                token: Some(self.asset.normalize()?),
            }],
        )
    }
}

fn selection_set(selector: EventSelector) -> String {
    match selector {
        EventSelector::UniswapV3Deposit => format!(
            "hash logIndex blockNumber timestamp from to inputTokenAmounts inputTokens {TOKEN_FIELDS}"
        ),
        EventSelector::UniswapV3Swap => format!(
            "hash logIndex blockNumber timestamp from to amountIn amountOut \
             tokenIn {TOKEN_FIELDS} tokenOut {TOKEN_FIELDS}"
        ),
        EventSelector::LidoSubmission => {
            "transactionHash logIndex block blockTime sender amount".to_string()
        }
        EventSelector::AaveV2Deposit
        | EventSelector::AaveV2Withdraw
        | EventSelector::AaveV2Borrow
        | EventSelector::AaveV2Repay => {
            format!("hash logIndex blockNumber timestamp amount account {{ id }} asset {TOKEN_FIELDS}")
        }
    }
}

/// Name of the block filter argument in the protocol's schema.
fn block_filter(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Lido => "block_in",
        Protocol::UniswapV3 | Protocol::AaveV2 => "blockNumber_in",
    }
}

fn block_list(blocks: &[u64]) -> String {
    blocks
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One collection of the events query, ordered by entity id.
///
/// With `after_id`, only entities whose id sorts after it are returned.
fn collection_query(selector: EventSelector, blocks: &str, after_id: Option<&str>) -> String {
    let filter = block_filter(selector.protocol());
    let after = after_id
        .map(|id| format!(", id_gt: \"{id}\""))
        .unwrap_or_default();

    format!(
        " {}(first: {PAGE_SIZE}, orderBy: id, orderDirection: asc, where: {{ {filter}: [{blocks}]{after} }}) {{ id {} }}",
        selector.upstream_collection(),
        selection_set(selector)
    )
}

/// Build the first-page events query for every selector of `protocol` over `blocks`.
pub fn events_query(protocol: Protocol, blocks: &[u64]) -> String {
    let blocks = block_list(blocks);
    let collections: String = protocol
        .selectors()
        .iter()
        .map(|&selector| collection_query(selector, &blocks, None))
        .collect();

    format!("query Events {{{collections} }}")
}

/// Build the query for the page of `selector` that follows `after_id`.
pub fn next_page_query(selector: EventSelector, blocks: &[u64], after_id: &str) -> String {
    let collection = collection_query(selector, &block_list(blocks), Some(after_id));
    format!("query EventsPage {{{collection} }}")
}

/// Decode one page of rows into `batch`.
///
/// Every row must decode; a single bad row fails the page so the sub-batch
/// is retried and recorded instead of silently losing the event. Returns
/// the id of the last row when the page is full and another page may follow.
fn decode_rows<T: UpstreamEvent>(
    selector: EventSelector,
    rows: &[Value],
    batch: &mut EventBatch,
) -> Result<Option<String>> {
    let mut rejected = Vec::new();
    for row in rows {
        let normalized = serde_json::from_value::<T>(row.clone())
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.normalize().map_err(|e| e.to_string()));

        match normalized {
            Ok(event) => batch.push(selector, event),
            Err(e) => {
                warn!(%selector, "Malformed upstream event: {}", e);
                rejected.push(e);
            }
        }
    }

    if let Some(first) = rejected.first() {
        return Err(anyhow!(
            "{} of {} '{}' rows failed to decode (first: {})",
            rejected.len(),
            rows.len(),
            selector.upstream_collection(),
            first
        ));
    }

    if rows.len() < PAGE_SIZE {
        return Ok(None);
    }

    rows.last()
        .and_then(|row| row.get("id"))
        .and_then(Value::as_str)
        .map(|id| Some(id.to_string()))
        .ok_or_else(|| anyhow!("Full '{}' page without an entity id", selector.upstream_collection()))
}

fn decode_collection(
    selector: EventSelector,
    data: &Map<String, Value>,
    batch: &mut EventBatch,
) -> Result<Option<String>> {
    let collection = selector.upstream_collection();
    let rows = match data.get(collection) {
        Some(Value::Array(rows)) => rows,
        Some(Value::Null) | None => {
            return Err(anyhow!(
                "Response is missing '{}' for {}",
                collection,
                selector.protocol()
            ))
        }
        Some(other) => {
            return Err(anyhow!(
                "Expected '{}' to be an array, got {}",
                collection,
                other
            ))
        }
    };

    match selector {
        EventSelector::UniswapV3Deposit => decode_rows::<UniswapV3DepositRow>(selector, rows, batch),
        EventSelector::UniswapV3Swap => decode_rows::<UniswapV3SwapRow>(selector, rows, batch),
        EventSelector::LidoSubmission => decode_rows::<LidoSubmissionRow>(selector, rows, batch),
        EventSelector::AaveV2Deposit
        | EventSelector::AaveV2Withdraw
        | EventSelector::AaveV2Borrow
        | EventSelector::AaveV2Repay => decode_rows::<AaveV2Row>(selector, rows, batch),
    }
}

/// Decode the `data` object of a single-page events query response.
///
/// Any malformed row or missing collection fails the whole response, as
/// does a full page, since rows beyond it were not fetched. Use
/// [`fetch_events`] to follow pages.
pub fn decode_events(protocol: Protocol, data: &Map<String, Value>) -> Result<EventBatch> {
    let mut batch = EventBatch::new();

    for &selector in protocol.selectors() {
        if decode_collection(selector, data, &mut batch)?.is_some() {
            return Err(anyhow!(
                "'{}' returned a full page of {} rows; more may follow",
                selector.upstream_collection(),
                PAGE_SIZE
            ));
        }
    }

    Ok(batch)
}

/// Run the events query for `blocks`, following every full collection page
/// with `id_gt` until a short page comes back.
pub async fn fetch_events<F, Fut>(protocol: Protocol, blocks: &[u64], mut query: F) -> Result<EventBatch>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Map<String, Value>>>,
{
    let mut batch = EventBatch::new();

    let data = query(events_query(protocol, blocks)).await?;
    for &selector in protocol.selectors() {
        let mut after_id = decode_collection(selector, &data, &mut batch)?;

        while let Some(last_id) = after_id {
            debug!(%selector, after = %last_id, "Fetching next page");
            let page = query(next_page_query(selector, blocks, &last_id)).await?;
            after_id = decode_collection(selector, &page, &mut batch)?;
        }
    }

    Ok(batch)
}

/// Decode the `data` object of a `_meta` query response.
pub fn decode_head(data: &Map<String, Value>) -> Result<u64> {
    #[derive(Deserialize)]
    struct Meta {
        block: MetaBlock,
    }

    #[derive(Deserialize)]
    struct MetaBlock {
        #[serde(deserialize_with = "de_u64")]
        number: u64,
    }

    let meta = data
        .get("_meta")
        .cloned()
        .ok_or_else(|| anyhow!("Response is missing '_meta'"))?;
    let meta: Meta = serde_json::from_value(meta)?;

    Ok(meta.block.number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

    fn token(id: &str, symbol: &str, decimals: Value) -> Value {
        json!({ "id": id, "name": symbol, "symbol": symbol, "decimals": decimals })
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_events_query_uses_protocol_filter() {
        let query = events_query(Protocol::Lido, &[101, 102]);
        assert!(query.contains(
            "lidoSubmissions(first: 1000, orderBy: id, orderDirection: asc, where: { block_in: [101, 102] }) { id "
        ));
        assert!(!query.contains("blockNumber_in"));

        let query = events_query(Protocol::AaveV2, &[7]);
        for collection in ["deposits", "withdraws", "borrows", "repays"] {
            assert!(query.contains(&format!(
                "{collection}(first: 1000, orderBy: id, orderDirection: asc, where: {{ blockNumber_in: [7] }})"
            )));
        }

        let query = next_page_query(EventSelector::UniswapV3Swap, &[5, 6], "0xab-9");
        assert!(query.contains("swaps(first: 1000, orderBy: id, orderDirection: asc, where: { blockNumber_in: [5, 6], id_gt: \"0xab-9\" })"));
        assert!(!query.contains("deposits"));
    }

    #[test]
    fn test_decode_uniswap_events() {
        let data = data(json!({
            "deposits": [{
                "hash": HASH,
                "logIndex": "3",
                "blockNumber": "101",
                "timestamp": "1700000000",
                "from": "0x0000000000000000000000000000000000000001",
                "to": "0x0000000000000000000000000000000000000002",
                "inputTokenAmounts": ["10", 20],
                "inputTokens": [token(WETH, "WETH", json!(18)), token(USDC, "USDC", json!("6"))]
            }],
            "swaps": [{
                "hash": HASH,
                "logIndex": 4,
                "blockNumber": 101,
                "timestamp": 1700000000,
                "from": "0x0000000000000000000000000000000000000003",
                "to": "0x0000000000000000000000000000000000000004",
                "amountIn": "5",
                "amountOut": "7",
                "tokenIn": token(WETH, "WETH", json!(18)),
                "tokenOut": token(USDC, "USDC", json!(6))
            }]
        }));

        let batch = decode_events(Protocol::UniswapV3, &data).unwrap();
        assert_eq!(batch.len(), 2);

        let deposit = &batch.get(EventSelector::UniswapV3Deposit)[0];
        assert_eq!(deposit.id, format!("{HASH}-3"));
        assert_eq!(deposit.block_number, 101);
        assert_eq!(deposit.timestamp, 1_700_000_000);
        assert_eq!(deposit.legs.len(), 2);
        assert_eq!(deposit.legs[1].amount, "20");
        assert_eq!(deposit.legs[1].token.as_ref().unwrap().decimals, 6);
        assert_eq!(deposit.to, Some(Address::with_last_byte(2)));

        let swap = &batch.get(EventSelector::UniswapV3Swap)[0];
        assert_eq!(swap.from, Address::with_last_byte(3));
        assert_eq!(swap.legs[0].amount, "5");
        assert_eq!(swap.legs[1].token.as_ref().unwrap().symbol, "USDC");
        assert_eq!(batch.tokens().count(), 4);
    }

    #[test]
    fn test_decode_lido_and_aave_events() {
        let lido = data(json!({
            "lidoSubmissions": [{
                "transactionHash": HASH,
                "logIndex": "0",
                "block": "200",
                "blockTime": "1650000000",
                "sender": "0x00000000000000000000000000000000000000AA",
                "amount": "32000000000000000000"
            }]
        }));
        let batch = decode_events(Protocol::Lido, &lido).unwrap();
        let submission = &batch.get(EventSelector::LidoSubmission)[0];
        assert_eq!(submission.block_number, 200);
        assert_eq!(submission.from, Address::with_last_byte(0xaa));
        assert_eq!(submission.to, None);
        assert!(submission.legs[0].token.is_none());

        let row = json!({
            "hash": HASH,
            "logIndex": "1",
            "blockNumber": "300",
            "timestamp": "1650000000",
            "account": { "id": "0x0000000000000000000000000000000000000005" },
            "amount": "42",
            "asset": token(USDC, "USDC", json!(6))
        });
        let aave = data(json!({
            "deposits": [row.clone()],
            "withdraws": [],
            "borrows": [row],
            "repays": []
        }));
        let batch = decode_events(Protocol::AaveV2, &aave).unwrap();
        assert_eq!(batch.get(EventSelector::AaveV2Deposit).len(), 1);
        assert_eq!(batch.get(EventSelector::AaveV2Borrow).len(), 1);
        assert!(batch.get(EventSelector::AaveV2Repay).is_empty());
        assert_eq!(
            batch.get(EventSelector::AaveV2Borrow)[0].from,
            Address::with_last_byte(5)
        );
    }

    fn lido_row(index: usize) -> Value {
        json!({
            "id": format!("{HASH}-{index:05}"),
            "transactionHash": HASH,
            "logIndex": index,
            "block": 1,
            "blockTime": 1,
            "sender": "0x0000000000000000000000000000000000000001",
            "amount": "1"
        })
    }

    #[test]
    fn test_malformed_row_fails_the_response() {
        let lido = data(json!({
            "lidoSubmissions": [
                { "transactionHash": "0xnothex", "logIndex": 0, "block": 1, "blockTime": 1,
                  "sender": "0x0000000000000000000000000000000000000001", "amount": "1" },
                lido_row(1)
            ]
        }));

        let err = decode_events(Protocol::Lido, &lido).unwrap_err();
        assert!(err.to_string().contains("1 of 2 'lidoSubmissions' rows failed to decode"));
    }

    #[test]
    fn test_full_page_is_not_a_complete_response() {
        let rows: Vec<Value> = (0..PAGE_SIZE).map(lido_row).collect();
        let lido = data(json!({ "lidoSubmissions": rows }));

        let err = decode_events(Protocol::Lido, &lido).unwrap_err();
        assert!(err.to_string().contains("full page"));
    }

    #[tokio::test]
    async fn test_fetch_events_follows_full_pages() {
        let total = PAGE_SIZE * 2 + 5;
        let rows: Vec<Value> = (0..total).map(lido_row).collect();
        let mut queries = Vec::new();

        let batch = fetch_events(Protocol::Lido, &[1], |query| {
            queries.push(query.clone());
            let page = queries.len() - 1;
            let start = page * PAGE_SIZE;
            let end = (start + PAGE_SIZE).min(total);
            let page_rows = rows[start..end].to_vec();
            async move { Ok(data(json!({ "lidoSubmissions": page_rows }))) }
        })
        .await
        .unwrap();

        assert_eq!(batch.len(), total);
        assert_eq!(queries.len(), 3);
        assert!(!queries[0].contains("id_gt"));
        assert!(queries[1].contains(&format!("id_gt: \"{HASH}-00999\"")));
        assert!(queries[2].contains(&format!("id_gt: \"{HASH}-01999\"")));
    }

    #[tokio::test]
    async fn test_fetch_events_rejects_full_page_without_ids() {
        let rows: Vec<Value> = (0..PAGE_SIZE)
            .map(|index| {
                let mut row = lido_row(index);
                row.as_object_mut().unwrap().remove("id");
                row
            })
            .collect();

        let result = fetch_events(Protocol::Lido, &[1], |_| {
            let rows = rows.clone();
            async move { Ok(data(json!({ "lidoSubmissions": rows }))) }
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_collection_fails() {
        let aave = data(json!({ "deposits": [], "withdraws": [], "borrows": [] }));
        assert!(decode_events(Protocol::AaveV2, &aave).is_err());
    }

    #[test]
    fn test_decode_head() {
        let head = decode_head(&data(json!({ "_meta": { "block": { "number": 17000000 } } })));
        assert_eq!(head.unwrap(), 17_000_000);

        let head = decode_head(&data(json!({ "_meta": { "block": { "number": "42" } } })));
        assert_eq!(head.unwrap(), 42);

        assert!(decode_head(&data(json!({}))).is_err());
    }
}
