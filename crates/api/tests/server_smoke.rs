use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use cohort_api::server::{build_app, ApiRuntimeConfig};
use cohort_core::{Address, EventRecord, EventSelector, Leg, B256};
use cohort_indexer::storage::Storage;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn event(seed: u64, timestamp: i64, from: Address, to: Option<Address>) -> EventRecord {
    let hash = B256::left_padding_from(&seed.to_be_bytes());
    let mut legs = vec![Leg {
        amount: "1000".to_string(),
        token: None,
    }];
    if to.is_some() {
        legs.push(Leg {
            amount: "2000".to_string(),
            token: None,
        });
    }

    EventRecord {
        id: EventRecord::make_id(&hash, 0),
        hash,
        block_number: seed,
        timestamp,
        from,
        to,
        legs,
    }
}

async fn setup() -> (Router, Storage, TempDir) {
    let tmp = TempDir::new().unwrap();
    let database_url = format!("sqlite://{}", tmp.path().join("cohort.db").display());

    let app = build_app(&ApiRuntimeConfig::for_test(database_url.clone()))
        .await
        .unwrap();
    let storage = Storage::new(&database_url, None, None).await.unwrap();

    (app, storage, tmp)
}

#[tokio::test]
async fn test_sync_cursor_lifecycle() {
    let (app, _storage, _tmp) = setup().await;

    let (status, body) = send(
        &app,
        "POST",
        "/sync",
        Some(json!({"protocol": "lido", "blockNumber": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["protocol"], "lido");
    assert_eq!(body["data"]["blockNumber"], 100);
    assert_eq!(body["data"]["syncing"], false);

    let (status, body) = send(
        &app,
        "POST",
        "/sync",
        Some(json!({"protocol": "lido", "blockNumber": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, _) = send(
        &app,
        "POST",
        "/sync",
        Some(json!({"protocol": "curve", "blockNumber": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        "/sync",
        Some(json!({"protocol": "aave-v2", "blockNumber": -1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");

    let (status, body) = send(
        &app,
        "PATCH",
        "/sync/lido",
        Some(json!({"blockNumber": 150, "syncing": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({"blockNumber": 150, "syncing": true}));

    let (status, body) = send(&app, "GET", "/sync/lido", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["blockNumber"], 150);
    assert_eq!(body["data"]["syncing"], true);
    assert_eq!(body["data"]["leaseOwner"], "manual");

    let (status, _) = send(
        &app,
        "PATCH",
        "/sync/lido",
        Some(json!({"syncing": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, "GET", "/sync/lido", None).await;
    assert_eq!(body["data"]["syncing"], false);
    assert!(body["data"].get("leaseOwner").is_none());

    let (status, body) = send(
        &app,
        "PATCH",
        "/sync/aave-v2",
        Some(json!({"blockNumber": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = send(&app, "GET", "/sync/lido/failures", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_failures_are_listed() {
    let (app, storage, _tmp) = setup().await;
    storage
        .record_failure(cohort_core::Protocol::UniswapV3, 101, 105, "timeout")
        .await
        .unwrap();

    let (status, body) = send(&app, "GET", "/sync/uniswap-v3/failures", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["fromBlock"], 101);
    assert_eq!(body["data"][0]["toBlock"], 105);
    assert_eq!(body["data"][0]["error"], "timeout");
}

#[tokio::test]
async fn test_event_intersection() {
    let (app, storage, _tmp) = setup().await;

    let x = Address::repeat_byte(0x01);
    let y = Address::repeat_byte(0x02);
    let z = Address::repeat_byte(0x03);
    let w = Address::repeat_byte(0x04);
    let pool = Address::repeat_byte(0xcc);

    storage
        .insert_events_if_absent(
            EventSelector::LidoSubmission,
            &[
                event(1, 1_000, x, None),
                event(2, 1_000, y, None),
                event(3, 1_000, z, None),
                // Outside the window.
                event(4, 9_000, w, None),
            ],
        )
        .await
        .unwrap();
    storage
        .insert_events_if_absent(
            EventSelector::UniswapV3Swap,
            &[
                event(5, 1_500, y, Some(pool)),
                event(6, 1_500, w, Some(z)),
            ],
        )
        .await
        .unwrap();

    let (status, body) = send(
        &app,
        "POST",
        "/event",
        Some(json!({
            "events": [
                {"protocol": "lido", "eventName": "submission"},
                {"protocol": "uniswap-v3", "eventName": "swap"}
            ],
            "start": 0,
            "end": 2_000_000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([3, 2]));

    let (status, body) = send(
        &app,
        "POST",
        "/event",
        Some(json!({
            "events": [{"protocol": "lido", "eventName": "swap"}],
            "start": 0,
            "end": 2_000_000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");

    let (status, body) = send(
        &app,
        "POST",
        "/event",
        Some(json!({"events": [], "start": 0, "end": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_health() {
    let (app, _storage, _tmp) = setup().await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
