//! In-process fakes of the third-party APIs, served by real axum routers on
//! loopback so the reqwest clients run unmodified.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicUsize, Ordering},
};

pub const CROP_BASE64: &str = "aGVsbG8gY2hhaXI=";

pub async fn spawn_upstream(build: impl FnOnce(String) -> Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
    let router = build(base_url.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    base_url
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn bearer_matches(headers: &HeaderMap, name: &str, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

// ---- image generation ----

#[derive(Clone)]
pub struct FakeReplicate {
    pub base_url: String,
    pub created: Arc<AtomicUsize>,
    pub polls: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct ReplicateState {
    base_url: String,
    created: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
}

/// Prompts mentioning `broken` fail, `slow` never settle; everything else
/// answers one 504 and then succeeds with a two-element output.
pub async fn fake_replicate() -> FakeReplicate {
    let created = Arc::new(AtomicUsize::new(0));
    let polls = Arc::new(AtomicUsize::new(0));
    let (c, p) = (created.clone(), polls.clone());
    let base_url = spawn_upstream(move |base_url| {
        Router::new()
            .route("/v1/predictions", post(replicate_create))
            .route("/v1/predictions/{id}", get(replicate_get))
            .with_state(ReplicateState {
                base_url,
                created: c,
                polls: p,
            })
    })
    .await;
    FakeReplicate {
        base_url,
        created,
        polls,
    }
}

async fn replicate_create(
    State(state): State<ReplicateState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !bearer_matches(&headers, "authorization", "Token test-key") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "bad token"}))).into_response();
    }
    let n = state.created.fetch_add(1, Ordering::SeqCst) + 1;
    let prompt = body["input"]["prompt"].as_str().unwrap_or_default();
    let id = if prompt.contains("broken") {
        format!("fail-{n}")
    } else if prompt.contains("slow") {
        format!("slow-{n}")
    } else {
        format!("ok-{n}")
    };
    Json(json!({
        "id": id,
        "status": "starting",
        "output": null,
        "urls": {"get": format!("{}/v1/predictions/{id}", state.base_url)}
    }))
    .into_response()
}

async fn replicate_get(State(state): State<ReplicateState>, Path(id): Path<String>) -> Response {
    let poll = state.polls.fetch_add(1, Ordering::SeqCst) + 1;
    let urls = json!({"get": format!("{}/v1/predictions/{id}", state.base_url)});
    if id.starts_with("fail") {
        return Json(json!({"id": id, "status": "failed", "error": "model crashed", "urls": urls}))
            .into_response();
    }
    if id.starts_with("slow") {
        return Json(json!({"id": id, "status": "processing", "urls": urls})).into_response();
    }
    if poll == 1 {
        return (StatusCode::GATEWAY_TIMEOUT, "upstream timeout").into_response();
    }
    Json(json!({
        "id": id,
        "status": "succeeded",
        "output": [
            "https://replicate.delivery/control.png",
            "https://replicate.delivery/out.png"
        ],
        "urls": urls
    }))
    .into_response()
}

// ---- furniture detector ----

/// The basement model detects nothing; other models return a chair and a
/// lamp on a 1000x800 source.
pub async fn fake_detector() -> String {
    spawn_upstream(|_| Router::new().route("/{model}", post(detector_infer))).await
}

async fn detector_infer(Path(model): Path<String>, Json(body): Json<Value>) -> Response {
    if body["api_key"] != "test-key" {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "bad key"}))).into_response();
    }
    if body["inputs"]["image"]["value"]
        .as_str()
        .is_some_and(|url| url.contains("garbled"))
    {
        return Json(json!({"outputs": [{"unexpected": true}]})).into_response();
    }
    let (predictions, crops) = if model.starts_with("basement") {
        (json!([]), json!([]))
    } else {
        (
            json!([
                {"class": "Chair", "confidence": 0.914, "x": 250.0, "y": 400.0, "width": 100.0, "height": 200.0},
                {"class": "Lamp", "confidence": 0.5, "x": 800.0, "y": 200.0, "width": 50.0, "height": 100.0}
            ]),
            json!([
                {"type": "base64", "value": CROP_BASE64},
                {"type": "base64", "value": CROP_BASE64}
            ]),
        )
    };
    Json(json!({
        "outputs": [{
            "Furniture_Predictions": {
                "image": {"width": 1000, "height": 800},
                "predictions": predictions
            },
            "Furniture_Images": crops
        }]
    }))
    .into_response()
}

// ---- vision describer ----

/// Lamps come back without a `description` key; other items are described
/// inside a markdown fence.
pub async fn fake_openai() -> String {
    spawn_upstream(|_| Router::new().route("/v1/chat/completions", post(openai_chat))).await
}

async fn openai_chat(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !bearer_matches(&headers, "authorization", "Bearer test-key") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"}))).into_response();
    }
    let text = body["messages"][0]["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let content = if text.contains("\"LAMP\"") {
        "{\"summary\": \"a lamp\"}".to_string()
    } else {
        "```json\n{\"description\": \"Mid-century walnut armchair with green upholstery\"}\n```"
            .to_string()
    };
    Json(json!({
        "id": "chatcmpl-1",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
    }))
    .into_response()
}

// ---- shopping search ----

/// Queries containing `broken` get a payload without the `shopping` key.
pub async fn fake_serper() -> String {
    spawn_upstream(|_| Router::new().route("/shopping", post(serper_shopping))).await
}

async fn serper_shopping(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !bearer_matches(&headers, "x-api-key", "test-key") {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "bad key"}))).into_response();
    }
    let query = body["q"].as_str().unwrap_or_default();
    if query.contains("broken") {
        return Json(json!({"searchParameters": body})).into_response();
    }
    if query.contains("unobtainium") {
        return Json(json!({"searchParameters": body, "shopping": []})).into_response();
    }
    Json(json!({
        "searchParameters": body,
        "shopping": [
            {"title": "Walnut Armchair", "source": "Lazada", "link": "https://shop.example/1", "price": "₱12,999.00", "imageUrl": "https://img.example/1.jpg", "rating": 4.6, "ratingCount": 120, "position": 1, "productId": "p-1"},
            {"title": "Green Lounge Chair", "source": "Shopee", "link": "https://shop.example/2", "price": "₱8,450.00", "imageUrl": "https://img.example/2.jpg", "delivery": "Free delivery", "position": 2},
            {"title": "Accent Chair", "source": "IKEA", "link": "https://shop.example/3", "price": "₱6,990.00", "imageUrl": "https://img.example/3.jpg", "position": 3}
        ]
    }))
    .into_response()
}

// ---- payments ----

pub async fn fake_stripe() -> String {
    spawn_upstream(|_| {
        Router::new().route(
            "/v1/checkout/sessions",
            post(|headers: HeaderMap, body: String| async move {
                if !bearer_matches(&headers, "authorization", "Bearer sk_test") {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"error": {}}))).into_response();
                }
                assert!(body.contains("client_reference_id="));
                assert!(!body.contains("CHECKOUT_SESSION_ID"));
                Json(json!({
                    "id": "cs_test_1",
                    "url": "https://checkout.stripe.com/c/pay/cs_test_1"
                }))
                .into_response()
            }),
        )
    })
    .await
}

/// Accepts transmissions whose id is `good-transmission`.
pub async fn fake_paypal() -> String {
    spawn_upstream(|_| {
        Router::new()
            .route(
                "/v1/oauth2/token",
                post(|| async { Json(json!({"access_token": "A21", "expires_in": 3600})) }),
            )
            .route(
                "/v1/notifications/verify-webhook-signature",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    let authorized = bearer_matches(&headers, "authorization", "Bearer A21");
                    let status = if authorized && body["transmission_id"] == "good-transmission" {
                        "SUCCESS"
                    } else {
                        "FAILURE"
                    };
                    Json(json!({"verification_status": status}))
                }),
            )
    })
    .await
}

// ---- postgrest ----

/// Serves one `user_1` row whose balance honours the `credits=eq.N` guard.
/// Every history insert fails.
pub async fn fake_postgrest_rejecting_history(balance: Arc<AtomicI64>) -> String {
    spawn_upstream(move |_| {
        Router::new()
            .route(
                "/rest/v1/users",
                get(postgrest_user).patch(postgrest_update_credits),
            )
            .route(
                "/rest/v1/room_history",
                post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "database unavailable") }),
            )
            .with_state(balance)
    })
    .await
}

async fn postgrest_user(State(balance): State<Arc<AtomicI64>>) -> Json<Value> {
    Json(json!([{"id": "user_1", "email": null, "credits": balance.load(Ordering::SeqCst)}]))
}

async fn postgrest_update_credits(
    State(balance): State<Arc<AtomicI64>>,
    RawQuery(query): RawQuery,
    Json(body): Json<Value>,
) -> Json<Value> {
    let query = query.unwrap_or_default();
    let expected = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("credits=eq."))
        .and_then(|v| v.parse::<i64>().ok());
    let next = body["credits"].as_i64().unwrap_or_default();
    match expected {
        Some(expected)
            if balance
                .compare_exchange(expected, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok() =>
        {
            Json(json!([{"id": "user_1", "email": null, "credits": next}]))
        }
        _ => Json(json!([])),
    }
}

// ---- remote images ----

/// `/small.png` answers a few bytes, `/huge.png` streams `size` bytes without
/// a content length and `/declared.png` announces `size` bytes up front.
pub async fn fake_image_host(size: usize) -> String {
    spawn_upstream(move |_| {
        Router::new()
            .route(
                "/small.png",
                get(|| async { ([("content-type", "image/png")], vec![0u8; 16]) }),
            )
            .route(
                "/huge.png",
                get(move || async move {
                    let chunks = (0..size.div_ceil(64 * 1024)).map(|_| {
                        Ok::<_, std::io::Error>(axum::body::Bytes::from(vec![0u8; 64 * 1024]))
                    });
                    (
                        [("content-type", "image/png")],
                        Body::from_stream(futures::stream::iter(chunks)),
                    )
                }),
            )
            .route(
                "/declared.png",
                get(move || async move { ([("content-type", "image/png")], vec![0u8; size]) }),
            )
    })
    .await
}
