mod credits;
mod error;
mod generation;
mod history;
mod http;
mod idempotency;
mod llm;
mod metrics;
mod models;
mod payments;
mod scan;
mod security;
mod session;
mod storage;
mod store;
mod supabase;
#[cfg(test)]
mod test_support;
mod uploads;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use error::{ErrorKind, ServiceError};
use idempotency::{Claim, IdempotencyStore};
use futures::{Stream, StreamExt};
use generation::Redesigner;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, RoomType, THEME_PALETTE};
use payments::Payments;
use scan::{
    ScanPipeline, ScanReport, ScanRequest,
    detector::DetectionResult,
    products::ProductMatch,
};
use security::{AuthState, Session, require_session};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use session::DesignSession;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration, time::Instant};
use storage::ObjectStorage;
use store::Store;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

const OPENAPI_YAML: &str = include_str!("../docs/openapi.yaml");

#[tokio::main]
async fn main() -> eyre::Result<()> {
    if let Err(err) = run().await {
        error!(target = "designgenius.api", "server crashed: {err}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let auth_state = AuthState::from_env();
    let prometheus_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(target = "designgenius.api", error = %err, "prometheus recorder unavailable");
            None
        }
    };
    let state = AppState {
        store: Store::from_env(),
        storage: ObjectStorage::from_env(),
        redesigner: Redesigner::from_env(),
        scanner: ScanPipeline::from_env(),
        payments: Arc::new(Payments::from_env()),
        openapi: Arc::new(load_openapi()),
        idempotency: IdempotencyStore::from_env(),
        prometheus_handle,
    };

    let app = build_router(state, auth_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "designgenius.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Store,
    storage: ObjectStorage,
    redesigner: Redesigner,
    scanner: ScanPipeline,
    payments: Arc<Payments>,
    openapi: Arc<Value>,
    idempotency: IdempotencyStore,
    prometheus_handle: Option<PrometheusHandle>,
}

fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/api/dream", post(dream))
        .route("/api/roboflow", post(detect_furniture))
        .route("/api/openai/describe", post(describe_item))
        .route("/api/serap/scrape", post(search_products))
        .route("/api/scan", post(scan_room))
        .route("/api/scan/stream", post(scan_room_stream))
        .route("/api/options", get(options))
        .nest(
            "/api/history",
            Router::new()
                .route("/save", post(history::save))
                .route("/get", get(history::list))
                .route("/delete", post(history::delete)),
        )
        .route("/api/get-credits", get(credits::get_credits))
        .route("/api/user/{user_id}", get(credits::get_user))
        .route(
            "/api/user/{user_id}/deduct-credits",
            post(credits::deduct_credits),
        )
        .route("/api/user-initialization", post(credits::initialize_user))
        .route(
            "/api/create-checkout-session",
            post(payments::stripe::create_checkout_session),
        )
        .route("/api/upload", post(uploads::upload))
        .route("/api/cloud/post-history", post(uploads::copy_to_cloud))
        .route_layer(middleware::from_fn_with_state(auth_state, require_session));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/uploads/{key}", get(uploads::serve))
        .route("/api/webhook/stripe", post(payments::stripe::webhook))
        .route("/api/webhook/paypal", post(payments::paypal::webhook))
        .route("/api/webhook/clerk", post(payments::clerk::webhook))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> Value {
    serde_yaml::from_str(OPENAPI_YAML).unwrap_or_else(|err| {
        warn!(target = "designgenius.api", error = %err, "openapi document failed to parse");
        json!({"openapi": "3.0.3"})
    })
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "designgenius-api",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(ServiceError::unauthorized("docs", "invalid docs key").into());
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>DesignGenius API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(10 * 1024 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .prometheus_handle
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Rooms and the suggested themes offered by the client.
async fn options() -> Json<Value> {
    let rooms: Vec<&str> = RoomType::ALL.iter().map(RoomType::label).collect();
    Json(json!({ "rooms": rooms, "themes": THEME_PALETTE }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DreamRequest {
    image_url: String,
    theme: String,
    room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DreamResponse {
    image_url: String,
    output: Vec<String>,
    history_id: Uuid,
    credits_remaining: u32,
    prediction_id: String,
    attempts: u32,
    session: DesignSession,
    /// Ready-made `/api/scan` body for the generated image.
    scan: Option<ScanRequest>,
}

/// Redesign a room photo in the requested theme.
///
/// - Method: `POST`
/// - Path: `/api/dream`
/// - Auth: session token
/// - Body: `DreamRequest`
/// - Response: `DreamResponse`
///
/// One credit is reserved before the generator is called and returned if
/// generation or the history insert fails. `Idempotency-Key` replays the
/// first response; a repeat that arrives while the first is still running
/// gets 409.
async fn dream(
    State(state): State<AppState>,
    Extension(caller): Extension<Session>,
    headers: HeaderMap,
    Json(payload): Json<DreamRequest>,
) -> Result<Json<DreamResponse>, AppError> {
    metrics::inc_requests("/api/dream");

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        let cache_key = idempotency::cache_key(&caller.user_id, &key);
        let ttl = idempotency::ttl_from_env();
        match state.idempotency.claim::<DreamResponse>(&cache_key, ttl).await {
            Claim::Replay(existing) => return Ok(Json(existing)),
            Claim::InFlight => {
                return Err(ServiceError::conflict(
                    "redesign",
                    "a request with this Idempotency-Key is still running",
                )
                .into());
            }
            Claim::Acquired => {}
        }
        // Detached so a dropped connection still settles the claim and the credit.
        let task_state = state.clone();
        let task_caller = caller.clone();
        let handle = tokio::spawn(async move {
            let result = run_dream(&task_state, &task_caller, payload).await;
            match &result {
                Ok(response) => {
                    task_state
                        .idempotency
                        .complete(&cache_key, response, ttl)
                        .await
                }
                Err(_) => task_state.idempotency.release(&cache_key).await,
            }
            result
        });
        let response = handle
            .await
            .map_err(|err| ServiceError::internal("redesign", err.to_string()))??;
        return Ok(Json(response));
    }

    Ok(Json(run_dream(&state, &caller, payload).await?))
}

async fn run_dream(
    state: &AppState,
    caller: &Session,
    payload: DreamRequest,
) -> Result<DreamResponse, ServiceError> {
    const STAGE: &str = "redesign";
    let mut design = DesignSession::new(caller.user_id.clone());
    design.attach_upload(payload.image_url.trim());
    design.select_room(&payload.room)?;
    let theme = design.select_theme(&payload.theme)?;
    if !theme.in_palette() {
        info!(target = "designgenius.api", theme = %theme, "custom theme requested");
    }
    let request = design.redesign_request()?;

    state
        .store
        .ensure_user(&caller.user_id, caller.email.as_deref())
        .await
        .map_err(|err| err.service_error(STAGE))?;
    let credits_remaining = state
        .store
        .reserve_credit(&caller.user_id)
        .await
        .map_err(|err| err.service_error(STAGE))?;

    let started = Instant::now();
    let outcome = match state.redesigner.generate(&request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                target = "designgenius.api",
                user_id = %caller.user_id,
                error = %err,
                "generation failed, releasing credit"
            );
            release_reserved_credit(state, &caller.user_id).await;
            return Err(err.into());
        }
    };
    metrics::stage_elapsed("generate_image", started.elapsed().as_millis());

    let entry = match state
        .store
        .create_history(&caller.user_id, &outcome.image_url)
        .await
    {
        Ok(entry) => entry,
        Err(err) => {
            warn!(
                target = "designgenius.api",
                user_id = %caller.user_id,
                prediction_id = %outcome.prediction_id,
                error = %err,
                "history insert failed, releasing credit"
            );
            release_reserved_credit(state, &caller.user_id).await;
            return Err(err.service_error(STAGE));
        }
    };
    design.record_output(outcome.image_url.clone());
    info!(
        target = "designgenius.api",
        user_id = %caller.user_id,
        prediction_id = %outcome.prediction_id,
        attempts = outcome.attempts,
        credits_remaining,
        "redesign completed"
    );

    Ok(DreamResponse {
        image_url: outcome.image_url,
        output: outcome.output,
        history_id: entry.id,
        credits_remaining,
        prediction_id: outcome.prediction_id,
        attempts: outcome.attempts,
        scan: design.scan_target(),
        session: design,
    })
}

async fn release_reserved_credit(state: &AppState, user_id: &str) {
    if let Err(err) = state.store.release_credit(user_id).await {
        error!(
            target = "designgenius.api",
            user_id = %user_id,
            error = %err,
            "credit release failed"
        );
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectRequest {
    image_url: String,
    room_type: String,
}

async fn detect_furniture(
    State(state): State<AppState>,
    Json(req): Json<DetectRequest>,
) -> Result<Json<DetectionResult>, AppError> {
    metrics::inc_requests("/api/roboflow");
    let result = state.scanner.detect(&req.image_url, &req.room_type).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeRequest {
    base64_image: String,
    #[serde(rename = "type")]
    kind: String,
    room_type: String,
}

async fn describe_item(
    State(state): State<AppState>,
    Json(req): Json<DescribeRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/openai/describe");
    let description = state
        .scanner
        .describe(&req.base64_image, &req.kind, &req.room_type)
        .await?;
    Ok(Json(json!({ "description": description })))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    q: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn search_products(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Vec<ProductMatch>>, AppError> {
    metrics::inc_requests("/api/serap/scrape");
    Ok(Json(state.scanner.search(&req.q, req.limit).await?))
}

/// Detect, describe and shop every furniture item in one call.
async fn scan_room(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ScanReport>, AppError> {
    metrics::inc_requests("/api/scan");
    Ok(Json(state.scanner.execute(req, None).await?))
}

/// Same work as `/api/scan`, reported as server-sent events while it runs.
async fn scan_room_stream(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    metrics::inc_requests("/api/scan/stream");
    let (tx, rx) = mpsc::channel(16);
    let scanner = state.scanner.clone();
    tokio::spawn(async move {
        if let Err(err) = scanner.execute(req, Some(&tx)).await {
            warn!(target = "designgenius.scan", error = %err, "streamed scan ended early");
        }
    });
    let events = ReceiverStream::new(rx).map(|event: scan::ScanEvent| {
        let frame = Event::default()
            .event(event.name())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event("failed").data("unserializable event"));
        Ok::<_, Infallible>(frame)
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Debug)]
enum AppError {
    Service(ServiceError),
}

impl From<ServiceError> for AppError {
    fn from(value: ServiceError) -> Self {
        Self::Service(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Service(err) => {
                let status = match err.kind() {
                    ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
                    ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                    ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
                    ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    warn!(
                        target = "designgenius.api",
                        stage = err.stage(),
                        error = %err,
                        "request failed"
                    );
                }
                let payload = ApiError {
                    error: err.kind().code().to_string(),
                    stage: Some(err.stage().to_string()),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        generation::{poll::PollPolicy, replicate::ReplicateConfig},
        payments::{paypal::PaypalConfig, signature, stripe::StripeConfig},
        test_support::{
            CROP_BASE64, FakeReplicate, body_json, body_text, fake_paypal,
            fake_postgrest_rejecting_history, fake_replicate, fake_stripe,
        },
        supabase::SupabaseClient,
    };
    use axum::{body::Body, http::Request};
    use std::sync::atomic::{AtomicI64, Ordering};
    use tower::ServiceExt;

    const WEBHOOK_SECRET: &str = "whsec_test";
    const CLERK_SECRET: &str = "clerk_test";

    struct TestApp {
        router: Router,
        store: Store,
        replicate: FakeReplicate,
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> Response {
            self.router.clone().oneshot(request).await.unwrap()
        }
    }

    async fn test_app() -> TestApp {
        test_app_with(Store::memory()).await
    }

    async fn test_app_with(store: Store) -> TestApp {
        let replicate = fake_replicate().await;
        let state = AppState {
            store: store.clone(),
            storage: ObjectStorage::memory("http://localhost:8000"),
            redesigner: Redesigner::new(
                ReplicateConfig {
                    base_url: replicate.base_url.clone(),
                    api_key: Some("test-key".into()),
                    model_version: generation::replicate::DEFAULT_MODEL_VERSION.into(),
                },
                PollPolicy::fixed(Duration::from_millis(1), 5),
            ),
            scanner: scan::tests::fake_pipeline().await,
            payments: Arc::new(Payments {
                stripe: StripeConfig {
                    api_base: fake_stripe().await,
                    secret_key: Some("sk_test".into()),
                    webhook_secret: Some(WEBHOOK_SECRET.into()),
                    checkout_origin: "https://designgenius.test".into(),
                },
                paypal: PaypalConfig {
                    api_base: fake_paypal().await,
                    client_id: Some("client".into()),
                    client_secret: Some("secret".into()),
                    webhook_id: Some("WH-1".into()),
                },
                clerk_signing_secret: Some(CLERK_SECRET.into()),
                http: reqwest::Client::new(),
            }),
            openapi: Arc::new(load_openapi()),
            idempotency: IdempotencyStore::new(None),
            prometheus_handle: None,
        };
        let auth = AuthState::with_tokens(&[("user_1", "token-1"), ("user_2", "token-2")]);
        TestApp {
            router: build_router(state, auth),
            store,
            replicate,
        }
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_with(uri: &str, token: &str) -> Request<Body> {
        Request::get(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn dream_body(theme: &str) -> Value {
        json!({
            "imageUrl": "https://cdn.example.com/room.jpg",
            "theme": theme,
            "room": "Kitchen"
        })
    }

    #[tokio::test]
    async fn dream_spends_one_credit_and_records_history() {
        let app = test_app().await;
        let response = app
            .send(post_json("/api/dream", Some("token-1"), dream_body("Modern")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["imageUrl"], "https://replicate.delivery/out.png");
        assert_eq!(body["creditsRemaining"], 4);
        assert_eq!(body["session"]["room"], "kitchen");
        assert_eq!(body["session"]["theme"], "modern");
        assert_eq!(
            body["session"]["outputImageUrl"],
            "https://replicate.delivery/out.png"
        );
        assert_eq!(body["scan"]["roomType"], "kitchen");
        let scan = body["scan"].as_object().unwrap();
        assert!(!scan.contains_key("maxItems"));
        assert!(!scan.contains_key("display"));

        let history = body_json(app.send(get_with("/api/history/get", "token-1")).await).await;
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], body["historyId"]);
    }

    #[tokio::test]
    async fn dream_without_credits_never_reaches_generator() {
        let app = test_app().await;
        app.store.ensure_user("user_1", None).await.unwrap();
        app.store.deduct("user_1", 5).await.unwrap();
        let response = app
            .send(post_json("/api/dream", Some("token-1"), dream_body("Modern")))
            .await;
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "insufficient_credits");
        assert_eq!(app.replicate.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_generation_refunds_the_credit() {
        let app = test_app().await;
        let response = app
            .send(post_json("/api/dream", Some("token-1"), dream_body("broken")))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "upstream_error");
        assert_eq!(body["stage"], "generate_image");
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 5);

        let history = body_json(app.send(get_with("/api/history/get", "token-1")).await).await;
        assert_eq!(history, json!([]));
    }

    #[tokio::test]
    async fn stalled_generation_is_a_gateway_timeout() {
        let app = test_app().await;
        let response = app
            .send(post_json("/api/dream", Some("token-1"), dream_body("slow")))
            .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 5);
    }

    #[tokio::test]
    async fn dream_rejects_unknown_rooms_before_spending() {
        let app = test_app().await;
        let response = app
            .send(post_json(
                "/api/dream",
                Some("token-1"),
                json!({"imageUrl": "https://cdn.example.com/room.jpg", "theme": "modern", "room": "garage"}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.replicate.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn idempotency_key_replays_the_first_result() {
        let app = test_app().await;
        let request = || {
            let mut request = post_json("/api/dream", Some("token-1"), dream_body("Modern"));
            request
                .headers_mut()
                .insert("Idempotency-Key", "dream-1".parse().unwrap());
            request
        };
        let first = body_json(app.send(request()).await).await;
        let second = body_json(app.send(request()).await).await;
        assert_eq!(first["historyId"], second["historyId"]);
        assert_eq!(app.replicate.created.load(Ordering::SeqCst), 1);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 4);
    }

    #[tokio::test]
    async fn concurrent_repeats_of_one_key_generate_once() {
        let app = test_app().await;
        let request = || {
            let mut request = post_json("/api/dream", Some("token-1"), dream_body("Modern"));
            request
                .headers_mut()
                .insert("Idempotency-Key", "same".parse().unwrap());
            request
        };
        let (first, second) = tokio::join!(app.send(request()), app.send(request()));
        let mut statuses = [first.status(), second.status()];
        statuses.sort();
        assert_eq!(statuses[0], StatusCode::OK);
        assert!(matches!(statuses[1], StatusCode::OK | StatusCode::CONFLICT));
        assert_eq!(app.replicate.created.load(Ordering::SeqCst), 1);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 4);

        let replay = app.send(request()).await;
        assert_eq!(replay.status(), StatusCode::OK);
        assert_eq!(app.replicate.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_history_insert_refunds_the_credit() {
        let balance = Arc::new(AtomicI64::new(5));
        let base = fake_postgrest_rejecting_history(balance.clone()).await;
        let app = test_app_with(Store::Supabase(SupabaseClient::new(&base, "service-key"))).await;

        let response = app
            .send(post_json("/api/dream", Some("token-1"), dream_body("Modern")))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["stage"], "redesign");
        assert_eq!(app.replicate.created.load(Ordering::SeqCst), 1);
        assert_eq!(balance.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn history_delete_only_touches_own_entries() {
        let app = test_app().await;
        let mine = app
            .store
            .create_history("user_1", "https://cdn.example.com/a.png")
            .await
            .unwrap();
        let theirs = app
            .store
            .create_history("user_2", "https://cdn.example.com/b.png")
            .await
            .unwrap();

        let response = app
            .send(post_json(
                "/api/history/delete",
                Some("token-1"),
                json!({"imageId": theirs.id.to_string()}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .send(post_json(
                "/api/history/delete",
                Some("token-1"),
                json!({"imageIds": [mine.id.to_string(), theirs.id.to_string(), "not-a-uuid"]}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["deleted"], json!([mine.id.to_string()]));
        assert_eq!(app.store.list_history("user_2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn user_routes_hide_other_accounts() {
        let app = test_app().await;
        app.store.ensure_user("user_2", None).await.unwrap();
        let response = app.send(get_with("/api/user/user_2", "token-1")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let credits = body_json(app.send(get_with("/api/get-credits", "token-1")).await).await;
        assert_eq!(credits["credits"], 5);
        let response = app.send(get_with("/api/user/user_1", "token-1")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .send(post_json(
                "/api/user/user_1/deduct-credits",
                Some("token-1"),
                json!({"amount": 2}),
            ))
            .await;
        assert_eq!(body_json(response).await["credits"], 3);
        let response = app
            .send(post_json(
                "/api/user/user_1/deduct-credits",
                Some("token-1"),
                json!({"amount": 0}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn protected_routes_require_a_session() {
        let app = test_app().await;
        let response = app
            .send(post_json("/api/dream", None, dream_body("Modern")))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.send(get_with("/api/get-credits", "nope")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn scan_reports_items_and_partial_failures() {
        let app = test_app().await;
        let response = app
            .send(post_json(
                "/api/scan",
                Some("token-1"),
                json!({"imageUrl": "https://cdn.example.com/out.png", "roomType": "Living Room"}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["products"].as_array().unwrap().len(), 3);
        assert_eq!(items[1]["error"]["stage"], "describe_item");
    }

    #[tokio::test]
    async fn scan_of_empty_room_is_not_found() {
        let app = test_app().await;
        let response = app
            .send(post_json(
                "/api/scan",
                Some("token-1"),
                json!({"imageUrl": "https://cdn.example.com/out.png", "roomType": "Basement"}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["stage"], "detect_furniture");
    }

    #[tokio::test]
    async fn scan_stream_emits_events_in_order() {
        let app = test_app().await;
        let response = app
            .send(post_json(
                "/api/scan/stream",
                Some("token-1"),
                json!({"imageUrl": "https://cdn.example.com/out.png", "roomType": "Living Room"}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        let names: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event:"))
            .map(str::trim)
            .collect();
        assert_eq!(
            names,
            ["detected", "described", "matched", "item_failed", "completed"]
        );
    }

    #[tokio::test]
    async fn single_stage_endpoints_surface_upstream_errors() {
        let app = test_app().await;
        let response = app
            .send(post_json(
                "/api/openai/describe",
                Some("token-1"),
                json!({"base64Image": CROP_BASE64, "type": "Lamp", "roomType": "Living Room"}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app
            .send(post_json(
                "/api/openai/describe",
                Some("token-1"),
                json!({"base64Image": CROP_BASE64, "type": "Chair", "roomType": "Living Room"}),
            ))
            .await;
        assert_eq!(
            body_json(response).await["description"],
            "Mid-century walnut armchair with green upholstery"
        );

        let response = app
            .send(post_json(
                "/api/serap/scrape",
                Some("token-1"),
                json!({"q": "broken chair"}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app
            .send(post_json(
                "/api/roboflow",
                Some("token-1"),
                json!({"imageUrl": "https://cdn.example.com/out.png", "roomType": "Bedroom"}),
            ))
            .await;
        let body = body_json(response).await;
        assert_eq!(body["image"]["width"], 1000);
        assert_eq!(body["furnitures"].as_array().unwrap().len(), 2);
    }

    fn stripe_request(payload: &str, secret: &str) -> Request<Body> {
        let t = chrono::Utc::now().timestamp().to_string();
        let sig = signature::hmac_sha256_hex(
            secret.as_bytes(),
            &[t.as_bytes(), b".", payload.as_bytes()],
        );
        Request::post("/api/webhook/stripe")
            .header("stripe-signature", format!("t={t},v1={sig}"))
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn stripe_webhook_grants_bundle_credits() {
        let app = test_app().await;
        app.store
            .ensure_user("user_1", Some("buyer@example.com"))
            .await
            .unwrap();
        let payload = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {"customer_email": "Buyer@example.com", "amount_total": 100000}}
        })
        .to_string();

        let response = app.send(stripe_request(&payload, "wrong")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 5);

        let response = app.send(stripe_request(&payload, WEBHOOK_SECRET)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"received": true}));
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 35);
    }

    #[tokio::test]
    async fn redelivered_stripe_events_are_credited_once() {
        let app = test_app().await;
        app.store.ensure_user("user_1", None).await.unwrap();
        let payload = json!({
            "id": "evt_redelivered",
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "user_1", "amount_total": 200000}}
        })
        .to_string();
        for _ in 0..2 {
            let response = app.send(stripe_request(&payload, WEBHOOK_SECRET)).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 105);
    }

    #[tokio::test]
    async fn stripe_event_is_retryable_after_a_failed_attempt() {
        let app = test_app().await;
        let payload = json!({
            "id": "evt_early",
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "user_1", "amount_total": 100000}}
        })
        .to_string();
        let response = app.send(stripe_request(&payload, WEBHOOK_SECRET)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        app.store.ensure_user("user_1", None).await.unwrap();
        let response = app.send(stripe_request(&payload, WEBHOOK_SECRET)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 35);
    }

    #[tokio::test]
    async fn stripe_webhook_ignores_unknown_amounts() {
        let app = test_app().await;
        app.store.ensure_user("user_1", None).await.unwrap();
        let payload = json!({
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "user_1", "amount_total": 49900}}
        })
        .to_string();
        let response = app.send(stripe_request(&payload, WEBHOOK_SECRET)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 5);
    }

    #[tokio::test]
    async fn checkout_session_is_created_for_known_bundles() {
        let app = test_app().await;
        let response = app
            .send(post_json(
                "/api/create-checkout-session",
                Some("token-1"),
                json!({"credits": 100}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["sessionId"], "cs_test_1");

        let response = app
            .send(post_json(
                "/api/create-checkout-session",
                Some("token-1"),
                json!({"credits": 7}),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn paypal_request(transmission_id: &str, body: &Value) -> Request<Body> {
        Request::post("/api/webhook/paypal")
            .header("paypal-auth-algo", "SHA256withRSA")
            .header("paypal-cert-url", "https://api.paypal.com/cert")
            .header("paypal-transmission-id", transmission_id)
            .header("paypal-transmission-sig", "sig")
            .header("paypal-transmission-time", "2026-01-01T00:00:00Z")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn paypal_capture_grants_credits_after_verification() {
        let app = test_app().await;
        app.store.ensure_user("user_1", None).await.unwrap();
        let event = json!({
            "id": "WH-CAPTURE-1",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {"custom_id": "user_1", "amount": {"currency_code": "PHP", "value": "2000.00"}}
        });

        let response = app.send(paypal_request("forged", &event)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 5);

        let response = app.send(paypal_request("good-transmission", &event)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 105);

        let response = app.send(paypal_request("good-transmission", &event)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.store.get_user("user_1").await.unwrap().credits, 105);
    }

    fn clerk_request(payload: &str, secret: &str) -> Request<Body> {
        let sig = signature::hmac_sha256_hex(secret.as_bytes(), &[payload.as_bytes()]);
        Request::post("/api/webhook/clerk")
            .header("clerk-signature", sig)
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn clerk_webhook_manages_accounts() {
        let app = test_app().await;
        let created = json!({
            "type": "user.created",
            "data": {"id": "user_9", "email_addresses": [{"id": "e1", "email_address": "nine@example.com"}], "primary_email_address_id": "e1"}
        })
        .to_string();

        let response = app.send(clerk_request(&created, "forged")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.send(clerk_request(&created, CLERK_SECRET)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let account = app.store.get_user("user_9").await.unwrap();
        assert_eq!(account.email.as_deref(), Some("nine@example.com"));

        let deleted = json!({"type": "user.deleted", "data": {"id": "user_9"}}).to_string();
        let response = app.send(clerk_request(&deleted, CLERK_SECRET)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(app.store.get_user("user_9").await.is_err());

        let other = json!({"type": "session.created", "data": {"id": "user_9"}}).to_string();
        let response = app.send(clerk_request(&other, CLERK_SECRET)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn uploads_are_served_back() {
        let app = test_app().await;
        let request = Request::post("/api/upload")
            .header(header::AUTHORIZATION, "Bearer token-1")
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(&b"\x89PNG"[..]))
            .unwrap();
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let stored = body_json(response).await;
        let key = stored["key"].as_str().unwrap().to_string();
        assert!(key.starts_with("user_1_"));

        let response = app
            .send(
                Request::get(format!("/uploads/{key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
    }

    #[tokio::test]
    async fn options_and_health_are_served() {
        let app = test_app().await;
        let options = body_json(app.send(get_with("/api/options", "token-1")).await).await;
        assert_eq!(options["rooms"].as_array().unwrap().len(), 8);
        assert!(options["themes"]
            .as_array()
            .unwrap()
            .contains(&json!("scandinavian")));

        let health = app
            .send(Request::get("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(health.status(), StatusCode::OK);
    }
}
