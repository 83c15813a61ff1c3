// Card Dispenser - Web Server
// REST API with Axum: public claim endpoint plus password-gated admin routes

use anyhow::Context;
use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use card_dispenser::{
    admin, claim_service, logging, open_database, CardFilter, ClaimOutcome, ClaimService,
    NewRecipient, Page, Settings,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const ADMIN_HEADER: &str = "x-admin-password";

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    claims: Arc<ClaimService>,
    settings: Arc<Settings>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::Internal(anyhow::anyhow!("database mutex poisoned")))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Admin password is incorrect".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = ApiResponse {
            success: false,
            data: (),
            error: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

// ============================================================================
// Claim
// ============================================================================

#[derive(Deserialize)]
struct ClaimRequest {
    identity: String,
    secret: String,
}

#[derive(Serialize)]
struct ClaimResult {
    success: bool,
    status: &'static str,
    message: &'static str,
    nickname: String,
    target: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cards: Option<Vec<String>>,
}

impl From<ClaimOutcome> for ClaimResult {
    fn from(outcome: ClaimOutcome) -> Self {
        Self {
            success: outcome.is_success(),
            status: outcome.status(),
            message: outcome.message(),
            nickname: outcome.nickname().unwrap_or_default().to_string(),
            target: outcome.target().unwrap_or(0),
            cards: outcome.is_success().then(|| outcome.codes().to_vec()),
        }
    }
}

/// Run a database call on the blocking pool so lock waits never stall the runtime
async fn with_conn<T, F>(state: AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&AppState, &mut Connection) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = state.conn()?;
        f(&state, &mut *conn)
    })
    .await
    .context("database task panicked")?
}

/// POST /api/claim - Claim cards for a recipient
async fn claim_cards(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimResult>, ApiError> {
    let outcome = with_conn(state, move |state, conn| {
        Ok(state
            .claims
            .claim(conn, request.identity.trim(), &request.secret))
    })
    .await?;

    Ok(Json(outcome.into()))
}

// ============================================================================
// Admin API
// ============================================================================

/// Middleware: reject admin requests without the right password header
async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = headers.get(ADMIN_HEADER).and_then(|value| value.to_str().ok());

    match provided {
        Some(password) if password == state.settings.server.admin_password => {
            Ok(next.run(request).await)
        }
        _ => Err(ApiError::Unauthorized),
    }
}

fn parse_page(page: Option<u32>, page_size: Option<u32>) -> Result<Page, ApiError> {
    let default = Page::default();
    Page::new(
        page.unwrap_or(default.page),
        page_size.unwrap_or(default.page_size),
    )
    .map_err(|e| ApiError::BadRequest(e.to_string()))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Deserialize)]
struct CardQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    denomination: Option<u32>,
    used: Option<bool>,
}

#[derive(Deserialize)]
struct AddCardsRequest {
    content: String,
    denomination: u32,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

fn message(text: String) -> Json<ApiResponse<MessageResponse>> {
    Json(ApiResponse::ok(MessageResponse { message: text }))
}

/// GET /api/admin/stats - Stock per denomination and claim totals
async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = with_conn(state, |state, conn| {
        Ok(admin::stats(conn, &state.settings.allocation.denominations)?)
    })
    .await?;
    Ok(Json(ApiResponse::ok(stats)))
}

/// GET /api/admin/recipients - Paginated recipient list
async fn list_recipients(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = parse_page(query.page, query.page_size)?;
    let listing = with_conn(state, move |_, conn| Ok(admin::list_recipients(conn, page)?)).await?;
    Ok(Json(ApiResponse::ok(listing)))
}

/// POST /api/admin/recipients/import - Bulk create or update
async fn import_recipients(
    State(state): State<AppState>,
    Json(recipients): Json<Vec<NewRecipient>>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = with_conn(state, move |state, conn| {
        let verifier = state.settings.credentials.scheme.verifier();
        admin::import_recipients(conn, verifier.as_ref(), &recipients)
            .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))
    })
    .await?;

    Ok(message(format!(
        "Imported {} recipients ({} created, {} updated)",
        summary.created + summary.updated,
        summary.created,
        summary.updated
    )))
}

/// DELETE /api/admin/recipients/:identity
async fn delete_recipient(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = identity.clone();
    let removed = with_conn(state, move |_, conn| Ok(admin::delete_recipient(conn, &key)?)).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("Recipient {} not found", identity)));
    }
    Ok(message(format!("Recipient {} deleted", identity)))
}

/// POST /api/admin/recipients/:identity/reset - Allow claiming again
async fn reset_claim(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = identity.clone();
    let reset = with_conn(state, move |_, conn| Ok(admin::reset_claim(conn, &key)?)).await?;
    if !reset {
        return Err(ApiError::NotFound(format!(
            "Recipient {} not found or not claimed",
            identity
        )));
    }
    Ok(message(format!("Claim reset for {}", identity)))
}

/// GET /api/admin/cards - Paginated card list, optionally filtered
async fn list_cards(
    State(state): State<AppState>,
    Query(query): Query<CardQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = parse_page(query.page, query.page_size)?;
    let filter = CardFilter {
        denomination: query.denomination,
        used: query.used,
    };
    let listing =
        with_conn(state, move |_, conn| Ok(admin::list_cards(conn, page, filter)?)).await?;
    Ok(Json(ApiResponse::ok(listing)))
}

/// POST /api/admin/cards/add - Add codes, one per line
async fn add_cards(
    State(state): State<AppState>,
    Json(request): Json<AddCardsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let denominations = &state.settings.allocation.denominations;
    if !denominations.contains(request.denomination) {
        return Err(ApiError::BadRequest(format!(
            "Denomination {} is not one of {:?}",
            request.denomination,
            denominations.values()
        )));
    }

    let denomination = request.denomination;
    let inserted = with_conn(state, move |state, conn| {
        let denominations = &state.settings.allocation.denominations;
        Ok(admin::add_cards(conn, denominations, &request.content, request.denomination)?)
    })
    .await?;
    Ok(message(format!(
        "Added {} cards of denomination {}",
        inserted, denomination
    )))
}

/// DELETE /api/admin/cards/:code
async fn delete_card(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = code.clone();
    let removed = with_conn(state, move |_, conn| Ok(admin::delete_card(conn, &key)?)).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("Card {} not found", code)));
    }
    Ok(message(format!("Card {} deleted", code)))
}

/// POST /api/admin/cards/:code/release - Return a used card to inventory
async fn release_card(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = code.clone();
    let released = with_conn(state, move |_, conn| Ok(admin::release_card(conn, &key)?)).await?;
    if !released {
        return Err(ApiError::NotFound(format!("Card {} not found or unused", code)));
    }
    Ok(message(format!("Card {} released", code)))
}

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logger(false);

    let settings = Settings::load(None)?;
    let conn = open_database(&settings.database.path, settings.database.busy_timeout())?;
    tracing::info!(path = %settings.database.path.display(), "database opened");

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        claims: Arc::new(claim_service(&settings)),
        settings: Arc::new(settings),
    };

    let admin_routes = Router::new()
        .route("/stats", get(get_stats))
        .route("/recipients", get(list_recipients))
        .route("/recipients/import", post(import_recipients))
        .route("/recipients/:identity", delete(delete_recipient))
        .route("/recipients/:identity/reset", post(reset_claim))
        .route("/cards", get(list_cards))
        .route("/cards/add", post(add_cards))
        .route("/cards/:code", delete(delete_card))
        .route("/cards/:code/release", post(release_card))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/claim", post(claim_cards))
        .nest("/admin", admin_routes)
        .with_state(state.clone());

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let addr = state.settings.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(%addr, "server listening");
    println!("\n🚀 Server running on http://{}", addr);
    println!("   Claim: POST /api/claim");
    println!("   Admin: /api/admin/* (header X-Admin-Password)");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Server error")?;

    Ok(())
}
