// Collectible Market - REST API Server
// Presentation adapter over the marketplace core; dev wiring only
// (payments are confirmed by AcceptAllVerifier, see DESIGN.md).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use collectible_market::{
    AcceptAllVerifier, CollectibleRegistry, Db, ListingDetail, ListingFilter, ListingLedger,
    ListingSummary, MarketError, MediaKind, ProfileDirectory, PurchaseCoordinator, PurchaseRecord,
    TelegramIdentity, WalletRef, CURRENCY,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    profiles: ProfileDirectory,
    collectibles: CollectibleRegistry,
    ledger: ListingLedger,
    coordinator: PurchaseCoordinator,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiErrorBody>,
}

#[derive(Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<serde_json::Value> {
    fn err(err: &MarketError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }
}

fn error_status(err: &MarketError) -> StatusCode {
    match err {
        MarketError::Validation(_) => StatusCode::BAD_REQUEST,
        MarketError::NotFound(_) => StatusCode::NOT_FOUND,
        MarketError::Conflict(_) => StatusCode::CONFLICT,
        MarketError::Authorization(_) => StatusCode::FORBIDDEN,
        MarketError::Authentication(_) => StatusCode::UNAUTHORIZED,
        MarketError::PaymentVerification(_) => StatusCode::PAYMENT_REQUIRED,
        MarketError::ReconciliationRequired { .. } | MarketError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: MarketError) -> axum::response::Response {
    (error_status(&err), Json(ApiResponse::err(&err))).into_response()
}

/// Listing card for the marketplace list view
#[derive(Serialize)]
struct ListingCardResponse {
    id: String,
    price: f64,
    currency: &'static str,
    created_at: String,
    title: String,
    media_url: String,
    media_kind: MediaKind,
    seller_id: String,
    seller_name: String,
}

impl From<ListingSummary> for ListingCardResponse {
    fn from(summary: ListingSummary) -> Self {
        Self {
            id: summary.id,
            price: summary.price,
            currency: CURRENCY,
            created_at: summary.created_at.to_rfc3339(),
            title: summary.title,
            media_url: summary.media_url,
            media_kind: summary.media_kind,
            seller_id: summary.seller.id.clone(),
            seller_name: summary.seller.display_name(),
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct ListingsQuery {
    seller: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
}

fn default_media_url() -> String {
    "https://placehold.co/600x400/png".to_string()
}

#[derive(Deserialize)]
struct CreateListingRequest {
    identity: Option<TelegramIdentity>,
    title: String,
    #[serde(default)]
    description: String,
    price: f64,
    #[serde(default = "default_media_url")]
    media_url: String,
    #[serde(default)]
    media_kind: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct PurchaseRequest {
    identity: Option<TelegramIdentity>,
    wallet: WalletRef,
    idempotency_key: String,
}

#[derive(Deserialize)]
struct CancelRequest {
    identity: Option<TelegramIdentity>,
}

#[derive(Serialize)]
struct CreatedListingResponse {
    listing_id: String,
    collectible_id: String,
    price: f64,
    currency: &'static str,
    status: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/listings - Active listings, newest first
async fn list_listings(
    State(state): State<AppState>,
    Query(query): Query<ListingsQuery>,
) -> impl IntoResponse {
    let filter = ListingFilter {
        seller_profile_id: query.seller,
        min_price: query.min_price,
        max_price: query.max_price,
    };

    match state.ledger.list_active(&filter) {
        Ok(summaries) => {
            let cards: Vec<ListingCardResponse> =
                summaries.into_iter().map(|s| s.into()).collect();
            (StatusCode::OK, Json(ApiResponse::ok(cards))).into_response()
        }
        Err(err) => error_response(err),
    }
}

/// GET /api/listings/:id - Listing detail (collectible + seller projection)
async fn get_listing_detail(
    State(state): State<AppState>,
    Path(listing_id): Path<String>,
) -> impl IntoResponse {
    match state
        .ledger
        .listing_detail(&listing_id, &state.collectibles, &state.profiles)
    {
        Ok(detail) => (StatusCode::OK, Json(ApiResponse::<ListingDetail>::ok(detail)))
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /api/listings - Create collectible + listing in one request
async fn create_listing(
    State(state): State<AppState>,
    Json(request): Json<CreateListingRequest>,
) -> impl IntoResponse {
    let result = (|| -> Result<CreatedListingResponse, MarketError> {
        let seller = state.profiles.resolve(request.identity.as_ref())?;
        let media_kind = request
            .media_kind
            .as_deref()
            .map(MediaKind::parse)
            .unwrap_or(MediaKind::Image);
        let collectible = state.collectibles.create(
            &seller.id,
            &request.title,
            &request.description,
            &request.media_url,
            media_kind,
            request.attributes.clone(),
        )?;
        let listing = state
            .ledger
            .create_listing(&collectible.id, &seller.id, request.price)?;

        Ok(CreatedListingResponse {
            listing_id: listing.id,
            collectible_id: collectible.id,
            price: listing.price,
            currency: CURRENCY,
            status: listing.status.as_str().to_string(),
        })
    })();

    match result {
        Ok(created) => (StatusCode::CREATED, Json(ApiResponse::ok(created))).into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /api/listings/:id/purchase - Purchase an active listing
async fn purchase_listing(
    State(state): State<AppState>,
    Path(listing_id): Path<String>,
    Json(request): Json<PurchaseRequest>,
) -> impl IntoResponse {
    let result = state.profiles.resolve(request.identity.as_ref()).and_then(|buyer| {
        state.coordinator.purchase(
            &listing_id,
            &buyer.id,
            &request.wallet,
            &request.idempotency_key,
        )
    });

    match result {
        Ok(record) => (StatusCode::OK, Json(ApiResponse::<PurchaseRecord>::ok(record)))
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// POST /api/listings/:id/cancel - Seller cancels an active listing
async fn cancel_listing(
    State(state): State<AppState>,
    Path(listing_id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> impl IntoResponse {
    let result = state
        .profiles
        .resolve(request.identity.as_ref())
        .and_then(|requester| state.ledger.cancel_listing(&listing_id, &requester.id));

    match result {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok("cancelled"))).into_response(),
        Err(err) => error_response(err),
    }
}

/// GET /api/profiles/:id/purchases - Purchase history, newest first
async fn get_purchase_history(
    State(state): State<AppState>,
    Path(profile_id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.purchases_for_buyer(&profile_id) {
        Ok(records) => (
            StatusCode::OK,
            Json(ApiResponse::<Vec<PurchaseRecord>>::ok(records)),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    println!("🌐 Collectible Market - API Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db_path = std::env::var("MARKET_DB").unwrap_or_else(|_| "market.db".to_string());
    let db = Db::open(std::path::Path::new(&db_path)).expect("Failed to open database");
    println!("✓ Database opened: {}", db_path);

    let profiles = ProfileDirectory::new(db.clone());
    let collectibles = CollectibleRegistry::new(db.clone());
    let ledger = ListingLedger::new(db.clone());
    let coordinator = PurchaseCoordinator::new(
        db.clone(),
        ledger.clone(),
        collectibles.clone(),
        Arc::new(AcceptAllVerifier),
    );

    let state = AppState {
        profiles,
        collectibles,
        ledger,
        coordinator,
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/listings", get(list_listings).post(create_listing))
        .route("/listings/:id", get(get_listing_detail))
        .route("/listings/:id/purchase", post(purchase_listing))
        .route("/listings/:id/cancel", post(cancel_listing))
        .route("/profiles/:id/purchases", get(get_purchase_history))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("MARKET_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    println!("\n🚀 Server running on http://{}", addr);
    println!("   Listings: http://{}/api/listings", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
