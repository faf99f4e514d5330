//! REST API for the ledger node
//!
//! Exposes the peer wire endpoint (`/validate-transaction`), transaction
//! submission, ledger queries, revert and peer management.

use axum::{
    extract::{Path, Query, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use crate::error::{LedgerError, Result};
use crate::ledger::{BalanceRow, ChainSnapshot, FinalizedBlock, StateSnapshot};
use crate::node::Node;
use crate::peers::{Peer, PeerDirectory};
use crate::propagation::VALIDATE_TRANSACTION_PATH;
use crate::replay::RevertReport;
use crate::transaction::{Receipt, SignedTransaction, Transaction};

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    NotFound(String),
    Busy(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Busy(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidTransaction(_) | LedgerError::InvalidBlock(_) | LedgerError::Config(_) => {
                ApiError::InvalidInput(err.to_string())
            }
            LedgerError::NotFound(_) => ApiError::NotFound(err.to_string()),
            LedgerError::LedgerConcurrency => ApiError::Busy(err.to_string()),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub status: String,
    pub response: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    pub transaction_code: String,
    pub dispatched: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LastBlockIndexResponse {
    pub last_block_index: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GetBlocksRequest {
    pub block_indexes: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    pub transaction_code: String,
}

#[derive(Debug, Deserialize)]
pub struct BalanceRequest {
    pub wallet_address: Option<String>,
    pub tokencode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    pub block_index: u64,
}

#[derive(Debug, Deserialize)]
pub struct AddPeerRequest {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddPeerResponse {
    pub peer: Peer,
    pub added: bool,
}

// ============================================================================
// Middleware
// ============================================================================

/// Logs method, path, status, duration and node state for every request.
async fn logging_middleware(State(node): State<Arc<Node>>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();

    info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        node_state = ?node.state(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints
pub fn build_api_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        // Peer wire
        .route(VALIDATE_TRANSACTION_PATH, post(validate_transaction))
        .route("/submit-transaction", post(submit_transaction))
        // Ledger
        .route("/get-last-block-index", get(get_last_block_index))
        .route("/get-blocks", post(get_blocks))
        .route("/get-transaction", get(get_transaction))
        .route("/download-chain", get(download_chain))
        .route("/download-state", get(download_state))
        .route("/get-balance", post(get_balance))
        .route("/revert-chain", post(revert_chain))
        // Staging
        .route("/list-staged-receipts/:index", get(list_staged_receipts))
        // Peers
        .route("/get-peers", get(get_peers))
        .route("/add-peer", post(add_peer))
        .route("/clear-peers", post(clear_peers))
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(node.clone(), logging_middleware))
        .with_state(node)
        .layer(cors)
}

/// Serves the API on `0.0.0.0:{node.api_port}`.
pub async fn run_api_server(node: Arc<Node>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], node.config.node.api_port));
    let app = build_api_router(node);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "node_state": format!("{:?}", node.state()),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Runs ledger or staging work on the blocking pool. SQLite and staged-file
/// I/O never run on the async workers.
async fn blocking<T, F>(node: Arc<Node>, work: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce(&Node) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || work(&node))
        .await
        .map_err(|e| ApiError::InternalError(format!("blocking task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// An invalid transaction is a normal answer, not an error: the sender only
/// needs to know whether a receipt was staged.
async fn validate_transaction(
    State(node): State<Arc<Node>>,
    Json(signed): Json<SignedTransaction>,
) -> std::result::Result<Json<ValidateResponse>, ApiError> {
    let accepted = blocking(node, move |node| match node.receive_transaction(&signed) {
        Ok(_) => Ok(true),
        Err(LedgerError::InvalidTransaction(reason)) => {
            warn!(
                transaction_code = %signed.transaction.transaction_code,
                %reason,
                "rejected incoming transaction"
            );
            Ok(false)
        }
        Err(e) => Err(e),
    })
    .await?;

    Ok(Json(ValidateResponse {
        status: "SUCCESS".to_string(),
        response: accepted,
    }))
}

async fn submit_transaction(
    State(node): State<Arc<Node>>,
    Json(signed): Json<SignedTransaction>,
) -> std::result::Result<Json<SubmitResponse>, ApiError> {
    let dispatched = node.submit_transaction(&signed).await?;
    Ok(Json(SubmitResponse {
        status: "SUCCESS".to_string(),
        transaction_code: signed.transaction.transaction_code,
        dispatched,
    }))
}

async fn get_last_block_index(
    State(node): State<Arc<Node>>,
) -> std::result::Result<Json<LastBlockIndexResponse>, ApiError> {
    let last_block_index = blocking(node, |node| node.ledger.last_block_index()).await?;
    Ok(Json(LastBlockIndexResponse { last_block_index }))
}

async fn get_blocks(
    State(node): State<Arc<Node>>,
    Json(request): Json<GetBlocksRequest>,
) -> std::result::Result<Json<Vec<FinalizedBlock>>, ApiError> {
    let blocks = blocking(node, move |node| node.ledger.get_blocks(&request.block_indexes)).await?;
    Ok(Json(blocks))
}

async fn get_transaction(
    State(node): State<Arc<Node>>,
    Query(query): Query<TransactionQuery>,
) -> std::result::Result<Json<Transaction>, ApiError> {
    let code = query.transaction_code;
    let lookup = code.clone();
    blocking(node, move |node| node.ledger.get_transaction(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Transaction {} not found", code)))
}

async fn download_chain(State(node): State<Arc<Node>>) -> std::result::Result<Json<ChainSnapshot>, ApiError> {
    Ok(Json(blocking(node, |node| node.ledger.download_chain()).await?))
}

async fn download_state(State(node): State<Arc<Node>>) -> std::result::Result<Json<StateSnapshot>, ApiError> {
    Ok(Json(blocking(node, |node| node.ledger.download_state()).await?))
}

enum BalanceQuery {
    Single { wallet_address: String, tokencode: String },
    Wallet(String),
    Token(String),
}

impl TryFrom<BalanceRequest> for BalanceQuery {
    type Error = ApiError;

    fn try_from(request: BalanceRequest) -> std::result::Result<Self, ApiError> {
        match (request.wallet_address, request.tokencode) {
            (Some(wallet_address), Some(tokencode)) => Ok(BalanceQuery::Single {
                wallet_address,
                tokencode,
            }),
            (Some(wallet_address), None) => Ok(BalanceQuery::Wallet(wallet_address)),
            (None, Some(tokencode)) => Ok(BalanceQuery::Token(tokencode)),
            (None, None) => Err(ApiError::InvalidInput(
                "wallet_address or tokencode is required".to_string(),
            )),
        }
    }
}

async fn get_balance(
    State(node): State<Arc<Node>>,
    Json(request): Json<BalanceRequest>,
) -> std::result::Result<Json<Vec<BalanceRow>>, ApiError> {
    let query = BalanceQuery::try_from(request)?;
    let rows = blocking(node, move |node| match query {
        BalanceQuery::Single {
            wallet_address,
            tokencode,
        } => {
            let balance = node.ledger.balance(&wallet_address, &tokencode)?;
            Ok(vec![BalanceRow {
                wallet_address,
                tokencode,
                balance,
            }])
        }
        BalanceQuery::Wallet(wallet_address) => node.ledger.balances_by_wallet(&wallet_address),
        BalanceQuery::Token(tokencode) => node.ledger.balances_by_token(&tokencode),
    })
    .await?;
    Ok(Json(rows))
}

/// Answers 409 if a finalization or another revert holds the ledger.
async fn revert_chain(
    State(node): State<Arc<Node>>,
    Json(request): Json<RevertRequest>,
) -> std::result::Result<Json<RevertReport>, ApiError> {
    let report = blocking(node, move |node| node.try_revert_chain(request.block_index)).await?;
    Ok(Json(report))
}

async fn list_staged_receipts(
    State(node): State<Arc<Node>>,
    Path(index): Path<u64>,
) -> std::result::Result<Json<Vec<Receipt>>, ApiError> {
    let receipts = blocking(node, move |node| node.staging.list_receipts_for_block(index)).await?;
    Ok(Json(receipts))
}

async fn get_peers(State(node): State<Arc<Node>>) -> std::result::Result<Json<Vec<Peer>>, ApiError> {
    Ok(Json(node.peers.get_peers()?))
}

async fn add_peer(
    State(node): State<Arc<Node>>,
    Json(request): Json<AddPeerRequest>,
) -> std::result::Result<Json<AddPeerResponse>, ApiError> {
    let peer = Peer::parse(&request.address)?;
    let added = node.peers.add_peer(peer.clone());
    info!(peer = %peer, added, "peer added");
    Ok(Json(AddPeerResponse { peer, added }))
}

async fn clear_peers(State(node): State<Arc<Node>>) -> impl IntoResponse {
    node.peers.clear();
    info!("peer list cleared");
    StatusCode::NO_CONTENT
}
