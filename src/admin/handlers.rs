use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::admin::AdminState;
use crate::blockchain::address::Address;
use crate::blockchain::transaction::SignedTransaction;
use crate::blockchain::types::BlockchainError;
use crate::notifications::types::{NotificationError, NotificationEvent, TestDelivery};
use crate::payments::processor::ProcessOutcome;
use crate::payments::store::StoreError;
use crate::payments::types::{
    unix_now, ContractInstance, ContractStatus, LinkKind, PaymentLink, SettlementTarget,
    TargetRef, TransactionRecord, WatchedAddress,
};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub network: String,
    pub indexer: &'static str,
    pub indexer_connected: bool,
    pub watched_addresses: usize,
    pub polling: bool,
    pub allocator_degraded: bool,
    pub uptime_secs: u64,
}

#[derive(Deserialize)]
pub struct CreatePaymentLink {
    pub owner_id: String,
    pub kind: LinkKind,
    pub amount: Option<u64>,
    #[serde(default)]
    pub accept_zero_conf: bool,
}

#[derive(Deserialize)]
pub struct RegisterContract {
    pub owner_id: String,
    pub address: String,
}

#[derive(Deserialize)]
pub struct PayoutRequest {
    pub sender_index: u32,
    pub recipient: String,
    pub amount: u64,
}

#[derive(Serialize)]
pub struct PayoutResponse {
    #[serde(flatten)]
    pub transaction: SignedTransaction,
    pub raw_hex: String,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Ledger(BlockchainError),
    Store(StoreError),
    Notification(NotificationError),
}

impl From<BlockchainError> for ApiError {
    fn from(e: BlockchainError) -> Self {
        match e {
            BlockchainError::InvalidAddress(_)
            | BlockchainError::Decode(_)
            | BlockchainError::OutputBelowDust { .. } => ApiError::BadRequest(e.to_string()),
            other => ApiError::Ledger(other),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<NotificationError> for ApiError {
    fn from(e: NotificationError) -> Self {
        match e {
            NotificationError::NoEndpoint(owner) => {
                ApiError::NotFound(format!("no webhook configured for {owner}"))
            }
            other => ApiError::Notification(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what),
            ApiError::BadRequest(why) => (StatusCode::BAD_REQUEST, why),
            ApiError::Ledger(e @ BlockchainError::InsufficientFunds { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            ApiError::Ledger(e) => {
                tracing::error!(error = %e, "Admin request failed on ledger");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "Admin request failed on store");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            ApiError::Notification(e) => {
                tracing::error!(error = %e, "Admin webhook test failed");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub async fn get_health(State(state): State<AdminState>) -> impl IntoResponse {
    if state.watcher.is_connected() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "reason": "indexer disconnected" })),
        )
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let connected = state.watcher.is_connected();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if connected { "operational" } else { "degraded" },
        network: format!("{:?}", state.watcher.network()).to_lowercase(),
        indexer: state.watcher.indexer_name(),
        indexer_connected: connected,
        watched_addresses: state.watcher.watched().len(),
        polling: state.watcher.is_polling(),
        allocator_degraded: state.allocator.is_degraded(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub async fn get_watched(State(state): State<AdminState>) -> Json<Vec<WatchedAddress>> {
    Json(state.watcher.watched())
}

/// Allocate an index, derive its address, persist the link and watch it.
pub async fn create_payment_link(
    State(state): State<AdminState>,
    Json(request): Json<CreatePaymentLink>,
) -> Result<(StatusCode, Json<PaymentLink>), ApiError> {
    let index = state.allocator.next_index().await?;
    let address = state.wallet.derive_address(index)?.to_cashaddr();
    let link = PaymentLink {
        id: Uuid::new_v4(),
        owner_id: request.owner_id,
        kind: request.kind,
        address: Some(address.clone()),
        derivation_index: Some(index),
        amount: request.amount,
        accept_zero_conf: request.accept_zero_conf,
        active: true,
        created_at: unix_now(),
    };
    state
        .store
        .insert_target(SettlementTarget::PaymentLink(link.clone()))
        .await?;
    state
        .watcher
        .watch_address(
            &address,
            TargetRef::payment_link(link.id),
            &link.owner_id,
            link.amount,
            link.accept_zero_conf,
        )
        .await?;
    tracing::info!(link = %link.id, index = index, address = %address, "Payment link created");
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn register_contract(
    State(state): State<AdminState>,
    Json(request): Json<RegisterContract>,
) -> Result<(StatusCode, Json<ContractInstance>), ApiError> {
    let address = Address::parse(&request.address, state.watcher.network())?.to_cashaddr();
    let contract = ContractInstance {
        id: Uuid::new_v4(),
        owner_id: request.owner_id,
        address,
        status: ContractStatus::Active,
        created_at: unix_now(),
    };
    state
        .store
        .insert_target(SettlementTarget::Contract(contract.clone()))
        .await?;
    state
        .watcher
        .watch_contract_address(&contract.address, contract.id, &contract.owner_id)
        .await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

/// Reconcile an address now instead of waiting for the next push or sweep.
pub async fn check_address(
    State(state): State<AdminState>,
    Path(address): Path<String>,
) -> Json<Vec<TransactionRecord>> {
    let outcomes = state.watcher.check_address(&address).await;
    Json(
        outcomes
            .iter()
            .filter_map(ProcessOutcome::record)
            .cloned()
            .collect(),
    )
}

pub async fn send_payout(
    State(state): State<AdminState>,
    Json(request): Json<PayoutRequest>,
) -> Result<Json<PayoutResponse>, ApiError> {
    let recipient = Address::parse(&request.recipient, state.payout.network())?;
    let signed = state
        .payout
        .send(request.sender_index, &recipient, request.amount)
        .await?;
    Ok(Json(PayoutResponse {
        raw_hex: signed.raw_hex(),
        transaction: signed,
    }))
}

pub async fn get_transaction(
    State(state): State<AdminState>,
    Path(tx_id): Path<String>,
) -> Result<Json<TransactionRecord>, ApiError> {
    state
        .store
        .find_transaction(&tx_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("transaction {tx_id}")))
}

pub async fn get_notification(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationEvent>, ApiError> {
    state
        .store
        .find_notification(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("notification {id}")))
}

pub async fn post_webhook_test(
    State(state): State<AdminState>,
    Path(owner): Path<String>,
) -> Result<Json<TestDelivery>, ApiError> {
    Ok(Json(state.notifier.send_test(&owner).await?))
}
