//! Operator API.
//!
//! Everything under `/admin` requires `Authorization: Bearer <admin.api_key>`.
//! `/health` is open so load balancers can poll it.

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::blockchain::allocator::IndexAllocator;
use crate::blockchain::transaction::Payout;
use crate::blockchain::wallet::HdWallet;
use crate::notifications::dispatcher::Notifier;
use crate::payments::monitor::ChainWatcher;
use crate::payments::store::SettlementStore;

use self::auth::admin_auth_middleware;
use self::handlers::*;

#[derive(Clone)]
pub struct AdminState {
    pub watcher: Arc<ChainWatcher>,
    pub store: Arc<dyn SettlementStore>,
    pub notifier: Arc<Notifier>,
    pub allocator: Arc<IndexAllocator>,
    pub wallet: HdWallet,
    pub payout: Arc<Payout>,
    pub api_key: Arc<str>,
    pub started_at: Instant,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/watched", get(get_watched))
        .route("/admin/payment-links", post(create_payment_link))
        .route("/admin/contracts", post(register_contract))
        .route("/admin/addresses/{address}/check", post(check_address))
        .route("/admin/payouts", post(send_payout))
        .route("/admin/transactions/{tx_id}", get(get_transaction))
        .route("/admin/notifications/{id}", get(get_notification))
        .route("/admin/merchants/{owner}/webhook-test", post(post_webhook_test))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(get_health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
