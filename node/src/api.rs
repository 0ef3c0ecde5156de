//! HTTP and WebSocket surface of the table.
//!
//! [`router`] is the public surface. [`admin_router`] carries the operator
//! routes that move money into the table or lift a reconciliation pause, and
//! is served on its own port.

use crate::table::{AccountView, Closed, Mailbox, PositionChange};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use jackpot_execution::{LedgerError, WagerError, WithdrawalError};
use jackpot_types::{AccountId, Event};
use serde::{Deserialize, Serialize};
use std::{num::NonZeroU32, sync::Arc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const DEFAULT_HISTORY: usize = 20;

#[derive(Clone)]
struct AppState {
    mailbox: Mailbox,
    wagers: Arc<DefaultKeyedRateLimiter<AccountId>>,
}

#[derive(Clone)]
struct AdminState {
    mailbox: Mailbox,
}

/// Build the public router. Wagers are rate limited per account.
pub fn router(mailbox: Mailbox, wager_rate_per_second: NonZeroU32) -> Router {
    let state = AppState {
        mailbox,
        wagers: Arc::new(RateLimiter::keyed(Quota::per_second(wager_rate_per_second))),
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/round", get(round))
        .route("/rounds", get(rounds))
        .route("/accounts", post(open_account))
        .route("/accounts/:id", get(account))
        .route("/accounts/:id/wallet", put(set_wallet))
        .route("/accounts/:id/positions", post(change_position))
        .route("/accounts/:id/withdrawals", get(withdrawals))
        .route("/wagers", post(place_wager))
        .route("/withdrawals", post(withdraw))
        .route("/ws", get(ws))
        .with_state(state)
}

/// Build the operator router: deposit confirmations and resuming a paused
/// table.
pub fn admin_router(mailbox: Mailbox) -> Router {
    Router::new()
        .route("/deposits", post(deposit))
        .route("/resume", post(resume))
        .with_state(AdminState { mailbox })
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Error returned by every handler: a status, a stable code and a message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl ToString) -> Self {
        Self {
            status,
            code,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<Closed> for ApiError {
    fn from(err: Closed) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", err)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let (status, code) = match &err {
            LedgerError::UnknownAccount(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
            LedgerError::AccountFrozen(_) => (StatusCode::LOCKED, "ACCOUNT_FROZEN"),
            LedgerError::ZeroAmount
            | LedgerError::EmptyReference
            | LedgerError::InvalidPosition(_)
            | LedgerError::InvalidWallet(_)
            | LedgerError::SameAccount(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            LedgerError::InsufficientFunds { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_FUNDS")
            }
            LedgerError::ConcurrencyConflict { .. } | LedgerError::RetriesExhausted { .. } => {
                (StatusCode::CONFLICT, "CONCURRENCY_CONFLICT")
            }
            LedgerError::DuplicateDeposit(_) => (StatusCode::CONFLICT, "DUPLICATE_DEPOSIT"),
            LedgerError::UnknownPosition { .. } => (StatusCode::NOT_FOUND, "POSITION_NOT_FOUND"),
            LedgerError::BalanceOverflow(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INVARIANT_VIOLATION")
            }
        };
        Self::new(status, code, err)
    }
}

impl From<WagerError> for ApiError {
    fn from(err: WagerError) -> Self {
        let (status, code) = match &err {
            WagerError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            WagerError::InsufficientFunds { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_FUNDS")
            }
            WagerError::RoundNotAcceptingWagers { .. } => {
                (StatusCode::CONFLICT, "ROUND_NOT_ACCEPTING_WAGERS")
            }
            WagerError::NoActiveRound => (StatusCode::CONFLICT, "NO_ACTIVE_ROUND"),
            WagerError::TableFull { .. } => (StatusCode::CONFLICT, "TABLE_FULL"),
            WagerError::Ledger(inner) => return inner.clone().into(),
        };
        Self::new(status, code, err)
    }
}

impl From<WithdrawalError> for ApiError {
    fn from(err: WithdrawalError) -> Self {
        let (status, code) = match &err {
            WithdrawalError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            WithdrawalError::BelowMinimum { .. } => (StatusCode::BAD_REQUEST, "BELOW_MINIMUM"),
            WithdrawalError::MissingDestination => {
                (StatusCode::BAD_REQUEST, "MISSING_DESTINATION")
            }
            WithdrawalError::InsufficientFunds { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_FUNDS")
            }
            WithdrawalError::InFlight(_) => (StatusCode::CONFLICT, "WITHDRAWAL_IN_FLIGHT"),
            WithdrawalError::ExternalTransferFailure { .. } => {
                (StatusCode::BAD_GATEWAY, "EXTERNAL_TRANSFER_FAILURE")
            }
            WithdrawalError::CompensationFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INVARIANT_VIOLATION")
            }
            WithdrawalError::Ledger(inner) => return inner.clone().into(),
        };
        Self::new(status, code, err)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn healthz() -> &'static str {
    "ok"
}

async fn round(State(mut state): State<AppState>) -> ApiResult<crate::table::TableView> {
    Ok(Json(state.mailbox.table().await?))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn rounds(
    State(mut state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<jackpot_types::Round>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY);
    Ok(Json(state.mailbox.history(limit).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenAccountRequest {
    account: AccountId,
    #[serde(default)]
    referred_by: Option<AccountId>,
}

async fn open_account(
    State(mut state): State<AppState>,
    Json(body): Json<OpenAccountRequest>,
) -> ApiResult<jackpot_types::Account> {
    Ok(Json(
        state
            .mailbox
            .open_account(body.account, body.referred_by)
            .await?,
    ))
}

async fn account(
    State(mut state): State<AppState>,
    Path(id): Path<AccountId>,
) -> ApiResult<AccountView> {
    Ok(Json(state.mailbox.account(id).await??))
}

#[derive(Debug, Deserialize)]
struct WalletRequest {
    wallet: String,
}

async fn set_wallet(
    State(mut state): State<AppState>,
    Path(id): Path<AccountId>,
    Json(body): Json<WalletRequest>,
) -> Result<StatusCode, ApiError> {
    state.mailbox.set_wallet(id, body.wallet).await??;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum PositionRequest {
    Add { item_id: String, principal: u64 },
    Remove { item_id: String },
    Stake { item_id: String },
    Unstake { item_id: String },
}

impl From<PositionRequest> for PositionChange {
    fn from(request: PositionRequest) -> Self {
        match request {
            PositionRequest::Add { item_id, principal } => {
                PositionChange::Add { item_id, principal }
            }
            PositionRequest::Remove { item_id } => PositionChange::Remove { item_id },
            PositionRequest::Stake { item_id } => PositionChange::SetStaked {
                item_id,
                staked: true,
            },
            PositionRequest::Unstake { item_id } => PositionChange::SetStaked {
                item_id,
                staked: false,
            },
        }
    }
}

async fn change_position(
    State(mut state): State<AppState>,
    Path(id): Path<AccountId>,
    Json(body): Json<PositionRequest>,
) -> ApiResult<jackpot_types::Account> {
    Ok(Json(state.mailbox.change_position(id, body.into()).await??))
}

async fn withdrawals(
    State(mut state): State<AppState>,
    Path(id): Path<AccountId>,
) -> ApiResult<Vec<jackpot_types::WithdrawalRequest>> {
    Ok(Json(state.mailbox.withdrawals(id).await?))
}

#[derive(Debug, Deserialize)]
struct DepositRequest {
    account: AccountId,
    amount: u64,
    reference: String,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    balance: u64,
}

async fn deposit(
    State(mut state): State<AdminState>,
    Json(body): Json<DepositRequest>,
) -> ApiResult<BalanceResponse> {
    let balance = state
        .mailbox
        .deposit(body.account, body.amount, body.reference)
        .await??;
    Ok(Json(BalanceResponse { balance }))
}

#[derive(Debug, Deserialize)]
struct WagerRequest {
    account: AccountId,
    amount: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WagerResponse {
    round_id: u64,
    stake: u64,
    pot: u64,
    participants: usize,
    balance: u64,
}

async fn place_wager(
    State(mut state): State<AppState>,
    Json(body): Json<WagerRequest>,
) -> ApiResult<WagerResponse> {
    if state.wagers.check_key(&body.account).is_err() {
        debug!(account = body.account, "wager rate limited");
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "too many wagers",
        ));
    }
    let receipt = state
        .mailbox
        .place_wager(body.account, body.amount)
        .await??;
    Ok(Json(WagerResponse {
        round_id: receipt.round_id,
        stake: receipt.stake,
        pot: receipt.pot,
        participants: receipt.participants,
        balance: receipt.balance,
    }))
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    account: AccountId,
    amount: u64,
    #[serde(default)]
    destination: Option<String>,
}

async fn withdraw(
    State(mut state): State<AppState>,
    Json(body): Json<WithdrawRequest>,
) -> ApiResult<jackpot_types::WithdrawalRequest> {
    Ok(Json(
        state
            .mailbox
            .withdraw(body.account, body.amount, body.destination)
            .await??,
    ))
}

async fn resume(State(mut state): State<AdminState>) -> Result<StatusCode, ApiError> {
    state.mailbox.resume().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    account: Option<AccountId>,
}

async fn ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.account))
}

/// Public events go to everyone; private ones only to their recipient.
fn visible_to(event: &Event, viewer: Option<AccountId>) -> bool {
    match event.recipient() {
        None => true,
        Some(recipient) => viewer == Some(recipient),
    }
}

async fn handle_socket(socket: WebSocket, mut state: AppState, viewer: Option<AccountId>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut events = state.mailbox.subscribe();

    // Start every connection from a full snapshot.
    if let Ok(view) = state.mailbox.table().await {
        let sync = Event::RoundSync { round: view.round };
        if let Ok(payload) = serde_json::to_string(&sync) {
            let _ = tx.send(Message::Text(payload));
        }
    }

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let broadcast_task = {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !visible_to(&event, viewer) {
                            continue;
                        }
                        if let Ok(payload) = serde_json::to_string(&event) {
                            if tx.send(Message::Text(payload)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(Ok(message)) = receiver.next().await {
        if let Message::Close(_) = message {
            break;
        }
    }

    write_task.abort();
    broadcast_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{self, Actor};
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use commonware_runtime::{tokio as cw_tokio, Metrics, Runner as _};
    use jackpot_execution::{
        withdrawal::mocks::MockGateway, RakePolicy, RoundConfig, SettlementConfig, Staking,
        WithdrawalConfig,
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn table_config() -> table::Config<MockGateway> {
        table::Config {
            round: RoundConfig {
                countdown_ms: 15_000,
                reveal_ms: 5_000,
                cooldown_ms: 8_000,
                min_wager: 10,
                max_wager: 1_000_000,
                max_participants: 8,
                settlement: SettlementConfig {
                    policy: RakePolicy::ProfitOnly,
                    rake_bps: 500,
                    referral_bps: 100,
                },
            },
            history_limit: 16,
            staking: Staking::new(1_000, 8),
            withdrawal: WithdrawalConfig {
                min_amount: 100,
                fee_bps: 100,
                timeout: Duration::from_secs(5),
                namespace: b"_JACKPOT_TEST".to_vec(),
            },
            withdrawal_history_limit: 64,
            gateway: MockGateway::default(),
            mailbox_size: 16,
            event_buffer: 64,
            tick_interval: Duration::from_millis(100),
            referral_retry: Duration::from_secs(1),
            referral_retry_max: Duration::from_secs(10),
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value)
    }

    /// Public and operator routers over one table.
    fn setup(context: cw_tokio::Context, rate: u32) -> (Router, Router) {
        let (actor, mailbox) = Actor::new(context.with_label("table"), table_config());
        actor.start();
        (
            router(mailbox.clone(), NonZeroU32::new(rate).unwrap()),
            admin_router(mailbox),
        )
    }

    #[test]
    fn test_wager_flow_over_http() {
        cw_tokio::Runner::new(cw_tokio::Config::default()).start(|context| async move {
            let (router, admin) = setup(context, 100);
            let (status, body) = call(&router, "GET", "/healthz", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, Value::String("ok".into()));

            let (status, body) =
                call(&router, "POST", "/accounts", Some(json!({ "account": 1 }))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["balance"], 0);

            let (status, body) = call(
                &admin,
                "POST",
                "/deposits",
                Some(json!({ "account": 1, "amount": 1_000, "reference": "tx-1" })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["balance"], 1_000);

            let (status, body) = call(
                &admin,
                "POST",
                "/deposits",
                Some(json!({ "account": 1, "amount": 1_000, "reference": "tx-1" })),
            )
            .await;
            assert_eq!(status, StatusCode::CONFLICT);
            assert_eq!(body["code"], "DUPLICATE_DEPOSIT");

            let (status, body) = call(
                &router,
                "POST",
                "/wagers",
                Some(json!({ "account": 1, "amount": 400 })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["roundId"], 1);
            assert_eq!(body["pot"], 400);
            assert_eq!(body["balance"], 600);

            let (status, body) = call(
                &router,
                "POST",
                "/wagers",
                Some(json!({ "account": 1, "amount": 5_000 })),
            )
            .await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(body["code"], "INSUFFICIENT_FUNDS");

            let (status, body) = call(&router, "GET", "/round", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "open");
            assert_eq!(body["round"]["pot"], 400);

            let (status, body) = call(&router, "GET", "/accounts/7", None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["code"], "ACCOUNT_NOT_FOUND");

            let (status, body) = call(&router, "GET", "/rounds?limit=5", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!([]));
        });
    }

    #[test]
    fn test_wagers_rate_limited_per_account() {
        cw_tokio::Runner::new(cw_tokio::Config::default()).start(|context| async move {
            let (router, admin) = setup(context, 1);
            for account in [1, 2] {
                call(&router, "POST", "/accounts", Some(json!({ "account": account }))).await;
                call(
                    &admin,
                    "POST",
                    "/deposits",
                    Some(json!({ "account": account, "amount": 1_000, "reference": format!("tx-{account}") })),
                )
                .await;
            }

            let wager = |account: u64| json!({ "account": account, "amount": 10 });
            let (status, _) = call(&router, "POST", "/wagers", Some(wager(1))).await;
            assert_eq!(status, StatusCode::OK);
            let (status, body) = call(&router, "POST", "/wagers", Some(wager(1))).await;
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(body["code"], "RATE_LIMITED");

            // Other accounts have their own budget.
            let (status, _) = call(&router, "POST", "/wagers", Some(wager(2))).await;
            assert_eq!(status, StatusCode::OK);
        });
    }

    #[test]
    fn test_withdrawal_and_positions_over_http() {
        cw_tokio::Runner::new(cw_tokio::Config::default()).start(|context| async move {
            let (router, admin) = setup(context, 100);
            call(&router, "POST", "/accounts", Some(json!({ "account": 3 }))).await;
            call(
                &admin,
                "POST",
                "/deposits",
                Some(json!({ "account": 3, "amount": 10_000, "reference": "tx-3" })),
            )
            .await;

            let (status, body) = call(
                &router,
                "POST",
                "/withdrawals",
                Some(json!({ "account": 3, "amount": 5_000 })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], "MISSING_DESTINATION");

            let (status, _) = call(
                &router,
                "PUT",
                "/accounts/3/wallet",
                Some(json!({ "wallet": "EQ-wallet" })),
            )
            .await;
            assert_eq!(status, StatusCode::NO_CONTENT);

            let (status, body) = call(
                &router,
                "POST",
                "/withdrawals",
                Some(json!({ "account": 3, "amount": 5_000 })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "confirmed");
            assert_eq!(body["fee"], 50);

            let (_, body) = call(&router, "GET", "/accounts/3/withdrawals", None).await;
            assert_eq!(body.as_array().map(Vec::len), Some(1));

            let (status, body) = call(
                &router,
                "POST",
                "/accounts/3/positions",
                Some(json!({ "action": "add", "itemId": "sword", "principal": 500 })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["positions"][0]["itemId"], "sword");

            let (status, body) = call(
                &router,
                "POST",
                "/accounts/3/positions",
                Some(json!({ "action": "stake", "itemId": "shield" })),
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["code"], "POSITION_NOT_FOUND");
        });
    }

    #[test]
    fn test_operator_routes_only_on_admin_router() {
        cw_tokio::Runner::new(cw_tokio::Config::default()).start(|context| async move {
            let (router, admin) = setup(context, 100);
            call(&router, "POST", "/accounts", Some(json!({ "account": 1 }))).await;
            call(
                &router,
                "POST",
                "/accounts",
                Some(json!({ "account": 2, "referredBy": 1 })),
            )
            .await;
            let deposit = json!({ "account": 1, "amount": 1_000, "reference": "tx-1" });

            let (status, _) = call(&router, "POST", "/deposits", Some(deposit.clone())).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            let (status, _) = call(&router, "POST", "/resume", None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            let (status, _) = call(&admin, "GET", "/round", None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);

            let (status, body) = call(&admin, "POST", "/deposits", Some(deposit)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["balance"], 1_000);
            let (status, _) = call(&admin, "POST", "/resume", None).await;
            assert_eq!(status, StatusCode::NO_CONTENT);

            let (status, body) = call(&router, "GET", "/accounts/1", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["balance"], 1_000);
            assert_eq!(body["referralCount"], 1);
        });
    }

    #[test]
    fn test_private_events_filtered() {
        let balance = Event::BalanceChanged {
            account: 1,
            balance: 10,
        };
        assert!(visible_to(&balance, Some(1)));
        assert!(!visible_to(&balance, Some(2)));
        assert!(!visible_to(&balance, None));
        let tick = Event::CountdownTick {
            round_id: 1,
            seconds_remaining: 3,
        };
        assert!(visible_to(&tick, None));
    }
}
