//! Payout gateway clients.

use jackpot_execution::{PayoutGateway, TransferReceipt, TransferRequest};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use thiserror::Error;
use tracing::info;
use url::Url;

/// Header carrying the withdrawal's idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("gateway rejected transfer: {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferBody<'a> {
    withdrawal: u64,
    destination: &'a str,
    amount: u64,
}

#[derive(Deserialize)]
struct TransferResponse {
    reference: String,
}

/// Posts transfers as JSON to a payout service.
#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl HttpGateway {
    /// `timeout` bounds each HTTP request; the withdrawal saga applies its
    /// own deadline on top.
    pub fn new(url: Url, token: Option<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, token })
    }
}

impl PayoutGateway for HttpGateway {
    type Error = GatewayError;

    fn transfer(
        &self,
        request: TransferRequest,
    ) -> impl Future<Output = Result<TransferReceipt, Self::Error>> + Send {
        let client = self.client.clone();
        let url = self.url.clone();
        let token = self.token.clone();
        async move {
            let mut builder = client
                .post(url)
                .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
                .json(&TransferBody {
                    withdrawal: request.withdrawal,
                    destination: &request.destination,
                    amount: request.amount,
                });
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            }
            let response = builder.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::Rejected { status, body });
            }
            let body: TransferResponse = response.json().await?;
            Ok(TransferReceipt {
                reference: body.reference,
            })
        }
    }
}

/// Confirms every transfer without moving funds. Used when no gateway is
/// configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogGateway;

impl PayoutGateway for LogGateway {
    type Error = std::convert::Infallible;

    fn transfer(
        &self,
        request: TransferRequest,
    ) -> impl Future<Output = Result<TransferReceipt, Self::Error>> + Send {
        info!(
            withdrawal = request.withdrawal,
            destination = %request.destination,
            amount = request.amount,
            key = %request.idempotency_key,
            "transfer logged (no gateway configured)"
        );
        async move {
            Ok(TransferReceipt {
                reference: format!("log-{}", request.idempotency_key),
            })
        }
    }
}

/// Either gateway, chosen from config.
#[derive(Clone)]
pub enum Gateway {
    Http(HttpGateway),
    Log(LogGateway),
}

impl PayoutGateway for Gateway {
    type Error = GatewayError;

    fn transfer(
        &self,
        request: TransferRequest,
    ) -> impl Future<Output = Result<TransferReceipt, Self::Error>> + Send {
        let gateway = self.clone();
        async move {
            match gateway {
                Gateway::Http(http) => http.transfer(request).await,
                Gateway::Log(log) => match log.transfer(request).await {
                    Ok(receipt) => Ok(receipt),
                    Err(never) => match never {},
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode},
        routing::post,
        Json, Router,
    };
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Received {
        withdrawal: u64,
        destination: String,
        amount: u64,
    }

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/transfers")).unwrap()
    }

    fn request() -> TransferRequest {
        TransferRequest {
            withdrawal: 3,
            destination: "EQ-wallet".to_string(),
            amount: 4_950,
            idempotency_key: "ab".repeat(32),
        }
    }

    #[tokio::test]
    async fn test_http_gateway_posts_transfer() {
        let seen: Arc<Mutex<Vec<(Option<String>, Option<String>, Received)>>> = Arc::default();
        let router = Router::new().route(
            "/transfers",
            post({
                let seen = seen.clone();
                move |headers: HeaderMap, Json(body): Json<Received>| {
                    let seen = seen.clone();
                    async move {
                        let header = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|value| value.to_str().ok())
                                .map(str::to_string)
                        };
                        seen.lock().unwrap().push((
                            header(IDEMPOTENCY_HEADER),
                            header("authorization"),
                            body,
                        ));
                        Json(serde_json::json!({ "reference": "tx-1" }))
                    }
                }
            }),
        );
        let url = serve(router).await;
        let gateway =
            HttpGateway::new(url, Some("secret".into()), Duration::from_secs(5)).unwrap();

        let receipt = gateway.transfer(request()).await.unwrap();
        assert_eq!(receipt.reference, "tx-1");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (key, auth, body) = &seen[0];
        assert_eq!(key.as_deref(), Some("ab".repeat(32).as_str()));
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
        assert_eq!(body.withdrawal, 3);
        assert_eq!(body.destination, "EQ-wallet");
        assert_eq!(body.amount, 4_950);
    }

    #[tokio::test]
    async fn test_http_gateway_rejection() {
        let router = Router::new().route(
            "/transfers",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad destination") }),
        );
        let url = serve(router).await;
        let gateway = Gateway::Http(HttpGateway::new(url, None, Duration::from_secs(5)).unwrap());

        match gateway.transfer(request()).await {
            Err(GatewayError::Rejected { status, body }) => {
                assert_eq!(status, reqwest::StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body, "bad destination");
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.reference)),
        }
    }

    #[tokio::test]
    async fn test_log_gateway_confirms() {
        let receipt = Gateway::Log(LogGateway).transfer(request()).await.unwrap();
        assert!(receipt.reference.starts_with("log-"));
    }
}
