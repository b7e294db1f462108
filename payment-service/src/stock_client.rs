use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::StockError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StockClient: Send + Sync {
    /// Adds `delta` (negative to reserve) to the product's stock.
    async fn update_quantity(&self, product_id: &str, delta: i32) -> Result<(), StockError>;
}

#[derive(Debug, Serialize)]
struct UpdateQuantityRequest<'a> {
    product_id: &'a str,
    quantity_change: i32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpStockClient {
    client: reqwest::Client,
    update_url: String,
}

impl HttpStockClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StockError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            update_url: format!("{}/product/updateQuantity", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl StockClient for HttpStockClient {
    async fn update_quantity(&self, product_id: &str, delta: i32) -> Result<(), StockError> {
        let response = self
            .client
            .post(&self.update_url)
            .json(&UpdateQuantityRequest {
                product_id,
                quantity_change: delta,
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!(product_id, delta, "Stock updated");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody { error }) => StockError::Rejected {
                status: status.as_u16(),
                message: error,
            },
            Err(_) => StockError::Status(status.as_u16()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as HttpStatus, response::IntoResponse, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::net::SocketAddr;

    async fn update_quantity(Json(body): Json<Value>) -> axum::response::Response {
        match body["product_id"].as_str() {
            Some("in-stock") if body["quantity_change"] == -2 => HttpStatus::OK.into_response(),
            Some("sold-out") => (
                HttpStatus::CONFLICT,
                Json(json!({ "error": "insufficient stock" })),
            )
                .into_response(),
            _ => (HttpStatus::INTERNAL_SERVER_ERROR, "boom").into_response(),
        }
    }

    async fn serve() -> SocketAddr {
        let app = Router::new().route("/product/updateQuantity", post(update_quantity));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client(addr: SocketAddr) -> HttpStockClient {
        HttpStockClient::new(&format!("http://{}/", addr), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn ok_response_is_success() {
        let addr = serve().await;
        client(addr).update_quantity("in-stock", -2).await.unwrap();
    }

    #[tokio::test]
    async fn json_error_body_is_decoded() {
        let addr = serve().await;
        match client(addr).update_quantity("sold-out", -1).await {
            Err(StockError::Rejected { status, message }) => {
                assert_eq!(status, 409);
                assert_eq!(message, "insufficient stock");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn plain_error_body_reports_status_only() {
        let addr = serve().await;
        assert!(matches!(
            client(addr).update_quantity("unknown", -1).await,
            Err(StockError::Status(500))
        ));
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            client(addr).update_quantity("in-stock", -2).await,
            Err(StockError::Transport(_))
        ));
    }
}
