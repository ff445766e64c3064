use super::{GatewayError, PaymentGateway, RemoteOrder, RemoteOrderRequest};
use async_trait::async_trait;
use log::{info, warn};
use std::time::Duration;

/// Razorpay-style REST gateway: `POST {base_url}/orders` with basic auth.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    orders_url: String,
    key_id: String,
    key_secret: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: &str,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            orders_url: format!("{}/orders", base_url.trim_end_matches('/')),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        })
    }

    pub fn orders_url(&self) -> &str {
        &self.orders_url
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_remote_order(
        &self,
        request: &RemoteOrderRequest,
    ) -> Result<RemoteOrder, GatewayError> {
        let response = self
            .client
            .post(&self.orders_url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "[gateway] order {} rejected with {}: {}",
                request.receipt, status, body
            );
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let order = response
            .json::<RemoteOrder>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        info!(
            "[gateway] minted {} for receipt {}",
            order.gateway_order_id, request.receipt
        );
        Ok(order)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
