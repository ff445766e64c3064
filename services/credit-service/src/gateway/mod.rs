//! External payment gateway collaborator.
//!
//! The service only needs one remote capability, minting an order, plus the
//! gateway's signature scheme (see [`signature`]), which is verified locally
//! and never needs network access.

pub mod http;
pub mod signature;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub use http::HttpPaymentGateway;
pub use signature::PaymentSigner;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network failure or timeout; the remote outcome is unknown.
    #[error("gateway unreachable: {0}")]
    Unavailable(String),

    /// Gateway answered with a non-success status.
    #[error("gateway rejected order ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteOrderRequest {
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    /// Our reference, echoed back by the gateway.
    pub receipt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteOrder {
    #[serde(rename = "id", alias = "gatewayOrderId")]
    pub gateway_order_id: String,
    #[serde(default)]
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_remote_order(
        &self,
        request: &RemoteOrderRequest,
    ) -> Result<RemoteOrder, GatewayError>;

    fn name(&self) -> &'static str;
}

/// Offline gateway that mints predictable ids (`order_local_000001`, ...).
///
/// Used when no gateway credentials are configured and as the test double.
#[derive(Debug, Default)]
pub struct DeterministicGateway {
    next: AtomicU64,
    unavailable: bool,
}

impl DeterministicGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway whose every call fails as if the network were down.
    pub fn unavailable() -> Self {
        Self {
            next: AtomicU64::new(0),
            unavailable: true,
        }
    }

    /// Number of orders minted so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for DeterministicGateway {
    async fn create_remote_order(
        &self,
        request: &RemoteOrderRequest,
    ) -> Result<RemoteOrder, GatewayError> {
        if self.unavailable {
            return Err(GatewayError::Unavailable(format!(
                "offline gateway refused {}",
                request.receipt
            )));
        }
        let seq = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteOrder {
            gateway_order_id: format!("order_local_{seq:06}"),
            status: "created".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "deterministic"
    }
}
