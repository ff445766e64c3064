//! credit-service: prepaid credits, payment verification and credit-gated
//! resource unlocks.
//!
//! The engine (`ledger`, `orders`, `unlock`, `transactions`, `escrow`) sits
//! on a [`store::CreditStore`] and a [`gateway::PaymentGateway`]; `cache`,
//! `rate_limit` and `health` are the in-process infrastructure around it.
//! `api` exposes it all over actix-web.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod escrow;
pub mod gateway;
pub mod health;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod orders;
pub mod rate_limit;
pub mod store;
pub mod transactions;
pub mod unlock;

pub use error::{Result, ServiceError};
