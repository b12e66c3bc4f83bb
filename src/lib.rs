//! Fraudwatch — stateless card-fraud MONITORING evaluation service.
//!
//! Receives one transaction per request, evaluates the country-appropriate
//! compiled ruleset (all-match), runs Redis-backed velocity checks for
//! matched rules, and publishes the decision asynchronously to a durable
//! stream. Degrades gracefully (fail-open) when storage, velocity, or
//! publishing fail.

pub mod api;
pub mod engine;
pub mod middleware;
pub mod models;
pub mod outbox;
pub mod publish;
pub mod registry;
pub mod reload;
pub mod service;
pub mod state;
pub mod storage;
pub mod velocity;

pub use state::AppState;
