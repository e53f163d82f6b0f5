//! Flash-Sale Execution Engine
//!
//! High-concurrency admission engine for time-boxed sales: multi-level rate
//! limiting, atomic scripted stock deduction, per-user quota accounting,
//! stock reconciliation, and a reliable event outbox. Transport adapters sit
//! in front of [`admission::AdmissionService`]; this crate owns everything
//! between request admission and durable event emission.

pub mod activity;
pub mod admission;
pub mod cache;
pub mod commit;
pub mod config;
pub mod db;
pub mod engine;
pub mod keystore;
pub mod limiter;
pub mod metrics;
pub mod models;
pub mod outbox;
pub mod quota;
pub mod sync;

pub use admission::{AdmissionService, AdmitRequest, RollbackStatus};
pub use config::EngineConfig;
pub use engine::Engine;
pub use models::{AdmitReason, AdmitResult};
