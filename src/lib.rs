//! Terminal Farm Service Library
//!
//! This library provides the core components for the terminal farm: lifecycle
//! orchestration for MetaTrader terminal processes, webhook ingress for their
//! telemetry, deal reconciliation into the trade ledger, and the durable
//! command / quarantine queues that connect them.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod queue;
pub mod rate_limit;
pub mod task_runner;
