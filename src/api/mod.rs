//! HTTP API
//!
//! Auditor endpoints (`/audit`, `/stats`, `/verify`) plus the operator and
//! player surface for rounds, cards and the scheduler.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
