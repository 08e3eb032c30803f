//! Data-access core for admin interfaces: adapters, a query cache with
//! single-flight loads, request batching, and optimistic mutations with undo.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
