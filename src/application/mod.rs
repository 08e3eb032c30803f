//! Data access services: adapter contract, batching, mutations, effects.

pub mod adapter;
pub mod batch;
pub mod effects;
pub mod error;
pub mod mutation;
pub mod pagination;
pub mod provider;
