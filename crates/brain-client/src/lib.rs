//! HTTP gateway to the alpha simulation platform.
//!
//! [`BrainClient`] implements `alpha_core::SimulationGateway` on top of the
//! platform's REST API: cookie-session login, simulation start and polling,
//! cancellation, and submission with check polling. Status and payload
//! interpretation lives in [`mapping`].

mod client;
mod config;
mod error;
pub mod mapping;

pub use client::BrainClient;
pub use config::{BrainConfig, DEFAULT_BASE_URL};
pub use error::BrainError;

pub type Result<T, E = BrainError> = std::result::Result<T, E>;
