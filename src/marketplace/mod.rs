//! Marketplace storefront built on the sync layer.
//!
//! `api` registers the storefront reads and writes, `backend` simulates the
//! remote store they talk to, and `scenario` scripts end-to-end sessions.

pub mod api;
pub mod backend;
pub mod models;
pub mod scenario;

pub use api::{MarketplaceApi, names};
pub use backend::MarketplaceBackend;
pub use scenario::{Observed, ScenarioReport, Storefront};
