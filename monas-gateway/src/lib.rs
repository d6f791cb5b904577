pub mod application_service;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod port;
pub mod presentation;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use domain::*;
pub use port::*;

pub use application_service::{Gateway, RetrievalError, RetrievalOutcome, RetrievalService};
pub use config::GatewayConfig;
