pub mod gateway;
pub mod retrieval_service;

pub use gateway::{Gateway, IpfsRetrievalService};
pub use retrieval_service::{FailureKind, RetrievalError, RetrievalOutcome, RetrievalService};
