//! Presentation layer - Protocol front ends for the retrieval pipeline
//!
//! Both the long-lived SCGI listener and the single-shot CGI mode format
//! their answers through [`response::Response`].

pub mod cgi;
pub mod response;
pub mod scgi;

pub use response::{respond, Response, StatusCode};
