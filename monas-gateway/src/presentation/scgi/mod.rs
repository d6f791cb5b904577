//! SCGI front end: frame codec and connection server.

pub mod frame;
pub mod server;

pub use frame::{decode, FrameError, FramedRequest, PATH_INFO};
pub use server::{handle_connection, ListenTarget, ScgiListener, ScgiServer};
