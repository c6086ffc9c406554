//! Client-side contracts. Nothing here runs on the server; clients embed
//! these types so connection lifecycle, backoff and resume behave the same
//! everywhere.

pub mod reconnect;

pub use reconnect::{ConnectionState, OperationGuard, ReconnectionManager, ResumeRequest};
