//! The broker core: sessions, routing and the cluster plane.

pub mod cache;
pub mod cluster;
pub mod conn;
pub mod service;
pub(crate) mod session;

pub use service::Service;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// Reserved topic announcing a broker-minted client id.
pub const CLIENT_ID_TOPIC: &[u8] = b"unitd/clientid/";

/// Reserved topic carrying per-message error payloads back to the publisher.
pub const ERROR_TOPIC: &[u8] = b"unitd/error/";

/// Error taxonomy of the broker core. Decode and protocol violations are
/// fatal to the session; store and cluster errors are publish-scoped.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Decode(#[from] ProtocolError),
    #[error("not authorised")]
    Auth,
    #[error("invalid topic")]
    TopicInvalid,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cluster(#[from] cluster::ClusterError),
    #[error("queue overflow")]
    QueueOverflow,
    #[error("protocol violation")]
    ProtocolViolation,
    #[error("not found")]
    NotFound,
}

/// JSON payload published on `unitd/error/`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    pub id: u16,
    pub code: u16,
    pub message: &'static str,
}

impl ErrorReply {
    pub fn unauthorized() -> Self {
        Self {
            id: 0,
            code: 401,
            message: "the security key provided is not authorized to perform this operation",
        }
    }

    pub fn topic_invalid() -> Self {
        Self {
            id: 0,
            code: 400,
            message: "the topic provided is invalid",
        }
    }

    pub fn server_error() -> Self {
        Self {
            id: 0,
            code: 500,
            message: "an error occurred while processing the request",
        }
    }
}
