//! gRPC surface for local frontends (CLI, GUI) driving the rvchat
//! client core.
//!
//! The RPC layer is a thin translation shim: it validates input, sends
//! [`rvchat_client::ClientCommand`]s through the bounded command
//! channel, awaits the oneshot reply, and maps errors to
//! `tonic::Status` codes. Event streams wrap the durable delivery
//! streams, so a frontend that reopens a stream with `unacked_from`
//! replays exactly the events it never acked.
//!
//! # Modules
//!
//! - [`version_service`] — version info and keepalive heartbeats.
//! - [`chat_service`] — PM/GCM triples and key-exchange mediation.
//! - [`posts_service`] — post subscriptions and streams.
//! - [`payments_service`] — tipping.
//! - [`server`] — the [`server::RpcServer`] entry point.
//! - [`stream_util`] — shared replay/live stream plumbing.

pub mod chat_service;
pub mod payments_service;
pub mod posts_service;
pub mod server;
pub mod stream_util;
pub mod version_service;

/// Generated protobuf/gRPC code from `proto/rvchat.proto`.
pub mod proto {
    tonic::include_proto!("rvchat");
}

pub use server::RpcServer;

use rvchat_types::RvChatError;
use tonic::Status;

/// Maps a core error to an RPC status.
pub(crate) fn err_to_status(err: RvChatError) -> Status {
    match &err {
        RvChatError::Malformed { .. } | RvChatError::Config { .. } => {
            Status::invalid_argument(err.to_string())
        }
        RvChatError::UserNotFound { .. } => Status::not_found(err.to_string()),
        RvChatError::AmbiguousUser { .. } => Status::invalid_argument(err.to_string()),
        RvChatError::PolicyRejected { .. } => Status::failed_precondition(err.to_string()),
        RvChatError::RateLimited { .. } | RvChatError::Resource { .. } => {
            Status::resource_exhausted(err.to_string())
        }
        RvChatError::Transport { .. } | RvChatError::Timeout { .. } => {
            Status::unavailable(err.to_string())
        }
        RvChatError::Crypto { .. }
        | RvChatError::OutOfOrder { .. }
        | RvChatError::UnknownTag { .. }
        | RvChatError::TagCollision { .. }
        | RvChatError::RatchetDesync { .. } => Status::failed_precondition(err.to_string()),
        RvChatError::Storage { .. } | RvChatError::Fatal { .. } => Status::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_covers_the_interesting_codes() {
        let cases = [
            (
                RvChatError::UserNotFound { reason: "x".into() },
                tonic::Code::NotFound,
            ),
            (
                RvChatError::PolicyRejected { reason: "x".into() },
                tonic::Code::FailedPrecondition,
            ),
            (
                RvChatError::Transport { reason: "x".into() },
                tonic::Code::Unavailable,
            ),
            (
                RvChatError::Malformed { reason: "x".into() },
                tonic::Code::InvalidArgument,
            ),
            (
                RvChatError::Storage { reason: "x".into() },
                tonic::Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err_to_status(err).code(), code);
        }
    }
}
