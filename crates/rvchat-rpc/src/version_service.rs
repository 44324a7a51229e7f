//! `VersionService`: version info and keepalive heartbeats.

use std::time::Duration;

use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use crate::proto;
use crate::stream_util::EventStream;

/// Minimum keepalive interval; smaller requests are clamped up.
const MIN_KEEPALIVE_MS: i64 = 1_000;

/// gRPC implementation of `VersionService`.
pub struct VersionServiceImpl {
    app_version: String,
}

impl VersionServiceImpl {
    /// Creates the service.
    pub fn new(app_version: impl Into<String>) -> Self {
        Self {
            app_version: app_version.into(),
        }
    }
}

#[tonic::async_trait]
impl proto::version_service_server::VersionService for VersionServiceImpl {
    async fn version(
        &self,
        _request: Request<proto::VersionRequest>,
    ) -> Result<Response<proto::VersionResponse>, Status> {
        Ok(Response::new(proto::VersionResponse {
            app_version: self.app_version.clone(),
            runtime: format!("rust {}", env!("CARGO_PKG_VERSION")),
            app_name: "rvchat".into(),
        }))
    }

    type KeepaliveStreamStream = EventStream<proto::KeepaliveEvent>;

    async fn keepalive_stream(
        &self,
        request: Request<proto::KeepaliveStreamRequest>,
    ) -> Result<Response<Self::KeepaliveStreamStream>, Status> {
        let interval_ms = request.into_inner().interval_ms.max(MIN_KEEPALIVE_MS);
        let interval = tokio::time::interval(Duration::from_millis(interval_ms as u64));

        let stream = IntervalStream::new(interval).map(|_| {
            Ok(proto::KeepaliveEvent {
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            })
        });

        Ok(Response::new(Box::pin(stream)))
    }
}
