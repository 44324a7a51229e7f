//! The gRPC server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use rvchat_client::delivery::Delivery;
use rvchat_client::ClientCommand;
use rvchat_types::{Result, RvChatError};
use tokio::sync::mpsc;

use crate::chat_service::ChatServiceImpl;
use crate::payments_service::PaymentsServiceImpl;
use crate::posts_service::PostsServiceImpl;
use crate::proto;
use crate::version_service::VersionServiceImpl;

/// Serves the Version, Chat, Posts, and Payments services over one
/// loopback listener.
pub struct RpcServer {
    command_tx: mpsc::Sender<ClientCommand>,
    delivery: Arc<Delivery>,
    app_version: String,
}

impl RpcServer {
    /// Creates the server front for an assembled client core.
    pub fn new(
        command_tx: mpsc::Sender<ClientCommand>,
        delivery: Arc<Delivery>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            command_tx,
            delivery,
            app_version: app_version.into(),
        }
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let version = proto::version_service_server::VersionServiceServer::new(
            VersionServiceImpl::new(self.app_version.clone()),
        );
        let chat = proto::chat_service_server::ChatServiceServer::new(ChatServiceImpl::new(
            self.command_tx.clone(),
            self.delivery.clone(),
        ));
        let posts = proto::posts_service_server::PostsServiceServer::new(PostsServiceImpl::new(
            self.command_tx.clone(),
            self.delivery.clone(),
        ));
        let payments = proto::payments_service_server::PaymentsServiceServer::new(
            PaymentsServiceImpl::new(self.command_tx.clone()),
        );

        tracing::info!(%addr, "rpc server listening");
        tonic::transport::Server::builder()
            .add_service(version)
            .add_service(chat)
            .add_service(posts)
            .add_service(payments)
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| RvChatError::Transport {
                reason: format!("rpc server failed: {e}"),
            })
    }
}
