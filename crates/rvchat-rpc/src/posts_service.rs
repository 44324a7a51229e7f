//! `PostsService`: post subscriptions, post streams, status streams.

use std::sync::Arc;

use rvchat_client::delivery::Delivery;
use rvchat_client::ClientCommand;
use rvchat_types::event::{PostEvent, PostStatusEvent};
use rvchat_types::{SequenceId, StreamKind};
use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};

use crate::stream_util::{open_stream, EventStream};
use crate::{err_to_status, proto};

/// gRPC implementation of `PostsService`.
pub struct PostsServiceImpl {
    command_tx: mpsc::Sender<ClientCommand>,
    delivery: Arc<Delivery>,
}

impl PostsServiceImpl {
    /// Creates the service.
    pub fn new(command_tx: mpsc::Sender<ClientCommand>, delivery: Arc<Delivery>) -> Self {
        Self {
            command_tx,
            delivery,
        }
    }

    async fn roundtrip(
        &self,
        make: impl FnOnce(oneshot::Sender<rvchat_types::Result<()>>) -> ClientCommand,
    ) -> Result<(), Status> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Status::unavailable("client core is shutting down"))?;
        reply_rx
            .await
            .map_err(|_| Status::internal("client core dropped the reply"))?
            .map_err(err_to_status)
    }
}

#[tonic::async_trait]
impl proto::posts_service_server::PostsService for PostsServiceImpl {
    async fn subscribe_to_posts(
        &self,
        request: Request<proto::SubscribeToPostsRequest>,
    ) -> Result<Response<proto::SubscribeToPostsResponse>, Status> {
        let req = request.into_inner();
        self.roundtrip(|reply| ClientCommand::SubscribeToPosts {
            user: req.user,
            reply,
        })
        .await?;
        Ok(Response::new(proto::SubscribeToPostsResponse {}))
    }

    async fn unsubscribe_to_posts(
        &self,
        request: Request<proto::UnsubscribeToPostsRequest>,
    ) -> Result<Response<proto::UnsubscribeToPostsResponse>, Status> {
        let req = request.into_inner();
        self.roundtrip(|reply| ClientCommand::UnsubscribeToPosts {
            user: req.user,
            reply,
        })
        .await?;
        Ok(Response::new(proto::UnsubscribeToPostsResponse {}))
    }

    type PostsStreamStream = EventStream<proto::ReceivedPost>;

    async fn posts_stream(
        &self,
        request: Request<proto::PostsStreamRequest>,
    ) -> Result<Response<Self::PostsStreamStream>, Status> {
        let unacked_from = request.into_inner().unacked_from;
        let stream = open_stream(
            &self.delivery,
            StreamKind::Posts,
            unacked_from,
            |event: PostEvent, seq| proto::ReceivedPost {
                uid: event.from.to_string(),
                title: event.title,
                content: event.content,
                timestamp_ms: event.timestamp_ms,
                sequence_id: seq,
            },
        )?;
        Ok(Response::new(stream))
    }

    async fn ack_received_post(
        &self,
        request: Request<proto::AckRequest>,
    ) -> Result<Response<proto::AckResponse>, Status> {
        let seq = request.into_inner().sequence_id;
        self.delivery
            .ack(StreamKind::Posts, SequenceId(seq))
            .map_err(err_to_status)?;
        Ok(Response::new(proto::AckResponse {}))
    }

    type PostsStatusStreamStream = EventStream<proto::ReceivedPostStatus>;

    async fn posts_status_stream(
        &self,
        request: Request<proto::PostsStatusStreamRequest>,
    ) -> Result<Response<Self::PostsStatusStreamStream>, Status> {
        let unacked_from = request.into_inner().unacked_from;
        let stream = open_stream(
            &self.delivery,
            StreamKind::PostStatus,
            unacked_from,
            |event: PostStatusEvent, seq| proto::ReceivedPostStatus {
                uid: event.from.to_string(),
                post_id: event.post_id,
                status: event.status,
                timestamp_ms: event.timestamp_ms,
                sequence_id: seq,
            },
        )?;
        Ok(Response::new(stream))
    }

    async fn ack_received_post_status(
        &self,
        request: Request<proto::AckRequest>,
    ) -> Result<Response<proto::AckResponse>, Status> {
        let seq = request.into_inner().sequence_id;
        self.delivery
            .ack(StreamKind::PostStatus, SequenceId(seq))
            .map_err(err_to_status)?;
        Ok(Response::new(proto::AckResponse {}))
    }
}
