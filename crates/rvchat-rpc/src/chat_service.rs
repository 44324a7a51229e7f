//! `ChatService`: PM and GCM triples plus key-exchange mediation.

use std::sync::Arc;

use rvchat_client::delivery::Delivery;
use rvchat_client::ClientCommand;
use rvchat_types::event::{GcmEvent, KxEvent, PmEvent};
use rvchat_types::{SequenceId, StreamKind, UserId};
use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};

use crate::stream_util::{open_stream, EventStream};
use crate::{err_to_status, proto};

/// gRPC implementation of `ChatService`.
pub struct ChatServiceImpl {
    command_tx: mpsc::Sender<ClientCommand>,
    delivery: Arc<Delivery>,
}

impl ChatServiceImpl {
    /// Creates the service.
    pub fn new(command_tx: mpsc::Sender<ClientCommand>, delivery: Arc<Delivery>) -> Self {
        Self {
            command_tx,
            delivery,
        }
    }

    /// Sends a command and awaits its oneshot reply.
    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<rvchat_types::Result<T>>) -> ClientCommand,
    ) -> Result<T, Status> {
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
impl proto::chat_service_server::ChatService for ChatServiceImpl {
    async fn pm(
        &self,
        request: Request<proto::PmRequest>,
    ) -> Result<Response<proto::PmResponse>, Status> {
        let req = request.into_inner();
        if req.msg.is_empty() {
            return Err(Status::invalid_argument("msg must not be empty"));
        }

        self.roundtrip(|reply| ClientCommand::SendPm {
            user: req.user,
            msg: req.msg,
            reply,
        })
        .await?;
        Ok(Response::new(proto::PmResponse {}))
    }

    type PMStreamStream = EventStream<proto::ReceivedPm>;

    async fn pm_stream(
        &self,
        request: Request<proto::PmStreamRequest>,
    ) -> Result<Response<Self::PMStreamStream>, Status> {
        let unacked_from = request.into_inner().unacked_from;
        let stream = open_stream(
            &self.delivery,
            StreamKind::Pm,
            unacked_from,
            |event: PmEvent, seq| proto::ReceivedPm {
                uid: event.from.to_string(),
                nick: event.nick,
                msg: event.msg,
                timestamp_ms: event.timestamp_ms,
                sequence_id: seq,
            },
        )?;
        Ok(Response::new(stream))
    }

    async fn ack_received_pm(
        &self,
        request: Request<proto::AckRequest>,
    ) -> Result<Response<proto::AckResponse>, Status> {
        let seq = request.into_inner().sequence_id;
        self.delivery
            .ack(StreamKind::Pm, SequenceId(seq))
            .map_err(err_to_status)?;
        Ok(Response::new(proto::AckResponse {}))
    }

    async fn gcm(
        &self,
        request: Request<proto::GcmRequest>,
    ) -> Result<Response<proto::GcmResponse>, Status> {
        let req = request.into_inner();
        if req.msg.is_empty() {
            return Err(Status::invalid_argument("msg must not be empty"));
        }

        self.roundtrip(|reply| ClientCommand::SendGcm {
            gc: req.gc,
            msg: req.msg,
            reply,
        })
        .await?;
        Ok(Response::new(proto::GcmResponse {}))
    }

    type GCMStreamStream = EventStream<proto::ReceivedGcm>;

    async fn gcm_stream(
        &self,
        request: Request<proto::GcmStreamRequest>,
    ) -> Result<Response<Self::GCMStreamStream>, Status> {
        let unacked_from = request.into_inner().unacked_from;
        let stream = open_stream(
            &self.delivery,
            StreamKind::Gcm,
            unacked_from,
            |event: GcmEvent, seq| proto::ReceivedGcm {
                gc: event.gc.to_string(),
                uid: event.from.to_string(),
                nick: event.nick,
                msg: event.msg,
                timestamp_ms: event.timestamp_ms,
                sequence_id: seq,
            },
        )?;
        Ok(Response::new(stream))
    }

    async fn ack_received_gcm(
        &self,
        request: Request<proto::AckRequest>,
    ) -> Result<Response<proto::AckResponse>, Status> {
        let seq = request.into_inner().sequence_id;
        self.delivery
            .ack(StreamKind::Gcm, SequenceId(seq))
            .map_err(err_to_status)?;
        Ok(Response::new(proto::AckResponse {}))
    }

    async fn mediate_kx(
        &self,
        request: Request<proto::MediateKxRequest>,
    ) -> Result<Response<proto::MediateKxResponse>, Status> {
        let req = request.into_inner();
        let target: UserId = req
            .target
            .parse()
            .map_err(|_| Status::invalid_argument("target must be a 64-char hex UID"))?;

        self.roundtrip(|reply| ClientCommand::MediateKx {
            mediator: req.mediator,
            target,
            reply,
        })
        .await?;
        Ok(Response::new(proto::MediateKxResponse {}))
    }

    type KXStreamStream = EventStream<proto::KxCompleted>;

    async fn kx_stream(
        &self,
        request: Request<proto::KxStreamRequest>,
    ) -> Result<Response<Self::KXStreamStream>, Status> {
        let unacked_from = request.into_inner().unacked_from;
        let stream = open_stream(
            &self.delivery,
            StreamKind::Kx,
            unacked_from,
            |event: KxEvent, seq| proto::KxCompleted {
                uid: event.peer.to_string(),
                nick: event.nick,
                mediated: event.mediated,
                sequence_id: seq,
            },
        )?;
        Ok(Response::new(stream))
    }

    async fn ack_kx_completed(
        &self,
        request: Request<proto::AckRequest>,
    ) -> Result<Response<proto::AckResponse>, Status> {
        let seq = request.into_inner().sequence_id;
        self.delivery
            .ack(StreamKind::Kx, SequenceId(seq))
            .map_err(err_to_status)?;
        Ok(Response::new(proto::AckResponse {}))
    }
}
