//! `PaymentsService`: tipping peers through the payment daemon.

use rvchat_client::ClientCommand;
use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};

use crate::{err_to_status, proto};

/// gRPC implementation of `PaymentsService`.
pub struct PaymentsServiceImpl {
    command_tx: mpsc::Sender<ClientCommand>,
}

impl PaymentsServiceImpl {
    /// Creates the service.
    pub fn new(command_tx: mpsc::Sender<ClientCommand>) -> Self {
        Self { command_tx }
    }
}

#[tonic::async_trait]
impl proto::payments_service_server::PaymentsService for PaymentsServiceImpl {
    async fn tip_user(
        &self,
        request: Request<proto::TipUserRequest>,
    ) -> Result<Response<proto::TipUserResponse>, Status> {
        let req = request.into_inner();
        if !req.dcr_amount.is_finite() || req.dcr_amount <= 0.0 {
            return Err(Status::invalid_argument("dcr_amount must be positive"));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ClientCommand::TipUser {
                user: req.user,
                dcr_amount: req.dcr_amount,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Status::unavailable("client core is shutting down"))?;

        reply_rx
            .await
            .map_err(|_| Status::internal("client core dropped the reply"))?
            .map_err(err_to_status)?;
        Ok(Response::new(proto::TipUserResponse {}))
    }
}
