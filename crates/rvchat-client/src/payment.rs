//! Contracts with the external payment daemon and the user
//! confirmation gate.
//!
//! The payment-channel wallet is a separate process; the core only
//! needs invoice settlement and direct sends. Paid operations pass
//! through the [`ConfirmGate`] according to the configured
//! [`rvchat_types::config::PaidPolicy`].

use async_trait::async_trait;
use rvchat_types::{Result, RvChatError, UserId};

/// Node-level payment operations, implemented over the external wallet
/// daemon's RPC.
#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Settles a server-issued invoice, returning the preimage hex.
    async fn pay_invoice(&self, invoice: &str) -> Result<String>;

    /// Sends a direct payment to a peer's node.
    async fn send_payment(&self, to: &UserId, amount_atoms: u64) -> Result<()>;
}

/// Asks the user to approve a payment before it happens.
#[async_trait]
pub trait ConfirmGate: Send + Sync {
    /// Returns `true` if the user approves paying `amount_atoms` for
    /// `purpose`.
    async fn confirm(&self, purpose: &str, amount_atoms: u64) -> bool;
}

// ---------------------------------------------------------------------------
// Test / offline implementations
// ---------------------------------------------------------------------------

/// Payment client that refuses everything. Used when no wallet daemon
/// is configured.
pub struct NoPayments;

#[async_trait]
impl PaymentClient for NoPayments {
    async fn pay_invoice(&self, _invoice: &str) -> Result<String> {
        Err(RvChatError::PolicyRejected {
            reason: "no payment daemon configured".into(),
        })
    }

    async fn send_payment(&self, _to: &UserId, _amount_atoms: u64) -> Result<()> {
        Err(RvChatError::PolicyRejected {
            reason: "no payment daemon configured".into(),
        })
    }
}

/// Confirmation gate with a fixed answer.
pub struct FixedGate(pub bool);

#[async_trait]
impl ConfirmGate for FixedGate {
    async fn confirm(&self, _purpose: &str, _amount_atoms: u64) -> bool {
        self.0
    }
}
