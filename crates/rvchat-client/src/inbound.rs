//! Shared inbound wiring: point the rendezvous manager and the relay
//! subscription at a peer's current receive window.

use std::sync::Arc;

use rvchat_types::{Result, UserId};
use tokio::sync::mpsc;

use crate::registry::Registry;
use crate::rvmanager::{InboundBlob, RvManager};
use crate::session::SessionHandle;

/// Registers one-shot handlers and relay subscriptions for every tag in
/// `uid`'s receive window that is not watched yet. Handlers forward the
/// blob, tagged with the peer, into `peer_tx` for the event loop.
///
/// The relay-side subscribe is issued only while connected; otherwise
/// the session's connect-time re-subscription of all registered tags
/// covers it. Awaiting a subscribe with no connection would park the
/// caller indefinitely.
pub(crate) async fn watch_peer_tags(
    uid: UserId,
    registry: &Registry,
    rvmanager: &RvManager,
    session: &SessionHandle,
    peer_tx: &mpsc::UnboundedSender<(UserId, InboundBlob)>,
) -> Result<()> {
    for tag in registry.recv_tags(&uid)? {
        if rvmanager.is_registered(&tag) {
            continue;
        }
        let tx = peer_tx.clone();
        rvmanager.register(
            tag,
            Arc::new(move |blob| {
                let _ = tx.send((uid, blob));
            }),
            false,
            false,
        )?;
        if session.is_connected() {
            session.subscribe(tag, false).await?;
        }
    }
    Ok(())
}
