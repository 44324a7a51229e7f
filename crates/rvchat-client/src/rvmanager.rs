//! Rendezvous manager: routes inbound blobs to registered handlers.
//!
//! Owns the `tag → handler` map. Handlers are either persistent
//! (payment events and the like, re-registered on every reconnect) or
//! one-shot (the expected inbound messages of a peer's ratchet window,
//! removed when they fire).
//!
//! Registering a tag that is already present is a protocol error, not a
//! silent overwrite — two handlers behind one tag means the two
//! endpoints have desynced.
//!
//! Dispatch uses copy-on-read: the dispatcher clones the current map
//! snapshot under a short lock and invokes handlers outside it, so a
//! handler can never race a concurrent registration. Handlers must not
//! block; they forward into channels or spawn their own work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rvchat_types::{Result, RvChatError, RvTag};

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

/// An inbound blob as handed to a handler.
#[derive(Clone, Debug)]
pub struct InboundBlob {
    /// The tag it arrived at.
    pub tag: RvTag,
    /// The opaque payload.
    pub payload: Vec<u8>,
    /// Relay delivery identifier (echoed in the server ack).
    pub delivery_id: u64,
}

/// Non-blocking blob handler.
pub type RvHandler = Arc<dyn Fn(InboundBlob) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    handler: RvHandler,
    persistent: bool,
    paid: bool,
}

// ---------------------------------------------------------------------------
// RvManager
// ---------------------------------------------------------------------------

/// Tag → handler registry.
#[derive(Default)]
pub struct RvManager {
    inner: Mutex<HashMap<RvTag, Registration>>,
}

impl RvManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `tag`.
    ///
    /// # Errors
    ///
    /// [`RvChatError::TagCollision`] if the tag is already registered.
    pub fn register(
        &self,
        tag: RvTag,
        handler: RvHandler,
        persistent: bool,
        paid: bool,
    ) -> Result<()> {
        let mut map = self.lock()?;
        if map.contains_key(&tag) {
            return Err(RvChatError::TagCollision {
                reason: format!("tag {tag} already has a handler"),
            });
        }
        map.insert(
            tag,
            Registration {
                handler,
                persistent,
                paid,
            },
        );
        Ok(())
    }

    /// Removes a registration. Unknown tags are ignored.
    pub fn unregister(&self, tag: &RvTag) {
        match self.inner.lock() {
            Ok(mut map) => {
                map.remove(tag);
            }
            Err(e) => tracing::warn!(error = %e, "rendezvous map lock poisoned during unregister"),
        }
    }

    /// Returns `true` if `tag` currently has a handler. Degrades to
    /// `false` if the map lock is poisoned.
    pub fn is_registered(&self, tag: &RvTag) -> bool {
        match self.inner.lock() {
            Ok(map) => map.contains_key(tag),
            Err(e) => {
                tracing::warn!(error = %e, "rendezvous map lock poisoned");
                false
            }
        }
    }

    /// All live tags with their paid flag, for (re-)subscription.
    /// Degrades to an empty listing if the map lock is poisoned.
    pub fn live_tags(&self) -> Vec<(RvTag, bool)> {
        match self.inner.lock() {
            Ok(map) => map.iter().map(|(t, r)| (*t, r.paid)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "rendezvous map lock poisoned, listing no tags");
                Vec::new()
            }
        }
    }

    /// Dispatches a blob to its handler.
    ///
    /// One-shot registrations are removed before the handler runs, so a
    /// duplicate delivery of the same tag finds nothing.
    ///
    /// # Errors
    ///
    /// [`RvChatError::UnknownTag`] if no handler is registered.
    pub fn dispatch(&self, blob: InboundBlob) -> Result<()> {
        let registration = {
            let mut map = self.lock()?;
            match map.get(&blob.tag) {
                Some(r) if r.persistent => r.clone(),
                Some(_) => map.remove(&blob.tag).unwrap(),
                None => {
                    return Err(RvChatError::UnknownTag {
                        reason: format!("no handler for tag {}", blob.tag),
                    })
                }
            }
        };

        (registration.handler)(blob);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RvTag, Registration>>> {
        self.inner.lock().map_err(|e| RvChatError::Storage {
            reason: format!("rendezvous map lock poisoned: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tag(b: u8) -> RvTag {
        RvTag::new([b; 32])
    }

    fn counting_handler(counter: Arc<AtomicU32>) -> RvHandler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn blob(t: RvTag) -> InboundBlob {
        InboundBlob {
            tag: t,
            payload: vec![1, 2, 3],
            delivery_id: 1,
        }
    }

    #[test]
    fn duplicate_registration_is_collision() -> Result<()> {
        let mgr = RvManager::new();
        let c = Arc::new(AtomicU32::new(0));

        mgr.register(tag(1), counting_handler(c.clone()), false, false)?;
        let result = mgr.register(tag(1), counting_handler(c), false, false);
        assert!(matches!(result, Err(RvChatError::TagCollision { .. })));
        Ok(())
    }

    #[test]
    fn one_shot_fires_once() -> Result<()> {
        let mgr = RvManager::new();
        let c = Arc::new(AtomicU32::new(0));

        mgr.register(tag(1), counting_handler(c.clone()), false, false)?;
        mgr.dispatch(blob(tag(1)))?;
        assert_eq!(c.load(Ordering::SeqCst), 1);

        // Second delivery finds no handler.
        assert!(matches!(
            mgr.dispatch(blob(tag(1))),
            Err(RvChatError::UnknownTag { .. })
        ));
        Ok(())
    }

    #[test]
    fn persistent_survives_firing() -> Result<()> {
        let mgr = RvManager::new();
        let c = Arc::new(AtomicU32::new(0));

        mgr.register(tag(2), counting_handler(c.clone()), true, true)?;
        mgr.dispatch(blob(tag(2)))?;
        mgr.dispatch(blob(tag(2)))?;
        assert_eq!(c.load(Ordering::SeqCst), 2);
        assert!(mgr.is_registered(&tag(2)));
        Ok(())
    }

    #[test]
    fn live_tags_reports_paid_flag() -> Result<()> {
        let mgr = RvManager::new();
        let c = Arc::new(AtomicU32::new(0));

        mgr.register(tag(1), counting_handler(c.clone()), false, false)?;
        mgr.register(tag(2), counting_handler(c), true, true)?;

        let mut tags = mgr.live_tags();
        tags.sort_by_key(|(t, _)| *t.as_bytes());
        assert_eq!(tags, vec![(tag(1), false), (tag(2), true)]);
        Ok(())
    }

    #[test]
    fn unregister_then_dispatch_is_unknown() -> Result<()> {
        let mgr = RvManager::new();
        let c = Arc::new(AtomicU32::new(0));

        mgr.register(tag(1), counting_handler(c), false, false)?;
        mgr.unregister(&tag(1));
        assert!(matches!(
            mgr.dispatch(blob(tag(1))),
            Err(RvChatError::UnknownTag { .. })
        ));
        Ok(())
    }

    #[test]
    fn reregister_after_one_shot_fire_is_allowed() -> Result<()> {
        let mgr = RvManager::new();
        let c = Arc::new(AtomicU32::new(0));

        mgr.register(tag(1), counting_handler(c.clone()), false, false)?;
        mgr.dispatch(blob(tag(1)))?;
        // The tag was consumed; registering it again is legal.
        mgr.register(tag(1), counting_handler(c), false, false)?;
        Ok(())
    }
}
