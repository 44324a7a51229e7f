//! Group-chat controller: admin-authored membership with a generation
//! gate.
//!
//! Every metadata update the admin emits carries a strictly increasing
//! `generation`. Non-admin members cache the latest metadata they have
//! seen and accept group messages only at that generation: lower is
//! dropped, higher triggers a metadata-fetch request to the admin.
//!
//! The controller is pure bookkeeping: methods return the routed
//! messages to enqueue, and the event loop hands them to the outbox.
//! Fan-out is one outbox entry per member, so delivery to each member
//! fails or succeeds independently.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use rvchat_storage::GcStore;
use rvchat_types::{GcId, Result, RvChatError, Timestamp, UserId};
use rvchat_wire::{GcMetadata, RoutedMessage};

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of gating an inbound group message.
#[derive(Debug)]
pub enum GcVerdict {
    /// Accept and deliver to the local GCM stream.
    Deliver,
    /// Silently drop (stale generation, unknown group, non-member).
    Drop {
        /// Why the message was dropped.
        reason: String,
    },
    /// Drop, and ask the admin for current metadata.
    NeedsUpdate {
        /// The group's admin.
        admin: UserId,
        /// The request to enqueue.
        request: RoutedMessage,
    },
}

// ---------------------------------------------------------------------------
// GcController
// ---------------------------------------------------------------------------

/// Membership state for every group this identity belongs to.
pub struct GcController {
    store: GcStore,
    groups: Mutex<HashMap<GcId, GcMetadata>>,
    pending_invites: Mutex<HashMap<(GcId, u64), UserId>>,
    local: UserId,
}

impl GcController {
    /// Opens the controller, loading stored groups.
    pub fn open(store: GcStore, local: UserId) -> Result<Self> {
        let mut groups = HashMap::new();
        for meta in store.load_all()? {
            groups.insert(meta.id, meta);
        }
        Ok(Self {
            store,
            groups: Mutex::new(groups),
            pending_invites: Mutex::new(HashMap::new()),
            local,
        })
    }

    /// Creates a new group with this identity as admin, generation 1.
    pub fn create(&self, name: &str) -> Result<GcMetadata> {
        let mut id = [0u8; 32];
        rand::thread_rng().fill(&mut id);
        let meta = GcMetadata {
            id: GcId::new(id),
            name: name.to_string(),
            admin: self.local,
            members: vec![self.local],
            generation: 1,
        };
        self.store.save(&meta)?;
        self.groups_lock()?.insert(meta.id, meta.clone());
        Ok(meta)
    }

    /// Current metadata of a group, if known. Degrades to `None` if the
    /// group lock is poisoned.
    pub fn metadata(&self, gc: &GcId) -> Option<GcMetadata> {
        match self.groups.lock() {
            Ok(groups) => groups.get(gc).cloned(),
            Err(e) => {
                tracing::warn!(error = %e, "group state lock poisoned");
                None
            }
        }
    }

    /// Resolves a group by name or hex ID.
    pub fn resolve(&self, name_or_hex: &str) -> Result<GcId> {
        let groups = self.groups_lock()?;
        if let Some(meta) = groups.values().find(|m| m.name == name_or_hex) {
            return Ok(meta.id);
        }
        if let Ok(gc) = name_or_hex.parse::<GcId>() {
            if groups.contains_key(&gc) {
                return Ok(gc);
            }
        }
        Err(RvChatError::UserNotFound {
            reason: format!("no group matches '{name_or_hex}'"),
        })
    }

    /// Admin: produces an invite for `target`.
    pub fn invite(&self, gc: &GcId, target: UserId) -> Result<(UserId, RoutedMessage)> {
        let meta = self.admin_meta(gc)?;
        if meta.is_member(&target) {
            return Err(RvChatError::Config {
                reason: format!("{target} is already a member of {gc}"),
            });
        }

        let token: u64 = rand::thread_rng().gen();
        self.invites_lock()?.insert((*gc, token), target);

        Ok((target, RoutedMessage::GroupInvite { meta, token }))
    }

    /// Invitee: handles an inbound invite, auto-answering with a join.
    ///
    /// The metadata is cached immediately so the generation gate is
    /// primed when the first group message arrives.
    pub fn handle_invite(
        &self,
        from: &UserId,
        meta: GcMetadata,
        token: u64,
    ) -> Result<(UserId, RoutedMessage)> {
        if &meta.admin != from {
            return Err(RvChatError::Malformed {
                reason: format!("group invite for {} not sent by its admin", meta.id),
            });
        }

        let gc = meta.id;
        self.store.save(&meta)?;
        self.groups_lock()?.insert(gc, meta);

        Ok((
            *from,
            RoutedMessage::GroupJoin {
                gc,
                token,
                accept: true,
            },
        ))
    }

    /// Admin: handles a join answer. On accept, bumps the generation
    /// and returns the membership update to fan out to every member.
    pub fn handle_join(
        &self,
        from: &UserId,
        gc: &GcId,
        token: u64,
        accept: bool,
    ) -> Result<Vec<(UserId, RoutedMessage)>> {
        let invited = self.invites_lock()?.remove(&(*gc, token));
        if invited != Some(*from) {
            return Err(RvChatError::Malformed {
                reason: format!("join for {gc} with unknown or mismatched token"),
            });
        }
        if !accept {
            return Ok(Vec::new());
        }

        let mut meta = self.admin_meta(gc)?;
        if !meta.is_member(from) {
            meta.members.push(*from);
        }
        meta.generation += 1;

        self.store.save(&meta)?;
        self.groups_lock()?.insert(*gc, meta.clone());

        Ok(self.fan_out_list(&meta))
    }

    /// Admin: removes a member, bumps the generation, and returns the
    /// update fan-out.
    pub fn remove_member(&self, gc: &GcId, member: &UserId) -> Result<Vec<(UserId, RoutedMessage)>> {
        let mut meta = self.admin_meta(gc)?;
        if member == &meta.admin {
            return Err(RvChatError::Config {
                reason: "cannot remove the group admin".into(),
            });
        }
        let before = meta.members.len();
        meta.members.retain(|m| m != member);
        if meta.members.len() == before {
            return Err(RvChatError::UserNotFound {
                reason: format!("{member} is not a member of {gc}"),
            });
        }
        meta.generation += 1;

        self.store.save(&meta)?;
        self.groups_lock()?.insert(*gc, meta.clone());

        // The removed member also gets the update so it learns it is out.
        let mut sends = self.fan_out_list(&meta);
        sends.push((*member, RoutedMessage::GroupList { meta }));
        Ok(sends)
    }

    /// Member: handles an admin-authored metadata update.
    ///
    /// Returns the new generation when accepted, `None` when stale.
    pub fn handle_list(&self, from: &UserId, meta: GcMetadata) -> Result<Option<u64>> {
        if &meta.admin != from {
            return Err(RvChatError::Malformed {
                reason: format!("group update for {} not sent by its admin", meta.id),
            });
        }

        let mut groups = self.groups_lock()?;
        if let Some(current) = groups.get(&meta.id) {
            if current.admin != meta.admin {
                return Err(RvChatError::Malformed {
                    reason: format!("group {} update changes the admin", meta.id),
                });
            }
            if meta.generation <= current.generation {
                tracing::debug!(
                    gc = %meta.id,
                    incoming = meta.generation,
                    current = current.generation,
                    "dropping stale group update"
                );
                return Ok(None);
            }
        }

        let generation = meta.generation;
        self.store.save(&meta)?;
        groups.insert(meta.id, meta);
        Ok(Some(generation))
    }

    /// Gates an inbound group message against the generation rule.
    pub fn gate_message(&self, from: &UserId, gc: &GcId, generation: u64) -> GcVerdict {
        // A poisoned lock degrades to dropping the message; the panic
        // that poisoned it has already been reported at its boundary.
        let groups = match self.groups.lock() {
            Ok(groups) => groups,
            Err(e) => {
                return GcVerdict::Drop {
                    reason: format!("group state lock poisoned: {e}"),
                }
            }
        };
        let Some(meta) = groups.get(gc) else {
            return GcVerdict::Drop {
                reason: format!("message for unknown group {gc}"),
            };
        };

        // Generation first: a sender from a future generation may be a
        // member we have not learned about yet, so the membership check
        // is only meaningful at (or below) our own generation.
        if generation > meta.generation {
            return GcVerdict::NeedsUpdate {
                admin: meta.admin,
                request: RoutedMessage::GroupUpdateRequest {
                    gc: *gc,
                    generation: meta.generation,
                },
            };
        }

        if generation < meta.generation {
            return GcVerdict::Drop {
                reason: format!(
                    "stale generation {generation}, current {}",
                    meta.generation
                ),
            };
        }

        if !meta.is_member(from) {
            return GcVerdict::Drop {
                reason: format!("{from} is not a member of {gc}"),
            };
        }

        GcVerdict::Deliver
    }

    /// Admin: answers a metadata-fetch request from a lagging member.
    pub fn handle_update_request(&self, from: &UserId, gc: &GcId) -> Result<(UserId, RoutedMessage)> {
        let meta = self.admin_meta(gc)?;
        if !meta.is_member(from) {
            return Err(RvChatError::Malformed {
                reason: format!("update request from non-member {from}"),
            });
        }
        Ok((*from, RoutedMessage::GroupList { meta }))
    }

    /// Produces the per-member sends for one group message.
    pub fn fan_out_message(&self, gc: &GcId, msg: &str) -> Result<Vec<(UserId, RoutedMessage)>> {
        let groups = self.groups_lock()?;
        let meta = groups.get(gc).ok_or_else(|| RvChatError::UserNotFound {
            reason: format!("unknown group {gc}"),
        })?;
        if !meta.is_member(&self.local) {
            return Err(RvChatError::PolicyRejected {
                reason: format!("not a member of {gc}"),
            });
        }

        let timestamp_ms = Timestamp::now().millis();
        Ok(meta
            .members
            .iter()
            .filter(|m| **m != self.local)
            .map(|m| {
                (
                    *m,
                    RoutedMessage::GroupMessage {
                        gc: *gc,
                        generation: meta.generation,
                        msg: msg.to_string(),
                        timestamp_ms,
                    },
                )
            })
            .collect())
    }

    fn fan_out_list(&self, meta: &GcMetadata) -> Vec<(UserId, RoutedMessage)> {
        meta.members
            .iter()
            .filter(|m| **m != self.local)
            .map(|m| (*m, RoutedMessage::GroupList { meta: meta.clone() }))
            .collect()
    }

    fn admin_meta(&self, gc: &GcId) -> Result<GcMetadata> {
        let groups = self.groups_lock()?;
        let meta = groups.get(gc).ok_or_else(|| RvChatError::UserNotFound {
            reason: format!("unknown group {gc}"),
        })?;
        if meta.admin != self.local {
            return Err(RvChatError::PolicyRejected {
                reason: format!("not the admin of {gc}"),
            });
        }
        Ok(meta.clone())
    }

    fn groups_lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<GcId, GcMetadata>>> {
        self.groups.lock().map_err(|e| RvChatError::Storage {
            reason: format!("group state lock poisoned: {e}"),
        })
    }

    fn invites_lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(GcId, u64), UserId>>> {
        self.pending_invites.lock().map_err(|e| RvChatError::Storage {
            reason: format!("group invite lock poisoned: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(b: u8) -> UserId {
        UserId::new([b; 32])
    }

    fn controller(local: UserId) -> (tempfile::TempDir, GcController) {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = GcController::open(GcStore::new(dir.path(), 1), local).unwrap();
        (dir, ctrl)
    }

    /// Runs a full invite/join round between an admin and one invitee
    /// controller, returning the group ID.
    fn join(admin: &GcController, invitee: &GcController, gc: &GcId) -> GcId {
        let invitee_uid = invitee.local;
        let (target, invite) = admin.invite(gc, invitee_uid).unwrap();
        assert_eq!(target, invitee_uid);

        let RoutedMessage::GroupInvite { meta, token } = invite else {
            panic!("expected invite");
        };
        let (to_admin, answer) = invitee.handle_invite(&admin.local, meta, token).unwrap();
        assert_eq!(to_admin, admin.local);

        let RoutedMessage::GroupJoin { gc, token, accept } = answer else {
            panic!("expected join");
        };
        let fanout = admin.handle_join(&invitee_uid, &gc, token, accept).unwrap();
        // Deliver the membership update back to the invitee.
        for (to, rm) in fanout {
            if to == invitee_uid {
                let RoutedMessage::GroupList { meta } = rm else { panic!() };
                invitee.handle_list(&admin.local, meta).unwrap();
            }
        }
        gc
    }

    #[test]
    fn create_starts_at_generation_one() -> Result<()> {
        let (_d, admin) = controller(uid(1));
        let meta = admin.create("room")?;
        assert_eq!(meta.generation, 1);
        assert_eq!(meta.members, vec![uid(1)]);
        Ok(())
    }

    #[test]
    fn join_bumps_generation_and_fans_out() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let (_d2, member) = controller(uid(2));

        let meta = admin.create("room")?;
        join(&admin, &member, &meta.id);

        let current = admin.metadata(&meta.id).unwrap();
        assert_eq!(current.generation, 2);
        assert!(current.is_member(&uid(2)));
        assert_eq!(member.metadata(&meta.id).unwrap().generation, 2);
        Ok(())
    }

    #[test]
    fn generation_gate_accepts_only_current() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let (_d2, member) = controller(uid(2));

        let meta = admin.create("room")?;
        let gc = join(&admin, &member, &meta.id);

        // Current generation (2) delivers.
        assert!(matches!(
            member.gate_message(&uid(1), &gc, 2),
            GcVerdict::Deliver
        ));
        // Stale generation drops.
        assert!(matches!(
            member.gate_message(&uid(1), &gc, 1),
            GcVerdict::Drop { .. }
        ));
        // Future generation requests metadata from the admin.
        match member.gate_message(&uid(1), &gc, 3) {
            GcVerdict::NeedsUpdate { admin: a, request } => {
                assert_eq!(a, uid(1));
                assert!(matches!(request, RoutedMessage::GroupUpdateRequest { .. }));
            }
            other => panic!("expected NeedsUpdate, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn lagging_member_catches_up_via_update_request() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let (_d2, member) = controller(uid(2));
        let (_d3, late) = controller(uid(3));

        let meta = admin.create("room")?;
        let gc = join(&admin, &member, &meta.id);
        // `late` joins but never receives the generation-3 update.
        let gc2 = join(&admin, &late, &gc);
        assert_eq!(gc2, gc);
        assert_eq!(late.metadata(&gc).unwrap().generation, 3);

        // `member` is still at generation 2; a message at 3 triggers a
        // metadata fetch.
        let GcVerdict::NeedsUpdate { admin: a, .. } = member.gate_message(&uid(3), &gc, 3) else {
            panic!("expected NeedsUpdate");
        };
        let (_, list) = admin.handle_update_request(&uid(2), &gc)?;
        let RoutedMessage::GroupList { meta } = list else { panic!() };
        member.handle_list(&a, meta)?;

        // Resend at generation 3 now delivers.
        assert!(matches!(
            member.gate_message(&uid(3), &gc, 3),
            GcVerdict::Deliver
        ));
        Ok(())
    }

    #[test]
    fn non_member_sender_dropped() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let (_d2, member) = controller(uid(2));

        let meta = admin.create("room")?;
        let gc = join(&admin, &member, &meta.id);

        assert!(matches!(
            member.gate_message(&uid(9), &gc, 2),
            GcVerdict::Drop { .. }
        ));
        Ok(())
    }

    #[test]
    fn fan_out_excludes_self() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let (_d2, member) = controller(uid(2));

        let meta = admin.create("room")?;
        let gc = join(&admin, &member, &meta.id);

        let sends = admin.fan_out_message(&gc, "hello")?;
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, uid(2));
        Ok(())
    }

    #[test]
    fn stale_list_update_ignored() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let (_d2, member) = controller(uid(2));

        let meta = admin.create("room")?;
        let gc = join(&admin, &member, &meta.id);

        let mut stale = admin.metadata(&gc).unwrap();
        stale.generation = 1;
        assert_eq!(member.handle_list(&uid(1), stale)?, None);
        assert_eq!(member.metadata(&gc).unwrap().generation, 2);
        Ok(())
    }

    #[test]
    fn join_with_wrong_token_rejected() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let meta = admin.create("room")?;
        let (_, invite) = admin.invite(&meta.id, uid(2))?;
        let RoutedMessage::GroupInvite { token, .. } = invite else { panic!() };

        let result = admin.handle_join(&uid(2), &meta.id, token.wrapping_add(1), true);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn remove_member_bumps_generation() -> Result<()> {
        let (_d1, admin) = controller(uid(1));
        let (_d2, member) = controller(uid(2));

        let meta = admin.create("room")?;
        let gc = join(&admin, &member, &meta.id);

        let sends = admin.remove_member(&gc, &uid(2))?;
        let current = admin.metadata(&gc).unwrap();
        assert_eq!(current.generation, 3);
        assert!(!current.is_member(&uid(2)));
        // The removed member is still told about the update.
        assert!(sends.iter().any(|(to, _)| to == &uid(2)));
        Ok(())
    }
}
