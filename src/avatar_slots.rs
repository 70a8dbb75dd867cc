use crate::models::{AvatarSlot, Reservation, DEFAULT_AUDIO_DURATION_SECS, SLOT_RELEASE_SAFETY_BUFFER_SECS};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Static slot table plus the live reservation table. `find_slot` and `reserve`
/// are exposed separately but the orchestrator must always call them under the
/// same lock acquisition (see `find_and_reserve`) to avoid a find/reserve TOCTOU
/// that would otherwise permit double-booking a slot.
pub struct AvatarSlotManager {
    inner: Mutex<Inner>,
    generation_id: AtomicU64,
}

struct Inner {
    slots: Vec<AvatarSlot>,
    reservations: HashMap<u64, Reservation>,
}

pub struct ReservedSlot {
    pub slot: AvatarSlot,
}

impl AvatarSlotManager {
    pub fn new(slots: Vec<AvatarSlot>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots,
                reservations: HashMap::new(),
            }),
            generation_id: AtomicU64::new(1),
        }
    }

    /// Rebuilds the slot table (e.g. on a config update) and bumps the generation
    /// id so clients discard stale slot references.
    pub fn rebuild(&self, slots: Vec<AvatarSlot>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.slots = slots;
        inner.reservations.clear();
        self.generation_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn generation_id(&self) -> u64 {
        self.generation_id.load(Ordering::SeqCst)
    }

    pub fn slots_snapshot(&self) -> Vec<AvatarSlot> {
        self.inner.lock().unwrap().slots.clone()
    }

    pub fn occupied_count(&self) -> usize {
        self.inner.lock().unwrap().reservations.len()
    }

    /// Finds a free slot for `voice_id` (preference order per §4.6) and reserves it
    /// in one atomic section, then arms the release machinery via the returned
    /// reservation details. Returns `None` if no slot is free.
    pub fn find_and_reserve(
        &self,
        voice_id: Option<&str>,
        enabled_voice_ids: &[String],
        user: &str,
        audio_url: &str,
        duration_secs: Option<f32>,
    ) -> Option<ReservedSlot> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep_expired_locked(&mut inner);

        let slot = Self::choose_slot(&inner.slots, &inner.reservations, voice_id, enabled_voice_ids)?;
        let slot_id = slot.slot_id;
        let reservation = Reservation {
            slot_id,
            user: user.to_string(),
            start_wall_time: Instant::now(),
            audio_duration_secs: duration_secs.unwrap_or(DEFAULT_AUDIO_DURATION_SECS),
            audio_url: audio_url.to_string(),
        };
        inner.reservations.insert(slot_id, reservation);
        Some(ReservedSlot { slot })
    }

    fn choose_slot(
        slots: &[AvatarSlot],
        reservations: &HashMap<u64, Reservation>,
        voice_id: Option<&str>,
        enabled_voice_ids: &[String],
    ) -> Option<AvatarSlot> {
        let free: Vec<&AvatarSlot> = slots.iter().filter(|s| !reservations.contains_key(&s.slot_id)).collect();
        if free.is_empty() {
            return None;
        }

        if let Some(voice_id) = voice_id {
            let exact: Vec<&&AvatarSlot> = free
                .iter()
                .filter(|s| s.bound_voice_id.as_deref() == Some(voice_id))
                .collect();
            if let Some(chosen) = exact.choose(&mut rand::thread_rng()) {
                return Some((***chosen).clone());
            }

            let unbound: Vec<&&AvatarSlot> = free.iter().filter(|s| s.bound_voice_id.is_none()).collect();
            if let Some(chosen) = unbound.choose(&mut rand::thread_rng()) {
                return Some((***chosen).clone());
            }

            let orphaned: Vec<&&AvatarSlot> = free
                .iter()
                .filter(|s| {
                    s.bound_voice_id
                        .as_ref()
                        .map(|bound| !enabled_voice_ids.iter().any(|v| v == bound))
                        .unwrap_or(false)
                })
                .collect();
            if let Some(chosen) = orphaned.choose(&mut rand::thread_rng()) {
                return Some((***chosen).clone());
            }
            None
        } else {
            free.choose(&mut rand::thread_rng()).map(|s| (**s).clone())
        }
    }

    /// Releases a slot: cancels any pending timer (the caller is responsible for
    /// aborting the associated task handle), removes the reservation, and signals
    /// the caller to drain queues.
    pub fn release(&self, slot_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.reservations.remove(&slot_id).is_some()
    }

    fn sweep_expired_locked(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<u64> = inner
            .reservations
            .iter()
            .filter(|(_, r)| {
                let expiry = r.audio_duration_secs + SLOT_RELEASE_SAFETY_BUFFER_SECS;
                now.duration_since(r.start_wall_time).as_secs_f32() > expiry
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            log::info!("sweeping expired avatar slot reservation {}", id);
            inner.reservations.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: u64, bound: Option<&str>) -> AvatarSlot {
        AvatarSlot {
            slot_id: id,
            ordinal_index: id as usize,
            x_position: 0.0,
            y_position: 0.0,
            size: 1.0,
            bound_voice_id: bound.map(|s| s.to_string()),
        }
    }

    #[test]
    fn prefers_exact_voice_bound_slot() {
        let mgr = AvatarSlotManager::new(vec![slot(1, None), slot(2, Some("v1"))]);
        let reserved = mgr
            .find_and_reserve(Some("v1"), &["v1".to_string()], "alice", "url", Some(1.0))
            .unwrap();
        assert_eq!(reserved.slot.slot_id, 2);
    }

    #[test]
    fn falls_back_to_unbound_slot() {
        let mgr = AvatarSlotManager::new(vec![slot(1, None), slot(2, Some("v2"))]);
        let reserved = mgr
            .find_and_reserve(Some("v1"), &["v1".to_string(), "v2".to_string()], "alice", "url", Some(1.0))
            .unwrap();
        assert_eq!(reserved.slot.slot_id, 1);
    }

    #[test]
    fn orphaned_voice_binding_is_treated_as_random() {
        let mgr = AvatarSlotManager::new(vec![slot(1, Some("deleted-voice"))]);
        let reserved = mgr
            .find_and_reserve(Some("v1"), &["v1".to_string()], "alice", "url", Some(1.0))
            .unwrap();
        assert_eq!(reserved.slot.slot_id, 1);
    }

    #[test]
    fn no_slot_available_when_all_occupied() {
        let mgr = AvatarSlotManager::new(vec![slot(1, None)]);
        mgr.find_and_reserve(Some("v1"), &["v1".to_string()], "alice", "url", Some(1.0)).unwrap();
        assert!(mgr
            .find_and_reserve(Some("v1"), &["v1".to_string()], "bob", "url2", Some(1.0))
            .is_none());
    }

    #[test]
    fn reserve_release_reserve_round_trips() {
        let mgr = AvatarSlotManager::new(vec![slot(1, None)]);
        let first = mgr.find_and_reserve(None, &[], "alice", "url", Some(1.0)).unwrap();
        assert!(mgr.release(first.slot.slot_id));
        let second = mgr.find_and_reserve(None, &[], "bob", "url2", Some(1.0));
        assert!(second.is_some());
    }

    #[test]
    fn unbound_tier_selection_is_not_always_the_first_slot() {
        let mgr = AvatarSlotManager::new(vec![slot(1, None), slot(2, None), slot(3, None)]);
        let mut seen_other_than_first = false;
        for i in 0..50 {
            mgr.rebuild(vec![slot(1, None), slot(2, None), slot(3, None)]);
            let reserved = mgr
                .find_and_reserve(Some("v1"), &["v1".to_string()], &format!("user{i}"), "url", Some(0.0))
                .unwrap();
            if reserved.slot.slot_id != 1 {
                seen_other_than_first = true;
                break;
            }
        }
        assert!(seen_other_than_first, "expected random selection to eventually pick a non-first slot");
    }

    #[test]
    fn rebuild_bumps_generation_id() {
        let mgr = AvatarSlotManager::new(vec![slot(1, None)]);
        let before = mgr.generation_id();
        mgr.rebuild(vec![slot(1, None)]);
        assert!(mgr.generation_id() > before);
    }
}
