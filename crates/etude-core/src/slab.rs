// src/slab.rs
use std::os::fd::RawFd;

/// Slot index plus the generation of the occupant it was issued for.
///
/// Packed into the 64-bit epoll token, so a late event or completion for a
/// previous occupant of the same slot is recognised and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub index: u32,
    pub generation: u32,
}

impl ConnId {
    #[inline(always)]
    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    #[inline(always)]
    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

enum SlotState<C> {
    Free { next: Option<usize> },
    /// The connection is here; only the loop thread may touch it.
    Resident { fd: RawFd, conn: Box<C> },
    /// A worker owns the connection; the slot must not be reused.
    InFlight { fd: RawFd },
}

struct Slot<C> {
    generation: u32,
    state: SlotState<C>,
}

/// Fixed-capacity connection table with an intrusive free list.
pub struct ConnectionSlab<C> {
    entries: Box<[Slot<C>]>,
    head_free: Option<usize>,
    active_count: usize,
}

impl<C> ConnectionSlab<C> {
    /// Allocate every slot once at startup.
    pub fn new(capacity: usize) -> Self {
        let entries: Vec<Slot<C>> = (0..capacity)
            .map(|i| Slot {
                generation: 0,
                state: SlotState::Free {
                    next: (i + 1 < capacity).then_some(i + 1),
                },
            })
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            head_free: (capacity > 0).then_some(0),
            active_count: 0,
        }
    }

    /// O(1) allocation. `None` when the table is full.
    pub fn allocate(&mut self, fd: RawFd, conn: Box<C>) -> Option<ConnId> {
        let idx = self.head_free?;
        let slot = &mut self.entries[idx];
        let SlotState::Free { next } = slot.state else {
            return None;
        };
        self.head_free = next;

        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Resident { fd, conn };
        self.active_count += 1;
        Some(ConnId {
            index: idx as u32,
            generation: slot.generation,
        })
    }

    #[inline(always)]
    fn slot(&self, id: ConnId) -> Option<&Slot<C>> {
        self.entries
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    #[inline(always)]
    fn slot_mut(&mut self, id: ConnId) -> Option<&mut Slot<C>> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    /// The resident connection, if `id` is current and not checked out.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut C> {
        match &mut self.slot_mut(id)?.state {
            SlotState::Resident { conn, .. } => Some(conn),
            _ => None,
        }
    }

    pub fn fd(&self, id: ConnId) -> Option<RawFd> {
        match self.slot(id)?.state {
            SlotState::Resident { fd, .. } | SlotState::InFlight { fd } => Some(fd),
            SlotState::Free { .. } => None,
        }
    }

    /// Moves the connection out for a worker. The slot stays reserved.
    pub fn check_out(&mut self, id: ConnId) -> Option<Box<C>> {
        let slot = self.slot_mut(id)?;
        let SlotState::Resident { fd, .. } = slot.state else {
            return None;
        };
        match std::mem::replace(&mut slot.state, SlotState::InFlight { fd }) {
            SlotState::Resident { conn, .. } => Some(conn),
            _ => None,
        }
    }

    /// Returns a connection from a worker. A stale or unexpected id hands the
    /// connection back to the caller untouched.
    pub fn check_in(&mut self, id: ConnId, conn: Box<C>) -> Result<(), Box<C>> {
        let Some(slot) = self.slot_mut(id) else {
            return Err(conn);
        };
        let SlotState::InFlight { fd } = slot.state else {
            return Err(conn);
        };
        slot.state = SlotState::Resident { fd, conn };
        Ok(())
    }

    /// Releases a resident slot back to the free list.
    ///
    /// In-flight slots are refused so a slot is never recycled under a worker.
    pub fn free(&mut self, id: ConnId) -> Option<(RawFd, Box<C>)> {
        let head = self.head_free;
        let slot = self.slot_mut(id)?;
        if !matches!(slot.state, SlotState::Resident { .. }) {
            return None;
        }
        let SlotState::Resident { fd, conn } =
            std::mem::replace(&mut slot.state, SlotState::Free { next: head })
        else {
            return None;
        };
        self.head_free = Some(id.index as usize);
        self.active_count -= 1;
        Some((fd, conn))
    }

    /// Drops every resident connection; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        for i in 0..self.entries.len() {
            let id = ConnId {
                index: i as u32,
                generation: self.entries[i].generation,
            };
            if self.free(id).is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.head_free.is_none()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab: ConnectionSlab<&'static str> = ConnectionSlab::new(10);

        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 10);

        let id1 = slab.allocate(100, Box::new("a")).unwrap();
        assert_eq!(id1.index, 0);
        assert_eq!(slab.fd(id1), Some(100));

        let id2 = slab.allocate(101, Box::new("b")).unwrap();
        assert_eq!(id2.index, 1);

        let (fd, conn) = slab.free(id1).unwrap();
        assert_eq!((fd, *conn), (100, "a"));
        assert_eq!(slab.len(), 1);

        // Index 0 is reused from the head of the free list, with a new generation.
        let id3 = slab.allocate(102, Box::new("c")).unwrap();
        assert_eq!(id3.index, 0);
        assert_ne!(id3.generation, id1.generation);
        assert!(slab.get_mut(id1).is_none());
        assert_eq!(slab.get_mut(id3).map(|c| *c), Some("c"));
    }

    #[test]
    fn test_token_round_trip() {
        let id = ConnId { index: 7, generation: 3 };
        assert_eq!(ConnId::from_token(id.token()), id);
    }

    #[test]
    fn test_in_flight_slot_is_not_recycled() {
        let mut slab: ConnectionSlab<u32> = ConnectionSlab::new(1);
        let id = slab.allocate(5, Box::new(1)).unwrap();

        let conn = slab.check_out(id).unwrap();
        assert!(slab.get_mut(id).is_none());
        assert_eq!(slab.fd(id), Some(5));
        assert!(slab.free(id).is_none());
        assert!(slab.allocate(6, Box::new(2)).is_none());

        slab.check_in(id, conn).unwrap();
        assert_eq!(slab.get_mut(id).map(|c| *c), Some(1));
        assert!(slab.free(id).is_some());
        assert!(slab.allocate(6, Box::new(2)).is_some());
    }

    #[test]
    fn test_stale_check_in_is_rejected() {
        let mut slab: ConnectionSlab<u32> = ConnectionSlab::new(2);
        let id = slab.allocate(5, Box::new(1)).unwrap();
        let stale = ConnId { generation: id.generation.wrapping_sub(1), ..id };
        assert!(slab.check_out(stale).is_none());

        let conn = slab.check_out(id).unwrap();
        let err = slab.check_in(stale, conn).unwrap_err();
        assert_eq!(*err, 1);
        // Not checked out, so checking in again is refused too.
        let other = slab.allocate(9, Box::new(2)).unwrap();
        assert!(slab.check_in(other, Box::new(3)).is_err());
    }

    #[test]
    fn test_clear_drops_residents() {
        let mut slab: ConnectionSlab<u32> = ConnectionSlab::new(4);
        for fd in 0..3 {
            slab.allocate(fd, Box::new(fd as u32)).unwrap();
        }
        assert_eq!(slab.clear(), 3);
        assert!(slab.is_empty());
        assert!(!slab.is_full());
    }
}
