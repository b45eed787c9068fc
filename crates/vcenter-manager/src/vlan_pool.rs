//! VLAN id allocator.

use std::collections::BTreeSet;
use tracing::debug;
use vcm_common::{VcmError, VcmResult};
use vcm_types::VlanId;

/// Fixed-range pool of VLAN override ids.
///
/// Only ids inside `[start, end]` are tracked; reserving or freeing an id
/// outside the range is a no-op. All operations run under the manager's
/// single lock, so no interior synchronization is needed.
#[derive(Debug, Clone)]
pub struct VlanIdPool {
    start: VlanId,
    end: VlanId,
    available: BTreeSet<u16>,
}

impl VlanIdPool {
    /// Creates a pool with every id in `[start, end]` free.
    pub fn new(start: VlanId, end: VlanId) -> Self {
        let available = (start.as_u16()..=end.as_u16()).collect();
        Self {
            start,
            end,
            available,
        }
    }

    fn contains(&self, id: VlanId) -> bool {
        id >= self.start && id <= self.end
    }

    /// Marks an id as in use. Idempotent.
    pub fn reserve(&mut self, id: VlanId) {
        if self.available.remove(&id.as_u16()) {
            debug!(vlan = %id, "reserved VLAN id");
        }
    }

    /// Returns an id to the pool. Idempotent.
    pub fn free(&mut self, id: VlanId) {
        if self.contains(id) && self.available.insert(id.as_u16()) {
            debug!(vlan = %id, "freed VLAN id");
        }
    }

    /// Returns true if the id is in range and not reserved.
    pub fn is_available(&self, id: VlanId) -> bool {
        self.available.contains(&id.as_u16())
    }

    /// Reserves and returns the lowest free id.
    pub fn get_available(&mut self) -> VcmResult<VlanId> {
        let id = self
            .available
            .pop_first()
            .ok_or(VcmError::VlanPoolExhausted {
                start: self.start.as_u16(),
                end: self.end.as_u16(),
            })?;
        let id = VlanId::new(id).map_err(|e| VcmError::internal(e.to_string()))?;
        debug!(vlan = %id, "allocated VLAN id");
        Ok(id)
    }

    /// Number of reserved ids.
    pub fn reserved_count(&self) -> usize {
        let size = (usize::from(self.end.as_u16()) + 1).saturating_sub(usize::from(self.start.as_u16()));
        size.saturating_sub(self.available.len())
    }

    /// The pool's closed range.
    pub fn range(&self) -> (VlanId, VlanId) {
        (self.start, self.end)
    }
}

impl Default for VlanIdPool {
    /// Covers every assignable tag.
    fn default() -> Self {
        Self::new(VlanId::FIRST, VlanId::LAST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    #[test]
    fn test_get_available_returns_lowest() {
        let mut pool = VlanIdPool::default();
        pool.reserve(vlan(0));
        pool.reserve(vlan(1));

        assert_eq!(pool.get_available().unwrap(), vlan(2));
        assert!(!pool.is_available(vlan(2)));
        assert_eq!(pool.get_available().unwrap(), vlan(3));
    }

    #[test]
    fn test_reserve_and_free_are_idempotent() {
        let mut pool = VlanIdPool::new(vlan(10), vlan(20));
        pool.reserve(vlan(12));
        pool.reserve(vlan(12));
        assert_eq!(pool.reserved_count(), 1);

        pool.free(vlan(12));
        pool.free(vlan(12));
        assert_eq!(pool.reserved_count(), 0);
        assert!(pool.is_available(vlan(12)));
    }

    #[test]
    fn test_out_of_range_ids_are_ignored() {
        let mut pool = VlanIdPool::new(vlan(10), vlan(20));
        pool.free(vlan(5));
        assert!(!pool.is_available(vlan(5)));
        pool.reserve(vlan(30));
        assert_eq!(pool.reserved_count(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = VlanIdPool::new(vlan(1), vlan(3));
        for id in 1..=3 {
            pool.reserve(vlan(id));
        }

        let err = pool.get_available().unwrap_err();
        assert!(matches!(err, VcmError::VlanPoolExhausted { start: 1, end: 3 }));

        pool.free(vlan(2));
        assert_eq!(pool.get_available().unwrap(), vlan(2));
    }

    #[test]
    fn test_is_available_tracks_reservations() {
        let mut pool = VlanIdPool::new(vlan(0), vlan(63));
        let ops: [(bool, u16); 8] = [
            (true, 5),
            (true, 9),
            (false, 5),
            (true, 5),
            (true, 63),
            (false, 9),
            (false, 9),
            (true, 0),
        ];
        let mut reserved = BTreeSet::new();
        for (reserve, id) in ops {
            if reserve {
                pool.reserve(vlan(id));
                reserved.insert(id);
            } else {
                pool.free(vlan(id));
                reserved.remove(&id);
            }
            for probe in 0..=63 {
                assert_eq!(pool.is_available(vlan(probe)), !reserved.contains(&probe));
            }
        }
        assert_eq!(pool.reserved_count(), reserved.len());

        let next = pool.get_available().unwrap();
        assert!(!reserved.contains(&next.as_u16()));
    }
}
