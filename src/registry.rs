use crate::errors::*;
use std::collections::hash_map::{Drain, Entry, HashMap};

/// Slot table mapping channel ids to their entries. Channel 0 is reserved
/// for connection-level traffic and never appears here.
pub(crate) struct ChannelRegistry<T> {
    slots: HashMap<u16, T>,
    channel_max: u16,
    // Lowest id that might be free; every id below it was occupied when the
    // cursor moved past it, and removals pull it back down. Keeps sequential
    // allocation from rescanning the full range while preserving
    // first-unused-id semantics.
    search_from: u32,
}

impl<T> ChannelRegistry<T> {
    pub(crate) fn new() -> ChannelRegistry<T> {
        ChannelRegistry {
            slots: HashMap::new(),
            channel_max: u16::max_value(),
            search_from: 1,
        }
    }

    pub(crate) fn set_channel_max(&mut self, channel_max: u16) {
        assert!(
            self.slots.is_empty(),
            "channel_max should not be set after channels have been registered"
        );
        self.channel_max = channel_max;
    }

    pub(crate) fn get_mut(&mut self, channel_id: u16) -> Option<&mut T> {
        self.slots.get_mut(&channel_id)
    }

    pub(crate) fn drain(&mut self) -> Drain<'_, u16, T> {
        self.search_from = 1;
        self.slots.drain()
    }

    /// Bind an entry to `channel_id`, or to the first unused id when no
    /// explicit id is requested. `make_entry` produces the entry once the id
    /// is known.
    pub(crate) fn insert<F, U>(&mut self, channel_id: Option<u16>, make_entry: F) -> Result<U>
    where
        F: FnOnce(u16) -> Result<(T, U)>,
    {
        let channel_id = match channel_id {
            Some(id) => id,
            None => return self.insert_unused_channel_id(make_entry),
        };
        if channel_id == 0 || channel_id > self.channel_max {
            return UnavailableChannelIdSnafu { channel_id }.fail();
        }
        match self.slots.entry(channel_id) {
            Entry::Occupied(_) => UnavailableChannelIdSnafu { channel_id }.fail(),
            Entry::Vacant(entry) => {
                let (t, u) = make_entry(channel_id)?;
                entry.insert(t);
                Ok(u)
            }
        }
    }

    pub(crate) fn remove(&mut self, channel_id: u16) -> Option<T> {
        let entry = self.slots.remove(&channel_id)?;
        if u32::from(channel_id) < self.search_from {
            self.search_from = u32::from(channel_id);
        }
        Some(entry)
    }

    fn insert_unused_channel_id<F, U>(&mut self, make_entry: F) -> Result<U>
    where
        F: FnOnce(u16) -> Result<(T, U)>,
    {
        let mut candidate = self.search_from;
        while candidate <= u32::from(self.channel_max) {
            let channel_id = candidate as u16;
            candidate += 1;
            match self.slots.entry(channel_id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    let (t, u) = make_entry(channel_id)?;
                    entry.insert(t);
                    self.search_from = candidate;
                    return Ok(u);
                }
            }
        }
        self.search_from = candidate;
        ExhaustedChannelIdsSnafu.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id<T>(x: T) -> Result<(T, ())> {
        Ok((x, ()))
    }

    fn with_channel_max(channel_max: u16) -> ChannelRegistry<u16> {
        let mut registry = ChannelRegistry::new();
        registry.set_channel_max(channel_max);
        registry
    }

    #[test]
    #[should_panic]
    fn set_channel_max_after_insert_panics() {
        let mut registry = with_channel_max(4);
        if registry.insert(Some(1), id).is_err() {
            return;
        }
        registry.set_channel_max(4);
    }

    #[test]
    fn insert_channel_above_max_fails() {
        let mut registry = with_channel_max(4);
        let res = registry.insert(Some(5), id);
        match res.unwrap_err() {
            Error::UnavailableChannelId { channel_id } if channel_id == 5 => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn insert_channel_zero_fails() {
        let mut registry = with_channel_max(4);
        match registry.insert(Some(0), id).unwrap_err() {
            Error::UnavailableChannelId { channel_id } if channel_id == 0 => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn insert_taken_id_fails_and_preserves_entry() {
        let mut registry = with_channel_max(4);
        registry.insert(Some(1), id).unwrap();
        let res = registry.insert(Some(1), |_| Ok((99, ())));
        match res.unwrap_err() {
            Error::UnavailableChannelId { channel_id } if channel_id == 1 => (),
            err => panic!("unexpected error {}", err),
        }
        assert_eq!(registry.get_mut(1), Some(&mut 1));
    }

    #[test]
    fn insert_scans_for_first_unused_id() {
        let mut registry = with_channel_max(8);
        registry.insert(Some(1), id).unwrap();
        registry.insert(Some(3), id).unwrap();

        // should pick 2, the lowest unused id
        registry.insert(None, id).unwrap();
        assert!(registry.get_mut(2).is_some());

        // then 4
        registry.insert(None, id).unwrap();
        assert!(registry.get_mut(4).is_some());
    }

    #[test]
    fn insert_reuses_lowest_freed_id() {
        let mut registry = with_channel_max(4);
        for i in 1..=4 {
            registry.insert(Some(i), id).unwrap();
        }
        assert!(registry.remove(3).is_some());
        assert!(registry.remove(2).is_some());

        registry.insert(None, id).unwrap();
        assert!(registry.get_mut(2).is_some());
        registry.insert(None, id).unwrap();
        assert!(registry.get_mut(3).is_some());
    }

    #[test]
    fn insert_fails_if_all_available_ids_taken() {
        let mut registry = with_channel_max(4);
        for i in 1..=4 {
            registry.insert(Some(i), id).unwrap();
        }
        match registry.insert(None, id).unwrap_err() {
            Error::ExhaustedChannelIds => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn full_id_space_then_exhaustion() {
        let mut registry = ChannelRegistry::new();
        for _ in 1..=u32::from(u16::max_value()) {
            registry.insert(None, id).unwrap();
        }
        match registry.insert(None, id).unwrap_err() {
            Error::ExhaustedChannelIds => (),
            err => panic!("unexpected error {}", err),
        }
    }
}
