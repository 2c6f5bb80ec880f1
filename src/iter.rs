// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping for open key iterators.
//!
//! An iterator is just a position in the RAM index plus an optional prefix.
//! Whenever the index gains or loses an entry, every open cursor is nudged so
//! that it neither skips nor repeats the keys that were already there.

use fnv::FnvHashMap;

/// Handle to an open iterator, returned by
/// [`Store::iterator_open`](crate::Store::iterator_open).
///
/// Handles are deliberately not `Clone`: closing consumes the handle.
#[derive(Debug, Eq, PartialEq, Hash)]
pub struct IterHandle(pub(crate) u32);

#[derive(Clone, Debug)]
pub struct Cursor {
    /// Index position of the next entry to look at.
    pub position: usize,
    pub prefix: Option<Vec<u8>>,
}

impl Cursor {
    pub fn accepts(&self, key: &[u8]) -> bool {
        self.prefix.as_deref().map_or(true, |p| key.starts_with(p))
    }
}

#[derive(Debug, Default)]
pub struct OpenIterators {
    cursors: FnvHashMap<u32, Cursor>,
    next_id: u32,
}

impl OpenIterators {
    pub fn open(&mut self, prefix: Option<&[u8]>) -> IterHandle {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.cursors.insert(id, Cursor {
            position: 0,
            prefix: prefix.map(<[u8]>::to_vec),
        });
        IterHandle(id)
    }

    pub fn get_mut(&mut self, handle: &IterHandle) -> Option<&mut Cursor> {
        self.cursors.get_mut(&handle.0)
    }

    pub fn close(&mut self, handle: IterHandle) -> bool {
        self.cursors.remove(&handle.0).is_some()
    }

    /// An entry was inserted at index position `pos`.
    pub fn index_inserted(&mut self, pos: usize) {
        for c in self.cursors.values_mut() {
            if c.position >= pos {
                c.position += 1;
            }
        }
    }

    /// The entry at index position `pos` was removed.
    pub fn index_removed(&mut self, pos: usize) {
        for c in self.cursors.values_mut() {
            if c.position > pos {
                c.position -= 1;
            }
        }
    }

    /// The index was rebuilt from scratch; start every cursor over.
    pub fn rewind_all(&mut self) {
        for c in self.cursors.values_mut() {
            c.position = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_follow_index_changes() {
        let mut iters = OpenIterators::default();
        let a = iters.open(None);
        let b = iters.open(Some(b"cfg"));

        iters.get_mut(&a).unwrap().position = 2;
        iters.get_mut(&b).unwrap().position = 5;

        // Insert ahead of both.
        iters.index_inserted(1);
        assert_eq!(iters.get_mut(&a).unwrap().position, 3);
        assert_eq!(iters.get_mut(&b).unwrap().position, 6);

        // Insert exactly at a's position: a hasn't seen it and won't.
        iters.index_inserted(3);
        assert_eq!(iters.get_mut(&a).unwrap().position, 4);

        // Remove the entry a just returned.
        iters.index_removed(3);
        assert_eq!(iters.get_mut(&a).unwrap().position, 3);
        // Removing at a's position leaves it in place.
        iters.index_removed(3);
        assert_eq!(iters.get_mut(&a).unwrap().position, 3);

        // b moved up twice and back down twice; an insert past it is ignored.
        iters.index_inserted(10);
        assert_eq!(iters.get_mut(&b).unwrap().position, 5);
    }

    #[test]
    fn prefix_filter() {
        let c = Cursor { position: 0, prefix: Some(b"cfg/".to_vec()) };
        assert!(c.accepts(b"cfg/net"));
        assert!(!c.accepts(b"cfg"));
        assert!(Cursor { position: 0, prefix: None }.accepts(b"anything"));
    }

    #[test]
    fn close_consumes_handle() {
        let mut iters = OpenIterators::default();
        let a = iters.open(None);
        let id = a.0;
        assert!(iters.close(a));
        assert!(iters.get_mut(&IterHandle(id)).is_none());
        assert!(!iters.close(IterHandle(id)));
    }
}
