//! Free ring primitives.
//!
//! The free blocks of a region form a circular, singly linked list ordered by
//! descending address: following `next` goes down in memory until it wraps
//! from the lowest block back to the highest one.
//!
//! ```text
//!        +--------------------------------------------------+
//!        v                                                  |
//! +-------------+      +-------------+      +-------------+ |
//! | free @ 0x9000| ---> | free @ 0x5000| ---> | free @ 0x1000| +
//! +-------------+      +-------------+      +-------------+
//! ```
//!
//! Like the rest of the heap, this module never allocates: nodes are the free
//! blocks themselves.

use crate::{
    block::{BlockRef, Tag},
    error::{HeapError, Result},
};

/// One step of a ring walk: `block` and the member pointing at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub prev: BlockRef,
    pub block: BlockRef,
}

/// Walks the ring once, starting just past `head` and ending with `head`
/// itself. Each visited member is checked for the free tag; the walk stops
/// at the first broken member and yields the error.
pub(crate) struct Walk {
    head: BlockRef,
    prev: BlockRef,
    /// Times the walk went up in memory. A sound ring wraps once per lap.
    wraps: usize,
    done: bool,
}

impl Walk {
    pub fn new(head: BlockRef) -> Self {
        Self {
            head,
            prev: head,
            wraps: 0,
            done: false,
        }
    }
}

impl Iterator for Walk {
    type Item = Result<Link>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // The head is only behind `prev` before the first step.
        if self.prev == self.head && !self.head.is(Tag::Free) {
            self.done = true;
            return Some(Err(HeapError::BrokenFreeMagic {
                addr: self.head.addr(),
                magic: self.head.magic(),
            }));
        }

        if !self.prev.has_next() {
            self.done = true;
            return Some(Err(HeapError::BrokenRing(self.prev.addr())));
        }

        let block = self.prev.next();

        if !block.is(Tag::Free) {
            self.done = true;
            return Some(Err(HeapError::BrokenFreeMagic {
                addr: block.addr(),
                magic: block.magic(),
            }));
        }

        if block.addr() >= self.prev.addr() {
            self.wraps += 1;
            if self.wraps > 1 {
                self.done = true;
                return Some(Err(HeapError::BrokenRing(self.head.addr())));
            }
        }

        let link = Link {
            prev: self.prev,
            block,
        };

        self.prev = block;
        self.done = block == self.head;

        Some(Ok(link))
    }
}

/// Makes `block` the member right after `at`.
#[inline]
pub(crate) fn insert_after(at: BlockRef, block: BlockRef) {
    block.set_next(at.next());
    at.set_next(block);
}

/// Removes the member right after `prev` from the ring.
#[inline]
pub(crate) fn unlink_after(prev: BlockRef) {
    prev.set_next(prev.next().next());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CELL;

    #[repr(C, align(64))]
    struct Cells([u8; 16 * CELL]);

    fn base(cells: &mut Cells) -> usize {
        cells.0.as_mut_ptr() as usize
    }

    #[test]
    fn single_member_ring_yields_itself_once() {
        let mut mem = Cells([0; 16 * CELL]);
        let only = unsafe { BlockRef::at(base(&mut mem)) };
        only.init(Tag::Free, 16, only);

        let links: Vec<_> = Walk::new(only).collect::<Result<_>>().unwrap();

        assert_eq!(links, vec![Link { prev: only, block: only }]);
    }

    #[test]
    fn walk_goes_down_and_wraps() {
        let mut mem = Cells([0; 16 * CELL]);
        let start = base(&mut mem);
        let (low, mid, high) = unsafe {
            (
                BlockRef::at(start),
                BlockRef::at(start + 4 * CELL),
                BlockRef::at(start + 8 * CELL),
            )
        };
        high.init(Tag::Free, 2, mid);
        mid.init(Tag::Free, 2, low);
        low.init(Tag::Free, 2, high);

        let visited: Vec<_> = Walk::new(low)
            .map(|link| link.unwrap().block)
            .collect();

        assert_eq!(visited, vec![high, mid, low]);
    }

    #[test]
    fn broken_member_stops_the_walk() {
        let mut mem = Cells([0; 16 * CELL]);
        let start = base(&mut mem);
        let (low, high) = unsafe { (BlockRef::at(start), BlockRef::at(start + 8 * CELL)) };
        high.init(Tag::Allocated, 2, low);
        low.init(Tag::Free, 2, high);

        let mut walk = Walk::new(low);

        assert_eq!(
            walk.next(),
            Some(Err(HeapError::BrokenFreeMagic {
                addr: high.addr(),
                magic: crate::block::ALLOC_MAGIC
            }))
        );
        assert_eq!(walk.next(), None);
    }

    #[test]
    fn trampled_head_is_not_followed() {
        let mut mem = Cells([0; 16 * CELL]);
        let head = unsafe { BlockRef::at(base(&mut mem)) };
        head.init(Tag::Inert, 16, head);

        let result: Result<Vec<_>> = Walk::new(head).collect();

        assert_eq!(
            result,
            Err(HeapError::BrokenFreeMagic {
                addr: head.addr(),
                magic: 0
            })
        );
    }

    #[test]
    fn cycle_that_skips_the_head_is_detected() {
        let mut mem = Cells([0; 16 * CELL]);
        let start = base(&mut mem);
        let (a, b, c) = unsafe {
            (
                BlockRef::at(start),
                BlockRef::at(start + 4 * CELL),
                BlockRef::at(start + 8 * CELL),
            )
        };
        // `a` points into a two member loop that never comes back to it.
        a.init(Tag::Free, 2, c);
        c.init(Tag::Free, 2, b);
        b.init(Tag::Free, 2, c);

        let result: Result<Vec<_>> = Walk::new(a).collect();

        assert_eq!(result, Err(HeapError::BrokenRing(a.addr())));
    }

    #[test]
    fn splice_and_unlink() {
        let mut mem = Cells([0; 16 * CELL]);
        let start = base(&mut mem);
        let (low, high) = unsafe { (BlockRef::at(start), BlockRef::at(start + 8 * CELL)) };
        low.init(Tag::Free, 2, low);

        insert_after(low, high);
        high.set_tag(Tag::Free);
        assert_eq!(low.next(), high);
        assert_eq!(high.next(), low);

        unlink_after(low);
        assert_eq!(low.next(), low);
    }
}
