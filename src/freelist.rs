//! Allocation and deallocation inside a single [`Region`](crate::region::Region).
//!
//! Free blocks of a region are kept in its free ring (see [`crate::ring`]).
//! We don't need any storage for that bookkeeping: the ring links live in
//! the headers of the free blocks themselves.
//!
//! ```text
//!                       ring-head
//!                          |
//!                          v
//! +--------+------+-------------+-------+-------------+-------+
//! | Region | used | free (high) | used  | free (low)  | used  |   <- addresses grow ->
//! +--------+------+-------------+-------+-------------+-------+
//!                    |   ^                 |   ^
//!                    +---|-----------------+   |     next: down in memory,
//!                        +---------------------+     wrapping at the bottom
//! ```

use log::trace;

use crate::{
    block::{BlockRef, CELL_SHIFT, Tag},
    config::HeapConfig,
    error::{HeapError, Result},
    region::RegionRef,
    ring::{self, Link, Walk},
};

impl RegionRef {
    /// Takes a block of `n` cells whose content is aligned to `align` cells
    /// out of this region's free ring. Returns `None` when no member is big
    /// enough.
    ///
    /// The allocation is placed as high as alignment allows inside the first
    /// member that fits, which leaves one of four shapes:
    ///
    /// ```text
    ///  extra  leftover
    ///    0       0      [ alloc ]                    member leaves the ring
    ///   >0       0      [ free | alloc ]             member shrinks in place
    ///    0      >0      [ alloc | free ]             new member replaces it
    ///   >0      >0      [ free | alloc | free ]      new member spliced before it
    /// ```
    pub(crate) fn carve(self, n: usize, align: usize, config: &HeapConfig) -> Result<Option<BlockRef>> {
        debug_assert!(n > 0 && align.is_power_of_two());

        // A full region keeps its last allocated block as ring-head.
        if self.is_full() {
            return Ok(None);
        }

        let first = self.first();

        for link in Walk::new(first) {
            let Link { prev: mut q, block: p } = link?;

            let misalign = (p.body().as_ptr() as usize >> CELL_SHIFT) & (align - 1);
            let mut extra = if misalign == 0 { 0 } else { align - misalign };

            let Some(need) = n.checked_add(extra) else {
                continue;
            };
            if p.size() < need {
                continue;
            }

            // Push the allocation to the highest aligned spot in `p`.
            extra += (p.size() - need) & !(align - 1);
            let leftover = p.size() - extra - n;

            let block = match (extra, leftover) {
                (0, 0) => {
                    ring::unlink_after(q);
                    p
                }
                (_, 0) => {
                    p.set_size(extra);
                    p.add(extra)
                }
                (0, _) => {
                    let rest = p.add(n);
                    rest.init(Tag::Free, leftover, p.next());
                    q.set_next(rest);
                    if q == p {
                        q = rest;
                        rest.set_next(rest);
                    }
                    p
                }
                (_, _) => {
                    let rest = p.add(extra + n);
                    rest.init(Tag::Free, leftover, p);
                    p.set_size(extra);
                    q.set_next(rest);
                    p.add(extra)
                }
            };

            block.init(Tag::Allocated, n, block);

            trace!(
                "carved {block:?} ({n} cells, extra {extra}, leftover {leftover}) from {p:?}"
            );

            // Start the next search right before this spot. This fragments the
            // low end of the region a little, so only do it for small requests.
            if (n << CELL_SHIFT) < config.small_alloc_threshold || first == p {
                self.set_first(q);
            }

            return Ok(Some(block));
        }

        Ok(None)
    }

    /// Puts an allocated `block` of this region back into the free ring and
    /// merges it with the free blocks directly above and below it.
    pub(crate) fn reinsert(self, block: BlockRef) -> Result<()> {
        if self.is_full() {
            block.init(Tag::Free, block.size(), block);
            self.set_first(block);
            trace!("{block:?} restarts the ring of {:#x}", self.record());
            return Ok(());
        }

        let (q, before) = self.insertion_point(block)?;

        block.set_tag(Tag::Free);
        ring::insert_after(q, block);

        // `block` now sits between `q` (next free block above it, unless `q`
        // is the lowest member) and `block.next()` (next free block below).
        let mut p = block;
        let mut pred_p = q;

        if p.end() == q.addr() {
            let pred_q = match before {
                Some(before) => before,
                None => predecessor(q)?,
            };

            p.set_size(p.size() + q.size());
            q.set_tag(Tag::Inert);
            pred_q.set_next(q.next());
            pred_p = pred_q;

            trace!("{p:?} absorbed {q:?}");
        }

        let lower = p.next();
        if lower != p && lower.end() == p.addr() {
            lower.set_size(lower.size() + p.size());
            p.set_tag(Tag::Inert);
            pred_p.set_next(lower);

            trace!("{lower:?} absorbed {p:?}");
            p = lower;
        }

        // The next search starts at the block just freed.
        self.set_first(pred_p);

        Ok(())
    }

    /// Member after which `block` keeps the ring in descending order, along
    /// with that member's own predecessor when the walk saw it.
    fn insertion_point(self, block: BlockRef) -> Result<(BlockRef, Option<BlockRef>)> {
        let mut before = None;

        for link in Walk::new(self.first()) {
            let Link { prev: q, block: below } = link?;

            let between = q > block && block > below;
            let wraps = q <= below && (block < q || block > below);

            if between || wraps {
                return Ok((q, before));
            }

            before = Some(q);
        }

        Err(HeapError::BrokenRing(self.record()))
    }

    /// Free blocks of this region, starting after the ring-head.
    pub(crate) fn free_blocks(self) -> impl Iterator<Item = Result<BlockRef>> {
        let walk = (!self.is_full()).then(|| Walk::new(self.first()));

        walk.into_iter()
            .flatten()
            .map(|link| link.map(|link| link.block))
    }
}

/// Member whose `next` is `of`.
fn predecessor(of: BlockRef) -> Result<BlockRef> {
    for link in Walk::new(of) {
        let link = link?;
        if link.block == of {
            return Ok(link.prev);
        }
    }

    Err(HeapError::BrokenRing(of.addr()))
}
