/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * The sorted bins: a size-ordered skip list of free blocks >= 72 bytes.
 *
 * Equal-size blocks aren't separate skip-list nodes, only the first one
 * seen for a given size (the "chain head") carries index pointers; later
 * arrivals hang off it through a doubly linked pred/succ chain. This
 * keeps index maintenance to one node per distinct size, no matter how
 * many same-size blocks are free at once.
 *
 * Every pointer here is a signed byte offset relative to the node that
 * stores it (see block::offset_between), so splicing a node in or out
 * means recomputing a handful of offsets, not touching absolute
 * addresses.
 */

use crate::block;
use crate::pool::{Pool, SENTINEL};
use crate::rng::RandomSource;

const LEVELS: usize = block::SKIP_LIST_LEVELS;

impl<'a, R: RandomSource> Pool<'a, R> {
    /* Walks level lvl from start while the next node's size is below
     * size, returning the infimum, the last node visited whose size is
     * still < size. If that infimum is an exact match with a chained
     * duplicate, the duplicate is returned instead, since duplicates
     * never carry their own indices and are safe to hand to a caller
     * about to mutate or remove them. */
    pub(crate) fn find_on_level(&self, start: usize, size: usize, lvl: usize) -> usize {
        let mut curr = start;
        let mut prev = curr;
        while block::size(self.arena, curr) < size {
            prev = curr;
            if lvl >= LEVELS {
                break;
            }
            let rel = block::index_offset(self.arena, curr, lvl);
            if rel == 0 {
                break;
            }
            curr = block::apply_offset(curr, rel);
        }
        if block::size(self.arena, curr) == size {
            let succ = block::succ_offset(self.arena, curr);
            if succ != 0 {
                return block::apply_offset(curr, succ);
            }
        }
        prev
    }

    /* Finds the smallest free block >= size, or None if every block in
     * the list is strictly smaller. Descends from the sentinel, picking
     * at each chain head the deepest level whose shortcut both exists
     * and doesn't overshoot past size. */
    pub(crate) fn find(&self, size: usize) -> Option<usize> {
        let mut curr = SENTINEL;
        loop {
            let pred = block::pred_offset(self.arena, curr);
            if pred == 0 {
                break;
            }
            curr = block::apply_offset(curr, pred);
        }

        while block::size(self.arena, curr) < size {
            let level = block::level_of_indices(self.arena, curr);
            let mut index_level = LEVELS - level as usize;
            while index_level < LEVELS {
                let rel = block::index_offset(self.arena, curr, index_level);
                if rel == 0 {
                    index_level += 1;
                    continue;
                }
                let target = block::apply_offset(curr, rel);
                if block::size(self.arena, target) > size {
                    index_level += 1;
                    continue;
                }
                break;
            }
            if index_level >= LEVELS || block::index_offset(self.arena, curr, index_level) == 0 {
                break;
            }
            curr = self.find_on_level(curr, size, index_level);
        }

        if block::size(self.arena, curr) < size {
            return None;
        }
        let succ = block::succ_offset(self.arena, curr);
        if succ != 0 {
            curr = block::apply_offset(curr, succ);
        }
        Some(curr)
    }

    /* Inserts free block block_off into the skip list, either as a new
     * chain head (with a freshly rolled height) or as a duplicate
     * hanging off an existing chain head of the same size. */
    pub(crate) fn insert(&mut self, block_off: usize) {
        let size = block::size(self.arena, block_off);
        if let Some(pos) = self.find(size) {
            if block::size(self.arena, pos) == size {
                let pred_rel = block::offset_between(block_off, pos);
                block::set_pred_offset(self.arena, block_off, pred_rel);

                let pos_succ = block::succ_offset(self.arena, pos);
                let new_succ = if pos_succ != 0 {
                    let target = block::apply_offset(pos, pos_succ);
                    block::offset_between(block_off, target)
                } else {
                    0
                };
                block::set_succ_offset(self.arena, block_off, new_succ);
                block::set_succ_offset(self.arena, pos, block::offset_between(pos, block_off));
                return;
            }
        }

        let height = ((self.rng.next_random_u64() >> 32) as u32) % (LEVELS as u32) + 1;
        block::set_level_of_indices(self.arena, block_off, height);

        let start_level = LEVELS - height as usize;
        for lvl in start_level..LEVELS {
            let pos = self.find_on_level(SENTINEL, size, lvl);
            let pos_rel = block::index_offset(self.arena, pos, lvl);
            let new_rel = if pos_rel != 0 {
                let target = block::apply_offset(pos, pos_rel);
                block::offset_between(block_off, target)
            } else {
                0
            };
            block::set_index_offset(self.arena, block_off, lvl, new_rel);
            block::set_index_offset(self.arena, pos, lvl, block::offset_between(pos, block_off));
        }
    }

    /* Removes block_off from the skip list. A no-op if the block was
     * never inserted (pred_offset == 0 && level_of_indices == 0).
     *
     * A chain head is only ever removed here while it has no remaining
     * duplicates, find/find_on_level always hand callers a duplicate in
     * preference to the head it hangs off, so a head with live
     * duplicates is never the argument to this function. */
    pub(crate) fn remove(&mut self, block_off: usize) {
        let size = block::size(self.arena, block_off);
        let level = block::level_of_indices(self.arena, block_off);
        if level != 0 {
            let start_level = LEVELS - level as usize;
            for lvl in start_level..LEVELS {
                let prev = self.find_on_level(SENTINEL, size - 1, lvl);
                let own_rel = block::index_offset(self.arena, block_off, lvl);
                if own_rel != 0 {
                    let prev_rel = block::index_offset(self.arena, prev, lvl);
                    block::set_index_offset(self.arena, prev, lvl, prev_rel + own_rel);
                } else {
                    block::set_index_offset(self.arena, prev, lvl, 0);
                }
            }
        }

        let pred = block::pred_offset(self.arena, block_off);
        if pred != 0 {
            let pred_node = block::apply_offset(block_off, pred);
            let succ = block::succ_offset(self.arena, block_off);
            if succ != 0 {
                let succ_node = block::apply_offset(block_off, succ);
                let pred_succ = block::succ_offset(self.arena, pred_node);
                block::set_succ_offset(self.arena, pred_node, pred_succ + succ);
                let succ_pred = block::pred_offset(self.arena, succ_node);
                block::set_pred_offset(self.arena, succ_node, succ_pred + pred);
            } else {
                block::set_succ_offset(self.arena, pred_node, 0);
            }
        }
    }

    /* Shrinks block_off to k bytes and carves a fresh free block out of
     * the remainder, returning its offset. Both halves end up with a
     * proper header; the residue additionally gets a footer and P := 0
     * (callers that know better, e.g. because the residue is about to
     * follow a freshly allocated block, override it). */
    pub(crate) fn split(&mut self, block_off: usize, k: usize) -> usize {
        let total = block::size(self.arena, block_off);
        let residue_size = total - k;
        let residue_off = block_off + k;

        block::set_size(self.arena, block_off, k);
        block::init_header(self.arena, residue_off, residue_size, false, false);
        block::zero_payload(self.arena, residue_off);
        block::write_footer(self.arena, residue_off);
        residue_off
    }

    /* Coalesces two physically adjacent, currently-free sorted blocks
     * into one, removing both from the skip list first. Returns the
     * merged block's (left) offset. Does not reinsert, see
     * Pool::free_sorted, which decides whether the result becomes part
     * of the remainder or goes back into the list. */
    pub(crate) fn merge(&mut self, left: usize, right: usize) -> usize {
        self.remove(left);
        self.remove(right);

        let new_size = block::size(self.arena, left) + block::size(self.arena, right);
        block::set_size(self.arena, left, new_size);
        block::zero_payload(self.arena, left);
        block::write_footer(self.arena, left);
        left
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::Pool;
    use crate::rng::test_support::ChaChaRandomSource;

    #[test]
    fn insert_and_find_round_trip_across_several_sizes() {
        let mut buf = vec![0u8; 4096];
        let mut pool = Pool::init(&mut buf, ChaChaRandomSource::seeded(1)).unwrap();

        let a = pool.malloc(100).unwrap();
        let b = pool.malloc(200).unwrap();
        let c = pool.malloc(300).unwrap();
        pool.free(a);
        pool.free(b);
        pool.free(c);

        let d = pool.malloc(90).unwrap();
        assert!(pool.payload(d).len() >= 90);
    }

    #[test]
    fn equal_size_chain_serves_fifo_from_the_skiplist_side() {
        let mut buf = vec![0u8; 4096];
        let mut pool = Pool::init(&mut buf, ChaChaRandomSource::seeded(2)).unwrap();

        let handles: Vec<_> = (0..5).map(|_| pool.malloc(120).unwrap()).collect();
        for h in &handles {
            pool.free(*h);
        }
        for _ in 0..5 {
            assert!(pool.malloc(120).is_some());
        }
        assert!(pool.malloc(120).is_some());
    }
}
