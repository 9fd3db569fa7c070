/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * Fast bins: eight LIFO freelists for small blocks.
 *
 * A fast block never coalesces with its neighbors, so it carries no
 * footer, just a header and, while free, a single "next" offset reusing
 * the first word of the payload. Size class k (0..=7) holds blocks whose
 * total size (header included) is 8 * (k + 1) bytes, so class 7 tops out
 * at a 60-byte payload. A request whose aligned total size would land
 * past class 7 is the sorted bins' problem instead, see class_index().
 */

use crate::block;
use crate::rng::RandomSource;
use crate::ROUNDUP8;

pub const CLASS_COUNT: usize = block::FAST_BIN_COUNT;

/* Total block size, header included, of size class k. */
pub const fn class_block_size(k: usize) -> usize {
    8 * (k + 1)
}

pub const fn max_class_block_size() -> usize {
    class_block_size(CLASS_COUNT - 1)
}

/* None if payload_plus_header doesn't fit any fast class. */
pub fn class_index(payload_plus_header: usize) -> Option<usize> {
    let aligned = ROUNDUP8!(payload_plus_header);
    if aligned == 0 || aligned > max_class_block_size() {
        return None;
    }
    Some(aligned / 8 - 1)
}

impl<'a, R: RandomSource> crate::pool::Pool<'a, R> {
    /* Pops the LIFO head of class k, if any. */
    pub(crate) fn fastbin_pop(&mut self, k: usize) -> Option<usize> {
        let head = self.fast_bins[k].take()?;
        let next = block::fast_next_offset(self.arena, head);
        self.fast_bins[k] = if next == 0 { None } else { Some(block::apply_offset(head, next)) };
        Some(head)
    }

    /* Pushes off onto class k's LIFO. Caller has already set the block's
     * header to free/appropriately-sized. */
    pub(crate) fn fastbin_push(&mut self, k: usize, off: usize) {
        let next = self.fast_bins[k].map(|n| block::offset_between(off, n)).unwrap_or(0);
        block::set_fast_next_offset(self.arena, off, next);
        self.fast_bins[k] = Some(off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_index_covers_the_full_small_range() {
        assert_eq!(class_index(8), Some(0));
        assert_eq!(class_index(64), Some(7));
        assert_eq!(class_index(65), None);
        assert_eq!(class_index(1), Some(0));
    }

    #[test]
    fn class_block_sizes_are_eight_byte_steps() {
        assert_eq!(class_block_size(0), 8);
        assert_eq!(class_block_size(7), 64);
    }
}
