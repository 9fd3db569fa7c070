/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * Boundary-tag block layout.
 *
 * Every block, free or allocated, starts with a 4-byte header word
 * packing SIZE (bits 3..=31, the low 3 bits are always zero since every
 * block is 8-byte aligned), A (bit 0, allocated) and P (bit 1, previous
 * block allocated). Free blocks additionally carry a footer word, a
 * duplicate of the header, in their last 4 bytes, so a block can be
 * reached and sized from either neighbor during coalescing.
 *
 * Everything here operates on plain byte offsets into the arena rather
 * than raw pointers: there is exactly one &mut [u8] for the whole pool.
 */

pub const HEADER_SIZE: usize = 4;
pub const FOOTER_SIZE: usize = 4;

pub const FAST_BIN_COUNT: usize = 8;

/* Number of index levels a skip-list chain head can carry. */
pub const SKIP_LIST_LEVELS: usize = 13;

const NODE_PRED_OFF: usize = HEADER_SIZE;
const NODE_SUCC_OFF: usize = HEADER_SIZE + 4;
const NODE_LEVEL_OFF: usize = HEADER_SIZE + 8;
pub const NODE_OFFSETS_OFF: usize = HEADER_SIZE + 12;

/* Smallest block that can hold a full chain-head node (pred + succ +
 * level + 13 index offsets) plus its footer. */
pub const SORTED_MIN_SIZE: usize =
    NODE_OFFSETS_OFF + SKIP_LIST_LEVELS * 4 + FOOTER_SIZE;

const SIZE_MASK: u32 = !0x7;
const A_BIT: u32 = 1;
const P_BIT: u32 = 1 << 1;

fn read_u32(arena: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(arena[off..off + 4].try_into().unwrap())
}

fn write_u32(arena: &mut [u8], off: usize, val: u32) {
    arena[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn read_i32(arena: &[u8], off: usize) -> i32 {
    read_u32(arena, off) as i32
}

fn write_i32(arena: &mut [u8], off: usize, val: i32) {
    write_u32(arena, off, val as u32);
}

fn header_word(size: usize, allocated: bool, prev_allocated: bool) -> u32 {
    debug_assert_eq!(size & 0x7, 0, "block size must be 8-byte aligned");
    (size as u32 & SIZE_MASK)
        | if allocated { A_BIT } else { 0 }
        | if prev_allocated { P_BIT } else { 0 }
}

pub fn header(arena: &[u8], off: usize) -> u32 {
    read_u32(arena, off)
}

pub fn size(arena: &[u8], off: usize) -> usize {
    (header(arena, off) & SIZE_MASK) as usize
}

/* Same as size() but starting from an already-read header word, for
 * callers that pulled a neighbor's word out of a footer rather than its
 * own header. */
pub fn size_of_word(word: u32) -> usize {
    (word & SIZE_MASK) as usize
}

pub fn is_allocated(arena: &[u8], off: usize) -> bool {
    header(arena, off) & A_BIT != 0
}

pub fn prev_allocated(arena: &[u8], off: usize) -> bool {
    header(arena, off) & P_BIT != 0
}

/* Rewrites the header in place, keeping whatever A/P bits already hold. */
pub fn set_size(arena: &mut [u8], off: usize, new_size: usize) {
    let a = is_allocated(arena, off);
    let p = prev_allocated(arena, off);
    write_u32(arena, off, header_word(new_size, a, p));
}

pub fn set_allocated(arena: &mut [u8], off: usize, val: bool) {
    let word = header(arena, off);
    write_u32(arena, off, if val { word | A_BIT } else { word & !A_BIT });
}

pub fn set_prev_allocated(arena: &mut [u8], off: usize, val: bool) {
    let word = header(arena, off);
    write_u32(arena, off, if val { word | P_BIT } else { word & !P_BIT });
}

/* Writes a brand-new header, discarding whatever bits were there before. */
pub fn init_header(arena: &mut [u8], off: usize, size: usize, allocated: bool, prev_allocated: bool) {
    write_u32(arena, off, header_word(size, allocated, prev_allocated));
}

/* Free blocks carry a trailing copy of the header so a left neighbor can
 * read this block's size without walking forward through it. */
pub fn write_footer(arena: &mut [u8], off: usize) {
    let word = header(arena, off);
    let sz = size(arena, off);
    write_u32(arena, off + sz - FOOTER_SIZE, word);
}

/* Reads the footer word of the free block that ends immediately before
 * off, i.e. the left neighbor of the block starting at off. */
pub fn footer_before(arena: &[u8], off: usize) -> u32 {
    read_u32(arena, off - FOOTER_SIZE)
}

pub fn payload_offset(off: usize) -> usize {
    off + HEADER_SIZE
}

pub fn payload_len(arena: &[u8], off: usize) -> usize {
    size(arena, off) - HEADER_SIZE
}

pub fn zero_payload(arena: &mut [u8], off: usize) {
    let start = payload_offset(off);
    let len = payload_len(arena, off);
    arena[start..start + len].fill(0);
}

/* A relative, signed byte displacement between two arena offsets, the
 * position-independent stand-in for a raw link in the skip list. */
pub fn offset_between(from: usize, to: usize) -> i32 {
    i32::try_from(to as i64 - from as i64).expect("arena larger than i32 range")
}

pub fn apply_offset(base: usize, rel: i32) -> usize {
    (base as i64 + rel as i64) as usize
}

pub fn pred_offset(arena: &[u8], node: usize) -> i32 {
    read_i32(arena, node + NODE_PRED_OFF)
}

pub fn set_pred_offset(arena: &mut [u8], node: usize, rel: i32) {
    write_i32(arena, node + NODE_PRED_OFF, rel);
}

pub fn succ_offset(arena: &[u8], node: usize) -> i32 {
    read_i32(arena, node + NODE_SUCC_OFF)
}

pub fn set_succ_offset(arena: &mut [u8], node: usize, rel: i32) {
    write_i32(arena, node + NODE_SUCC_OFF, rel);
}

pub fn level_of_indices(arena: &[u8], node: usize) -> u32 {
    read_u32(arena, node + NODE_LEVEL_OFF)
}

pub fn set_level_of_indices(arena: &mut [u8], node: usize, level: u32) {
    write_u32(arena, node + NODE_LEVEL_OFF, level);
}

/* index counts down from the densest level: index == level - 1 is the
 * level every chain head participates in, index == 0 is the sparsest. */
pub fn index_offset(arena: &[u8], node: usize, index: usize) -> i32 {
    read_i32(arena, node + NODE_OFFSETS_OFF + index * 4)
}

pub fn set_index_offset(arena: &mut [u8], node: usize, index: usize, rel: i32) {
    write_i32(arena, node + NODE_OFFSETS_OFF + index * 4, rel);
}

/* Fast-bin free nodes only need a header and a single next-offset word. */
pub fn fast_next_offset(arena: &[u8], node: usize) -> i32 {
    read_i32(arena, node + HEADER_SIZE)
}

pub fn set_fast_next_offset(arena: &mut [u8], node: usize, rel: i32) {
    write_i32(arena, node + HEADER_SIZE, rel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_size_and_flags() {
        let mut arena = [0u8; 16];
        init_header(&mut arena, 0, 72, true, false);
        assert_eq!(size(&arena, 0), 72);
        assert!(is_allocated(&arena, 0));
        assert!(!prev_allocated(&arena, 0));
    }

    #[test]
    fn set_size_preserves_flags() {
        let mut arena = [0u8; 16];
        init_header(&mut arena, 0, 16, false, true);
        set_size(&mut arena, 0, 96);
        assert_eq!(size(&arena, 0), 96);
        assert!(!is_allocated(&arena, 0));
        assert!(prev_allocated(&arena, 0));
    }

    #[test]
    fn footer_mirrors_header() {
        let mut arena = [0u8; 80];
        init_header(&mut arena, 0, 80, false, true);
        write_footer(&mut arena, 0);
        assert_eq!(footer_before(&arena, 80), header(&arena, 0));
    }

    #[test]
    fn offsets_round_trip_through_signed_arithmetic() {
        let rel = offset_between(100, 40);
        assert_eq!(rel, -60);
        assert_eq!(apply_offset(100, rel), 40);
    }
}
