/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /* The buffer handed to Pool::init is smaller than the minimum viable
     * arena (sentinel node plus one minimum-size block). */
    BufferTooSmall,

    /* migrate was asked to move into a buffer smaller than the live
     * arena. */
    TargetTooSmall,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::BufferTooSmall => {
                write!(f, "buffer too small for a pool header and one block")
            }
            AllocError::TargetTooSmall => {
                write!(f, "migration target smaller than the live arena")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}
