/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

#[macro_export]
macro_rules! ROUNDUP {
    ($a: expr, $b: expr) => {((($a) + (($b)-1)) & !(($b)-1))}
}

#[macro_export]
macro_rules! ROUNDDOWN {
    ($a: expr, $b: expr) => {(($a) & !(($b)-1))}
}

#[macro_export]
macro_rules! ALIGN {
    ($a: expr, $b: expr) => {ROUNDUP!($a, $b)}
}

#[macro_export]
macro_rules! IS_ALIGNED {
    ($a: expr, $b: expr) => {((($a) & (($b) - 1)) == 0)}
}

/* Every block in the arena is 8-byte aligned; these are the two spellings
 * of ROUNDUP!/IS_ALIGNED! actually used by the pool. */
#[macro_export]
macro_rules! ROUNDUP8 {
    ($a: expr) => { ROUNDUP!($a, 8) }
}

#[macro_export]
macro_rules! IS_ALIGNED8 {
    ($a: expr) => { IS_ALIGNED!($a, 8) }
}
