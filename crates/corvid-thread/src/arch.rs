//! Return-address recovery for frame-pointer frames
//!
//! Managed code is compiled with frame pointers. On every supported target the
//! frame pointer addresses a two-word frame record: the caller's frame pointer
//! followed by the return address.
//!
//! | target  | record at `fp`        |
//! |---------|-----------------------|
//! | x86_64  | `[saved rbp, return]` |
//! | x86     | `[saved ebp, return]` |
//! | aarch64 | `[saved x29, x30]`    |
//! | arm     | `[saved r11, lr]`     |

use std::mem::size_of;

/// Word size of the target
pub const WORD: usize = size_of::<usize>();

/// Address of the return-address slot in the frame record at `fp`
///
/// Returns `None` for a null or misaligned frame pointer.
#[inline]
pub fn return_address_slot(fp: usize) -> Option<usize> {
    if fp == 0 || fp % WORD != 0 {
        return None;
    }
    fp.checked_add(WORD)
}
