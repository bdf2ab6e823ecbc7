//! Transport of values across a context switch.
//!
//! A switch carries exactly one register-sized word in each direction. Values
//! that fit are stored in the word directly; anything larger stays where it is
//! on the sending stack and the word carries its address instead. That address
//! remains valid because the sender is suspended until the receiver has read
//! the value out.

use core::mem::{self, ManuallyDrop};
use core::ptr;

/// Internal type for a value that has been encoded in a `usize`.
pub type EncodedValue = usize;

#[inline]
const fn fits_in_word<T>() -> bool {
    mem::size_of::<T>() <= mem::size_of::<EncodedValue>()
}

/// Encodes `val` in a word either directly or as a pointer to it.
///
/// Ownership of the value moves into the encoded word: the caller must not
/// touch `val` again, and the receiver must decode it exactly once.
#[inline]
pub unsafe fn encode_val<T>(val: &mut ManuallyDrop<T>) -> EncodedValue {
    if fits_in_word::<T>() {
        let mut out = 0;
        ptr::write_unaligned(
            &mut out as *mut EncodedValue as *mut T,
            ManuallyDrop::take(val),
        );
        out
    } else {
        val as *const ManuallyDrop<T> as EncodedValue
    }
}

/// Decodes a word produced by [`encode_val`] for the same `T`.
#[inline]
pub unsafe fn decode_val<T>(val: EncodedValue) -> T {
    if fits_in_word::<T>() {
        ptr::read_unaligned(&val as *const EncodedValue as *const T)
    } else {
        ptr::read(val as *const T)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_and_indirect_values() {
        let mut small = ManuallyDrop::new(0xabcd_u16);
        let word = unsafe { encode_val(&mut small) };
        assert_eq!(unsafe { decode_val::<u16>(word) }, 0xabcd);

        let mut large = ManuallyDrop::new(("left".to_string(), [7u64; 4]));
        let word = unsafe { encode_val(&mut large) };
        let (s, arr): (String, [u64; 4]) = unsafe { decode_val(word) };
        assert_eq!(s, "left");
        assert_eq!(arr, [7; 4]);
    }
}
