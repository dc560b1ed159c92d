//! Byte views of fixed-layout records.

use std::mem::size_of;
use std::ptr;
use std::slice;

/// A record that crosses the service boundary as raw bytes.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no implicit padding and accept
/// every bit pattern for every field.
pub unsafe trait Wire: Copy + Sized + 'static {
    /// Size of the record on the wire.
    const SIZE: usize = size_of::<Self>();

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: no padding, so every byte of `Self` is initialized.
        unsafe { slice::from_raw_parts((self as *const Self).cast::<u8>(), Self::SIZE) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: every bit pattern is a valid `Self`.
        unsafe { slice::from_raw_parts_mut((self as *mut Self).cast::<u8>(), Self::SIZE) }
    }

    /// Decode from a buffer of exactly `SIZE` bytes. The buffer need not be aligned.
    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        // SAFETY: length checked above; any bit pattern is valid.
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<Self>()) })
    }

    /// Encode into a buffer of exactly `SIZE` bytes.
    fn write_to(&self, bytes: &mut [u8]) -> bool {
        if bytes.len() != Self::SIZE {
            return false;
        }
        bytes.copy_from_slice(self.as_bytes());
        true
    }
}

macro_rules! impl_wire_for_primitives {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: primitive numbers have no padding and no invalid values.
            unsafe impl Wire for $ty {}
        )*
    };
}

impl_wire_for_primitives!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

// SAFETY: arrays of padding-free elements are padding-free.
unsafe impl<T: Wire, const N: usize> Wire for [T; N] {}
