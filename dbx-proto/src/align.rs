//! Padding arithmetic for the D-Bus wire format.
//!
//! Every value starts at an offset that is a multiple of its alignment,
//! measured from the start of the message (or of the body, which itself
//! begins on an 8-byte boundary).

/// Rounds `offset` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub const fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Number of padding bytes needed to bring `offset` to `alignment`.
#[inline]
pub const fn padding(offset: usize, alignment: usize) -> usize {
    align_up(offset, alignment) - offset
}
