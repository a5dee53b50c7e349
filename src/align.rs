/// Size in bytes of one arena word (a boundary tag, a link or a payload cell).
pub const WORD_BYTES: usize = core::mem::size_of::<u32>();

/// Rounds a byte count up to whole arena words.
///
/// # Examples
///
/// ```rust
/// use knuthalloc::words;
///
/// assert_eq!(words!(0), 0);
/// assert_eq!(words!(1), 1);
/// assert_eq!(words!(4), 1);
/// assert_eq!(words!(13), 4);
/// ```
#[macro_export]
macro_rules! words {
  ($bytes:expr) => {
    (($bytes) as usize).div_ceil($crate::align::WORD_BYTES)
  };
}

/// Converts a word count back to bytes.
///
/// ```rust
/// use knuthalloc::bytes;
///
/// assert_eq!(bytes!(3), 12);
/// ```
#[macro_export]
macro_rules! bytes {
  ($words:expr) => {
    ($words) * $crate::align::WORD_BYTES
  };
}

/// Number of whole words that fit in `bytes`; trailing bytes are unusable.
pub fn round_down(bytes: usize) -> usize {
  bytes / WORD_BYTES
}
