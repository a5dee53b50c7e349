//! Arena sizing.

use crate::align::{WORD_BYTES, round_down};
use crate::chunk::MIN_CHUNK_WORDS;
use crate::error::HeapError;

/// Sizing for an arena a caller is about to hand to a heap.
///
/// The heap never allocates its arena; this only tells the caller how much to
/// reserve and rejects sizes the heap could not format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Arena length in bytes. Trailing bytes past the last whole word are unused.
  pub arena_bytes: usize,
}

impl HeapConfig {
  /// 64 KiB.
  pub const DEFAULT_ARENA_BYTES: usize = 0x10000;

  /// One minimal chunk: header, two link words, footer.
  pub const MIN_ARENA_BYTES: usize = MIN_CHUNK_WORDS as usize * WORD_BYTES;

  /// Largest arena whose chunk sizes fit the signed size field.
  pub const MAX_ARENA_BYTES: usize = (i32::MAX as usize).saturating_mul(WORD_BYTES);

  pub fn new(arena_bytes: usize) -> Self {
    Self { arena_bytes }
  }

  /// Whole words available to the heap.
  pub fn arena_words(&self) -> usize {
    round_down(self.arena_bytes)
  }

  pub fn validate(&self) -> Result<(), HeapError> {
    if self.arena_bytes < Self::MIN_ARENA_BYTES {
      return Err(HeapError::ArenaTooSmall {
        bytes: self.arena_bytes,
      });
    }

    if self.arena_bytes > Self::MAX_ARENA_BYTES {
      return Err(HeapError::ArenaTooLarge {
        bytes: self.arena_bytes,
      });
    }

    Ok(())
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new(Self::DEFAULT_ARENA_BYTES)
  }
}
