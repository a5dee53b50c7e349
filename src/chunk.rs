//! Boundary-tag chunk layout over the arena's word cells.
//!
//! ```text
//!   offset  h      h+1        h+2                      h+1+n
//!         ┌──────┬──────────┬──────────┬─────────────┬──────┐
//!         │ size │ next     │ prev     │     ...     │ size │
//!         └──────┴──────────┴──────────┴─────────────┴──────┘
//!          header ◄──────── n = |size| payload words ──► footer
//! ```
//!
//! A negative size marks the chunk as allocated. The `next`/`prev` words are
//! free-list links only while the chunk is free; once allocated they are the
//! first payload words handed to the caller.

use std::ptr::NonNull;

use crate::align::WORD_BYTES;
use crate::error::HeapError;

/// "No link" sentinel for free-list offsets.
pub const NIL: u32 = u32::MAX;

/// Smallest payload a chunk may have: room for both free-list links.
pub const MIN_PAYLOAD: u32 = 2;

/// Header plus footer.
pub const TAG_WORDS: u32 = 2;

/// Footprint of the smallest valid chunk.
pub const MIN_CHUNK_WORDS: u32 = MIN_PAYLOAD + TAG_WORDS;

/// The managed region, addressed as word cells by offset from its base.
pub(crate) struct Arena {
  base: NonNull<u32>,
  len: u32,
}

impl Arena {
  /// # Safety
  ///
  /// `base` must be valid for reads and writes of `len` words for as long as
  /// the arena is used, and nothing else may access that region except through
  /// payload pointers handed out by the heap.
  pub(crate) unsafe fn new(
    base: NonNull<u32>,
    len: u32,
  ) -> Self {
    Self { base, len }
  }

  pub(crate) fn len(&self) -> u32 {
    self.len
  }

  pub(crate) fn read(
    &self,
    offset: u32,
  ) -> u32 {
    assert!(offset < self.len, "arena read at word {offset} out of {}", self.len);
    unsafe { self.base.as_ptr().add(offset as usize).read() }
  }

  pub(crate) fn write(
    &mut self,
    offset: u32,
    value: u32,
  ) {
    assert!(offset < self.len, "arena write at word {offset} out of {}", self.len);
    unsafe { self.base.as_ptr().add(offset as usize).write(value) }
  }

  /// Pointer to the cell at `offset`.
  pub(crate) fn cell(
    &self,
    offset: u32,
  ) -> NonNull<u32> {
    assert!(offset < self.len);
    unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) }
  }

  /// Word offset of `ptr`, if it points at a cell boundary inside the arena.
  pub(crate) fn offset_of(
    &self,
    ptr: NonNull<u8>,
  ) -> Option<u32> {
    let base = self.base.as_ptr() as usize;
    let addr = ptr.as_ptr() as usize;
    let delta = addr.checked_sub(base)?;

    if delta % WORD_BYTES != 0 {
      return None;
    }

    let offset = delta / WORD_BYTES;
    if offset >= self.len as usize {
      return None;
    }

    Some(offset as u32)
  }

  /// Sets `words` cells starting at `offset` to zero.
  pub(crate) fn zero(
    &mut self,
    offset: u32,
    words: u32,
  ) {
    assert!(offset as usize + words as usize <= self.len as usize);
    unsafe { self.cell(offset).as_ptr().write_bytes(0, words as usize) }
  }
}

/// A chunk, identified by the word offset of its header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Chunk(pub(crate) u32);

impl Chunk {
  pub(crate) fn offset(self) -> u32 {
    self.0
  }

  /// Signed size field from the header.
  pub(crate) fn size(
    self,
    arena: &Arena,
  ) -> i32 {
    arena.read(self.0) as i32
  }

  pub(crate) fn payload_words(
    self,
    arena: &Arena,
  ) -> u32 {
    self.size(arena).unsigned_abs()
  }

  /// Payload plus header and footer.
  pub(crate) fn footprint(
    self,
    arena: &Arena,
  ) -> u32 {
    self.payload_words(arena) + TAG_WORDS
  }

  pub(crate) fn is_free(
    self,
    arena: &Arena,
  ) -> bool {
    self.size(arena) >= 0
  }

  /// Offset of the footer implied by the header. May lie outside the arena
  /// when the header is corrupted.
  pub(crate) fn footer_offset(
    self,
    arena: &Arena,
  ) -> u64 {
    self.0 as u64 + 1 + self.payload_words(arena) as u64
  }

  /// Footer value, or `None` if the header points past the end of the arena.
  pub(crate) fn footer(
    self,
    arena: &Arena,
  ) -> Option<i32> {
    let offset = self.footer_offset(arena);
    if offset >= arena.len() as u64 {
      return None;
    }
    Some(arena.read(offset as u32) as i32)
  }

  pub(crate) fn tags_match(
    self,
    arena: &Arena,
  ) -> bool {
    self.footer(arena) == Some(self.size(arena))
  }

  /// Writes `size` into both header and footer.
  pub(crate) fn set_size(
    self,
    arena: &mut Arena,
    size: i32,
  ) {
    arena.write(self.0, size as u32);
    arena.write(self.0 + 1 + size.unsigned_abs(), size as u32);
  }

  pub(crate) fn next(
    self,
    arena: &Arena,
  ) -> u32 {
    arena.read(self.0 + 1)
  }

  pub(crate) fn prev(
    self,
    arena: &Arena,
  ) -> u32 {
    arena.read(self.0 + 2)
  }

  pub(crate) fn set_next(
    self,
    arena: &mut Arena,
    next: u32,
  ) {
    arena.write(self.0 + 1, next);
  }

  pub(crate) fn set_prev(
    self,
    arena: &mut Arena,
    prev: u32,
  ) {
    arena.write(self.0 + 2, prev);
  }

  /// Physical neighbor to the right, if the arena continues past the footer.
  pub(crate) fn right(
    self,
    arena: &Arena,
  ) -> Option<Chunk> {
    let offset = self.footer_offset(arena) + 1;
    if offset >= arena.len() as u64 {
      return None;
    }
    Some(Chunk(offset as u32))
  }

  /// Physical neighbor to the left, located through its footer.
  pub(crate) fn left(
    self,
    arena: &Arena,
  ) -> Option<Chunk> {
    let foot = self.0.checked_sub(1)?;
    let size = (arena.read(foot) as i32).unsigned_abs();
    foot.checked_sub(size + 1).map(Chunk)
  }

  /// First payload word.
  pub(crate) fn payload(
    self,
    arena: &Arena,
  ) -> NonNull<u8> {
    arena.cell(self.0 + 1).cast()
  }

  /// Chunk owning the payload that starts at `ptr`.
  pub(crate) fn from_payload(
    arena: &Arena,
    ptr: NonNull<u8>,
  ) -> Result<Chunk, HeapError> {
    let foreign = HeapError::ForeignPointer {
      addr: ptr.as_ptr() as usize,
    };

    match arena.offset_of(ptr) {
      Some(offset) if offset >= 1 => Ok(Chunk(offset - 1)),
      _ => Err(foreign),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn arena(cells: &mut [u32]) -> Arena {
    let base = NonNull::new(cells.as_mut_ptr()).unwrap();
    unsafe { Arena::new(base, cells.len() as u32) }
  }

  #[test]
  fn test_tags() {
    let mut cells = vec![0u32; 16];
    let mut arena = arena(&mut cells);

    let first = Chunk(0);
    first.set_size(&mut arena, 4);
    let second = first.right(&arena).unwrap();
    second.set_size(&mut arena, -8);

    assert_eq!(second.offset(), 6);
    assert_eq!(first.footprint(&arena), 6);
    assert_eq!(second.footer_offset(&arena), 15);
    assert!(first.is_free(&arena));
    assert!(!second.is_free(&arena));
    assert!(first.tags_match(&arena));
    assert!(second.tags_match(&arena));

    assert_eq!(second.right(&arena), None);
    assert_eq!(second.left(&arena), Some(first));
    assert_eq!(first.left(&arena), None);
  }

  #[test]
  fn test_corrupted_header_is_detected() {
    let mut cells = vec![0u32; 8];
    let mut arena = arena(&mut cells);

    Chunk(0).set_size(&mut arena, 6);
    arena.write(0, 100);

    assert_eq!(Chunk(0).footer(&arena), None);
    assert!(!Chunk(0).tags_match(&arena));
  }

  #[test]
  fn test_payload_round_trip() {
    let mut cells = vec![0u32; 8];
    let mut arena = arena(&mut cells);
    Chunk(2).set_size(&mut arena, 2);

    let ptr = Chunk(2).payload(&arena);
    assert_eq!(Chunk::from_payload(&arena, ptr), Ok(Chunk(2)));

    let unaligned = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(1)) };
    assert!(matches!(
      Chunk::from_payload(&arena, unaligned),
      Err(HeapError::ForeignPointer { .. })
    ));

    let mut outside = 0u32;
    let outside = NonNull::from(&mut outside).cast::<u8>();
    assert!(Chunk::from_payload(&arena, outside).is_err());
  }
}
