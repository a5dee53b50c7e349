//! Size-sorted, doubly linked list of free chunks, threaded through the
//! chunks' own payload words.

use std::fmt;

use crate::chunk::{Arena, Chunk, MIN_CHUNK_WORDS, NIL};

/// Offset and payload size of a chunk, as reported by the diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
  /// Word offset of the chunk header from the arena base.
  pub offset: u32,
  /// Payload capacity in words.
  pub words: u32,
  pub free: bool,
}

/// Reports a broken allocator invariant and aborts.
#[cold]
pub(crate) fn consistency_violation(args: fmt::Arguments<'_>) -> ! {
  log::error!("free list corrupted: {args}");
  panic!("free list corrupted: {args}");
}

pub(crate) struct FreeList {
  root: u32,
}

impl FreeList {
  pub(crate) fn empty() -> Self {
    Self { root: NIL }
  }

  /// List holding exactly `chunk`.
  pub(crate) fn single(
    arena: &mut Arena,
    chunk: Chunk,
  ) -> Self {
    chunk.set_next(arena, NIL);
    chunk.set_prev(arena, NIL);
    Self { root: chunk.offset() }
  }

  pub(crate) fn root(&self) -> u32 {
    self.root
  }

  /// First chunk holding at least `words` payload words. The list is sorted
  /// ascending, so the first fit is also the best fit.
  pub(crate) fn find_fit(
    &self,
    arena: &Arena,
    words: u32,
  ) -> Option<Chunk> {
    self
      .walk(arena)
      .find(|chunk| chunk.payload_words(arena) >= words)
  }

  /// Unlinks `chunk`. Its own link words are left as they were.
  pub(crate) fn remove(
    &mut self,
    arena: &mut Arena,
    chunk: Chunk,
  ) {
    let next = chunk.next(arena);
    let prev = chunk.prev(arena);

    match (prev, next) {
      (NIL, NIL) => self.root = NIL,
      (NIL, next) => {
        self.root = next;
        Chunk(next).set_prev(arena, NIL);
      }
      (prev, NIL) => Chunk(prev).set_next(arena, NIL),
      (prev, next) => {
        Chunk(prev).set_next(arena, next);
        Chunk(next).set_prev(arena, prev);
      }
    }
  }

  /// Links `chunk` in front of the first strictly larger member.
  pub(crate) fn insert(
    &mut self,
    arena: &mut Arena,
    chunk: Chunk,
  ) {
    let size = chunk.size(arena);
    let mut prev = NIL;
    let mut curr = NIL;

    for member in self.walk(arena) {
      if size < member.size(arena) {
        curr = member.offset();
        break;
      }
      prev = member.offset();
    }

    chunk.set_next(arena, curr);
    chunk.set_prev(arena, prev);

    if curr != NIL {
      Chunk(curr).set_prev(arena, chunk.offset());
    }

    if prev == NIL {
      self.root = chunk.offset();
    } else {
      Chunk(prev).set_next(arena, chunk.offset());
    }
  }

  /// Walks the list front to back, aborting on a cycle or a member that is
  /// not free.
  pub(crate) fn walk<'a>(
    &self,
    arena: &'a Arena,
  ) -> FreeChunks<'a> {
    FreeChunks {
      arena,
      curr: self.root,
      steps: 0,
      limit: arena.len() / MIN_CHUNK_WORDS,
    }
  }
}

/// Iterator over the free list in list order.
pub(crate) struct FreeChunks<'a> {
  arena: &'a Arena,
  curr: u32,
  steps: u32,
  /// Upper bound on how many chunks the arena can hold; walking further means
  /// the links form a cycle.
  limit: u32,
}

impl Iterator for FreeChunks<'_> {
  type Item = Chunk;

  fn next(&mut self) -> Option<Chunk> {
    if self.curr == NIL {
      return None;
    }

    if self.curr as u64 + MIN_CHUNK_WORDS as u64 > self.arena.len() as u64 {
      consistency_violation(format_args!("link to word {} past the arena end", self.curr));
    }

    self.steps += 1;
    if self.steps > self.limit {
      consistency_violation(format_args!("cycle detected at word {}", self.curr));
    }

    let chunk = Chunk(self.curr);
    let size = chunk.size(self.arena);
    if size < 0 {
      consistency_violation(format_args!(
        "allocated chunk at word {} (size {size}) is linked as free",
        self.curr
      ));
    }

    self.curr = chunk.next(self.arena);
    Some(chunk)
  }
}
