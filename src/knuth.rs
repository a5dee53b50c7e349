use std::{fmt, marker::PhantomData, mem, ptr, ptr::NonNull};

use crate::{
  align::round_down,
  bytes,
  chunk::{Arena, Chunk, MIN_CHUNK_WORDS, MIN_PAYLOAD, NIL, TAG_WORDS},
  config::HeapConfig,
  error::HeapError,
  free_list::{ChunkInfo, FreeList},
  heap::Heap,
  words,
};

/// Boundary-tag heap over a caller-supplied arena.
///
/// Free chunks are kept on a single list sorted by payload size, linked by
/// word offsets stored inside the free payloads. Physical neighbors are found
/// through the header/footer tags, which lets a release coalesce in O(1) per
/// neighbor and lets a resize grow in place when the surrounding chunks are
/// free.
pub struct KnuthHeap<'a> {
  arena: Arena,
  free: FreeList,
  _arena: PhantomData<&'a mut [u32]>,
}

impl<'a> KnuthHeap<'a> {
  /// Formats `arena` as one free chunk and manages it from then on.
  pub fn new(arena: &'a mut [u32]) -> Result<Self, HeapError> {
    let bytes = bytes!(arena.len());
    let base = NonNull::from(arena).cast::<u8>();

    unsafe { Self::from_raw_parts(base, bytes) }
  }

  /// Manages the `bytes`-long region at `base`, e.g. a linker-placed static
  /// buffer or a memory-mapped window. Trailing bytes past the last whole word
  /// are left untouched.
  ///
  /// # Safety
  ///
  /// The region must be valid for reads and writes for `'a` and must not be
  /// accessed other than through pointers returned by this heap.
  pub unsafe fn from_raw_parts(
    base: NonNull<u8>,
    bytes: usize,
  ) -> Result<Self, HeapError> {
    HeapConfig::new(bytes).validate()?;

    let addr = base.as_ptr() as usize;
    if addr % mem::align_of::<u32>() != 0 {
      return Err(HeapError::ForeignPointer { addr });
    }

    let arena = unsafe { Arena::new(base.cast(), round_down(bytes) as u32) };
    let mut heap = Self {
      arena,
      free: FreeList::empty(),
      _arena: PhantomData,
    };
    heap.init();

    Ok(heap)
  }

  /// Re-formats the whole arena as a single free chunk. Outstanding
  /// allocations are forgotten without being inspected.
  pub fn init(&mut self) {
    let whole = Chunk(0);
    let payload = self.arena.len() - TAG_WORDS;

    whole.set_size(&mut self.arena, payload as i32);
    self.free = FreeList::single(&mut self.arena, whole);

    log::debug!("arena formatted: {} words, one free chunk of {payload} words", self.arena.len());
  }

  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let chunk = self.take(size, false)?;
    Ok(chunk.payload(&self.arena))
  }

  /// Allocates `count * size` bytes and zeroes the whole payload.
  pub fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let bytes = count.checked_mul(size).ok_or(HeapError::OutOfMemory {
      requested: usize::MAX,
    })?;

    let chunk = self.take(bytes, true)?;
    Ok(chunk.payload(&self.arena))
  }

  /// # Safety
  ///
  /// See [`Heap::release`].
  pub unsafe fn release(
    &mut self,
    ptr: Option<NonNull<u8>>,
  ) -> Result<(), HeapError> {
    let Some(ptr) = ptr else {
      return Ok(());
    };

    let chunk = self.owned_chunk(ptr)?;
    log::trace!(
      "release: chunk at word {} ({} words)",
      chunk.offset(),
      chunk.payload_words(&self.arena)
    );
    self.reclaim(chunk);

    Ok(())
  }

  /// Never shrinks: a chunk that already holds `size` bytes is returned as is.
  /// Otherwise the chunk grows in place if coalescing with its free neighbors
  /// makes room, and moves to a fresh chunk if not. When no room exists
  /// anywhere the original allocation is left intact.
  ///
  /// # Safety
  ///
  /// See [`Heap::resize`].
  pub unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, HeapError> {
    let Some(ptr) = ptr else {
      return self.allocate(size).map(Some);
    };

    if size == 0 {
      unsafe { self.release(Some(ptr))? };
      return Ok(None);
    }

    let chunk = self.owned_chunk(ptr)?;
    let live = chunk.payload_words(&self.arena);
    let words = words!(size).min(u32::MAX as usize) as u32;

    if live >= words {
      return Ok(Some(ptr));
    }

    if self.coalesce_probe(chunk) >= words {
      chunk.set_size(&mut self.arena, live as i32);
      let merged = self.coalesce(chunk);
      let dst = merged.payload(&self.arena);

      // Move before carving: the split writes a footer and links that may
      // land on the old payload.
      unsafe { transfer(dst, ptr, live) };
      self.carve(merged, words, false);

      log::debug!(
        "resize: chunk at word {} grew in place to {} words at word {}",
        chunk.offset(),
        merged.payload_words(&self.arena),
        merged.offset()
      );
      return Ok(Some(dst));
    }

    let fresh = self.take(size, false)?;
    let dst = fresh.payload(&self.arena);
    unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_ptr(), bytes!(live as usize)) };
    self.reclaim(chunk);

    log::debug!(
      "resize: chunk at word {} moved to word {}",
      chunk.offset(),
      fresh.offset()
    );
    Ok(Some(dst))
  }

  /// Finds, unlinks and carves a chunk for a `bytes`-long request.
  fn take(
    &mut self,
    bytes: usize,
    clear: bool,
  ) -> Result<Chunk, HeapError> {
    if bytes == 0 {
      log::warn!("allocate: rejected zero-size request");
      return Err(HeapError::InvalidArgument);
    }

    let words = words!(bytes).min(u32::MAX as usize) as u32;
    let Some(chunk) = self.free.find_fit(&self.arena, words) else {
      log::warn!(
        "allocate: out of memory for {bytes} bytes (largest free chunk {} bytes)",
        self.largest_free()
      );
      return Err(HeapError::OutOfMemory { requested: bytes });
    };

    self.free.remove(&mut self.arena, chunk);
    self.carve(chunk, words, clear);

    log::trace!(
      "allocate: {bytes} bytes at word {} ({} words)",
      chunk.offset(),
      chunk.payload_words(&self.arena)
    );
    Ok(chunk)
  }

  /// Grants `chunk`, already off the free list, to a request of `words`
  /// words. The tail is split off as a new free chunk when it can hold a
  /// minimal chunk; otherwise the excess stays with the allocation.
  fn carve(
    &mut self,
    chunk: Chunk,
    words: u32,
    clear: bool,
  ) {
    let words = words.max(MIN_PAYLOAD);
    let payload = chunk.payload_words(&self.arena);

    if payload >= words + MIN_CHUNK_WORDS {
      chunk.set_size(&mut self.arena, words as i32);

      let rest = Chunk(chunk.offset() + words + TAG_WORDS);
      rest.set_size(&mut self.arena, (payload - words - TAG_WORDS) as i32);
      self.free.insert(&mut self.arena, rest);

      log::debug!(
        "split chunk at word {}: keep {words} words, free {} words at word {}",
        chunk.offset(),
        payload - words - TAG_WORDS,
        rest.offset()
      );
    }

    let granted = chunk.payload_words(&self.arena);
    if clear {
      self.arena.zero(chunk.offset() + 1, granted);
    }

    chunk.set_size(&mut self.arena, -(granted as i32));
  }

  /// Marks `chunk` free, merges it with its free neighbors and lists it.
  fn reclaim(
    &mut self,
    chunk: Chunk,
  ) {
    let words = chunk.payload_words(&self.arena);
    chunk.set_size(&mut self.arena, words as i32);

    let merged = self.coalesce(chunk);
    self.free.insert(&mut self.arena, merged);
  }

  /// Absorbs every contiguous free neighbor, right first, then left. `chunk`
  /// must carry a non-negative size and must not be on the free list.
  fn coalesce(
    &mut self,
    chunk: Chunk,
  ) -> Chunk {
    let mut chunk = chunk;

    while let Some(right) = chunk.right(&self.arena).filter(|c| c.is_free(&self.arena)) {
      self.free.remove(&mut self.arena, right);
      chunk = self.join(chunk, right);
    }

    while let Some(left) = chunk.left(&self.arena).filter(|c| c.is_free(&self.arena)) {
      self.free.remove(&mut self.arena, left);
      chunk = self.join(left, chunk);
    }

    chunk
  }

  /// Payload words `chunk` would have after [`Self::coalesce`], computed
  /// without touching any tag or link.
  fn coalesce_probe(
    &self,
    chunk: Chunk,
  ) -> u32 {
    let arena = &self.arena;
    let mut space = chunk.footprint(arena);

    let mut right = chunk.right(arena);
    while let Some(r) = right.filter(|c| c.is_free(arena)) {
      space += r.footprint(arena);
      right = r.right(arena);
    }

    let mut left = chunk.left(arena);
    while let Some(l) = left.filter(|c| c.is_free(arena)) {
      space += l.footprint(arena);
      left = l.left(arena);
    }

    space - TAG_WORDS
  }

  /// Merges two free, physically adjacent chunks; `left` precedes `right`.
  /// One header and one footer are reclaimed as payload.
  fn join(
    &mut self,
    left: Chunk,
    right: Chunk,
  ) -> Chunk {
    let size = left.size(&self.arena) + right.size(&self.arena) + TAG_WORDS as i32;
    left.set_size(&mut self.arena, size);
    left
  }

  /// Resolves a caller pointer to its chunk and refuses pointers the heap
  /// cannot vouch for.
  fn owned_chunk(
    &self,
    ptr: NonNull<u8>,
  ) -> Result<Chunk, HeapError> {
    let chunk = Chunk::from_payload(&self.arena, ptr)
      .inspect_err(|_| log::warn!("refused pointer {ptr:p}: outside the arena"))?;

    let header = chunk.size(&self.arena);

    if !chunk.tags_match(&self.arena) {
      let footer = chunk.footer(&self.arena);
      log::warn!(
        "refused chunk at word {}: header {header} does not match footer {footer:?}",
        chunk.offset()
      );
      return Err(HeapError::CorruptedMetadata {
        offset: chunk.offset(),
        header,
        footer,
      });
    }

    if header >= 0 {
      log::warn!("refused chunk at word {}: already free", chunk.offset());
      return Err(HeapError::DoubleRelease {
        offset: chunk.offset(),
      });
    }

    Ok(chunk)
  }

  fn info(
    &self,
    chunk: Chunk,
  ) -> ChunkInfo {
    ChunkInfo {
      offset: chunk.offset(),
      words: chunk.payload_words(&self.arena),
      free: chunk.is_free(&self.arena),
    }
  }

  /// Free chunks in free-list order, smallest first.
  ///
  /// # Panics
  ///
  /// If the list is cyclic or links an allocated chunk.
  pub fn free_chunks(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
    self.free.walk(&self.arena).map(|chunk| self.info(chunk))
  }

  /// Every chunk in address order. Stops early at a chunk whose header runs
  /// past the end of the arena.
  pub fn chunks(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
    let arena = &self.arena;

    std::iter::successors(Some(Chunk(0)), move |chunk| {
      chunk.footer(arena)?;
      chunk.right(arena)
    })
    .map(|chunk| self.info(chunk))
  }

  /// Largest request, in bytes, that can currently succeed without a resize.
  pub fn largest_free(&self) -> usize {
    let words = self.free_chunks().map(|c| c.words).max().unwrap_or(0);
    bytes!(words as usize)
  }

  /// Total free payload in bytes.
  pub fn free_bytes(&self) -> usize {
    self.free_chunks().map(|c| bytes!(c.words as usize)).sum()
  }

  /// Arena length in words.
  pub fn arena_words(&self) -> u32 {
    self.arena.len()
  }

  /// Word offset of a payload pointer from the arena base.
  pub fn offset_of(
    &self,
    ptr: NonNull<u8>,
  ) -> Option<u32> {
    self.arena.offset_of(ptr)
  }

  /// Writes one `offset: size = words` line per free chunk, in list order.
  pub fn dump_free_list(
    &self,
    out: &mut impl fmt::Write,
  ) -> fmt::Result {
    writeln!(out, "free list:")?;
    for chunk in self.free_chunks() {
      writeln!(out, "{}: size = {}", chunk.offset, chunk.words)?;
    }
    Ok(())
  }

  pub fn print_free_list(&self) {
    let mut out = String::new();
    let _ = self.dump_free_list(&mut out);
    println!("{out}");
  }

  /// Validates the whole arena: the chunks tile it exactly, every header
  /// matches its footer, no two free chunks sit side by side, and the free
  /// list holds exactly the free chunks in ascending size order.
  ///
  /// # Panics
  ///
  /// If the free list is cyclic or links an allocated chunk.
  pub fn check(&self) -> Result<(), HeapError> {
    let arena = &self.arena;
    let mut free = Vec::new();
    let mut offset = 0;
    let mut left_free = false;

    while offset < arena.len() {
      let chunk = Chunk(offset);
      let header = chunk.size(arena);

      if !chunk.tags_match(arena) {
        return Err(HeapError::CorruptedMetadata {
          offset,
          header,
          footer: chunk.footer(arena),
        });
      }

      if chunk.payload_words(arena) < MIN_PAYLOAD {
        return Err(HeapError::Inconsistent(format!(
          "chunk at word {offset} has only {} payload words",
          chunk.payload_words(arena)
        )));
      }

      let is_free = header >= 0;
      if is_free && left_free {
        return Err(HeapError::Inconsistent(format!(
          "free chunk at word {offset} was not coalesced with its left neighbor"
        )));
      }
      if is_free {
        free.push(offset);
      }

      left_free = is_free;
      offset = chunk.footer_offset(arena) as u32 + 1;
    }

    let mut listed = Vec::with_capacity(free.len());
    let mut prev = NIL;
    let mut smallest = 0;

    for chunk in self.free.walk(arena) {
      if chunk.prev(arena) != prev {
        return Err(HeapError::Inconsistent(format!(
          "chunk at word {} links back to {} instead of {prev}",
          chunk.offset(),
          chunk.prev(arena)
        )));
      }

      let words = chunk.payload_words(arena);
      if words < smallest {
        return Err(HeapError::Inconsistent(format!(
          "free list out of order at word {}: {words} words after {smallest}",
          chunk.offset()
        )));
      }

      smallest = words;
      prev = chunk.offset();
      listed.push(chunk.offset());
    }

    listed.sort_unstable();
    if listed != free {
      return Err(HeapError::Inconsistent(format!(
        "free list holds {:?}, arena has free chunks at {:?}",
        listed, free
      )));
    }

    Ok(())
  }
}

impl Heap for KnuthHeap<'_> {
  fn reset(&mut self) {
    self.init();
  }

  fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    KnuthHeap::allocate(self, size)
  }

  fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    KnuthHeap::zero_allocate(self, count, size)
  }

  unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, HeapError> {
    unsafe { KnuthHeap::resize(self, ptr, size) }
  }

  unsafe fn release(
    &mut self,
    ptr: Option<NonNull<u8>>,
  ) -> Result<(), HeapError> {
    unsafe { KnuthHeap::release(self, ptr) }
  }
}

impl fmt::Debug for KnuthHeap<'_> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("KnuthHeap")
      .field("words", &self.arena.len())
      .field("free_root", &self.free.root())
      .finish()
  }
}

/// Moves `words` words from `src` to `dst`; the regions may overlap.
unsafe fn transfer(
  dst: NonNull<u8>,
  src: NonNull<u8>,
  words: u32,
) {
  if dst != src {
    unsafe { ptr::copy(src.cast::<u32>().as_ptr(), dst.cast::<u32>().as_ptr(), words as usize) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn info(
    offset: u32,
    words: u32,
  ) -> ChunkInfo {
    ChunkInfo {
      offset,
      words,
      free: true,
    }
  }

  fn free_list(heap: &KnuthHeap) -> Vec<ChunkInfo> {
    heap.free_chunks().collect()
  }

  unsafe fn fill(
    ptr: NonNull<u8>,
    words: &[u32],
  ) {
    let cells = ptr.cast::<u32>().as_ptr();
    for (i, &word) in words.iter().enumerate() {
      unsafe { cells.add(i).write(word) };
    }
  }

  unsafe fn read(
    ptr: NonNull<u8>,
    count: usize,
  ) -> Vec<u32> {
    let cells = ptr.cast::<u32>().as_ptr();
    (0..count).map(|i| unsafe { cells.add(i).read() }).collect()
  }

  #[test]
  fn test_init_formats_one_chunk() {
    let mut cells = vec![0u32; 256];
    let heap = KnuthHeap::new(&mut cells).unwrap();

    assert_eq!(free_list(&heap), vec![info(0, 254)]);
    assert_eq!(heap.largest_free(), 254 * 4);
    heap.check().unwrap();
  }

  #[test]
  fn test_rejects_unusable_arenas() {
    let mut cells = vec![0u32; 3];
    assert_eq!(
      KnuthHeap::new(&mut cells).unwrap_err(),
      HeapError::ArenaTooSmall { bytes: 12 }
    );

    let mut cells = vec![0u32; 8];
    let base = NonNull::from(&mut cells[..]).cast::<u8>();
    let misaligned = unsafe { NonNull::new_unchecked(base.as_ptr().add(2)) };
    let result = unsafe { KnuthHeap::from_raw_parts(misaligned, 16) };
    assert!(matches!(result, Err(HeapError::ForeignPointer { .. })));
  }

  #[test]
  fn test_zero_size_allocation_fails() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    assert_eq!(heap.allocate(0), Err(HeapError::InvalidArgument));
    assert_eq!(heap.zero_allocate(0, 8), Err(HeapError::InvalidArgument));
    assert_eq!(free_list(&heap), vec![info(0, 62)]);
  }

  #[test]
  fn test_split_and_sorted_remainders() {
    let mut cells = vec![0u32; 256];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(16).unwrap();
    assert_eq!(heap.offset_of(a), Some(1));
    assert_eq!(free_list(&heap), vec![info(6, 248)]);

    let b = heap.allocate(13).unwrap();
    assert_eq!(heap.offset_of(b), Some(7));
    assert_eq!(free_list(&heap), vec![info(12, 242)]);

    unsafe { heap.release(Some(a)).unwrap() };
    assert_eq!(free_list(&heap), vec![info(0, 4), info(12, 242)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_released_chunk_is_reused() {
    let mut cells = vec![0u32; 256];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let first = heap.allocate(16).unwrap();
    let _second = heap.allocate(16).unwrap();
    unsafe { heap.release(Some(first)).unwrap() };

    let third = heap.allocate(16).unwrap();
    assert_eq!(third, first);
    heap.check().unwrap();
  }

  #[test]
  fn test_single_chunk_arena() {
    let mut cells = vec![0u32; 8];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let only = heap.allocate(24).unwrap();
    assert_eq!(heap.allocate(1), Err(HeapError::OutOfMemory { requested: 1 }));

    unsafe { heap.release(Some(only)).unwrap() };
    assert_eq!(heap.allocate(24).unwrap(), only);
  }

  #[test]
  fn test_split_threshold() {
    let mut cells = vec![0u32; 16];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    // 14 payload words: 10 leave room for a 2-word remainder, 11 do not.
    heap.allocate(bytes!(10)).unwrap();
    assert_eq!(free_list(&heap), vec![info(12, 2)]);

    heap.init();
    heap.allocate(bytes!(11)).unwrap();
    assert!(free_list(&heap).is_empty());
    assert_eq!(
      heap.chunks().collect::<Vec<_>>(),
      vec![ChunkInfo {
        offset: 0,
        words: 14,
        free: false,
      }]
    );
  }

  #[test]
  fn test_small_requests_get_minimum_payload() {
    let mut cells = vec![0u32; 32];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    heap.allocate(1).unwrap();
    let chunks: Vec<_> = heap.chunks().collect();
    assert_eq!(chunks[0].words, MIN_PAYLOAD);
    assert_eq!(chunks[1], info(4, 26));
  }

  #[test]
  fn test_zero_allocate_clears_payload() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let dirty = heap.allocate(32).unwrap();
    unsafe {
      fill(dirty, &[u32::MAX; 8]);
      heap.release(Some(dirty)).unwrap();
    }

    let clean = heap.zero_allocate(4, 8).unwrap();
    assert_eq!(clean, dirty);
    assert_eq!(unsafe { read(clean, 8) }, vec![0; 8]);

    assert_eq!(
      heap.zero_allocate(usize::MAX, 2),
      Err(HeapError::OutOfMemory {
        requested: usize::MAX
      })
    );
  }

  #[test]
  fn test_release_null_is_noop() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    assert_eq!(unsafe { heap.release(None) }, Ok(()));
    assert_eq!(free_list(&heap), vec![info(0, 62)]);
  }

  #[test]
  fn test_double_release_is_refused() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(8).unwrap();
    let _b = heap.allocate(8).unwrap();
    unsafe { heap.release(Some(a)).unwrap() };
    let before = free_list(&heap);

    assert_eq!(
      unsafe { heap.release(Some(a)) },
      Err(HeapError::DoubleRelease { offset: 0 })
    );
    assert_eq!(
      unsafe { heap.resize(Some(a), 64) },
      Err(HeapError::DoubleRelease { offset: 0 })
    );
    assert_eq!(free_list(&heap), before);
    heap.check().unwrap();
  }

  #[test]
  fn test_overrun_footer_is_refused() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(8).unwrap();
    // Writing one word past the payload clobbers the footer.
    unsafe { fill(a, &[1, 2, 0xdead]) };

    assert_eq!(
      unsafe { heap.release(Some(a)) },
      Err(HeapError::CorruptedMetadata {
        offset: 0,
        header: -2,
        footer: Some(0xdead),
      })
    );
    assert!(matches!(
      unsafe { heap.resize(Some(a), 64) },
      Err(HeapError::CorruptedMetadata { .. })
    ));
    assert_eq!(
      heap.check(),
      Err(HeapError::CorruptedMetadata {
        offset: 0,
        header: -2,
        footer: Some(0xdead),
      })
    );
  }

  #[test]
  fn test_foreign_pointer_is_refused() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let mut other = [0u32; 4];
    let foreign = NonNull::from(&mut other[1]).cast::<u8>();
    assert!(matches!(
      unsafe { heap.release(Some(foreign)) },
      Err(HeapError::ForeignPointer { .. })
    ));
  }

  #[test]
  fn test_coalescing_is_order_independent() {
    let layout = |first: usize, second: usize| {
      let mut cells = vec![0u32; 128];
      let mut heap = KnuthHeap::new(&mut cells).unwrap();
      let ptrs = [
        heap.allocate(20).unwrap(),
        heap.allocate(12).unwrap(),
        heap.allocate(8).unwrap(),
      ];
      unsafe {
        heap.release(Some(ptrs[first])).unwrap();
        heap.release(Some(ptrs[second])).unwrap();
      }
      heap.check().unwrap();
      free_list(&heap)
    };

    // 5 + 3 payload words plus one reclaimed header/footer pair.
    let expected = vec![info(0, 10), info(16, 110)];
    assert_eq!(layout(0, 1), expected);
    assert_eq!(layout(1, 0), expected);
  }

  #[test]
  fn test_release_merges_both_sides() {
    let mut cells = vec![0u32; 128];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(8).unwrap();
    let b = heap.allocate(8).unwrap();
    let c = heap.allocate(8).unwrap();
    let _d = heap.allocate(8).unwrap();

    unsafe {
      heap.release(Some(a)).unwrap();
      heap.release(Some(c)).unwrap();
      assert_eq!(free_list(&heap), vec![info(0, 2), info(8, 2), info(16, 110)]);

      heap.release(Some(b)).unwrap();
    }

    assert_eq!(free_list(&heap), vec![info(0, 10), info(16, 110)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_resize_null_and_zero() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = unsafe { heap.resize(None, 8) }.unwrap().unwrap();
    assert_eq!(heap.offset_of(a), Some(1));

    assert_eq!(unsafe { heap.resize(Some(a), 0) }, Ok(None));
    assert_eq!(free_list(&heap), vec![info(0, 62)]);

    assert_eq!(unsafe { heap.resize(None, 0) }, Err(HeapError::InvalidArgument));
  }

  #[test]
  fn test_resize_never_shrinks() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(40).unwrap();
    let before: Vec<_> = heap.chunks().collect();

    assert_eq!(unsafe { heap.resize(Some(a), 4) }, Ok(Some(a)));
    assert_eq!(unsafe { heap.resize(Some(a), 40) }, Ok(Some(a)));
    assert_eq!(heap.chunks().collect::<Vec<_>>(), before);
  }

  #[test]
  fn test_resize_grows_into_right_neighbor() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(16).unwrap();
    unsafe { fill(a, &[1, 2, 3, 4]) };

    let grown = unsafe { heap.resize(Some(a), 64) }.unwrap().unwrap();
    assert_eq!(grown, a);
    assert_eq!(unsafe { read(grown, 4) }, vec![1, 2, 3, 4]);
    assert_eq!(free_list(&heap), vec![info(18, 44)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_resize_grows_into_left_neighbor() {
    let mut cells = vec![0u32; 256];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    let _c = heap.allocate(16).unwrap();
    unsafe {
      fill(b, &[10, 20, 30, 40]);
      heap.release(Some(a)).unwrap();
    }

    // Merged payload is 10 words; granting 6 splits off a 2-word chunk whose
    // tags overlap the old payload.
    let grown = unsafe { heap.resize(Some(b), 24) }.unwrap().unwrap();
    assert_eq!(grown, a);
    assert_eq!(unsafe { read(grown, 4) }, vec![10, 20, 30, 40]);
    assert_eq!(free_list(&heap), vec![info(8, 2), info(18, 236)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_resize_relocates_when_boxed_in() {
    let mut cells = vec![0u32; 256];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(16).unwrap();
    let _b = heap.allocate(16).unwrap();
    unsafe { fill(a, &[7, 8, 9, 10]) };

    let moved = unsafe { heap.resize(Some(a), 160) }.unwrap().unwrap();
    assert_ne!(moved, a);
    assert_eq!(heap.offset_of(moved), Some(13));
    assert_eq!(unsafe { read(moved, 4) }, vec![7, 8, 9, 10]);
    assert_eq!(free_list(&heap), vec![info(0, 4), info(54, 200)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_failed_resize_keeps_original() {
    let mut cells = vec![0u32; 32];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(16).unwrap();
    let _b = heap.allocate(16).unwrap();
    unsafe { fill(a, &[5, 6, 7, 8]) };
    let before: Vec<_> = heap.chunks().collect();

    assert_eq!(
      unsafe { heap.resize(Some(a), 400) },
      Err(HeapError::OutOfMemory { requested: 400 })
    );
    assert_eq!(heap.chunks().collect::<Vec<_>>(), before);
    assert_eq!(unsafe { read(a, 4) }, vec![5, 6, 7, 8]);
    unsafe { heap.release(Some(a)).unwrap() };
    heap.check().unwrap();
  }

  #[test]
  fn test_init_discards_allocations() {
    let mut cells = vec![0u32; 64];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    heap.allocate(8).unwrap();
    heap.allocate(100).unwrap();
    heap.init();

    assert_eq!(free_list(&heap), vec![info(0, 62)]);
  }

  #[test]
  fn test_dump_free_list() {
    let mut cells = vec![0u32; 256];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(16).unwrap();
    heap.allocate(16).unwrap();
    unsafe { heap.release(Some(a)).unwrap() };

    let mut out = String::new();
    heap.dump_free_list(&mut out).unwrap();
    assert_eq!(out, "free list:\n0: size = 4\n12: size = 242\n");
    assert_eq!(heap.free_bytes(), (4 + 242) * 4);
  }

  #[test]
  #[should_panic(expected = "cycle detected")]
  fn test_cyclic_free_list_is_fatal() {
    let mut cells = vec![0u32; 256];
    let mut heap = KnuthHeap::new(&mut cells).unwrap();

    let a = heap.allocate(8).unwrap();
    heap.allocate(8).unwrap();
    unsafe { heap.release(Some(a)).unwrap() };

    // Point the tail of the list back at the root.
    let tail = heap.free_chunks().last().unwrap();
    Chunk(tail.offset).set_next(&mut heap.arena, 0);

    heap.print_free_list();
  }

  mod proptests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Clone, Debug)]
    enum Op {
      Allocate(usize),
      ZeroAllocate(usize),
      Resize(usize, usize),
      Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
      prop_oneof![
        (1usize..200).prop_map(Op::Allocate),
        (1usize..200).prop_map(Op::ZeroAllocate),
        (any::<usize>(), 0usize..300).prop_map(|(i, s)| Op::Resize(i, s)),
        any::<usize>().prop_map(Op::Release),
      ]
    }

    struct Live {
      ptr: NonNull<u8>,
      len: usize,
      tag: u8,
    }

    unsafe fn stamp(live: &Live) {
      unsafe { live.ptr.as_ptr().write_bytes(live.tag, live.len) };
    }

    unsafe fn intact(live: &Live) -> bool {
      let bytes = unsafe { std::slice::from_raw_parts(live.ptr.as_ptr(), live.len) };
      bytes.iter().all(|&b| b == live.tag)
    }

    proptest! {
      #[test]
      fn arena_stays_consistent(ops in proptest::collection::vec(op(), 1..80)) {
        let mut cells = vec![0u32; 1024];
        let mut heap = KnuthHeap::new(&mut cells).unwrap();
        let mut live: Vec<Live> = Vec::new();
        let mut next_tag = 1u8;

        for op in ops {
          match op {
            Op::Allocate(len) | Op::ZeroAllocate(len) => {
              let result = match op {
                Op::Allocate(_) => heap.allocate(len),
                _ => heap.zero_allocate(1, len),
              };
              if let Ok(ptr) = result {
                let entry = Live { ptr, len, tag: next_tag };
                unsafe { stamp(&entry) };
                live.push(entry);
                next_tag = next_tag.wrapping_add(1).max(1);
              } else {
                prop_assert_eq!(result, Err(HeapError::OutOfMemory { requested: len }));
              }
            }
            Op::Resize(i, len) if !live.is_empty() => {
              let i = i % live.len();
              match unsafe { heap.resize(Some(live[i].ptr), len) } {
                Ok(Some(ptr)) => {
                  let kept = Live { ptr, len: live[i].len.min(len), tag: live[i].tag };
                  let preserved = unsafe { intact(&kept) };
                  prop_assert!(preserved, "resize lost data of entry {}", i);
                  live[i].ptr = ptr;
                  live[i].len = len;
                  unsafe { stamp(&live[i]) };
                }
                Ok(None) => {
                  prop_assert_eq!(len, 0);
                  live.swap_remove(i);
                }
                Err(err) => {
                  let out_of_memory = matches!(err, HeapError::OutOfMemory { .. });
                  prop_assert!(out_of_memory, "unexpected resize error: {}", err);
                }
              }
            }
            Op::Release(i) if !live.is_empty() => {
              let entry = live.swap_remove(i % live.len());
              prop_assert_eq!(unsafe { heap.release(Some(entry.ptr)) }, Ok(()));
            }
            _ => {}
          }

          prop_assert_eq!(heap.check(), Ok(()));
          for entry in &live {
            let untouched = unsafe { intact(entry) };
            prop_assert!(untouched, "live allocation with tag {} was overwritten", entry.tag);
          }
        }

        for entry in live.drain(..) {
          prop_assert_eq!(unsafe { heap.release(Some(entry.ptr)) }, Ok(()));
        }
        let all: Vec<_> = heap.free_chunks().collect();
        prop_assert_eq!(all, vec![info(0, 1022)]);
      }

      #[test]
      fn allocate_then_release_round_trips(
        sizes in proptest::collection::vec(1usize..120, 0..12),
        probe in 1usize..400,
      ) {
        let mut cells = vec![0u32; 512];
        let mut heap = KnuthHeap::new(&mut cells).unwrap();
        for size in sizes {
          let _ = heap.allocate(size);
        }

        let largest = heap.largest_free();
        if let Ok(ptr) = heap.allocate(probe) {
          unsafe { heap.release(Some(ptr)).unwrap() };
          prop_assert!(heap.largest_free() >= largest);
        }
        prop_assert_eq!(heap.check(), Ok(()));
      }
    }
  }
}
