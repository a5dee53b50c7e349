use std::ptr::NonNull;

use crate::error::HeapError;

/// The classic four-operation allocator contract.
///
/// Backends implement this so that a selection or instrumentation layer can
/// drive any of them without knowing their internals.
pub trait Heap {
  /// Discards every allocation and returns the backend to its initial state.
  fn reset(&mut self);

  /// Allocates at least `size` bytes.
  fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError>;

  /// Allocates `count * size` bytes, all zero.
  fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError>;

  /// Grows the allocation at `ptr` to hold `size` bytes, preserving its
  /// contents. A `None` pointer allocates; a zero size releases and returns
  /// `None`.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this heap and not released since. On
  /// success the old pointer must no longer be used.
  unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, HeapError>;

  /// Returns the allocation at `ptr` to the heap. `None` is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this heap and not released since.
  unsafe fn release(
    &mut self,
    ptr: Option<NonNull<u8>>,
  ) -> Result<(), HeapError>;
}

impl<H: Heap + ?Sized> Heap for Box<H> {
  fn reset(&mut self) {
    (**self).reset()
  }

  fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    (**self).allocate(size)
  }

  fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    (**self).zero_allocate(count, size)
  }

  unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, HeapError> {
    unsafe { (**self).resize(ptr, size) }
  }

  unsafe fn release(
    &mut self,
    ptr: Option<NonNull<u8>>,
  ) -> Result<(), HeapError> {
    unsafe { (**self).release(ptr) }
  }
}
