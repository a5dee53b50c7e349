use thiserror::Error;

/// Errors reported by heap operations.
///
/// `OutOfMemory` and `InvalidArgument` are ordinary request failures. The
/// `CorruptedMetadata`, `DoubleRelease` and `ForeignPointer` variants mean the
/// caller handed back a pointer the heap cannot trust; the heap refuses the
/// operation and leaves its state untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
  #[error("zero-size request")]
  InvalidArgument,

  #[error("out of memory: no free chunk can hold {requested} bytes")]
  OutOfMemory { requested: usize },

  #[error("corrupted chunk at word {offset}: header {header} does not match footer {footer:?}")]
  CorruptedMetadata {
    offset: u32,
    header: i32,
    /// `None` when the header size points past the end of the arena.
    footer: Option<i32>,
  },

  #[error("chunk at word {offset} is already free")]
  DoubleRelease { offset: u32 },

  #[error("pointer {addr:#x} does not belong to this arena")]
  ForeignPointer { addr: usize },

  #[error("arena of {bytes} bytes cannot hold a single chunk")]
  ArenaTooSmall { bytes: usize },

  #[error("arena of {bytes} bytes exceeds the addressable word range")]
  ArenaTooLarge { bytes: usize },

  #[error("heap inconsistency: {0}")]
  Inconsistent(String),
}

impl HeapError {
  /// True for errors caused by a pointer the heap refused to act on.
  pub fn is_bad_pointer(&self) -> bool {
    matches!(
      self,
      HeapError::CorruptedMetadata { .. } | HeapError::DoubleRelease { .. } | HeapError::ForeignPointer { .. }
    )
  }
}
