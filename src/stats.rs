//! Per-operation timing and outcome counters layered over any [`Heap`].
//!
//! ```text
//!   caller ──► Instrumented ──► start() ─► heap op ─► stop() ──► OpStats
//!                                                                 ├ successes / success_cycles
//!                                                                 └ failures  / failure_cycles
//! ```
//!
//! The heap itself never sees the counter; swapping the backend only changes
//! the `H` parameter.

use std::{fmt, ptr::NonNull};

use crate::{error::HeapError, heap::Heap};

/// A free-running timestamp source, e.g. a hardware cycle counter.
pub trait CycleCounter {
  /// Arms the counter and returns the first timestamp.
  fn start(&mut self) -> u64;

  /// Returns the closing timestamp.
  fn stop(&mut self) -> u64;

  /// Cycles between two timestamps. Override for counters that count down.
  fn elapsed(
    &self,
    start: u64,
    stop: u64,
  ) -> u64 {
    stop.wrapping_sub(start)
  }
}

/// Host monotonic clock, in nanoseconds.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

#[cfg(unix)]
impl MonotonicClock {
  fn now() -> u64 {
    Self::read(libc::CLOCK_MONOTONIC).unwrap_or(0)
  }

  /// Nanoseconds on `clock`, or `None` (logged) if the clock cannot be read.
  fn read(clock: libc::clockid_t) -> Option<u64> {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };

    if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
      log::warn!(
        "clock_gettime({clock}) failed, timing reads as 0: {}",
        std::io::Error::last_os_error()
      );
      return None;
    }

    Some(
      (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64),
    )
  }
}

#[cfg(unix)]
impl CycleCounter for MonotonicClock {
  fn start(&mut self) -> u64 {
    Self::now()
  }

  fn stop(&mut self) -> u64 {
    Self::now()
  }
}

/// The four instrumented operation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
  Allocate,
  ZeroAllocate,
  Resize,
  Release,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpStats {
  pub successes: u64,
  pub failures: u64,
  pub success_cycles: u64,
  pub failure_cycles: u64,
}

impl OpStats {
  pub fn record(
    &mut self,
    ok: bool,
    cycles: u64,
  ) {
    if ok {
      self.successes += 1;
      self.success_cycles = self.success_cycles.saturating_add(cycles);
    } else {
      self.failures += 1;
      self.failure_cycles = self.failure_cycles.saturating_add(cycles);
    }
  }

  /// Mean cycles per successful call; 0 when none were recorded.
  pub fn avg_success(&self) -> u64 {
    self.success_cycles.checked_div(self.successes).unwrap_or(0)
  }

  /// Mean cycles per failed call; 0 when none were recorded.
  pub fn avg_failure(&self) -> u64 {
    self.failure_cycles.checked_div(self.failures).unwrap_or(0)
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub allocate: OpStats,
  pub zero_allocate: OpStats,
  pub resize: OpStats,
  pub release: OpStats,
}

impl HeapStats {
  pub fn op(
    &self,
    op: Op,
  ) -> &OpStats {
    match op {
      Op::Allocate => &self.allocate,
      Op::ZeroAllocate => &self.zero_allocate,
      Op::Resize => &self.resize,
      Op::Release => &self.release,
    }
  }

  fn op_mut(
    &mut self,
    op: Op,
  ) -> &mut OpStats {
    match op {
      Op::Allocate => &mut self.allocate,
      Op::ZeroAllocate => &mut self.zero_allocate,
      Op::Resize => &mut self.resize,
      Op::Release => &mut self.release,
    }
  }
}

impl fmt::Display for HeapStats {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let rows = [
      ("allocate", &self.allocate),
      ("zero_allocate", &self.zero_allocate),
      ("resize", &self.resize),
      ("release", &self.release),
    ];

    writeln!(
      f,
      "{:<14} {:>10} {:>10} {:>12} {:>12}",
      "op", "ok", "failed", "avg ok", "avg failed"
    )?;
    for (name, stats) in rows {
      writeln!(
        f,
        "{:<14} {:>10} {:>10} {:>12} {:>12}",
        name,
        stats.successes,
        stats.failures,
        stats.avg_success(),
        stats.avg_failure()
      )?;
    }
    Ok(())
  }
}

/// Times every call into `heap` with `counter` and tallies the outcome.
///
/// A call counts as failed when it returns `Err`. A resize to zero bytes
/// returns `Ok(None)` and counts as a success.
pub struct Instrumented<H, C> {
  name: &'static str,
  heap: H,
  counter: C,
  stats: HeapStats,
}

impl<H: Heap, C: CycleCounter> Instrumented<H, C> {
  pub fn new(
    name: &'static str,
    heap: H,
    counter: C,
  ) -> Self {
    Self {
      name,
      heap,
      counter,
      stats: HeapStats::default(),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn stats(&self) -> &HeapStats {
    &self.stats
  }

  pub fn inner(&self) -> &H {
    &self.heap
  }

  pub fn into_inner(self) -> H {
    self.heap
  }

  fn timed<T>(
    &mut self,
    op: Op,
    call: impl FnOnce(&mut H) -> Result<T, HeapError>,
  ) -> Result<T, HeapError> {
    let start = self.counter.start();
    let result = call(&mut self.heap);
    let stop = self.counter.stop();

    let cycles = self.counter.elapsed(start, stop);
    self.stats.op_mut(op).record(result.is_ok(), cycles);

    result
  }
}

impl<H: Heap, C: CycleCounter> Heap for Instrumented<H, C> {
  /// Clears the statistics and resets the wrapped heap.
  fn reset(&mut self) {
    self.stats = HeapStats::default();
    self.heap.reset();
    log::debug!("{}: heap and statistics reset", self.name);
  }

  fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    self.timed(Op::Allocate, |heap| heap.allocate(size))
  }

  fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    self.timed(Op::ZeroAllocate, |heap| heap.zero_allocate(count, size))
  }

  unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, HeapError> {
    self.timed(Op::Resize, |heap| unsafe { heap.resize(ptr, size) })
  }

  unsafe fn release(
    &mut self,
    ptr: Option<NonNull<u8>>,
  ) -> Result<(), HeapError> {
    self.timed(Op::Release, |heap| unsafe { heap.release(ptr) })
  }
}

impl<H, C> fmt::Display for Instrumented<H, C> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "allocator: {}", self.name)?;
    write!(f, "{}", self.stats)
  }
}
