use std::ptr::NonNull;

use knuthalloc::{Heap, HeapConfig, KnuthHeap};
#[cfg(unix)]
use knuthalloc::{Instrumented, MonotonicClock};

/// Prints the word offset and free-list state after each step.
fn show(
  label: &str,
  heap: &KnuthHeap,
  ptr: Option<NonNull<u8>>,
) {
  match ptr.and_then(|p| heap.offset_of(p)) {
    Some(offset) => println!("\n[{label}] payload at word {offset}"),
    None => println!("\n[{label}]"),
  }
  heap.print_free_list();
}

/// Linear congruential generator with the constants from Numerical Recipes.
struct Lcg(u32);

impl Lcg {
  fn next(&mut self) -> u32 {
    self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
    self.0 >> 8
  }

  fn range(
    &mut self,
    lo: u32,
    hi: u32,
  ) -> u32 {
    self.next() % (hi + 1 - lo) + lo
  }
}

/// `actions` equal allocations, then releases them all.
fn bench_fixed(
  heap: &mut impl Heap,
  size: usize,
  actions: usize,
) {
  let ptrs: Vec<_> = (0..actions).map(|_| heap.allocate(size).ok()).collect();

  for ptr in ptrs {
    let _ = unsafe { heap.release(ptr) };
  }
}

/// Pushes `actions` random words onto a buffer that doubles through `resize`
/// whenever it fills up, then releases it.
fn bench_vector(
  heap: &mut impl Heap,
  seed: u32,
  actions: usize,
) {
  let mut rng = Lcg(seed);
  let Ok(mut buf) = heap.allocate(4) else {
    return;
  };
  let mut capacity = 1;

  for len in 0..actions {
    if len == capacity {
      match unsafe { heap.resize(Some(buf), capacity * 8) } {
        Ok(Some(grown)) => {
          buf = grown;
          capacity *= 2;
        }
        _ => break,
      }
    }
    unsafe { buf.cast::<u32>().add(len).write(rng.next()) };
  }

  let _ = unsafe { heap.release(Some(buf)) };
}

const SLOTS: usize = 256;

/// Random mix of allocations (sizes in `lo..=hi`) and releases over a table of
/// `SLOTS` live pointers.
fn bench_random(
  heap: &mut impl Heap,
  seed: u32,
  lo: u32,
  hi: u32,
  actions: usize,
) {
  let mut rng = Lcg(seed);
  let mut slots: Vec<Option<NonNull<u8>>> = vec![None; SLOTS];
  let mut live = 0;

  for _ in 0..actions {
    let grow = rng.next() % 2 == 0 || live == 0;

    if grow && live < SLOTS {
      let size = rng.range(lo, hi).max(1) as usize;
      if let Ok(ptr) = heap.allocate(size) {
        if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
          *slot = Some(ptr);
          live += 1;
        }
      }
    } else if live > 0 {
      let start = rng.next() as usize % SLOTS;
      let idx = (0..SLOTS)
        .map(|i| (start + i) % SLOTS)
        .find(|&i| slots[i].is_some())
        .unwrap_or(start);

      let _ = unsafe { heap.release(slots[idx].take()) };
      live -= 1;
    }
  }

  for slot in slots.iter_mut() {
    let _ = unsafe { heap.release(slot.take()) };
  }
}

fn main() {
  env_logger::init();

  let config = std::env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .map(HeapConfig::new)
    .unwrap_or_default();

  if let Err(err) = config.validate() {
    eprintln!("{err}");
    std::process::exit(2);
  }

  let mut arena = vec![0u32; config.arena_words()];
  let mut heap = match KnuthHeap::new(&mut arena) {
    Ok(heap) => heap,
    Err(err) => {
      eprintln!("{err}");
      std::process::exit(2);
    }
  };

  show("start", &heap, None);

  // --------------------------------------------------------------------
  // 1) Two small allocations split the single free chunk twice.
  // --------------------------------------------------------------------
  let Ok(first) = heap.allocate(16) else {
    eprintln!("arena too small for the walkthrough");
    std::process::exit(2);
  };
  unsafe { first.cast::<u32>().write(0xDEADBEEF) };
  show("1: allocate 16 bytes", &heap, Some(first));

  let second = heap.allocate(16).ok();
  show("1: allocate 16 more bytes", &heap, second);

  // --------------------------------------------------------------------
  // 2) Release the first; it becomes the smallest free chunk and is reused.
  // --------------------------------------------------------------------
  let _ = unsafe { heap.release(Some(first)) };
  show("2: release the first", &heap, None);

  let reused = heap.allocate(12).ok();
  println!(
    "[2] reused the freed chunk? {}",
    if reused == Some(first) { "yes" } else { "no" }
  );

  // --------------------------------------------------------------------
  // 3) Grow the second allocation: its right neighbor is free, so it grows
  //    in place.
  // --------------------------------------------------------------------
  let grown = unsafe { heap.resize(second, 400) }.ok().flatten();
  show("3: resize second to 400 bytes", &heap, grown);

  // --------------------------------------------------------------------
  // 4) A double release is refused, not silently ignored.
  // --------------------------------------------------------------------
  let _ = unsafe { heap.release(grown) };
  if let Err(err) = unsafe { heap.release(grown) } {
    println!("\n[4] second release refused: {err}");
  }
  let _ = unsafe { heap.release(reused) };
  show("4: everything released", &heap, None);

  bench(heap);
}

#[cfg(unix)]
fn bench(heap: KnuthHeap) {
  // --------------------------------------------------------------------
  // 5) Benchmarks, timed with the host monotonic clock (nanoseconds).
  // --------------------------------------------------------------------
  let mut timed = Instrumented::new("knuth", heap, MonotonicClock);

  bench_fixed(&mut timed, 32, 100);
  println!("\n[5] fixed: 100 x 32 bytes\n{timed}");

  timed.reset();
  bench_vector(&mut timed, 0x0bad_cafe, 1_000);
  println!("[5] vector: 1000 pushes through a doubling buffer\n{timed}");

  timed.reset();
  bench_random(&mut timed, 0x1234_5678, 1, 512, 10_000);
  println!("[5] random: 10000 actions, 1..=512 bytes\n{timed}");

  match timed.inner().check() {
    Ok(()) => println!("[5] arena consistent, {} bytes free", timed.inner().free_bytes()),
    Err(err) => println!("[5] arena inconsistent: {err}"),
  }
}

#[cfg(not(unix))]
fn bench(mut heap: KnuthHeap) {
  // --------------------------------------------------------------------
  // 5) No host clock here: run the drivers untimed and check the arena.
  // --------------------------------------------------------------------
  bench_fixed(&mut heap, 32, 100);
  bench_vector(&mut heap, 0x0bad_cafe, 1_000);
  bench_random(&mut heap, 0x1234_5678, 1, 512, 10_000);

  match heap.check() {
    Ok(()) => println!("\n[5] arena consistent, {} bytes free", heap.free_bytes()),
    Err(err) => println!("\n[5] arena inconsistent: {err}"),
  }
}
