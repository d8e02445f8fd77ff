#![allow(clippy::missing_safety_doc)]

use core::{
  fmt::Write,
  ptr::{NonNull, null_mut},
};

#[cfg(feature = "c_api")]
use core::{
  cell::UnsafeCell,
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

// =============================================================================
// Constants
// =============================================================================

/// Bytes per heap block. Every allocation is granted in whole blocks.
pub const BLOCK_SIZE: usize = 64;

/// Number of blocks backing one pool.
pub const BLOCK_COUNT: usize = 16;

/// Total arena bytes.
pub const HEAP_SIZE: usize = BLOCK_COUNT * BLOCK_SIZE;

/// Sentinel for an absent chain link.
const NIL: usize = usize::MAX;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(BLOCK_SIZE > 0);
const _: () = assert!(BLOCK_COUNT > 2); // Fewer blocks leaves no room to exercise runs.
const _: () = assert!(HEAP_SIZE == BLOCK_COUNT * BLOCK_SIZE);
const _: () = assert!(BLOCK_COUNT < NIL);

// =============================================================================
// Types
// =============================================================================

/// Bookkeeping record for one heap block.
///
/// The descriptor's `address` is assigned once when the pool is built and
/// never changes. Only chain membership (`prev`/`next`) and `run_length`
/// change over the pool's lifetime; descriptors themselves are never moved
/// or reallocated.
struct BlockDesc {
  /// First byte of the block inside the arena.
  address: *mut u8,
  /// Number of blocks in the allocated run this descriptor heads.
  /// Zero for free blocks and for non-head members of a run.
  run_length: u32,
  /// Index of the previous chain member, or `NIL`.
  prev: usize,
  /// Index of the next chain member, or `NIL`.
  next: usize,
}

impl BlockDesc {
  const EMPTY: BlockDesc = BlockDesc {
    address: null_mut(),
    run_length: 0,
    prev: NIL,
    next: NIL,
  };
}

/// Two blocks are contiguous when `right` starts exactly where `left` ends.
#[inline]
fn are_contiguous(left: &BlockDesc, right: &BlockDesc) -> bool {
  let left_addr = left.address as usize;
  let right_addr = right.address as usize;
  left_addr < right_addr && left_addr + BLOCK_SIZE == right_addr
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Ordered Chain
// =============================================================================

/// Doubly linked, address-ascending chain over the pool's descriptor array.
///
/// The chain owns no storage. It holds head/tail indices into the array and
/// threads membership through each descriptor's `prev`/`next` links, so a
/// descriptor can only ever belong to one chain at a time.
struct Chain {
  head: usize,
  tail: usize,
}

impl Chain {
  const fn new() -> Self {
    Chain {
      head: NIL,
      tail: NIL,
    }
  }

  /// Number of member descriptors. Full traversal; the chains are
  /// bookkeeping structures, not a hot path.
  fn len(&self, blocks: &[BlockDesc]) -> usize {
    let mut count = 0;
    let mut cur = self.head;
    while cur != NIL {
      count += 1;
      cur = blocks[cur].next;
    }
    count
  }

  /// True when `idx` is reachable from the chain head.
  fn contains(&self, blocks: &[BlockDesc], idx: usize) -> bool {
    let mut cur = self.head;
    while cur != NIL {
      if cur == idx {
        return true;
      }
      cur = blocks[cur].next;
    }
    false
  }

  /// Range lookup: the member whose block covers `addr`, if any.
  ///
  /// A block covers every byte in `[address, address + BLOCK_SIZE)`, so an
  /// arbitrary pointer into a block resolves to that block's descriptor.
  /// Ascending order lets the walk stop at the first member past `addr`.
  fn find_by_address(&self, blocks: &[BlockDesc], addr: *const u8) -> Option<usize> {
    let target = addr as usize;
    let mut cur = self.head;
    while cur != NIL {
      let base = blocks[cur].address as usize;
      if target < base {
        return None;
      }
      if target < base + BLOCK_SIZE {
        return Some(cur);
      }
      cur = blocks[cur].next;
    }
    None
  }

  /// Length of the unbroken contiguous run starting at member `start`,
  /// following `next`, capped at `limit`.
  fn contiguous_run_length(&self, blocks: &[BlockDesc], start: usize, limit: usize) -> usize {
    if limit == 0 {
      return 0;
    }
    let mut count = 1;
    let mut cur = start;
    while count < limit {
      let next = blocks[cur].next;
      if next == NIL || !are_contiguous(&blocks[cur], &blocks[next]) {
        break;
      }
      cur = next;
      count += 1;
    }
    count
  }

  /// Insert an internally linked, contiguous, ascending run at its ordered
  /// position.
  ///
  /// Preconditions: none of the run's descriptors are chain members, the run
  /// is NIL-terminated at both ends, and its addresses do not overlap any
  /// member's.
  fn splice_in(&mut self, blocks: &mut [BlockDesc], run_head: usize) {
    let mut run_tail = run_head;
    while blocks[run_tail].next != NIL {
      run_tail = blocks[run_tail].next;
    }
    let run_lo = blocks[run_head].address as usize;
    let run_hi = blocks[run_tail].address as usize;

    if self.head == NIL {
      self.head = run_head;
      self.tail = run_tail;
      return;
    }

    let head_addr = blocks[self.head].address as usize;
    let tail_addr = blocks[self.tail].address as usize;

    if run_hi < head_addr {
      blocks[run_tail].next = self.head;
      blocks[self.head].prev = run_tail;
      self.head = run_head;
      return;
    }

    if run_lo > tail_addr {
      blocks[run_head].prev = self.tail;
      blocks[self.tail].next = run_head;
      self.tail = run_tail;
      return;
    }

    // Interior insert. Uniform block size makes address distance a fair
    // proxy for walk distance, so scan from the nearer end.
    if run_lo - head_addr <= tail_addr - run_hi {
      let mut after = self.head;
      while (blocks[after].address as usize) < run_lo {
        after = blocks[after].next;
      }
      let before = blocks[after].prev;
      blocks[before].next = run_head;
      blocks[run_head].prev = before;
      blocks[run_tail].next = after;
      blocks[after].prev = run_tail;
    } else {
      let mut before = self.tail;
      while (blocks[before].address as usize) > run_hi {
        before = blocks[before].prev;
      }
      let after = blocks[before].next;
      blocks[before].next = run_head;
      blocks[run_head].prev = before;
      blocks[run_tail].next = after;
      blocks[after].prev = run_tail;
    }
  }

  /// Detach up to `max_count` descriptors starting at member `run_head`,
  /// following `next` while successive blocks stay address-contiguous.
  ///
  /// The detached run keeps its internal links and is NIL-terminated at both
  /// ends. Returns the number actually removed, which is less than
  /// `max_count` when the chain ends or contiguity breaks first.
  fn splice_out(&mut self, blocks: &mut [BlockDesc], run_head: usize, max_count: usize) -> usize {
    debug_assert!(self.contains(blocks, run_head));
    if max_count == 0 {
      return 0;
    }

    let mut run_tail = run_head;
    let mut count = 1;
    while count < max_count {
      let next = blocks[run_tail].next;
      if next == NIL || !are_contiguous(&blocks[run_tail], &blocks[next]) {
        break;
      }
      run_tail = next;
      count += 1;
    }

    let before = blocks[run_head].prev;
    let after = blocks[run_tail].next;
    if before == NIL {
      self.head = after;
    } else {
      blocks[before].next = after;
    }
    if after == NIL {
      self.tail = before;
    } else {
      blocks[after].prev = before;
    }
    blocks[run_head].prev = NIL;
    blocks[run_tail].next = NIL;

    count
  }
}

// =============================================================================
// Block Pool
// =============================================================================

/// A fixed arena of `BLOCK_COUNT` blocks with self-contained bookkeeping.
///
/// Every descriptor lives in the pool's fixed array and is always a member
/// of exactly one of the two chains. Allocation and release move runs of
/// descriptors between the chains; arena bytes are never touched.
///
/// Operations take `&mut self`, so a pool is single-threaded by
/// construction. Wrap it in a lock to share it.
pub struct BlockPool {
  base: *mut u8,
  blocks: [BlockDesc; BLOCK_COUNT],
  free_chain: Chain,
  used_chain: Chain,
}

impl BlockPool {
  /// Map the arena and place every block on the free chain in ascending
  /// address order.
  ///
  /// Panics when the arena cannot be mapped; a pool without backing memory
  /// has no degraded mode worth running in.
  pub fn new() -> Self {
    let base = unsafe { os_mmap(HEAP_SIZE) };
    if base.is_null() {
      panic!("heap arena mmap failed");
    }

    let mut blocks = [BlockDesc::EMPTY; BLOCK_COUNT];
    for (i, block) in blocks.iter_mut().enumerate() {
      block.address = unsafe { base.add(i * BLOCK_SIZE) };
      block.prev = if i == 0 { NIL } else { i - 1 };
      block.next = if i + 1 == BLOCK_COUNT { NIL } else { i + 1 };
    }
    debug_assert_eq!(
      blocks[BLOCK_COUNT - 1].address as usize + BLOCK_SIZE,
      base as usize + HEAP_SIZE
    );

    BlockPool {
      base,
      blocks,
      free_chain: Chain {
        head: 0,
        tail: BLOCK_COUNT - 1,
      },
      used_chain: Chain::new(),
    }
  }

  /// Allocate `size` contiguous bytes, rounded up to whole blocks.
  ///
  /// First fit over the address-ordered free chain: the lowest free run of
  /// at least `blocks_needed(size)` contiguous blocks wins. Returns `None`
  /// for a zero-size request or when no single free run is long enough,
  /// even if the total free bytes would cover the request.
  pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }
    let needed = blocks_needed(size);

    let mut candidate = self.free_chain.head;
    while candidate != NIL {
      if self.free_chain.contiguous_run_length(&self.blocks, candidate, needed) >= needed {
        break;
      }
      candidate = self.blocks[candidate].next;
    }
    if candidate == NIL {
      return None;
    }

    let detached = self.free_chain.splice_out(&mut self.blocks, candidate, needed);
    debug_assert_eq!(detached, needed);
    self.blocks[candidate].run_length = needed as u32;
    self.used_chain.splice_in(&mut self.blocks, candidate);

    NonNull::new(self.blocks[candidate].address)
  }

  /// Release the run headed by the block that covers `ptr`.
  ///
  /// Returns `false` without touching any state when `ptr` is null, falls
  /// outside every used block (unallocated, already released, or foreign),
  /// or resolves to a non-head member of a run. The whole run is freed
  /// atomically; partial release is not a thing.
  pub fn release(&mut self, ptr: *mut u8) -> bool {
    if ptr.is_null() {
      return false;
    }
    let Some(head) = self.used_chain.find_by_address(&self.blocks, ptr) else {
      return false;
    };
    let run = self.blocks[head].run_length as usize;
    if run == 0 {
      return false;
    }

    let detached = self.used_chain.splice_out(&mut self.blocks, head, run);
    debug_assert_eq!(detached, run);
    self.blocks[head].run_length = 0;
    self.free_chain.splice_in(&mut self.blocks, head);

    true
  }

  /// Free bytes remaining in the pool.
  pub fn available(&self) -> usize {
    self.free_chain.len(&self.blocks) * BLOCK_SIZE
  }

  /// Bytes currently handed out.
  pub fn used(&self) -> usize {
    self.used_chain.len(&self.blocks) * BLOCK_SIZE
  }

  /// True when `ptr` falls inside the arena.
  pub fn is_valid_address(&self, ptr: *const u8) -> bool {
    let base = self.base as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + HEAP_SIZE
  }

  /// First byte of the arena.
  pub fn arena_base(&self) -> *const u8 {
    self.base
  }
}

impl Drop for BlockPool {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base, HEAP_SIZE) };
  }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Selector for the two bookkeeping chains.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChainKind {
  Free,
  Used,
}

impl BlockPool {
  fn chain(&self, kind: ChainKind) -> &Chain {
    match kind {
      ChainKind::Free => &self.free_chain,
      ChainKind::Used => &self.used_chain,
    }
  }

  /// Number of blocks currently on the given chain.
  pub fn chain_len(&self, kind: ChainKind) -> usize {
    self.chain(kind).len(&self.blocks)
  }

  /// True when the block covering `ptr` is a member of the given chain.
  pub fn chain_contains(&self, kind: ChainKind, ptr: *const u8) -> bool {
    self.chain(kind).find_by_address(&self.blocks, ptr).is_some()
  }

  /// Base address of the chain member block covering `ptr`, if any.
  pub fn find_block(&self, kind: ChainKind, ptr: *const u8) -> Option<NonNull<u8>> {
    let idx = self.chain(kind).find_by_address(&self.blocks, ptr)?;
    NonNull::new(self.blocks[idx].address)
  }

  /// Render a chain in forward (ascending address) order:
  ///
  /// ```text
  /// free list:
  ///   0x559cd4da1040->0x559cd4da1060->NULL
  /// ```
  pub fn dump_chain(&self, kind: ChainKind, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title}:");
    let _ = write!(out, "  ");
    let mut cur = self.chain(kind).head;
    while cur != NIL {
      let _ = write!(out, "{:p}->", self.blocks[cur].address);
      cur = self.blocks[cur].next;
    }
    let _ = write!(out, "NULL");
    out
  }

  /// Render a chain in reverse order, walking `prev` from the tail. Same
  /// format as [`BlockPool::dump_chain`].
  pub fn dump_chain_reverse(&self, kind: ChainKind, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title}:");
    let _ = write!(out, "  ");
    let mut cur = self.chain(kind).tail;
    while cur != NIL {
      let _ = write!(out, "{:p}->", self.blocks[cur].address);
      cur = self.blocks[cur].prev;
    }
    let _ = write!(out, "NULL");
    out
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
struct SpinLock {
  locked: AtomicBool,
}

#[cfg(feature = "c_api")]
impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// The process-wide pool behind the C surface. `None` until
/// `memory_initialize` runs.
#[cfg(feature = "c_api")]
struct GlobalPool {
  lock: SpinLock,
  slot: UnsafeCell<Option<BlockPool>>,
}

#[cfg(feature = "c_api")]
unsafe impl Sync for GlobalPool {}

#[cfg(feature = "c_api")]
static POOL: GlobalPool = GlobalPool {
  lock: SpinLock::new(),
  slot: UnsafeCell::new(None),
};

#[cfg(feature = "c_api")]
fn with_pool<R>(f: impl FnOnce(&mut Option<BlockPool>) -> R) -> R {
  POOL.lock.lock();
  let result = f(unsafe { &mut *POOL.slot.get() });
  POOL.lock.unlock();
  result
}

/// Build the global pool. Calling this again replaces the pool wholesale;
/// pointers handed out by the previous pool go stale.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn memory_initialize() {
  with_pool(|slot| *slot = Some(BlockPool::new()));
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memory_allocate(size: usize) -> *mut u8 {
  with_pool(|slot| match slot.as_mut() {
    Some(pool) => pool.allocate(size).map_or(null_mut(), |p| p.as_ptr()),
    None => null_mut(),
  })
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memory_release(ptr: *mut u8) -> bool {
  with_pool(|slot| slot.as_mut().is_some_and(|pool| pool.release(ptr)))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn memory_available() -> usize {
  with_pool(|slot| slot.as_ref().map_or(0, |pool| pool.available()))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn memory_used() -> usize {
  with_pool(|slot| slot.as_ref().map_or(0, |pool| pool.used()))
}

// =============================================================================
// Utils
// =============================================================================

/// Number of whole blocks required to cover a request of `size` bytes.
#[inline(always)]
const fn blocks_needed(size: usize) -> usize {
  size.div_ceil(BLOCK_SIZE)
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(all(test, feature = "c_api"))]
mod c_api_tests {
  use super::*;

  #[test]
  fn c_surface_round_trip() {
    assert_eq!(memory_available(), 0);

    memory_initialize();
    assert_eq!(memory_available(), HEAP_SIZE);
    assert_eq!(memory_used(), 0);

    let ptr = unsafe { memory_allocate(BLOCK_SIZE + 1) };
    assert!(!ptr.is_null());
    assert_eq!(memory_used(), 2 * BLOCK_SIZE);

    assert!(unsafe { memory_release(ptr) });
    assert!(!unsafe { memory_release(ptr) });
    assert_eq!(memory_used(), 0);
    assert_eq!(memory_available(), HEAP_SIZE);

    assert!(unsafe { memory_allocate(0) }.is_null());
  }
}
