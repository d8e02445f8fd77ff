//! Walkthrough of the pool surface: startup report, one allocate/use/release
//! cycle, chain dumps along the way.

use blockheap::{BLOCK_COUNT, BLOCK_SIZE, BlockPool, ChainKind, HEAP_SIZE};

fn main() {
  let mut pool = BlockPool::new();

  println!("Heap information:");
  println!("  heap size       : {HEAP_SIZE} bytes");
  println!("  block size      : {BLOCK_SIZE} bytes");
  println!("  number of blocks: {BLOCK_COUNT}");
  println!("  start address   : {:p}", pool.arena_base());
  println!("  end address     : {:p}", pool.arena_base().wrapping_add(HEAP_SIZE));
  println!();

  // Room for ten 32-bit integers.
  match pool.allocate(10 * size_of::<u32>()) {
    Some(ptr) => {
      println!("allocated 40 bytes at {:p}", ptr.as_ptr());

      // Safety: ptr heads a freshly allocated block of at least 40 bytes.
      unsafe {
        let ints = ptr.as_ptr() as *mut u32;
        ints.write(10);
        println!("first integer reads back as {}", ints.read());
      }

      println!("{}", pool.dump_chain(ChainKind::Used, "used list"));
      println!(
        "available {} bytes, used {} bytes",
        pool.available(),
        pool.used()
      );

      let released = pool.release(ptr.as_ptr());
      println!("released: {released}");
    }
    None => println!("allocation failed"),
  }

  println!("{}", pool.dump_chain(ChainKind::Free, "free list"));
}
