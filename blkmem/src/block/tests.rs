use std::sync::Arc;

use rand::{Rng, SeedableRng};

use crate::{
    config::ChunkMemoryConfig,
    diag::{CollectingSink, Severity},
};

use super::*;

fn small_config() -> BlockMemoryConfig {
    BlockMemoryConfig::default().with_chunk(
        ChunkMemoryConfig::default()
            .with_init_chunk_size(4)
            .with_chunk_length_min(0),
    )
}

fn collecting(config: BlockMemoryConfig) -> (BlockMemory, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    (
        BlockMemory::with_diagnostics(config, Diagnostics::new(sink.clone())),
        sink,
    )
}

#[test]
fn alloc_free_restores_mem_used() {
    let mut blk = BlockMemory::new(small_config());
    let keep = blk.alloc(100).unwrap();
    let before = blk.memory_used();
    assert_eq!(before, 104);

    let mut p = Some(blk.alloc(40).unwrap());
    assert_eq!(blk.memory_used(), before + 40);
    blk.check_consistency();
    unsafe { blk.free(&mut p, 40).unwrap() };
    assert_eq!(p, None);
    assert_eq!(blk.memory_used(), before);
    blk.check_consistency();

    unsafe { blk.free(&mut Some(keep), 100).unwrap() };
    assert_eq!(blk.memory_used(), 0);
}

#[test]
fn zero_size_distinct() {
    let mut blk = BlockMemory::new(small_config());
    let a = blk.alloc(0).unwrap();
    let b = blk.alloc(0).unwrap();
    assert_ne!(a, b);
    assert_eq!(blk.memory_used(), 2 * ALIGNMENT);
    unsafe {
        blk.free(&mut Some(a), 0).unwrap();
        blk.free(&mut Some(b), 0).unwrap();
    }
}

#[test]
fn unaligned_and_aligned_free() {
    let mut blk = BlockMemory::new(small_config());
    let a = blk.alloc(5).unwrap();
    let b = blk.alloc(5).unwrap();
    assert_eq!(blk.pointer_size(a.as_ptr()), ALIGNMENT);
    assert_eq!(blk.chunk_memory(5).unwrap().elem_size(), ALIGNMENT);
    assert_eq!(blk.n_pools(), 1);
    unsafe {
        blk.free(&mut Some(a), 5).unwrap();
        blk.free(&mut Some(b), ALIGNMENT).unwrap();
    }
    assert_eq!(blk.memory_used(), 0);
    blk.check_consistency();
}

#[test]
fn hash_collision() {
    let (mut blk, sink) = collecting(small_config());
    let big = 8 + CHKHASH_SIZE * 8;
    assert_eq!(hash_number(align_size(8)), hash_number(align_size(big)));

    let small_ptr = blk.alloc(8).unwrap();
    let big_ptr = blk.alloc(big).unwrap();
    assert_eq!(blk.n_pools(), 2);
    assert_eq!(blk.pointer_size(small_ptr.as_ptr()), 8);
    assert_eq!(blk.pointer_size(big_ptr.as_ptr()), big);
    assert!(blk.chunk_memory(8).unwrap().owns(small_ptr.as_ptr()));
    assert!(!blk.chunk_memory(8).unwrap().owns(big_ptr.as_ptr()));
    blk.check_consistency();

    // no pool of this size at all
    let used = blk.memory_used();
    let stats = blk.chunk_memory(8).unwrap().stats();
    let mut p = Some(small_ptr);
    let err = unsafe { blk.free(&mut p, 16) }.unwrap_err();
    assert_eq!(
        err,
        MemError::SizeMismatch {
            ptr: UsizePtr::from(small_ptr),
            declared: 16,
            actual: if DEBUG_CHECKS { Some(8) } else { None },
        }
    );
    assert_eq!(p, Some(small_ptr));
    assert_eq!(blk.memory_used(), used);
    assert_eq!(blk.chunk_memory(8).unwrap().stats(), stats);
    assert_eq!(sink.take().len(), 1);

    unsafe {
        blk.free(&mut Some(small_ptr), 8).unwrap();
        blk.free(&mut Some(big_ptr), big).unwrap();
    }
    assert_eq!(blk.memory_used(), 0);
    assert!(sink.is_empty());
    blk.check_consistency();
}

#[cfg(debug_assertions)]
#[test]
fn free_with_other_existing_size() {
    let (mut blk, sink) = collecting(small_config());
    let a = blk.alloc(8).unwrap();
    let b = blk.alloc(24).unwrap();
    let used = blk.memory_used();

    assert_eq!(
        unsafe { blk.free(&mut Some(a), 24) },
        Err(MemError::SizeMismatch {
            ptr: UsizePtr::from(a),
            declared: 24,
            actual: Some(8),
        })
    );
    assert_eq!(blk.memory_used(), used);
    blk.check_consistency();

    let mut on_stack = 0u64;
    let foreign = NonNull::from(&mut on_stack).cast::<u8>();
    assert_eq!(
        unsafe { blk.free(&mut Some(foreign), 8) },
        Err(MemError::UnknownPointer {
            ptr: UsizePtr::from(foreign)
        })
    );
    assert_eq!(sink.errors().len(), 2);

    unsafe {
        blk.free(&mut Some(a), 8).unwrap();
        blk.free(&mut Some(b), 24).unwrap();
    }
}

#[test]
fn free_null_pointer() {
    let (mut blk, sink) = collecting(small_config());
    let mut p = None;
    assert_eq!(unsafe { blk.free(&mut p, 0) }, Ok(()));
    assert!(sink.is_empty());
    assert_eq!(unsafe { blk.free(&mut p, 8) }, Err(MemError::NullPointer));
    assert_eq!(unsafe { blk.free_null(&mut p, 8) }, Ok(()));
    assert_eq!(sink.take().len(), 1);
}

#[test]
fn realloc_moves_contents() {
    let mut blk = BlockMemory::new(small_config());
    let p = blk.duplicate(b"abcdefghijklmnop").unwrap();

    // same size class keeps the pointer
    let same = unsafe { blk.realloc(Some(p), 16, 13).unwrap() };
    assert_eq!(same, p);

    let grown = unsafe { blk.realloc(Some(p), 16, 40).unwrap() };
    assert_ne!(grown, p);
    assert_eq!(
        unsafe { std::slice::from_raw_parts(grown.as_ptr(), 16) },
        b"abcdefghijklmnop"
    );
    assert_eq!(blk.memory_used(), 40);
    assert_eq!(blk.chunk_memory(16).unwrap().stats().n_used, 0);

    let shrunk = unsafe { blk.realloc(Some(grown), 40, 4).unwrap() };
    assert_eq!(
        unsafe { std::slice::from_raw_parts(shrunk.as_ptr(), ALIGNMENT) },
        &b"abcdefghijklmnop"[..ALIGNMENT]
    );
    assert_eq!(blk.memory_used(), ALIGNMENT);
    blk.check_consistency();

    let fresh = unsafe { blk.realloc_array(None, 0, 3, 8).unwrap() };
    assert_eq!(blk.pointer_size(fresh.as_ptr()), 24);
    unsafe {
        blk.free(&mut Some(shrunk), 4).unwrap();
        blk.free(&mut Some(fresh), 24).unwrap();
    }
}

#[cfg(debug_assertions)]
#[test]
fn failed_realloc_keeps_old() {
    let (mut blk, sink) = collecting(small_config());
    let p = blk.duplicate(&[7u8; 32]).unwrap();
    let used = blk.memory_used();

    assert!(unsafe { blk.realloc(Some(p), 32, MAX_ALLOC_SIZE + 1) }.is_err());
    assert_eq!(blk.memory_used(), used);
    assert_eq!(unsafe { std::slice::from_raw_parts(p.as_ptr(), 32) }, &[7u8; 32]);

    // wrong old size is caught before anything is allocated
    assert!(unsafe { blk.realloc(Some(p), 8, 64) }.is_err());
    assert_eq!(blk.memory_used(), used);
    assert!(blk.chunk_memory(64).is_none());
    assert_eq!(sink.errors().len(), 2);

    unsafe { blk.free(&mut Some(p), 32).unwrap() };
}

#[test]
fn duplicate_array_distinct() {
    let mut blk = BlockMemory::new(small_config());
    let src = [1.5f64, 2.5, 3.5];
    let p = blk.duplicate_array(&src).unwrap();
    assert_ne!(p.as_ptr() as *const f64, src.as_ptr());
    assert_eq!(unsafe { std::slice::from_raw_parts(p.as_ptr(), 3) }, &src);
    assert_eq!(blk.memory_used(), 24);
    unsafe { blk.free(&mut Some(p.cast()), 24).unwrap() };
}

#[test]
fn alloc_clear_array_zeroes_reused_slot() {
    let mut blk = BlockMemory::new(small_config());
    let p = blk.alloc_array(4, 8).unwrap();
    unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 32) };
    unsafe { blk.free(&mut Some(p), 32).unwrap() };

    let q = blk.alloc_clear_array(4, 8).unwrap();
    assert_eq!(q, p);
    assert!(unsafe { std::slice::from_raw_parts(q.as_ptr(), 32) }
        .iter()
        .all(|&b| b == 0));
    unsafe { blk.free(&mut Some(q), 32).unwrap() };
}

#[cfg(debug_assertions)]
#[test]
fn array_size_overflow() {
    let (mut blk, sink) = collecting(small_config());
    assert!(matches!(
        blk.alloc_array(usize::MAX / 2, 4),
        Err(MemError::ArrayOverflow { .. })
    ));
    assert!(matches!(
        blk.alloc(MAX_ALLOC_SIZE + 1),
        Err(MemError::SizeExceeded { .. })
    ));
    assert_eq!(blk.n_pools(), 0);
    assert_eq!(sink.errors().len(), 2);
}

#[test]
fn garbage_collect_drops_empty_pools() {
    let mut blk = BlockMemory::new(small_config());
    let a = blk.alloc(16).unwrap();
    let b = blk.alloc(32).unwrap();
    unsafe { blk.free(&mut Some(a), 16).unwrap() };
    assert_eq!(blk.n_pools(), 2);

    blk.garbage_collect();
    assert_eq!(blk.n_pools(), 1);
    assert!(blk.chunk_memory(16).is_none());
    assert!(blk.chunk_memory(32).is_some());
    blk.check_consistency();

    unsafe { blk.free(&mut Some(b), 32).unwrap() };
    blk.garbage_collect();
    assert_eq!(blk.n_pools(), 0);
}

#[test]
fn clear_twice() {
    let mut blk = BlockMemory::new(small_config());
    for size in [8, 16, 24, 1000] {
        blk.alloc(size).unwrap();
    }
    blk.clear();
    assert_eq!(blk.memory_used(), 0);
    assert_eq!(blk.n_pools(), 0);
    blk.clear();
    assert_eq!(blk.memory_used(), 0);
    assert_eq!(blk.n_pools(), 0);
    blk.check_consistency();

    // still usable
    let p = blk.alloc(8).unwrap();
    unsafe { blk.free(&mut Some(p), 8).unwrap() };
}

#[test]
fn display_table() {
    let mut blk = BlockMemory::new(small_config());
    let line = line!() + 1;
    let ptrs = (0..3).map(|_| blk.alloc(16).unwrap()).collect::<Vec<_>>();

    let mut out = String::new();
    blk.display(&mut out).unwrap();
    let lines = out.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with(" ElSize #Chunk #Eag"));
    assert_eq!(
        lines[1],
        format!(
            "     16      1    0       4       0       1     0    0  25.0%    0.0 {}:{}",
            file!(),
            line
        )
    );
    assert_eq!(
        lines[2],
        "  Total      1    0       4       0       1     0    0  25.0%    0.0"
    );
    assert_eq!(
        lines[3],
        "1 blocks (0 unused), 64 bytes allocated, 16 bytes free (25.0%)"
    );

    for p in ptrs {
        unsafe { blk.free(&mut Some(p), 16).unwrap() };
    }
    blk.chunk_memory(16).unwrap().check_consistency();
    let mut out = String::new();
    blk.display(&mut out).unwrap();
    assert!(out.contains("100.0%"));
}

#[test]
fn display_unused_pool() {
    // collection on the free path clears the unused pool, but the block keeps it
    let config = BlockMemoryConfig::default().with_chunk(
        ChunkMemoryConfig::default()
            .with_init_chunk_size(4)
            .with_chunk_length_min(0)
            .with_garbage_factor(0.0)
            .with_garbage_size(1),
    );
    let mut blk = BlockMemory::new(config);
    let line = line!() + 1;
    let p = blk.alloc(16).unwrap();
    unsafe { blk.free(&mut Some(p), 16).unwrap() };
    assert_eq!(blk.n_pools(), 1);
    assert_eq!(blk.chunk_memory(16).unwrap().n_chunks(), 0);

    let mut out = String::new();
    blk.display(&mut out).unwrap();
    let lines = out.lines().collect::<Vec<_>>();
    assert_eq!(
        lines[1],
        format!(
            "     16 <unused>                                0    0        {}:{}",
            file!(),
            line
        )
    );
    assert_eq!(
        lines[2],
        "  Total      0    0       0       0       0     0    0   0.0%    0.0"
    );
    assert_eq!(
        lines[3],
        "1 blocks (1 unused), 0 bytes allocated, 0 bytes free"
    );

    blk.garbage_collect();
    assert_eq!(blk.n_pools(), 0);
}

#[test]
fn check_empty_lists_leaks() {
    let (mut blk, sink) = collecting(small_config());
    let line = line!() + 1;
    let a = blk.alloc(16).unwrap();
    let b = blk.alloc(16).unwrap();
    let c = blk.alloc(48).unwrap();
    unsafe { blk.free(&mut Some(b), 16).unwrap() };

    let report = blk.check_empty();
    assert_eq!(report.total_bytes, 16 + 48);
    assert_eq!(report.classes.len(), 2);
    let leak16 = report.classes.iter().find(|l| l.elem_size == 16).unwrap();
    assert_eq!(leak16.count, 1);
    assert_eq!(leak16.bytes, 16);
    assert_eq!(leak16.site.line, line);
    assert_eq!(leak16.site.file, file!());

    let errors = sink.errors();
    assert_eq!(errors.len(), 2);
    assert!(errors.contains(&MemError::Leaked { bytes: 16, count: 1 }));
    assert!(errors.contains(&MemError::Leaked { bytes: 48, count: 1 }));

    let diags = sink.take();
    assert_eq!(diags.len(), 3);
    assert!(diags[..2].iter().all(|d| d.severity == Severity::Warning));
    assert!(diags[..2].iter().any(|d| d.message
        == format!(
            "16 bytes (1 elements of size 16) not freed. First Allocator: {}:{}",
            file!(),
            line
        )));
    assert_eq!(diags[2].message, "64 bytes not freed in total.");

    unsafe {
        blk.free(&mut Some(a), 16).unwrap();
        blk.free(&mut Some(c), 48).unwrap();
    }
    assert!(blk.check_empty().is_empty());
    assert!(sink.is_empty());
}

#[test]
fn drop_warns_on_leak() {
    let sink = Arc::new(CollectingSink::new());
    {
        let mut blk = BlockMemory::with_diagnostics(small_config(), Diagnostics::new(sink.clone()));
        blk.alloc(64).unwrap();
    }
    let diags = sink.take();
    assert_eq!(diags[0].severity, Severity::Warning);
    assert_eq!(
        diags[0].message,
        "Block memory destroyed with elements not freed."
    );
    assert!(diags.iter().any(|d| d.message == "64 bytes not freed in total."));

    {
        let mut blk = BlockMemory::with_diagnostics(small_config(), Diagnostics::new(sink.clone()));
        let p = blk.alloc(64).unwrap();
        unsafe { blk.free(&mut Some(p), 64).unwrap() };
    }
    assert!(sink.is_empty());
}

#[test]
fn many_sizes_stay_consistent() {
    let mut blk = BlockMemory::new(small_config().with_garbage_factor(1.0));
    let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(0);
    let mut live = Vec::new();
    for _ in 0..2000 {
        if live.is_empty() || rng.gen_range(0..3) != 0 {
            let size = rng.gen_range(1..=300);
            live.push((blk.alloc(size).unwrap(), size));
        } else {
            let (p, size) = live.swap_remove(rng.gen_range(0..live.len()));
            unsafe { blk.free(&mut Some(p), size).unwrap() };
        }
        if live.len() % 256 == 0 {
            blk.check_consistency();
        }
    }
    blk.check_consistency();
    let expected = live.iter().map(|(_, s)| align_size(*s)).sum::<usize>();
    assert_eq!(blk.memory_used(), expected);
    for (p, size) in live.drain(..) {
        assert_eq!(blk.pointer_size(p.as_ptr()), align_size(size));
        unsafe { blk.free(&mut Some(p), size).unwrap() };
    }
    assert_eq!(blk.memory_used(), 0);
    blk.garbage_collect();
    assert_eq!(blk.n_pools(), 0);
}
