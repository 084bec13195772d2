//! Use guardmalloc as the global allocator and exercise standard Rust
//! collections. Everything in this test binary, the harness included, lives
//! on guarded pages.

use std::{collections::HashMap, sync::Arc};

use guardmalloc::GuardAlloc;

#[global_allocator]
static GLOBAL: GuardAlloc = GuardAlloc;

#[test]
fn test_box() {
    let b = Box::new(42u64);
    assert_eq!(*b, 42);
    let ctx = guardmalloc::context().unwrap();
    let block = ctx.block(&*b as *const u64 as *const u8).unwrap();
    assert_eq!(block.user_size, 8);
    assert_eq!(block.user_ptr + 8, block.pages_base + (block.page_count - 1) * ctx.page_size());
}

#[test]
fn test_vec_growth_keeps_contents() {
    let mut v = Vec::new();
    for i in 0..20_000u32 {
        v.push(i);
    }
    assert!(v.iter().enumerate().all(|(i, x)| *x == i as u32));
    v.truncate(10);
    v.shrink_to_fit();
    assert_eq!(v, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_string_and_map() {
    let mut map = HashMap::new();
    for i in 0..500 {
        map.insert(format!("key-{i}"), i.to_string());
    }
    assert_eq!(map["key-250"], "250");
    map.retain(|_, v| v.len() < 3);
    assert_eq!(map.len(), 100);
}

#[test]
fn test_zeroed_and_aligned() {
    #[repr(align(256))]
    struct Aligned([u8; 300]);

    let zeroed = vec![0u64; 4096];
    assert!(zeroed.iter().all(|x| *x == 0));
    let a = Box::new(Aligned([1; 300]));
    assert_eq!(&*a as *const Aligned as usize % 256, 0);
    assert_eq!(a.0[299], 1);
}

#[test]
fn test_cross_thread_free() {
    let data: Vec<Arc<Vec<u8>>> = (0..64).map(|i| Arc::new(vec![i as u8; 100 + i])).collect();
    let handles: Vec<_> = data
        .chunks(16)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            std::thread::spawn(move || chunk.iter().map(|v| v.len()).sum::<usize>())
        })
        .collect();
    drop(data);
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, (0..64).map(|i| 100 + i).sum());
}
