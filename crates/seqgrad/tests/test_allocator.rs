//! Integration tests for the per-device buffer pool.

use std::sync::Arc;
use std::thread;

use seqgrad::{DeviceAllocator, DeviceContext, DeviceId, EngineError, ProcessorKind, Tensor};

#[test]
fn test_released_buffer_is_reused() {
    let ctx = DeviceContext::cpu();
    {
        let t = Tensor::zeros(&ctx, &[256]).unwrap();
        t.fill(7.0).unwrap();
    }
    let stats = ctx.allocator().stats();
    assert_eq!(stats.device_allocations, 1);
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.live_buffers, 0);

    // A smaller request fits the cached block and comes back zeroed.
    let t = Tensor::zeros(&ctx, &[200]).unwrap();
    assert_eq!(t.to_vec().unwrap(), vec![0.0; 200]);
    let stats = ctx.allocator().stats();
    assert_eq!(stats.device_allocations, 1);
    assert_eq!(stats.reuses, 1);
    assert_eq!(stats.bytes_reserved, 256 * 4);
}

#[test]
fn test_smallest_cached_block_wins() {
    let pool = DeviceAllocator::new(DeviceId(0), None);
    let small = pool.acquire(100).unwrap();
    let large = pool.acquire(400).unwrap();
    pool.release(small).unwrap();
    pool.release(large).unwrap();
    assert_eq!(pool.stats().bytes_in_use, 0);

    let first = pool.acquire(150).unwrap();
    assert_eq!(pool.stats().bytes_in_use, 400 * 4);
    let second = pool.acquire(50).unwrap();
    assert_eq!(pool.stats().bytes_in_use, 500 * 4);
    assert_eq!(pool.stats().device_allocations, 2);
    assert_eq!(pool.stats().reuses, 2);

    pool.release(first).unwrap();
    pool.release(second).unwrap();
}

#[test]
fn test_stale_handle_is_rejected() {
    let pool = DeviceAllocator::new(DeviceId(1), None);
    let handle = pool.acquire(8).unwrap();
    assert!(pool.is_live(handle));
    pool.release(handle).unwrap();
    assert!(!pool.is_live(handle));
    assert!(matches!(
        pool.release(handle),
        Err(EngineError::DisposedAccess { .. })
    ));

    // The slot is recycled under a new generation.
    let again = pool.acquire(8).unwrap();
    assert_eq!(again.index(), handle.index());
    assert_ne!(again.generation(), handle.generation());
    assert!(!pool.is_live(handle));
}

#[test]
fn test_limit_evicts_cache_before_failing() {
    let ctx = DeviceContext::new(DeviceId(2), ProcessorKind::Accelerator, Some(1024));
    drop(Tensor::zeros(&ctx, &[200]).unwrap());
    assert_eq!(ctx.allocator().stats().bytes_reserved, 800);

    // 250 elements do not fit next to the cached 200, so the cache goes.
    let big = Tensor::zeros(&ctx, &[250]).unwrap();
    let stats = ctx.allocator().stats();
    assert_eq!(stats.device_allocations, 2);
    assert_eq!(stats.bytes_reserved, 1000);

    let err = Tensor::zeros(&ctx, &[100]).unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(matches!(
        err,
        EngineError::OutOfMemory {
            requested: 400,
            reserved: 1000,
            limit: Some(1024),
            ..
        }
    ));

    // Failure leaves the pool usable.
    drop(big);
    assert!(Tensor::zeros(&ctx, &[100]).is_ok());
}

#[test]
fn test_reset_returns_cached_memory_only() {
    let ctx = DeviceContext::cpu();
    let kept = Tensor::zeros(&ctx, &[16]).unwrap();
    drop(Tensor::zeros(&ctx, &[32]).unwrap());
    assert_eq!(ctx.allocator().stats().bytes_reserved, 48 * 4);

    ctx.allocator().reset();
    let stats = ctx.allocator().stats();
    assert_eq!(stats.bytes_reserved, 16 * 4);
    assert_eq!(stats.live_buffers, 1);
    assert_eq!(stats.peak_bytes_reserved, 48 * 4);
    assert_eq!(kept.to_vec().unwrap(), vec![0.0; 16]);
}

#[test]
fn test_views_share_one_block() {
    let ctx = DeviceContext::cpu();
    let t = Tensor::from_vec(&ctx, (0..6).map(|v| v as f32).collect(), &[2, 3]).unwrap();
    let v = t.transpose(0, 1).unwrap();
    assert!(v.shares_buffer_with(&t));
    assert_eq!(ctx.allocator().alias_count(t.buffer_handle()).unwrap(), 2);

    drop(t);
    assert_eq!(ctx.allocator().stats().live_buffers, 1);
    assert_eq!(v.get(&[2, 1]).unwrap(), 5.0);
    drop(v);
    assert_eq!(ctx.allocator().stats().live_buffers, 0);
}

#[test]
fn test_concurrent_acquire_and_release() {
    let pool = Arc::new(DeviceAllocator::new(DeviceId(0), None));
    thread::scope(|s| {
        for worker in 0..4 {
            let pool = Arc::clone(&pool);
            s.spawn(move || {
                for i in 0..100 {
                    let handle = pool.acquire(16 + (worker * 100 + i) % 32).unwrap();
                    pool.release(handle).unwrap();
                }
            });
        }
    });
    let stats = pool.stats();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.bytes_in_use, 0);
    assert_eq!(stats.device_allocations + stats.reuses, 400);
    assert_eq!(stats.releases, 400);
}
