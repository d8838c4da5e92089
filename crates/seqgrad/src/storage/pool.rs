//! Per-device buffer pool.
//!
//! Blocks released by tensors go back to a free list keyed by capacity and
//! are handed out again for any request they can hold. Device memory is
//! only given back on [`DeviceAllocator::reset`] or when the pool drops.
//!
//! Live blocks sit in a slot arena. A [`BufferHandle`] names a slot plus the
//! generation it was issued for; once the last alias releases the block the
//! generation moves on and old handles fail with `DisposedAccess`.
//!
//! Kernels run outside the pool lock: the output block is checked out of
//! its slot for the duration and inputs are read through shared snapshots.
//! Writing a block that a kernel is still reading copies it first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use smallvec::SmallVec;

use crate::device::DeviceId;
use crate::error::EngineError;

/// Bytes per stored element. Values are held as `f32` whatever the tensor dtype.
const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

/// Handle to a live block in a [`DeviceAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}v{}", self.index, self.generation)
    }
}

/// Allocation counters of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Blocks obtained from the device rather than the free list.
    pub device_allocations: u64,
    /// Requests served from the free list.
    pub reuses: u64,
    /// Blocks returned to the free list.
    pub releases: u64,
    /// Bytes held by live blocks.
    pub bytes_in_use: usize,
    /// Bytes obtained from the device (live + cached).
    pub bytes_reserved: usize,
    pub peak_bytes_reserved: usize,
    pub live_buffers: usize,
}

struct LiveBlock {
    data: Arc<Vec<f32>>,
    len: usize,
    aliases: usize,
    /// Held by a running kernel as its output.
    checked_out: bool,
}

impl LiveBlock {
    fn new(data: Vec<f32>, len: usize) -> Self {
        Self {
            data: Arc::new(data),
            len,
            aliases: 1,
            checked_out: false,
        }
    }
}

struct Slot {
    generation: u32,
    block: Option<LiveBlock>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    free_blocks: BTreeMap<usize, Vec<Vec<f32>>>,
    stats: AllocatorStats,
}

impl PoolState {
    fn live(&self, handle: BufferHandle) -> Result<&LiveBlock, EngineError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.block.as_ref())
            .ok_or_else(|| stale(handle))
    }

    fn live_mut(&mut self, handle: BufferHandle) -> Result<&mut LiveBlock, EngineError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.block.as_mut())
            .ok_or_else(|| stale(handle))
    }

    /// Shared view of a block that no kernel is writing.
    fn snapshot(&self, handle: BufferHandle) -> Result<(Arc<Vec<f32>>, usize), EngineError> {
        let block = self.live(handle)?;
        if block.checked_out {
            return Err(busy(handle));
        }
        Ok((Arc::clone(&block.data), block.len))
    }

    /// Smallest cached block holding at least `elements`.
    fn take_free_block(&mut self, elements: usize) -> Option<Vec<f32>> {
        let capacity = *self.free_blocks.range(elements..).next()?.0;
        let list = self.free_blocks.get_mut(&capacity)?;
        let block = list.pop();
        if list.is_empty() {
            self.free_blocks.remove(&capacity);
        }
        block
    }

    /// Drop cached blocks, largest first, until `needed` more bytes fit under `limit`.
    fn evict_until_fits(&mut self, needed: usize, limit: usize) {
        while self.stats.bytes_reserved + needed > limit {
            let Some(mut entry) = self.free_blocks.last_entry() else {
                return;
            };
            let Some(block) = entry.get_mut().pop() else {
                entry.remove();
                continue;
            };
            if entry.get().is_empty() {
                entry.remove();
            }
            self.stats.bytes_reserved -= block.len() * ELEMENT_BYTES;
        }
    }

    fn insert(&mut self, block: LiveBlock) -> BufferHandle {
        match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.block = Some(block);
                BufferHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    block: Some(block),
                });
                BufferHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }
}

fn stale(handle: BufferHandle) -> EngineError {
    EngineError::DisposedAccess {
        what: handle.to_string(),
    }
}

fn busy(handle: BufferHandle) -> EngineError {
    EngineError::InvalidOperation(format!("{handle} is being written by another kernel"))
}

/// Output block taken out of its slot while a kernel runs.
///
/// Dropping it puts the data back, also when the kernel unwinds.
struct CheckedOut<'a> {
    pool: &'a DeviceAllocator,
    handle: BufferHandle,
    data: Vec<f32>,
    len: usize,
}

impl Drop for CheckedOut<'_> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        let mut state = self.pool.lock();
        // The caller's alias keeps the block live while it is checked out.
        if let Ok(block) = state.live_mut(self.handle) {
            block.data = Arc::new(data);
            block.checked_out = false;
        }
    }
}

/// Free-list allocator for one device.
///
/// Bookkeeping locks one mutex per device, so separate devices never
/// contend. Kernels themselves run unlocked.
pub struct DeviceAllocator {
    device: DeviceId,
    limit_bytes: Option<usize>,
    state: Mutex<PoolState>,
}

impl fmt::Debug for DeviceAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("device", &self.device)
            .field("limit_bytes", &self.limit_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}

impl DeviceAllocator {
    pub fn new(device: DeviceId, limit_bytes: Option<usize>) -> Self {
        Self {
            device,
            limit_bytes,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn limit_bytes(&self) -> Option<usize> {
        self.limit_bytes
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain a zero-filled block of `elements` values.
    pub fn acquire(&self, elements: usize) -> Result<BufferHandle, EngineError> {
        let mut state = self.lock();

        if let Some(mut data) = state.take_free_block(elements) {
            data[..elements].fill(0.0);
            let bytes = data.len() * ELEMENT_BYTES;
            state.stats.reuses += 1;
            state.stats.bytes_in_use += bytes;
            state.stats.live_buffers += 1;
            trace!(
                "{}: reused block of {} elements for {}",
                self.device,
                data.len(),
                elements
            );
            return Ok(state.insert(LiveBlock::new(data, elements)));
        }

        let bytes = elements * ELEMENT_BYTES;
        if let Some(limit) = self.limit_bytes {
            state.evict_until_fits(bytes, limit);
            if state.stats.bytes_reserved + bytes > limit {
                return Err(EngineError::OutOfMemory {
                    device: self.device,
                    requested: bytes,
                    reserved: state.stats.bytes_reserved,
                    limit: self.limit_bytes,
                });
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(elements)
            .map_err(|_| EngineError::OutOfMemory {
                device: self.device,
                requested: bytes,
                reserved: state.stats.bytes_reserved,
                limit: self.limit_bytes,
            })?;
        data.resize(elements, 0.0);

        let stats = &mut state.stats;
        stats.device_allocations += 1;
        stats.bytes_reserved += bytes;
        stats.peak_bytes_reserved = stats.peak_bytes_reserved.max(stats.bytes_reserved);
        stats.bytes_in_use += bytes;
        stats.live_buffers += 1;
        debug!(
            "{}: allocated {} bytes ({} reserved)",
            self.device, bytes, stats.bytes_reserved
        );

        Ok(state.insert(LiveBlock::new(data, elements)))
    }

    /// Register one more alias of a live block.
    pub fn retain(&self, handle: BufferHandle) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.live_mut(handle)?.aliases += 1;
        Ok(())
    }

    /// Drop one alias. The last alias returns the block to the free list.
    pub fn release(&self, handle: BufferHandle) -> Result<(), EngineError> {
        let mut state = self.lock();
        let block = state.live_mut(handle)?;
        block.aliases -= 1;
        if block.aliases > 0 {
            return Ok(());
        }

        let slot = &mut state.slots[handle.index as usize];
        let Some(block) = slot.block.take() else {
            return Err(stale(handle));
        };
        slot.generation = slot.generation.wrapping_add(1);
        state.vacant.push(handle.index);

        // A reader still holding a snapshot keeps the old allocation.
        let data = Arc::try_unwrap(block.data).unwrap_or_else(|shared| Vec::clone(&shared));
        let capacity = data.len();
        state.free_blocks.entry(capacity).or_default().push(data);
        state.stats.releases += 1;
        state.stats.bytes_in_use -= capacity * ELEMENT_BYTES;
        state.stats.live_buffers -= 1;
        Ok(())
    }

    /// Number of aliases currently holding a block.
    pub fn alias_count(&self, handle: BufferHandle) -> Result<usize, EngineError> {
        Ok(self.lock().live(handle)?.aliases)
    }

    pub fn is_live(&self, handle: BufferHandle) -> bool {
        self.lock().live(handle).is_ok()
    }

    /// Give every cached free block back to the device.
    pub fn reset(&self) {
        let mut state = self.lock();
        let cached: usize = state
            .free_blocks
            .iter()
            .map(|(&capacity, list)| capacity * list.len())
            .sum();
        state.free_blocks.clear();
        state.stats.bytes_reserved -= cached * ELEMENT_BYTES;
        debug!(
            "{}: pool reset freed {} bytes",
            self.device,
            cached * ELEMENT_BYTES
        );
    }

    pub fn stats(&self) -> AllocatorStats {
        self.lock().stats
    }

    /// Read the logical contents of a block.
    pub(crate) fn read<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&[f32]) -> R,
    ) -> Result<R, EngineError> {
        let (data, len) = self.lock().snapshot(handle)?;
        Ok(f(&data[..len]))
    }

    /// Mutate the logical contents of a block.
    pub(crate) fn write<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&mut [f32]) -> R,
    ) -> Result<R, EngineError> {
        self.with_blocks(&[], handle, |_, data| f(data))
    }

    /// Run a kernel reading `inputs` and writing `output`.
    ///
    /// The pool lock is only held to check the blocks out and back in.
    /// `output` must not be one of `inputs`.
    pub(crate) fn with_blocks<R>(
        &self,
        inputs: &[BufferHandle],
        output: BufferHandle,
        f: impl FnOnce(&[&[f32]], &mut [f32]) -> R,
    ) -> Result<R, EngineError> {
        if inputs.contains(&output) {
            return Err(EngineError::InvalidOperation(format!(
                "{output} is both input and output of a kernel"
            )));
        }

        let (snapshots, mut out) = {
            let mut state = self.lock();
            let snapshots = inputs
                .iter()
                .map(|&h| state.snapshot(h))
                .collect::<Result<SmallVec<[(Arc<Vec<f32>>, usize); 4]>, EngineError>>()?;
            let block = state.live_mut(output)?;
            if block.checked_out {
                return Err(busy(output));
            }
            block.checked_out = true;
            let data = std::mem::take(Arc::make_mut(&mut block.data));
            let out = CheckedOut {
                pool: self,
                handle: output,
                data,
                len: block.len,
            };
            (snapshots, out)
        };

        let views: SmallVec<[&[f32]; 4]> = snapshots.iter().map(|(data, len)| &data[..*len]).collect();
        let len = out.len;
        Ok(f(&views[..], &mut out.data[..len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(limit: Option<usize>) -> DeviceAllocator {
        DeviceAllocator::new(DeviceId(0), limit)
    }

    #[test]
    fn test_acquire_returns_zeroed_block() {
        let pool = pool(None);
        let h = pool.acquire(4).unwrap();
        pool.read(h, |d| assert_eq!(d, &[0.0; 4])).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.device_allocations, 1);
        assert_eq!(stats.bytes_in_use, 16);
        assert_eq!(stats.live_buffers, 1);
    }

    #[test]
    fn test_release_then_smaller_request_reuses() {
        let pool = pool(None);
        let h = pool.acquire(100).unwrap();
        pool.write(h, |d| d.fill(7.0)).unwrap();
        pool.release(h).unwrap();

        let h2 = pool.acquire(60).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.device_allocations, 1);
        assert_eq!(stats.reuses, 1);
        // Reused memory is cleared and sized to the request.
        pool.read(h2, |d| {
            assert_eq!(d.len(), 60);
            assert!(d.iter().all(|&x| x == 0.0));
        })
        .unwrap();
    }

    #[test]
    fn test_reuse_picks_smallest_fitting_block() {
        let pool = pool(None);
        let big = pool.acquire(1000).unwrap();
        let small = pool.acquire(10).unwrap();
        pool.release(big).unwrap();
        pool.release(small).unwrap();

        let h = pool.acquire(8).unwrap();
        assert_eq!(pool.stats().bytes_in_use, 40);
        pool.release(h).unwrap();
        assert_eq!(pool.stats().device_allocations, 2);
    }

    #[test]
    fn test_larger_request_allocates() {
        let pool = pool(None);
        let h = pool.acquire(4).unwrap();
        pool.release(h).unwrap();
        pool.acquire(5).unwrap();
        assert_eq!(pool.stats().device_allocations, 2);
    }

    #[test]
    fn test_stale_handle_is_disposed_access() {
        let pool = pool(None);
        let h = pool.acquire(4).unwrap();
        pool.release(h).unwrap();
        assert!(!pool.is_live(h));
        assert!(matches!(
            pool.read(h, |_| ()),
            Err(EngineError::DisposedAccess { .. })
        ));
        assert!(matches!(
            pool.release(h),
            Err(EngineError::DisposedAccess { .. })
        ));

        // The slot is recycled with a new generation.
        let h2 = pool.acquire(4).unwrap();
        assert_eq!(h2.index(), h.index());
        assert_ne!(h2.generation(), h.generation());
        assert!(pool.read(h, |_| ()).is_err());
    }

    #[test]
    fn test_aliases_keep_block_alive() {
        let pool = pool(None);
        let h = pool.acquire(2).unwrap();
        pool.retain(h).unwrap();
        assert_eq!(pool.alias_count(h).unwrap(), 2);
        pool.release(h).unwrap();
        assert!(pool.is_live(h));
        pool.release(h).unwrap();
        assert!(!pool.is_live(h));
    }

    #[test]
    fn test_limit_reports_out_of_memory() {
        let pool = pool(Some(64));
        let _a = pool.acquire(12).unwrap();
        let err = pool.acquire(8).unwrap_err();
        assert!(err.is_out_of_memory());
        match err {
            EngineError::OutOfMemory {
                requested,
                reserved,
                ..
            } => {
                assert_eq!(requested, 32);
                assert_eq!(reserved, 48);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_limit_evicts_cached_blocks() {
        let pool = pool(Some(64));
        let a = pool.acquire(12).unwrap();
        pool.release(a).unwrap();
        // 12 cached elements cannot serve 14, but evicting them makes room.
        pool.acquire(14).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.device_allocations, 2);
        assert_eq!(stats.bytes_reserved, 56);
    }

    #[test]
    fn test_reset_frees_cached_blocks() {
        let pool = pool(None);
        let a = pool.acquire(10).unwrap();
        let b = pool.acquire(10).unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.stats().bytes_reserved, 80);
        pool.reset();
        let stats = pool.stats();
        assert_eq!(stats.bytes_reserved, 40);
        assert_eq!(stats.peak_bytes_reserved, 80);
        assert!(pool.is_live(b));
    }

    #[test]
    fn test_with_blocks_rejects_aliasing_output() {
        let pool = pool(None);
        let a = pool.acquire(3).unwrap();
        let out = pool.acquire(3).unwrap();
        pool.write(a, |d| d.copy_from_slice(&[1.0, 2.0, 3.0])).unwrap();
        pool.with_blocks(&[a, a], out, |inputs, dst| {
            for (i, o) in dst.iter_mut().enumerate() {
                *o = inputs[0][i] + inputs[1][i];
            }
        })
        .unwrap();
        pool.read(out, |d| assert_eq!(d, &[2.0, 4.0, 6.0])).unwrap();
        assert!(pool.with_blocks(&[out], out, |_, _| ()).is_err());
    }

    #[test]
    fn test_kernel_runs_without_the_pool_lock() {
        let pool = pool(None);
        let a = pool.acquire(2).unwrap();
        let out = pool.acquire(2).unwrap();
        let live = pool.with_blocks(&[a], out, |_, _| pool.stats().live_buffers).unwrap();
        assert_eq!(live, 2);
        // The output is checked out until the kernel returns.
        let nested = pool.with_blocks(&[a], out, |_, _| pool.read(out, |_| ()));
        assert!(nested.unwrap().is_err());
    }

    #[test]
    fn test_panicking_kernel_returns_output_block() {
        let pool = pool(None);
        let a = pool.acquire(2).unwrap();
        let out = pool.acquire(2).unwrap();
        pool.write(out, |d| d.copy_from_slice(&[5.0, 6.0])).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.with_blocks(&[a], out, |_, dst| {
                dst[0] = 1.0;
                if dst.len() == 2 {
                    panic!("kernel failed");
                }
            })
        }));
        assert!(result.is_err());
        pool.read(out, |d| assert_eq!(d, &[1.0, 6.0])).unwrap();
        pool.with_blocks(&[out], a, |inputs, dst| dst.copy_from_slice(inputs[0]))
            .unwrap();
        pool.read(a, |d| assert_eq!(d, &[1.0, 6.0])).unwrap();
    }

    #[test]
    fn test_write_copies_block_under_a_reader() {
        let pool = pool(None);
        let h = pool.acquire(2).unwrap();
        pool.write(h, |d| d.fill(1.0)).unwrap();
        pool.read(h, |before| {
            pool.write(h, |d| d.fill(2.0)).unwrap();
            assert_eq!(before, &[1.0, 1.0]);
        })
        .unwrap();
        pool.read(h, |d| assert_eq!(d, &[2.0, 2.0])).unwrap();
        pool.release(h).unwrap();
        assert_eq!(pool.stats().bytes_reserved, 8);
    }
}
