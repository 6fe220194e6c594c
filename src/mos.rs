//! OS Abstraction Module
//!
//! The boundary between the HAL and the kernel-mode driver: linear GPU
//! buffer allocation, CPU mapping, GPU status-tag synchronization and the
//! batch-buffer-complete notification event.
//!
//! `SoftOs` is a software implementation backed by system memory and an
//! emulated GPU engine. It is what the demo binary and the tests run
//! against; on real hardware this trait would be implemented over the KMD
//! ioctl surface instead.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::cmdbuf::{CommandBuffer, TagWrite};
use crate::error::{HalError, Result};

/// Opaque handle to a GPU buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(u32);

/// GPU engine the work is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuContext {
    Vebox,
    Render,
}

/// Linear buffer allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocParams {
    pub name: &'static str,
    pub bytes: usize,
    /// False for allocations the CPU never maps (GPU/kernel access only).
    pub lockable: bool,
}

/// CPU mapping flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockFlags {
    /// Map write-combined; the CPU only appends, never reads back.
    pub no_overwrite: bool,
}

/// KMD contract consumed by the HAL.
///
/// All methods take `&self`; implementations are internally synchronized.
/// The HAL itself is single-producer per heap, but the emulated GPU engine
/// completes work from another thread.
pub trait OsInterface: Send + Sync {
    fn allocate_resource(&self, params: &AllocParams) -> Result<ResourceHandle>;

    /// Map a resource for CPU access. The returned pointer stays valid until
    /// `unlock_resource` or `free_resource` on the same handle.
    fn lock_resource(&self, handle: ResourceHandle, flags: &LockFlags) -> Result<*mut u8>;

    fn unlock_resource(&self, handle: ResourceHandle) -> Result<()>;

    /// Release an allocation. Unknown handles are ignored so that teardown
    /// paths can free unconditionally.
    fn free_resource(&self, handle: ResourceHandle);

    /// Most recent completion tag the GPU has written back for `ctx`.
    fn gpu_status_tag(&self, ctx: GpuContext) -> u32;

    /// Tag value the next submission on `ctx` will write back on completion.
    fn next_gpu_status_tag(&self, ctx: GpuContext) -> u32;

    /// Block until the next batch-buffer-complete notification or until
    /// `timeout` elapses, whichever comes first. A timeout is not an error;
    /// callers re-check the tag condition after every return.
    fn wait_bb_complete(&self, ctx: GpuContext, timeout: Duration) -> Result<()>;

    /// Hand a fully built command buffer to the engine.
    fn submit(&self, ctx: GpuContext, cmd: &CommandBuffer) -> Result<()>;

    /// True when the KMD tracks frame completion through the GPU status tag.
    /// When false the HAL falls back to software tags polled from the heap
    /// sync area.
    fn kmd_frame_tracking(&self) -> bool;

    /// Null-hardware mode: commands are parsed but no GPU work runs, so all
    /// in-flight state may be treated as already complete.
    fn null_hw_enabled(&self) -> bool;
}

struct ResourceSlot {
    base: *mut u8,
    len: usize,
    name: &'static str,
    lockable: bool,
    locked: bool,
}

struct OsState {
    next_handle: u32,
    resources: HashMap<ResourceHandle, ResourceSlot>,
    /// Fault injection: fail the Nth allocation from now (0 = next).
    fail_alloc_after: Option<u32>,
}

struct Submission {
    tag_writes: Vec<TagWrite>,
}

struct EngineState {
    completed_tag: u32,
    inflight: Vec<Submission>,
}

/// Software OS backend with an emulated GPU engine.
///
/// Submissions queue on an in-flight list; completion (from a worker thread
/// or an explicit [`SoftOs::complete_next`] call in tests) applies the
/// recorded tag writes to resource memory, advances the status tag and
/// signals the batch-buffer-complete event.
pub struct SoftOs {
    state: Mutex<OsState>,
    engine: Mutex<EngineState>,
    bb_event: Condvar,
    wait_calls: AtomicU32,
    kmd_frame_tracking: bool,
    null_hw: bool,
}

// SAFETY: resource memory is reached only through the raw base pointers,
// which stay valid for the slot lifetime; all slot bookkeeping is behind
// the mutexes.
unsafe impl Send for SoftOs {}
unsafe impl Sync for SoftOs {}

impl SoftOs {
    pub fn new(kmd_frame_tracking: bool, null_hw: bool) -> Self {
        Self {
            state: Mutex::new(OsState {
                next_handle: 1,
                resources: HashMap::new(),
                fail_alloc_after: None,
            }),
            engine: Mutex::new(EngineState {
                completed_tag: 0,
                inflight: Vec::new(),
            }),
            bb_event: Condvar::new(),
            wait_calls: AtomicU32::new(0),
            kmd_frame_tracking,
            null_hw,
        }
    }

    /// Complete the oldest in-flight submission, if any. Returns the new
    /// status-tag value.
    pub fn complete_next(&self) -> u32 {
        let submission = {
            let mut engine = self.engine.lock().unwrap();
            if engine.inflight.is_empty() {
                return engine.completed_tag;
            }
            engine.inflight.remove(0)
        };

        // Apply the GPU-side tag writebacks before publishing the new tag.
        for write in &submission.tag_writes {
            if let Err(e) = self.write_tag(write) {
                warn!("dropping tag write to freed resource: {}", e);
            }
        }

        let mut engine = self.engine.lock().unwrap();
        engine.completed_tag = engine.completed_tag.wrapping_add(1);
        let tag = engine.completed_tag;
        drop(engine);

        self.bb_event.notify_all();
        trace!("engine completed submission, status tag now {}", tag);
        tag
    }

    /// Number of submissions not yet completed.
    pub fn inflight(&self) -> usize {
        self.engine.lock().unwrap().inflight.len()
    }

    /// Number of batch-buffer-complete waits performed so far.
    pub fn wait_calls(&self) -> u32 {
        self.wait_calls.load(Ordering::Relaxed)
    }

    /// Number of live allocations (leak check for teardown tests).
    pub fn live_resources(&self) -> usize {
        self.state.lock().unwrap().resources.len()
    }

    /// Fault injection: the `n`th allocation from now fails (0 = next one).
    pub fn fail_alloc_after(&self, n: u32) {
        self.state.lock().unwrap().fail_alloc_after = Some(n);
    }

    /// Spawn the engine worker: completes one submission every `latency`
    /// until `shutdown` is set. Polling loop, same shape as the backend
    /// service main loop.
    pub fn spawn_engine(
        self: Arc<Self>,
        latency: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        let os = self;
        thread::Builder::new()
            .name("vebox-soft-engine".to_string())
            .spawn(move || {
                info!("software engine thread started");
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if os.inflight() > 0 {
                        thread::sleep(latency);
                        os.complete_next();
                    } else {
                        thread::sleep(Duration::from_micros(100));
                    }
                }
                info!("software engine thread exiting");
            })
            .expect("Failed to spawn engine thread")
    }

    fn write_tag(&self, write: &TagWrite) -> Result<()> {
        let state = self.state.lock().unwrap();
        let slot = state
            .resources
            .get(&write.resource)
            .ok_or(HalError::UnknownResource(write.resource))?;
        let offset = write.offset as usize;
        if offset + 4 > slot.len {
            return Err(HalError::InvalidParameter("tag write offset out of bounds"));
        }
        // SAFETY: offset checked against the slot length; the GPU-visible
        // sync word is only ever read through volatile loads on the CPU side.
        unsafe {
            (slot.base.add(offset) as *mut u32).write_volatile(write.value);
        }
        Ok(())
    }
}

impl OsInterface for SoftOs {
    fn allocate_resource(&self, params: &AllocParams) -> Result<ResourceHandle> {
        if params.bytes == 0 {
            return Err(HalError::InvalidParameter("zero-sized allocation"));
        }

        let mut state = self.state.lock().unwrap();

        if let Some(countdown) = state.fail_alloc_after {
            if countdown == 0 {
                state.fail_alloc_after = None;
                return Err(HalError::AllocationFailed {
                    name: params.name,
                    bytes: params.bytes,
                });
            }
            state.fail_alloc_after = Some(countdown - 1);
        }

        let layout = Layout::from_size_align(params.bytes, CACHELINE_ALIGN)
            .map_err(|_| HalError::InvalidParameter("bad allocation size"))?;
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(HalError::AllocationFailed {
                name: params.name,
                bytes: params.bytes,
            });
        }

        let handle = ResourceHandle(state.next_handle);
        state.next_handle += 1;
        state.resources.insert(
            handle,
            ResourceSlot {
                base,
                len: params.bytes,
                name: params.name,
                lockable: params.lockable,
                locked: false,
            },
        );

        debug!(
            "allocated {:?} ({}, {} bytes, lockable={})",
            handle, params.name, params.bytes, params.lockable
        );
        Ok(handle)
    }

    fn lock_resource(&self, handle: ResourceHandle, _flags: &LockFlags) -> Result<*mut u8> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .resources
            .get_mut(&handle)
            .ok_or(HalError::UnknownResource(handle))?;
        if !slot.lockable {
            return Err(HalError::LockFailed(handle));
        }
        slot.locked = true;
        Ok(slot.base)
    }

    fn unlock_resource(&self, handle: ResourceHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .resources
            .get_mut(&handle)
            .ok_or(HalError::UnknownResource(handle))?;
        slot.locked = false;
        Ok(())
    }

    fn free_resource(&self, handle: ResourceHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.resources.remove(&handle) {
            if slot.locked {
                warn!("freeing {:?} ({}) while still locked", handle, slot.name);
            }
            debug!("freeing {:?} ({})", handle, slot.name);
            // SAFETY: base/len are the values the slot was allocated with.
            unsafe {
                dealloc(
                    slot.base,
                    Layout::from_size_align_unchecked(slot.len, CACHELINE_ALIGN),
                );
            }
        }
    }

    fn gpu_status_tag(&self, _ctx: GpuContext) -> u32 {
        self.engine.lock().unwrap().completed_tag
    }

    fn next_gpu_status_tag(&self, _ctx: GpuContext) -> u32 {
        let engine = self.engine.lock().unwrap();
        engine
            .completed_tag
            .wrapping_add(engine.inflight.len() as u32)
            .wrapping_add(1)
    }

    fn wait_bb_complete(&self, _ctx: GpuContext, timeout: Duration) -> Result<()> {
        self.wait_calls.fetch_add(1, Ordering::Relaxed);
        let engine = self.engine.lock().unwrap();
        // The wait is purely a pacing mechanism; spurious wakeups and
        // timeouts are fine, the caller re-reads the tag afterwards.
        let _unused = self.bb_event.wait_timeout(engine, timeout).unwrap();
        Ok(())
    }

    fn submit(&self, _ctx: GpuContext, cmd: &CommandBuffer) -> Result<()> {
        let mut engine = self.engine.lock().unwrap();
        engine.inflight.push(Submission {
            tag_writes: cmd.tag_writes().to_vec(),
        });
        trace!(
            "submitted {} dwords, {} patches, {} in flight",
            cmd.dwords().len(),
            cmd.patches().len(),
            engine.inflight.len()
        );
        Ok(())
    }

    fn kmd_frame_tracking(&self) -> bool {
        self.kmd_frame_tracking
    }

    fn null_hw_enabled(&self) -> bool {
        self.null_hw
    }
}

impl Drop for SoftOs {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for (handle, slot) in state.resources.drain() {
            warn!("resource {:?} ({}) leaked, freeing", handle, slot.name);
            // SAFETY: base/len are the values the slot was allocated with.
            unsafe {
                dealloc(
                    slot.base,
                    Layout::from_size_align_unchecked(slot.len, CACHELINE_ALIGN),
                );
            }
        }
    }
}

const CACHELINE_ALIGN: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(os: &SoftOs, bytes: usize, lockable: bool) -> ResourceHandle {
        os.allocate_resource(&AllocParams {
            name: "test",
            bytes,
            lockable,
        })
        .unwrap()
    }

    #[test]
    fn lock_unlockable_resource_fails() {
        let os = SoftOs::new(true, false);
        let handle = alloc(&os, 256, false);
        assert!(matches!(
            os.lock_resource(handle, &LockFlags::default()),
            Err(HalError::LockFailed(_))
        ));
        os.free_resource(handle);
        assert_eq!(os.live_resources(), 0);
    }

    #[test]
    fn alloc_fault_injection_counts_down() {
        let os = SoftOs::new(true, false);
        os.fail_alloc_after(1);
        let first = alloc(&os, 64, true);
        let second = os.allocate_resource(&AllocParams {
            name: "fails",
            bytes: 64,
            lockable: true,
        });
        assert!(matches!(second, Err(HalError::AllocationFailed { .. })));
        os.free_resource(first);
    }

    #[test]
    fn completion_applies_tag_writes_and_advances_status() {
        let os = SoftOs::new(true, false);
        let handle = alloc(&os, 64, true);
        let mut cmd = CommandBuffer::new(32);
        cmd.add_tag_write(handle, 0, 0xABCD);

        assert_eq!(os.gpu_status_tag(GpuContext::Vebox), 0);
        assert_eq!(os.next_gpu_status_tag(GpuContext::Vebox), 1);
        os.submit(GpuContext::Vebox, &cmd).unwrap();
        assert_eq!(os.next_gpu_status_tag(GpuContext::Vebox), 2);

        os.complete_next();
        assert_eq!(os.gpu_status_tag(GpuContext::Vebox), 1);
        let ptr = os.lock_resource(handle, &LockFlags::default()).unwrap();
        // SAFETY: tag word is at offset 0 of a live 64-byte allocation.
        let value = unsafe { (ptr as *const u32).read_volatile() };
        assert_eq!(value, 0xABCD);
        os.free_resource(handle);
    }

    #[test]
    fn wait_returns_after_timeout_and_is_counted() {
        let os = SoftOs::new(true, false);
        os.wait_bb_complete(GpuContext::Vebox, Duration::from_millis(1))
            .unwrap();
        os.wait_bb_complete(GpuContext::Vebox, Duration::from_millis(1))
            .unwrap();
        assert_eq!(os.wait_calls(), 2);
    }
}
