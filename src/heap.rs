//! VEBOX State Heap
//!
//! A ring of hardware-state instances in a CPU-locked GPU buffer, cycled
//! once per frame. The GPU may still be reading an instance after the CPU
//! has moved on, so every instance carries a busy flag and the completion
//! tag it is waiting on; an instance is only handed out again once the
//! engine's tag has caught up with it (tag comparison is wraparound-safe).
//!
//! Lifecycle: [`VeboxHeap::create`] once per device, [`VeboxHeap::assign`] /
//! [`VeboxHeap::update_sync`] once per frame, [`VeboxHeap::release`] exactly
//! once at teardown (also used by `create`'s own failure path).

use std::slice;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::{HalError, Result};
use crate::mos::{AllocParams, GpuContext, LockFlags, OsInterface, ResourceHandle};
use crate::state::checked_align_cacheline;

/// Default bounded-wait budget: up to 60 event waits of 5 ms each.
pub const DEFAULT_WAIT_ITERATIONS: u32 = 60;
pub const DEFAULT_EVENT_TIMEOUT_MS: u64 = 5;

/// Bounded wait used when the next ring slot is still in flight.
#[derive(Debug, Clone, Copy)]
pub struct WaitBudget {
    pub iterations: u32,
    pub event_timeout: Duration,
}

impl Default for WaitBudget {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_WAIT_ITERATIONS,
            event_timeout: Duration::from_millis(DEFAULT_EVENT_TIMEOUT_MS),
        }
    }
}

/// Per-generation heap sizing: ring depth plus the byte size of every state
/// section within one instance. Sections a generation lacks are zero-sized.
#[derive(Debug, Clone, Copy)]
pub struct VeboxSettings {
    pub num_instances: u32,
    pub sync_size: u32,
    pub dndi_state_size: u32,
    pub iecp_state_size: u32,
    pub gamut_state_size: u32,
    pub vertex_table_size: u32,
    pub capture_pipe_state_size: u32,
    pub gamma_correction_state_size: u32,
    pub hdr_state_size: u32,
}

/// Byte offsets of each state section within one heap instance, assigned in
/// fixed order at creation. The engine reads states at these offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionOffsets {
    pub dndi_state: u32,
    pub iecp_state: u32,
    pub gamut_state: u32,
    pub vertex_table: u32,
    pub capture_pipe_state: u32,
    pub gamma_correction_state: u32,
    pub hdr_state: u32,
}

/// One ring slot.
#[derive(Debug, Clone, Copy, Default)]
struct HeapState {
    /// True while the GPU may still be reading this instance.
    busy: bool,
    /// Completion tag this instance waits on while busy.
    sync_tag: u32,
}

/// Read-only heap snapshot for callers binding surfaces or building
/// commands against the current instance.
#[derive(Debug, Clone, Copy)]
pub struct VeboxHeapInfo {
    pub cur_state: usize,
    pub num_instances: usize,
    pub instance_size: u32,
    pub sync_offset: u32,
    pub heap_size: u32,
    pub offsets: SectionOffsets,
    pub driver_resource: ResourceHandle,
    pub kernel_resource: ResourceHandle,
}

#[derive(Debug)]
pub struct VeboxHeap {
    states: Vec<HeapState>,
    cur_state: usize,
    next_state: usize,

    offsets: SectionOffsets,
    instance_size: u32,
    sync_offset: u32,
    heap_size: u32,

    driver_resource: ResourceHandle,
    kernel_resource: ResourceHandle,
    /// CPU mapping of the driver resource, held for the heap's lifetime.
    locked_mem: *mut u8,

    /// Next software tag to stamp (KMD frame tracking off).
    next_tag: u32,
    /// Last tag observed complete, refreshed before every assignment.
    sync_tag: u32,
    /// Instances still busy after the last refresh.
    in_use: usize,
}

// SAFETY: the mapping pointer is only dereferenced by heap methods, and the
// heap has a single owner; the GPU side writes only the sync word, which is
// read with volatile loads.
unsafe impl Send for VeboxHeap {}

impl VeboxHeap {
    /// Allocate and map the state heap.
    ///
    /// Lays out one instance as the sum of the section sizes in fixed
    /// order, multiplies by the ring depth, appends the sync area, aligns
    /// the total to a cache line and backs it with two equal allocations: a
    /// driver resource (CPU-locked here, for the heap's lifetime) and a
    /// kernel resource the CPU never maps. Any failure releases whatever
    /// was already allocated.
    pub fn create(os: &dyn OsInterface, settings: &VeboxSettings) -> Result<Self> {
        if settings.num_instances == 0 {
            return Err(HalError::InvalidParameter("heap needs at least one instance"));
        }
        if settings.sync_size < 4 {
            return Err(HalError::InvalidParameter("sync area smaller than one tag word"));
        }

        // Sizes and ring depth come from the caller (ultimately the config),
        // so every step of the size computation is overflow-checked.
        let mut offsets = SectionOffsets::default();
        let mut offset = 0u32;
        let mut place = |size: u32| -> Result<u32> {
            let here = offset;
            offset = offset
                .checked_add(size)
                .ok_or(HalError::InvalidParameter("heap instance size overflows u32"))?;
            Ok(here)
        };
        offsets.dndi_state = place(settings.dndi_state_size)?;
        offsets.iecp_state = place(settings.iecp_state_size)?;
        offsets.gamut_state = place(settings.gamut_state_size)?;
        offsets.vertex_table = place(settings.vertex_table_size)?;
        offsets.capture_pipe_state = place(settings.capture_pipe_state_size)?;
        offsets.gamma_correction_state = place(settings.gamma_correction_state_size)?;
        offsets.hdr_state = place(settings.hdr_state_size)?;

        let instance_size = offset;
        let sync_offset = instance_size
            .checked_mul(settings.num_instances)
            .ok_or(HalError::InvalidParameter("heap size overflows u32"))?;
        let heap_size = sync_offset
            .checked_add(settings.sync_size)
            .and_then(checked_align_cacheline)
            .ok_or(HalError::InvalidParameter("heap size overflows u32"))?;

        debug!(
            "creating vebox heap: {} instances x {} bytes + {} sync = {} bytes",
            settings.num_instances, instance_size, settings.sync_size, heap_size
        );

        let driver_resource = os.allocate_resource(&AllocParams {
            name: "VeboxHeapDriver",
            bytes: heap_size as usize,
            lockable: true,
        })?;

        let kernel_resource = match os.allocate_resource(&AllocParams {
            name: "VeboxHeapKernel",
            bytes: heap_size as usize,
            lockable: false,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                os.free_resource(driver_resource);
                return Err(e);
            }
        };

        let locked_mem = match os.lock_resource(
            driver_resource,
            &LockFlags { no_overwrite: true },
        ) {
            Ok(ptr) => ptr,
            Err(e) => {
                os.free_resource(driver_resource);
                os.free_resource(kernel_resource);
                return Err(e);
            }
        };

        Ok(Self {
            states: vec![HeapState::default(); settings.num_instances as usize],
            cur_state: 0,
            next_state: 0,
            offsets,
            instance_size,
            sync_offset,
            heap_size,
            driver_resource,
            kernel_resource,
            locked_mem,
            // Tag 0 is the sync word's reset value and must never be
            // waited on, so software tags start at 1.
            next_tag: 1,
            sync_tag: 0,
            in_use: 0,
        })
    }

    /// Unmap and free both backing allocations. Consumes the heap; callers
    /// holding `Option<VeboxHeap>` get idempotent teardown via `take()`.
    pub fn release(self, os: &dyn OsInterface) {
        debug!("releasing vebox heap ({} bytes)", self.heap_size);
        if !self.locked_mem.is_null() {
            if let Err(e) = os.unlock_resource(self.driver_resource) {
                warn!("unlock of driver heap resource failed: {}", e);
            }
        }
        os.free_resource(self.driver_resource);
        os.free_resource(self.kernel_resource);
    }

    /// Re-derive which instances the GPU has retired.
    ///
    /// Reads the most recent completion tag (GPU status tag under KMD frame
    /// tracking, otherwise the sync word the engine writes back) and clears
    /// the busy flag of every instance whose tag has been reached. The
    /// signed difference handles tag wraparound at 2^32.
    pub(crate) fn refresh_sync(&mut self, os: &dyn OsInterface) {
        let current_tag = self.current_completion_tag(os);
        self.sync_tag = current_tag.wrapping_sub(1);

        let null_hw = os.null_hw_enabled();
        let mut in_use = 0;
        for state in &mut self.states {
            if !state.busy {
                continue;
            }
            if tag_reached(current_tag, state.sync_tag) || null_hw {
                state.busy = false;
            } else {
                in_use += 1;
            }
        }
        self.in_use = in_use;
        trace!(
            "refresh: tag={}, {} of {} instances in use",
            current_tag,
            in_use,
            self.states.len()
        );
    }

    /// Claim the next ring slot for command construction.
    ///
    /// If the slot is still in flight, polls the batch-buffer-complete
    /// event up to `budget.iterations` times, re-reading the completion tag
    /// after each wait. Exhausting the budget is fatal for this operation:
    /// no slot is assigned and the ring cursors do not move.
    pub fn assign(&mut self, os: &dyn OsInterface, budget: &WaitBudget) -> Result<()> {
        let candidate = self.next_state;

        self.refresh_sync(os);

        // Unlikely unless every instance is in flight; if this is hit often
        // the ring is too shallow for the workload.
        if self.states[candidate].busy {
            let wait_tag = self.states[candidate].sync_tag;
            debug!(
                "instance {} still busy (tag {}), entering bounded wait",
                candidate, wait_tag
            );

            let mut freed = false;
            for _ in 0..budget.iterations {
                os.wait_bb_complete(GpuContext::Vebox, budget.event_timeout)?;
                let current_tag = self.current_completion_tag(os);
                if tag_reached(current_tag, wait_tag) {
                    self.states[candidate].busy = false;
                    freed = true;
                    break;
                }
            }

            if !freed {
                error!(
                    "timeout waiting for heap instance {} (tag {})",
                    candidate, wait_tag
                );
                return Err(HalError::HeapWaitTimeout {
                    iterations: budget.iterations,
                });
            }
        }

        // Tag the engine will write back for the work built on this slot.
        self.states[candidate].sync_tag = if os.kmd_frame_tracking() {
            os.next_gpu_status_tag(GpuContext::Vebox)
        } else {
            self.next_tag
        };

        self.cur_state = candidate;
        self.next_state = (candidate + 1) % self.states.len();

        // Stale state from the previous use must not leak into the commands
        // built on this instance.
        self.instance_mem_mut(self.cur_state).fill(0);

        trace!(
            "assigned instance {} (tag {}), next is {}",
            self.cur_state,
            self.states[self.cur_state].sync_tag,
            self.next_state
        );
        Ok(())
    }

    /// Commit the current instance as in flight. Called once the command
    /// buffer referencing it is fully built, immediately before submission.
    pub fn update_sync(&mut self, os: &dyn OsInterface) {
        if !os.kmd_frame_tracking() {
            self.states[self.cur_state].sync_tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1);
        }
        self.states[self.cur_state].busy = true;
    }

    pub fn info(&self) -> VeboxHeapInfo {
        VeboxHeapInfo {
            cur_state: self.cur_state,
            num_instances: self.states.len(),
            instance_size: self.instance_size,
            sync_offset: self.sync_offset,
            heap_size: self.heap_size,
            offsets: self.offsets,
            driver_resource: self.driver_resource,
            kernel_resource: self.kernel_resource,
        }
    }

    /// Force the current-state cursor (scalability paths replay a frame
    /// against a specific instance).
    pub fn set_state_index(&mut self, index: usize) -> Result<()> {
        if index >= self.states.len() {
            return Err(HalError::InvalidParameter("state index beyond ring size"));
        }
        self.cur_state = index;
        Ok(())
    }

    pub fn cur_state(&self) -> usize {
        self.cur_state
    }

    pub fn num_instances(&self) -> usize {
        self.states.len()
    }

    /// Instances still in flight after the last refresh.
    pub fn instances_in_use(&self) -> usize {
        self.in_use
    }

    /// Last completion tag observed by a refresh (diagnostics).
    pub fn last_observed_tag(&self) -> u32 {
        self.sync_tag
    }

    /// Tag the current instance's submission will write back.
    pub fn cur_sync_tag(&self) -> u32 {
        self.states[self.cur_state].sync_tag
    }

    /// Byte offset of the current instance within the heap.
    pub fn cur_instance_offset(&self) -> u32 {
        self.cur_state as u32 * self.instance_size
    }

    /// Mutable view of one section of the current instance.
    pub fn cur_section_mut(&mut self, section_offset: u32, len: usize) -> &mut [u8] {
        let base = self.cur_instance_offset() + section_offset;
        debug_assert!(base as usize + len <= self.sync_offset as usize);
        // SAFETY: the mapping covers heap_size bytes and instance sections
        // lie below the sync area.
        unsafe { slice::from_raw_parts_mut(self.locked_mem.add(base as usize), len) }
    }

    pub fn section_offsets(&self) -> &SectionOffsets {
        &self.offsets
    }

    fn current_completion_tag(&self, os: &dyn OsInterface) -> u32 {
        if os.kmd_frame_tracking() {
            os.gpu_status_tag(GpuContext::Vebox)
        } else {
            self.read_sync_word()
        }
    }

    /// Software-tracking poll location: first dword of the sync area, which
    /// the engine writes on completion.
    fn read_sync_word(&self) -> u32 {
        // SAFETY: sync area lies within the mapping; volatile because the
        // emulated engine (or real hardware) writes it asynchronously.
        unsafe {
            (self.locked_mem.add(self.sync_offset as usize) as *const u32).read_volatile()
        }
    }

    fn instance_mem_mut(&mut self, index: usize) -> &mut [u8] {
        let base = index as u32 * self.instance_size;
        // SAFETY: index < ring size, so the instance lies below the sync
        // area within the mapping.
        unsafe {
            slice::from_raw_parts_mut(
                self.locked_mem.add(base as usize),
                self.instance_size as usize,
            )
        }
    }

    #[cfg(test)]
    fn force_instance(&mut self, index: usize, busy: bool, sync_tag: u32) {
        self.states[index] = HeapState { busy, sync_tag };
    }

    #[cfg(test)]
    fn write_sync_word(&mut self, value: u32) {
        // SAFETY: same location read_sync_word() reads.
        unsafe {
            (self.locked_mem.add(self.sync_offset as usize) as *mut u32).write_volatile(value);
        }
    }
}

/// Wraparound-safe "has the engine reached `tag` yet". Valid while the
/// in-flight window stays below 2^31 tags.
fn tag_reached(current_tag: u32, tag: u32) -> bool {
    current_tag.wrapping_sub(tag) as i32 >= 0
}
