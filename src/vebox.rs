//! VEBOX Interface Module
//!
//! Front end of the HAL: owns the state heap and the OS interface, packs
//! processing parameters into the current heap instance and assembles the
//! per-frame command stream (VEBOX_STATE, VEBOX_SURFACE_STATE, VEB_DI_IECP,
//! end-of-frame tag flush).
//!
//! The hardware generation is chosen once at construction and never
//! switched; it selects the heap sizing table and the handful of packing
//! differences between generations.
//!
//! Per-frame call order: [`VeboxInterface::assign_state`], the `set_*_state`
//! writers, the `add_*` command emitters, [`VeboxInterface::update_sync`],
//! then [`VeboxInterface::submit`].

use std::sync::Arc;

use tracing::{debug, info};

use crate::cmdbuf::CommandBuffer;
use crate::error::{HalError, Result};
use crate::heap::{VeboxHeap, VeboxHeapInfo, VeboxSettings, WaitBudget};
use crate::mos::{GpuContext, OsInterface, ResourceHandle};
use crate::state::{
    write_state_block, DndiState, GamutState, IecpState, SurfaceFormat, TileMode, VeboxMode,
    CMD_FLUSH_TAG_WRITE, CMD_VEBOX_STATE, CMD_VEBOX_SURFACE_STATE, CMD_VEB_DI_IECP,
    DNDI_STATE_BYTES, GAMUT_STATE_BYTES, IECP_STATE_BYTES, STATE_LAYOUT_VERSION,
};

/// Hardware generation, detected once per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen8,
    Gen9,
    Gen10,
}

impl Generation {
    /// Heap sizing table for this generation. Later generations append
    /// sections; existing section sizes never shrink.
    pub fn settings(self) -> VeboxSettings {
        let base = VeboxSettings {
            num_instances: 16,
            sync_size: 128,
            dndi_state_size: 1024,
            iecp_state_size: 4096,
            gamut_state_size: 1024,
            vertex_table_size: 2048,
            capture_pipe_state_size: 256,
            gamma_correction_state_size: 0,
            hdr_state_size: 0,
        };
        match self {
            Generation::Gen8 => base,
            Generation::Gen9 => VeboxSettings {
                gamma_correction_state_size: 4096,
                ..base
            },
            Generation::Gen10 => VeboxSettings {
                gamma_correction_state_size: 4096,
                hdr_state_size: 16384,
                ..base
            },
        }
    }

    fn has_forward_gamma(self) -> bool {
        !matches!(self, Generation::Gen8)
    }

    fn has_3dlut(self) -> bool {
        matches!(self, Generation::Gen10)
    }
}

/// Construction-time knobs; defaults match production sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct VeboxOptions {
    /// Override the ring depth (validation and memory-constrained setups).
    pub num_instances: Option<u32>,
    pub wait: WaitBudget,
}

// =============================================================================
// Processing parameters
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct DndiParams {
    pub dn_enable: bool,
    pub di_enable: bool,
    pub denoise_history_delta: u32,
    pub denoise_maximum_history: u32,
    pub denoise_asd_threshold: u32,
    pub denoise_stad_threshold: u32,
    pub temporal_diff_threshold: u32,
    pub low_temporal_diff_threshold: u32,
    pub chroma_dn_enable: bool,
    pub chroma_stad_threshold: u32,
    pub fmd_enable: bool,
    pub scene_change_detect: bool,
    pub progressive_dn: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct IecpParams {
    pub std_enable: bool,
    pub std_detection_threshold: u32,
    pub ace_enable: bool,
    pub ace_skin_threshold: u32,
    pub tcc_enable: bool,
    pub tcc_saturation_factor: u32,
    pub csc_enable: bool,
    pub csc_coeff: [i32; 9],
    pub csc_offset: [i32; 3],
    pub forward_gamma_enable: bool,
    pub lut_3d_enable: bool,
}

impl Default for IecpParams {
    fn default() -> Self {
        Self {
            std_enable: false,
            std_detection_threshold: 0,
            ace_enable: false,
            ace_skin_threshold: 0,
            tcc_enable: false,
            tcc_saturation_factor: 0x40,
            csc_enable: false,
            // Identity in S2.16.
            csc_coeff: [0x10000, 0, 0, 0, 0x10000, 0, 0, 0, 0x10000],
            csc_offset: [0; 3],
            forward_gamma_enable: false,
            lut_3d_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GamutParams {
    pub compression_enable: bool,
    pub expansion_enable: bool,
    pub gamut_coeff: [i32; 9],
}

impl Default for GamutParams {
    fn default() -> Self {
        Self {
            compression_enable: false,
            expansion_enable: false,
            gamut_coeff: [0x10000, 0, 0, 0, 0x10000, 0, 0, 0, 0x10000],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VeboxStateParams {
    pub mode: VeboxMode,
    /// Reference heap states through the kernel-access twin instead of the
    /// driver resource (compute-context consumers).
    pub use_kernel_resource: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VeboxSurfaceParams {
    pub resource: ResourceHandle,
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub tile_mode: TileMode,
    pub offset: u32,
}

/// Surfaces referenced by one VEB_DI_IECP pass.
#[derive(Debug, Clone, Copy)]
pub struct DiIecpParams {
    pub width: u32,
    pub height: u32,
    pub start_x: u32,
    pub input: ResourceHandle,
    pub output: ResourceHandle,
    /// Motion-history surface, read and written across frames when the
    /// deinterlacer runs.
    pub stmm: Option<ResourceHandle>,
}

// =============================================================================
// Interface
// =============================================================================

pub struct VeboxInterface {
    os: Arc<dyn OsInterface>,
    generation: Generation,
    settings: VeboxSettings,
    wait: WaitBudget,
    heap: Option<VeboxHeap>,
}

impl std::fmt::Debug for VeboxInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VeboxInterface")
            .field("generation", &self.generation)
            .field("settings", &self.settings)
            .field("wait", &self.wait)
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

impl VeboxInterface {
    /// Build the interface and its state heap for one device.
    pub fn new(
        os: Arc<dyn OsInterface>,
        generation: Generation,
        options: VeboxOptions,
    ) -> Result<Self> {
        let mut settings = generation.settings();
        if let Some(n) = options.num_instances {
            settings.num_instances = n;
        }
        if (settings.dndi_state_size as usize) < DNDI_STATE_BYTES
            || (settings.iecp_state_size as usize) < IECP_STATE_BYTES
            || (settings.gamut_state_size as usize) < GAMUT_STATE_BYTES
        {
            return Err(HalError::InvalidParameter("section smaller than state block"));
        }

        let heap = VeboxHeap::create(os.as_ref(), &settings)?;
        info!(
            "vebox interface up: {:?}, {} heap instances, kmd tracking {}",
            generation,
            settings.num_instances,
            os.kmd_frame_tracking()
        );
        Ok(Self {
            os,
            generation,
            settings,
            wait: options.wait,
            heap: Some(heap),
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn num_instances(&self) -> u32 {
        self.settings.num_instances
    }

    /// Tear down the state heap and its GPU allocations. Safe to call more
    /// than once, and on an interface whose heap creation failed.
    pub fn destroy_heap(&mut self) {
        if let Some(heap) = self.heap.take() {
            heap.release(self.os.as_ref());
        }
    }

    fn heap(&self) -> Result<&VeboxHeap> {
        self.heap.as_ref().ok_or(HalError::HeapNotCreated)
    }

    fn heap_mut(&mut self) -> Result<&mut VeboxHeap> {
        self.heap.as_mut().ok_or(HalError::HeapNotCreated)
    }

    /// Claim the next heap instance for this frame. See
    /// [`VeboxHeap::assign`] for the wait/timeout behavior.
    pub fn assign_state(&mut self) -> Result<()> {
        let os = self.os.clone();
        let wait = self.wait;
        self.heap_mut()?.assign(os.as_ref(), &wait)
    }

    /// Commit the current instance as in flight; call after the command
    /// buffer referencing it is fully built, immediately before submit.
    pub fn update_sync(&mut self) -> Result<()> {
        let os = self.os.clone();
        self.heap_mut()?.update_sync(os.as_ref());
        Ok(())
    }

    pub fn heap_info(&self) -> Result<VeboxHeapInfo> {
        Ok(self.heap()?.info())
    }

    /// Override the current-state cursor (scalability replay paths).
    pub fn set_heap_state_index(&mut self, index: usize) -> Result<()> {
        self.heap_mut()?.set_state_index(index)
    }

    /// Instances still in flight after the last refresh (diagnostics).
    pub fn instances_in_use(&self) -> Result<usize> {
        Ok(self.heap()?.instances_in_use())
    }

    // -------------------------------------------------------------------------
    // Heap-resident state writers
    // -------------------------------------------------------------------------

    pub fn set_dndi_state(&mut self, params: &DndiParams) -> Result<()> {
        let block = DndiState {
            denoise_enable: params.dn_enable as u32,
            denoise_history_delta: params.denoise_history_delta,
            denoise_maximum_history: params.denoise_maximum_history,
            denoise_asd_threshold: params.denoise_asd_threshold,
            denoise_stad_threshold: params.denoise_stad_threshold,
            temporal_diff_threshold: params.temporal_diff_threshold,
            low_temporal_diff_threshold: params.low_temporal_diff_threshold,
            chroma_denoise_enable: params.chroma_dn_enable as u32,
            chroma_stad_threshold: params.chroma_stad_threshold,
            di_enable: params.di_enable as u32,
            fmd_enable: params.fmd_enable as u32,
            scene_change_detect_enable: params.scene_change_detect as u32,
            progressive_dn: params.progressive_dn as u32,
            // Fixed motion-history blend constant, all generations.
            stmm_c2: 2,
            _reserved: [0; 2],
        };
        let heap = self.heap_mut()?;
        let offset = heap.section_offsets().dndi_state;
        write_state_block(&block, heap.cur_section_mut(offset, DNDI_STATE_BYTES));
        Ok(())
    }

    pub fn set_iecp_state(&mut self, params: &IecpParams) -> Result<()> {
        // Sections that do not exist on this generation cannot be enabled.
        let forward_gamma = params.forward_gamma_enable && self.generation.has_forward_gamma();
        let lut_3d = params.lut_3d_enable && self.generation.has_3dlut();

        let block = IecpState {
            std_enable: params.std_enable as u32,
            std_detection_threshold: params.std_detection_threshold,
            ace_enable: params.ace_enable as u32,
            ace_skin_threshold: params.ace_skin_threshold,
            tcc_enable: params.tcc_enable as u32,
            tcc_saturation_factor: params.tcc_saturation_factor,
            csc_enable: params.csc_enable as u32,
            csc_coeff: params.csc_coeff,
            csc_offset: params.csc_offset,
            forward_gamma_enable: forward_gamma as u32,
            lut_3d_enable: lut_3d as u32,
            _reserved: [0; 2],
        };
        let heap = self.heap_mut()?;
        let offset = heap.section_offsets().iecp_state;
        write_state_block(&block, heap.cur_section_mut(offset, IECP_STATE_BYTES));
        Ok(())
    }

    pub fn set_gamut_state(&mut self, params: &GamutParams) -> Result<()> {
        let block = GamutState {
            compression_enable: params.compression_enable as u32,
            expansion_enable: params.expansion_enable as u32,
            gamut_coeff: params.gamut_coeff,
            _reserved: [0; 2],
        };
        let heap = self.heap_mut()?;
        let offset = heap.section_offsets().gamut_state;
        write_state_block(&block, heap.cur_section_mut(offset, GAMUT_STATE_BYTES));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Command emitters
    // -------------------------------------------------------------------------

    /// Emit VEBOX_STATE: the mode word plus graphics-address pointers to
    /// the state sections of the current heap instance.
    pub fn add_vebox_state(
        &mut self,
        cmd: &mut CommandBuffer,
        params: &VeboxStateParams,
    ) -> Result<()> {
        let generation = self.generation;
        let heap = self.heap()?;
        let info = heap.info();
        let resource = if params.use_kernel_resource {
            info.kernel_resource
        } else {
            info.driver_resource
        };
        let instance_base = heap.cur_instance_offset();

        // Payload: layout version over the mode word, then one address
        // dword per state section.
        let dw0 = (STATE_LAYOUT_VERSION << 24) | params.mode.pack();
        let base = cmd.add_command(CMD_VEBOX_STATE, &[dw0, 0, 0, 0, 0, 0])?;
        cmd.patch_gfx_address(base, 2, resource, instance_base + info.offsets.dndi_state)?;
        cmd.patch_gfx_address(base, 3, resource, instance_base + info.offsets.iecp_state)?;
        cmd.patch_gfx_address(base, 4, resource, instance_base + info.offsets.gamut_state)?;
        if generation.has_forward_gamma() {
            cmd.patch_gfx_address(
                base,
                5,
                resource,
                instance_base + info.offsets.gamma_correction_state,
            )?;
        }
        if generation.has_3dlut() {
            cmd.patch_gfx_address(base, 6, resource, instance_base + info.offsets.hdr_state)?;
        }
        Ok(())
    }

    /// Emit VEBOX_SURFACE_STATE for the input and output surfaces.
    pub fn add_vebox_surfaces(
        &mut self,
        cmd: &mut CommandBuffer,
        input: &VeboxSurfaceParams,
        output: &VeboxSurfaceParams,
    ) -> Result<()> {
        self.heap()?; // surfaces are only legal with an assigned pipeline
        for (surface, is_output) in [(input, 0u32), (output, 1u32)] {
            if surface.width == 0 || surface.height == 0 {
                return Err(HalError::InvalidParameter("zero surface dimension"));
            }
            let base = cmd.add_command(
                CMD_VEBOX_SURFACE_STATE,
                &[
                    is_output,
                    surface.format as u32,
                    surface.width,
                    surface.height,
                    surface.pitch,
                    surface.tile_mode as u32,
                    0, // surface base address, patched
                ],
            )?;
            cmd.patch_gfx_address(base, 7, surface.resource, surface.offset)?;
        }
        Ok(())
    }

    /// Emit VEB_DI_IECP, the per-frame execution command.
    pub fn add_di_iecp(&mut self, cmd: &mut CommandBuffer, params: &DiIecpParams) -> Result<()> {
        self.heap()?;
        if params.width == 0 || params.height == 0 {
            return Err(HalError::InvalidParameter("zero frame dimension"));
        }
        let base = cmd.add_command(
            CMD_VEB_DI_IECP,
            &[
                params.start_x,
                params.width,
                params.height,
                0, // input address, patched
                0, // output address, patched
                0, // STMM address, patched when present
            ],
        )?;
        cmd.patch_gfx_address(base, 4, params.input, 0)?;
        cmd.patch_gfx_address(base, 5, params.output, 0)?;
        if let Some(stmm) = params.stmm {
            cmd.patch_gfx_address(base, 6, stmm, 0)?;
        }
        Ok(())
    }

    /// Append the end-of-frame tag flush and hand the buffer to the engine.
    /// [`VeboxInterface::update_sync`] must already have committed the
    /// current instance.
    pub fn submit(&mut self, cmd: &mut CommandBuffer) -> Result<()> {
        let heap = self.heap()?;
        let tag = heap.cur_sync_tag();
        let info = heap.info();

        cmd.add_command(CMD_FLUSH_TAG_WRITE, &[tag])?;
        if !self.os.kmd_frame_tracking() {
            // Engine writes the software tag into the heap sync word.
            cmd.add_tag_write(info.driver_resource, info.sync_offset, tag);
        }

        debug!(
            "submitting frame on instance {} (tag {}, {} dwords)",
            info.cur_state,
            tag,
            cmd.dwords().len()
        );
        self.os.submit(GpuContext::Vebox, cmd)
    }
}

impl Drop for VeboxInterface {
    fn drop(&mut self) {
        self.destroy_heap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mos::{AllocParams, SoftOs};
    use std::time::Duration;

    fn options(instances: u32) -> VeboxOptions {
        VeboxOptions {
            num_instances: Some(instances),
            wait: WaitBudget {
                iterations: 3,
                event_timeout: Duration::from_millis(1),
            },
        }
    }

    fn surface(os: &SoftOs, bytes: usize) -> ResourceHandle {
        os.allocate_resource(&AllocParams {
            name: "surface",
            bytes,
            lockable: false,
        })
        .unwrap()
    }

    fn frame_surfaces(os: &SoftOs) -> (VeboxSurfaceParams, VeboxSurfaceParams) {
        let make = |resource| VeboxSurfaceParams {
            resource,
            format: SurfaceFormat::Nv12,
            width: 1920,
            height: 1080,
            pitch: 2048,
            tile_mode: TileMode::TileY,
            offset: 0,
        };
        (
            make(surface(os, 2048 * 1620)),
            make(surface(os, 2048 * 1620)),
        )
    }

    #[test]
    fn destroy_heap_is_idempotent() {
        let os = Arc::new(SoftOs::new(false, false));
        let mut vebox = VeboxInterface::new(os.clone(), Generation::Gen9, options(2)).unwrap();
        vebox.destroy_heap();
        vebox.destroy_heap();
        assert!(matches!(vebox.assign_state(), Err(HalError::HeapNotCreated)));
        drop(vebox); // Drop runs destroy a third time
        assert_eq!(os.live_resources(), 0);
    }

    #[test]
    fn heap_creation_failure_leaks_nothing() {
        let os = Arc::new(SoftOs::new(false, false));
        os.fail_alloc_after(1);
        assert!(VeboxInterface::new(os.clone(), Generation::Gen8, options(2)).is_err());
        assert_eq!(os.live_resources(), 0);
    }

    #[test]
    fn oversized_ring_override_is_rejected() {
        // Gen10 carries the largest instances; a config-supplied ring depth
        // whose total leaves u32 range must fail cleanly, not wrap into an
        // undersized heap.
        let os = Arc::new(SoftOs::new(false, false));
        let err =
            VeboxInterface::new(os.clone(), Generation::Gen10, options(150_000)).unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));
        assert_eq!(os.live_resources(), 0);
    }

    #[test]
    fn vebox_state_carries_the_layout_version() {
        let os = Arc::new(SoftOs::new(false, false));
        let mut vebox = VeboxInterface::new(os, Generation::Gen9, options(2)).unwrap();
        vebox.assign_state().unwrap();

        let mode = VeboxMode {
            dn_enable: true,
            iecp_enable: true,
            ..Default::default()
        };
        let mut cmd = CommandBuffer::new(64);
        vebox
            .add_vebox_state(
                &mut cmd,
                &VeboxStateParams {
                    mode,
                    use_kernel_resource: false,
                },
            )
            .unwrap();
        // Payload dword 0: version in the top byte, enable bits below it.
        assert_eq!(cmd.dwords()[1] >> 24, crate::state::STATE_LAYOUT_VERSION);
        assert_eq!(cmd.dwords()[1] & 0x00FF_FFFF, mode.pack());
    }

    #[test]
    fn gamma_pointer_only_emitted_on_gen9_plus() {
        for (generation, expect_gamma) in [(Generation::Gen8, false), (Generation::Gen9, true)] {
            let os = Arc::new(SoftOs::new(false, false));
            let mut vebox = VeboxInterface::new(os, generation, options(2)).unwrap();
            vebox.assign_state().unwrap();

            let mut cmd = CommandBuffer::new(64);
            vebox
                .add_vebox_state(&mut cmd, &VeboxStateParams::default())
                .unwrap();
            // DNDI + IECP + gamut always, gamma only when the section exists.
            let expected = if expect_gamma { 4 } else { 3 };
            assert_eq!(cmd.patches().len(), expected);
        }
    }

    #[test]
    fn state_pointers_track_the_assigned_instance() {
        let os = Arc::new(SoftOs::new(false, false));
        let mut vebox = VeboxInterface::new(os, Generation::Gen8, options(4)).unwrap();
        let info = vebox.heap_info().unwrap();

        vebox.assign_state().unwrap();
        vebox.update_sync().unwrap();
        vebox.assign_state().unwrap(); // second instance

        let mut cmd = CommandBuffer::new(64);
        vebox
            .add_vebox_state(&mut cmd, &VeboxStateParams::default())
            .unwrap();
        assert_eq!(cmd.patches()[0].offset, info.instance_size); // instance 1, DNDI at 0
        assert_eq!(
            cmd.patches()[1].offset,
            info.instance_size + info.offsets.iecp_state
        );
    }

    #[test]
    fn kernel_resource_selects_the_twin_allocation() {
        let os = Arc::new(SoftOs::new(false, false));
        let mut vebox = VeboxInterface::new(os, Generation::Gen8, options(2)).unwrap();
        let info = vebox.heap_info().unwrap();
        vebox.assign_state().unwrap();

        let mut cmd = CommandBuffer::new(64);
        vebox
            .add_vebox_state(
                &mut cmd,
                &VeboxStateParams {
                    use_kernel_resource: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cmd.patches().iter().all(|p| p.resource == info.kernel_resource));
    }

    #[test]
    fn lut_enable_is_masked_below_gen10() {
        let os = Arc::new(SoftOs::new(false, false));
        let mut vebox = VeboxInterface::new(os, Generation::Gen9, options(2)).unwrap();
        vebox.assign_state().unwrap();
        vebox
            .set_iecp_state(&IecpParams {
                lut_3d_enable: true,
                forward_gamma_enable: true,
                ..Default::default()
            })
            .unwrap();

        let info = vebox.heap_info().unwrap();
        let heap = vebox.heap.as_mut().unwrap();
        let mem = heap.cur_section_mut(info.offsets.iecp_state, IECP_STATE_BYTES);
        // SAFETY: section holds the IecpState just written.
        let block: IecpState = unsafe { std::ptr::read_unaligned(mem.as_ptr() as *const _) };
        assert_eq!(block.forward_gamma_enable, 1);
        assert_eq!(block.lut_3d_enable, 0);
    }

    #[test]
    fn full_frame_cycle_against_the_software_engine() {
        let os = Arc::new(SoftOs::new(false, false));
        let mut vebox = VeboxInterface::new(os.clone(), Generation::Gen9, options(2)).unwrap();
        let (input, output) = frame_surfaces(&os);
        let stmm = surface(&os, 2048 * 1080);

        // Twice the ring depth: reuse only works if completions retire slots.
        for frame in 0..4u32 {
            vebox.assign_state().unwrap();
            vebox
                .set_dndi_state(&DndiParams {
                    dn_enable: true,
                    di_enable: true,
                    denoise_stad_threshold: 0x44,
                    ..Default::default()
                })
                .unwrap();
            vebox.set_iecp_state(&IecpParams::default()).unwrap();

            let mut cmd = CommandBuffer::new(256);
            vebox
                .add_vebox_state(
                    &mut cmd,
                    &VeboxStateParams {
                        mode: VeboxMode {
                            dn_enable: true,
                            di_enable: true,
                            ..Default::default()
                        },
                        use_kernel_resource: false,
                    },
                )
                .unwrap();
            vebox.add_vebox_surfaces(&mut cmd, &input, &output).unwrap();
            vebox
                .add_di_iecp(
                    &mut cmd,
                    &DiIecpParams {
                        width: 1920,
                        height: 1080,
                        start_x: 0,
                        input: input.resource,
                        output: output.resource,
                        stmm: Some(stmm),
                    },
                )
                .unwrap();
            vebox.update_sync().unwrap();
            vebox.submit(&mut cmd).unwrap();

            // Engine retires the frame before the ring wraps back onto it.
            os.complete_next();
            assert_eq!(vebox.heap_info().unwrap().cur_state, (frame % 2) as usize);
        }
    }
}
