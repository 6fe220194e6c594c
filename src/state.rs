//! Hardware State Layouts
//!
//! Fixed `#[repr(C)]` layouts for the state blocks written into the heap
//! (DNDI, IECP, gamut) and the dword opcodes of the commands that reference
//! them. Field order and widths are part of the engine contract: nothing
//! here may be reordered or resized without revving `STATE_LAYOUT_VERSION`.

use std::ptr;

/// Revision of the block layouts below. VEBOX_STATE carries it in the top
/// byte of its first payload dword so the engine can reject a stream built
/// against a different layout.
pub const STATE_LAYOUT_VERSION: u32 = 1;

/// Engine command streamer works in 64-byte cache lines.
pub const CACHELINE_SIZE: u32 = 64;

/// Round up to a cache line; `None` if the padded size leaves u32 range.
pub const fn checked_align_cacheline(bytes: u32) -> Option<u32> {
    match bytes.checked_add(CACHELINE_SIZE - 1) {
        Some(padded) => Some(padded & !(CACHELINE_SIZE - 1)),
        None => None,
    }
}

// =============================================================================
// Command Opcodes
// =============================================================================

// Pipeline state: 0x0100 - 0x01FF
pub const CMD_VEBOX_STATE: u32 = 0x0101;
pub const CMD_VEBOX_SURFACE_STATE: u32 = 0x0102;

// Execution: 0x0200 - 0x02FF
pub const CMD_VEB_DI_IECP: u32 = 0x0201;

// Sync: 0x0300 - 0x03FF
pub const CMD_FLUSH_TAG_WRITE: u32 = 0x0301;

// =============================================================================
// VEBOX_STATE mode word
// =============================================================================

/// Enable bits carried in the VEBOX_STATE command (not in the heap).
#[derive(Debug, Clone, Copy, Default)]
pub struct VeboxMode {
    pub dn_enable: bool,
    pub di_enable: bool,
    pub iecp_enable: bool,
    pub gamut_enable: bool,
    pub di_output_frames: DiOutputFrames,
}

/// Which deinterlacer output frames are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiOutputFrames {
    #[default]
    Both = 0,
    PreviousOnly = 1,
    CurrentOnly = 2,
}

impl VeboxMode {
    pub fn pack(&self) -> u32 {
        (self.dn_enable as u32)
            | (self.di_enable as u32) << 1
            | (self.iecp_enable as u32) << 2
            | (self.gamut_enable as u32) << 3
            | (self.di_output_frames as u32) << 4
    }
}

// =============================================================================
// Heap-resident state blocks
// =============================================================================

/// Denoise / deinterlace state block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DndiState {
    pub denoise_enable: u32,
    pub denoise_history_delta: u32,
    pub denoise_maximum_history: u32,
    pub denoise_asd_threshold: u32,
    pub denoise_stad_threshold: u32,
    pub temporal_diff_threshold: u32,
    pub low_temporal_diff_threshold: u32,
    pub chroma_denoise_enable: u32,
    pub chroma_stad_threshold: u32,
    pub di_enable: u32,
    pub fmd_enable: u32,
    pub scene_change_detect_enable: u32,
    pub progressive_dn: u32,
    pub stmm_c2: u32,
    pub _reserved: [u32; 2],
}

/// Image-enhancement color pipe state block: spatial denoise (STD), auto
/// contrast (ACE), total color control (TCC) and the output CSC.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IecpState {
    pub std_enable: u32,
    pub std_detection_threshold: u32,
    pub ace_enable: u32,
    pub ace_skin_threshold: u32,
    pub tcc_enable: u32,
    pub tcc_saturation_factor: u32,
    pub csc_enable: u32,
    /// 3x3 matrix, S2.16 fixed point, row major.
    pub csc_coeff: [i32; 9],
    /// Per-channel offsets applied after the matrix.
    pub csc_offset: [i32; 3],
    pub forward_gamma_enable: u32,
    pub lut_3d_enable: u32,
    pub _reserved: [u32; 2],
}

/// Gamut expansion / compression state block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GamutState {
    pub compression_enable: u32,
    pub expansion_enable: u32,
    /// 3x3 matrix, S2.16 fixed point, row major.
    pub gamut_coeff: [i32; 9],
    pub _reserved: [u32; 2],
}

pub const DNDI_STATE_BYTES: usize = std::mem::size_of::<DndiState>();
pub const IECP_STATE_BYTES: usize = std::mem::size_of::<IecpState>();
pub const GAMUT_STATE_BYTES: usize = std::mem::size_of::<GamutState>();

// Layout guards: the engine reads these blocks by offset.
const _: () = assert!(DNDI_STATE_BYTES == 64);
const _: () = assert!(IECP_STATE_BYTES == 92);
const _: () = assert!(GAMUT_STATE_BYTES == 52);

/// Copy a state block into its section of the heap instance.
///
/// Panics if the destination section is smaller than the block; section
/// sizes come from the generation tables and are validated at heap creation.
pub fn write_state_block<T: Copy>(block: &T, dst: &mut [u8]) {
    let bytes = std::mem::size_of::<T>();
    assert!(dst.len() >= bytes, "state section smaller than state block");
    // SAFETY: T is a plain #[repr(C)] value type and dst holds at least
    // `bytes` writable bytes.
    unsafe {
        ptr::copy_nonoverlapping(block as *const T as *const u8, dst.as_mut_ptr(), bytes);
    }
}

// =============================================================================
// Surfaces
// =============================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceFormat {
    #[default]
    Nv12 = 1,
    Yuy2 = 2,
    Argb8 = 3,
    P010 = 4,
    Ayuv = 5,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileMode {
    #[default]
    Linear = 0,
    TileX = 2,
    TileY = 3,
}
