//! Hardware-abstraction layer for VEBOX-class fixed-function video engines.
//!
//! The centerpiece is the state heap ([`heap::VeboxHeap`]): a ring of
//! hardware-state instances in a CPU-locked GPU buffer, fenced by completion
//! tags so a slot is never reused while the engine may still be reading it.
//! On top of it, [`vebox::VeboxInterface`] packs denoise/deinterlace and
//! color-pipe parameters into the current instance and assembles the
//! per-frame command stream for submission through the [`mos::OsInterface`]
//! KMD boundary.
//!
//! One CPU thread drives a heap; the only concurrency managed here is
//! between that thread and the asynchronous engine retiring work.

pub mod cmdbuf;
pub mod config;
pub mod error;
pub mod heap;
pub mod mos;
pub mod state;
pub mod vebox;

pub use cmdbuf::CommandBuffer;
pub use config::Config;
pub use error::{HalError, Result};
pub use heap::{VeboxHeapInfo, VeboxSettings, WaitBudget};
pub use mos::{GpuContext, OsInterface, ResourceHandle, SoftOs};
pub use vebox::{Generation, VeboxInterface, VeboxOptions};
