//! VEBOX HAL Demo Service
//!
//! Drives the HAL against the software OS backend:
//! 1. Builds the state heap for the configured hardware generation
//! 2. Runs a frame loop: claim a heap instance, pack DNDI/IECP state,
//!    assemble the command stream, commit and submit
//! 3. A worker thread plays the engine, retiring frames and signaling the
//!    batch-buffer-complete event

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vebox_hal::cmdbuf::CommandBuffer;
use vebox_hal::config::Config;
use vebox_hal::heap::WaitBudget;
use vebox_hal::mos::{AllocParams, OsInterface, ResourceHandle, SoftOs};
use vebox_hal::state::{DiOutputFrames, SurfaceFormat, TileMode, VeboxMode};
use vebox_hal::vebox::{
    DiIecpParams, DndiParams, Generation, IecpParams, VeboxInterface, VeboxOptions,
    VeboxStateParams, VeboxSurfaceParams,
};

const FRAME_WIDTH: u32 = 1920;
const FRAME_HEIGHT: u32 = 1080;
const FRAME_PITCH: u32 = 2048;

fn parse_generation(name: &str) -> Result<Generation> {
    match name {
        "gen8" => Ok(Generation::Gen8),
        "gen9" => Ok(Generation::Gen9),
        "gen10" => Ok(Generation::Gen10),
        other => bail!("unknown generation '{}'", other),
    }
}

fn alloc_surface(os: &SoftOs, name: &'static str) -> Result<ResourceHandle> {
    // NV12: luma plane plus half-height chroma.
    let bytes = (FRAME_PITCH * FRAME_HEIGHT * 3 / 2) as usize;
    Ok(os.allocate_resource(&AllocParams {
        name,
        bytes,
        lockable: false,
    })?)
}

fn run_frames(
    vebox: &mut VeboxInterface,
    os: &SoftOs,
    config: &Config,
    shutdown: &AtomicBool,
) -> Result<u64> {
    let input = alloc_surface(os, "DemoInput")?;
    let output = alloc_surface(os, "DemoOutput")?;
    let stmm = alloc_surface(os, "DemoStmm")?;

    let make_surface = |resource| VeboxSurfaceParams {
        resource,
        format: SurfaceFormat::Nv12,
        width: FRAME_WIDTH,
        height: FRAME_HEIGHT,
        pitch: FRAME_PITCH,
        tile_mode: TileMode::TileY,
        offset: 0,
    };
    let input_params = make_surface(input);
    let output_params = make_surface(output);

    let mut cmd = CommandBuffer::new(512);
    let mut completed = 0u64;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested");
            break;
        }
        if config.frames != 0 && completed >= config.frames {
            break;
        }

        vebox.assign_state()?;
        vebox.set_dndi_state(&DndiParams {
            dn_enable: true,
            di_enable: true,
            denoise_stad_threshold: 0x44,
            denoise_maximum_history: 192,
            chroma_dn_enable: true,
            chroma_stad_threshold: 0x3C,
            fmd_enable: true,
            ..Default::default()
        })?;
        vebox.set_iecp_state(&IecpParams {
            std_enable: true,
            std_detection_threshold: 0x20,
            forward_gamma_enable: true,
            ..Default::default()
        })?;

        cmd.clear();
        vebox.add_vebox_state(
            &mut cmd,
            &VeboxStateParams {
                mode: VeboxMode {
                    dn_enable: true,
                    di_enable: true,
                    iecp_enable: true,
                    gamut_enable: false,
                    di_output_frames: DiOutputFrames::CurrentOnly,
                },
                use_kernel_resource: false,
            },
        )?;
        vebox.add_vebox_surfaces(&mut cmd, &input_params, &output_params)?;
        vebox.add_di_iecp(
            &mut cmd,
            &DiIecpParams {
                width: FRAME_WIDTH,
                height: FRAME_HEIGHT,
                start_x: 0,
                input,
                output,
                stmm: Some(stmm),
            },
        )?;
        vebox.update_sync()?;
        vebox.submit(&mut cmd)?;
        completed += 1;

        if completed % 32 == 0 {
            info!(
                "{} frames submitted, {} heap instances in flight",
                completed,
                vebox.instances_in_use()?
            );
        }
    }

    os.free_resource(input);
    os.free_resource(output);
    os.free_resource(stmm);
    Ok(completed)
}

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(true)
        .init();

    info!("VEBOX HAL demo starting...");

    // Load config from the given path, or run with defaults
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    info!("Configuration loaded: {:?}", config);

    let generation = parse_generation(&config.generation)?;
    let os = Arc::new(SoftOs::new(config.kmd_frame_tracking, config.null_hw));

    // Setup Ctrl+C handler
    let shutdown = Arc::new(AtomicBool::new(false));
    let ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        ctrlc_shutdown.store(true, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl+C handler");

    // Engine worker retires one frame per latency period
    let engine_handle = os.clone().spawn_engine(
        Duration::from_micros(config.engine_latency_us),
        shutdown.clone(),
    );

    let options = VeboxOptions {
        num_instances: (config.num_instances != 0).then_some(config.num_instances),
        wait: WaitBudget {
            iterations: config.wait_iterations,
            event_timeout: Duration::from_millis(config.event_timeout_ms),
        },
    };
    let mut vebox = VeboxInterface::new(os.clone(), generation, options)?;

    let result = run_frames(&mut vebox, &os, &config, &shutdown);
    match &result {
        Ok(frames) => info!("Processed {} frames", frames),
        Err(e) => error!("Frame loop failed: {}", e),
    }

    vebox.destroy_heap();
    shutdown.store(true, Ordering::Relaxed);
    if engine_handle.join().is_err() {
        warn!("engine thread panicked");
    }

    if os.live_resources() != 0 {
        warn!("{} resources still live at exit", os.live_resources());
    }
    info!("VEBOX HAL demo shutting down");
    result.map(|_| ())
}
