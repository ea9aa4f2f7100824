//! # Planar - Display Plane Composer
//!
//! Diagnostic binary for the Planar hardware-composer library: validates
//! the configured display topology, brings the device up (against real
//! hardware when built with `hw-drm`, otherwise headless), and can push a
//! few synthetic frames through the present path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use planar::layer::{BufferKey, Layer, NativeBufferDesc, PixelFormat, Rect};
use planar::logging::init_logging;
use planar::{GpuDevice, PlanarConfig};

#[derive(Parser)]
#[command(name = "planar")]
#[command(about = "A hardware composer presenting layers through display-plane scanout")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/planar/planar.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Force headless mode (no kernel device access)
    #[arg(long)]
    headless: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Present this many synthetic frames to display 0, then exit
    #[arg(long, default_value_t = 0)]
    frames: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    info!("starting planar {}", planar::VERSION);

    let config = PlanarConfig::load_or_default(&cli.config);
    if cli.check {
        config.validate()?;
        println!("configuration ok: {}", cli.config);
        return Ok(());
    }

    let mut device = GpuDevice::new(config);
    bring_up(&mut device, cli.headless)?;

    for display in device.get_all_displays() {
        info!(
            "endpoint: {} ({}x{}, connected: {})",
            display.display_name(),
            display.width(),
            display.height(),
            display.is_connected()
        );
    }

    if cli.frames > 0 {
        present_synthetic_frames(&device, cli.frames)?;
        return Ok(());
    }

    // Idle service loop: hotplug and vsync threads do the work until the
    // operator interrupts us.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    info!("running; press Ctrl-C to exit");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    info!("shutting down");
    Ok(())
}

#[cfg(feature = "hw-drm")]
fn bring_up(device: &mut GpuDevice, force_headless: bool) -> Result<()> {
    use planar::drm::card::{DrmCard, UdevHotplugSource};
    use planar::resources::NullImporter;
    use std::path::Path;

    if force_headless {
        device.initialize_headless();
        return Ok(());
    }

    let card_path = device.config().device.card_path.clone();
    match DrmCard::open(Path::new(&card_path)) {
        Ok(card) => {
            let hotplug = UdevHotplugSource::new()?;
            device.initialize(Arc::new(card), Arc::new(NullImporter), Box::new(hotplug))?;
        }
        Err(err) => {
            error!("cannot open {}: {}; running headless", card_path, err);
            device.initialize_headless();
        }
    }
    Ok(())
}

#[cfg(not(feature = "hw-drm"))]
fn bring_up(device: &mut GpuDevice, _force_headless: bool) -> Result<()> {
    // Without the hardware backend the embedder supplies the kernel device;
    // standalone runs get the headless endpoint.
    device.initialize_headless();
    Ok(())
}

fn present_synthetic_frames(device: &GpuDevice, frames: u32) -> Result<()> {
    let display = device
        .get_display(0)
        .ok_or_else(|| anyhow::anyhow!("no display 0"))?;
    let width = display.width().max(1);
    let height = display.height().max(1);

    for frame in 0..frames {
        let layer = Layer::new(
            NativeBufferDesc::linear(BufferKey(frame as u64 + 1), width, height, PixelFormat::XRGB8888),
            Rect::new(0, 0, width as i32, height as i32),
        );
        match display.present(vec![layer], false) {
            Ok(status) => {
                let fence = status.into_retire_fence();
                info!("frame {} presented (retire fence: {})", frame, fence.is_some());
            }
            Err(err) => error!("frame {} failed: {}", frame, err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["planar"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.headless);
        assert_eq!(cli.frames, 0);
    }

    #[test]
    fn test_cli_flags() {
        let cli =
            Cli::try_parse_from(["planar", "--debug", "--headless", "--frames", "3"]).unwrap();
        assert!(cli.debug);
        assert!(cli.headless);
        assert_eq!(cli.frames, 3);
    }
}
