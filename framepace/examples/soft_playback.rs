// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Plays a synthetic clip through the software backend in real time.
//!
//! A producer thread renders a moving gradient and queues one picture per
//! frame period. The main thread acts as the display: it ticks the presenter
//! at the simulated refresh rate and grabs a small capture now and then.
//! The final statistics are printed as JSON.
//!
//! Run: cargo run --example soft_playback -- --help

use std::{
    error::Error as StdError,
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use framepace::{
    BackendRegistry, CaptureFlags, Error, PixelFormat, PresentStep, Presenter, PresenterSettings,
    ReferenceClock, SystemClock, UserState, VideoConfig, VideoPicture,
    interlace::{DeinterlaceMode, FieldSync, InterlaceMethod},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Paced playback of a synthetic clip")]
struct Args {
    /// Stream frame rate.
    #[arg(long, default_value_t = 25.0)]
    fps: f64,

    /// Number of frames to play.
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Simulated display refresh rate in Hz.
    #[arg(long, default_value_t = 60.0)]
    refresh: f64,

    /// Buffer pool size, 0 for the backend's choice.
    #[arg(long, default_value_t = 0)]
    buffers: usize,

    /// Picture width.
    #[arg(long, default_value_t = 320)]
    width: u32,

    /// Picture height.
    #[arg(long, default_value_t = 180)]
    height: u32,

    /// Presenter settings as JSON.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Mark frames as interlaced, top field first.
    #[arg(long)]
    interlaced: bool,

    /// Capture a thumbnail every N display ticks, 0 to disable.
    #[arg(long, default_value_t = 30)]
    capture_every: u64,
}

fn gradient(width: u32, height: u32, n: u64) -> Result<VideoPicture, Error> {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            let shift = (x as u64 + n * 4) % 256;
            data.extend_from_slice(&[shift as u8, (y * 255 / height.max(1)) as u8, 96, 255]);
        }
    }
    VideoPicture::new(PixelFormat::Bgra, width, height, data)
}

fn produce(presenter: &Presenter, args: &Args, start: u64, stop: &AtomicBool) -> Result<(), Error> {
    let frame_ns = (1e9 / args.fps) as u64;
    let sync = if args.interlaced {
        FieldSync::Top
    } else {
        FieldSync::None
    };
    for n in 0..args.frames {
        let picture = gradient(args.width, args.height, n)?;
        loop {
            match presenter.wait_for_buffer(stop, Duration::from_millis(500)) {
                Ok(_) => break,
                Err(err) if err.is_timeout() => warn!("Display is not draining, still waiting"),
                Err(err) => return Err(err),
            }
        }
        presenter.submit(&picture, start + n * frame_ns, n as f64 / args.fps, sync)?;
    }
    info!("Producer queued {} frames", args.frames);
    Ok(())
}

/// Logs to stdout with thread names, so producer and display lines can be
/// told apart. `RUST_LOG` overrides the default `info` filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .init();
}

fn main() -> Result<(), Box<dyn StdError>> {
    init_tracing();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => PresenterSettings::default(),
    };
    let period = Duration::from_secs_f64(1.0 / args.refresh);
    let clock = Arc::new(SystemClock::new(Some(period)));
    let presenter = Presenter::new(clock.clone(), BackendRegistry::with_defaults(), settings);

    let config = VideoConfig::new(args.width, args.height, args.fps, PixelFormat::Bgra)
        .with_buffers(args.buffers);
    presenter.configure(config)?;
    presenter.set_fullscreen_video(true);
    if args.interlaced {
        presenter.set_deinterlace(DeinterlaceMode::Auto, InterlaceMethod::RenderBob);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let start = clock.now() + 100_000_000;
    let args = Arc::new(args);
    let producer = {
        let presenter = presenter.clone();
        let args = args.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("producer".into())
            .spawn(move || produce(&presenter, &args, start, &stop))?
    };

    let mut ticks = 0_u64;
    while !(producer.is_finished() && presenter.stats().queued == 0) {
        presenter.frame_move();
        presenter.render(true, Default::default(), 255);
        presenter.frame_finish();
        if presenter.step() == PresentStep::Idle {
            thread::sleep(period);
        }

        ticks += 1;
        if args.capture_every > 0 && ticks % args.capture_every == 0 {
            let capture = presenter.alloc_capture();
            presenter.start_capture(&capture, 16, 9, CaptureFlags::IMMEDIATE)?;
            if capture.wait(Duration::ZERO) == UserState::Done {
                let pixels = capture.pixels();
                info!("Tick {ticks}: thumbnail starts with {:?}", &pixels[..4]);
            }
            presenter.release_capture(capture);
        }
    }

    stop.store(true, Ordering::Release);
    match producer.join() {
        Ok(result) => result?,
        Err(_) => return Err("producer thread panicked".into()),
    }

    let stats = presenter.stats();
    info!(
        "Played {} frames in {ticks} ticks, fine adjust {:.6}",
        args.frames,
        clock.fine_adjust()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    presenter.uninit();
    Ok(())
}
