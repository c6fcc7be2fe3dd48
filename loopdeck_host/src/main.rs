mod placement;
mod project_io;

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, unbounded, Sender};
use loopdeck_engine::capture::CpalCapture;
use loopdeck_engine::export::{encode_wav, upload_recording, DirectoryUploader};
use loopdeck_engine::output::start_output;
use loopdeck_engine::{
    shared_pool, update_pool, EngineCommand, EngineConfig, LoopEngine, Recorder, SharedPool,
};
use loopdeck_shared::{LoopSettings, PlacedSample, SessionSnapshot};

use placement::{load_placements, load_sources, PlacementArg};

#[derive(Parser)]
#[command(name = "loopdeck", about = "Loop sequencer: play, record and bounce loop sessions")]
struct Cli {
    /// Engine config file (JSON). Defaults to ./loopdeck.json when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SessionArgs {
    /// Placements as `path@track:x`, e.g. `kick.wav@1:0.0 snare.wav@2:0.5`
    samples: Vec<PlacementArg>,

    /// Session file to load first
    #[arg(short, long)]
    session: Option<PathBuf>,

    #[arg(long)]
    bpm: Option<f32>,

    #[arg(long)]
    beats: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Play through the default output device
    Play {
        #[command(flatten)]
        session: SessionArgs,

        /// Seconds to play before exiting
        #[arg(long, default_value_t = 16.0)]
        seconds: f64,

        /// Record this many seconds from the default input, then place the take
        #[arg(long)]
        record: Option<f64>,

        /// Track the recorded take is placed on
        #[arg(long, default_value_t = 1)]
        record_track: u32,

        /// Write encoded takes into this directory
        #[arg(long)]
        upload_dir: Option<PathBuf>,

        /// Save the session here on exit
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Render loop cycles offline into a WAV file
    Bounce {
        #[command(flatten)]
        session: SessionArgs,

        #[arg(short, long)]
        out: PathBuf,

        #[arg(long, default_value_t = 4)]
        cycles: u32,

        #[arg(long, default_value_t = 44_100)]
        rate: u32,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from("loopdeck.json"));
    let config = EngineConfig::load_or_default(&config_path);

    match cli.command {
        Command::Play {
            session,
            seconds,
            record,
            record_track,
            upload_dir,
            save,
        } => play(
            &config,
            session,
            seconds,
            record.map(|secs| (secs, record_track)),
            upload_dir,
            save,
        ),
        Command::Bounce {
            session,
            out,
            cycles,
            rate,
        } => bounce(&config, session, &out, cycles, rate),
    }
}

/// Session file (if any) merged with command-line placements and tempo overrides.
/// File samples the session refers to are decoded again under their saved ids.
fn build_session(
    args: &SessionArgs,
    pool: &SharedPool,
    sample_rate: u32,
) -> Result<(SessionSnapshot, Vec<JoinHandle<()>>)> {
    let mut snapshot = match &args.session {
        Some(path) => project_io::load_session_file(path)?,
        None => {
            let defaults = LoopSettings::default();
            SessionSnapshot {
                bpm: defaults.bpm,
                beats_per_loop: defaults.beats_per_loop,
                ..SessionSnapshot::default()
            }
        }
    };
    if let Some(bpm) = args.bpm {
        snapshot.bpm = bpm;
    }
    if let Some(beats) = args.beats {
        snapshot.beats_per_loop = beats;
    }

    let mut decoders = load_sources(&snapshot.sources, pool, sample_rate);
    let (placed, placement_decoders) = load_placements(&args.samples, pool, sample_rate);
    decoders.extend(placement_decoders);
    snapshot.placed_samples.extend(placed);
    Ok((snapshot, decoders))
}

fn restore(cmd_tx: &Sender<EngineCommand>, snapshot: SessionSnapshot) -> Result<()> {
    let (response_tx, response_rx) = bounded(1);
    cmd_tx.send(EngineCommand::Restore { snapshot, response_tx })?;
    response_rx
        .recv_timeout(Duration::from_secs(5))?
        .map_err(|e| anyhow::anyhow!("restore failed: {}", e))
}

fn play(
    config: &EngineConfig,
    args: SessionArgs,
    seconds: f64,
    record: Option<(f64, u32)>,
    upload_dir: Option<PathBuf>,
    save: Option<PathBuf>,
) -> Result<()> {
    let pool = shared_pool();
    let (cmd_tx, cmd_rx) = unbounded();
    let (boundary_tx, boundary_rx) = bounded(64);

    let output = start_output(config, pool.clone(), cmd_rx, boundary_tx)?;
    log::info!("[Host] Output running at {} Hz, {} ch", output.sample_rate, output.channels);

    let (snapshot, decoders) = build_session(&args, &pool, output.sample_rate)?;
    let mut decoders = Some(decoders);
    let mut placed: Vec<PlacedSample> = snapshot.placed_samples.clone();
    restore(&cmd_tx, snapshot)?;
    cmd_tx.send(EngineCommand::Play)?;

    let mut recorder = Recorder::new(config.trim, config.meter_window, config.capture_queue_capacity);
    let mut capture = CpalCapture::new();
    let mut record_until = None;
    if let Some((secs, _)) = record {
        match recorder.start_recording(&mut capture) {
            Ok(()) => record_until = Some(Instant::now() + Duration::from_secs_f64(secs)),
            Err(e) => log::warn!("[Host] Recording unavailable: {}", e),
        }
    }

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    let mut last_meter = Instant::now();
    while Instant::now() < deadline {
        if let Ok(boundary) = boundary_rx.recv_timeout(Duration::from_millis(20)) {
            log::info!("[Host] Loop cycle {} at {:.3}s", boundary.cycle, boundary.at);
        }

        // Resend once decoding settles so a native loop picks up late samples.
        if decoders.as_ref().is_some_and(|ds| ds.iter().all(|h| h.is_finished())) {
            decoders = None;
            cmd_tx.send(EngineCommand::SetPlacedSamples(placed.clone()))?;
        }

        if !recorder.is_recording() {
            continue;
        }
        recorder.poll();
        if last_meter.elapsed() >= Duration::from_millis(250) {
            let level = recorder.level();
            log::debug!("[Host] Input peak {:.3} rms {:.3}", level.peak, level.rms);
            last_meter = Instant::now();
        }

        if record_until.is_some_and(|until| Instant::now() >= until) {
            record_until = None;
            match recorder.stop_recording() {
                Ok(sample) => {
                    if let Some(dir) = &upload_dir {
                        let uploader = DirectoryUploader::new(dir);
                        if let Err(e) = upload_recording(&uploader, &sample.filename, &sample.buffer) {
                            log::error!("[Host] {}", e);
                        }
                    }
                    let track_id = record.map_or(1, |(_, track)| track);
                    placed.push(PlacedSample::new(sample.id, sample.filename.clone(), track_id, 0.0));
                    update_pool(&pool, |p| p.insert(sample));
                    cmd_tx.send(EngineCommand::SetPlacedSamples(placed.clone()))?;
                }
                Err(e) => log::warn!("[Host] Recording discarded: {}", e),
            }
        }
    }

    if let Some(path) = save {
        let (snap_tx, snap_rx) = bounded(1);
        cmd_tx.send(EngineCommand::GetSnapshot(snap_tx))?;
        let snapshot = snap_rx.recv_timeout(Duration::from_secs(2))?;
        project_io::save_session_file(&snapshot, &path)?;
    }

    recorder.cancel();
    cmd_tx.send(EngineCommand::Stop)?;
    std::thread::sleep(Duration::from_millis(100));
    log::info!("[Host] Done.");
    Ok(())
}

fn bounce(config: &EngineConfig, args: SessionArgs, out: &Path, cycles: u32, rate: u32) -> Result<()> {
    let pool = shared_pool();
    let (snapshot, decoders) = build_session(&args, &pool, rate)?;
    for handle in decoders {
        if handle.join().is_err() {
            log::error!("[Host] A decoder thread panicked");
        }
    }

    let mut engine = LoopEngine::new(rate, config, pool);
    engine.restore(snapshot)?;
    engine.play();

    let duration = engine.settings().loop_duration();
    let frames = (duration * cycles as f64 * rate as f64).ceil() as usize;
    let rendered = engine.render_offline(frames, config.block_size as usize);
    engine.stop();

    std::fs::write(out, encode_wav(&rendered)?)?;
    log::info!(
        "[Host] Bounced {} cycles ({:.2}s, peak {:.3}) to {}",
        cycles,
        rendered.duration_seconds(),
        rendered.peak(),
        out.display()
    );
    Ok(())
}
