//! Sample placements given on the command line, and their background decoding.

use std::path::PathBuf;
use std::str::FromStr;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context};
use loopdeck_engine::decode::decode_file_for_context;
use loopdeck_engine::{update_pool, Sample, SharedPool};
use loopdeck_shared::{PersistedSource, PlacedSample, SampleId, SampleProvenance};

/// `path@track:x`, e.g. `kick.wav@1:0.0`. The track defaults to 1 and the
/// offset to 0 when left out (`kick.wav`, `kick.wav@2`).
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementArg {
    pub path: PathBuf,
    pub track_id: u32,
    pub x_pos: f64,
}

impl FromStr for PlacementArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, slot) = match s.rsplit_once('@') {
            Some((path, slot)) => (path, Some(slot)),
            None => (s, None),
        };
        if path.is_empty() {
            bail!("placement '{}' has no file", s);
        }

        let (track_id, x_pos) = match slot {
            None => (1, 0.0),
            Some(slot) => {
                let (track, x) = slot.split_once(':').unwrap_or((slot, "0"));
                let track_id: u32 = track.parse().with_context(|| format!("bad track in '{}'", s))?;
                let x_pos: f64 = x.parse().with_context(|| format!("bad offset in '{}'", s))?;
                (track_id, x_pos)
            }
        };

        if track_id == 0 {
            return Err(anyhow!("track ids start at 1 ('{}')", s));
        }
        if !(0.0..1.0).contains(&x_pos) {
            bail!("offset must be in [0, 1) ('{}')", s);
        }

        Ok(Self {
            path: PathBuf::from(path),
            track_id,
            x_pos,
        })
    }
}

/// Register every placement as pending and decode each file on its own thread.
/// Failed decodes are marked in the pool and skipped by playback.
pub fn load_placements(
    args: &[PlacementArg],
    pool: &SharedPool,
    sample_rate: u32,
) -> (Vec<PlacedSample>, Vec<JoinHandle<()>>) {
    let mut placed = Vec::with_capacity(args.len());
    let mut handles = Vec::with_capacity(args.len());

    for arg in args {
        let id = SampleId::new();
        let filename = arg
            .path
            .file_name()
            .map_or_else(|| arg.path.display().to_string(), |n| n.to_string_lossy().into_owned());
        placed.push(PlacedSample::new(id, filename.clone(), arg.track_id, arg.x_pos));
        handles.extend(spawn_decode(id, filename, arg.path.clone(), pool, sample_rate));
    }

    (placed, handles)
}

/// Reload the file samples a saved session refers to, under their saved ids.
/// Samples already in the pool are left alone.
pub fn load_sources(sources: &[PersistedSource], pool: &SharedPool, sample_rate: u32) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for source in sources {
        if pool.load().entry(source.sample_id).is_some() {
            continue;
        }
        match &source.provenance {
            SampleProvenance::Static { path } => handles.extend(spawn_decode(
                source.sample_id,
                source.filename.clone(),
                PathBuf::from(path),
                pool,
                sample_rate,
            )),
            SampleProvenance::Remote { key } => {
                let reason = format!("remote object '{}' is not reachable offline", key);
                update_pool(pool, |p| p.mark_failed(source.sample_id, source.filename.clone(), reason));
            }
            // Recordings travel as PCM inside the session.
            SampleProvenance::Recording => {}
        }
    }
    handles
}

fn spawn_decode(
    id: SampleId,
    filename: String,
    path: PathBuf,
    pool: &SharedPool,
    sample_rate: u32,
) -> Option<JoinHandle<()>> {
    update_pool(pool, |p| p.mark_pending(id, filename.clone()));

    let pool = pool.clone();
    let thread_name = format!("decode-{}", filename);
    let display = path.display().to_string();
    let spawned = thread::Builder::new()
        .name(thread_name)
        .spawn(move || match decode_file_for_context(&path, sample_rate) {
            Ok(buffer) => {
                let provenance = SampleProvenance::Static {
                    path: path.display().to_string(),
                };
                update_pool(&pool, |p| p.insert(Sample::new(id, filename, provenance, buffer)));
            }
            Err(e) => update_pool(&pool, |p| p.mark_failed(id, filename, e.to_string())),
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("[Loader] Could not spawn decoder for {}: {}", display, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_short_forms() {
        let full: PlacementArg = "drums/kick.wav@3:0.25".parse().unwrap();
        assert_eq!(full.path, PathBuf::from("drums/kick.wav"));
        assert_eq!((full.track_id, full.x_pos), (3, 0.25));

        let bare: PlacementArg = "snare.wav".parse().unwrap();
        assert_eq!((bare.track_id, bare.x_pos), (1, 0.0));

        let track_only: PlacementArg = "hat.wav@2".parse().unwrap();
        assert_eq!((track_only.track_id, track_only.x_pos), (2, 0.0));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!("a.wav@0:0.5".parse::<PlacementArg>().is_err());
        assert!("a.wav@1:1.0".parse::<PlacementArg>().is_err());
        assert!("a.wav@x:0.5".parse::<PlacementArg>().is_err());
        assert!("@1:0.5".parse::<PlacementArg>().is_err());
    }

    #[test]
    fn undecodable_file_is_marked_failed() {
        let pool = loopdeck_engine::shared_pool();
        let args = vec!["/nonexistent/missing.wav@1:0.0".parse().unwrap()];
        let (placed, handles) = load_placements(&args, &pool, 44_100);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(placed.len(), 1);
        let pool = pool.load();
        assert!(matches!(
            pool.entry(placed[0].sample_id),
            Some(loopdeck_engine::SampleEntry::Failed { .. })
        ));
    }

    #[test]
    fn saved_file_samples_reload_under_their_ids() {
        use loopdeck_engine::export::encode_wav;
        use loopdeck_engine::{AudioBuffer, EngineConfig, LoopEngine};
        use loopdeck_shared::SessionSnapshot;

        let dir = std::env::temp_dir().join(format!("loopdeck-sources-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let wav = dir.join("click.wav");
        let click = AudioBuffer::new(vec![vec![0.5; 10]], 1_000);
        std::fs::write(&wav, encode_wav(&click).unwrap()).unwrap();

        // First session: load the file from the command line and save.
        let pool = loopdeck_engine::shared_pool();
        let arg: PlacementArg = format!("{}@1:0.5", wav.display()).parse().unwrap();
        let (placed, handles) = load_placements(&[arg], &pool, 1_000);
        for h in handles {
            h.join().unwrap();
        }
        let mut eng = LoopEngine::new(1_000, &EngineConfig::default(), pool);
        eng.set_placed_samples(placed.clone());
        let json = serde_json::to_string(&eng.snapshot()).unwrap();

        // Second session: only the saved JSON.
        let snapshot: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.sources.len(), 1);
        assert_eq!(snapshot.sources[0].sample_id, placed[0].sample_id);

        let pool = loopdeck_engine::shared_pool();
        for h in load_sources(&snapshot.sources, &pool, 1_000) {
            h.join().unwrap();
        }
        let mut reloaded = LoopEngine::new(1_000, &EngineConfig::default(), pool);
        reloaded.restore(snapshot).unwrap();
        reloaded.play();
        let out = reloaded.render_offline(1_200, 100);
        std::fs::remove_dir_all(&dir).ok();

        assert!(reloaded.pool().load().ready(placed[0].sample_id).is_some());
        assert!(out.channels[0][1_005] > 0.4, "reloaded sample plays at its offset");
        assert_eq!(out.channels[0][900], 0.0);
    }
}
