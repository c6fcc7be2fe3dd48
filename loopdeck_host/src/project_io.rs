use std::fs::File;
use std::io::Write;
use std::path::Path;

use loopdeck_shared::SessionSnapshot;

pub fn load_session_file(path: &Path) -> Result<SessionSnapshot, anyhow::Error> {
    let content = std::fs::read_to_string(path)?;
    let snapshot: SessionSnapshot = serde_json::from_str(&content)?;
    log::info!(
        "[ProjectIO] Loaded {}: {} bpm x {} beats, {} placements, {} recordings",
        path.display(),
        snapshot.bpm,
        snapshot.beats_per_loop,
        snapshot.placed_samples.len(),
        snapshot.recordings.len()
    );
    Ok(snapshot)
}

pub fn save_session_file(snapshot: &SessionSnapshot, path: &Path) -> Result<(), anyhow::Error> {
    let json = serde_json::to_string_pretty(snapshot)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    log::info!("[ProjectIO] Saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopdeck_shared::{PlacedSample, SampleId};

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!("loopdeck-session-{}.json", std::process::id()));
        let snapshot = SessionSnapshot {
            bpm: 95.0,
            beats_per_loop: 12,
            placed_samples: vec![PlacedSample::new(SampleId::new(), "kick.wav", 1, 0.5)],
            ..SessionSnapshot::default()
        };
        save_session_file(&snapshot, &path).unwrap();
        let loaded = load_session_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_session_file(Path::new("/nonexistent/session.json")).is_err());
    }
}
