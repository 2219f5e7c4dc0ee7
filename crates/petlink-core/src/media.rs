use std::collections::VecDeque;

use serde::Serialize;

use crate::protocol::{AudioAmplitude, MediaEvent};
use crate::UNKNOWN_SENTINEL;

pub const HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaSnapshot {
    pub title: String,
    pub artist: String,
    pub status: String,
    pub is_playing: bool,
    pub amplitude: Option<AudioAmplitude>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaHistoryEntry {
    pub title: String,
    pub artist: String,
}

/// Display levels in percent. Presentation only, never stored in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AmplitudeLevels {
    pub instant: u8,
    pub peak: u8,
    pub rms: u8,
}

fn to_percent(v: f64) -> u8 {
    if v.is_nan() {
        return 0;
    }
    (v * 100.0).clamp(0.0, 100.0).round() as u8
}

impl From<AudioAmplitude> for AmplitudeLevels {
    fn from(a: AudioAmplitude) -> Self {
        Self {
            instant: to_percent(a.amplitude),
            peak: to_percent(a.peak),
            rms: to_percent(a.rms),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MediaEventAggregator {
    snapshot: Option<MediaSnapshot>,
    history: VecDeque<MediaHistoryEntry>,
}

impl MediaEventAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the snapshot and updates history. Returns whether history grew.
    pub fn ingest(&mut self, ev: &MediaEvent) -> bool {
        self.snapshot = Some(MediaSnapshot {
            title: ev.title.clone(),
            artist: ev.artist.clone(),
            status: ev.status.clone(),
            is_playing: ev.is_playing,
            amplitude: ev.audio_amplitude,
        });

        if ev.title.is_empty() || ev.title == UNKNOWN_SENTINEL {
            return false;
        }
        let seen = self
            .history
            .iter()
            .any(|e| e.title == ev.title && e.artist == ev.artist);
        if seen {
            return false;
        }
        self.history.push_front(MediaHistoryEntry {
            title: ev.title.clone(),
            artist: ev.artist.clone(),
        });
        self.history.truncate(HISTORY_CAPACITY);
        true
    }

    pub fn snapshot(&self) -> Option<&MediaSnapshot> {
        self.snapshot.as_ref()
    }

    /// Newest first.
    pub fn history(&self) -> impl Iterator<Item = &MediaHistoryEntry> {
        self.history.iter()
    }

    pub fn levels(&self) -> Option<AmplitudeLevels> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.amplitude)
            .map(AmplitudeLevels::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn media(title: &str, artist: &str) -> MediaEvent {
        MediaEvent {
            title: title.to_string(),
            artist: artist.to_string(),
            status: "Playing".to_string(),
            is_playing: true,
            audio_amplitude: None,
        }
    }

    fn pairs(agg: &MediaEventAggregator) -> Vec<(String, String)> {
        agg.history()
            .map(|e| (e.title.clone(), e.artist.clone()))
            .collect()
    }

    #[test]
    fn duplicate_pair_is_recorded_once_newest_first() {
        let mut agg = MediaEventAggregator::new();
        agg.ingest(&media("Song A", "Artist X"));
        agg.ingest(&media("Song A", "Artist X"));
        agg.ingest(&media("Song B", "Artist Y"));
        assert_eq!(
            pairs(&agg),
            vec![
                ("Song B".to_string(), "Artist Y".to_string()),
                ("Song A".to_string(), "Artist X".to_string()),
            ]
        );
    }

    #[test]
    fn existence_check_covers_whole_buffer() {
        let mut agg = MediaEventAggregator::new();
        agg.ingest(&media("Song A", "Artist X"));
        agg.ingest(&media("Song B", "Artist Y"));
        agg.ingest(&media("Song C", "Artist Z"));
        assert!(!agg.ingest(&media("Song A", "Artist X")));
        assert_eq!(agg.history().count(), 3);
        assert_eq!(agg.history().next().map(|e| e.title.as_str()), Some("Song C"));
    }

    #[test]
    fn same_title_different_artist_is_distinct() {
        let mut agg = MediaEventAggregator::new();
        assert!(agg.ingest(&media("Song A", "Artist X")));
        assert!(agg.ingest(&media("Song A", "Artist Y")));
        assert_eq!(agg.history().count(), 2);
    }

    #[test]
    fn empty_and_sentinel_titles_never_change_history() {
        let mut agg = MediaEventAggregator::new();
        agg.ingest(&media("Song A", "Artist X"));
        let before = pairs(&agg);
        assert!(!agg.ingest(&media("", "Artist X")));
        assert!(!agg.ingest(&media("Unknown", "Unknown")));
        assert!(!agg.ingest(&media("Unknown", "Artist X")));
        assert_eq!(pairs(&agg), before);
        // The snapshot still follows the latest event.
        assert_eq!(agg.snapshot().map(|s| s.title.as_str()), Some("Unknown"));
    }

    #[test]
    fn history_is_capped_and_unique() {
        let mut agg = MediaEventAggregator::new();
        for i in 0..30 {
            agg.ingest(&media(&format!("Song {i}"), "Artist"));
            assert!(agg.history().count() <= HISTORY_CAPACITY);
        }
        // Still buffered, so no growth.
        assert!(!agg.ingest(&media("Song 25", "Artist")));
        let got = pairs(&agg);
        assert_eq!(got.len(), HISTORY_CAPACITY);
        let unique: HashSet<_> = got.iter().collect();
        assert_eq!(unique.len(), got.len());
        assert_eq!(got[0].0, "Song 29");
        assert_eq!(got[19].0, "Song 10");
    }

    #[test]
    fn levels_are_scaled_and_clipped() {
        let mut agg = MediaEventAggregator::new();
        assert_eq!(agg.levels(), None);
        let mut ev = media("Song A", "Artist X");
        ev.audio_amplitude = Some(AudioAmplitude {
            amplitude: 0.42,
            peak: 1.7,
            rms: -0.2,
        });
        agg.ingest(&ev);
        assert_eq!(
            agg.levels(),
            Some(AmplitudeLevels {
                instant: 42,
                peak: 100,
                rms: 0,
            })
        );
    }

    #[test]
    fn snapshot_is_overwritten_by_each_event() {
        let mut agg = MediaEventAggregator::new();
        agg.ingest(&media("Song A", "Artist X"));
        let mut paused = media("Song A", "Artist X");
        paused.is_playing = false;
        paused.status = "Paused".to_string();
        agg.ingest(&paused);
        let s = agg.snapshot().expect("snapshot");
        assert!(!s.is_playing);
        assert_eq!(s.status, "Paused");
    }
}
