use serde::{Deserialize, Serialize};

/// A contiguous watched time range within one video, in seconds.
/// Serialized as `[start, end]` to stay compatible with stored progress blobs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct WatchSegment(pub f64, pub f64);

impl WatchSegment {
    pub fn start(&self) -> f64 {
        self.0
    }

    pub fn end(&self) -> f64 {
        self.1
    }

    pub fn len(&self) -> f64 {
        (self.1 - self.0).max(0.0)
    }
}

/// Continuous playback required before the fallback unlock fires, for
/// providers whose reported position is unreliable.
pub const FALLBACK_CONTINUOUS_SECS: f64 = 15.0;

/// Each playback tick contributes the trailing half second of the timeline.
const TICK_SEGMENT_SECS: f64 = 0.5;

/// Ticks arrive roughly once a second; a larger jump means a seek and breaks
/// the continuous-playback run.
const MAX_TICK_GAP_SECS: f64 = 2.0;

/// Accumulates watched ranges for a single video-playback session and derives
/// the "has watched enough" signal that unlocks the lesson quiz.
///
/// The segment list is kept sorted and non-overlapping at all times; callers
/// persist it through the store after every merge so a reload does not lose
/// progress.
#[derive(Debug, Clone)]
pub struct SegmentTracker {
    duration_seconds: f64,
    segments: Vec<WatchSegment>,
    run_start: Option<f64>,
    last_tick: Option<f64>,
}

impl SegmentTracker {
    pub fn new(duration_seconds: f64) -> Self {
        Self {
            duration_seconds,
            segments: Vec::new(),
            run_start: None,
            last_tick: None,
        }
    }

    /// Rebuild a tracker from a previously persisted segment list.
    pub fn from_saved(duration_seconds: f64, mut saved: Vec<WatchSegment>) -> Self {
        saved.retain(|s| s.len() > 0.0);
        let mut tracker = Self::new(duration_seconds);
        tracker.segments = merge_segments(saved);
        tracker
    }

    /// Record a playback-progress tick at `current_time_seconds`: propose the
    /// trailing half-second segment and merge it into the watched list.
    pub fn record_playback(&mut self, current_time_seconds: f64) {
        let start = (current_time_seconds - TICK_SEGMENT_SECS).max(0.0);
        let end = if self.duration_seconds > 0.0 {
            current_time_seconds.min(self.duration_seconds)
        } else {
            current_time_seconds
        };
        if end > start {
            self.segments.push(WatchSegment(start, end));
            self.segments = merge_segments(std::mem::take(&mut self.segments));
        }

        // Continuous-run bookkeeping for the provider fallback. A seek or a
        // stalled player resets the run.
        match self.last_tick {
            Some(prev)
                if current_time_seconds > prev
                    && current_time_seconds - prev <= MAX_TICK_GAP_SECS => {}
            _ => self.run_start = Some(current_time_seconds),
        }
        self.last_tick = Some(current_time_seconds);
    }

    /// Sum of merged interval lengths. Monotonically non-decreasing across
    /// `record_playback` calls.
    pub fn total_watched(&self) -> f64 {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Seconds of uninterrupted forward playback in the current run.
    pub fn continuous_run(&self) -> f64 {
        match (self.run_start, self.last_tick) {
            (Some(start), Some(last)) => (last - start).max(0.0),
            _ => 0.0,
        }
    }

    /// True once enough of the video has been watched to unlock the quiz:
    /// either the watched fraction meets the threshold, or the continuous
    /// fallback fires. A zero-length video is never eligible.
    pub fn is_unlock_eligible(&self, threshold_fraction: f64) -> bool {
        if self.duration_seconds <= 0.0 {
            return false;
        }
        self.total_watched() >= self.duration_seconds * threshold_fraction
            || self.continuous_run() >= FALLBACK_CONTINUOUS_SECS
    }

    pub fn segments(&self) -> &[WatchSegment] {
        &self.segments
    }
}

/// Sort and collapse overlapping or touching segments into a minimal
/// non-overlapping list.
pub fn merge_segments(mut segments: Vec<WatchSegment>) -> Vec<WatchSegment> {
    if segments.is_empty() {
        return segments;
    }
    segments.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut merged: Vec<WatchSegment> = Vec::with_capacity(segments.len());
    merged.push(segments[0]);
    for seg in segments.into_iter().skip(1) {
        let last = merged.last_mut().unwrap();
        if seg.0 <= last.1 {
            last.1 = last.1.max(seg.1);
        } else {
            merged.push(seg);
        }
    }
    merged
}
