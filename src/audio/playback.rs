//! # Playback Scheduler
//!
//! Schedules decoded chunks back to back on an output device so speech plays without
//! gaps or overlap.
//!
//! ## Scheduling Rule:
//! `start = max(now, cursor)`, then `cursor = start + duration`.
//!
//! - Chunks arriving faster than real time queue up end to end on the cursor
//! - A chunk arriving after the cursor has passed plays immediately instead of in the past
//!
//! ## Ownership:
//! The scheduler owns the live set of scheduled sources. It is only mutated through
//! `enqueue`, `on_ended` and `stop_all`, all called from the session task.

use crate::audio::codec::{decode_chunk, AudioChunk, PcmBuffer};
use crate::audio::device::{AudioOutput, SourceId};
use crate::error::VoiceResult;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// A buffer currently scheduled on the output device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub source: SourceId,
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start_time: f64,
    live: HashMap<SourceId, ScheduledPlayback>,
    closed: bool,
}

impl PlaybackScheduler {
    /// Take ownership of an output device. The cursor starts at the device's current time.
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        let next_start_time = output.now();
        Self {
            output,
            next_start_time,
            live: HashMap::new(),
            closed: false,
        }
    }

    /// Decode a chunk and schedule it right after the previous one.
    ///
    /// A decode failure drops this chunk only; the cursor does not move.
    pub fn enqueue(&mut self, chunk: &AudioChunk) -> VoiceResult<ScheduledPlayback> {
        let buffer = decode_chunk(chunk)?;
        self.schedule(buffer)
    }

    /// Schedule an already decoded buffer.
    pub fn schedule(&mut self, buffer: PcmBuffer) -> VoiceResult<ScheduledPlayback> {
        let now = self.output.now();
        let start_time = self.next_start_time.max(now);
        let duration = buffer.duration();

        let source = self.output.schedule(buffer, start_time)?;
        let entry = ScheduledPlayback {
            source,
            start_time,
            duration,
        };
        self.live.insert(source, entry);
        self.next_start_time = entry.end_time();

        trace!(%source, start_time, duration, live = self.live.len(), "Scheduled playback");
        Ok(entry)
    }

    /// Natural completion of a source. Unknown ids (already stopped) are ignored.
    pub fn on_ended(&mut self, source: SourceId) {
        if self.live.remove(&source).is_some() {
            trace!(%source, live = self.live.len(), "Playback ended");
        }
    }

    /// Force-stop every live source and reset the cursor to 0.
    ///
    /// A source the device reports as already finished is not an error.
    pub fn stop_all(&mut self) {
        let stopped = self.live.len();
        for (source, _) in self.live.drain() {
            if let Err(e) = self.output.stop_source(source) {
                debug!(%source, error = %e, "Ignoring stop failure for finished source");
            }
        }
        self.next_start_time = 0.0;
        if stopped > 0 {
            debug!(stopped, "Stopped all playback");
        }
    }

    /// Stop everything and close the device. Later calls do nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_all();
        if let Err(e) = self.output.close() {
            warn!(error = %e, "Output device failed to close cleanly");
        }
        self.closed = true;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::AudioBackend;
    use crate::config::{DeviceConfig, PlaybackConfig};
    use crate::testing::{silent_chunk, FakeBackend};
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn scheduler(backend: &FakeBackend) -> (PlaybackScheduler, mpsc::UnboundedReceiver<SourceId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let output = backend.open_output(&DeviceConfig::default(), &PlaybackConfig::default(), tx).unwrap();
        (PlaybackScheduler::new(output), rx)
    }

    #[test]
    fn test_back_to_back_chunks_are_gapless() {
        let backend = FakeBackend::new();
        let (mut playback, _rx) = scheduler(&backend);

        let starts: Vec<f64> = [1.0, 0.5, 2.0]
            .iter()
            .map(|&secs| playback.enqueue(&silent_chunk(secs, 24000)).unwrap().start_time)
            .collect();

        assert_eq!(starts, vec![0.0, 1.0, 1.5]);
        assert_eq!(playback.next_start_time(), 3.5);
        assert_eq!(playback.live_count(), 3);
    }

    #[test]
    fn test_late_chunk_plays_immediately() {
        let backend = FakeBackend::new();
        let (mut playback, _rx) = scheduler(&backend);

        playback.enqueue(&silent_chunk(1.0, 24000)).unwrap();
        backend.set_clock(5.0);
        let entry = playback.enqueue(&silent_chunk(0.5, 24000)).unwrap();

        assert_eq!(entry.start_time, 5.0);
        assert_eq!(playback.next_start_time(), 5.5);
    }

    #[test]
    fn test_decode_failure_leaves_cursor_untouched() {
        let backend = FakeBackend::new();
        let (mut playback, _rx) = scheduler(&backend);

        playback.enqueue(&silent_chunk(1.0, 24000)).unwrap();
        let bad = AudioChunk::new("AAA=", 24000, 1);
        assert!(playback.enqueue(&bad).is_err());
        assert_eq!(playback.next_start_time(), 1.0);
        assert_eq!(playback.live_count(), 1);
    }

    #[test]
    fn test_on_ended_removes_from_live_set() {
        let backend = FakeBackend::new();
        let (mut playback, _rx) = scheduler(&backend);

        let first = playback.enqueue(&silent_chunk(1.0, 24000)).unwrap();
        playback.enqueue(&silent_chunk(1.0, 24000)).unwrap();
        playback.on_ended(first.source);
        playback.on_ended(first.source);

        assert_eq!(playback.live_count(), 1);
    }

    #[test]
    fn test_stop_all_tolerates_finished_sources() {
        let backend = FakeBackend::new();
        let (mut playback, _rx) = scheduler(&backend);

        let first = playback.enqueue(&silent_chunk(1.0, 24000)).unwrap();
        playback.enqueue(&silent_chunk(1.0, 24000)).unwrap();
        // The device already finished this one but the notice has not been applied yet
        backend.finish_source(first.source);

        playback.stop_all();
        assert_eq!(playback.live_count(), 0);
        assert_eq!(playback.next_start_time(), 0.0);
        assert!(backend.live_sources().is_empty());
    }

    #[test]
    fn test_close_is_guarded() {
        let backend = FakeBackend::new();
        let (mut playback, _rx) = scheduler(&backend);

        playback.enqueue(&silent_chunk(0.5, 24000)).unwrap();
        playback.close();
        playback.close();
        drop(playback);

        let closes = backend.events().iter().filter(|e| *e == "output.close").count();
        assert_eq!(closes, 1);
    }

    proptest! {
        #[test]
        fn prop_scheduled_buffers_never_overlap(
            steps in prop::collection::vec((1usize..48_000, 0.0f64..2.0), 1..24)
        ) {
            let backend = FakeBackend::new();
            let (mut playback, _rx) = scheduler(&backend);
            let mut clock = 0.0;
            let mut previous_end = 0.0f64;

            for (frames, advance) in steps {
                clock += advance;
                backend.set_clock(clock);
                let buffer = PcmBuffer::mono(24000, vec![0.0; frames]).unwrap();
                let entry = playback.schedule(buffer).unwrap();

                prop_assert!(entry.start_time >= clock);
                prop_assert!(entry.start_time >= previous_end);
                previous_end = entry.end_time();
            }
        }
    }
}
