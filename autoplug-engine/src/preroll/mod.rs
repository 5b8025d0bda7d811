//! PrerollBuffer
//!
//! Bounded per-stream-type queue sitting between a group's terminal ports
//! and the front-end's sinks. Capacity is limited independently by queued
//! bytes and queued time; output is held back while the queued time is
//! below the current minimum threshold (streamed inputs only).
//!
//! Watermark callbacks run synchronously on the pushing (or popping)
//! thread, after the queue's own lock has been released.

mod policy;

pub use policy::{Transition, WatermarkPolicy};

use autoplug_common::config::BufferingConfig;
use autoplug_common::events::StreamClassification;
use autoplug_common::ClockTime;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// A unit of stream data
#[derive(Debug, Clone, PartialEq)]
pub struct MediaBuffer {
    pub pts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    pub data: Vec<u8>,
}

impl MediaBuffer {
    /// Timestamped buffer with `size` bytes of payload
    pub fn timed(pts: ClockTime, duration: ClockTime, size: usize) -> Self {
        Self {
            pts: Some(pts),
            duration: Some(duration),
            data: vec![0; size],
        }
    }

    /// Buffer without timing information
    pub fn untimed(size: usize) -> Self {
        Self {
            pts: None,
            duration: None,
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn end(&self) -> Option<ClockTime> {
        self.pts.map(|pts| pts + self.duration.unwrap_or(ClockTime::ZERO))
    }
}

/// Item leaving the queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Buffer(MediaBuffer),
    Eos,
}

/// Result of a push
#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the buffer is handed back for a later retry
    Full(MediaBuffer),
    /// Flushing or after EOS
    Refused(MediaBuffer),
}

/// Current fill level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Level {
    pub buffers: usize,
    pub bytes: u64,
    pub time: ClockTime,
}

/// Capacity and watermarks of one PrerollBuffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrerollLimits {
    /// 0 disables the byte limit
    pub max_bytes: u64,
    /// ZERO disables the time limit
    pub max_time: ClockTime,
    pub low: ClockTime,
    pub high: ClockTime,
    pub streamed: bool,
}

impl PrerollLimits {
    /// Sizing for a stream type
    ///
    /// Raw video gets the largest byte budget, streamed inputs the
    /// tightest.
    pub fn for_stream(
        config: &BufferingConfig,
        classification: StreamClassification,
        streamed: bool,
    ) -> Self {
        let max_bytes = if streamed {
            config.streamed_max_bytes
        } else if classification == StreamClassification::Video {
            config.video_max_bytes
        } else {
            config.other_max_bytes
        };
        Self {
            max_bytes,
            max_time: config.queue_size(),
            low: config.queue_min_threshold(),
            high: config.queue_threshold(),
            streamed,
        }
    }
}

/// Receiver of watermark notifications
pub trait PrerollListener: Send + Sync {
    /// The queue was full when a buffer arrived
    fn on_overrun(&self, buffer: &PrerollBuffer);

    /// Buffering progress changed (0-100)
    fn on_buffering(&self, buffer: &PrerollBuffer, percent: u8);
}

enum Signal {
    Overrun,
    Percent(u8),
}

struct QueueState {
    items: VecDeque<QueueItem>,
    bytes: u64,
    max_bytes: u64,
    max_time: ClockTime,
    min_threshold: ClockTime,
    byte_limit_relaxed: bool,
    policy: WatermarkPolicy,
    flushing: bool,
    eos: bool,
}

impl QueueState {
    fn buffers(&self) -> impl DoubleEndedIterator<Item = &MediaBuffer> {
        self.items.iter().filter_map(|item| match item {
            QueueItem::Buffer(b) => Some(b),
            QueueItem::Eos => None,
        })
    }

    fn time_level(&self) -> ClockTime {
        let first = self.buffers().find_map(|b| b.pts);
        let last = self.buffers().rev().find_map(|b| b.end());
        match (first, last) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => ClockTime::ZERO,
        }
    }

    fn is_full(&self) -> bool {
        (self.max_bytes > 0 && self.bytes >= self.max_bytes)
            || (!self.max_time.is_zero() && self.time_level() >= self.max_time)
    }

    /// Byte limit reached before the time threshold: lift the byte limit
    fn check_deadlock(&mut self, incoming_timed: bool) -> bool {
        if !self.policy.is_streamed() || !incoming_timed || self.max_bytes == 0 {
            return false;
        }
        if self.bytes >= self.max_bytes && self.time_level() < self.min_threshold {
            debug!(
                "Byte limit {} reached below time threshold {}, disabling byte limit",
                self.max_bytes, self.min_threshold
            );
            self.max_bytes = 0;
            self.byte_limit_relaxed = true;
            return true;
        }
        false
    }

    fn apply(&mut self, transition: Transition, signals: &mut Vec<Signal>) {
        self.min_threshold = transition.threshold;
        if let Some(percent) = transition.percent {
            signals.push(Signal::Percent(percent));
        }
    }
}

/// Bounded preroll queue for one stream type of a group
pub struct PrerollBuffer {
    classification: StreamClassification,
    limits: PrerollLimits,
    state: Mutex<QueueState>,
    listener: Option<Arc<dyn PrerollListener>>,
}

impl std::fmt::Debug for PrerollBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrerollBuffer")
            .field("classification", &self.classification)
            .field("level", &self.level())
            .finish()
    }
}

impl PrerollBuffer {
    pub fn new(
        classification: StreamClassification,
        limits: PrerollLimits,
        listener: Option<Arc<dyn PrerollListener>>,
    ) -> Self {
        let policy = WatermarkPolicy::new(limits.streamed, limits.low, limits.high);
        let min_threshold = policy.initial_threshold();
        Self {
            classification,
            limits,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                bytes: 0,
                max_bytes: limits.max_bytes,
                max_time: limits.max_time,
                min_threshold,
                byte_limit_relaxed: false,
                policy,
                flushing: false,
                eos: false,
            }),
            listener,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, signals: Vec<Signal>) {
        let Some(listener) = &self.listener else {
            return;
        };
        for signal in signals {
            match signal {
                Signal::Overrun => listener.on_overrun(self),
                Signal::Percent(p) => listener.on_buffering(self, p),
            }
        }
    }

    pub fn classification(&self) -> StreamClassification {
        self.classification
    }

    pub fn limits(&self) -> PrerollLimits {
        self.limits
    }

    pub fn is_streamed(&self) -> bool {
        self.limits.streamed
    }

    pub fn push(&self, buffer: MediaBuffer) -> PushOutcome {
        let mut signals = Vec::new();
        let outcome = {
            let mut q = self.lock();
            if q.flushing || q.eos {
                PushOutcome::Refused(buffer)
            } else {
                if q.is_full() {
                    trace!("{} preroll buffer overrun", self.classification);
                    signals.push(Signal::Overrun);
                    q.check_deadlock(buffer.pts.is_some());
                }
                if q.is_full() {
                    PushOutcome::Full(buffer)
                } else {
                    q.bytes += buffer.size();
                    q.items.push_back(QueueItem::Buffer(buffer));
                    let level = q.time_level();
                    let threshold = q.min_threshold;
                    if q.policy.is_buffering() && level >= threshold {
                        debug!(
                            "{} preroll buffer reached threshold {}",
                            self.classification, threshold
                        );
                        if let Some(t) = q.policy.on_threshold_reached() {
                            q.apply(t, &mut signals);
                        }
                    } else if let Some(p) = q.policy.on_level(level, threshold) {
                        signals.push(Signal::Percent(p));
                    }
                    PushOutcome::Queued
                }
            }
        };
        self.dispatch(signals);
        outcome
    }

    /// Mark end of stream on the input side
    pub fn push_eos(&self) -> bool {
        let mut signals = Vec::new();
        let accepted = {
            let mut q = self.lock();
            if q.flushing || q.eos {
                false
            } else {
                q.eos = true;
                q.items.push_back(QueueItem::Eos);
                if let Some(t) = q.policy.on_eos() {
                    q.apply(t, &mut signals);
                }
                true
            }
        };
        self.dispatch(signals);
        accepted
    }

    /// Take the next item for the consumer
    ///
    /// Returns `None` when nothing may be output yet; in streamed mode that
    /// is an underrun and starts a buffering period.
    pub fn pop(&self) -> Option<QueueItem> {
        let mut signals = Vec::new();
        let item = {
            let mut q = self.lock();
            if q.flushing {
                return None;
            }
            let level = q.time_level();
            if q.items.is_empty() || (!q.eos && level < q.min_threshold) {
                if let Some(threshold) = q.policy.on_underrun() {
                    debug!(
                        "{} preroll buffer underrun, raising threshold to {}",
                        self.classification, threshold
                    );
                    q.min_threshold = threshold;
                    if let Some(p) = q.policy.on_level(level, threshold) {
                        signals.push(Signal::Percent(p));
                    }
                }
                None
            } else {
                let item = q.items.pop_front();
                if let Some(QueueItem::Buffer(b)) = &item {
                    q.bytes = q.bytes.saturating_sub(b.size());
                }
                item
            }
        };
        self.dispatch(signals);
        item
    }

    /// Drop queued data and start over
    ///
    /// A lifted byte limit stays lifted.
    pub fn flush(&self) {
        let mut q = self.lock();
        q.items.clear();
        q.bytes = 0;
        q.eos = false;
        q.min_threshold = q.policy.on_flush();
    }

    /// Refuse all data while set; entering flushing drops queued data
    pub fn set_flushing(&self, flushing: bool) {
        let mut q = self.lock();
        q.flushing = flushing;
        if flushing {
            q.items.clear();
            q.bytes = 0;
        }
    }

    pub fn level(&self) -> Level {
        let q = self.lock();
        Level {
            buffers: q.items.len(),
            bytes: q.bytes,
            time: q.time_level(),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.lock().max_bytes
    }

    pub fn min_threshold(&self) -> ClockTime {
        self.lock().min_threshold
    }

    pub fn is_buffering(&self) -> bool {
        self.lock().policy.is_buffering()
    }

    /// Current buffering progress; `None` once output is flowing
    pub fn buffering_percent(&self) -> Option<u8> {
        let q = self.lock();
        q.policy.percent(q.time_level(), q.min_threshold)
    }

    pub fn is_byte_limit_relaxed(&self) -> bool {
        self.lock().byte_limit_relaxed
    }

    pub fn is_eos(&self) -> bool {
        self.lock().eos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        overruns: AtomicUsize,
        percents: Mutex<Vec<u8>>,
    }

    impl PrerollListener for Recorder {
        fn on_overrun(&self, _buffer: &PrerollBuffer) {
            self.overruns.fetch_add(1, Ordering::SeqCst);
        }

        fn on_buffering(&self, _buffer: &PrerollBuffer, percent: u8) {
            self.percents.lock().unwrap().push(percent);
        }
    }

    fn ms(v: u64) -> ClockTime {
        ClockTime::from_mseconds(v)
    }

    fn limits(max_bytes: u64, streamed: bool) -> PrerollLimits {
        PrerollLimits {
            max_bytes,
            max_time: ms(3000),
            low: ms(1000),
            high: ms(2000),
            streamed,
        }
    }

    #[test]
    fn test_sizing_per_stream_type() {
        let config = BufferingConfig::default();
        let video = PrerollLimits::for_stream(&config, StreamClassification::Video, false);
        let audio = PrerollLimits::for_stream(&config, StreamClassification::Audio, false);
        let streamed = PrerollLimits::for_stream(&config, StreamClassification::Video, true);
        assert_eq!(video.max_bytes, 25 * 1024 * 1024);
        assert_eq!(audio.max_bytes, 2 * 1024 * 1024);
        assert_eq!(streamed.max_bytes, 2 * 1024 * 1024);
        assert_eq!(video.max_time, ms(3000));
        assert_eq!(video.high, ms(2850));
        assert_eq!(video.low, ms(900));
    }

    #[test]
    fn test_time_level_and_fifo() {
        let buf = PrerollBuffer::new(StreamClassification::Audio, limits(0, false), None);
        for i in 0..3 {
            assert_eq!(buf.push(MediaBuffer::timed(ms(i * 100), ms(100), 10)), PushOutcome::Queued);
        }
        let level = buf.level();
        assert_eq!(level.buffers, 3);
        assert_eq!(level.bytes, 30);
        assert_eq!(level.time, ms(300));

        match buf.pop() {
            Some(QueueItem::Buffer(b)) => assert_eq!(b.pts, Some(ms(0))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(buf.level().time, ms(200));
    }

    #[test]
    fn test_full_hands_buffer_back() {
        let recorder = Arc::new(Recorder::default());
        let buf = PrerollBuffer::new(
            StreamClassification::Audio,
            limits(100, false),
            Some(recorder.clone()),
        );
        assert_eq!(buf.push(MediaBuffer::timed(ms(0), ms(10), 100)), PushOutcome::Queued);
        match buf.push(MediaBuffer::timed(ms(10), ms(10), 10)) {
            PushOutcome::Full(b) => assert_eq!(b.size(), 10),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(recorder.overruns.load(Ordering::SeqCst), 1);
        // non-streamed buffers keep their byte limit
        assert_eq!(buf.max_bytes(), 100);
    }

    #[test]
    fn test_eos_drains_below_threshold() {
        let buf = PrerollBuffer::new(StreamClassification::Audio, limits(0, true), None);
        buf.push(MediaBuffer::timed(ms(0), ms(100), 10));
        assert!(buf.pop().is_none());
        assert!(buf.push_eos());
        assert!(matches!(buf.pop(), Some(QueueItem::Buffer(_))));
        assert_eq!(buf.pop(), Some(QueueItem::Eos));
        assert!(matches!(
            buf.push(MediaBuffer::untimed(1)),
            PushOutcome::Refused(_)
        ));
    }

    #[test]
    fn test_buffering_percent_follows_level() {
        let buf = PrerollBuffer::new(StreamClassification::Video, limits(0, true), None);
        assert_eq!(buf.buffering_percent(), Some(0));
        buf.push(MediaBuffer::timed(ms(0), ms(250), 10));
        assert_eq!(buf.buffering_percent(), Some(25));
        buf.push(MediaBuffer::timed(ms(250), ms(750), 10));
        assert_eq!(buf.buffering_percent(), None);

        let local = PrerollBuffer::new(StreamClassification::Video, limits(0, false), None);
        assert_eq!(local.buffering_percent(), None);
    }

    #[test]
    fn test_flushing_refuses_data() {
        let buf = PrerollBuffer::new(StreamClassification::Video, limits(0, false), None);
        buf.push(MediaBuffer::untimed(5));
        buf.set_flushing(true);
        assert_eq!(buf.level().buffers, 0);
        assert!(matches!(buf.push(MediaBuffer::untimed(5)), PushOutcome::Refused(_)));
        assert!(buf.pop().is_none());
        buf.set_flushing(false);
        assert_eq!(buf.push(MediaBuffer::untimed(5)), PushOutcome::Queued);
    }
}
