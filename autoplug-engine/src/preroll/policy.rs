//! Streamed-mode watermark policy
//!
//! Tracks whether a PrerollBuffer is currently "buffering" (output held back
//! until the queued time reaches the minimum threshold) and converts queued
//! time into a buffering percentage while it is.
//!
//! Non-streamed buffers never buffer: their minimum threshold is zero and
//! underruns are ignored.

use autoplug_common::ClockTime;

/// Threshold change and percentage to report after a watermark transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub threshold: ClockTime,
    pub percent: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct WatermarkPolicy {
    streamed: bool,
    low: ClockTime,
    high: ClockTime,
    /// Progress reporting active
    buffering: bool,
    /// Underruns are handled; cleared by EOS, restored by flush
    armed: bool,
    last_percent: Option<u8>,
}

impl WatermarkPolicy {
    pub fn new(streamed: bool, low: ClockTime, high: ClockTime) -> Self {
        Self {
            streamed,
            low,
            high,
            buffering: streamed,
            armed: true,
            last_percent: None,
        }
    }

    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Minimum threshold a fresh (or flushed) buffer starts with
    pub fn initial_threshold(&self) -> ClockTime {
        if self.streamed {
            self.low
        } else {
            ClockTime::ZERO
        }
    }

    /// The consumer found less than the threshold queued
    ///
    /// Raises the threshold to the high watermark and starts reporting
    /// progress. Returns `None` when the underrun is ignored.
    pub fn on_underrun(&mut self) -> Option<ClockTime> {
        if !self.streamed || !self.armed || self.buffering {
            return None;
        }
        self.buffering = true;
        self.last_percent = None;
        Some(self.high)
    }

    /// Progress towards `threshold`, capped at 99; `None` when not buffering
    pub fn percent(&self, level: ClockTime, threshold: ClockTime) -> Option<u8> {
        if !self.buffering || threshold.is_zero() {
            return None;
        }
        Some((level.nseconds() as u128 * 100 / threshold.nseconds() as u128).min(99) as u8)
    }

    /// Percentage for the current level, only when it changed
    pub fn on_level(&mut self, level: ClockTime, threshold: ClockTime) -> Option<u8> {
        let percent = self.percent(level, threshold)?;
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }

    /// The queued time reached the threshold while buffering
    pub fn on_threshold_reached(&mut self) -> Option<Transition> {
        if !self.buffering {
            return None;
        }
        self.buffering = false;
        self.last_percent = None;
        Some(Transition {
            threshold: self.low,
            percent: self.streamed.then_some(100),
        })
    }

    /// End of stream reached the buffer input
    pub fn on_eos(&mut self) -> Option<Transition> {
        self.armed = false;
        self.on_threshold_reached()
    }

    /// The buffer was flushed; start over as freshly attached
    pub fn on_flush(&mut self) -> ClockTime {
        self.armed = true;
        self.buffering = self.streamed;
        self.last_percent = None;
        self.initial_threshold()
    }
}
