//! Throttling of the user's typing signals.
//!
//! Keystrokes arrive far more often than the service wants to hear about
//! them. [`TypingThrottle`] turns the keystroke stream into threshold
//! crossings: a `Start` when a burst begins (repeated at most once per
//! `start_interval` while the burst continues) and a `Stop` once the user
//! has been idle for `stop_delay` or stopped explicitly.

use std::time::Duration;

use tokio::time::Instant;

use colloquy_proto::event::EventName;

/// Default minimum gap between two `Start` signals in one burst.
pub const DEFAULT_START_INTERVAL: Duration = Duration::from_secs(20);

/// Default idle time before `Stop`.
pub const DEFAULT_STOP_DELAY: Duration = Duration::from_secs(15);

/// A threshold crossing worth telling the service about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    /// The user is typing.
    Start,
    /// The user stopped typing.
    Stop,
}

impl TypingSignal {
    /// The event fired for this signal.
    #[must_use]
    pub const fn event(self) -> EventName {
        match self {
            Self::Start => EventName::StartTyping,
            Self::Stop => EventName::StopTyping,
        }
    }
}

/// Keystroke-to-signal state machine. Pure; the caller owns the timers.
#[derive(Debug, Clone)]
pub struct TypingThrottle {
    start_interval: Duration,
    stop_delay: Duration,
    typing: bool,
    last_start: Option<Instant>,
    last_activity: Option<Instant>,
}

impl Default for TypingThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_START_INTERVAL, DEFAULT_STOP_DELAY)
    }
}

impl TypingThrottle {
    /// Create a throttle with the given thresholds.
    #[must_use]
    pub const fn new(start_interval: Duration, stop_delay: Duration) -> Self {
        Self {
            start_interval,
            stop_delay,
            typing: false,
            last_start: None,
            last_activity: None,
        }
    }

    /// Idle time before `Stop`.
    #[must_use]
    pub const fn stop_delay(&self) -> Duration {
        self.stop_delay
    }

    /// Whether a burst is in progress.
    #[must_use]
    pub const fn is_typing(&self) -> bool {
        self.typing
    }

    /// Record a keystroke at `now`.
    pub fn did_type(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_activity = Some(now);
        let due = !self.typing
            || self
                .last_start
                .is_none_or(|t| now.saturating_duration_since(t) >= self.start_interval);
        self.typing = true;
        if due {
            self.last_start = Some(now);
            Some(TypingSignal::Start)
        } else {
            None
        }
    }

    /// Check for idleness at `now`, typically when a stop timer fires.
    pub fn idle_check(&mut self, now: Instant) -> Option<TypingSignal> {
        let idle = self
            .last_activity
            .is_some_and(|t| now.saturating_duration_since(t) >= self.stop_delay);
        if self.typing && idle {
            self.reset();
            Some(TypingSignal::Stop)
        } else {
            None
        }
    }

    /// The user stopped explicitly (sent the message, cleared the input).
    pub fn stopped(&mut self) -> Option<TypingSignal> {
        if self.typing {
            self.reset();
            Some(TypingSignal::Stop)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.typing = false;
        self.last_start = None;
    }
}
