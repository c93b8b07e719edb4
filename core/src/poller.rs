/// Client poll cadence
///
/// Two independent tracks: the conversation list, and the currently open
/// conversation (if any). Each track is `Idle` until its deadline passes,
/// `Polling` while a request is in flight, then `Idle` again with a new
/// deadline. Nothing here talks to the server; callers feed in outcomes.
use crate::config::Config;
use crate::error::ErrorClass;
use crate::messaging_types::ConversationId;
use crate::retry::calculate_backoff;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget {
    List,
    Messages(ConversationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Idle,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    Failed(ErrorClass),
}

#[derive(Debug, Clone)]
struct Track {
    state: TrackState,
    interval: Duration,
    delay: Duration,
    due_at: Instant,
}

impl Track {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            state: TrackState::Idle,
            interval,
            delay: interval,
            // first poll runs immediately
            due_at: now,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.state == TrackState::Idle && now >= self.due_at
    }

    fn complete(&mut self, outcome: PollOutcome, now: Instant, max_backoff: Duration, jitter: bool) {
        self.state = TrackState::Idle;
        self.delay = match outcome {
            PollOutcome::Success | PollOutcome::Failed(ErrorClass::Permanent) => self.interval,
            PollOutcome::Failed(ErrorClass::Retryable) => (self.delay * 2).min(max_backoff),
        };
        let wait = if self.delay > self.interval {
            calculate_backoff(self.delay, jitter).min(max_backoff)
        } else {
            self.delay
        };
        self.due_at = now + wait;
    }
}

#[derive(Debug, Clone)]
pub struct PollSchedule {
    list: Track,
    messages: Option<(ConversationId, Track)>,
    message_interval: Duration,
    max_backoff: Duration,
    jitter: bool,
}

impl PollSchedule {
    pub fn new(list_interval: Duration, message_interval: Duration, max_backoff: Duration, now: Instant) -> Self {
        Self {
            list: Track::new(list_interval, now),
            messages: None,
            message_interval,
            max_backoff,
            jitter: true,
        }
    }

    pub fn from_config(config: &Config, now: Instant) -> Self {
        Self::new(
            config.list_poll_interval,
            config.message_poll_interval,
            config.max_poll_backoff,
            now,
        )
    }

    /// Deterministic delays, for tests
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Start polling `id` on the message track, replacing any open conversation
    pub fn open_conversation(&mut self, id: ConversationId, now: Instant) {
        if self.open_conversation_id() != Some(id) {
            self.messages = Some((id, Track::new(self.message_interval, now)));
        }
    }

    pub fn close_conversation(&mut self) {
        self.messages = None;
    }

    pub fn open_conversation_id(&self) -> Option<ConversationId> {
        self.messages.as_ref().map(|(id, _)| *id)
    }

    pub fn state(&self, target: PollTarget) -> Option<TrackState> {
        self.track(target).map(|t| t.state)
    }

    /// The next poll to run at `now`, if any. The open conversation wins ties.
    pub fn next_due(&self, now: Instant) -> Option<PollTarget> {
        if let Some((id, track)) = &self.messages {
            if track.is_due(now) {
                return Some(PollTarget::Messages(*id));
            }
        }
        self.list.is_due(now).then_some(PollTarget::List)
    }

    /// Time until the earliest idle track becomes due
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        std::iter::once(&self.list)
            .chain(self.messages.as_ref().map(|(_, t)| t))
            .filter(|t| t.state == TrackState::Idle)
            .map(|t| t.due_at.saturating_duration_since(now))
            .min()
    }

    /// Mark `target` in flight. Returns false if it is already polling or
    /// no longer scheduled.
    pub fn begin(&mut self, target: PollTarget) -> bool {
        match self.track_mut(target) {
            Some(t) if t.state == TrackState::Idle => {
                t.state = TrackState::Polling;
                true
            }
            _ => false,
        }
    }

    /// Record the outcome of a poll started with `begin`. Outcomes for a
    /// conversation that has since been closed are dropped.
    pub fn complete(&mut self, target: PollTarget, outcome: PollOutcome, now: Instant) {
        let (max_backoff, jitter) = (self.max_backoff, self.jitter);
        if let Some(t) = self.track_mut(target) {
            if t.state == TrackState::Polling {
                t.complete(outcome, now, max_backoff, jitter);
            }
        }
    }

    /// Current delay for `target`, before jitter
    pub fn current_delay(&self, target: PollTarget) -> Option<Duration> {
        self.track(target).map(|t| t.delay)
    }

    fn track(&self, target: PollTarget) -> Option<&Track> {
        match target {
            PollTarget::List => Some(&self.list),
            PollTarget::Messages(id) => match &self.messages {
                Some((open, t)) if *open == id => Some(t),
                _ => None,
            },
        }
    }

    fn track_mut(&mut self, target: PollTarget) -> Option<&mut Track> {
        match target {
            PollTarget::List => Some(&mut self.list),
            PollTarget::Messages(id) => match &mut self.messages {
                Some((open, t)) if *open == id => Some(t),
                _ => None,
            },
        }
    }
}
