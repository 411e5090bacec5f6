/// Push channel: one subscription per session and its connection state
use crate::error::{Result, SyncError};
use crate::normalizer::RawChange;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Stream of raw row changes handed out by the backend
pub type ChangeStream = UnboundedReceiver<RawChange>;

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// No subscription (initial, and after logout)
    Disconnected,
    /// Subscribe call in flight
    Connecting,
    /// Receiving events
    Subscribed,
    /// Subscription failed or the stream closed
    Error,
}

impl ChannelState {
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Error, Connecting)
                | (Connecting, Subscribed)
                | (Connecting, Error)
                | (Subscribed, Error)
        )
    }
}

#[derive(Debug)]
pub struct PushChannel {
    state: ChannelState,
    stream: Option<ChangeStream>,
    subscribed_at: Option<Instant>,
    connect_attempts: u32,
    events_received: u64,
    last_error: Option<String>,
}

impl Default for PushChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PushChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            stream: None,
            subscribed_at: None,
            connect_attempts: 0,
            events_received: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == ChannelState::Subscribed
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn events_received(&self) -> u64 {
        self.events_received
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Seconds since the current subscription was established
    pub fn uptime_secs(&self) -> Option<u64> {
        self.subscribed_at.map(|t| t.elapsed().as_secs())
    }

    fn transition(&mut self, next: ChannelState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::Channel(format!(
                "invalid transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!("Push channel {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Subscribe call is about to be issued
    pub fn begin_connect(&mut self) -> Result<()> {
        self.transition(ChannelState::Connecting)?;
        self.connect_attempts += 1;
        Ok(())
    }

    /// Subscribe call succeeded
    pub fn attach(&mut self, stream: ChangeStream) -> Result<()> {
        self.transition(ChannelState::Subscribed)?;
        self.stream = Some(stream);
        self.subscribed_at = Some(Instant::now());
        self.last_error = None;
        info!("Push channel subscribed");
        Ok(())
    }

    /// Subscribe failed or the stream broke
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Push channel error: {}", reason);
        self.stream = None;
        self.subscribed_at = None;
        self.last_error = Some(reason);
        // Error is reachable from every live state; from Disconnected there is nothing to fail
        if self.state != ChannelState::Disconnected {
            self.state = ChannelState::Error;
        }
    }

    /// Tear down the subscription (logout)
    pub fn disconnect(&mut self) {
        if self.state != ChannelState::Disconnected {
            info!("Push channel disconnected");
        }
        self.stream = None;
        self.subscribed_at = None;
        self.state = ChannelState::Disconnected;
    }

    /// Next buffered change without waiting
    pub fn try_next(&mut self) -> Option<RawChange> {
        let stream = self.stream.as_mut()?;
        match stream.try_recv() {
            Ok(change) => {
                self.events_received += 1;
                Some(change)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.fail("event stream closed");
                None
            }
        }
    }

    /// Wait for the next change. None once the stream is gone.
    pub async fn next(&mut self) -> Option<RawChange> {
        let stream = self.stream.as_mut()?;
        match stream.recv().await {
            Some(change) => {
                self.events_received += 1;
                Some(change)
            }
            None => {
                self.fail("event stream closed");
                None
            }
        }
    }
}
