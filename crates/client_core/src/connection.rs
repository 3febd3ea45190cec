//! Lifecycle of the single duplex link: handshake, heartbeat, bounded
//! exponential reconnection and the outbound queue used while it is down.

use std::{future::pending, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use serde::Serialize;
use shared::protocol::OutboundAction;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::{
    config::{EngineConfig, ReconnectPolicy},
    outbound::OutboundQueue,
    transport::{Connection, Connector},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    /// Reconnection gave up. Only a new session leaves this state.
    Lost,
}

/// What woke the link up.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(String),
    /// The peer closed the link or the transport failed.
    Closed(Option<anyhow::Error>),
    HeartbeatDue,
    ReconnectDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    Scheduled { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    Written,
    Queued,
    Dropped,
}

/// Outcome of replaying the queue after a reconnect.
#[derive(Debug, Default)]
pub struct Flush {
    pub written: Vec<OutboundAction>,
    pub error: Option<anyhow::Error>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    heartbeat_period: Duration,
    link: Option<Box<dyn Connection>>,
    heartbeat: Option<Interval>,
    status: ConnectionStatus,
    attempts: u32,
    reconnect_at: Option<Instant>,
    queue: OutboundQueue,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &EngineConfig) -> Self {
        Self {
            connector,
            policy: config.reconnect,
            connect_timeout: config.connect_timeout,
            heartbeat_period: config.heartbeat_interval,
            link: None,
            heartbeat: None,
            status: ConnectionStatus::Closed,
            attempts: 0,
            reconnect_at: None,
            queue: OutboundQueue::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Open && self.link.is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Runs the handshake, bounded by the connect timeout.
    pub async fn open(&mut self) -> Result<()> {
        self.status = ConnectionStatus::Connecting;
        self.reconnect_at = None;
        let attempt = timeout(self.connect_timeout, self.connector.connect()).await;
        let link = match attempt {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                self.status = ConnectionStatus::Closed;
                return Err(err);
            }
            Err(_) => {
                self.status = ConnectionStatus::Closed;
                return Err(anyhow!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                ));
            }
        };

        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_period,
            self.heartbeat_period,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.link = Some(link);
        self.heartbeat = Some(heartbeat);
        self.status = ConnectionStatus::Open;
        self.attempts = 0;
        Ok(())
    }

    /// Forgets the current link after an unintentional close.
    pub fn drop_link(&mut self) {
        self.link = None;
        self.heartbeat = None;
        if self.status != ConnectionStatus::Lost {
            self.status = ConnectionStatus::Closed;
        }
    }

    /// Books the next reconnect attempt, or gives up once the policy's
    /// attempt budget is spent. Giving up discards the queue.
    pub fn schedule_reconnect(&mut self, now: Instant) -> Reconnect {
        let attempt = self.attempts + 1;
        match self.policy.delay_for(attempt) {
            Some(delay) => {
                self.attempts = attempt;
                self.reconnect_at = Some(now + delay);
                Reconnect::Scheduled { attempt, delay }
            }
            None => {
                self.status = ConnectionStatus::Lost;
                self.reconnect_at = None;
                let discarded = self.queue.len();
                self.queue.clear();
                debug!(discarded, "connection: outbound queue discarded");
                Reconnect::Exhausted {
                    attempts: self.attempts,
                }
            }
        }
    }

    /// Writes on an open link, queues while closed, drops once lost.
    /// A failed write hands the action back to the queue and reports the
    /// error so the caller can treat the link as closed.
    pub async fn send_or_queue(&mut self, action: OutboundAction) -> Result<Sent> {
        if self.status == ConnectionStatus::Lost {
            return Ok(Sent::Dropped);
        }
        let Some(link) = self.link.as_mut() else {
            return Ok(if self.queue.enqueue(action) {
                Sent::Queued
            } else {
                Sent::Dropped
            });
        };

        let frame = action.encode()?;
        match link.send_text(frame).await {
            Ok(()) => Ok(Sent::Written),
            Err(err) => {
                self.queue.restore(vec![action]);
                Err(err)
            }
        }
    }

    /// Replays everything queued while the link was down, oldest first.
    /// On a write failure the unsent remainder goes back to the queue.
    pub async fn flush_queue(&mut self) -> Flush {
        let mut flush = Flush::default();
        let Some(link) = self.link.as_mut() else {
            return flush;
        };

        let mut backlog = self.queue.drain().into_iter();
        while let Some(action) = backlog.next() {
            let written = match action.encode() {
                Ok(frame) => link.send_text(frame).await,
                Err(err) => Err(err.into()),
            };
            match written {
                Ok(()) => flush.written.push(action),
                Err(err) => {
                    let mut remainder = vec![action];
                    remainder.extend(backlog);
                    self.queue.restore(remainder);
                    flush.error = Some(err);
                    break;
                }
            }
        }
        flush
    }

    /// Waits for the next frame, heartbeat tick or reconnect deadline.
    /// Never resolves while there is nothing to wait for.
    pub async fn next_event(&mut self) -> LinkEvent {
        let reconnect_at = self.reconnect_at;
        match self.link.as_mut() {
            Some(link) => {
                tokio::select! {
                    frame = link.next_text() => match frame {
                        Some(Ok(text)) => LinkEvent::Frame(text),
                        Some(Err(err)) => LinkEvent::Closed(Some(err)),
                        None => LinkEvent::Closed(None),
                    },
                    _ = tick(&mut self.heartbeat) => LinkEvent::HeartbeatDue,
                }
            }
            None => match reconnect_at {
                Some(at) => {
                    sleep_until(at).await;
                    self.reconnect_at = None;
                    LinkEvent::ReconnectDue
                }
                None => pending().await,
            },
        }
    }

    /// Intentional close: no reconnection, no timers left behind.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.close().await {
                debug!("connection: close failed: {err:#}");
            }
        }
        self.heartbeat = None;
        self.reconnect_at = None;
        if self.status != ConnectionStatus::Lost {
            self.status = ConnectionStatus::Closed;
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
