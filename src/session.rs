use std::convert::TryFrom;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cli::Options;
use crate::error::PingError;
use crate::packet::{self, EchoReply, IcmpMessage, Timestamp};
use crate::transport::{Resolve, Transport};

/// Identifier stamped on every probe. Only one probe is ever outstanding, so
/// runs are not multiplexed on it.
pub const IDENTIFIER: u16 = 0;

// Longest stretch either suspension point blocks before looking at the
// cancel flag again.
const WAIT_SLICE: Duration = Duration::from_millis(50);

const RECV_BUF_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub target: Ipv4Addr,
    /// Stop after this many probes; run until interrupted if `None`.
    pub count: Option<u64>,
    /// Pause between one probe finishing and the next one starting.
    pub interval: Duration,
    /// How long to wait for a reply before declaring the probe lost.
    pub timeout: Duration,
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSummary {
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
}

/// Counters for one run.
///
/// `sent` counts successful transmits of finished probes. Every finished
/// probe adds to exactly one of `received` and `lost`, so
/// `sent == received + lost` whenever the session is not mid-probe. A probe
/// that never finishes, cut short by an interrupt or a receive error, is
/// taken back out of `sent`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    sent: u64,
    received: u64,
    lost: u64,
    rtt_min: Option<Duration>,
    rtt_max: Option<Duration>,
    rtt_total: Duration,
}

impl SessionStats {
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            100.0 * self.lost as f64 / self.sent as f64
        }
    }

    pub fn rtt_summary(&self) -> Option<RttSummary> {
        let (min, max) = (self.rtt_min?, self.rtt_max?);
        let avg = match u32::try_from(self.received) {
            Ok(received) => self.rtt_total / received,
            Err(_) => Duration::from_secs_f64(self.rtt_total.as_secs_f64() / self.received as f64),
        };
        Some(RttSummary { min, avg, max })
    }

    fn record_sent(&mut self) {
        self.sent += 1;
    }

    fn withdraw_sent(&mut self) {
        self.sent -= 1;
    }

    fn record_reply(&mut self, rtt: Duration) {
        self.received += 1;
        self.rtt_total += rtt;
        self.rtt_min = Some(self.rtt_min.map_or(rtt, |min| min.min(rtt)));
        self.rtt_max = Some(self.rtt_max.map_or(rtt, |max| max.max(rtt)));
    }

    fn record_loss(&mut self) {
        self.lost += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Replied { reply: EchoReply, rtt: Duration },
    TimedOut { sequence: u16 },
    /// A router on the way dropped the request.
    TimeExceeded { sequence: u16, router: Ipv4Addr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `count` probes went out.
    Finished,
    /// The cancel flag was raised.
    Interrupted,
}

/// Sends echo requests one at a time and waits for each reply.
pub struct Session<T> {
    transport: T,
    config: SessionConfig,
    sequence: u16,
    stats: SessionStats,
    cancel: Arc<AtomicBool>,
}

impl<T: Transport> Session<T> {
    /// Raising `cancel` from any thread ends `run` at its next suspension
    /// point with `Completion::Interrupted`.
    pub fn new(transport: T, config: SessionConfig, cancel: Arc<AtomicBool>) -> Self {
        Session {
            transport,
            config,
            sequence: 0,
            stats: SessionStats::default(),
            cancel,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Runs probes until `count` is reached or the session is cancelled.
    /// `on_probe` sees every finished probe, after the counters are updated.
    ///
    /// Transmit and receive errors end the run; counters keep what was
    /// accumulated up to that point.
    pub fn run<F>(&mut self, mut on_probe: F) -> Result<Completion, PingError>
    where
        F: FnMut(&ProbeOutcome),
    {
        info!(
            "pinging {} (count {:?}, interval {:?}, timeout {:?})",
            self.config.target, self.config.count, self.config.interval, self.config.timeout
        );

        loop {
            if self.is_cancelled() {
                return Ok(Completion::Interrupted);
            }
            if self.limit_reached() {
                return Ok(Completion::Finished);
            }

            let outcome = match self.probe()? {
                Some(outcome) => outcome,
                None => return Ok(Completion::Interrupted),
            };

            match &outcome {
                ProbeOutcome::Replied { rtt, .. } => self.stats.record_reply(*rtt),
                ProbeOutcome::TimedOut { .. } | ProbeOutcome::TimeExceeded { .. } => {
                    self.stats.record_loss()
                }
            }
            on_probe(&outcome);

            // No pause after the last probe
            if self.limit_reached() {
                return Ok(Completion::Finished);
            }
            if !self.pause(self.config.interval) {
                return Ok(Completion::Interrupted);
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn limit_reached(&self) -> bool {
        match self.config.count {
            Some(count) => self.stats.sent >= count,
            None => false,
        }
    }

    /// Sends the next echo request and waits for its reply. `None` if the
    /// wait was interrupted. Only a finished probe stays counted as sent.
    fn probe(&mut self) -> Result<Option<ProbeOutcome>, PingError> {
        let sequence = self.sequence;
        let request = packet::encode(IDENTIFIER, sequence, Timestamp::now())?;

        self.transport
            .send(&request)
            .map_err(PingError::Transmit)?;
        self.stats.record_sent();
        self.sequence = sequence.wrapping_add(1);
        debug!("sent icmp_seq={} to {}", sequence, self.config.target);

        let outcome = self.await_reply(sequence);
        if !matches!(outcome, Ok(Some(_))) {
            self.stats.withdraw_sent();
        }
        outcome
    }

    fn await_reply(&mut self, sequence: u16) -> Result<Option<ProbeOutcome>, PingError> {
        let deadline = Instant::now() + self.config.timeout;
        let mut buf = [0u8; RECV_BUF_LEN];

        loop {
            if self.is_cancelled() {
                return Ok(None);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Some(ProbeOutcome::TimedOut { sequence }));
            }

            let slice = (deadline - now).min(WAIT_SLICE);
            let n = match self
                .transport
                .recv_timeout(&mut buf, slice)
                .map_err(PingError::Receive)?
            {
                Some(n) => n,
                None => continue,
            };
            let received_at = Timestamp::now();

            match packet::decode(&buf[..n]) {
                Ok(IcmpMessage::Echo(reply)) if reply.answers(self.config.target, IDENTIFIER, sequence) => {
                    let rtt = reply.rtt(received_at);
                    return Ok(Some(ProbeOutcome::Replied { reply, rtt }));
                }
                Ok(IcmpMessage::TimeExceeded(error))
                    if error.concerns(self.config.target, IDENTIFIER, sequence) =>
                {
                    return Ok(Some(ProbeOutcome::TimeExceeded {
                        sequence,
                        router: error.source,
                    }));
                }
                Ok(IcmpMessage::TimeExceeded(error)) => debug!(
                    "ignoring time exceeded from {} for seq {} to {}",
                    error.source, error.sequence, error.original_destination
                ),
                Ok(IcmpMessage::Echo(other)) => debug!(
                    "ignoring ICMP type {} from {} (id {}, seq {}) while waiting for seq {}",
                    other.message_type, other.source, other.identifier, other.sequence, sequence
                ),
                Err(e) => warn!("discarding datagram of {} bytes: {}", n, e),
            }
        }
    }

    /// Sleeps for `duration`. Returns false if cancelled first.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }
}

/// Resolves the destination, then opens the transport. Nothing is opened if
/// resolution fails.
pub fn open_session<R, T, F>(
    resolver: &R,
    options: &Options,
    cancel: Arc<AtomicBool>,
    open: F,
) -> Result<Session<T>, PingError>
where
    R: Resolve,
    T: Transport,
    F: FnOnce(&SessionConfig) -> Result<T, PingError>,
{
    let target = resolver.resolve(&options.destination)?;
    let config = options.session_config(target);
    let transport = open(&config)?;
    Ok(Session::new(transport, config, cancel))
}
