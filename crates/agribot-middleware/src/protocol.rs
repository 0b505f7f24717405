//! Request/acknowledge client for the actuator unit.
//!
//! The link carries one transaction at a time: a command line goes out and
//! exactly one acknowledgement line comes back.  [`ProtocolClient`] enforces
//! that by funnelling every request through a single transport task that owns
//! the [`Link`].  Callers on any task hold a cheap clone of the client and
//! await their reply on a oneshot channel.
//!
//! Two queues feed the transport task.  The priority lane (safety stops,
//! obstacle reactions) is always drained first; a transaction already on the
//! wire is never interrupted.  A priority batch
//! ([`ProtocolClient::send_batch_priority`]) runs its commands back to back
//! with nothing from either lane in between.
//!
//! A request whose caller has gone away before the transport reaches it is
//! dropped unsent.  [`Submission`] makes that explicit for commands whose
//! caller needs to know whether they reached the unit.
//!
//! Each transaction has its own deadline: the base response timeout, plus the
//! time the command itself spends actuating, plus the closed-loop controller
//! timeout for commands that wait on it.  On expiry the input buffer is
//! drained and [`AgriError::Timeout`] is returned.  There is no automatic
//! retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use agribot_types::{ActuatorAck, AgriError, CalibrationProfile, MotionCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, instrument, warn};

use crate::link::Link;

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    /// Base time allowed for the unit to answer.
    pub response_timeout: Duration,
    /// Extra time allowed for commands that wait on closed-loop control.
    pub closed_loop_allowance: Duration,
    pub queue_depth: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            closed_loop_allowance: Duration::from_secs(10),
            queue_depth: 32,
        }
    }
}

impl ProtocolConfig {
    pub fn from_profile(profile: &CalibrationProfile, response_timeout: Duration) -> Self {
        Self {
            response_timeout,
            closed_loop_allowance: Duration::from_secs_f32(profile.closed_loop_timeout_s.max(0.0)),
            ..Self::default()
        }
    }

    /// How long to wait for the acknowledgement of `command`.
    pub fn deadline_for(&self, command: &MotionCommand) -> Duration {
        let mut deadline = self.response_timeout + command.actuation_time();
        if command.is_closed_loop() {
            deadline += self.closed_loop_allowance;
        }
        deadline
    }
}

/// Running counters kept by the transport task.
#[derive(Debug, Default)]
struct LinkCounters {
    sent: AtomicU64,
    acknowledged: AtomicU64,
    refused: AtomicU64,
    timeouts: AtomicU64,
    malformed: AtomicU64,
    withdrawn: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    pub sent: u64,
    pub acknowledged: u64,
    pub refused: u64,
    pub timeouts: u64,
    pub malformed: u64,
    /// Requests dropped unsent because their caller gave up first.
    pub withdrawn: u64,
}

/// One acknowledgement and the moment it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct Acked {
    pub ack: ActuatorAck,
    pub at: Instant,
}

/// Result of a batch: the acknowledged prefix, and the error that ended it
/// early, if any.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub acked: Vec<Acked>,
    pub failure: Option<AgriError>,
}

impl BatchReport {
    fn failed(error: AgriError) -> Self {
        Self {
            acked: Vec::new(),
            failure: Some(error),
        }
    }

    fn into_single(self) -> Result<ActuatorAck, AgriError> {
        if let Some(error) = self.failure {
            return Err(error);
        }
        self.acked
            .into_iter()
            .next()
            .map(|acked| acked.ack)
            .ok_or_else(|| AgriError::LinkClosed("request completed without a reply".into()))
    }
}

const QUEUED: u8 = 0;
const ON_WIRE: u8 = 1;
const WITHDRAWN: u8 = 2;

/// Race between the transport taking a request and its caller withdrawing
/// it.  Exactly one side wins.
#[derive(Debug, Default)]
struct Claim(AtomicU8);

impl Claim {
    fn take_for_wire(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, ON_WIRE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn withdraw(&self) -> bool {
        match self
            .0
            .compare_exchange(QUEUED, WITHDRAWN, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == WITHDRAWN,
        }
    }

    fn on_wire(&self) -> bool {
        self.0.load(Ordering::Acquire) == ON_WIRE
    }
}

struct Request {
    commands: Vec<MotionCommand>,
    claim: Arc<Claim>,
    on_wire: Option<oneshot::Sender<()>>,
    reply: oneshot::Sender<BatchReport>,
}

/// A queued normal-lane command whose transmission the caller can observe
/// and, until then, cancel.  Dropping it withdraws the command if it has not
/// been sent.
pub struct Submission {
    claim: Arc<Claim>,
    on_wire: oneshot::Receiver<()>,
    reply: oneshot::Receiver<BatchReport>,
}

impl Submission {
    /// Resolves once the command has been written to the link.
    pub async fn transmitted(&mut self) -> Result<(), AgriError> {
        if self.claim.on_wire() {
            return Ok(());
        }
        (&mut self.on_wire)
            .await
            .map_err(|_| AgriError::LinkClosed("request dropped before transmission".into()))
    }

    /// Take the command back.  `false` once it is on the wire, in which case
    /// it will run to completion.
    pub fn withdraw(&self) -> bool {
        self.claim.withdraw()
    }

    pub async fn outcome(&mut self) -> Result<ActuatorAck, AgriError> {
        (&mut self.reply)
            .await
            .map_err(|_| AgriError::LinkClosed("transport task dropped the request".into()))?
            .into_single()
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        self.claim.withdraw();
    }
}

/// Cloneable handle onto the transport task.
#[derive(Clone)]
pub struct ProtocolClient {
    normal: mpsc::Sender<Request>,
    priority: mpsc::Sender<Request>,
    counters: Arc<LinkCounters>,
}

impl ProtocolClient {
    /// Start the transport task on `link`.
    ///
    /// The task ends when every client clone has been dropped.
    pub fn spawn<L>(link: L, config: ProtocolConfig) -> (Self, JoinHandle<()>)
    where
        L: Link + 'static,
    {
        let (normal, normal_rx) = mpsc::channel(config.queue_depth);
        let (priority, priority_rx) = mpsc::channel(config.queue_depth);
        let counters = Arc::new(LinkCounters::default());
        let transport = Transport {
            link,
            config,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(
            transport
                .run(normal_rx, priority_rx)
                .instrument(info_span!("link_transport")),
        );
        (
            Self {
                normal,
                priority,
                counters,
            },
            handle,
        )
    }

    /// Send `command` and wait for its acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`AgriError::Timeout`] if no line arrives before the deadline.
    /// - [`AgriError::Malformed`] for an unparseable line or one that does not
    ///   answer this command.
    /// - [`AgriError::Command`] when the unit answers `ERROR:<message>`.
    /// - [`AgriError::LinkClosed`] / [`AgriError::Io`] for transport failure.
    #[instrument(level = "debug", skip_all, fields(command = %command))]
    pub async fn send(&self, command: MotionCommand) -> Result<ActuatorAck, AgriError> {
        Self::roundtrip(&self.normal, vec![command]).await.into_single()
    }

    /// Like [`send`][Self::send] but jumps ahead of every queued normal
    /// command.
    #[instrument(level = "debug", skip_all, fields(command = %command))]
    pub async fn send_priority(&self, command: MotionCommand) -> Result<ActuatorAck, AgriError> {
        Self::roundtrip(&self.priority, vec![command]).await.into_single()
    }

    /// Run `commands` on the priority lane as one uninterrupted sequence.
    /// The batch stops at the first failure.
    #[instrument(level = "debug", skip_all, fields(steps = commands.len()))]
    pub async fn send_batch_priority(&self, commands: Vec<MotionCommand>) -> BatchReport {
        if commands.is_empty() {
            return BatchReport::default();
        }
        Self::roundtrip(&self.priority, commands).await
    }

    /// Queue `command` on the normal lane without waiting for it.
    #[instrument(level = "debug", skip_all, fields(command = %command))]
    pub async fn submit(&self, command: MotionCommand) -> Result<Submission, AgriError> {
        let claim = Arc::new(Claim::default());
        let (on_wire_tx, on_wire) = oneshot::channel();
        let (reply_tx, reply) = oneshot::channel();
        Self::enqueue(
            &self.normal,
            Request {
                commands: vec![command],
                claim: claim.clone(),
                on_wire: Some(on_wire_tx),
                reply: reply_tx,
            },
        )
        .await?;
        Ok(Submission {
            claim,
            on_wire,
            reply,
        })
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), AgriError> {
        self.send_priority(MotionCommand::Ping).await.map(|_| ())
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        LinkStats {
            sent: c.sent.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            refused: c.refused.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            withdrawn: c.withdrawn.load(Ordering::Relaxed),
        }
    }

    async fn roundtrip(lane: &mpsc::Sender<Request>, commands: Vec<MotionCommand>) -> BatchReport {
        let (reply, rx) = oneshot::channel();
        let request = Request {
            commands,
            claim: Arc::new(Claim::default()),
            on_wire: None,
            reply,
        };
        if let Err(e) = Self::enqueue(lane, request).await {
            return BatchReport::failed(e);
        }
        rx.await.unwrap_or_else(|_| {
            BatchReport::failed(AgriError::LinkClosed(
                "transport task dropped the request".into(),
            ))
        })
    }

    async fn enqueue(lane: &mpsc::Sender<Request>, request: Request) -> Result<(), AgriError> {
        lane.send(request)
            .await
            .map_err(|_| AgriError::LinkClosed("transport task stopped".into()))
    }
}

struct Transport<L> {
    link: L,
    config: ProtocolConfig,
    counters: Arc<LinkCounters>,
}

impl<L: Link> Transport<L> {
    async fn run(
        mut self,
        mut normal: mpsc::Receiver<Request>,
        mut priority: mpsc::Receiver<Request>,
    ) {
        loop {
            let mut request = tokio::select! {
                biased;
                Some(r) = priority.recv() => r,
                Some(r) = normal.recv() => r,
                else => break,
            };
            if request.reply.is_closed() || !request.claim.take_for_wire() {
                self.counters.withdrawn.fetch_add(1, Ordering::Relaxed);
                debug!(steps = request.commands.len(), "withdrawn before transmission");
                continue;
            }
            if let Some(on_wire) = request.on_wire.take() {
                let _ = on_wire.send(());
            }

            let mut report = BatchReport::default();
            for command in &request.commands {
                match self.transact(command).await {
                    Ok(ack) => report.acked.push(Acked {
                        ack,
                        at: Instant::now(),
                    }),
                    Err(e) => {
                        report.failure = Some(e);
                        break;
                    }
                }
            }
            if request.reply.send(report).is_err() {
                debug!(steps = request.commands.len(), "caller gone before acknowledgement");
            }
        }
        debug!("all clients dropped, transport exiting");
    }

    async fn transact(&mut self, command: &MotionCommand) -> Result<ActuatorAck, AgriError> {
        let line = command.to_string();
        let deadline = self.config.deadline_for(command);

        self.link.clear_input().await;
        self.link.send_line(&line).await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        let reply = match tokio::time::timeout(deadline, self.link.recv_line()).await {
            Ok(reply) => reply?,
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.link.clear_input().await;
                warn!(command = %line, deadline_ms = deadline.as_millis() as u64, "no acknowledgement");
                return Err(AgriError::Timeout {
                    command: line,
                    timeout_ms: deadline.as_millis() as u64,
                });
            }
        };

        let ack = match reply.parse::<ActuatorAck>() {
            Ok(ack) if command.accepts(&ack) => ack,
            Ok(_) | Err(_) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(command = %line, %reply, "unexpected acknowledgement");
                return Err(AgriError::Malformed(format!(
                    "'{reply}' is not an answer to '{line}'"
                )));
            }
        };

        match ack {
            ActuatorAck::Error(message) => {
                self.counters.refused.fetch_add(1, Ordering::Relaxed);
                warn!(command = %line, %message, "actuator refused command");
                Err(AgriError::Command {
                    command: line,
                    message,
                })
            }
            ack => {
                self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                debug!(command = %line, %ack, "acknowledged");
                Ok(ack)
            }
        }
    }
}
