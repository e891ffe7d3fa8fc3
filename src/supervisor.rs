//! Worker supervision
//!
//! A single actor task owns the execution unit, the pending-request table and
//! every timer, so none of that state is shared or locked. Callers talk to it
//! through a cloneable [`SupervisorHandle`].
//!
//! Lifecycle: `Starting` when a unit has been spawned, `Running` once it has
//! answered its first message, `Crashed` while a restart is scheduled, and
//! `Stopped` after shutdown or a clean exit.

use crate::config::SupervisorConfig;
use crate::error::{Result, SearchError};
use crate::protocol::{RequestBody, SearchOutcome, WorkerMessage, WorkerPayload, WorkerRequest, PROBE_ID};
use crate::worker::{run_worker, WorkerOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const WORKER_UNAVAILABLE: &str = "Worker unavailable, restarting...";
pub const REQUEST_TIMEOUT: &str = "Request timeout";
pub const COMMUNICATION_FAILED: &str = "Worker communication failed";
pub const SUPERVISOR_STOPPED: &str = "Supervisor shut down";

/// In-memory pipe capacity for in-process units
const DUPLEX_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Crashed,
}

/// Snapshot published on every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// Crashes since the unit last answered
    pub failures: u32,
    /// Units spawned so far
    pub spawns: u32,
}

/// Exponential restart delay with a ceiling
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl RestartBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.ceiling);
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Something a unit reports back through its transport
#[derive(Debug)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// Transport failure
    Error(String),
    /// Request `id` could not be written to the unit
    SendFailed { id: i64, error: String },
    /// Exit code, `None` when killed by a signal or cancelled
    Exited(Option<i32>),
}

/// Supervisor side of a running unit
///
/// Dropping the channel terminates the unit.
pub struct WorkerChannel {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub kill: oneshot::Sender<()>,
}

/// Starts execution units
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self) -> Result<WorkerChannel>;
}

/// Runs units as child processes speaking JSON lines over stdin/stdout
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run the current executable with `args`
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<WorkerChannel> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SearchError::Worker("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SearchError::Worker("worker stdout unavailable".into()))?;

        info!(pid = child.id(), "Spawned worker process {:?}", self.program);
        Ok(connect(stdout, stdin, Unit::Process(child)))
    }
}

/// Runs units as tokio tasks over in-memory pipes
#[derive(Clone, Default)]
pub struct InProcessSpawner {
    options: WorkerOptions,
}

impl InProcessSpawner {
    pub fn new(options: WorkerOptions) -> Self {
        Self { options }
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self) -> Result<WorkerChannel> {
        let (supervisor_side, unit_side) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (unit_read, unit_write) = tokio::io::split(unit_side);
        let task = tokio::spawn(run_worker(unit_read, unit_write, self.options.clone()));

        let (reader, writer) = tokio::io::split(supervisor_side);
        debug!("Spawned in-process worker");
        Ok(connect(reader, writer, Unit::Task(task)))
    }
}

enum Unit {
    Process(Child),
    Task(JoinHandle<Result<()>>),
}

impl Unit {
    async fn kill(&mut self) {
        match self {
            Unit::Process(child) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker process: {}", e);
                }
            }
            Unit::Task(task) => task.abort(),
        }
    }

    async fn wait(&mut self) -> Option<i32> {
        match self {
            Unit::Process(child) => child.wait().await.ok().and_then(|status| status.code()),
            Unit::Task(task) => match task.await {
                Ok(Ok(())) => Some(0),
                Ok(Err(e)) => {
                    warn!("In-process worker failed: {}", e);
                    Some(1)
                }
                Err(_) => None,
            },
        }
    }
}

fn connect<R, W>(reader: R, writer: W, unit: Unit) -> WorkerChannel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel();

    tokio::spawn(forward_requests(writer, request_rx, event_tx.clone()));
    tokio::spawn(watch_unit(reader, unit, kill_rx, event_tx));

    WorkerChannel {
        requests: request_tx,
        events: event_rx,
        kill: kill_tx,
    }
}

async fn forward_requests<W>(
    mut writer: W,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let mut broken: Option<String> = None;

    while let Some(request) = requests.recv().await {
        let id = request.id;
        // once the pipe is broken nothing else is written
        if let Some(error) = &broken {
            let _ = events.send(WorkerEvent::SendFailed {
                id,
                error: error.clone(),
            });
            continue;
        }

        let line = match serde_json::to_string(&request) {
            Ok(line) => line + "\n",
            Err(e) => {
                error!(id, "Failed to encode request: {}", e);
                continue;
            }
        };
        if let Err(e) = write_line(&mut writer, &line).await {
            let error = e.to_string();
            let _ = events.send(WorkerEvent::SendFailed {
                id,
                error: error.clone(),
            });
            broken = Some(error);
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn watch_unit<R>(
    reader: R,
    mut unit: Unit,
    mut kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = &mut kill => {
                unit.kill().await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(message) => {
                        let _ = events.send(WorkerEvent::Message(message));
                    }
                    Err(e) => warn!("Ignoring unparseable worker output ({}): {}", e, line),
                },
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(WorkerEvent::Error(e.to_string()));
                    break;
                }
            },
        }
    }

    tokio::select! {
        _ = &mut kill => unit.kill().await,
        code = unit.wait() => {
            let _ = events.send(WorkerEvent::Exited(code));
        }
    }
}

enum SupervisorCommand {
    Send {
        body: RequestBody,
        reply: oneshot::Sender<SearchOutcome>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable access to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    status: watch::Receiver<SupervisorStatus>,
}

impl SupervisorHandle {
    /// Forward a request to the unit and wait for its outcome
    ///
    /// Never fails: transport problems come back as error outcomes.
    pub async fn send_request(&self, body: RequestBody) -> SearchOutcome {
        let (reply, outcome) = oneshot::channel();
        if self.commands.send(SupervisorCommand::Send { body, reply }).is_err() {
            return SearchOutcome::failure(WORKER_UNAVAILABLE);
        }
        outcome
            .await
            .unwrap_or_else(|_| SearchOutcome::failure(WORKER_UNAVAILABLE))
    }

    /// Kill the unit and stop supervising; terminal
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(SupervisorCommand::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> SupervisorState {
        self.status().state
    }

    /// Wait until the supervisor reaches `state`; false if it went away first
    pub async fn wait_for_state(&self, state: SupervisorState) -> bool {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| s.state == state).await.is_ok();
        reached
    }
}

struct PendingRequest {
    reply: oneshot::Sender<SearchOutcome>,
    timer: JoinHandle<()>,
}

struct LiveWorker {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    _kill: oneshot::Sender<()>,
    answered: bool,
}

/// Keeps one execution unit alive and multiplexes requests over it
pub struct WorkerSupervisor<S: WorkerSpawner> {
    spawner: S,
    config: SupervisorConfig,
    worker: Option<LiveWorker>,
    pending: HashMap<i64, PendingRequest>,
    next_id: i64,
    backoff: RestartBackoff,
    failures: u32,
    spawns: u32,
    restart_at: Option<Instant>,
    state: SupervisorState,
    status_tx: watch::Sender<SupervisorStatus>,
    timeouts_tx: mpsc::UnboundedSender<i64>,
    timeouts_rx: mpsc::UnboundedReceiver<i64>,
}

impl<S: WorkerSpawner> WorkerSupervisor<S> {
    /// Start supervising; the first unit is spawned immediately
    pub fn start(spawner: S, config: SupervisorConfig) -> SupervisorHandle {
        let initial = SupervisorStatus {
            state: SupervisorState::Stopped,
            failures: 0,
            spawns: 0,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            backoff: RestartBackoff::new(config.restart_floor, config.restart_ceiling),
            spawner,
            config,
            worker: None,
            pending: HashMap::new(),
            next_id: 0,
            failures: 0,
            spawns: 0,
            restart_at: None,
            state: SupervisorState::Stopped,
            status_tx,
            timeouts_tx,
            timeouts_rx,
        };
        tokio::spawn(supervisor.run(commands_rx));

        SupervisorHandle {
            commands: commands_tx,
            status: status_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SupervisorCommand>) {
        self.start_worker();

        let period = self.config.health_interval;
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Send { body, reply }) => self.dispatch(body, reply),
                    Some(SupervisorCommand::Shutdown { done }) => {
                        self.stop();
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.stop();
                        return;
                    }
                },
                Some(id) = self.timeouts_rx.recv() => self.expire(id),
                event = next_event(&mut self.worker) => self.handle_event(event),
                _ = health.tick() => self.probe(),
                _ = restart_timer(self.restart_at) => {
                    self.restart_at = None;
                    self.start_worker();
                }
            }
        }
    }

    fn set_state(&mut self, state: SupervisorState) {
        self.state = state;
        self.status_tx.send_replace(SupervisorStatus {
            state,
            failures: self.failures,
            spawns: self.spawns,
        });
    }

    fn start_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }

        self.spawns += 1;
        self.set_state(SupervisorState::Starting);

        match self.spawner.spawn() {
            Ok(channel) => {
                self.worker = Some(LiveWorker {
                    requests: channel.requests,
                    events: channel.events,
                    _kill: channel.kill,
                    answered: false,
                });
                // the first answer marks the unit as running
                self.probe();
            }
            Err(e) => {
                error!("Failed to start worker: {}", e);
                self.crash();
            }
        }
    }

    fn probe(&mut self) {
        let Some(worker) = &self.worker else {
            return;
        };
        let request = WorkerRequest {
            id: PROBE_ID,
            body: RequestBody::HealthCheck,
        };
        if worker.requests.send(request).is_err() {
            warn!("Health check could not be delivered");
            self.crash();
        }
    }

    fn dispatch(&mut self, body: RequestBody, reply: oneshot::Sender<SearchOutcome>) {
        let Some(worker) = &self.worker else {
            let _ = reply.send(SearchOutcome::failure(WORKER_UNAVAILABLE));
            return;
        };

        self.next_id += 1;
        let id = self.next_id;

        if worker.requests.send(WorkerRequest { id, body }).is_err() {
            error!(id, "Failed to forward request");
            let _ = reply.send(SearchOutcome::failure(COMMUNICATION_FAILED));
            self.crash();
            return;
        }

        let timeouts = self.timeouts_tx.clone();
        let timeout = self.config.request_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timeouts.send(id);
        });

        debug!(id, "Request dispatched");
        self.pending.insert(id, PendingRequest { reply, timer });
    }

    fn expire(&mut self, id: i64) {
        if let Some(pending) = self.pending.remove(&id) {
            warn!(id, "Request timed out");
            let _ = pending.reply.send(SearchOutcome::failure(REQUEST_TIMEOUT));
        }
    }

    fn resolve(&mut self, id: i64, outcome: SearchOutcome) {
        match self.pending.remove(&id) {
            Some(pending) => {
                pending.timer.abort();
                let _ = pending.reply.send(outcome);
            }
            None => debug!(id, "Discarding reply for unknown request"),
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message(message) => {
                self.mark_answered();
                match message.payload {
                    WorkerPayload::Pong => debug!("Worker is healthy"),
                    WorkerPayload::Result { result } => self.resolve(message.id, result),
                    WorkerPayload::Fault { error } if message.id == PROBE_ID => {
                        warn!("Worker reported an error: {}", error);
                    }
                    WorkerPayload::Fault { error } => {
                        self.resolve(message.id, SearchOutcome::failure(error));
                    }
                }
            }
            WorkerEvent::Error(e) => {
                error!("Worker transport error: {}", e);
                self.crash();
            }
            WorkerEvent::SendFailed { id, error } => {
                error!(id, "Failed to forward request: {}", error);
                self.fail_unsent(id);
                self.crash();
            }
            WorkerEvent::Exited(Some(0)) => {
                info!("Worker exited cleanly");
                self.worker = None;
                self.set_state(SupervisorState::Stopped);
            }
            WorkerEvent::Exited(code) => {
                error!(?code, "Worker exited unexpectedly");
                self.crash();
            }
        }
    }

    fn mark_answered(&mut self) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        if worker.answered {
            return;
        }
        worker.answered = true;
        self.backoff.reset();
        self.failures = 0;
        info!("Worker running");
        self.set_state(SupervisorState::Running);
    }

    /// Answer a request that never reached the unit
    fn fail_unsent(&mut self, id: i64) {
        if id == PROBE_ID {
            return;
        }
        if let Some(pending) = self.pending.remove(&id) {
            pending.timer.abort();
            let _ = pending.reply.send(SearchOutcome::failure(COMMUNICATION_FAILED));
        }
    }

    fn crash(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            // requests queued behind a broken write are already reported
            while let Ok(event) = worker.events.try_recv() {
                if let WorkerEvent::SendFailed { id, .. } = event {
                    self.fail_unsent(id);
                }
            }
        }
        self.failures += 1;
        let delay = self.backoff.next_delay();
        self.restart_at = Some(Instant::now() + delay);
        warn!(
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Worker crashed, restart scheduled"
        );
        self.set_state(SupervisorState::Crashed);
    }

    fn stop(&mut self) {
        self.worker = None;
        self.restart_at = None;
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
            let _ = pending.reply.send(SearchOutcome::failure(SUPERVISOR_STOPPED));
        }
        info!("Supervisor stopped");
        self.set_state(SupervisorState::Stopped);
    }
}

async fn next_event(worker: &mut Option<LiveWorker>) -> WorkerEvent {
    match worker {
        Some(worker) => worker
            .events
            .recv()
            .await
            .unwrap_or(WorkerEvent::Exited(None)),
        None => std::future::pending().await,
    }
}

async fn restart_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SearchReport;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Behavior {
        /// spawn itself fails
        Refuse,
        /// exits with code 1 before answering anything
        Crash,
        /// reports a transport error before answering anything
        Break,
        /// answers probes; searches answered after a query-dependent delay
        Serve,
    }

    #[derive(Clone, Default)]
    struct Probes {
        health_checks: Arc<AtomicUsize>,
        killed: Arc<AtomicBool>,
    }

    struct FakeSpawner {
        script: Mutex<VecDeque<Behavior>>,
        fallback: Behavior,
        spawned: mpsc::UnboundedSender<Instant>,
        probes: Probes,
    }

    impl FakeSpawner {
        fn new(script: &[Behavior], fallback: Behavior) -> (Self, mpsc::UnboundedReceiver<Instant>, Probes) {
            let (spawned, spawn_times) = mpsc::unbounded_channel();
            let probes = Probes::default();
            let spawner = Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                spawned,
                probes: probes.clone(),
            };
            (spawner, spawn_times, probes)
        }
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(&self) -> Result<WorkerChannel> {
            let _ = self.spawned.send(Instant::now());
            let behavior = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            if behavior == Behavior::Refuse {
                return Err(SearchError::Worker("spawn refused".into()));
            }
            Ok(fake_unit(behavior, self.probes.clone()))
        }
    }

    fn reply_delay(query: &str) -> Duration {
        match query {
            "slow" => Duration::from_secs(5),
            "late" => Duration::from_secs(20),
            _ => Duration::ZERO,
        }
    }

    fn fake_unit(behavior: Behavior, probes: Probes) -> WorkerChannel {
        let (request_tx, mut requests) = mpsc::unbounded_channel::<WorkerRequest>();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill) = oneshot::channel::<()>();

        tokio::spawn(async move {
            match behavior {
                Behavior::Crash => {
                    let _ = events.send(WorkerEvent::Exited(Some(1)));
                    return;
                }
                Behavior::Break => {
                    let _ = events.send(WorkerEvent::Error("connection reset".into()));
                    return;
                }
                _ => {}
            }
            loop {
                tokio::select! {
                    _ = &mut kill => {
                        probes.killed.store(true, Ordering::SeqCst);
                        return;
                    }
                    request = requests.recv() => {
                        let Some(request) = request else { return };
                        match request.body {
                            RequestBody::HealthCheck => {
                                probes.health_checks.fetch_add(1, Ordering::SeqCst);
                                let _ = events.send(WorkerEvent::Message(WorkerMessage::pong(request.id)));
                            }
                            RequestBody::Search { query, .. } => {
                                let events = events.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(reply_delay(&query)).await;
                                    let report = SearchReport::build(&query, "fake", &[], 10);
                                    let message = WorkerMessage::result(request.id, SearchOutcome::Found(report));
                                    let _ = events.send(WorkerEvent::Message(message));
                                });
                            }
                        }
                    }
                }
            }
        });

        WorkerChannel {
            requests: request_tx,
            events: event_rx,
            kill: kill_tx,
        }
    }

    /// Accepts `writes` writes, then fails like a closed pipe
    struct BrokenAfter {
        writes: usize,
    }

    impl AsyncWrite for BrokenAfter {
        fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            if self.writes == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.writes -= 1;
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Units whose stdin takes the startup probe and breaks on the next write
    struct BrokenPipeSpawner {
        spawns: Arc<AtomicUsize>,
    }

    impl WorkerSpawner for BrokenPipeSpawner {
        fn spawn(&self) -> Result<WorkerChannel> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let pong = serde_json::to_string(&WorkerMessage::pong(PROBE_ID)).unwrap() + "\n";
            let reader = std::io::Cursor::new(pong.into_bytes());
            let unit = Unit::Task(tokio::spawn(std::future::pending::<Result<()>>()));
            Ok(connect(reader, BrokenAfter { writes: 1 }, unit))
        }
    }

    fn query_of(outcome: &SearchOutcome) -> &str {
        &outcome.report().expect("expected a report").query
    }

    async fn gaps(spawn_times: &mut mpsc::UnboundedReceiver<Instant>, count: usize) -> Vec<u64> {
        let mut times = Vec::new();
        for _ in 0..=count {
            times.push(spawn_times.recv().await.unwrap());
        }
        times.windows(2).map(|w| (w[1] - w[0]).as_millis() as u64).collect()
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = RestartBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashing_units_restart_with_backoff() {
        let script = [Behavior::Crash, Behavior::Crash, Behavior::Crash];
        let (spawner, mut spawn_times, _) = FakeSpawner::new(&script, Behavior::Serve);
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());

        assert_eq!(gaps(&mut spawn_times, 3).await, vec![1000, 2000, 4000]);
        assert!(handle.wait_for_state(SupervisorState::Running).await);

        let status = handle.status();
        assert_eq!(status.failures, 0);
        assert_eq!(status.spawns, 4);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_at_ceiling() {
        let (spawner, mut spawn_times, _) = FakeSpawner::new(&[], Behavior::Refuse);
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());

        let delays = gaps(&mut spawn_times, 8).await;
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000]);
        assert_eq!(handle.state(), SupervisorState::Crashed);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_restarts_worker() {
        let (spawner, mut spawn_times, _) = FakeSpawner::new(&[Behavior::Break], Behavior::Serve);
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());

        assert_eq!(gaps(&mut spawn_times, 1).await, vec![1000]);
        assert!(handle.wait_for_state(SupervisorState::Running).await);

        let status = handle.status();
        assert_eq!(status.failures, 0);
        assert_eq!(status.spawns, 2);
        let outcome = handle.send_request(RequestBody::search("fast", "/repo")).await;
        assert_eq!(query_of(&outcome), "fast");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_answers_immediately() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let spawner = BrokenPipeSpawner {
            spawns: Arc::clone(&spawns),
        };
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());
        assert!(handle.wait_for_state(SupervisorState::Running).await);

        let started = Instant::now();
        let outcome = handle.send_request(RequestBody::search("login", "/repo")).await;
        assert_eq!(outcome.error(), Some(COMMUNICATION_FAILED));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.state(), SupervisorState::Crashed);
        assert_eq!(handle.status().failures, 1);

        // restarted after the backoff floor
        assert!(handle.wait_for_state(SupervisorState::Running).await);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(spawns.load(Ordering::SeqCst), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_without_live_worker() {
        let (spawner, _spawn_times, _) = FakeSpawner::new(&[], Behavior::Refuse);
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());

        let outcome = handle.send_request(RequestBody::search("login", "/repo")).await;
        assert_eq!(outcome.error(), Some(WORKER_UNAVAILABLE));
        assert_eq!(outcome.report(), None);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_matched_by_id_out_of_order() {
        let (spawner, _spawn_times, _) = FakeSpawner::new(&[], Behavior::Serve);
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());
        assert!(handle.wait_for_state(SupervisorState::Running).await);

        let started = Instant::now();
        let timed = |query: &'static str| {
            let handle = handle.clone();
            async move {
                let outcome = handle.send_request(RequestBody::search(query, "/repo")).await;
                (outcome, started.elapsed())
            }
        };
        // "slow" is submitted first but answered last
        let ((slow, slow_after), (fast, fast_after)) = tokio::join!(timed("slow"), timed("fast"));

        assert_eq!(query_of(&slow), "slow");
        assert_eq!(query_of(&fast), "fast");
        assert_eq!(fast_after, Duration::ZERO);
        assert_eq!(slow_after, Duration::from_secs(5));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_late_reply() {
        let (spawner, _spawn_times, _) = FakeSpawner::new(&[], Behavior::Serve);
        let config = SupervisorConfig::default().with_request_timeout(Duration::from_secs(10));
        let handle = WorkerSupervisor::start(spawner, config);
        assert!(handle.wait_for_state(SupervisorState::Running).await);

        let started = Instant::now();
        let outcome = handle.send_request(RequestBody::search("late", "/repo")).await;
        assert_eq!(outcome.error(), Some(REQUEST_TIMEOUT));
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        // let the late reply arrive, then make sure the supervisor still works
        tokio::time::sleep(Duration::from_secs(15)).await;
        let outcome = handle.send_request(RequestBody::search("fast", "/repo")).await;
        assert_eq!(query_of(&outcome), "fast");
        assert_eq!(handle.state(), SupervisorState::Running);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_health_probe() {
        let (spawner, _spawn_times, probes) = FakeSpawner::new(&[], Behavior::Serve);
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());
        assert!(handle.wait_for_state(SupervisorState::Running).await);

        tokio::time::sleep(Duration::from_secs(65)).await;
        // startup probe plus one every 30 s
        assert_eq!(probes.health_checks.load(Ordering::SeqCst), 3);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_terminal() {
        let (spawner, mut spawn_times, probes) = FakeSpawner::new(&[], Behavior::Serve);
        let handle = WorkerSupervisor::start(spawner, SupervisorConfig::default());
        assert!(handle.wait_for_state(SupervisorState::Running).await);

        handle.shutdown().await;
        assert_eq!(handle.state(), SupervisorState::Stopped);

        let outcome = handle.send_request(RequestBody::search("login", "/repo")).await;
        assert_eq!(outcome.error(), Some(WORKER_UNAVAILABLE));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(probes.killed.load(Ordering::SeqCst));
        spawn_times.recv().await.unwrap();
        assert!(spawn_times.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_in_process_worker_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "function login() {}").unwrap();

        let handle = WorkerSupervisor::start(
            InProcessSpawner::new(WorkerOptions::default()),
            SupervisorConfig::default(),
        );
        let outcome = handle
            .send_request(RequestBody::search("login", dir.path().to_str().unwrap()))
            .await;

        let report = outcome.report().expect("search should succeed");
        assert_eq!(report.results_count, 1);
        assert_eq!(report.results[0].file, "a.js");
        assert_eq!(handle.state(), SupervisorState::Running);
        handle.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_code_reported() {
        let spawner = ProcessSpawner::new("sh", vec!["-c".into(), "exit 3".into()]);
        let mut channel = spawner.spawn().unwrap();

        loop {
            match channel.events.recv().await {
                Some(WorkerEvent::Exited(code)) => {
                    assert_eq!(code, Some(3));
                    break;
                }
                Some(_) => continue,
                None => panic!("events closed without exit"),
            }
        }
    }
}
