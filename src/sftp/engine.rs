//! Transfer Engine
//!
//! One actor task per session owns the transfer queue. Every status change,
//! whether requested by the host (enqueue, pause, resume, cancel, shutdown)
//! or reported by a worker (progress, finished), goes through the actor's
//! mailbox, so a pause can never be lost to a concurrent progress update.
//!
//! Scheduling walks the queue in order:
//! - at most `concurrency` transfers are `active` at once
//! - a directory-create step is a barrier; nothing behind it starts until
//!   it is done
//! - paused transfers keep their worker parked but free their slot
//!
//! Workers stream in fixed-size chunks and report progress no more often
//! than `progress_interval_ms`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conflict::{BatchPolicy, ConflictInfo, ConflictPolicy, ConflictResolver, Resolution};
use super::error::TransferError;
use super::expand::{expand_directory, PlanStep};
use super::fs::{BoxedReader, BoxedWriter, FileSystem};
use super::transfer::TransferControl;
use super::types::{
    CancelPolicy, TransferDirection, TransferRecord, TransferSettings, TransferStatus,
};
use crate::session::events::EventEmitter;

/// Weight of the newest sample in the speed estimate
const SPEED_SMOOTHING: f64 = 0.3;

/// Supplies the session's remote filesystem, reopening it after a reconnect
#[async_trait]
pub trait RemoteFsProvider: Send + Sync {
    async fn remote_fs(&self) -> Result<Arc<dyn FileSystem>, TransferError>;
}

/// What one enqueue call put on the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    pub batch_id: String,
    pub transfer_ids: Vec<String>,
    /// Directory-create steps, in execution order
    pub directories: Vec<String>,
}

enum Command {
    Enqueue {
        direction: TransferDirection,
        batch: Arc<BatchPolicy>,
        steps: Vec<PlanStep>,
        reply: oneshot::Sender<Result<EnqueueOutcome, TransferError>>,
    },
    Pause {
        id: String,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Resume {
        id: String,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TransferRecord>>,
    },
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

enum Outcome {
    Completed(u64),
    Skipped,
}

/// Worker to actor messages
enum Report {
    Progress {
        id: String,
        progress_bytes: u64,
        total_bytes: u64,
        speed_bps: u64,
    },
    Retarget {
        id: String,
        dest: String,
    },
    Finished {
        id: String,
        result: Result<Outcome, TransferError>,
    },
    DirFinished {
        seq: u64,
        result: Result<(), TransferError>,
    },
}

struct Shared {
    settings: TransferSettings,
    local: Arc<dyn FileSystem>,
    remote: Arc<dyn RemoteFsProvider>,
    resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
    emitter: EventEmitter,
}

impl Shared {
    /// (source, destination) for `direction`
    async fn filesystems(
        &self,
        direction: TransferDirection,
    ) -> Result<(Arc<dyn FileSystem>, Arc<dyn FileSystem>), TransferError> {
        let remote = self.remote.remote_fs().await?;
        Ok(match direction {
            TransferDirection::Upload => (self.local.clone(), remote),
            TransferDirection::Download => (remote, self.local.clone()),
        })
    }

    async fn dest_fs(&self, direction: TransferDirection) -> Result<Arc<dyn FileSystem>, TransferError> {
        match direction {
            TransferDirection::Upload => self.remote.remote_fs().await,
            TransferDirection::Download => Ok(self.local.clone()),
        }
    }
}

/// Handle to one session's transfer queue
#[derive(Clone)]
pub struct TransferEngine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl TransferEngine {
    pub fn spawn(
        settings: TransferSettings,
        local: Arc<dyn FileSystem>,
        remote: Arc<dyn RemoteFsProvider>,
        emitter: EventEmitter,
    ) -> Self {
        let shared = Arc::new(Shared {
            settings,
            local,
            remote,
            resolver: RwLock::new(None),
            emitter,
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            shared: shared.clone(),
            jobs: HashMap::new(),
            order: Vec::new(),
            next_seq: 0,
            closed: false,
            reports: report_tx,
        };
        tokio::spawn(actor.run(cmd_rx, report_rx));

        Self { cmd_tx, shared }
    }

    pub fn session_id(&self) -> &str {
        self.shared.emitter.session_id()
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.shared.settings
    }

    /// Hook consulted by batches enqueued with `ConflictPolicy::Ask`
    pub fn set_conflict_resolver(&self, resolver: Option<Arc<dyn ConflictResolver>>) {
        *self.shared.resolver.write() = resolver;
    }

    fn send(&self, cmd: Command) -> Result<(), TransferError> {
        self.cmd_tx.send(cmd).map_err(|_| TransferError::SessionClosed)
    }

    /// Queue `source` for transfer to `dest`. A directory source is expanded
    /// into a depth-first batch rooted at `dest`.
    pub async fn enqueue(
        &self,
        direction: TransferDirection,
        source: &str,
        dest: &str,
        policy: ConflictPolicy,
    ) -> Result<EnqueueOutcome, TransferError> {
        let (source_fs, dest_fs) = self.shared.filesystems(direction).await?;
        let stat = source_fs
            .stat(source)
            .await?
            .ok_or_else(|| TransferError::NotFound(source.to_string()))?;

        let steps = if stat.is_dir {
            expand_directory(source_fs.as_ref(), dest_fs.as_ref(), source, dest).await?
        } else {
            vec![PlanStep::File {
                source: source.to_string(),
                dest: dest.to_string(),
                size: stat.size,
            }]
        };

        let batch = BatchPolicy::new(Uuid::new_v4().to_string(), policy);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            direction,
            batch,
            steps,
            reply,
        })?;
        rx.await.map_err(|_| TransferError::SessionClosed)?
    }

    pub async fn enqueue_upload(
        &self,
        local_path: &str,
        remote_path: &str,
        policy: ConflictPolicy,
    ) -> Result<EnqueueOutcome, TransferError> {
        self.enqueue(TransferDirection::Upload, local_path, remote_path, policy)
            .await
    }

    pub async fn enqueue_download(
        &self,
        remote_path: &str,
        local_path: &str,
        policy: ConflictPolicy,
    ) -> Result<EnqueueOutcome, TransferError> {
        self.enqueue(TransferDirection::Download, remote_path, local_path, policy)
            .await
    }

    async fn control(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), TransferError>>) -> Command,
    ) -> Result<(), TransferError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| TransferError::SessionClosed)?
    }

    /// Valid while `active`, or to withdraw a resume still waiting for a slot
    pub async fn pause(&self, id: &str) -> Result<(), TransferError> {
        let id = id.to_string();
        self.control(|reply| Command::Pause { id, reply }).await
    }

    /// Valid only while `paused`. With every slot taken the transfer stays
    /// `paused` until one frees up.
    pub async fn resume(&self, id: &str) -> Result<(), TransferError> {
        let id = id.to_string();
        self.control(|reply| Command::Resume { id, reply }).await
    }

    /// Valid from `queued`, `active` or `paused`
    pub async fn cancel(&self, id: &str) -> Result<(), TransferError> {
        let id = id.to_string();
        self.control(|reply| Command::Cancel { id, reply }).await
    }

    /// Every transfer in queue order
    pub async fn snapshot(&self) -> Vec<TransferRecord> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get(&self, id: &str) -> Option<TransferRecord> {
        self.snapshot().await.into_iter().find(|r| r.id == id)
    }

    /// Drop terminal transfers from the queue. Returns how many went.
    pub async fn clear_finished(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::ClearFinished { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Fail every unfinished transfer with "session closed" and refuse new
    /// work. Returns how many were failed.
    pub async fn shutdown(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

enum Slot {
    Dir {
        seq: u64,
        path: String,
        direction: TransferDirection,
        running: bool,
    },
    Transfer(String),
}

struct Job {
    record: TransferRecord,
    direction: TransferDirection,
    control: Arc<TransferControl>,
    batch: Arc<BatchPolicy>,
    /// Resume requested while every slot was taken; stays paused until one frees
    resume_pending: bool,
}

struct Actor {
    shared: Arc<Shared>,
    jobs: HashMap<String, Job>,
    order: Vec<Slot>,
    next_seq: u64,
    closed: bool,
    reports: mpsc::UnboundedSender<Report>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut report_rx: mpsc::UnboundedReceiver<Report>,
    ) {
        debug!("Transfer engine started for {}", self.shared.emitter.session_id());
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(report) = report_rx.recv() => self.handle_report(report),
            }
        }

        // Engine handle dropped; stop any worker still running
        for job in self.jobs.values() {
            job.control.cancel();
        }
        debug!("Transfer engine stopped for {}", self.shared.emitter.session_id());
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue {
                direction,
                batch,
                steps,
                reply,
            } => {
                let result = self.enqueue(direction, batch, steps);
                let _ = reply.send(result);
            }
            Command::Pause { id, reply } => {
                let result = self.pause(&id);
                let _ = reply.send(result);
            }
            Command::Resume { id, reply } => {
                let result = self.resume(&id);
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let result = self.cancel(&id);
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.records());
            }
            Command::ClearFinished { reply } => {
                let before = self.jobs.len();
                self.jobs.retain(|_, job| !job.record.status.is_terminal());
                let jobs = &self.jobs;
                self.order.retain(|slot| match slot {
                    Slot::Transfer(id) => jobs.contains_key(id),
                    Slot::Dir { .. } => true,
                });
                let removed = before - self.jobs.len();
                if removed > 0 {
                    self.emit_queue();
                }
                let _ = reply.send(removed);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
            }
        }
    }

    fn enqueue(
        &mut self,
        direction: TransferDirection,
        batch: Arc<BatchPolicy>,
        steps: Vec<PlanStep>,
    ) -> Result<EnqueueOutcome, TransferError> {
        if self.closed {
            return Err(TransferError::SessionClosed);
        }

        let session_id = self.shared.emitter.session_id().to_string();
        let mut outcome = EnqueueOutcome {
            batch_id: batch.id().to_string(),
            transfer_ids: Vec::new(),
            directories: Vec::new(),
        };

        for step in steps {
            match step {
                PlanStep::CreateDir { path } => {
                    outcome.directories.push(path.clone());
                    self.order.push(Slot::Dir {
                        seq: self.next_seq,
                        path,
                        direction,
                        running: false,
                    });
                    self.next_seq += 1;
                }
                PlanStep::File { source, dest, size } => {
                    let id = Uuid::new_v4().to_string();
                    let record = TransferRecord {
                        id: id.clone(),
                        session_id: session_id.clone(),
                        batch_id: Some(batch.id().to_string()),
                        direction,
                        source_path: source,
                        dest_path: dest,
                        status: TransferStatus::Queued,
                        progress_bytes: 0,
                        total_bytes: size,
                        speed_bps: 0,
                        error: None,
                    };
                    self.jobs.insert(
                        id.clone(),
                        Job {
                            record,
                            direction,
                            control: Arc::new(TransferControl::new()),
                            batch: batch.clone(),
                            resume_pending: false,
                        },
                    );
                    self.order.push(Slot::Transfer(id.clone()));
                    outcome.transfer_ids.push(id);
                }
            }
        }

        info!(
            "Queued {} transfer(s) and {} directory step(s) for {}",
            outcome.transfer_ids.len(),
            outcome.directories.len(),
            session_id
        );
        self.dispatch();
        self.emit_queue();
        Ok(outcome)
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut Job, TransferError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| TransferError::UnknownTransfer(id.to_string()))
    }

    fn pause(&mut self, id: &str) -> Result<(), TransferError> {
        let job = self.job_mut(id)?;
        if job.resume_pending {
            job.resume_pending = false;
            info!("Dropped pending resume of transfer {}", id);
            return Ok(());
        }
        if job.record.status != TransferStatus::Active {
            return Err(TransferError::InvalidState(format!(
                "cannot pause a {:?} transfer",
                job.record.status
            )));
        }
        job.record.status = TransferStatus::Paused;
        job.record.speed_bps = 0;
        job.control.pause();
        info!("Paused transfer {} at {} bytes", id, job.record.progress_bytes);

        self.dispatch();
        self.emit_queue();
        Ok(())
    }

    /// Resume now if a slot is free, otherwise once `dispatch` finds one
    fn resume(&mut self, id: &str) -> Result<(), TransferError> {
        let limit = self.shared.settings.concurrency.max(1);
        let has_slot = self.running() < limit;
        let job = self.job_mut(id)?;
        if job.record.status != TransferStatus::Paused {
            return Err(TransferError::InvalidState(format!(
                "cannot resume a {:?} transfer",
                job.record.status
            )));
        }
        if has_slot {
            job.resume_pending = false;
            job.record.status = TransferStatus::Active;
            job.control.resume();
            info!("Resumed transfer {} from {} bytes", id, job.record.progress_bytes);
        } else {
            job.resume_pending = true;
            debug!("Transfer {} waits for a free slot to resume", id);
        }

        self.emit_queue();
        Ok(())
    }

    fn cancel(&mut self, id: &str) -> Result<(), TransferError> {
        let job = self.job_mut(id)?;
        if !job.record.status.can_transition_to(TransferStatus::Cancelled) {
            return Err(TransferError::InvalidState(format!(
                "cannot cancel a {:?} transfer",
                job.record.status
            )));
        }
        job.record.status = TransferStatus::Cancelled;
        job.record.speed_bps = 0;
        job.control.cancel();
        info!("Cancelled transfer {}", id);

        self.dispatch();
        self.emit_queue();
        Ok(())
    }

    fn shutdown(&mut self) -> usize {
        self.closed = true;
        let mut failed = 0;
        for job in self.jobs.values_mut() {
            if job.record.status.is_terminal() {
                continue;
            }
            job.record.status = TransferStatus::Error;
            job.record.error = Some(TransferError::SessionClosed.to_string());
            job.record.speed_bps = 0;
            job.control.cancel();
            failed += 1;
        }
        self.order.retain(|slot| matches!(slot, Slot::Transfer(_)));

        info!(
            "Transfer queue for {} closed, {} transfer(s) failed",
            self.shared.emitter.session_id(),
            failed
        );
        self.emit_queue();
        failed
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Progress {
                id,
                progress_bytes,
                total_bytes,
                speed_bps,
            } => {
                let Some(job) = self.jobs.get_mut(&id) else {
                    return;
                };
                if job.record.status.is_terminal() {
                    return;
                }
                job.record.progress_bytes = job.record.progress_bytes.max(progress_bytes);
                job.record.total_bytes = total_bytes.max(job.record.progress_bytes);
                if job.record.status == TransferStatus::Active {
                    job.record.speed_bps = speed_bps;
                }
                self.shared.emitter.emit_transfer_progress(
                    &id,
                    job.record.progress_bytes,
                    job.record.total_bytes,
                    job.record.speed_bps,
                );
            }
            Report::Retarget { id, dest } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    debug!("Transfer {} renamed to {}", id, dest);
                    job.record.dest_path = dest;
                    self.emit_queue();
                }
            }
            Report::Finished { id, result } => {
                self.finish(&id, result);
                self.dispatch();
                self.emit_queue();
            }
            Report::DirFinished { seq, result } => {
                let mut path = None;
                self.order.retain(|slot| match slot {
                    Slot::Dir { seq: s, path: p, .. } if *s == seq => {
                        path = Some(p.clone());
                        false
                    }
                    _ => true,
                });
                if let (Err(e), Some(path)) = (result, path) {
                    // Children fail on their own when they try to write
                    warn!("Failed to create directory {}: {}", path, e);
                }
                self.dispatch();
            }
        }
    }

    fn finish(&mut self, id: &str, result: Result<Outcome, TransferError>) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        if job.record.status.is_terminal() {
            // Already cancelled or failed by shutdown
            debug!("Ignoring late result for transfer {}", id);
            return;
        }

        let next = match &result {
            Ok(Outcome::Completed(_)) => TransferStatus::Completed,
            Ok(Outcome::Skipped) => TransferStatus::Skipped,
            Err(TransferError::Cancelled) => TransferStatus::Cancelled,
            Err(_) => TransferStatus::Error,
        };
        if !job.record.status.can_transition_to(next) {
            warn!(
                "Transfer {} finished as {:?} from {:?}",
                id, next, job.record.status
            );
        }
        job.record.status = next;
        job.record.speed_bps = 0;

        match result {
            Ok(Outcome::Completed(bytes)) => {
                job.record.progress_bytes = bytes;
                job.record.total_bytes = job.record.total_bytes.max(bytes);
                info!(
                    "Transfer {} completed: {} -> {} ({} bytes)",
                    id, job.record.source_path, job.record.dest_path, bytes
                );
            }
            Ok(Outcome::Skipped) => {
                info!("Transfer {} skipped, {} exists", id, job.record.dest_path);
            }
            Err(e) => {
                warn!("Transfer {} failed: {}", id, e);
                job.record.error = Some(e.to_string());
            }
        }
    }

    fn running(&self) -> usize {
        let transfers = self
            .jobs
            .values()
            .filter(|job| job.record.status == TransferStatus::Active)
            .count();
        let dirs = self
            .order
            .iter()
            .filter(|slot| matches!(slot, Slot::Dir { running: true, .. }))
            .count();
        transfers + dirs
    }

    fn dispatch(&mut self) {
        if self.closed {
            return;
        }
        let limit = self.shared.settings.concurrency.max(1);
        let mut running = self.running();

        for slot in self.order.iter_mut() {
            if running >= limit {
                break;
            }
            match slot {
                Slot::Dir { running: true, .. } => break,
                Slot::Dir {
                    seq,
                    path,
                    direction,
                    running: started,
                } => {
                    *started = true;
                    spawn_create_dir(
                        self.shared.clone(),
                        self.reports.clone(),
                        *seq,
                        path.clone(),
                        *direction,
                    );
                    break;
                }
                Slot::Transfer(id) => {
                    let Some(job) = self.jobs.get_mut(id.as_str()) else {
                        continue;
                    };
                    match job.record.status {
                        TransferStatus::Paused if job.resume_pending => {
                            job.resume_pending = false;
                            job.record.status = TransferStatus::Active;
                            job.control.resume();
                            running += 1;
                            info!(
                                "Resumed transfer {} from {} bytes",
                                id, job.record.progress_bytes
                            );
                        }
                        TransferStatus::Queued => {
                            job.record.status = TransferStatus::Active;
                            running += 1;
                            debug!("Starting transfer {}", id);
                            spawn_transfer(self.shared.clone(), self.reports.clone(), job);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn records(&self) -> Vec<TransferRecord> {
        self.order
            .iter()
            .filter_map(|slot| match slot {
                Slot::Transfer(id) => self.jobs.get(id).map(|job| job.record.clone()),
                Slot::Dir { .. } => None,
            })
            .collect()
    }

    fn emit_queue(&self) {
        self.shared.emitter.emit_transfer_queue(self.records());
    }
}

fn spawn_create_dir(
    shared: Arc<Shared>,
    reports: mpsc::UnboundedSender<Report>,
    seq: u64,
    path: String,
    direction: TransferDirection,
) {
    tokio::spawn(async move {
        let result = match shared.dest_fs(direction).await {
            Ok(fs) => fs.create_dir(&path).await,
            Err(e) => Err(e),
        };
        let _ = reports.send(Report::DirFinished { seq, result });
    });
}

/// Everything a worker needs, detached from the actor's state
struct Worker {
    id: String,
    direction: TransferDirection,
    source: String,
    dest: String,
    control: Arc<TransferControl>,
    batch: Arc<BatchPolicy>,
    shared: Arc<Shared>,
    reports: mpsc::UnboundedSender<Report>,
}

fn spawn_transfer(shared: Arc<Shared>, reports: mpsc::UnboundedSender<Report>, job: &Job) {
    let worker = Worker {
        id: job.record.id.clone(),
        direction: job.direction,
        source: job.record.source_path.clone(),
        dest: job.record.dest_path.clone(),
        control: job.control.clone(),
        batch: job.batch.clone(),
        shared,
        reports,
    };
    tokio::spawn(async move {
        let result = worker.run().await;
        let _ = worker.reports.send(Report::Finished {
            id: worker.id.clone(),
            result,
        });
    });
}

impl Worker {
    async fn run(&self) -> Result<Outcome, TransferError> {
        let (source_fs, dest_fs) = self.shared.filesystems(self.direction).await?;

        let source_stat = source_fs
            .stat(&self.source)
            .await?
            .ok_or_else(|| TransferError::NotFound(self.source.clone()))?;
        if source_stat.is_dir {
            return Err(TransferError::InvalidState(format!(
                "{} is a directory",
                self.source
            )));
        }

        let mut dest = self.dest.clone();
        if let Some(existing) = dest_fs.stat(&dest).await? {
            let conflict = ConflictInfo {
                transfer_id: self.id.clone(),
                batch_id: self.batch.id().to_string(),
                source_path: self.source.clone(),
                dest_path: dest.clone(),
                source_size: source_stat.size,
                dest_size: existing.size,
            };
            let resolver = self.shared.resolver.read().clone();
            match self
                .batch
                .resolve(conflict, existing.is_dir, dest_fs.as_ref(), resolver.as_ref())
                .await?
            {
                Resolution::Skip => return Ok(Outcome::Skipped),
                Resolution::Write(path) => {
                    if path != dest {
                        let _ = self.reports.send(Report::Retarget {
                            id: self.id.clone(),
                            dest: path.clone(),
                        });
                        dest = path;
                    }
                }
            }
        }

        // Cancelled while waiting on a conflict prompt
        self.control.checkpoint().await?;

        let mut reader = source_fs.open_read(&self.source, 0).await?;
        let mut writer = dest_fs.open_write(&dest).await?;

        match self
            .pump(&mut reader, &mut writer, source_stat.size)
            .await
        {
            Ok(bytes) => Ok(Outcome::Completed(bytes)),
            Err(e) => {
                drop(writer);
                if e == TransferError::Cancelled
                    && self.shared.settings.cancel_policy == CancelPolicy::RemovePartial
                {
                    if let Err(rm) = dest_fs.remove_file(&dest).await {
                        warn!("Could not remove partial {}: {}", dest, rm);
                    } else {
                        debug!("Removed partial {}", dest);
                    }
                }
                Err(e)
            }
        }
    }

    async fn pump(
        &self,
        reader: &mut BoxedReader,
        writer: &mut BoxedWriter,
        total: u64,
    ) -> Result<u64, TransferError> {
        let settings = &self.shared.settings;
        let io_timeout = settings.io_timeout();
        let mut buffer = vec![0u8; settings.chunk_size.max(1)];
        let mut transferred = 0u64;
        let mut meter = SpeedMeter::new(settings.progress_interval());

        loop {
            if self.control.checkpoint().await? {
                // Time spent paused does not count towards speed
                meter.restart(transferred);
            }

            let read = tokio::select! {
                r = tokio::time::timeout(io_timeout, reader.read(&mut buffer)) => r,
                _ = self.control.cancelled() => return Err(TransferError::Cancelled),
            };
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(TransferError::from_io(e, &self.source)),
                Err(_) => {
                    return Err(TransferError::Timeout(format!(
                        "read stalled for {:?} at {} bytes",
                        io_timeout, transferred
                    )))
                }
            };
            if n == 0 {
                break;
            }

            match tokio::time::timeout(io_timeout, writer.write_all(&buffer[..n])).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TransferError::from_io(e, &self.dest)),
                Err(_) => {
                    return Err(TransferError::Timeout(format!(
                        "write stalled for {:?} at {} bytes",
                        io_timeout, transferred
                    )))
                }
            }
            transferred += n as u64;

            if let Some(speed) = meter.sample(transferred) {
                self.report_progress(transferred, total.max(transferred), speed);
            }
        }

        match tokio::time::timeout(io_timeout, async {
            writer.flush().await?;
            writer.shutdown().await
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransferError::from_io(e, &self.dest)),
            Err(_) => return Err(TransferError::Timeout("closing destination".to_string())),
        }

        self.report_progress(transferred, total.max(transferred), meter.speed());
        Ok(transferred)
    }

    fn report_progress(&self, progress_bytes: u64, total_bytes: u64, speed_bps: u64) {
        let _ = self.reports.send(Report::Progress {
            id: self.id.clone(),
            progress_bytes,
            total_bytes,
            speed_bps,
        });
    }
}

/// Exponentially smoothed throughput, sampled at most once per interval
struct SpeedMeter {
    interval: Duration,
    last_at: Instant,
    last_bytes: u64,
    speed: f64,
}

impl SpeedMeter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_at: Instant::now(),
            last_bytes: 0,
            speed: 0.0,
        }
    }

    fn restart(&mut self, bytes: u64) {
        self.last_at = Instant::now();
        self.last_bytes = bytes;
    }

    fn sample(&mut self, bytes: u64) -> Option<u64> {
        let elapsed = self.last_at.elapsed();
        if elapsed < self.interval {
            return None;
        }
        let secs = elapsed.as_secs_f64().max(1e-3);
        let instant = bytes.saturating_sub(self.last_bytes) as f64 / secs;
        self.speed = if self.speed == 0.0 {
            instant
        } else {
            SPEED_SMOOTHING * instant + (1.0 - SPEED_SMOOTHING) * self.speed
        };
        self.restart(bytes);
        Some(self.speed())
    }

    fn speed(&self) -> u64 {
        self.speed as u64
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::session::events::{event_channel, EngineEvent, EventStream};
    use crate::sftp::conflict::{ConflictAction, ConflictDecision};
    use crate::sftp::fs::LocalFs;
    use crate::test_utils::{LocalRemote, SlowFs};

    fn settings() -> TransferSettings {
        TransferSettings {
            progress_interval_ms: 0,
            ..Default::default()
        }
    }

    fn engine_with(
        settings: TransferSettings,
        local: Arc<dyn FileSystem>,
        remote: Arc<dyn FileSystem>,
    ) -> (TransferEngine, EventStream) {
        let (tx, rx) = event_channel();
        let engine = TransferEngine::spawn(
            settings,
            local,
            Arc::new(LocalRemote::new(remote)),
            EventEmitter::new(tx, "s1"),
        );
        (engine, rx)
    }

    fn engine(settings: TransferSettings) -> (TransferEngine, EventStream) {
        engine_with(settings, Arc::new(LocalFs), Arc::new(LocalFs))
    }

    fn path(dir: &Path, name: &str) -> String {
        dir.join(name).to_string_lossy().into_owned()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    async fn wait_until(
        engine: &TransferEngine,
        mut done: impl FnMut(&[TransferRecord]) -> bool,
    ) -> Vec<TransferRecord> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let records = engine.snapshot().await;
            if done(&records) {
                return records;
            }
            assert!(Instant::now() < deadline, "queue never settled: {:?}", records);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_all_terminal(engine: &TransferEngine) -> Vec<TransferRecord> {
        wait_until(engine, |r| r.iter().all(|t| t.status.is_terminal())).await
    }

    #[tokio::test]
    async fn test_single_file_upload() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let data = pattern(200_000, 7);
        std::fs::write(local.path().join("f.bin"), &data).unwrap();

        let (engine, mut events) = engine(settings());
        let outcome = engine
            .enqueue_upload(
                &path(local.path(), "f.bin"),
                &path(remote.path(), "f.bin"),
                ConflictPolicy::Overwrite,
            )
            .await
            .unwrap();
        assert_eq!(outcome.transfer_ids.len(), 1);
        assert!(outcome.directories.is_empty());

        let records = wait_all_terminal(&engine).await;
        assert_eq!(records[0].status, TransferStatus::Completed);
        assert_eq!(records[0].progress_bytes, data.len() as u64);
        assert_eq!(std::fs::read(remote.path().join("f.bin")).unwrap(), data);

        let mut last_progress = 0;
        let mut progress_events = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::TransferProgress { progress_bytes, .. } = event {
                assert!(progress_bytes >= last_progress);
                last_progress = progress_bytes;
                progress_events += 1;
            }
        }
        assert!(progress_events > 0);
        assert_eq!(last_progress, data.len() as u64);
    }

    #[tokio::test]
    async fn test_directory_upload_creates_dir_then_files() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let src = local.path().join("a");
        std::fs::create_dir(&src).unwrap();
        for i in 0..10u8 {
            std::fs::write(src.join(format!("file{}.txt", i)), pattern(1000 + i as usize * 37, i))
                .unwrap();
        }

        let (engine, _events) = engine(settings());
        let dest_root = path(remote.path(), "a");
        let outcome = engine
            .enqueue_upload(src.to_str().unwrap(), &dest_root, ConflictPolicy::Overwrite)
            .await
            .unwrap();

        assert_eq!(outcome.directories, vec![dest_root.clone()]);
        assert_eq!(outcome.transfer_ids.len(), 10);

        let records = wait_all_terminal(&engine).await;
        assert_eq!(records.len(), 10);
        for record in &records {
            assert_eq!(record.status, TransferStatus::Completed, "{:?}", record);
            assert_eq!(record.batch_id.as_deref(), Some(outcome.batch_id.as_str()));
        }
        for i in 0..10u8 {
            let name = format!("file{}.txt", i);
            assert_eq!(
                std::fs::read(remote.path().join("a").join(&name)).unwrap(),
                std::fs::read(src.join(&name)).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_download_direction() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        std::fs::write(remote.path().join("r.txt"), b"from the server").unwrap();

        let (engine, _events) = engine(settings());
        engine
            .enqueue_download(
                &path(remote.path(), "r.txt"),
                &path(local.path(), "r.txt"),
                ConflictPolicy::Overwrite,
            )
            .await
            .unwrap();

        let records = wait_all_terminal(&engine).await;
        assert_eq!(records[0].direction, TransferDirection::Download);
        assert_eq!(records[0].status, TransferStatus::Completed);
        assert_eq!(
            std::fs::read(local.path().join("r.txt")).unwrap(),
            b"from the server"
        );
    }

    #[tokio::test]
    async fn test_pause_resume_continues_from_offset() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let data = pattern(64 * 1024, 3);
        std::fs::write(local.path().join("big.bin"), &data).unwrap();

        let chunk = 1024;
        let (engine, mut events) = engine_with(
            TransferSettings {
                chunk_size: chunk,
                progress_interval_ms: 0,
                ..Default::default()
            },
            Arc::new(SlowFs::new(Duration::from_millis(2))),
            Arc::new(LocalFs),
        );
        let outcome = engine
            .enqueue_upload(
                &path(local.path(), "big.bin"),
                &path(remote.path(), "big.bin"),
                ConflictPolicy::Overwrite,
            )
            .await
            .unwrap();
        let id = outcome.transfer_ids[0].clone();

        wait_until(&engine, |r| r[0].progress_bytes >= 8 * chunk as u64).await;
        engine.pause(&id).await.unwrap();
        let paused_at = engine.get(&id).await.unwrap().progress_bytes;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let record = engine.get(&id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Paused);
        assert!(record.progress_bytes <= paused_at + chunk as u64);
        assert!(engine.pause(&id).await.is_err());

        let before_resume = record.progress_bytes;
        while events.try_recv().is_ok() {}
        engine.resume(&id).await.unwrap();

        let records = wait_all_terminal(&engine).await;
        assert_eq!(records[0].status, TransferStatus::Completed);
        assert_eq!(records[0].progress_bytes, data.len() as u64);
        assert_eq!(std::fs::read(remote.path().join("big.bin")).unwrap(), data);

        // No restart from zero after resume
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::TransferProgress { progress_bytes, .. } = event {
                assert!(progress_bytes >= before_resume);
            }
        }
        assert!(engine.resume(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_queue() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("gone.txt"), b"x").unwrap();
        std::fs::write(local.path().join("ok.txt"), b"fine").unwrap();

        let (engine, _events) = engine(settings());
        // Destination directory does not exist
        let bad = engine
            .enqueue_upload(
                &path(local.path(), "gone.txt"),
                &path(&remote.path().join("missing-dir"), "gone.txt"),
                ConflictPolicy::Overwrite,
            )
            .await
            .unwrap();
        let good = engine
            .enqueue_upload(
                &path(local.path(), "ok.txt"),
                &path(remote.path(), "ok.txt"),
                ConflictPolicy::Overwrite,
            )
            .await
            .unwrap();

        wait_all_terminal(&engine).await;
        let bad = engine.get(&bad.transfer_ids[0]).await.unwrap();
        assert_eq!(bad.status, TransferStatus::Error);
        assert!(bad.error.is_some());
        let good = engine.get(&good.transfer_ids[0]).await.unwrap();
        assert_eq!(good.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_source_rejected_at_enqueue() {
        let (engine, _events) = engine(settings());
        let err = engine
            .enqueue_upload("/no/such/file", "/tmp/x", ConflictPolicy::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_leaves_or_removes_partial() {
        for policy in [CancelPolicy::LeavePartial, CancelPolicy::RemovePartial] {
            let local = tempfile::tempdir().unwrap();
            let remote = tempfile::tempdir().unwrap();
            std::fs::write(local.path().join("big.bin"), pattern(64 * 1024, 1)).unwrap();

            let (engine, _events) = engine_with(
                TransferSettings {
                    chunk_size: 1024,
                    progress_interval_ms: 0,
                    cancel_policy: policy,
                    ..Default::default()
                },
                Arc::new(SlowFs::new(Duration::from_millis(2))),
                Arc::new(LocalFs),
            );
            let outcome = engine
                .enqueue_upload(
                    &path(local.path(), "big.bin"),
                    &path(remote.path(), "big.bin"),
                    ConflictPolicy::Overwrite,
                )
                .await
                .unwrap();
            let id = &outcome.transfer_ids[0];

            wait_until(&engine, |r| r[0].progress_bytes > 0).await;
            engine.cancel(id).await.unwrap();
            assert!(engine.cancel(id).await.is_err());

            let record = engine.get(id).await.unwrap();
            assert_eq!(record.status, TransferStatus::Cancelled);

            tokio::time::sleep(Duration::from_millis(50)).await;
            let exists = remote.path().join("big.bin").exists();
            match policy {
                CancelPolicy::LeavePartial => assert!(exists),
                CancelPolicy::RemovePartial => assert!(!exists),
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_unfinished_with_session_closed() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        for i in 0..3 {
            std::fs::write(local.path().join(format!("{}.bin", i)), pattern(64 * 1024, i)).unwrap();
        }

        let (engine, _events) = engine_with(
            TransferSettings {
                chunk_size: 1024,
                ..Default::default()
            },
            Arc::new(SlowFs::new(Duration::from_millis(5))),
            Arc::new(LocalFs),
        );
        for i in 0..3 {
            engine
                .enqueue_upload(
                    &path(local.path(), &format!("{}.bin", i)),
                    &path(remote.path(), &format!("{}.bin", i)),
                    ConflictPolicy::Overwrite,
                )
                .await
                .unwrap();
        }

        assert_eq!(engine.shutdown().await, 3);
        let records = engine.snapshot().await;
        assert_eq!(records.len(), 3);
        for record in records {
            assert_eq!(record.status, TransferStatus::Error);
            assert_eq!(record.error.as_deref(), Some("session closed"));
        }

        let err = engine
            .enqueue_upload(
                &path(local.path(), "0.bin"),
                &path(remote.path(), "again.bin"),
                ConflictPolicy::Overwrite,
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::SessionClosed);
        assert_eq!(engine.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        for i in 0..4 {
            std::fs::write(local.path().join(format!("{}.bin", i)), pattern(16 * 1024, i)).unwrap();
        }

        let (engine, _events) = engine_with(
            TransferSettings {
                chunk_size: 1024,
                concurrency: 2,
                ..Default::default()
            },
            Arc::new(SlowFs::new(Duration::from_millis(2))),
            Arc::new(LocalFs),
        );
        for i in 0..4 {
            engine
                .enqueue_upload(
                    &path(local.path(), &format!("{}.bin", i)),
                    &path(remote.path(), &format!("{}.bin", i)),
                    ConflictPolicy::Overwrite,
                )
                .await
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let records = engine.snapshot().await;
            let active = records
                .iter()
                .filter(|r| r.status == TransferStatus::Active)
                .count();
            assert!(active <= 2);
            if records.iter().all(|r| r.status == TransferStatus::Completed) {
                break;
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }

    #[tokio::test]
    async fn test_resume_waits_for_free_slot() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        for name in ["a.bin", "b.bin"] {
            std::fs::write(local.path().join(name), pattern(64 * 1024, 5)).unwrap();
        }

        let (engine, _events) = engine_with(
            TransferSettings {
                chunk_size: 1024,
                concurrency: 1,
                progress_interval_ms: 0,
                ..Default::default()
            },
            Arc::new(SlowFs::new(Duration::from_millis(2))),
            Arc::new(LocalFs),
        );
        let mut ids = Vec::new();
        for name in ["a.bin", "b.bin"] {
            let outcome = engine
                .enqueue_upload(
                    &path(local.path(), name),
                    &path(remote.path(), name),
                    ConflictPolicy::Overwrite,
                )
                .await
                .unwrap();
            ids.push(outcome.transfer_ids[0].clone());
        }
        let (a, b) = (&ids[0], &ids[1]);

        wait_until(&engine, |r| r[0].progress_bytes >= 4 * 1024).await;
        engine.pause(a).await.unwrap();
        wait_until(&engine, |r| r[1].status == TransferStatus::Active).await;

        engine.resume(a).await.unwrap();
        let records = engine.snapshot().await;
        let active = records
            .iter()
            .filter(|r| r.status == TransferStatus::Active)
            .count();
        assert_eq!(active, 1);
        assert_eq!(records[0].status, TransferStatus::Paused);

        // A picks up once B releases the slot
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let records = engine.snapshot().await;
            let active = records
                .iter()
                .filter(|r| r.status == TransferStatus::Active)
                .count();
            assert!(active <= 1, "{} transfers active", active);
            if records.iter().all(|r| r.status == TransferStatus::Completed) {
                break;
            }
            assert!(Instant::now() < deadline, "queue stuck: {:?}", records);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        for name in ["a.bin", "b.bin"] {
            assert_eq!(
                std::fs::read(remote.path().join(name)).unwrap(),
                pattern(64 * 1024, 5)
            );
        }
        assert!(engine.resume(b).await.is_err());
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConflictResolver for CountingResolver {
        async fn resolve(&self, _conflict: &ConflictInfo) -> ConflictDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ConflictDecision {
                action: ConflictAction::Rename,
                apply_to_all: true,
            }
        }
    }

    #[tokio::test]
    async fn test_ask_policy_prompts_once_for_batch() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let src = local.path().join("d");
        std::fs::create_dir(&src).unwrap();
        std::fs::create_dir(remote.path().join("d")).unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(src.join(name), b"new").unwrap();
            std::fs::write(remote.path().join("d").join(name), b"old").unwrap();
        }

        let (engine, _events) = engine(settings());
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        engine.set_conflict_resolver(Some(resolver.clone() as Arc<dyn ConflictResolver>));

        engine
            .enqueue_upload(src.to_str().unwrap(), &path(remote.path(), "d"), ConflictPolicy::Ask)
            .await
            .unwrap();
        let records = wait_all_terminal(&engine).await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        for record in records {
            assert_eq!(record.status, TransferStatus::Completed);
            assert!(record.dest_path.ends_with(" (1).txt"), "{}", record.dest_path);
        }
        assert_eq!(std::fs::read(remote.path().join("d/a.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(remote.path().join("d/a (1).txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_skip_policy_and_clear_finished() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("x.txt"), b"new").unwrap();
        std::fs::write(remote.path().join("x.txt"), b"old").unwrap();

        let (engine, _events) = engine(settings());
        engine
            .enqueue_upload(
                &path(local.path(), "x.txt"),
                &path(remote.path(), "x.txt"),
                ConflictPolicy::Skip,
            )
            .await
            .unwrap();

        let records = wait_all_terminal(&engine).await;
        assert_eq!(records[0].status, TransferStatus::Skipped);
        assert_eq!(std::fs::read(remote.path().join("x.txt")).unwrap(), b"old");

        assert_eq!(engine.clear_finished().await, 1);
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_transfer() {
        let (engine, _events) = engine(settings());
        assert!(matches!(
            engine.pause("nope").await,
            Err(TransferError::UnknownTransfer(_))
        ));
    }
}
