//! Transfer manager: a handle plus one scheduler task that owns every
//! record.
//!
//! Commands and worker updates arrive on channels. The scheduler drains
//! whatever is queued, applies it, then runs a single scheduling pass, so a
//! burst of completions or commands costs one pass. Concurrency is bounded
//! by a semaphore whose permits live in the records of running transfers and
//! are released only when the worker has actually stopped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use relaybox_protocol::{
    FileId, TransferDirection, TransferProgress, TransferState, UploadedFile,
};
use relaybox_transfer::{
    ThroughputMeter, TransferError, UploadCheckpoint, total_chunks, validate_uploaded_file,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::ChunkEngine;
use crate::error::SessionError;
use crate::types::{
    ManagerConfig, TransferEvent, TransferFailure, TransferId, TransferOutput, TransferRecord,
};
use crate::worker::{self, Update, WorkOrder};

const COMMAND_CAPACITY: usize = 64;
const UPDATE_CAPACITY: usize = 256;

/// Handle to the scheduler task.
///
/// Must be created inside a Tokio runtime. Dropping the handle shuts the
/// scheduler down and cancels every running transfer.
pub struct TransferManager {
    commands: mpsc::Sender<Command>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    shutdown: CancellationToken,
}

impl TransferManager {
    pub fn new(engine: Arc<dyn ChunkEngine>, config: ManagerConfig) -> Self {
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CAPACITY);
        let shutdown = CancellationToken::new();

        let scheduler = Scheduler {
            slots_available: Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1))),
            config,
            engine,
            records: HashMap::new(),
            queue: VecDeque::new(),
            draining: HashMap::new(),
            next_id: 1,
            events: events_tx,
            updates: updates_tx,
        };
        tokio::spawn(scheduler.run(commands_rx, updates_rx, shutdown.clone()));

        Self {
            commands,
            events_rx: Some(events_rx),
            shutdown,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Queues an upload of `data`. The file id is minted here and kept for
    /// every later resume or retry.
    pub async fn enqueue_upload(
        &self,
        name: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<TransferId, SessionError> {
        let (name, data) = (name.into(), data.into());
        self.request(|reply| Command::Enqueue {
            name,
            job: NewJob::Upload(data),
            reply,
        })
        .await?
    }

    /// Queues a download of a previously uploaded file.
    pub async fn enqueue_download(
        &self,
        name: impl Into<String>,
        file: UploadedFile,
    ) -> Result<TransferId, SessionError> {
        let name = name.into();
        self.request(|reply| Command::Enqueue {
            name,
            job: NewJob::Download(file),
            reply,
        })
        .await?
    }

    /// Stops an active transfer, keeping completed chunks for resume.
    pub async fn pause(&self, id: TransferId) -> Result<(), SessionError> {
        self.control(id, Action::Pause).await
    }

    /// Re-queues a paused transfer under a fresh cancellation token.
    pub async fn resume(&self, id: TransferId) -> Result<(), SessionError> {
        self.control(id, Action::Resume).await
    }

    /// Cancels a pending, active or paused transfer. Cancelling twice is a
    /// no-op.
    pub async fn cancel(&self, id: TransferId) -> Result<(), SessionError> {
        self.control(id, Action::Cancel).await
    }

    /// Re-queues a failed transfer, continuing from its last committed
    /// chunk.
    pub async fn retry(&self, id: TransferId) -> Result<(), SessionError> {
        self.control(id, Action::Retry).await
    }

    /// Forgets a transfer, stopping it first if it is running.
    pub async fn remove(&self, id: TransferId) -> Result<(), SessionError> {
        self.control(id, Action::Remove).await
    }

    pub async fn get(&self, id: TransferId) -> Result<TransferRecord, SessionError> {
        self.request(|reply| Command::Get { id, reply })
            .await?
            .ok_or(SessionError::NotFound(id))
    }

    /// All records, oldest first.
    pub async fn list(&self) -> Result<Vec<TransferRecord>, SessionError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Output of a completed transfer.
    pub async fn output(&self, id: TransferId) -> Result<TransferOutput, SessionError> {
        self.request(|reply| Command::Output { id, reply }).await?
    }

    /// Watches a record; the receiver sees every snapshot change.
    pub async fn subscribe(
        &self,
        id: TransferId,
    ) -> Result<watch::Receiver<TransferRecord>, SessionError> {
        self.request(|reply| Command::Subscribe { id, reply }).await?
    }

    /// Waits until the transfer is no longer pending or active.
    pub async fn wait_settled(&self, id: TransferId) -> Result<TransferRecord, SessionError> {
        let mut rx = self.subscribe(id).await?;
        let record = rx
            .wait_for(|r| r.state.is_settled())
            .await
            .map_err(|_| SessionError::NotFound(id))?;
        Ok(record.clone())
    }

    /// Stops the scheduler and cancels every running transfer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn control(&self, id: TransferId, action: Action) -> Result<(), SessionError> {
        self.request(|reply| Command::Control { id, action, reply })
            .await?
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

enum Command {
    Enqueue {
        name: String,
        job: NewJob,
        reply: oneshot::Sender<Result<TransferId, SessionError>>,
    },
    Control {
        id: TransferId,
        action: Action,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Get {
        id: TransferId,
        reply: oneshot::Sender<Option<TransferRecord>>,
    },
    List {
        reply: oneshot::Sender<Vec<TransferRecord>>,
    },
    Output {
        id: TransferId,
        reply: oneshot::Sender<Result<TransferOutput, SessionError>>,
    },
    Subscribe {
        id: TransferId,
        reply: oneshot::Sender<Result<watch::Receiver<TransferRecord>, SessionError>>,
    },
}

enum NewJob {
    Upload(Arc<[u8]>),
    Download(UploadedFile),
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Pause,
    Resume,
    Cancel,
    Retry,
    Remove,
}

impl Action {
    fn verb(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
            Self::Remove => "remove",
        }
    }
}

enum Job {
    Upload {
        data: Arc<[u8]>,
        chunk_size: usize,
        checkpoint: UploadCheckpoint,
        output: Option<UploadedFile>,
    },
    Download {
        file: Arc<UploadedFile>,
        received: Vec<Vec<u8>>,
        output: Option<Arc<[u8]>>,
    },
}

impl Job {
    fn next_index(&self) -> u32 {
        match self {
            Self::Upload { checkpoint, .. } => checkpoint.next_index(),
            Self::Download { received, .. } => received.len() as u32,
        }
    }
}

struct Slot {
    record: TransferRecord,
    job: Job,
    cancel: CancellationToken,
    /// Held while a worker runs, including one winding down after a pause
    /// or cancel.
    permit: Option<OwnedSemaphorePermit>,
    meter: ThroughputMeter,
    watch: watch::Sender<TransferRecord>,
}

impl Slot {
    fn is_running(&self) -> bool {
        self.permit.is_some()
    }

    fn set_state(&mut self, state: TransferState) {
        self.record.state = state;
        self.publish();
    }

    fn refresh_progress(&mut self) -> TransferProgress {
        self.record.progress = self.meter.snapshot();
        self.publish();
        self.record.progress.clone()
    }

    fn publish(&mut self) {
        self.record.updated_at = Utc::now();
        self.watch.send_replace(self.record.clone());
    }
}

struct Scheduler {
    config: ManagerConfig,
    engine: Arc<dyn ChunkEngine>,
    slots_available: Arc<Semaphore>,
    records: HashMap<TransferId, Slot>,
    /// Pending transfers in FIFO order. Entries whose record is gone or no
    /// longer pending are dropped lazily.
    queue: VecDeque<TransferId>,
    /// Permits of removed transfers whose workers have not stopped yet.
    draining: HashMap<TransferId, OwnedSemaphorePermit>,
    next_id: u64,
    events: mpsc::Sender<TransferEvent>,
    updates: mpsc::Sender<Update>,
}

impl Scheduler {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut updates: mpsc::Receiver<Update>,
        shutdown: CancellationToken,
    ) {
        debug!(
            max_concurrent = self.config.max_concurrent_transfers,
            "transfer scheduler started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(update) = updates.recv() => {
                    self.apply_update(update);
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
            while let Ok(update) = updates.try_recv() {
                self.apply_update(update);
            }
            while let Ok(command) = commands.try_recv() {
                self.handle(command);
            }
            self.schedule();
        }

        for slot in self.records.values() {
            slot.cancel.cancel();
        }
        debug!("transfer scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { name, job, reply } => {
                let _ = reply.send(self.enqueue(name, job));
            }
            Command::Control { id, action, reply } => {
                let _ = reply.send(self.control(id, action));
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.records.get(&id).map(|s| s.record.clone()));
            }
            Command::List { reply } => {
                let mut all: Vec<TransferRecord> =
                    self.records.values().map(|s| s.record.clone()).collect();
                all.sort_by_key(|r| r.id);
                let _ = reply.send(all);
            }
            Command::Output { id, reply } => {
                let _ = reply.send(self.output(id));
            }
            Command::Subscribe { id, reply } => {
                let rx = self
                    .records
                    .get(&id)
                    .map(|s| s.watch.subscribe())
                    .ok_or(SessionError::NotFound(id));
                let _ = reply.send(rx);
            }
        }
    }

    fn enqueue(&mut self, name: String, job: NewJob) -> Result<TransferId, SessionError> {
        let id = TransferId(self.next_id);

        let (direction, file_id, total_bytes, chunks, job) = match job {
            NewJob::Upload(data) => {
                let chunk_size = self.engine.chunk_size();
                if data.is_empty() {
                    return Err(SessionError::InvalidInput("file is empty".into()));
                }
                if chunk_size == 0 {
                    return Err(SessionError::InvalidInput("chunk size is zero".into()));
                }
                let chunks = total_chunks(data.len(), chunk_size);
                let file_id = FileId::generate();
                let checkpoint =
                    UploadCheckpoint::new(file_id.clone(), name.as_str(), data.len() as u64, chunks);
                let total = data.len() as u64;
                let job = Job::Upload {
                    data,
                    chunk_size,
                    checkpoint,
                    output: None,
                };
                (TransferDirection::Upload, file_id, total, chunks, job)
            }
            NewJob::Download(mut file) => {
                let ordered: Vec<_> =
                    validate_uploaded_file(&file)
                        .map_err(|e| SessionError::InvalidInput(e.to_string()))?
                        .into_iter()
                        .cloned()
                        .collect();
                file.chunks = ordered;
                let (file_id, total, chunks) = (file.file_id.clone(), file.size, file.total_chunks);
                let job = Job::Download {
                    file: Arc::new(file),
                    received: Vec::with_capacity(chunks as usize),
                    output: None,
                };
                (TransferDirection::Download, file_id, total, chunks, job)
            }
        };

        self.next_id += 1;
        let meter = ThroughputMeter::new(total_bytes, chunks);
        let now = Utc::now();
        let record = TransferRecord {
            id,
            name,
            direction,
            state: TransferState::Pending,
            file_id,
            progress: meter.snapshot(),
            retry_count: 0,
            failure: None,
            created_at: now,
            updated_at: now,
        };
        let (watch, _) = watch::channel(record.clone());
        info!(
            transfer = %id,
            name = %record.name,
            direction = ?direction,
            bytes = total_bytes,
            chunks,
            "transfer queued"
        );
        self.records.insert(
            id,
            Slot {
                record,
                job,
                cancel: CancellationToken::new(),
                permit: None,
                meter,
                watch,
            },
        );
        self.queue.push_back(id);
        self.emit_state(id);
        Ok(id)
    }

    fn control(&mut self, id: TransferId, action: Action) -> Result<(), SessionError> {
        let slot = self
            .records
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;
        let state = slot.record.state;
        let invalid = SessionError::InvalidTransition {
            id,
            state,
            action: action.verb(),
        };

        match action {
            Action::Pause => {
                if state != TransferState::Active {
                    return Err(invalid);
                }
                slot.cancel.cancel();
                slot.meter.stop();
                slot.set_state(TransferState::Paused);
                info!(transfer = %id, next_chunk = slot.job.next_index(), "transfer paused");
            }
            Action::Resume => {
                if state != TransferState::Paused {
                    return Err(invalid);
                }
                slot.cancel = CancellationToken::new();
                slot.set_state(TransferState::Pending);
                self.queue.push_back(id);
                info!(transfer = %id, "transfer resumed");
            }
            Action::Cancel => match state {
                TransferState::Cancelled => return Ok(()),
                TransferState::Pending | TransferState::Active | TransferState::Paused => {
                    slot.cancel.cancel();
                    slot.meter.stop();
                    slot.set_state(TransferState::Cancelled);
                    info!(transfer = %id, from = %state, "transfer cancelled");
                }
                _ => return Err(invalid),
            },
            Action::Retry => {
                if state != TransferState::Error {
                    return Err(invalid);
                }
                slot.record.retry_count += 1;
                slot.record.failure = None;
                slot.cancel = CancellationToken::new();
                slot.set_state(TransferState::Pending);
                self.queue.push_back(id);
                info!(
                    transfer = %id,
                    retry = slot.record.retry_count,
                    from_chunk = slot.job.next_index(),
                    "transfer retried"
                );
            }
            Action::Remove => {
                if let Some(mut slot) = self.records.remove(&id) {
                    slot.cancel.cancel();
                    if let Some(permit) = slot.permit.take() {
                        self.draining.insert(id, permit);
                    }
                }
                info!(transfer = %id, "transfer removed");
                self.emit(TransferEvent::Removed { id });
                return Ok(());
            }
        }

        self.emit_state(id);
        Ok(())
    }

    fn output(&self, id: TransferId) -> Result<TransferOutput, SessionError> {
        let slot = self.records.get(&id).ok_or(SessionError::NotFound(id))?;
        let not_ready = SessionError::InvalidTransition {
            id,
            state: slot.record.state,
            action: "read output of",
        };
        match &slot.job {
            Job::Upload {
                output: Some(file), ..
            } => Ok(TransferOutput::Uploaded(file.clone())),
            Job::Download {
                output: Some(bytes),
                ..
            } => Ok(TransferOutput::Downloaded(Arc::clone(bytes))),
            _ => Err(not_ready),
        }
    }

    /// Promotes pending transfers in FIFO order while permits last.
    fn schedule(&mut self) {
        let mut i = 0;
        while i < self.queue.len() {
            let id = self.queue[i];
            match self.records.get(&id) {
                Some(slot) if slot.record.state == TransferState::Pending => {
                    // Resumed before its previous worker stopped.
                    if slot.is_running() {
                        i += 1;
                        continue;
                    }
                }
                _ => {
                    self.queue.remove(i);
                    continue;
                }
            }

            let Ok(permit) = Arc::clone(&self.slots_available).try_acquire_owned() else {
                break;
            };
            self.queue.remove(i);
            self.start(id, permit);
        }
    }

    fn start(&mut self, id: TransferId, permit: OwnedSemaphorePermit) {
        let Some(slot) = self.records.get_mut(&id) else {
            return;
        };
        let order = match &slot.job {
            Job::Upload {
                data,
                chunk_size,
                checkpoint,
                ..
            } => WorkOrder::Upload {
                data: Arc::clone(data),
                file_id: checkpoint.file_id().clone(),
                filename: checkpoint.filename().to_string(),
                chunk_size: *chunk_size,
                start: checkpoint.next_index(),
            },
            Job::Download { file, received, .. } => WorkOrder::Download {
                file: Arc::clone(file),
                start: received.len() as u32,
            },
        };
        let start = slot.job.next_index();

        slot.permit = Some(permit);
        slot.meter.start();
        slot.set_state(TransferState::Active);
        info!(transfer = %id, start_chunk = start, "transfer started");

        worker::spawn(
            id,
            order,
            Arc::clone(&self.engine),
            slot.cancel.clone(),
            self.updates.clone(),
        );
        self.emit_state(id);
    }

    fn apply_update(&mut self, update: Update) {
        match update {
            Update::Uploaded { id, descriptor } => {
                let Some(slot) = self.records.get_mut(&id) else {
                    return;
                };
                let Job::Upload { checkpoint, .. } = &mut slot.job else {
                    return;
                };
                let chunk_index = descriptor.chunk_index;
                let bytes = descriptor.plain_size;
                if let Err(e) = checkpoint.record(descriptor) {
                    warn!(transfer = %id, error = %e, "discarding out-of-order chunk");
                    return;
                }
                slot.meter.record_chunk(bytes);
                let progress = slot.refresh_progress();
                debug!(transfer = %id, chunk = chunk_index, "chunk uploaded");
                self.emit(TransferEvent::Progress {
                    id,
                    chunk_index,
                    progress,
                });
            }
            Update::Downloaded {
                id,
                chunk_index,
                data,
            } => {
                let Some(slot) = self.records.get_mut(&id) else {
                    return;
                };
                let Job::Download { received, .. } = &mut slot.job else {
                    return;
                };
                if chunk_index as usize != received.len() {
                    warn!(transfer = %id, chunk = chunk_index, "discarding out-of-order chunk");
                    return;
                }
                let bytes = data.len() as u64;
                received.push(data);
                slot.meter.record_chunk(bytes);
                let progress = slot.refresh_progress();
                debug!(transfer = %id, chunk = chunk_index, "chunk downloaded");
                self.emit(TransferEvent::Progress {
                    id,
                    chunk_index,
                    progress,
                });
            }
            Update::Finished { id, outcome } => self.finish(id, outcome),
        }
    }

    fn finish(&mut self, id: TransferId, outcome: Result<(), TransferError>) {
        let Some(slot) = self.records.get_mut(&id) else {
            // Removed while running; its slot frees now.
            self.draining.remove(&id);
            return;
        };
        slot.permit = None;
        slot.meter.stop();

        match (slot.record.state, outcome) {
            // A pause that lost the race against the last chunk still
            // finishes the transfer.
            (TransferState::Active | TransferState::Paused | TransferState::Pending, Ok(())) => {
                match complete(&mut slot.job) {
                    Ok(()) => {
                        slot.record.progress = slot.meter.snapshot();
                        slot.set_state(TransferState::Completed);
                        info!(
                            transfer = %id,
                            bytes = slot.record.progress.bytes_transferred,
                            elapsed_ms = slot.record.progress.elapsed_ms,
                            "transfer completed"
                        );
                    }
                    Err(e) => self.fail(id, e),
                }
            }
            (TransferState::Active, Err(e)) if e.is_cancelled() => {
                slot.set_state(TransferState::Cancelled);
            }
            (TransferState::Active, Err(e)) => self.fail(id, e),
            (state, Err(e)) => {
                debug!(transfer = %id, state = %state, error = %e, "worker stopped");
                return;
            }
            (_, Ok(())) => return,
        }
        self.emit_state(id);
    }

    fn fail(&mut self, id: TransferId, err: TransferError) {
        let Some(slot) = self.records.get_mut(&id) else {
            return;
        };
        let mut failure = TransferFailure::from_error(&err);

        if self.config.auto_retry && !failure.requires_manual_intervention() {
            if slot.record.retry_count < self.config.retry_ceiling {
                slot.record.retry_count += 1;
                slot.cancel = CancellationToken::new();
                slot.set_state(TransferState::Pending);
                self.queue.push_back(id);
                warn!(
                    transfer = %id,
                    retry = slot.record.retry_count,
                    ceiling = self.config.retry_ceiling,
                    error = %err,
                    "transient failure, re-queued"
                );
                return;
            }
            failure.retries_exhausted = true;
        }

        error!(
            transfer = %id,
            kind = ?failure.kind,
            retries = slot.record.retry_count,
            error = %failure,
            "transfer failed"
        );
        slot.record.failure = Some(failure);
        slot.set_state(TransferState::Error);
    }

    fn emit_state(&self, id: TransferId) {
        if let Some(slot) = self.records.get(&id) {
            self.emit(TransferEvent::StateChanged {
                id,
                state: slot.record.state,
                failure: slot.record.failure.clone(),
            });
        }
    }

    fn emit(&self, event: TransferEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(event) {
            debug!("event channel full, dropping event");
        }
    }
}

/// Builds the output of a transfer whose worker reported success.
fn complete(job: &mut Job) -> Result<(), TransferError> {
    match job {
        Job::Upload {
            checkpoint, output, ..
        } => {
            *output = Some(checkpoint.clone().into_uploaded_file()?);
        }
        Job::Download {
            file,
            received,
            output,
        } => {
            if received.len() as u32 != file.total_chunks {
                return Err(TransferError::InvalidDescriptors(format!(
                    "received {} of {} chunks",
                    received.len(),
                    file.total_chunks
                )));
            }
            let bytes: Vec<u8> = received.concat();
            if bytes.len() as u64 != file.size {
                return Err(TransferError::LengthMismatch {
                    expected: file.size,
                    actual: bytes.len() as u64,
                });
            }
            received.clear();
            *output = Some(bytes.into());
        }
    }
    Ok(())
}
