//! Supervisor for raw media processes.
//!
//! Each supervised process is started for one video, exports its process ID
//! as `VPAIR_PROCESS_ID`, and reports through the tool line protocol on
//! stdout or stderr. The live `ProcessingJob` is kept in a registry until
//! the process ends; the outcome is then written back to the video record
//! through the ledger.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use vpair_media::{decode_stream, join_reader, MediaError, TaggedMessage, ToolCommand, ToolMessage, OUTPUT_GRACE};
use vpair_models::{JobStatus, ModelError, ProcessId, ProcessingJob, VideoId, VideoStatus};

use crate::error::{WorkerError, WorkerResult};
use crate::ledger::StateLedger;
use crate::logging::JobLogger;
use crate::recovery::reset_processing;

/// Environment variable carrying the process ID to the child.
pub const PROCESS_ID_ENV: &str = "VPAIR_PROCESS_ID";

/// Error recorded on videos whose process was killed.
pub const KILLED_MESSAGE: &str = "Process was killed";

const NO_COMPLETION_MESSAGE: &str = "process exited without reporting completion";
const NO_OUTPUT_MESSAGE: &str = "process completed without reporting an output";

/// Finished outcomes kept for late `wait` calls.
const DEFAULT_OUTCOME_HISTORY: usize = 64;

struct Tracked {
    job: ProcessingJob,
    kill: Option<oneshot::Sender<()>>,
}

type Registry = Arc<RwLock<HashMap<ProcessId, Tracked>>>;

/// Final job records by process. Only the most recent finished ones are kept.
struct OutcomeLog {
    receivers: HashMap<ProcessId, watch::Receiver<Option<ProcessingJob>>>,
    finished: VecDeque<ProcessId>,
    history: usize,
}

impl OutcomeLog {
    fn new(history: usize) -> Self {
        Self {
            receivers: HashMap::new(),
            finished: VecDeque::new(),
            history,
        }
    }

    fn finish(&mut self, process_id: ProcessId) {
        self.finished.push_back(process_id);
        while self.finished.len() > self.history {
            if let Some(expired) = self.finished.pop_front() {
                self.receivers.remove(&expired);
            }
        }
    }
}

/// How a supervised process ended.
enum Exit {
    Killed,
    Exited(ExitStatus),
    WaitFailed(String),
}

/// Tracks raw subprocesses and reflects their outcome into the video records.
pub struct ProcessSupervisor {
    ledger: Arc<StateLedger>,
    jobs: Registry,
    outcomes: Arc<Mutex<OutcomeLog>>,
}

impl ProcessSupervisor {
    pub fn new(ledger: Arc<StateLedger>) -> Self {
        Self {
            ledger,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            outcomes: Arc::new(Mutex::new(OutcomeLog::new(DEFAULT_OUTCOME_HISTORY))),
        }
    }

    /// Keep the outcomes of at most `history` finished processes.
    pub fn with_outcome_history(self, history: usize) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(OutcomeLog::new(history))),
            ..self
        }
    }

    /// Start `program` for `video_id` and return the new process ID.
    ///
    /// Fails with `AlreadyProcessing` when the video already has a job in
    /// flight. The video is running once this returns.
    pub async fn start(
        &self,
        video_id: &VideoId,
        program: impl AsRef<Path>,
        args: &[String],
    ) -> WorkerResult<ProcessId> {
        let process_id = ProcessId::new();
        let started_at = Utc::now();

        self.ledger
            .try_update(|state| {
                let video = state
                    .video_mut(video_id)
                    .ok_or_else(|| ModelError::video_not_found(video_id.as_str()))?;
                if video.status == VideoStatus::Processing {
                    return Err(WorkerError::AlreadyProcessing(video_id.to_string()));
                }
                video.queue()?;
                video.begin(started_at)?;
                Ok(())
            })
            .await?;

        let cmd = ToolCommand::new(program)
            .args(args.iter().cloned())
            .env(PROCESS_ID_ENV, process_id.as_str());
        let mut child = match cmd.to_command().and_then(|mut c| c.spawn().map_err(MediaError::from)) {
            Ok(child) => child,
            Err(e) => {
                let message = e.to_string();
                error!(video_id = %video_id, "Failed to spawn {}: {}", cmd.tool_name(), message);
                self.write_failure(video_id, &message).await;
                return Err(e.into());
            }
        };

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let readers = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => {
                let stdout_tx = msg_tx.clone();
                let stdout = tokio::spawn(async move {
                    decode_stream(stdout, |m| {
                        let _ = stdout_tx.send(m);
                    })
                    .await
                });
                let stderr = tokio::spawn(async move {
                    decode_stream(stderr, |m| {
                        let _ = msg_tx.send(m);
                    })
                    .await
                });
                (stdout, stderr)
            }
            _ => {
                let _ = child.kill().await;
                self.write_failure(video_id, "process output not captured").await;
                return Err(WorkerError::internal("process output not captured"));
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        self.jobs.write().await.insert(
            process_id.clone(),
            Tracked {
                job: ProcessingJob {
                    started_at,
                    ..ProcessingJob::new(process_id.clone(), video_id.clone())
                },
                kill: Some(kill_tx),
            },
        );

        let logger = JobLogger::for_process(&process_id, video_id);
        logger.log_start(&format!("{} for {}", cmd.tool_name(), video_id));
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let monitor = Monitor {
            process_id: process_id.clone(),
            video_id: video_id.clone(),
            jobs: Arc::clone(&self.jobs),
            ledger: Arc::clone(&self.ledger),
            logger: logger.clone(),
        };
        self.outcomes
            .lock()
            .await
            .receivers
            .insert(process_id.clone(), outcome_rx);
        let outcomes = Arc::clone(&self.outcomes);
        let finished_id = process_id.clone();
        tokio::spawn(
            async move {
                let job = monitor.run(child, msg_rx, readers, kill_rx).await;
                let _ = outcome_tx.send(Some(job));
                outcomes.lock().await.finish(finished_id);
            }
            .instrument(logger.create_span()),
        );

        Ok(process_id)
    }

    /// Kill a tracked process and wait for its video to be reset.
    pub async fn kill(&self, process_id: &ProcessId) -> WorkerResult<ProcessingJob> {
        let signal = {
            let mut jobs = self.jobs.write().await;
            let tracked = jobs
                .get_mut(process_id)
                .ok_or_else(|| WorkerError::process_not_found(process_id.as_str()))?;
            tracked.kill.take()
        };
        if let Some(signal) = signal {
            let _ = signal.send(());
        }
        self.wait(process_id)
            .await
            .ok_or_else(|| WorkerError::process_not_found(process_id.as_str()))
    }

    /// Wait for a process to end and return its final job record.
    ///
    /// Returns `None` for unknown IDs and for processes that finished too
    /// long ago to still be remembered. Safe to cancel and to call repeatedly.
    pub async fn wait(&self, process_id: &ProcessId) -> Option<ProcessingJob> {
        let outcome = self.outcomes.lock().await.receivers.get(process_id).cloned()?;
        wait_outcome(outcome).await
    }

    /// Kill every tracked process, then reset every `processing` video to idle.
    ///
    /// Returns the IDs of videos that were still `processing` after the kills.
    pub async fn reset_all(&self) -> WorkerResult<Vec<VideoId>> {
        let signals: Vec<oneshot::Sender<()>> = self
            .jobs
            .write()
            .await
            .values_mut()
            .filter_map(|tracked| tracked.kill.take())
            .collect();
        if !signals.is_empty() {
            info!(count = signals.len(), "Killing supervised processes");
        }
        for signal in signals {
            let _ = signal.send(());
        }

        let outcomes: Vec<_> = {
            let mut log = self.outcomes.lock().await;
            log.finished.clear();
            log.receivers.drain().map(|(_, rx)| rx).collect()
        };
        for outcome in outcomes {
            wait_outcome(outcome).await;
        }

        let reset = self.ledger.update(|state| reset_processing(state, None)).await?;
        if !reset.is_empty() {
            warn!(count = reset.len(), "Reset videos left in processing");
        }
        Ok(reset)
    }

    /// Snapshots of all live jobs.
    pub async fn jobs(&self) -> Vec<ProcessingJob> {
        self.jobs.read().await.values().map(|t| t.job.clone()).collect()
    }

    pub async fn job(&self, process_id: &ProcessId) -> Option<ProcessingJob> {
        self.jobs.read().await.get(process_id).map(|t| t.job.clone())
    }

    async fn write_failure(&self, video_id: &VideoId, message: &str) {
        let result = self
            .ledger
            .update(|state| {
                if let Some(video) = state.video_mut(video_id) {
                    let _ = video.fail(message);
                }
            })
            .await;
        if let Err(e) = result {
            error!(video_id = %video_id, "Failed to record process failure: {}", e);
        }
    }
}

async fn wait_outcome(mut outcome: watch::Receiver<Option<ProcessingJob>>) -> Option<ProcessingJob> {
    match outcome.wait_for(Option::is_some).await {
        Ok(job) => (*job).clone(),
        Err(_) => {
            error!("Process monitor terminated abnormally");
            None
        }
    }
}

/// Watches one child process until it ends.
struct Monitor {
    process_id: ProcessId,
    video_id: VideoId,
    jobs: Registry,
    ledger: Arc<StateLedger>,
    logger: JobLogger,
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        mut messages: mpsc::UnboundedReceiver<TaggedMessage>,
        readers: (JoinHandle<String>, JoinHandle<String>),
        mut kill_rx: oneshot::Receiver<()>,
    ) -> ProcessingJob {
        let exit = loop {
            tokio::select! {
                Some(message) = messages.recv() => self.handle(message).await,
                status = child.wait() => break match status {
                    Ok(status) => Exit::Exited(status),
                    Err(e) => Exit::WaitFailed(e.to_string()),
                },
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(process_id = %self.process_id, "Failed to kill process: {}", e);
                    }
                    break Exit::Killed;
                }
            }
        };

        let (stdout, stderr) = readers;
        let stderr_tail = match exit {
            Exit::Killed => {
                // Orphaned grandchildren may keep the pipes open
                stdout.abort();
                stderr.abort();
                String::new()
            }
            _ => {
                let deadline = Instant::now() + OUTPUT_GRACE;
                let (_, tail) = tokio::join!(join_reader(stdout, deadline), join_reader(stderr, deadline));
                tail
            }
        };
        while let Ok(message) = messages.try_recv() {
            self.handle(message).await;
        }

        let mut job = match self.jobs.write().await.remove(&self.process_id) {
            Some(tracked) => tracked.job,
            None => ProcessingJob::new(self.process_id.clone(), self.video_id.clone()),
        };
        let outcome = resolve(&mut job, exit, &stderr_tail);
        self.write_back(&job, &outcome).await;
        metrics::counter!("vpair_supervised_processes_total", "outcome" => outcome.label()).increment(1);
        job
    }

    async fn handle(&self, message: TaggedMessage) {
        if !message.is_for(self.process_id.as_str()) {
            debug!(process_id = %self.process_id, "Ignoring message for another process");
            return;
        }
        let mut jobs = self.jobs.write().await;
        let Some(tracked) = jobs.get_mut(&self.process_id) else {
            return;
        };
        match message.message {
            ToolMessage::Progress { stage, percent } => {
                debug!(stage = %stage, percent, "Process progress");
                tracked.job.set_progress(stage, percent);
            }
            ToolMessage::Error { message } => {
                self.logger.log_warning(&message);
                tracked.job.fail(message);
            }
            ToolMessage::Complete { output } => {
                tracked.job.complete(output.map(PathBuf::from));
            }
        }
    }

    async fn write_back(&self, job: &ProcessingJob, outcome: &Outcome) {
        let elapsed_ms = (Utc::now() - job.started_at).num_milliseconds().max(0) as u64;
        let result = self
            .ledger
            .update(|state| {
                let Some(video) = state.video_mut(&self.video_id) else {
                    return Ok(());
                };
                match outcome {
                    Outcome::Processed(output) => video.complete(output.clone(), elapsed_ms),
                    Outcome::Failed(message) => video.fail(message.as_str()),
                    Outcome::Killed => {
                        video.reset(Some(KILLED_MESSAGE.to_string()));
                        Ok(())
                    }
                }
            })
            .await;

        match result {
            Ok(Ok(())) => match outcome {
                Outcome::Processed(output) => self.logger.log_completion(&output.display().to_string()),
                Outcome::Failed(message) => self.logger.log_error(message),
                Outcome::Killed => self.logger.log_warning(KILLED_MESSAGE),
            },
            Ok(Err(e)) => warn!(video_id = %self.video_id, "Video changed while its process ran: {}", e),
            Err(e) => error!(video_id = %self.video_id, "Failed to record process outcome: {}", e),
        }
    }
}

enum Outcome {
    Processed(PathBuf),
    Failed(String),
    Killed,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Processed(_) => "processed",
            Outcome::Failed(_) => "failed",
            Outcome::Killed => "killed",
        }
    }
}

/// Decide the terminal outcome and make the job record agree with it.
fn resolve(job: &mut ProcessingJob, exit: Exit, stderr_tail: &str) -> Outcome {
    let outcome = match exit {
        Exit::Killed => Outcome::Killed,
        Exit::WaitFailed(message) => Outcome::Failed(message),
        Exit::Exited(status) if !status.success() => {
            let message = if !stderr_tail.trim().is_empty() {
                stderr_tail.trim().to_string()
            } else if let Some(reported) = job.error.clone() {
                reported
            } else {
                match status.code() {
                    Some(code) => format!("process exited with status {}", code),
                    None => "process terminated by signal".to_string(),
                }
            };
            Outcome::Failed(message)
        }
        Exit::Exited(_) => match (job.status, job.output.clone(), job.error.clone()) {
            (JobStatus::Failed, _, error) => Outcome::Failed(error.unwrap_or_else(|| NO_COMPLETION_MESSAGE.to_string())),
            (JobStatus::Processed, Some(output), _) if !output.as_os_str().is_empty() => Outcome::Processed(output),
            (JobStatus::Processed, _, _) => Outcome::Failed(NO_OUTPUT_MESSAGE.to_string()),
            (JobStatus::Processing, _, _) => Outcome::Failed(NO_COMPLETION_MESSAGE.to_string()),
        },
    };

    match &outcome {
        Outcome::Processed(_) => {}
        Outcome::Failed(message) => {
            if job.status == JobStatus::Processed {
                // A late non-zero exit overrides the reported completion
                job.status = JobStatus::Processing;
            }
            job.fail(message.clone());
        }
        Outcome::Killed => job.fail(KILLED_MESSAGE),
    }
    outcome
}
