//! Merge engine backed by a configured external merge tool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{CompletionHandler, MergeCompletion, MergeEngine, MergeProcess, MergeState, ProcessOutcome};
use crate::config::MergeToolConfig;
use crate::conflict::{ConflictRecord, ContentMerger};
use crate::errors::MergeError;

/// Launches the configured tool with `tokio::process` and watches it on a
/// tokio task.
#[derive(Debug, Clone)]
pub struct ToolMergeEngine {
    config: MergeToolConfig,
    output_dir: PathBuf,
}

impl ToolMergeEngine {
    pub fn new(config: MergeToolConfig) -> Self {
        Self {
            config,
            output_dir: std::env::temp_dir().join("reconcile-merge"),
        }
    }

    /// Write merged output under `dir` instead of the system temp dir.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    fn prepare(&self, record: &ConflictRecord) -> Result<MergeState, MergeError> {
        let inputs = record
            .merge_inputs
            .as_ref()
            .ok_or(MergeError::MissingInputs(record.id))?;
        let your_file = record
            .target_local_path
            .as_deref()
            .or(record.local_path())
            .ok_or(MergeError::MissingInputs(record.id))?;

        std::fs::create_dir_all(&self.output_dir)?;
        let file_name = Path::new(your_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "merged".into());
        let merged_file = self
            .output_dir
            .join(format!("{}-{}", Uuid::new_v4().simple(), file_name));

        Ok(MergeState {
            base_file: PathBuf::from(&inputs.base_file),
            their_file: PathBuf::from(&inputs.their_file),
            your_file: PathBuf::from(your_file),
            merged_file,
            automerged: false,
        })
    }

    /// Clean three-way merge of the inputs, written to the merged file.
    /// Returns `false` when the files cannot be read or overlap.
    fn try_automerge(state: &MergeState) -> bool {
        let read = |p: &Path| std::fs::read_to_string(p).ok();
        let (Some(base), Some(yours), Some(theirs)) = (
            read(&state.base_file),
            read(&state.your_file),
            read(&state.their_file),
        ) else {
            return false;
        };

        let output = ContentMerger::merge(&base, &yours, &theirs);
        if !output.is_clean() {
            debug!(conflicting = output.summary.conflicting, "automerge left conflicts");
            return false;
        }
        match std::fs::write(&state.merged_file, output.merged_content) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %state.merged_file.display(), error = %e, "failed to write automerge result");
                false
            }
        }
    }
}

impl MergeEngine for ToolMergeEngine {
    #[instrument(skip(self, record, completion), fields(conflict_id = %record.id))]
    fn begin_external_merge(
        &self,
        record: &ConflictRecord,
        completion: CompletionHandler,
    ) -> Result<Arc<dyn MergeProcess>, MergeError> {
        let display_name = record.display_name().to_string();
        let command = match self.config.command.as_deref() {
            Some(command) if self.config.applies_to(&display_name) => command.to_string(),
            _ => return Err(MergeError::ToolNotConfigured(display_name)),
        };
        let mut state = self.prepare(record)?;

        if self.config.try_automerge_first && Self::try_automerge(&state) {
            info!("automerge succeeded, merge tool not launched");
            state.automerged = true;
            let process: Arc<dyn MergeProcess> = Arc::new(ToolProcess::finished());
            completion(MergeCompletion {
                process: Arc::clone(&process),
                state,
                outcome: ProcessOutcome::Exited { code: 0 },
            });
            return Ok(process);
        }

        let handle = Handle::try_current().map_err(|_| MergeError::NoRuntime)?;
        let arguments = self.config.expand_arguments(
            &state.their_file.to_string_lossy(),
            &state.your_file.to_string_lossy(),
            &state.base_file.to_string_lossy(),
            &state.merged_file.to_string_lossy(),
            &display_name,
        );

        let mut child = {
            let _runtime = handle.enter();
            Command::new(&command)
                .args(&arguments)
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| MergeError::LaunchFailed {
                    command: command.clone(),
                    detail: e.to_string(),
                })?
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let process = Arc::new(ToolProcess {
            pid: child.id(),
            kill: Mutex::new(Some(kill_tx)),
            finished: AtomicBool::new(false),
        });
        info!(command = %command, pid = ?process.pid, "merge tool launched");

        let monitored = Arc::clone(&process);
        handle.spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => match status.code() {
                        Some(code) => ProcessOutcome::Exited { code },
                        None => ProcessOutcome::Abnormal(format!("merge tool terminated: {status}")),
                    },
                    Err(e) => ProcessOutcome::Abnormal(e.to_string()),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill merge tool");
                    }
                    ProcessOutcome::Interrupted
                }
            };
            monitored.finished.store(true, Ordering::SeqCst);
            debug!(?outcome, "merge tool finished");

            let process: Arc<dyn MergeProcess> = monitored;
            let _ = tokio::task::spawn_blocking(move || {
                completion(MergeCompletion {
                    process,
                    state,
                    outcome,
                })
            })
            .await;
        });

        Ok(process)
    }

    fn end_external_merge(
        &self,
        _process: &dyn MergeProcess,
        record: &mut ConflictRecord,
        state: &MergeState,
        outcome: &ProcessOutcome,
    ) -> bool {
        if *outcome != (ProcessOutcome::Exited { code: 0 }) {
            debug!(conflict_id = %record.id, ?outcome, "merge tool did not finish cleanly");
            return false;
        }
        if !state.merged_file.is_file() {
            warn!(
                conflict_id = %record.id,
                path = %state.merged_file.display(),
                "merge tool exited without writing output"
            );
            return false;
        }
        record.merged_file = Some(state.merged_file.to_string_lossy().into_owned());
        true
    }
}

/// A launched (or already finished) merge tool process.
struct ToolProcess {
    pid: Option<u32>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    finished: AtomicBool,
}

impl ToolProcess {
    fn finished() -> Self {
        Self {
            pid: None,
            kill: Mutex::new(None),
            finished: AtomicBool::new(true),
        }
    }
}

impl MergeProcess for ToolProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn interrupt(&self) {
        let sender = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            debug!(pid = ?self.pid, "interrupting merge tool");
            let _ = sender.send(());
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}
