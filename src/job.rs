//! Per-device single-slot job engine (spec.md §4.4).
//!
//! Supervises a single helper child process: wires its stdout as a
//! progress stream, drains stderr into a diagnostic buffer, supports
//! cooperative `SIGTERM` cancellation, and resolves to exactly one
//! completion per started job. Realized with `tokio::process` the way
//! `devkit-disks-device.c`'s glib main-loop job watches a forked helper,
//! translated into the cooperative `tokio::select!` loop spec.md §5
//! describes.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Error};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::ports::ChangeNotifier;

/// Outcome handed to the completion continuation once the child exits.
pub struct JobOutcome {
    pub was_cancelled: bool,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl JobOutcome {
    pub fn into_result(self) -> Result<String, DkError> {
        if !self.was_cancelled && self.exit_code == Some(0) {
            return Ok(self.stderr);
        }
        Err(DkError::from_helper_exit(self.was_cancelled, self.exit_code, &self.stderr))
    }
}

/// One device's job slot. Enforces "at most one active job per device"
/// (spec.md §3 invariant) by holding an async `Mutex` for the lifetime of
/// a run; a second `start` call while one is in flight fails fast via
/// `try_lock` rather than queueing, matching "fail with
/// *JobAlreadyInProgress*" (spec.md §4.4).
pub struct JobSlot {
    lock: Mutex<()>,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    started_by: std::sync::Mutex<Option<u32>>,
}

impl Default for JobSlot {
    fn default() -> Self {
        JobSlot {
            lock: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            started_by: std::sync::Mutex::new(None),
        }
    }
}

/// A line from the helper's stdout matching `progress: %d %d %f %s`
/// (spec.md §4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub cur_task: i32,
    pub num_tasks: i32,
    pub cur_task_percentage: f64,
    pub cur_task_id: String,
}

/// Parse one stdout line. Per spec.md §4.4 / §9: lines of 256 characters
/// or more are never matched (this mirrors the original's
/// `strlen(str) < 256` guard verbatim, including its surprising drop of
/// long progress lines); non-matching lines are not errors.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    if line.len() >= 256 {
        return None;
    }
    let mut fields = line.strip_prefix("progress: ")?.split_whitespace();
    let cur_task: i32 = fields.next()?.parse().ok()?;
    let num_tasks: i32 = fields.next()?.parse().ok()?;
    let cur_task_percentage: f64 = fields.next()?.parse().ok()?;
    let cur_task_id = fields.next()?.to_string();
    if fields.next().is_some() {
        return None;
    }
    Some(ProgressLine {
        cur_task,
        num_tasks,
        cur_task_percentage,
        cur_task_id,
    })
}

impl JobSlot {
    /// Run `argv` to completion, updating `device`'s job fields as
    /// progress lines arrive and publishing "job-changed" through
    /// `notifier`. Returns `JobAlreadyInProgress` immediately if a job is
    /// already running on this device.
    pub async fn start(
        self: &Arc<Self>,
        device: &Arc<DeviceRecord>,
        job_id: String,
        is_cancellable: bool,
        argv: &[String],
        notifier: &dyn ChangeNotifier,
        started_by_uid: u32,
    ) -> Result<JobOutcome, DkError> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| DkError::JobAlreadyInProgress)?;

        self.cancel_requested.store(false, Ordering::SeqCst);
        *self.started_by.lock().unwrap() = Some(started_by_uid);
        device.set_job_running(job_id, is_cancellable, notifier);

        let result = self.run_and_supervise(device, argv, notifier).await;

        device.clear_job(notifier);
        *self.started_by.lock().unwrap() = None;
        result.map_err(|err| DkError::General(err.to_string()))
    }

    /// The uid that started the job currently occupying this slot, if any.
    pub fn started_by(&self) -> Option<u32> {
        *self.started_by.lock().unwrap()
    }

    #[cfg(test)]
    pub fn set_started_by_for_test(&self, uid: Option<u32>) {
        *self.started_by.lock().unwrap() = uid;
    }

    /// Request cancellation of the currently running job. Fails with
    /// `NoJobInProgress` if idle, `JobCannotBeCancelled` if the running
    /// job was not started as cancellable (spec.md §4.4).
    pub fn cancel(&self, device: &DeviceRecord) -> Result<(), DkError> {
        if !device.job_in_progress() {
            return Err(DkError::NoJobInProgress);
        }
        if !device.job_fields().is_cancellable {
            return Err(DkError::JobCannotBeCancelled);
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
        Ok(())
    }

    async fn run_and_supervise(
        &self,
        device: &Arc<DeviceRecord>,
        argv: &[String],
        notifier: &dyn ChangeNotifier,
    ) -> Result<JobOutcome, Error> {
        let (program, args) = argv.split_first().context("empty argv")?;

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn helper {:?}", program))?;

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stderr_buffer = String::new();
        let mut was_cancelled = false;
        let mut sigterm_sent = false;

        let exit_status = loop {
            if self.cancel_requested.load(Ordering::SeqCst) && !sigterm_sent {
                sigterm_sent = true;
                was_cancelled = true;
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
            }

            tokio::select! {
                status = child.wait() => {
                    break status.context("failed to wait for helper")?;
                }
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            log::debug!("helper(pid {:?}): {}", child.id(), line);
                            if let Some(progress) = parse_progress_line(&line) {
                                device.update_job_progress(
                                    progress.cur_task,
                                    progress.num_tasks,
                                    progress.cur_task_percentage,
                                    progress.cur_task_id,
                                    notifier,
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(err) => log::warn!("error reading helper stdout: {}", err),
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            stderr_buffer.push_str(&line);
                            stderr_buffer.push('\n');
                        }
                        Ok(None) => {}
                        Err(err) => log::warn!("error reading helper stderr: {}", err),
                    }
                }
                _ = self.cancel_notify.notified() => {
                    // Just wakes the loop so the top-of-loop check above
                    // sends SIGTERM promptly instead of waiting for the
                    // next child I/O event.
                }
            }
        };

        // Drain anything left in the pipes after exit, per spec.md §4.4
        // ("drain stderr/stdout to EOF").
        while let Ok(Some(line)) = stdout_lines.next_line().await {
            log::debug!("helper(pid {:?}): {}", child.id(), line);
        }
        while let Ok(Some(line)) = stderr_lines.next_line().await {
            stderr_buffer.push_str(&line);
            stderr_buffer.push('\n');
        }

        Ok(JobOutcome {
            was_cancelled,
            exit_code: exit_status.code(),
            stderr: stderr_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_parses_documented_example() {
        let parsed = parse_progress_line("progress: 2 5 47.5 FORMAT").unwrap();
        assert_eq!(parsed.cur_task, 2);
        assert_eq!(parsed.num_tasks, 5);
        assert_eq!(parsed.cur_task_percentage, 47.5);
        assert_eq!(parsed.cur_task_id, "FORMAT");
    }

    #[test]
    fn non_matching_line_is_ignored() {
        assert!(parse_progress_line("hello world").is_none());
        assert!(parse_progress_line("progress: not numbers here").is_none());
    }

    #[test]
    fn overlong_line_is_dropped_per_original_256_char_cap() {
        let long_id = "x".repeat(300);
        let line = format!("progress: 1 1 1.0 {}", long_id);
        assert!(parse_progress_line(&line).is_none());
    }

    #[tokio::test]
    async fn successful_job_runs_to_completion_and_clears_job_state() {
        let device = Arc::new(DeviceRecord::for_test("/sys/block/sdz", "/devices/sdz"));
        let slot = Arc::new(JobSlot::default());
        let notifier = NullNotifier;

        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "echo progress: 1 1 100.0 DONE".to_string()];
        let outcome = slot
            .start(&device, "job1".to_string(), true, &argv, &notifier, 1000)
            .await
            .unwrap();

        assert!(!outcome.was_cancelled);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!device.job_in_progress());
        assert_eq!(device.job_fields().cur_task_percentage, -1.0);
        assert_eq!(slot.started_by(), None);
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let device = Arc::new(DeviceRecord::for_test("/sys/block/sdz", "/devices/sdz"));
        let slot = Arc::new(JobSlot::default());
        let notifier = NullNotifier;

        let slow_argv = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 0.2".to_string()];
        let slot2 = slot.clone();
        let device2 = device.clone();
        let handle = tokio::spawn(async move {
            slot2.start(&device2, "job1".to_string(), true, &slow_argv, &NullNotifier, 1000).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];
        let result = slot.start(&device, "job2".to_string(), true, &argv, &notifier, 1001).await;
        assert!(matches!(result, Err(DkError::JobAlreadyInProgress)));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_observed_by_the_completion() {
        let device = Arc::new(DeviceRecord::for_test("/sys/block/sdz", "/devices/sdz"));
        let slot = Arc::new(JobSlot::default());

        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "trap 'exit 143' TERM; sleep 5".to_string(),
        ];
        let slot2 = slot.clone();
        let device2 = device.clone();
        let handle = tokio::spawn(async move {
            slot2.start(&device2, "job1".to_string(), true, &argv, &NullNotifier, 1000).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(slot.started_by(), Some(1000));
        slot.cancel(&device).unwrap();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("cancellation should be observed promptly, not after the helper's 5s sleep")
            .unwrap()
            .unwrap();
        assert!(outcome.was_cancelled);
        assert!(matches!(outcome.into_result(), Err(DkError::JobWasCancelled)));
    }

    #[tokio::test]
    async fn cancel_without_running_job_fails() {
        let device = DeviceRecord::for_test("/sys/block/sdz", "/devices/sdz");
        let slot = JobSlot::default();
        assert!(matches!(slot.cancel(&device), Err(DkError::NoJobInProgress)));
    }

    struct NullNotifier;
    impl ChangeNotifier for NullNotifier {
        fn changed(&self, _object_path: &str) {}
        fn job_changed(&self, _object_path: &str, _fields: crate::device::JobFields) {}
    }
}
