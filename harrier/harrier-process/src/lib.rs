use harrier_signal::SignalInterceptor;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use statelock::Lock;
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
	#[error("process is already running")]
	ProcessIsRunning,

	#[error("process already finished, instances are single-use")]
	ProcessFinished,

	#[error("process terminated with exit code {code}")]
	Terminated { code: i32 },

	#[error("run preempted by uncaught signal {signal}")]
	UncaughtSignal { signal: i32 },

	#[error("failed to run process: {0}")]
	Process(#[source] Box<dyn std::error::Error + Send + Sync>),

	#[error("{error}, captured output: {output}")]
	WithOutput {
		#[source]
		error: Box<ProcessError>,
		output: String,
	},
}

impl ProcessError {
	/// Annotates the error with captured diagnostic text.
	///
	/// The annotation is one level deep: annotating an already annotated
	/// error keeps the original annotation.
	pub fn with_output(self, output: String) -> Self {
		match self {
			Self::WithOutput { .. } => self,
			error => Self::WithOutput { error: Box::new(error), output },
		}
	}
}

/// How the child itself came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
	/// The child exited on its own.
	Exited,
	/// The child was brought down by a signal.
	UncaughtSignal,
}

/// Serialized state of a running or completed process.
///
/// `termination_status` and `termination_reason` are written exactly once,
/// together, by the termination handler and are immutable afterwards.
#[derive(Debug, Default)]
struct LifecycleState {
	running: bool,
	finished: bool,
	pid: Option<i32>,
	termination_status: Option<i32>,
	termination_reason: Option<TerminationReason>,
	caught_signal: Option<i32>,
}

/// The process lifecycle controller.
///
/// Drives the `idle -> running -> completed` state machine for exactly one
/// child process, bridging the native exit notification to an awaitable
/// outcome. There is no path out of `completed`: re-running is
/// [`ProcessError::ProcessFinished`], distinct from the concurrent-call
/// [`ProcessError::ProcessIsRunning`].
///
/// State lives behind a [`Lock`] because the signal-interception handler
/// mutates it from outside the cooperative scheduler.
#[derive(Debug, Default)]
pub struct Runner {
	state: Arc<Lock<LifecycleState>>,
}

impl Runner {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_running(&self) -> bool {
		self.state.with_lock(|state| state.running)
	}

	/// The recorded exit status, present only after completion.
	pub fn termination_status(&self) -> Option<i32> {
		self.state.with_lock(|state| state.termination_status)
	}

	pub fn termination_reason(&self) -> Option<TerminationReason> {
		self.state.with_lock(|state| state.termination_reason)
	}

	/// The last fatal signal intercepted on the child's behalf, if any.
	pub fn caught_signal(&self) -> Option<i32> {
		self.state.with_lock(|state| state.caught_signal)
	}

	/// The child's process id, present once spawned.
	pub fn pid(&self) -> Option<i32> {
		self.state.with_lock(|state| state.pid)
	}

	/// Spawns the configured command and suspends until the child exits.
	///
	/// Before the spawn, a [`SignalInterceptor`] for `SIGINT`/`SIGTERM` is
	/// activated; while the child runs, either signal delivered to the
	/// hosting program is recorded and forwarded to the child. A spawn
	/// failure completes the run immediately, without any termination
	/// notification.
	pub async fn run(&self, mut command: Command) -> Result<(), ProcessError> {
		self.state.with_lock(|state| {
			if state.running {
				return Err(ProcessError::ProcessIsRunning);
			}
			if state.finished {
				return Err(ProcessError::ProcessFinished);
			}
			state.running = true;
			Ok(())
		})?;

		let state = self.state.clone();

		let interceptor = {
			let state = state.clone();
			SignalInterceptor::new([libc::SIGINT, libc::SIGTERM], move |sig| {
				let pid = state.with_lock(|state| {
					state.caught_signal = Some(sig);
					state.pid
				});

				let Some(pid) = pid else {
					// Signal landed between activation and spawn, nothing
					// to forward yet.
					return;
				};
				let pid = Pid::from_raw(pid);

				// Some programs only listen for the interactive interrupt,
				// so forward it first, then always request graceful
				// termination.
				if sig == libc::SIGINT {
					let _ = kill(pid, Signal::SIGINT);
				}
				if let Err(e) = kill(pid, Signal::SIGTERM) {
					warn!(%pid, error = %e, "failed to forward terminate to child");
				}
			})
		};
		let interceptor = match interceptor {
			Ok(interceptor) => interceptor,
			Err(e) => return Err(self.complete_without_child(ProcessError::Process(e.into()))),
		};
		interceptor.activate();

		let cmd_display = command.as_std().get_program().to_string_lossy().into_owned();
		let args_display = command
			.as_std()
			.get_args()
			.map(|s| s.to_string_lossy())
			.collect::<Vec<_>>()
			.join(" ");
		info!("Running command: {cmd_display} {args_display}");

		let mut child = match command.spawn() {
			Ok(child) => child,
			Err(e) => {
				interceptor.cancel();
				return Err(self.complete_without_child(ProcessError::Process(e.into())));
			}
		};
		let child_pid = child.id().map(|id| id as i32);
		state.with_lock(|state| state.pid = child_pid);

		// One-shot completion bridge from the exit notification to the
		// awaiting caller: sending consumes the sender, so the waiter can
		// resume at most once by construction.
		let (tx, rx) = oneshot::channel::<Result<(), ProcessError>>();

		tokio::spawn(async move {
			// Fires only once the child has actually exited.
			let waited = child.wait().await;
			interceptor.cancel();

			let result = match waited {
				Ok(status) => {
					let (code, reason) = classify(status);
					let caught = state.with_lock(|state| {
						state.running = false;
						state.finished = true;
						state.termination_status = Some(code);
						state.termination_reason = Some(reason);
						state.caught_signal
					});

					if let Some(signal) = caught {
						Err(ProcessError::UncaughtSignal { signal })
					} else if code != 0 {
						Err(ProcessError::Terminated { code })
					} else {
						Ok(())
					}
				}
				Err(e) => {
					state.with_lock(|state| {
						state.running = false;
						state.finished = true;
					});
					Err(ProcessError::Process(e.into()))
				}
			};

			if tx.send(result).is_err() {
				warn!("run was abandoned before the child exited");
			}
		});

		rx.await.map_err(|e| ProcessError::Process(e.into()))?
	}

	/// Completes the run as a failure before any child existed.
	fn complete_without_child(&self, error: ProcessError) -> ProcessError {
		self.state.with_lock(|state| {
			state.running = false;
			state.finished = true;
		});
		error
	}
}

/// Folds an [`ExitStatus`] into the recorded status and reason.
///
/// A signal death carries the signal number as the status, mirroring the
/// native wait semantics.
fn classify(status: ExitStatus) -> (i32, TerminationReason) {
	use std::os::unix::process::ExitStatusExt;

	match status.code() {
		Some(code) => (code, TerminationReason::Exited),
		None => (status.signal().unwrap_or_default(), TerminationReason::UncaughtSignal),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn sh(script: &str) -> Command {
		let mut command = Command::new("/bin/sh");
		command.arg("-c").arg(script);
		command
	}

	#[tokio::test]
	async fn test_zero_exit_resolves_success() -> anyhow::Result<()> {
		let runner = Runner::new();
		runner.run(sh("exit 0")).await?;

		assert!(!runner.is_running());
		assert_eq!(runner.termination_status(), Some(0));
		assert_eq!(runner.termination_reason(), Some(TerminationReason::Exited));
		assert_eq!(runner.caught_signal(), None);
		Ok(())
	}

	#[tokio::test]
	async fn test_nonzero_exit_resolves_terminated() -> anyhow::Result<()> {
		let runner = Runner::new();
		let result = runner.run(sh("exit 7")).await;

		assert!(matches!(result, Err(ProcessError::Terminated { code: 7 })));
		assert_eq!(runner.termination_status(), Some(7));
		Ok(())
	}

	#[tokio::test]
	async fn test_sequential_rerun_is_rejected() -> anyhow::Result<()> {
		let runner = Runner::new();
		runner.run(sh("exit 0")).await?;

		let result = runner.run(sh("exit 0")).await;
		assert!(matches!(result, Err(ProcessError::ProcessFinished)));
		Ok(())
	}

	#[tokio::test]
	async fn test_concurrent_run_is_rejected() -> anyhow::Result<()> {
		let runner = Arc::new(Runner::new());

		let first = {
			let runner = runner.clone();
			tokio::spawn(async move { runner.run(sh("sleep 0.4")).await })
		};

		// Wait for the first run to be admitted.
		while !runner.is_running() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}

		let result = runner.run(sh("exit 0")).await;
		assert!(matches!(result, Err(ProcessError::ProcessIsRunning)));

		first.await??;
		Ok(())
	}

	#[tokio::test]
	async fn test_spawn_failure_completes_run() -> anyhow::Result<()> {
		let runner = Runner::new();
		let result = runner.run(Command::new("/nonexistent/harrier-no-such-bin")).await;
		assert!(matches!(result, Err(ProcessError::Process(_))));

		// The launch failure is terminal.
		let result = runner.run(sh("exit 0")).await;
		assert!(matches!(result, Err(ProcessError::ProcessFinished)));
		Ok(())
	}

	#[test]
	fn test_with_output_annotates_once() {
		let error = ProcessError::Terminated { code: 2 }.with_output("diag".into());
		let annotated = error.with_output("other".into());

		match annotated {
			ProcessError::WithOutput { error, output } => {
				assert!(matches!(*error, ProcessError::Terminated { code: 2 }));
				assert_eq!(output, "diag");
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
