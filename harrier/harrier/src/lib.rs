pub mod capture;
pub mod executable;
pub mod handles;

pub use capture::CaptureOptions;
pub use executable::Executable;
pub use handles::{InputHandle, OutputHandle, Priority};
pub use harrier_process::{ProcessError, Runner, TerminationReason};
pub use harrier_stream::{ByteStream, OutputAccumulator, PipeSink, StreamError};

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;

/// One configured, at-most-once-runnable child process.
///
/// Configuration is open until [`ProcessHandle::run`] takes the exclusive
/// borrow; afterwards the runner's state machine rejects any further run,
/// so each handle executes its child at most once.
#[derive(Debug, Default)]
pub struct ProcessHandle {
	executable: Executable,
	arguments: Vec<String>,
	environment: Option<HashMap<String, String>>,
	current_dir: Option<PathBuf>,
	priority: Priority,
	stdin: InputHandle,
	stdout: OutputHandle,
	stderr: OutputHandle,
	runner: Runner,
}

impl ProcessHandle {
	pub fn new(executable: Executable) -> Self {
		Self { executable, ..Self::default() }
	}

	pub fn executable(&self) -> &Executable {
		&self.executable
	}

	pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
		self.arguments.push(arg.into());
		self
	}

	pub fn args<I, S>(&mut self, args: I) -> &mut Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.arguments.extend(args.into_iter().map(Into::into));
		self
	}

	/// Sets one environment variable.
	///
	/// Any explicit environment replaces the inherited one wholesale; with
	/// no variables set the child inherits the parent's environment.
	pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
		self.environment.get_or_insert_with(HashMap::new).insert(key.into(), value.into());
		self
	}

	/// Replaces the entire environment mapping.
	pub fn set_environment(&mut self, environment: HashMap<String, String>) -> &mut Self {
		self.environment = Some(environment);
		self
	}

	pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
		self.current_dir = Some(dir.into());
		self
	}

	pub fn priority(&mut self, priority: Priority) -> &mut Self {
		self.priority = priority;
		self
	}

	pub fn set_stdin(&mut self, handle: InputHandle) -> &mut Self {
		self.stdin = handle;
		self
	}

	pub fn set_stdout(&mut self, handle: OutputHandle) -> &mut Self {
		self.stdout = handle;
		self
	}

	pub fn set_stderr(&mut self, handle: OutputHandle) -> &mut Self {
		self.stderr = handle;
		self
	}

	pub fn is_running(&self) -> bool {
		self.runner.is_running()
	}

	pub fn termination_status(&self) -> Option<i32> {
		self.runner.termination_status()
	}

	pub fn termination_reason(&self) -> Option<TerminationReason> {
		self.runner.termination_reason()
	}

	pub fn caught_signal(&self) -> Option<i32> {
		self.runner.caught_signal()
	}

	pub fn pid(&self) -> Option<i32> {
		self.runner.pid()
	}

	/// Runs the child with the configured stream bindings and suspends
	/// until it exits.
	pub async fn run(&mut self) -> Result<(), ProcessError> {
		let command = self.command();
		self.runner.run(command).await
	}

	/// Assembles the native command, consuming the stream bindings.
	fn command(&mut self) -> Command {
		let mut command = Command::new(self.executable.path());
		command.args(&self.arguments);

		if let Some(environment) = &self.environment {
			command.env_clear();
			command.envs(environment);
		}
		if let Some(dir) = &self.current_dir {
			command.current_dir(dir);
		}

		let delta = self.priority.nice_delta();
		if delta != 0 {
			// Safety: nice(2) is async-signal-safe, fine between fork and
			// exec.
			unsafe {
				command.pre_exec(move || {
					let _ = libc::nice(delta);
					Ok(())
				});
			}
		}

		command.stdin(std::mem::take(&mut self.stdin).into_stdio());
		command.stdout(std::mem::take(&mut self.stdout).into_stdio());
		command.stderr(std::mem::take(&mut self.stderr).into_stdio());

		command
	}
}
