use crate::{OutputHandle, ProcessHandle};
use harrier_process::ProcessError;
use harrier_stream::{ByteStream, OutputAccumulator, StreamError};
use tokio::io::AsyncWrite;
use tracing::warn;

/// Capture policy for [`ProcessHandle::run_captured`].
///
/// `mirror` tees every captured chunk to the parent's own stdout/stderr so
/// the child's output stays visible on the console while being captured.
/// `stderr_in_errors` routes stderr into a dedicated buffer that is
/// attached to any failure.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
	pub stdout: bool,
	pub stderr: bool,
	pub mirror: bool,
	pub stderr_in_errors: bool,
}

impl Default for CaptureOptions {
	fn default() -> Self {
		Self { stdout: true, stderr: true, mirror: true, stderr_in_errors: true }
	}
}

impl CaptureOptions {
	/// Like the default, but without mirroring to the parent's console.
	pub fn quiet() -> Self {
		Self { mirror: false, ..Self::default() }
	}
}

impl ProcessHandle {
	/// Runs the process, draining its output per `options`.
	///
	/// On success the captured text is returned, decoded and with a single
	/// trailing newline trimmed, or the empty string when no capture was
	/// requested. On failure the error is annotated with the configured
	/// diagnostic buffer (stderr when `stderr_in_errors`, the combined
	/// capture otherwise) if that buffer is non-empty.
	///
	/// Any stdout/stderr bindings configured on the handle are replaced by
	/// the capture pipes.
	pub async fn run_captured(&mut self, options: CaptureOptions) -> Result<String, ProcessError> {
		let combined = OutputAccumulator::new();
		let stderr_only = OutputAccumulator::new();

		// Output drains to the accumulators as follows:
		//
		// | stdout | stderr | stderr_in_errors | stdout target | stderr target  |
		// |--------|--------|------------------|---------------|----------------|
		// | yes    | yes    | yes              | combined      | both           |
		// | yes    | yes    | no               | combined      | combined       |
		// | yes    | no     | yes              | combined      | stderr-only    |
		// | no     | no     | yes              | (not bound)   | stderr-only    |
		let stdout_stream = if options.stdout {
			let mut stream = capture_stream(options.mirror.then(parent_stdout))?;
			self.set_stdout(OutputHandle::Stream(stream.sink().map_err(opaque)?));
			Some(stream)
		} else {
			None
		};

		let stderr_stream = if options.stderr || options.stderr_in_errors {
			let mut stream = capture_stream(options.mirror.then(parent_stderr))?;
			self.set_stderr(OutputHandle::Stream(stream.sink().map_err(opaque)?));
			Some(stream)
		} else {
			None
		};

		let (stderr_combined, stderr_split) = match (options.stderr, options.stderr_in_errors) {
			(true, true) => (Some(&combined), Some(&stderr_only)),
			(true, false) => (Some(&combined), None),
			(false, _) => (None, Some(&stderr_only)),
		};

		// join, not try_join: a failed run must still let the drains
		// consume whatever the child managed to write, so the failure can
		// carry it.
		let (run_result, (), ()) = tokio::join!(
			self.run(),
			drain(stdout_stream, Some(&combined), None),
			drain(stderr_stream, stderr_combined, stderr_split),
		);

		match run_result {
			Ok(()) => {
				if options.stdout || options.stderr {
					Ok(combined.text())
				} else {
					Ok(String::new())
				}
			}
			Err(error) => {
				let output = if options.stderr_in_errors {
					stderr_only.text()
				} else {
					combined.text()
				};

				if output.is_empty() {
					Err(error)
				} else {
					Err(error.with_output(output))
				}
			}
		}
	}
}

fn capture_stream(
	tee: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) -> Result<ByteStream, ProcessError> {
	match tee {
		Some(tee) => ByteStream::teed(tee),
		None => ByteStream::new(),
	}
	.map_err(opaque)
}

fn parent_stdout() -> Box<dyn AsyncWrite + Send + Unpin> {
	Box::new(tokio::io::stdout())
}

fn parent_stderr() -> Box<dyn AsyncWrite + Send + Unpin> {
	Box::new(tokio::io::stderr())
}

fn opaque(error: StreamError) -> ProcessError {
	ProcessError::Process(error.into())
}

/// Pulls chunks from one capture stream into up to two accumulators.
///
/// Read errors end the drain; capture is best-effort diagnostics, not a
/// reason to fail the run.
async fn drain(
	stream: Option<ByteStream>,
	first: Option<&OutputAccumulator>,
	second: Option<&OutputAccumulator>,
) {
	let Some(mut stream) = stream else {
		return;
	};

	loop {
		match stream.next_chunk().await {
			Ok(Some(chunk)) => {
				if let Some(accumulator) = first {
					accumulator.append(&chunk);
				}
				if let Some(accumulator) = second {
					accumulator.append(&chunk);
				}
			}
			Ok(None) => break,
			Err(e) => {
				warn!(error = %e, "output drain ended early");
				break;
			}
		}
	}
}
