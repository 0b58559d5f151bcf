//! Signal forwarding exercises a process-wide signal, so it lives in its
//! own test binary where raising an interrupt cannot interfere with other
//! runs.

use harrier_process::{ProcessError, Runner, TerminationReason};
use nix::sys::signal::{raise, Signal};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

#[tokio::test]
async fn test_interrupt_is_forwarded_and_reported() -> anyhow::Result<()> {
	let runner = Arc::new(Runner::new());

	let run = {
		let runner = runner.clone();
		tokio::spawn(async move {
			let mut command = Command::new("/bin/sh");
			command.arg("-c").arg("sleep 5");
			runner.run(command).await
		})
	};

	while !runner.is_running() {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	// Leave the interceptor and spawn a moment to finish.
	tokio::time::sleep(Duration::from_millis(200)).await;

	raise(Signal::SIGINT)?;

	let result = run.await?;
	assert!(matches!(result, Err(ProcessError::UncaughtSignal { signal: libc::SIGINT })));
	assert_eq!(runner.caught_signal(), Some(libc::SIGINT));
	// The child went down by the forwarded signal, well before its five
	// seconds were up.
	assert_eq!(runner.termination_reason(), Some(TerminationReason::UncaughtSignal));
	Ok(())
}
