use futures::stream::{BoxStream, SelectAll, StreamExt};
use statelock::Lock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SignalStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SignalError {
	#[error("no interceptable signals in the requested set")]
	EmptySignalSet,

	#[error("failed to register signal listener: {0}")]
	Registration(#[source] std::io::Error),
}

/// The signals this host can intercept.
///
/// `SIGKILL` and `SIGSTOP` can never be caught; `SIGILL`, `SIGFPE` and
/// `SIGSEGV` are refused by the process-wide signal registry the runtime
/// uses, so they are excluded here as well.
pub fn known_signals() -> &'static [i32] {
	&[
		libc::SIGHUP,
		libc::SIGINT,
		libc::SIGQUIT,
		libc::SIGTRAP,
		libc::SIGABRT,
		libc::SIGBUS,
		libc::SIGSYS,
		libc::SIGPIPE,
		libc::SIGALRM,
		libc::SIGTERM,
		libc::SIGURG,
		libc::SIGTSTP,
		libc::SIGCONT,
		libc::SIGCHLD,
		libc::SIGTTIN,
		libc::SIGTTOU,
		libc::SIGIO,
		libc::SIGXCPU,
		libc::SIGXFSZ,
		libc::SIGVTALRM,
		libc::SIGPROF,
		libc::SIGWINCH,
		libc::SIGUSR1,
		libc::SIGUSR2,
		#[cfg(target_os = "macos")]
		libc::SIGEMT,
		#[cfg(target_os = "macos")]
		libc::SIGINFO,
	]
}

/// Parts of the interceptor that change over its lifecycle.
///
/// Guarded by a [`Lock`] so that activation and cancellation cannot
/// interleave with each other.
struct Registration {
	/// Merged signal streams, present until [`SignalInterceptor::activate`]
	/// hands them to the listener task.
	streams: Option<SelectAll<BoxStream<'static, i32>>>,
	/// The listener task, present while active.
	listener: Option<JoinHandle<()>>,
}

/// An active registration for a set of Unix signals directed at the
/// hosting program.
///
/// Construction intersects the requested set with [`known_signals`] and
/// registers a listener stream per effective signal. While active, each
/// delivery invokes the supplied handler with the signal number on a
/// runtime worker thread; whatever state the handler touches must be
/// guarded by a thread-level primitive such as [`statelock::Lock`].
///
/// Cancellation is idempotent: any number of call sites (explicit cancel,
/// a termination handler, `Drop`) collapse to exactly one effective
/// cancellation, which tears down the listener streams and thereby
/// releases the process-level handlers registered on our behalf.
pub struct SignalInterceptor {
	signals: BTreeSet<i32>,
	handler: Arc<dyn Fn(i32) + Send + Sync>,
	registration: Lock<Registration>,
	cancelled: Arc<AtomicBool>,
	suspended: Arc<AtomicBool>,
}

impl SignalInterceptor {
	/// Creates an interceptor for every requested signal the host can
	/// intercept.
	///
	/// Must be called from within a tokio runtime. Fails with
	/// [`SignalError::EmptySignalSet`] when the intersection of the request
	/// and [`known_signals`] is empty.
	pub fn new<I>(
		signals: I,
		handler: impl Fn(i32) + Send + Sync + 'static,
	) -> Result<Self, SignalError>
	where
		I: IntoIterator<Item = i32>,
	{
		let known: BTreeSet<i32> = known_signals().iter().copied().collect();
		let signals: BTreeSet<i32> =
			signals.into_iter().filter(|sig| known.contains(sig)).collect();

		if signals.is_empty() {
			return Err(SignalError::EmptySignalSet);
		}

		let mut streams = SelectAll::new();
		for &sig in &signals {
			let stream =
				signal(SignalKind::from_raw(sig)).map_err(SignalError::Registration)?;
			streams.push(SignalStream::new(stream).map(move |_| sig).boxed());
		}

		Ok(Self {
			signals,
			handler: Arc::new(handler),
			registration: Lock::new(Registration { streams: Some(streams), listener: None }),
			cancelled: Arc::new(AtomicBool::new(false)),
			suspended: Arc::new(AtomicBool::new(false)),
		})
	}

	/// The effective set of intercepted signals.
	pub fn signals(&self) -> impl Iterator<Item = i32> + '_ {
		self.signals.iter().copied()
	}

	/// Starts delivering intercepted signals to the handler.
	///
	/// Activating twice, or after cancellation, is a no-op.
	pub fn activate(&self) {
		self.registration.with_lock(|registration| {
			let Some(mut streams) = registration.streams.take() else {
				return;
			};

			let handler = self.handler.clone();
			let suspended = self.suspended.clone();

			registration.listener = Some(tokio::spawn(async move {
				while let Some(sig) = streams.next().await {
					if suspended.load(Ordering::Acquire) {
						debug!(signal = sig, "signal delivery suspended, dropping");
						continue;
					}
					debug!(signal = sig, "intercepted signal");
					handler(sig);
				}
			}));
		});
	}

	/// Stops intercepting and releases the underlying signal registrations.
	///
	/// Safe to call concurrently from multiple call sites; exactly one
	/// cancellation takes effect.
	pub fn cancel(&self) {
		if self
			.cancelled
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}

		self.registration.with_lock(|registration| {
			// Dropping the streams deregisters this interceptor from the
			// process-level signal handlers.
			registration.streams = None;
			if let Some(listener) = registration.listener.take() {
				listener.abort();
			}
		});
		debug!("signal interceptor cancelled");
	}

	/// Whether the interceptor has been cancelled.
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::Acquire)
	}

	/// Temporarily discards deliveries without deregistering.
	pub fn suspend(&self) {
		self.suspended.store(true, Ordering::Release);
	}

	/// Resumes delivery after [`SignalInterceptor::suspend`].
	pub fn resume(&self) {
		self.suspended.store(false, Ordering::Release);
	}
}

impl Drop for SignalInterceptor {
	fn drop(&mut self) {
		self.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nix::sys::signal::{raise, Signal};
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	#[tokio::test]
	async fn test_empty_effective_set_is_rejected() {
		// SIGKILL cannot be caught, so the effective set is empty.
		let result = SignalInterceptor::new([libc::SIGKILL], |_| {});
		assert!(matches!(result, Err(SignalError::EmptySignalSet)));
	}

	#[tokio::test]
	async fn test_unknown_signals_are_filtered() -> anyhow::Result<()> {
		let interceptor = SignalInterceptor::new([0, libc::SIGUSR1, 9999], |_| {})?;
		assert_eq!(interceptor.signals().collect::<Vec<_>>(), vec![libc::SIGUSR1]);
		Ok(())
	}

	#[tokio::test]
	async fn test_delivery_invokes_handler() -> anyhow::Result<()> {
		let hits = Arc::new(AtomicUsize::new(0));
		let interceptor = {
			let hits = hits.clone();
			SignalInterceptor::new([libc::SIGUSR1], move |sig| {
				assert_eq!(sig, libc::SIGUSR1);
				hits.fetch_add(1, Ordering::SeqCst);
			})?
		};
		interceptor.activate();

		raise(Signal::SIGUSR1)?;

		for _ in 0..100 {
			if hits.load(Ordering::SeqCst) > 0 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(hits.load(Ordering::SeqCst) >= 1);

		interceptor.cancel();
		Ok(())
	}

	#[tokio::test]
	async fn test_suspend_discards_deliveries() -> anyhow::Result<()> {
		let hits = Arc::new(AtomicUsize::new(0));
		let interceptor = {
			let hits = hits.clone();
			SignalInterceptor::new([libc::SIGUSR2], move |_| {
				hits.fetch_add(1, Ordering::SeqCst);
			})?
		};
		interceptor.activate();
		interceptor.suspend();

		raise(Signal::SIGUSR2)?;
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 0);

		interceptor.cancel();
		Ok(())
	}

	#[tokio::test]
	async fn test_concurrent_cancel_takes_effect_once() -> anyhow::Result<()> {
		let interceptor = Arc::new(SignalInterceptor::new([libc::SIGUSR1], |_| {})?);
		interceptor.activate();

		let mut handles = Vec::new();
		for _ in 0..16 {
			let interceptor = interceptor.clone();
			handles.push(tokio::spawn(async move { interceptor.cancel() }));
		}
		for handle in handles {
			handle.await?;
		}

		assert!(interceptor.is_cancelled());
		// A second explicit cancel must be a no-op rather than a panic or a
		// double teardown.
		interceptor.cancel();
		Ok(())
	}
}
