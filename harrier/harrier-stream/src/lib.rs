use futures::Stream;
use statelock::Lock;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;

/// Read buffer size for one chunk.
const CHUNK_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum StreamError {
	#[error("failed to create pipe: {0}")]
	Pipe(#[source] io::Error),

	#[error("pipe write end already taken")]
	SinkTaken,
}

/// The write end of a [`ByteStream`]'s pipe, to be bound to a child
/// process.
///
/// Converting into [`Stdio`] hands the descriptor to the spawn, which
/// consumes the parent's copy; once the child exits, the read end observes
/// end-of-stream.
#[derive(Debug)]
pub struct PipeSink {
	fd: OwnedFd,
}

impl PipeSink {
	pub fn into_stdio(self) -> Stdio {
		Stdio::from(self.fd)
	}
}

impl From<PipeSink> for Stdio {
	fn from(sink: PipeSink) -> Self {
		sink.into_stdio()
	}
}

/// A cancellable, single-pass sequence of byte chunks backed by one end of
/// a pipe.
///
/// Chunks arrive in the order the pipe produced them and, when a tee
/// writer was configured, each chunk is forwarded to it verbatim before it
/// is handed to the consumer. The sequence ends at the first empty read.
///
/// `&mut self` on [`ByteStream::next_chunk`] enforces the single-consumer
/// contract, and dropping the stream on any exit path closes the read end
/// and deregisters it from the runtime, so abandoning the sequence early
/// cannot leak a readiness registration against a pipe that outlives it.
pub struct ByteStream {
	reader: pipe::Receiver,
	sink: Option<PipeSink>,
	tee: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ByteStream {
	/// Creates a byte stream over a fresh pipe.
	pub fn new() -> Result<Self, StreamError> {
		Self::build(None)
	}

	/// Creates a byte stream that also forwards every chunk to `tee`.
	pub fn teed(tee: Box<dyn AsyncWrite + Send + Unpin>) -> Result<Self, StreamError> {
		Self::build(Some(tee))
	}

	fn build(tee: Option<Box<dyn AsyncWrite + Send + Unpin>>) -> Result<Self, StreamError> {
		let (read_fd, write_fd) = os_pipe().map_err(StreamError::Pipe)?;
		let reader = pipe::Receiver::from_owned_fd(read_fd).map_err(StreamError::Pipe)?;

		Ok(Self { reader, sink: Some(PipeSink { fd: write_fd }), tee })
	}

	/// Takes the write end for binding to a child process.
	///
	/// The write end exists exactly once; a second take fails with
	/// [`StreamError::SinkTaken`].
	pub fn sink(&mut self) -> Result<PipeSink, StreamError> {
		self.sink.take().ok_or(StreamError::SinkTaken)
	}

	/// Suspends until the next chunk is available.
	///
	/// Returns `Ok(None)` at end-of-stream, i.e. once every copy of the
	/// write end has been closed and the pipe has drained.
	pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
		let mut chunk = vec![0u8; CHUNK_CAPACITY];
		let n = self.reader.read(&mut chunk).await?;
		if n == 0 {
			return Ok(None);
		}
		chunk.truncate(n);

		if let Some(tee) = &mut self.tee {
			tee.write_all(&chunk).await?;
			tee.flush().await?;
		}

		Ok(Some(chunk))
	}

	/// Consumes the stream into a chunk [`Stream`] terminating at
	/// end-of-stream.
	pub fn into_chunks(mut self) -> impl Stream<Item = io::Result<Vec<u8>>> {
		async_stream::stream! {
			loop {
				match self.next_chunk().await {
					Ok(Some(chunk)) => yield Ok(chunk),
					Ok(None) => break,
					Err(e) => {
						yield Err(e);
						break;
					}
				}
			}
		}
	}
}

/// Creates a close-on-exec pipe pair as `(read, write)`.
///
/// The spawn machinery clears close-on-exec on the descriptor it installs
/// for the child, so the flag only keeps the ends from leaking into
/// unrelated children.
fn os_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
	let mut fds = [0i32; 2];
	if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
		return Err(io::Error::last_os_error());
	}

	// Safety: on success both descriptors are freshly created and owned
	// by this call.
	let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
	let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

	for fd in [&read, &write] {
		if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
			return Err(io::Error::last_os_error());
		}
	}

	Ok((read, write))
}

/// A serialized byte buffer receiving chunks from one or more streams.
///
/// Appends never interleave partially: each chunk lands in the buffer as
/// one unit, in append order.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
	data: Lock<Vec<u8>>,
}

impl OutputAccumulator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends one chunk.
	pub fn append(&self, chunk: &[u8]) {
		self.data.with_lock(|data| data.extend_from_slice(chunk));
	}

	pub fn is_empty(&self) -> bool {
		self.data.with_lock(|data| data.is_empty())
	}

	/// A copy of the accumulated bytes.
	pub fn bytes(&self) -> Vec<u8> {
		self.data.with_lock(|data| data.clone())
	}

	/// The accumulated bytes as text.
	///
	/// Invalid UTF-8 decodes lossily instead of failing, and a single
	/// trailing line terminator is trimmed if present.
	pub fn text(&self) -> String {
		let data = self.bytes();
		let mut text = match String::from_utf8(data) {
			Ok(text) => text,
			Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
		};

		if text.ends_with('\n') {
			text.pop();
		}

		text
	}
}
