use harrier_stream::PipeSink;
use std::fs::File;
use std::process::Stdio;

/// Binding for the child's standard input.
#[derive(Debug, Default)]
pub enum InputHandle {
	/// Inherit the parent's standard input.
	#[default]
	Inherited,
	/// Read from the null device.
	Null,
	/// Read from an open file.
	File(File),
}

impl InputHandle {
	pub(crate) fn into_stdio(self) -> Stdio {
		match self {
			Self::Inherited => Stdio::inherit(),
			Self::Null => Stdio::null(),
			Self::File(file) => Stdio::from(file),
		}
	}
}

/// Binding for the child's standard output or standard error.
#[derive(Debug, Default)]
pub enum OutputHandle {
	/// Inherit the parent's stream.
	#[default]
	Inherited,
	/// Discard everything.
	Null,
	/// Write to an open file.
	File(File),
	/// Write into the pipe behind a [`harrier_stream::ByteStream`].
	Stream(PipeSink),
}

impl OutputHandle {
	pub(crate) fn into_stdio(self) -> Stdio {
		match self {
			Self::Inherited => Stdio::inherit(),
			Self::Null => Stdio::null(),
			Self::File(file) => Stdio::from(file),
			Self::Stream(sink) => sink.into_stdio(),
		}
	}
}

/// Scheduling priority class for the child, mapped to a niceness delta.
///
/// Applied best-effort in the child before exec; raising priority above
/// the parent's requires elevated privileges and silently degrades to the
/// inherited niceness without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
	High,
	#[default]
	Normal,
	Utility,
	Background,
}

impl Priority {
	pub(crate) fn nice_delta(self) -> i32 {
		match self {
			Self::High => -5,
			Self::Normal => 0,
			Self::Utility => 5,
			Self::Background => 10,
		}
	}
}
