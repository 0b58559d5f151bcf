use std::path::PathBuf;

/// The program a [`crate::ProcessHandle`] launches: a named shell or an
/// arbitrary binary path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Executable {
	Bash,
	Sh,
	Zsh,

	Csh,
	Dash,
	Ksh,
	Tcsh,

	Bin(PathBuf),
}

impl Executable {
	pub fn path(&self) -> PathBuf {
		match self {
			Self::Bash => PathBuf::from("/bin/bash"),
			Self::Sh => PathBuf::from("/bin/sh"),
			Self::Zsh => PathBuf::from("/bin/zsh"),
			Self::Csh => PathBuf::from("/bin/csh"),
			Self::Dash => PathBuf::from("/bin/dash"),
			Self::Ksh => PathBuf::from("/bin/ksh"),
			Self::Tcsh => PathBuf::from("/bin/tcsh"),
			Self::Bin(path) => path.clone(),
		}
	}
}

impl Default for Executable {
	#[cfg(target_os = "macos")]
	fn default() -> Self {
		Self::Zsh
	}

	#[cfg(not(target_os = "macos"))]
	fn default() -> Self {
		Self::Sh
	}
}

impl From<PathBuf> for Executable {
	fn from(path: PathBuf) -> Self {
		Self::Bin(path)
	}
}

impl From<&std::path::Path> for Executable {
	fn from(path: &std::path::Path) -> Self {
		Self::Bin(path.to_path_buf())
	}
}
