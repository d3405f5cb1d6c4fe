// Standard library IO and FS abstractions
pub use std::collections::HashMap;
pub use std::ffi::CString;
pub use std::fmt;
pub use std::fs::{File, OpenOptions};
pub use std::io::{self, Read, Write};
pub use std::mem;
pub use std::path::{Path, PathBuf};

// Unix-specific IO abstractions
pub use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

// Nix crate for POSIX APIs
pub use bitflags::bitflags;
pub use nix::{
	errno::Errno,
	fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
	libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO},
	sys::{
		signal::{signal, SigHandler, Signal},
		wait::{waitpid, WaitStatus as WtStat},
	},
	unistd::{close, dup2, execvpe, fork, pipe2, ForkResult, Pid},
};

pub use crate::flog;
pub use crate::libsh::error::{ShErr, ShErrKind, ShResult, ShResultExt};
pub use crate::libsh::flog::KelpLogLevel::*;
