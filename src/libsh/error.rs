use std::fmt::{self, Display};
use std::io;
use std::os::fd::RawFd;

use nix::errno::Errno;

use super::term::{Style, Styled};

pub type ShResult<T> = Result<T, ShErr>;

pub trait ShResultExt {
	/// Attach a note to the error, if there is one
	fn noted(self, note: impl Into<String>) -> Self;
}

impl<T> ShResultExt for Result<T, ShErr> {
	fn noted(self, note: impl Into<String>) -> Self {
		self.map_err(|e| e.with_note(note))
	}
}

#[derive(Debug)]
pub struct ShErr {
	kind: ShErrKind,
	notes: Vec<String>,
}

impl ShErr {
	pub fn simple(kind: ShErrKind, msg: impl Into<String>) -> Self {
		Self { kind, notes: vec![msg.into()] }
	}
	/// An error with no message. Used for the control flow signals.
	pub fn bare(kind: ShErrKind) -> Self {
		Self { kind, notes: vec![] }
	}
	pub fn with_note(self, note: impl Into<String>) -> Self {
		let ShErr { kind, mut notes } = self;
		notes.push(note.into());
		Self { kind, notes }
	}
	pub fn kind(&self) -> &ShErrKind {
		&self.kind
	}
	pub fn notes(&self) -> &[String] {
		&self.notes
	}
	/// A broken invariant inside the core, as opposed to bad user input
	pub fn is_fatal(&self) -> bool {
		matches!(self.kind, ShErrKind::InternalErr)
	}
	pub fn is_control_flow(&self) -> bool {
		matches!(
			self.kind,
			ShErrKind::CleanExit(_)
				| ShErrKind::FuncReturn(_)
				| ShErrKind::LoopBreak(_)
				| ShErrKind::LoopContinue(_)
		)
	}
	/// Errors that end the current command with a status instead of unwinding
	pub fn is_recoverable(&self) -> bool {
		!self.is_fatal() && !self.is_control_flow()
	}
	/// The exit status a command reports when it fails with this error
	pub fn status(&self) -> i32 {
		match self.kind {
			ShErrKind::CmdNotFound(_) => 127,
			ShErrKind::BadPermission => 126,
			ShErrKind::CleanExit(code) | ShErrKind::FuncReturn(code) => code,
			_ => 1,
		}
	}
	pub fn print_error(&self) {
		let prefix = "kelp".styled(Style::Bold);
		if self.is_fatal() {
			eprintln!("{prefix}: {}: {self}", "fatal".styled(Style::Red | Style::Bold));
		} else {
			eprintln!("{prefix}: {self}");
		}
		for note in self.notes.iter().skip(1) {
			eprintln!("  {}: {note}", "note".styled(Style::Green));
		}
	}
}

impl Display for ShErr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.notes.first() {
			Some(note) if !note.is_empty() => write!(f, "{} - {}", self.kind, note),
			_ => write!(f, "{}", self.kind),
		}
	}
}

impl std::error::Error for ShErr {}

impl From<io::Error> for ShErr {
	fn from(e: io::Error) -> Self {
		let kind = match e.kind() {
			io::ErrorKind::NotFound => ShErrKind::FileNotFound,
			io::ErrorKind::PermissionDenied => ShErrKind::BadPermission,
			kind => ShErrKind::IoErr(kind),
		};
		ShErr::simple(kind, e.to_string())
	}
}

impl From<Errno> for ShErr {
	fn from(value: Errno) -> Self {
		ShErr::simple(ShErrKind::Errno(value), value.desc())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShErrKind {
	IoErr(io::ErrorKind),
	Errno(Errno),
	BadFd(RawFd),
	FileNotFound,
	BadPermission,
	CmdNotFound(String),
	ExecFail,
	ExpansionErr,
	InvalidOpt,
	InternalErr,

	// Not really errors, more like internal signals
	CleanExit(i32),
	FuncReturn(i32),
	LoopContinue(i32),
	LoopBreak(i32),
}

impl Display for ShErrKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::IoErr(e) => write!(f, "I/O Error: {e}"),
			Self::Errno(e) => write!(f, "Errno: {}", e.desc()),
			Self::BadFd(fd) => write!(f, "{fd}: Bad file descriptor"),
			Self::FileNotFound => write!(f, "File not found"),
			Self::BadPermission => write!(f, "Permission denied"),
			Self::CmdNotFound(cmd) => write!(f, "{cmd}: command not found"),
			Self::ExecFail => write!(f, "Execution failed"),
			Self::ExpansionErr => write!(f, "Expansion error"),
			Self::InvalidOpt => write!(f, "Invalid option"),
			Self::InternalErr => write!(f, "Internal error"),
			Self::CleanExit(_) => write!(f, "exit"),
			Self::FuncReturn(_) => write!(f, "return: can only `return' from a function"),
			Self::LoopContinue(_) => write!(f, "continue: only meaningful in a loop"),
			Self::LoopBreak(_) => write!(f, "break: only meaningful in a loop"),
		}
	}
}
