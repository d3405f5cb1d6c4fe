//! Descriptor bookkeeping for redirections.
//!
//! Every redirect applied in the shell process itself goes through
//! [`FdState`], which saves what it overwrites and puts it back in LIFO
//! order. Redirects for forked processes acquire their resources in the
//! parent and only touch the descriptor table inside the child.

use std::fmt::Debug;

use crate::ast::RedirOp;
use crate::libsh::guards::FdFrameGuard;
use crate::libsh::sys::{child_exit, dup_onto};
use crate::prelude::*;

/// Saved copies of overwritten descriptors are kept at or above this number
pub const SAVE_FD_BASE: RawFd = 10;

#[derive(Debug)]
enum SavedFd {
	/// `orig` was open; `copy` holds what it referred to and `flags` its
	/// descriptor flags
	Copy { copy: OwnedFd, orig: RawFd, flags: FdFlag },
	/// The descriptor was closed before the redirect
	Absent(RawFd),
}

impl SavedFd {
	fn orig(&self) -> RawFd {
		match self {
			Self::Copy { orig, .. } => *orig,
			Self::Absent(fd) => *fd,
		}
	}
	fn holds(&self, fd: RawFd) -> bool {
		matches!(self, Self::Copy { copy, .. } if copy.as_raw_fd() == fd)
	}
}

#[derive(Debug, Default)]
struct FdFrame {
	saved: Vec<SavedFd>,
	need_close: Vec<OwnedFd>,
}

#[derive(Debug)]
pub struct FdState {
	base: RawFd,
	frames: Vec<FdFrame>,
}

impl Default for FdState {
	fn default() -> Self {
		Self::new()
	}
}

impl FdState {
	pub fn new() -> Self {
		Self::with_base(SAVE_FD_BASE)
	}
	pub fn with_base(base: RawFd) -> Self {
		Self { base, frames: vec![] }
	}
	pub fn base(&self) -> RawFd {
		self.base
	}
	/// Number of open frames
	pub fn depth(&self) -> usize {
		self.frames.len()
	}
	pub fn push_frame(&mut self) {
		self.frames.push(FdFrame::default());
		flog!(TRACE, "pushed fd frame, depth {}", self.depth());
	}
	/// Push a frame that is popped and restored when the guard drops
	pub fn scoped(&mut self) -> FdFrameGuard<'_> {
		self.push_frame();
		FdFrameGuard::new(self)
	}

	fn cur_frame(&mut self) -> ShResult<&mut FdFrame> {
		self
			.frames
			.last_mut()
			.ok_or_else(|| ShErr::simple(ShErrKind::InternalErr, "no descriptor frame is open"))
	}

	fn is_saved_copy(&self, fd: RawFd) -> bool {
		self.frames.iter().flat_map(|frame| frame.saved.iter()).any(|saved| saved.holds(fd))
	}

	/// Point `dst` at whatever `src` refers to, remembering the old `dst`.
	///
	/// On failure nothing is recorded and the descriptor table is as it was.
	pub fn save_and_dup(&mut self, src: RawFd, dst: RawFd) -> ShResult<()> {
		if fcntl(src, FcntlArg::F_GETFD).is_err() {
			return Err(ShErr::simple(ShErrKind::BadFd(src), "source descriptor is not open"))
		}
		if self.is_saved_copy(dst) {
			return Err(ShErr::simple(ShErrKind::BadFd(dst), "descriptor is in use by the shell"))
		}
		// Fail before touching anything if there is no frame to record in
		self.cur_frame()?;

		let saving = |e: Errno| ShErr::from(e).with_note(format!("while saving descriptor {dst}"));
		let saved = match fcntl(dst, FcntlArg::F_GETFD) {
			Ok(bits) => {
				let copy = fcntl(dst, FcntlArg::F_DUPFD_CLOEXEC(self.base)).map_err(saving)?;
				SavedFd::Copy {
					copy: unsafe { OwnedFd::from_raw_fd(copy) },
					orig: dst,
					flags: FdFlag::from_bits_truncate(bits),
				}
			}
			Err(Errno::EBADF) => SavedFd::Absent(dst),
			Err(e) => return Err(saving(e)),
		};
		// On failure `saved` drops here, closing the copy
		dup2(src, dst).map_err(|e| ShErr::simple(ShErrKind::BadFd(src), e.desc()))?;

		flog!(TRACE, "fd {} now refers to fd {}, saved as {:?}", dst, src, saved);
		self.cur_frame()?.saved.push(saved);
		Ok(())
	}

	/// Close `fd` when the current frame is popped
	pub fn need_close(&mut self, fd: OwnedFd) -> ShResult<()> {
		self.cur_frame()?.need_close.push(fd);
		Ok(())
	}

	/// Move `fd` at or above the save base and close it when the frame pops.
	///
	/// Keeps descriptors the shell opened on its own behalf out of the range
	/// that redirects target.
	pub fn stash(&mut self, fd: OwnedFd) -> ShResult<RawFd> {
		let fd = lift(fd, self.base)?;
		let raw = fd.as_raw_fd();
		self.need_close(fd)?;
		Ok(raw)
	}

	/// Close every descriptor the frames hold apart from `keep`.
	///
	/// For a forked helper that must not keep the shell's pipes alive.
	pub(crate) fn close_all_in_child(&self, keep: RawFd) {
		for frame in &self.frames {
			let copies = frame.saved.iter().filter_map(|saved| match saved {
				SavedFd::Copy { copy, .. } => Some(copy.as_raw_fd()),
				SavedFd::Absent(_) => None,
			});
			let held = frame.need_close.iter().map(|fd| fd.as_raw_fd());
			for fd in copies.chain(held) {
				if fd != keep {
					let _ = close(fd);
				}
			}
		}
	}

	fn take_frame(&mut self) -> ShResult<FdFrame> {
		let frame = self
			.frames
			.pop()
			.ok_or_else(|| ShErr::simple(ShErrKind::InternalErr, "attempted to pop with no descriptor frame open"))?;
		flog!(TRACE, "popped fd frame, depth {}", self.depth());
		Ok(frame)
	}

	/// Undo every redirect in the current frame, newest first.
	///
	/// All saves are restored even if one fails; the first failure is
	/// returned.
	pub fn pop_and_restore(&mut self) -> ShResult<()> {
		let FdFrame { saved, need_close } = self.take_frame()?;
		let mut result = Ok(());
		for saved in saved.into_iter().rev() {
			let orig = saved.orig();
			let restored = match saved {
				// dup2 clears close-on-exec, so the flags are put back by hand
				SavedFd::Copy { copy, orig, flags } => {
					dup2(copy.as_raw_fd(), orig).and_then(|_| fcntl(orig, FcntlArg::F_SETFD(flags))).map(|_| ())
				}
				SavedFd::Absent(fd) => match close(fd) {
					Err(Errno::EBADF) => Ok(()),
					res => res,
				},
			};
			if let Err(e) = restored {
				flog!(ERROR, "failed to restore fd {}: {}", orig, e);
				if result.is_ok() {
					result = Err(ShErr::from(e).with_note(format!("while restoring descriptor {orig}")));
				}
			}
		}
		drop(need_close);
		result
	}

	/// Drop the current frame, keeping its redirects in place for good
	pub fn pop_and_forget(&mut self) -> ShResult<()> {
		let frame = self.take_frame()?;
		flog!(TRACE, "keeping {} redirects", frame.saved.len());
		Ok(())
	}
}

/// A redirect that can be applied to a forked child or to the shell itself.
///
/// For a child, [`Redirect::before_fork`] acquires resources in the parent
/// (so a bad path fails before anything is spawned) and
/// [`Redirect::apply_in_child`] wires them up after the fork.
pub trait Redirect: Debug {
	fn tgt_fd(&self) -> RawFd;
	fn before_fork(&mut self, _fd_state: &mut FdState) -> ShResult<()> {
		Ok(())
	}
	fn apply_in_child(&self) -> ShResult<()>;
	fn after_fork_in_parent(&mut self) -> ShResult<()> {
		Ok(())
	}
	fn apply_in_parent(&mut self, fd_state: &mut FdState) -> ShResult<()>;
	/// Wait for any helper process the redirect started
	fn reap(&mut self) -> ShResult<()> {
		Ok(())
	}
	/// Hand over a helper process that has to outlive the redirect, leaving
	/// the caller to reap it
	fn detach(&mut self) -> Option<Pid> {
		None
	}
}

/// Move `fd` to the lowest free descriptor at or above `base`
fn lift(fd: OwnedFd, base: RawFd) -> ShResult<OwnedFd> {
	if fd.as_raw_fd() >= base {
		return Ok(fd)
	}
	let high = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(base))?;
	Ok(unsafe { OwnedFd::from_raw_fd(high) })
}

#[derive(Debug)]
pub struct FilenameRedirect {
	op: RedirOp,
	tgt_fd: RawFd,
	path: PathBuf,
	src: Option<RawFd>,
}

impl FilenameRedirect {
	pub fn new(op: RedirOp, tgt_fd: RawFd, path: impl Into<PathBuf>) -> Self {
		Self { op, tgt_fd, path: path.into(), src: None }
	}
	fn open(&self) -> ShResult<File> {
		let mut opts = OpenOptions::new();
		match self.op {
			RedirOp::Output => opts.write(true).create(true).truncate(true),
			RedirOp::Append => opts.append(true).create(true),
			RedirOp::ReadWrite => opts.read(true).write(true).create(true),
			_ => opts.read(true),
		};
		opts.open(&self.path).map_err(|e| ShErr::from(e).with_note(self.path.display().to_string()))
	}
	fn stash_file(&mut self, fd_state: &mut FdState) -> ShResult<RawFd> {
		let file = self.open()?;
		let src = fd_state.stash(OwnedFd::from(file))?;
		self.src = Some(src);
		Ok(src)
	}
}

impl Redirect for FilenameRedirect {
	fn tgt_fd(&self) -> RawFd {
		self.tgt_fd
	}
	fn before_fork(&mut self, fd_state: &mut FdState) -> ShResult<()> {
		self.stash_file(fd_state)?;
		Ok(())
	}
	fn apply_in_child(&self) -> ShResult<()> {
		let src = self
			.src
			.ok_or_else(|| ShErr::simple(ShErrKind::InternalErr, "file redirect applied before it was opened"))?;
		dup_onto(src, self.tgt_fd)
	}
	fn apply_in_parent(&mut self, fd_state: &mut FdState) -> ShResult<()> {
		let src = self.stash_file(fd_state)?;
		fd_state.save_and_dup(src, self.tgt_fd)
	}
}

/// `N>&M`. Also wires pipeline stages together.
#[derive(Debug)]
pub struct DescriptorRedirect {
	tgt_fd: RawFd,
	src_fd: RawFd,
}

impl DescriptorRedirect {
	pub fn new(tgt_fd: RawFd, src_fd: RawFd) -> Self {
		Self { tgt_fd, src_fd }
	}
	pub fn src_fd(&self) -> RawFd {
		self.src_fd
	}
}

impl Redirect for DescriptorRedirect {
	fn tgt_fd(&self) -> RawFd {
		self.tgt_fd
	}
	fn apply_in_child(&self) -> ShResult<()> {
		dup_onto(self.src_fd, self.tgt_fd)
	}
	fn apply_in_parent(&mut self, fd_state: &mut FdState) -> ShResult<()> {
		fd_state.save_and_dup(self.src_fd, self.tgt_fd)
	}
}

/// `<<`. The body is fed through a pipe.
///
/// Bodies that fit in the pipe buffer are written up front. Larger ones are
/// written by a forked helper so the reader never deadlocks against us.
#[derive(Debug)]
pub struct HereDocRedirect {
	tgt_fd: RawFd,
	body: String,
	read_end: Option<RawFd>,
	writer: Option<Pid>,
}

impl HereDocRedirect {
	pub fn new(tgt_fd: RawFd, body: impl Into<String>) -> Self {
		Self { tgt_fd, body: body.into(), read_end: None, writer: None }
	}

	fn feed(&mut self, fd_state: &mut FdState) -> ShResult<RawFd> {
		let (r_pipe, w_pipe) = pipe2(OFlag::O_CLOEXEC)?;
		let read_end = fd_state.stash(r_pipe)?;
		self.read_end = Some(read_end);

		if self.body.len() <= libc::PIPE_BUF {
			let mut writer = File::from(w_pipe);
			writer.write_all(self.body.as_bytes())?;
			return Ok(read_end)
		}

		match unsafe { fork()? } {
			ForkResult::Child => {
				// Holding the read end or another stage's pipe would keep a
				// finished reader's writers from seeing a broken pipe
				fd_state.close_all_in_child(w_pipe.as_raw_fd());
				let mut writer = File::from(w_pipe);
				let code = if writer.write_all(self.body.as_bytes()).is_ok() { 0 } else { 1 };
				child_exit(code)
			}
			ForkResult::Parent { child } => {
				flog!(DEBUG, "here document writer started as {}", child);
				self.writer = Some(child);
			}
		}
		Ok(read_end)
	}
}

impl Redirect for HereDocRedirect {
	fn tgt_fd(&self) -> RawFd {
		self.tgt_fd
	}
	fn before_fork(&mut self, fd_state: &mut FdState) -> ShResult<()> {
		self.feed(fd_state)?;
		Ok(())
	}
	fn apply_in_child(&self) -> ShResult<()> {
		let src = self
			.read_end
			.ok_or_else(|| ShErr::simple(ShErrKind::InternalErr, "here document applied before it was fed"))?;
		dup_onto(src, self.tgt_fd)
	}
	fn apply_in_parent(&mut self, fd_state: &mut FdState) -> ShResult<()> {
		let src = self.feed(fd_state)?;
		fd_state.save_and_dup(src, self.tgt_fd)
	}
	fn reap(&mut self) -> ShResult<()> {
		let Some(pid) = self.writer.take() else { return Ok(()) };
		loop {
			match waitpid(pid, None) {
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(e.into()),
				Ok(status) => {
					flog!(DEBUG, "here document writer {} finished: {:?}", pid, status);
					return Ok(())
				}
			}
		}
	}
	fn detach(&mut self) -> Option<Pid> {
		self.writer.take()
	}
}

/// Sends a child's stdout back to the shell, the basis of command
/// substitution.
///
/// The parent closes its write end after the fork and collects everything
/// in [`CaptureRedirect::drain`].
#[derive(Debug, Default)]
pub struct CaptureRedirect {
	read_end: Option<OwnedFd>,
	write_end: Option<OwnedFd>,
	output: Vec<u8>,
}

impl CaptureRedirect {
	pub fn new() -> Self {
		Self::default()
	}
	/// Read until every writer has closed its end
	pub fn drain(&mut self) -> ShResult<()> {
		self.write_end = None;
		let Some(read_end) = self.read_end.take() else { return Ok(()) };
		File::from(read_end).read_to_end(&mut self.output)?;
		flog!(DEBUG, "captured {} bytes", self.output.len());
		Ok(())
	}
	pub fn output(&self) -> String {
		String::from_utf8_lossy(&self.output).into_owned()
	}
}

impl Redirect for CaptureRedirect {
	fn tgt_fd(&self) -> RawFd {
		STDOUT_FILENO
	}
	fn before_fork(&mut self, fd_state: &mut FdState) -> ShResult<()> {
		let (r_pipe, w_pipe) = pipe2(OFlag::O_CLOEXEC)?;
		self.read_end = Some(lift(r_pipe, fd_state.base())?);
		self.write_end = Some(lift(w_pipe, fd_state.base())?);
		Ok(())
	}
	fn apply_in_child(&self) -> ShResult<()> {
		let (Some(read_end), Some(write_end)) = (&self.read_end, &self.write_end) else {
			return Err(ShErr::simple(ShErrKind::InternalErr, "output captured before its pipe was made"))
		};
		dup_onto(write_end.as_raw_fd(), STDOUT_FILENO)?;
		let _ = close(read_end.as_raw_fd());
		let _ = close(write_end.as_raw_fd());
		Ok(())
	}
	fn after_fork_in_parent(&mut self) -> ShResult<()> {
		self.write_end = None;
		Ok(())
	}
	fn apply_in_parent(&mut self, _fd_state: &mut FdState) -> ShResult<()> {
		Err(ShErr::simple(ShErrKind::InternalErr, "output capture needs a child process"))
	}
}
