use std::os::fd::{BorrowedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::unistd::dup2;

use super::error::{ShErr, ShErrKind, ShResult};

/// Borrow a raw descriptor for the nix calls that want `AsFd`
pub fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
	unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Whether `fd` currently names an open descriptor
pub fn fd_is_open(fd: RawFd) -> bool {
	fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Make `tgt` refer to what `src` refers to, for use in a forked child.
///
/// When the two are already the same number the close-on-exec flag is
/// cleared instead, since descriptors opened by the parent carry it.
pub fn dup_onto(src: RawFd, tgt: RawFd) -> ShResult<()> {
	if src == tgt {
		fcntl(tgt, FcntlArg::F_SETFD(FdFlag::empty()))
			.map_err(|_| ShErr::simple(ShErrKind::BadFd(src), "cannot duplicate descriptor"))?;
		return Ok(())
	}
	dup2(src, tgt).map_err(|e| ShErr::simple(ShErrKind::BadFd(src), e.desc()))?;
	Ok(())
}

/// Leave a forked child without running the parent's exit handlers
pub fn child_exit(code: i32) -> ! {
	unsafe { libc::_exit(code) }
}
