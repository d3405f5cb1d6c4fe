use std::ops::{Deref, DerefMut};

use crate::prelude::*;
use crate::procio::FdState;

/// Pops and restores a descriptor frame when dropped.
///
/// Obtained from [`FdState::scoped`], so every exit path out of the guarded
/// region puts the descriptor table back.
pub struct FdFrameGuard<'a> {
	fd_state: &'a mut FdState,
	armed: bool,
}

impl<'a> FdFrameGuard<'a> {
	pub(crate) fn new(fd_state: &'a mut FdState) -> Self {
		Self { fd_state, armed: true }
	}
	/// Keep the frame's redirects in place instead of restoring them
	pub fn persist(mut self) -> ShResult<()> {
		self.armed = false;
		self.fd_state.pop_and_forget()
	}
	/// Restore now, reporting failure instead of logging it
	pub fn restore(mut self) -> ShResult<()> {
		self.armed = false;
		self.fd_state.pop_and_restore()
	}
}

impl Deref for FdFrameGuard<'_> {
	type Target = FdState;
	fn deref(&self) -> &Self::Target {
		self.fd_state
	}
}

impl DerefMut for FdFrameGuard<'_> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.fd_state
	}
}

impl Drop for FdFrameGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			if let Err(e) = self.fd_state.pop_and_restore() {
				flog!(ERROR, "failed to restore descriptors: {}", e);
			}
		}
	}
}
