use std::collections::BTreeMap;

use crate::ast::Node;
use crate::execute::Executor;
use crate::libsh::sys::child_exit;
use crate::prelude::*;
use crate::procio::{CaptureRedirect, DescriptorRedirect, Redirect};

/// Added to the signal number when a child is killed by a signal
pub const SIG_EXIT_OFFSET: i32 = 128;
pub const EXIT_NOT_FOUND: i32 = 127;
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

pub struct DisplayWaitStatus(pub WtStat);

impl fmt::Display for DisplayWaitStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.0 {
			WtStat::Exited(_, code) => match code {
				0 => write!(f, "done"),
				_ => write!(f, "failed: {}", code),
			},
			WtStat::Signaled(_, signal, _) => write!(f, "signaled: {:?}", signal),
			WtStat::Stopped(_, signal) => write!(f, "stopped: {:?}", signal),
			WtStat::Continued(_) => write!(f, "continued"),
			_ => write!(f, "running"),
		}
	}
}

/// The shell status for a wait result
pub fn status_code(stat: WtStat) -> i32 {
	match stat {
		WtStat::Exited(_, code) => code,
		WtStat::Signaled(_, signal, _) | WtStat::Stopped(_, signal) => SIG_EXIT_OFFSET + signal as i32,
		_ => 0,
	}
}

/// Everything `execvpe` needs, converted ahead of the fork
#[derive(Debug)]
pub struct ExecArgs {
	cmd: CString,
	argv: Vec<CString>,
	envp: Vec<CString>,
}

impl ExecArgs {
	pub fn new(argv: &[String], env: &BTreeMap<String, String>) -> ShResult<Self> {
		let to_cstring = |s: String| {
			CString::new(s).map_err(|_| ShErr::simple(ShErrKind::ExecFail, "argument contains a nul byte"))
		};
		let argv = argv.iter().cloned().map(to_cstring).collect::<ShResult<Vec<_>>>()?;
		let cmd = argv
			.first()
			.cloned()
			.ok_or_else(|| ShErr::simple(ShErrKind::InternalErr, "empty argument vector"))?;
		let envp = env
			.iter()
			.map(|(name, val)| to_cstring(format!("{name}={val}")))
			.collect::<ShResult<Vec<_>>>()?;
		Ok(Self { cmd, argv, envp })
	}
	pub fn cmd(&self) -> &str {
		self.cmd.to_str().unwrap_or_default()
	}
}

/// What a forked child runs once its descriptors are in place
#[derive(Debug)]
pub enum Thunk {
	External(ExecArgs),
	/// Re-run a node with the child's copy of the executor
	SubProgram(Node),
}

impl Thunk {
	pub fn run_in_child(self, ex: &mut Executor) -> ! {
		match self {
			Self::External(args) => {
				// Rust ignores SIGPIPE; exec'd programs expect the default
				unsafe {
					let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
				}
				let errno = match execvpe(&args.cmd, &args.argv, &args.envp) {
					Ok(never) => match never {},
					Err(errno) => errno,
				};
				let cmd = args.cmd();
				let (err, code) = match errno {
					Errno::ENOENT if !cmd.contains('/') => {
						(ShErr::bare(ShErrKind::CmdNotFound(cmd.to_string())), EXIT_NOT_FOUND)
					}
					Errno::ENOENT => (ShErr::simple(ShErrKind::FileNotFound, cmd), EXIT_NOT_FOUND),
					Errno::EACCES | Errno::ENOEXEC | Errno::EISDIR => {
						(ShErr::simple(ShErrKind::BadPermission, cmd), EXIT_NOT_EXECUTABLE)
					}
					errno => (ShErr::simple(ShErrKind::Errno(errno), cmd), EXIT_NOT_EXECUTABLE),
				};
				err.print_error();
				child_exit(code)
			}
			Self::SubProgram(node) => {
				let status = ex.execute(&node);
				let _ = io::stdout().flush();
				child_exit(status)
			}
		}
	}
}

/// One forked child: what it runs and the redirects it runs under
#[derive(Debug)]
pub struct Process {
	thunk: Option<Thunk>,
	redirects: Vec<Box<dyn Redirect>>,
	/// Shell-side descriptors the child must not keep, such as other pipes
	close_in_child: Vec<RawFd>,
	capture: Option<CaptureRedirect>,
	pid: Option<Pid>,
}

impl Process {
	pub fn new(thunk: Thunk) -> Self {
		Self { thunk: Some(thunk), redirects: vec![], close_in_child: vec![], capture: None, pid: None }
	}
	pub fn with_redirects(self, redirects: Vec<Box<dyn Redirect>>) -> Self {
		Self { redirects, ..self }
	}
	pub fn add_redirect(&mut self, redirect: Box<dyn Redirect>) {
		self.redirects.push(redirect);
	}
	/// Apply `redirect` before any of the process's own redirects
	pub fn prepend_redirect(&mut self, redirect: Box<dyn Redirect>) {
		self.redirects.insert(0, redirect);
	}
	pub fn close_in_child(&mut self, fd: RawFd) {
		self.close_in_child.push(fd);
	}
	pub fn pid(&self) -> Option<Pid> {
		self.pid
	}
	/// Collect the child's stdout instead of passing it through. The child's
	/// own redirects still apply on top.
	pub fn capture_output(&mut self) {
		self.capture = Some(CaptureRedirect::new());
	}
	/// What the child wrote, once it has been waited for
	pub fn captured(&self) -> Option<String> {
		self.capture.as_ref().map(CaptureRedirect::output)
	}
	fn drain_capture(&mut self) -> ShResult<()> {
		match self.capture.as_mut() {
			Some(capture) => capture.drain(),
			None => Ok(()),
		}
	}

	/// Fork the child. Redirect resources are acquired inside a descriptor
	/// frame first, so a bad redirect fails here without forking, and the
	/// parent's copies are released once the child has its own.
	pub fn start(&mut self, ex: &mut Executor) -> ShResult<Pid> {
		let thunk = self
			.thunk
			.take()
			.ok_or_else(|| ShErr::simple(ShErrKind::InternalErr, "process was already started"))?;

		ex.fd_state.push_frame();
		let forked = self.prepare_and_fork(thunk, ex);
		let restored = ex.fd_state.pop_and_restore();

		if forked.is_err() {
			self.reap_redirects();
		}
		let pid = forked?;
		restored?;
		self.pid = Some(pid);
		Ok(pid)
	}

	fn prepare_and_fork(&mut self, thunk: Thunk, ex: &mut Executor) -> ShResult<Pid> {
		for redirect in self.redirects.iter_mut() {
			redirect.before_fork(&mut ex.fd_state)?;
		}
		// Last, so no here document writer inherits the capture pipe
		if let Some(capture) = self.capture.as_mut() {
			capture.before_fork(&mut ex.fd_state)?;
		}
		// Anything still buffered would be written twice
		let _ = io::stdout().flush();

		match unsafe { fork()? } {
			ForkResult::Child => {
				let capture = self.capture.iter().map(|c| c as &dyn Redirect);
				let redirects = self.redirects.iter().map(|r| &**r as &dyn Redirect);
				for redirect in capture.chain(redirects) {
					if let Err(e) = redirect.apply_in_child() {
						e.print_error();
						child_exit(1)
					}
				}
				let mut targets = self.redirects.iter().map(|r| r.tgt_fd()).collect::<Vec<_>>();
				if self.capture.is_some() {
					targets.push(STDOUT_FILENO);
				}
				for fd in &self.close_in_child {
					if !targets.contains(fd) {
						let _ = close(*fd);
					}
				}
				thunk.run_in_child(ex)
			}
			ForkResult::Parent { child } => {
				flog!(DEBUG, "forked {:?} as {}", thunk, child);
				for redirect in self.redirects.iter_mut() {
					redirect.after_fork_in_parent()?;
				}
				if let Some(capture) = self.capture.as_mut() {
					capture.after_fork_in_parent()?;
				}
				Ok(child)
			}
		}
	}

	fn reap_redirects(&mut self) {
		for redirect in self.redirects.iter_mut() {
			if let Err(e) = redirect.reap() {
				flog!(WARN, "failed to reap redirect helper: {}", e);
			}
		}
	}

	pub fn wait(&mut self) -> ShResult<WtStat> {
		let pid = self
			.pid
			.ok_or_else(|| ShErr::simple(ShErrKind::InternalErr, "waited on a process that never started"))?;
		// A child blocked on a full capture pipe would never exit
		let drained = self.drain_capture();
		let status = loop {
			match waitpid(pid, None) {
				Err(Errno::EINTR) => continue,
				res => break res,
			}
		};
		self.reap_redirects();
		let status = status?;
		flog!(DEBUG, "process {} {}", pid, DisplayWaitStatus(status));
		drained?;
		Ok(status)
	}

	/// Start the process and wait for it
	pub fn run(&mut self, ex: &mut Executor) -> ShResult<i32> {
		self.start(ex)?;
		Ok(status_code(self.wait()?))
	}
}

/// Processes connected stdout to stdin, left to right
#[derive(Debug, Default)]
pub struct Pipeline {
	procs: Vec<Process>,
	pipe_status: Vec<i32>,
}

impl Pipeline {
	pub fn new() -> Self {
		Self::default()
	}
	pub fn add(&mut self, proc: Process) {
		self.procs.push(proc);
	}
	pub fn len(&self) -> usize {
		self.procs.len()
	}
	pub fn is_empty(&self) -> bool {
		self.procs.is_empty()
	}
	pub fn procs(&self) -> &[Process] {
		&self.procs
	}
	/// Status of each stage from the last run, in stage order
	pub fn pipe_status(&self) -> &[i32] {
		&self.pipe_status
	}
	/// Collect what the last stage writes to stdout
	pub fn capture_output(&mut self) {
		if let Some(last) = self.procs.last_mut() {
			last.capture_output();
		}
	}
	pub fn captured(&self) -> Option<String> {
		self.procs.last().and_then(Process::captured)
	}

	/// Run every stage and return the status of the last one.
	///
	/// A stage that fails to start gets its error's status; the others still
	/// run and are waited for.
	pub fn run(&mut self, ex: &mut Executor) -> ShResult<i32> {
		if self.procs.is_empty() {
			return Ok(0)
		}
		ex.fd_state.push_frame();
		let started = self.wire_and_start(ex);
		// Closes the parent's pipe ends, so readers can see end of file
		let restored = ex.fd_state.pop_and_restore();
		let mut statuses = started?;
		// Before any wait, since the last stage may be blocked on a full pipe
		let drained = self.procs.last_mut().map_or(Ok(()), Process::drain_capture);

		for (proc, status) in self.procs.iter_mut().zip(statuses.iter_mut()) {
			if status.is_some() {
				continue
			}
			*status = Some(match proc.wait() {
				Ok(stat) => status_code(stat),
				Err(e) => {
					e.print_error();
					1
				}
			});
		}

		self.pipe_status = statuses.into_iter().map(|s| s.unwrap_or(1)).collect();
		flog!(DEBUG, "pipeline statuses {:?}", self.pipe_status);
		// Only reported once every started stage has been waited for
		restored?;
		drained?;
		Ok(self.pipe_status.last().copied().unwrap_or(0))
	}

	/// Connect the stages and fork them. A `Some` entry is the status of a
	/// stage that never started.
	fn wire_and_start(&mut self, ex: &mut Executor) -> ShResult<Vec<Option<i32>>> {
		let mut pipe_fds = vec![];
		for i in 1..self.procs.len() {
			let (r_pipe, w_pipe) = pipe2(OFlag::O_CLOEXEC)?;
			let r_pipe = ex.fd_state.stash(r_pipe)?;
			let w_pipe = ex.fd_state.stash(w_pipe)?;
			self.procs[i - 1].prepend_redirect(Box::new(DescriptorRedirect::new(STDOUT_FILENO, w_pipe)));
			self.procs[i].prepend_redirect(Box::new(DescriptorRedirect::new(STDIN_FILENO, r_pipe)));
			pipe_fds.extend([r_pipe, w_pipe]);
		}

		let mut statuses = vec![];
		for proc in self.procs.iter_mut() {
			for fd in &pipe_fds {
				proc.close_in_child(*fd);
			}
			match proc.start(ex) {
				Ok(_) => statuses.push(None),
				Err(e) => {
					e.print_error();
					statuses.push(Some(e.status()));
				}
			}
		}
		Ok(statuses)
	}
}
