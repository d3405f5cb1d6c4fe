use std::rc::Rc;

use glob::Pattern;
use nix::sys::wait::WaitPidFlag;

use crate::ast::{
	Assign, CaseArm, ConjunctNode, ConjunctOp, CondNode, FlowKind, LoopKind, NdRule, Node, RedirNode, RedirOp, Word,
};
use crate::expand::Expander;
use crate::jobs::{ExecArgs, Pipeline, Process, Thunk};
use crate::prelude::*;
use crate::procio::{DescriptorRedirect, FdState, FilenameRedirect, HereDocRedirect, Redirect};
use crate::shopt::ExecOpts;
use crate::state::{Mem, VarVal};

/// Commands that run inside the shell process
pub trait Builtins {
	fn is_builtin(&self, name: &str) -> bool;
	/// Run `argv`, whose first element is the builtin's name
	fn run(&mut self, argv: &[String], mem: &mut Mem) -> ShResult<i32>;
	/// Whether the builtin's redirects outlive it, as with a bare `exec`
	fn persists_redirects(&self, _argv: &[String]) -> bool {
		false
	}
}

#[derive(Debug, Default)]
pub struct NoBuiltins;

impl Builtins for NoBuiltins {
	fn is_builtin(&self, _name: &str) -> bool {
		false
	}
	fn run(&mut self, argv: &[String], _mem: &mut Mem) -> ShResult<i32> {
		let name = argv.first().cloned().unwrap_or_default();
		Err(ShErr::bare(ShErrKind::CmdNotFound(name)))
	}
}

enum LoopCtl {
	Proceed(i32),
	Break,
	Continue,
}

pub struct Executor {
	pub(crate) mem: Mem,
	pub(crate) fd_state: FdState,
	builtins: Box<dyn Builtins>,
	funcs: HashMap<String, Rc<Node>>,
	opts: ExecOpts,
	/// Nesting of contexts whose failures do not trigger errexit
	cond_depth: usize,
	loop_depth: usize,
	/// Here document writers feeding descriptors that `exec` kept open
	helpers: Vec<Pid>,
}

impl Executor {
	pub fn new(mem: Mem) -> Self {
		Self {
			mem,
			fd_state: FdState::new(),
			builtins: Box::new(NoBuiltins),
			funcs: HashMap::new(),
			opts: ExecOpts::default(),
			cond_depth: 0,
			loop_depth: 0,
			helpers: vec![],
		}
	}
	pub fn with_builtins(self, builtins: Box<dyn Builtins>) -> Self {
		Self { builtins, ..self }
	}
	pub fn with_fd_state(self, fd_state: FdState) -> Self {
		Self { fd_state, ..self }
	}
	pub fn mem(&self) -> &Mem {
		&self.mem
	}
	pub fn mem_mut(&mut self) -> &mut Mem {
		&mut self.mem
	}
	pub fn fd_state(&self) -> &FdState {
		&self.fd_state
	}
	pub fn opts(&self) -> ExecOpts {
		self.opts
	}
	pub fn opts_mut(&mut self) -> &mut ExecOpts {
		&mut self.opts
	}
	pub fn has_func(&self, name: &str) -> bool {
		self.funcs.contains_key(name)
	}
	/// Helper processes started for persisted redirects and not yet reaped
	pub fn pending_helpers(&self) -> usize {
		self.helpers.len()
	}

	/// Run a node to completion and return its status.
	///
	/// Errors never escape: they are reported on stderr and become a status.
	/// `exit` yields its code.
	pub fn execute(&mut self, node: &Node) -> i32 {
		self.reap_helpers();
		let status = match self.dispatch_node(node) {
			Ok(status) => status,
			Err(e) => match e.kind() {
				ShErrKind::CleanExit(code) => *code,
				_ => {
					e.print_error();
					1
				}
			},
		};
		self.mem.set_last_status(status);
		status
	}

	/// Run `node` in a child and collect what it writes to stdout, as a
	/// command substitution does. Trailing newlines are kept.
	pub fn capture(&mut self, node: &Node) -> ShResult<(i32, String)> {
		let mut proc = self.process_for_node(node);
		proc.capture_output();
		let status = proc.run(self)?;
		Ok((status, proc.captured().unwrap_or_default()))
	}

	fn reap_helpers(&mut self) {
		self.helpers.retain(|pid| match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
			Ok(WtStat::StillAlive) | Err(Errno::EINTR) => true,
			Ok(status) => {
				flog!(DEBUG, "helper {} finished: {:?}", pid, status);
				false
			}
			Err(e) => {
				flog!(WARN, "lost track of helper {}: {}", pid, e);
				false
			}
		});
	}

	fn expander(&self) -> Expander<'_> {
		Expander::new(&self.mem).nounset(self.opts.contains(ExecOpts::NOUNSET))
	}

	/// Run a node, turning recoverable errors into a status. Control flow
	/// and fatal errors propagate.
	pub fn dispatch_node(&mut self, node: &Node) -> ShResult<i32> {
		let redirs = node.redirs.as_slice();
		let result = match &node.class {
			NdRule::Command { assignments, argv } => self.exec_cmd(assignments, argv, redirs),
			NdRule::Assignment { pairs, local } => self.exec_assignment(pairs, *local, redirs),
			NdRule::Pipeline { cmds, negated } => self.exec_pipeline(cmds, *negated),
			NdRule::AndOr { elements } => self.with_redirects(redirs, |ex| ex.exec_conjunction(elements)),
			NdRule::CommandList { body } | NdRule::BraceGroup { body } => {
				self.with_redirects(redirs, |ex| ex.exec_list(body))
			}
			NdRule::Subshell { body } => self.exec_subshell(body, redirs),
			NdRule::If { arms, else_block } => self.with_redirects(redirs, |ex| ex.exec_if(arms, else_block)),
			NdRule::Loop { kind, cond_node } => self.with_redirects(redirs, |ex| ex.exec_loop(*kind, cond_node)),
			NdRule::ForEach { var, words, body } => {
				self.with_redirects(redirs, |ex| ex.exec_for(var, words.as_deref(), body))
			}
			NdRule::Case { word, arms } => self.with_redirects(redirs, |ex| ex.exec_case(word, arms)),
			NdRule::FuncDef { name, body } => {
				self.funcs.insert(name.clone(), Rc::new((**body).clone()));
				Ok(0)
			}
			NdRule::ControlFlow { kind, arg } => self.exec_flow(*kind, arg.as_ref()),
			NdRule::NoOp => self.with_redirects(redirs, |_| Ok(0)),
		};

		let status = match result {
			Ok(status) => status,
			Err(e) if e.is_recoverable() => {
				e.print_error();
				e.status()
			}
			Err(e) => return Err(e),
		};
		self.mem.set_last_status(status);
		Ok(status)
	}

	/// Run `f` with `redirs` applied to the shell itself
	fn with_redirects<T>(
		&mut self,
		redirs: &[RedirNode],
		f: impl FnOnce(&mut Self) -> ShResult<T>,
	) -> ShResult<T> {
		if redirs.is_empty() {
			return f(self)
		}
		let mut redirects = self.eval_redirects(redirs)?;
		self.fd_state.push_frame();
		let mut this = scopeguard::guard(self, |this| {
			let _ = io::stdout().flush();
			if let Err(e) = this.fd_state.pop_and_restore() {
				e.print_error();
			}
		});

		let result = redirects
			.iter_mut()
			.try_for_each(|redirect| redirect.apply_in_parent(&mut this.fd_state))
			.and_then(|_| f(&mut **this));
		drop(this);

		for redirect in redirects.iter_mut() {
			if let Err(e) = redirect.reap() {
				flog!(WARN, "failed to reap redirect helper: {}", e);
			}
		}
		result
	}

	fn eval_redirects(&self, redirs: &[RedirNode]) -> ShResult<Vec<Box<dyn Redirect>>> {
		let expander = self.expander();
		let mut redirects: Vec<Box<dyn Redirect>> = vec![];
		for redir in redirs {
			let tgt_fd = redir.tgt_fd();
			let arg = expander.eval_word(&redir.arg)?;
			let redirect: Box<dyn Redirect> = match redir.op {
				RedirOp::DupOut | RedirOp::DupIn => {
					let src_fd = arg
						.parse::<RawFd>()
						.map_err(|_| ShErr::simple(ShErrKind::ExpansionErr, format!("{arg}: ambiguous redirect")))?;
					Box::new(DescriptorRedirect::new(tgt_fd, src_fd))
				}
				RedirOp::HereDoc => Box::new(HereDocRedirect::new(tgt_fd, arg)),
				op => {
					if arg.is_empty() {
						return Err(ShErr::simple(ShErrKind::ExpansionErr, "ambiguous redirect"))
					}
					Box::new(FilenameRedirect::new(op, tgt_fd, arg))
				}
			};
			redirects.push(redirect);
		}
		Ok(redirects)
	}

	fn eval_assigns(&self, assigns: &[Assign]) -> ShResult<Vec<(String, String)>> {
		let expander = self.expander();
		assigns
			.iter()
			.map(|assign| Ok((assign.name.clone(), expander.eval_word(&assign.val)?)))
			.collect()
	}

	fn exec_assignment(&mut self, pairs: &[Assign], local: bool, redirs: &[RedirNode]) -> ShResult<i32> {
		let pairs = self.eval_assigns(pairs)?;
		if local {
			self.mem.set_local(pairs)?;
		} else {
			for (name, val) in pairs {
				self.mem.assign(&name, val)?;
			}
		}
		self.with_redirects(redirs, |_| Ok(0))
	}

	fn exec_cmd(&mut self, assignments: &[Assign], argv: &[Word], redirs: &[RedirNode]) -> ShResult<i32> {
		let argv = self.expander().eval_words(argv)?;
		if argv.is_empty() {
			return self.exec_assignment(assignments, false, redirs)
		}

		let prefix = self.eval_assigns(assignments)?;
		if prefix.is_empty() {
			return self.run_cmd(argv, redirs)
		}
		// Prefix assignments only last for this command, and its children see them
		let names = prefix.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>();
		for name in &names {
			self.mem.check_writable(name)?;
		}
		self.mem.push(prefix);
		for name in &names {
			self.mem.set_export(name);
		}
		let mut this = scopeguard::guard(self, |this| {
			if let Err(e) = this.mem.pop() {
				e.print_error();
			}
		});
		this.run_cmd(argv, redirs)
	}

	fn run_cmd(&mut self, argv: Vec<String>, redirs: &[RedirNode]) -> ShResult<i32> {
		let name = argv[0].as_str();
		if self.builtins.is_builtin(name) {
			return self.exec_builtin(&argv, redirs)
		}
		if let Some(body) = self.funcs.get(name).cloned() {
			return self.with_redirects(redirs, |ex| ex.call_func(&body, argv[1..].to_vec()))
		}
		let mut proc = self.external_process(&argv, redirs)?;
		proc.run(self)
	}

	fn exec_builtin(&mut self, argv: &[String], redirs: &[RedirNode]) -> ShResult<i32> {
		let mut redirects = self.eval_redirects(redirs)?;
		let persist = self.builtins.persists_redirects(argv);

		let mut fd_frame = self.fd_state.scoped();
		for redirect in redirects.iter_mut() {
			redirect.apply_in_parent(&mut fd_frame)?;
		}
		let result = self.builtins.run(argv, &mut self.mem);
		let _ = io::stdout().flush();

		if persist && result.is_ok() {
			fd_frame.persist()?;
			// Their readers stay open, so waiting here could block forever
			self.helpers.extend(redirects.iter_mut().filter_map(|redirect| redirect.detach()));
		} else {
			fd_frame.restore()?;
		}
		for redirect in redirects.iter_mut() {
			redirect.reap()?;
		}
		result
	}

	fn call_func(&mut self, body: &Node, args: Vec<String>) -> ShResult<i32> {
		self.mem.push_call(args);
		let mut this = scopeguard::guard(self, |this| {
			if let Err(e) = this.mem.pop() {
				e.print_error();
			}
		});
		match this.dispatch_node(body) {
			Err(e) => match e.kind() {
				ShErrKind::FuncReturn(code) => Ok(*code),
				_ => Err(e),
			},
			res => res,
		}
	}

	fn external_process(&self, argv: &[String], redirs: &[RedirNode]) -> ShResult<Process> {
		let args = ExecArgs::new(argv, &self.mem.exported())?;
		let redirects = self.eval_redirects(redirs)?;
		Ok(Process::new(Thunk::External(args)).with_redirects(redirects))
	}

	/// The process that runs `node` as a pipeline stage.
	///
	/// A plain external command is exec'd directly. Everything else, including
	/// anything that fails to evaluate here, re-runs in the child where its
	/// errors are reported.
	fn process_for_node(&self, node: &Node) -> Process {
		if let NdRule::Command { assignments, argv } = &node.class {
			if assignments.is_empty() {
				let external = self.expander().eval_words(argv).ok().and_then(|argv| {
					let name = argv.first()?;
					if self.builtins.is_builtin(name) || self.funcs.contains_key(name) {
						return None
					}
					self.external_process(&argv, &node.redirs).ok()
				});
				if let Some(proc) = external {
					return proc
				}
			}
		}
		Process::new(Thunk::SubProgram(node.clone()))
	}

	fn exec_pipeline(&mut self, cmds: &[Node], negated: bool) -> ShResult<i32> {
		let status = match cmds {
			[] => 0,
			[cmd] => self.dispatch_node(cmd)?,
			_ => {
				let mut pipeline = Pipeline::new();
				for cmd in cmds {
					pipeline.add(self.process_for_node(cmd));
				}
				let last = pipeline.run(self)?;
				let pipe_status = pipeline.pipe_status().to_vec();
				let status = if self.opts.contains(ExecOpts::PIPEFAIL) {
					pipe_status.iter().rev().find(|s| **s != 0).copied().unwrap_or(0)
				} else {
					last
				};
				let pipe_status = pipe_status.iter().map(|s| s.to_string()).collect::<Vec<_>>();
				self.mem.set_global("PIPESTATUS", VarVal::Array(pipe_status))?;
				status
			}
		};
		if negated {
			return Ok(if status == 0 { 1 } else { 0 })
		}
		Ok(status)
	}

	fn exec_subshell(&mut self, body: &Node, redirs: &[RedirNode]) -> ShResult<i32> {
		let redirects = self.eval_redirects(redirs)?;
		let mut proc = Process::new(Thunk::SubProgram(body.clone())).with_redirects(redirects);
		proc.run(self)
	}

	/// Run `node` where a failure is tested rather than fatal
	fn exec_cond(&mut self, node: &Node) -> ShResult<i32> {
		self.cond_depth += 1;
		let result = self.dispatch_node(node);
		self.cond_depth -= 1;
		result
	}

	fn exec_conjunction(&mut self, elements: &[ConjunctNode]) -> ShResult<i32> {
		let mut status = 0;
		let mut op = ConjunctOp::Null;
		for (i, element) in elements.iter().enumerate() {
			let run = match op {
				ConjunctOp::And => status == 0,
				ConjunctOp::Or => status != 0,
				ConjunctOp::Null => true,
			};
			if run {
				status = if i + 1 < elements.len() {
					self.exec_cond(&element.cmd)?
				} else {
					self.dispatch_node(&element.cmd)?
				};
			}
			op = element.operator;
		}
		Ok(status)
	}

	fn exempt_from_errexit(node: &Node) -> bool {
		match &node.class {
			NdRule::AndOr { elements } => elements.len() > 1,
			NdRule::Pipeline { negated, .. } => *negated,
			_ => false,
		}
	}

	fn exec_list(&mut self, body: &[Node]) -> ShResult<i32> {
		let mut status = 0;
		for node in body {
			status = self.dispatch_node(node)?;
			if status != 0
				&& self.opts.contains(ExecOpts::ERREXIT)
				&& self.cond_depth == 0
				&& !Self::exempt_from_errexit(node)
			{
				flog!(DEBUG, "errexit: stopping with status {}", status);
				return Err(ShErr::bare(ShErrKind::CleanExit(status)))
			}
		}
		Ok(status)
	}

	fn exec_if(&mut self, arms: &[CondNode], else_block: &[Node]) -> ShResult<i32> {
		for arm in arms {
			if self.exec_cond(&arm.cond)? == 0 {
				return self.exec_list(&arm.body)
			}
		}
		if else_block.is_empty() {
			return Ok(0)
		}
		self.exec_list(else_block)
	}

	/// Sort out `break` and `continue` aimed at the innermost loop
	fn loop_control(result: ShResult<i32>) -> ShResult<LoopCtl> {
		match result {
			Ok(status) => Ok(LoopCtl::Proceed(status)),
			Err(e) => match *e.kind() {
				ShErrKind::LoopBreak(n) if n > 1 => Err(ShErr::bare(ShErrKind::LoopBreak(n - 1))),
				ShErrKind::LoopBreak(_) => Ok(LoopCtl::Break),
				ShErrKind::LoopContinue(n) if n > 1 => Err(ShErr::bare(ShErrKind::LoopContinue(n - 1))),
				ShErrKind::LoopContinue(_) => Ok(LoopCtl::Continue),
				_ => Err(e),
			},
		}
	}

	fn in_loop(&mut self, f: impl FnOnce(&mut Self) -> ShResult<i32>) -> ShResult<i32> {
		self.loop_depth += 1;
		let result = f(self);
		self.loop_depth -= 1;
		result
	}

	fn exec_loop(&mut self, kind: LoopKind, cond_node: &CondNode) -> ShResult<i32> {
		self.in_loop(|ex| {
			let mut status = 0;
			loop {
				let cond = match Self::loop_control(ex.exec_cond(&cond_node.cond))? {
					LoopCtl::Proceed(cond) => cond,
					LoopCtl::Break => break,
					LoopCtl::Continue => continue,
				};
				let keep_going = match kind {
					LoopKind::While => cond == 0,
					LoopKind::Until => cond != 0,
				};
				if !keep_going {
					break
				}
				match Self::loop_control(ex.exec_list(&cond_node.body))? {
					LoopCtl::Proceed(body_status) => status = body_status,
					LoopCtl::Break => break,
					LoopCtl::Continue => continue,
				}
			}
			Ok(status)
		})
	}

	fn exec_for(&mut self, var: &str, words: Option<&[Word]>, body: &[Node]) -> ShResult<i32> {
		let items = match words {
			Some(words) => self.expander().eval_words(words)?,
			None => self.mem.argv().to_vec(),
		};
		self.in_loop(|ex| {
			let mut status = 0;
			for item in items {
				ex.mem.assign(var, item)?;
				match Self::loop_control(ex.exec_list(body))? {
					LoopCtl::Proceed(body_status) => status = body_status,
					LoopCtl::Break => break,
					LoopCtl::Continue => continue,
				}
			}
			Ok(status)
		})
	}

	fn exec_case(&mut self, word: &Word, arms: &[CaseArm]) -> ShResult<i32> {
		let expander = self.expander();
		let subject = expander.eval_word(word)?;
		let mut matched = None;
		'arms: for arm in arms {
			for pattern in &arm.patterns {
				let pattern = expander.eval_word(pattern)?;
				let is_match = match Pattern::new(&pattern) {
					Ok(glob) => glob.matches(&subject),
					Err(_) => pattern == subject,
				};
				if is_match {
					matched = Some(&arm.body);
					break 'arms
				}
			}
		}
		match matched {
			Some(body) => self.exec_list(body),
			None => Ok(0),
		}
	}

	fn exec_flow(&mut self, kind: FlowKind, arg: Option<&Word>) -> ShResult<i32> {
		let arg = match arg {
			Some(word) => {
				let raw = self.expander().eval_word(word)?;
				let code = raw.trim().parse::<i32>().map_err(|_| {
					ShErr::simple(ShErrKind::ExpansionErr, format!("{raw}: numeric argument required"))
				})?;
				Some(code)
			}
			None => None,
		};
		let last = self.mem.last_status();
		let kind = match kind {
			FlowKind::Break | FlowKind::Continue if self.loop_depth == 0 => {
				let name = if kind == FlowKind::Break { "break" } else { "continue" };
				return Err(ShErr::simple(ShErrKind::ExecFail, format!("{name}: only meaningful in a loop")))
			}
			FlowKind::Break | FlowKind::Continue => {
				let levels = arg.unwrap_or(1);
				if levels < 1 {
					return Err(ShErr::simple(ShErrKind::ExpansionErr, format!("{levels}: loop count out of range")))
				}
				let levels = levels.min(self.loop_depth as i32);
				if kind == FlowKind::Break {
					ShErrKind::LoopBreak(levels)
				} else {
					ShErrKind::LoopContinue(levels)
				}
			}
			FlowKind::Return => ShErrKind::FuncReturn(arg.unwrap_or(last)),
			FlowKind::Exit => ShErrKind::CleanExit(arg.unwrap_or(last)),
		};
		Err(ShErr::bare(kind))
	}
}
