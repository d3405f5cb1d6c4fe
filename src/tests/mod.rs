use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::ast::{Node, RedirNode, RedirOp};
use crate::execute::{Builtins, Executor};
use crate::libsh::error::ShResult;
use crate::libsh::sys::borrow_fd;
use crate::state::Mem;

pub mod execute;

/// Held by every test that forks or touches the descriptor table
static FORK_LOCK: Mutex<()> = Mutex::new(());

pub fn lock() -> MutexGuard<'static, ()> {
	FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A fresh path under the temp dir, unique to this test process
pub fn tmp_path(name: &str) -> PathBuf {
	let path = std::env::temp_dir().join(format!("kelp-test-{}-{name}", std::process::id()));
	let _ = fs::remove_file(&path);
	path
}

pub fn read_tmp(path: &PathBuf) -> String {
	fs::read_to_string(path).unwrap_or_default()
}

/// What the descriptor currently refers to, as the kernel reports it
pub fn fd_target(fd: i32) -> Option<PathBuf> {
	fs::read_link(format!("/proc/self/fd/{fd}")).ok()
}

pub fn canon(path: &PathBuf) -> Option<PathBuf> {
	fs::canonicalize(path).ok()
}

pub fn out_to(node: Node, path: &PathBuf) -> Node {
	fd_to(node, 1, path)
}

pub fn fd_to(node: Node, fd: i32, path: &PathBuf) -> Node {
	let path = path.to_str().unwrap();
	let mut redirs = node.redirs.clone();
	redirs.push(RedirNode::new(RedirOp::Output, Some(fd), path));
	node.with_redirs(redirs)
}

/// `echo`, `emit FD words...`, `true`, `false` and a redirect-only `exec`.
///
/// Tests redirect `emit` to a high descriptor rather than pointing the
/// harness's own stdout at a file.
pub struct TestBuiltins;

fn write_line(fd: i32, words: &[String]) -> ShResult<i32> {
	let line = format!("{}\n", words.join(" "));
	nix::unistd::write(borrow_fd(fd), line.as_bytes())?;
	Ok(0)
}

impl Builtins for TestBuiltins {
	fn is_builtin(&self, name: &str) -> bool {
		matches!(name, "echo" | "emit" | "true" | "false" | "exec")
	}
	fn run(&mut self, argv: &[String], _mem: &mut Mem) -> ShResult<i32> {
		match argv[0].as_str() {
			"echo" => write_line(1, &argv[1..]),
			"emit" => {
				let fd = argv.get(1).and_then(|fd| fd.parse().ok()).unwrap_or(1);
				write_line(fd, argv.get(2..).unwrap_or_default())
			}
			"false" => Ok(1),
			_ => Ok(0),
		}
	}
	fn persists_redirects(&self, argv: &[String]) -> bool {
		argv.len() == 1 && argv[0] == "exec"
	}
}

pub fn executor() -> Executor {
	Executor::new(Mem::from_env("kelp", vec![])).with_builtins(Box::new(TestBuiltins))
}
