use std::fs::File;
use std::io::Read;
use std::os::fd::FromRawFd;

use nix::unistd::close;
use pretty_assertions::assert_eq;

use super::{executor, fd_to, lock, out_to, read_tmp, tmp_path};
use crate::ast::{
	Assign, CaseArm, CondNode, ConjunctNode, ConjunctOp, FlowKind, LoopKind, NdRule, Node, RedirNode, RedirOp, Word,
};
use crate::libsh::sys::fd_is_open;
use crate::shopt::ExecOpts;

const OUT: i32 = 44;

fn cmd(argv: &[&str]) -> Node {
	Node::command(argv)
}

fn assign(name: &str, val: &str) -> Node {
	Node::new(NdRule::Assignment { pairs: vec![Assign::new(name, val)], local: false })
}

fn and_or(elements: Vec<(Node, ConjunctOp)>) -> Node {
	let elements = elements
		.into_iter()
		.map(|(cmd, operator)| ConjunctNode { cmd: Box::new(cmd), operator })
		.collect();
	Node::new(NdRule::AndOr { elements })
}

fn flow(kind: FlowKind, arg: Option<&str>) -> Node {
	Node::new(NdRule::ControlFlow { kind, arg: arg.map(Word::lit) })
}

fn for_each(var: &str, words: &[&str], body: Vec<Node>) -> Node {
	let words = words.iter().map(|w| Word::scan(w)).collect();
	Node::new(NdRule::ForEach { var: var.into(), words: Some(words), body })
}

fn case(word: &str, arms: Vec<(&str, Vec<Node>)>) -> Node {
	let arms = arms
		.into_iter()
		.map(|(pattern, body)| CaseArm { patterns: vec![Word::lit(pattern)], body })
		.collect();
	Node::new(NdRule::Case { word: Word::scan(word), arms })
}

fn func(name: &str, body: Node) -> Node {
	Node::new(NdRule::FuncDef { name: name.into(), body: Box::new(body) })
}

// ============================================================================
// Simple commands
// ============================================================================

#[test]
fn builtin_redirect_is_undone() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("builtin-redirect");

	let status = ex.execute(&fd_to(cmd(&["emit", "44", "a{b,c}", "{1..2}"]), OUT, &path));
	assert_eq!(status, 0);
	assert_eq!(read_tmp(&path), "ab ac 1 2\n");
	assert!(!fd_is_open(OUT));
	assert_eq!(ex.fd_state().depth(), 0);
}

#[test]
fn prefix_assignments_are_temporary_and_exported() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("prefix");

	let node = out_to(cmd(&["sh", "-c", "'echo $KELP_PREFIX'"]), &path)
		.with_assignments(vec![Assign::new("KELP_PREFIX", "bar")]);
	assert_eq!(ex.execute(&node), 0);
	assert_eq!(read_tmp(&path), "bar\n");
	assert_eq!(ex.mem().get("KELP_PREFIX"), None);
	assert_eq!(ex.mem().depth(), 1);
}

#[test]
fn bare_assignment_persists() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("bare-assign");

	let program = Node::list(vec![assign("x", "1"), fd_to(cmd(&["emit", "44", "x=$x"]), OUT, &path)]);
	assert_eq!(ex.execute(&program), 0);
	assert_eq!(read_tmp(&path), "x=1\n");
	assert_eq!(ex.mem().get("x").as_deref(), Some("1"));
}

#[test]
fn last_status_is_visible() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("last-status");

	let program = Node::list(vec![cmd(&["false"]), fd_to(cmd(&["emit", "44", "$?"]), OUT, &path)]);
	assert_eq!(ex.execute(&program), 0);
	assert_eq!(read_tmp(&path), "1\n");
}

#[test]
fn defaults_and_nounset() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("nounset");

	let node = fd_to(cmd(&["emit", "44", "${KELP_UNSET:-fallback}"]), OUT, &path);
	assert_eq!(ex.execute(&node), 0);
	assert_eq!(read_tmp(&path), "fallback\n");

	assert_eq!(ex.execute(&cmd(&["true", "$KELP_UNSET"])), 0);
	ex.opts_mut().insert(ExecOpts::NOUNSET);
	assert_eq!(ex.execute(&cmd(&["true", "$KELP_UNSET"])), 1);
}

#[test]
fn command_not_found_is_127() {
	let _guard = lock();
	let mut ex = executor();
	assert_eq!(ex.execute(&cmd(&["kelp-no-such-program"])), 127);
	assert_eq!(ex.mem().last_status(), 127);
}

#[test]
fn bad_redirect_is_reported_not_fatal() {
	let _guard = lock();
	let mut ex = executor();
	let missing = tmp_path("missing-input");
	let node = cmd(&["true"]).with_redirs(vec![RedirNode::new(RedirOp::Input, None, missing.to_str().unwrap())]);

	assert_eq!(ex.execute(&node), 1);
	assert_eq!(ex.fd_state().depth(), 0);

	let ambiguous = cmd(&["true"]).with_redirs(vec![RedirNode::new(RedirOp::Output, None, "$KELP_UNSET")]);
	assert_eq!(ex.execute(&ambiguous), 1);
}

#[test]
fn heredoc_to_external() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("heredoc");

	let cat = out_to(cmd(&["cat"]), &path);
	let mut redirs = vec![RedirNode::new(RedirOp::HereDoc, None, "hello $x\n")];
	redirs.extend(cat.redirs.clone());
	let program = Node::list(vec![assign("x", "world"), cat.with_redirs(redirs)]);

	assert_eq!(ex.execute(&program), 0);
	assert_eq!(read_tmp(&path), "hello world\n");
}

#[test]
fn exec_redirects_persist() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("exec");
	let _ = close(45);

	assert_eq!(ex.execute(&fd_to(cmd(&["exec"]), 45, &path)), 0);
	assert!(fd_is_open(45));
	assert_eq!(ex.fd_state().depth(), 0);

	let _ = close(46);
	let node = cmd(&["emit", "46", "kept"]).with_redirs(vec![RedirNode::new(RedirOp::DupOut, Some(46), "45")]);
	assert_eq!(ex.execute(&node), 0);
	assert_eq!(read_tmp(&path), "kept\n");
	assert!(!fd_is_open(46));
	let _ = close(45);
}

#[test]
fn exec_keeps_a_large_heredoc_open() {
	let _guard = lock();
	let mut ex = executor();
	let _ = close(47);
	let body = "x".repeat(200_000);

	let node = cmd(&["exec"]).with_redirs(vec![RedirNode::new(RedirOp::HereDoc, Some(47), body.as_str())]);
	assert_eq!(ex.execute(&node), 0);
	assert!(fd_is_open(47));
	assert_eq!(ex.pending_helpers(), 1);

	let mut reader = unsafe { File::from_raw_fd(47) };
	let mut read = String::new();
	reader.read_to_string(&mut read).unwrap();
	drop(reader);
	assert_eq!(read.len(), body.len());

	// The writer is gone once its output has all been read
	for _ in 0..100 {
		ex.execute(&cmd(&["true"]));
		if ex.pending_helpers() == 0 {
			break
		}
		std::thread::sleep(std::time::Duration::from_millis(10));
	}
	assert_eq!(ex.pending_helpers(), 0);
}

#[test]
fn prefix_assignment_cannot_shadow_readonly() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("prefix-readonly");

	ex.mem_mut().assign("KELP_RO", "fixed").unwrap();
	ex.mem_mut().set_readonly("KELP_RO");
	let node = fd_to(cmd(&["emit", "44", "$KELP_RO"]), OUT, &path)
		.with_assignments(vec![Assign::new("KELP_RO", "changed")]);
	assert_eq!(ex.execute(&node), 1);
	assert_eq!(read_tmp(&path), "");
	assert_eq!(ex.mem().get("KELP_RO").as_deref(), Some("fixed"));
	assert_eq!(ex.mem().depth(), 1);
}

#[test]
fn capture_runs_node_in_child() {
	let _guard = lock();
	let mut ex = executor();

	let program = Node::list(vec![assign("x", "inner"), cmd(&["echo", "$x"]), cmd(&["false"])]);
	assert_eq!(ex.capture(&program).unwrap(), (1, "inner\n".to_string()));
	assert_eq!(ex.mem().get("x"), None);

	let pipeline = Node::pipeline(vec![cmd(&["printf", "b\\na\\n"]), cmd(&["sort"])]);
	assert_eq!(ex.capture(&pipeline).unwrap(), (0, "a\nb\n".to_string()));
}

// ============================================================================
// Functions
// ============================================================================

#[test]
fn function_call_with_positionals() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("func");

	ex.execute(&func("greet", cmd(&["emit", "44", "hi", "$1", "$#"])));
	assert!(ex.has_func("greet"));
	assert_eq!(ex.execute(&fd_to(cmd(&["greet", "there"]), OUT, &path)), 0);
	assert_eq!(read_tmp(&path), "hi there 1\n");
	assert_eq!(ex.mem().depth(), 1);
}

#[test]
fn function_return_value() {
	let _guard = lock();
	let mut ex = executor();
	let body = Node::list(vec![flow(FlowKind::Return, Some("3")), assign("reached", "yes")]);
	ex.execute(&func("f", body));

	assert_eq!(ex.execute(&cmd(&["f"])), 3);
	assert_eq!(ex.mem().get("reached"), None);
	assert_eq!(ex.mem().depth(), 1);
}

#[test]
fn local_assignment_stays_in_function() {
	let _guard = lock();
	let mut ex = executor();
	let local = Node::new(NdRule::Assignment { pairs: vec![Assign::new("x", "inner")], local: true });
	ex.execute(&func("f", local));

	ex.execute(&assign("x", "outer"));
	ex.execute(&cmd(&["f"]));
	assert_eq!(ex.mem().get("x").as_deref(), Some("outer"));
}

// ============================================================================
// Pipelines
// ============================================================================

#[test]
fn pipeline_through_builtin_stage() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("pipe-builtin");

	let pipeline = Node::pipeline(vec![cmd(&["echo", "x{1,2}"]), out_to(cmd(&["cat"]), &path)]);
	assert_eq!(ex.execute(&pipeline), 0);
	assert_eq!(read_tmp(&path), "x1 x2\n");
	assert_eq!(ex.mem().get("PIPESTATUS").as_deref(), Some("0 0"));
	assert_eq!(ex.fd_state().depth(), 0);
}

#[test]
fn pipefail_takes_rightmost_failure() {
	let _guard = lock();
	let mut ex = executor();
	let pipeline = Node::pipeline(vec![
		cmd(&["sh", "-c", "'exit 3'"]),
		cmd(&["sh", "-c", "'exit 4'"]),
		cmd(&["true"]),
	]);

	assert_eq!(ex.execute(&pipeline), 0);
	assert_eq!(ex.mem().get("PIPESTATUS").as_deref(), Some("3 4 0"));

	ex.opts_mut().insert(ExecOpts::PIPEFAIL);
	assert_eq!(ex.execute(&pipeline), 4);
}

#[test]
fn negated_pipeline() {
	let _guard = lock();
	let mut ex = executor();
	let negate = |node: Node| Node::new(NdRule::Pipeline { cmds: vec![node], negated: true });
	assert_eq!(ex.execute(&negate(cmd(&["false"]))), 0);
	assert_eq!(ex.execute(&negate(cmd(&["true"]))), 1);
}

#[test]
fn function_as_pipeline_stage() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("pipe-func");
	ex.execute(&func("produce", cmd(&["echo", "from", "func"])));

	let pipeline = Node::pipeline(vec![cmd(&["produce"]), out_to(cmd(&["cat"]), &path)]);
	assert_eq!(ex.execute(&pipeline), 0);
	assert_eq!(read_tmp(&path), "from func\n");
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn conjunctions_short_circuit() {
	let _guard = lock();
	let mut ex = executor();
	use ConjunctOp::*;

	let node = and_or(vec![(cmd(&["false"]), And), (assign("ran", "yes"), Null)]);
	assert_eq!(ex.execute(&node), 1);
	assert_eq!(ex.mem().get("ran"), None);

	let node = and_or(vec![(cmd(&["false"]), Or), (cmd(&["true"]), Null)]);
	assert_eq!(ex.execute(&node), 0);

	let node = and_or(vec![(cmd(&["true"]), And), (cmd(&["false"]), Or), (cmd(&["true"]), Null)]);
	assert_eq!(ex.execute(&node), 0);
}

#[test]
fn errexit_stops_list() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("errexit");
	ex.opts_mut().insert(ExecOpts::ERREXIT);

	let program = Node::list(vec![cmd(&["false"]), fd_to(cmd(&["emit", "44", "after"]), OUT, &path)]);
	assert_eq!(ex.execute(&program), 1);
	assert_eq!(read_tmp(&path), "");
}

#[test]
fn errexit_ignores_tested_commands() {
	let _guard = lock();
	let mut ex = executor();
	ex.opts_mut().insert(ExecOpts::ERREXIT);

	let program = Node::list(vec![
		and_or(vec![(cmd(&["false"]), ConjunctOp::And), (cmd(&["true"]), ConjunctOp::Null)]),
		Node::new(NdRule::If {
			arms: vec![CondNode { cond: Box::new(cmd(&["false"])), body: vec![] }],
			else_block: vec![],
		}),
		assign("reached", "yes"),
	]);
	assert_eq!(ex.execute(&program), 0);
	assert_eq!(ex.mem().get("reached").as_deref(), Some("yes"));
}

#[test]
fn if_else() {
	let _guard = lock();
	let mut ex = executor();
	let node = Node::new(NdRule::If {
		arms: vec![
			CondNode { cond: Box::new(cmd(&["false"])), body: vec![assign("x", "first")] },
			CondNode { cond: Box::new(cmd(&["false"])), body: vec![assign("x", "second")] },
		],
		else_block: vec![assign("x", "else")],
	});
	assert_eq!(ex.execute(&node), 0);
	assert_eq!(ex.mem().get("x").as_deref(), Some("else"));
}

#[test]
fn for_loop_over_expanded_words() {
	let _guard = lock();
	let mut ex = executor();
	let node = for_each("i", &["{a..c}", "d"], vec![assign("acc", "$acc$i")]);
	assert_eq!(ex.execute(&node), 0);
	assert_eq!(ex.mem().get("acc").as_deref(), Some("abcd"));
}

#[test]
fn for_loop_over_positionals() {
	let _guard = lock();
	let mut ex = executor();
	ex.mem_mut().set_argv(vec!["p".into(), "q".into()]);
	let node = Node::new(NdRule::ForEach { var: "i".into(), words: None, body: vec![assign("acc", "$acc$i")] });
	ex.execute(&node);
	assert_eq!(ex.mem().get("acc").as_deref(), Some("pq"));
}

#[test]
fn break_out_of_two_loops() {
	let _guard = lock();
	let mut ex = executor();
	let inner = for_each(
		"j",
		&["a", "b"],
		vec![case("$j", vec![("b", vec![flow(FlowKind::Break, Some("2"))])]), assign("acc", "$acc$i$j")],
	);
	let outer = for_each("i", &["1", "2", "3"], vec![inner]);

	assert_eq!(ex.execute(&outer), 0);
	assert_eq!(ex.mem().get("acc").as_deref(), Some("1a"));
}

#[test]
fn continue_skips_rest_of_body() {
	let _guard = lock();
	let mut ex = executor();
	let inner = for_each(
		"j",
		&["a", "b"],
		vec![case("$j", vec![("a", vec![flow(FlowKind::Continue, None)])]), assign("acc", "$acc$i$j")],
	);
	let outer = for_each("i", &["1", "2", "3"], vec![inner]);

	ex.execute(&outer);
	assert_eq!(ex.mem().get("acc").as_deref(), Some("1b2b3b"));
}

#[test]
fn while_and_until() {
	let _guard = lock();
	let mut ex = executor();
	let body = vec![assign("x", "looped"), flow(FlowKind::Break, None)];
	let node = Node::new(NdRule::Loop {
		kind: LoopKind::While,
		cond_node: CondNode { cond: Box::new(cmd(&["true"])), body },
	});
	assert_eq!(ex.execute(&node), 0);
	assert_eq!(ex.mem().get("x").as_deref(), Some("looped"));

	let never = Node::new(NdRule::Loop {
		kind: LoopKind::Until,
		cond_node: CondNode { cond: Box::new(cmd(&["true"])), body: vec![assign("y", "ran")] },
	});
	assert_eq!(ex.execute(&never), 0);
	assert_eq!(ex.mem().get("y"), None);
}

#[test]
fn case_matches_globs_in_order() {
	let _guard = lock();
	let mut ex = executor();
	let node = case(
		"notes.txt",
		vec![
			("*.rs", vec![assign("kind", "rust")]),
			("*.txt", vec![assign("kind", "text")]),
			("*", vec![assign("kind", "other")]),
		],
	);
	ex.execute(&node);
	assert_eq!(ex.mem().get("kind").as_deref(), Some("text"));
}

#[test]
fn subshell_isolates_state() {
	let _guard = lock();
	let mut ex = executor();
	let body = Node::list(vec![assign("x", "inner"), flow(FlowKind::Exit, Some("4"))]);
	let node = Node::new(NdRule::Subshell { body: Box::new(body) });

	assert_eq!(ex.execute(&node), 4);
	assert_eq!(ex.mem().get("x"), None);
}

#[test]
fn exit_and_stray_control_flow() {
	let _guard = lock();
	let mut ex = executor();
	assert_eq!(ex.execute(&flow(FlowKind::Exit, Some("5"))), 5);
	assert_eq!(ex.execute(&flow(FlowKind::Break, None)), 1);
	assert_eq!(ex.execute(&flow(FlowKind::Return, Some("2"))), 1);
	assert_eq!(ex.execute(&flow(FlowKind::Exit, Some("nope"))), 1);
}

#[test]
fn brace_group_redirect_covers_body() {
	let _guard = lock();
	let mut ex = executor();
	let path = tmp_path("brace-group");
	let group = Node::new(NdRule::BraceGroup {
		body: vec![cmd(&["emit", "44", "one"]), cmd(&["sh", "-c", "'echo two >&44'"])],
	});

	assert_eq!(ex.execute(&fd_to(group, OUT, &path)), 0);
	assert_eq!(read_tmp(&path), "one\ntwo\n");
	assert!(!fd_is_open(OUT));
}

#[test]
fn options_by_name() {
	let mut opts = ExecOpts::default();
	opts.set_opt("pipefail", true).unwrap();
	opts.set_opt("ErrExit", true).unwrap();
	opts.set_opt("errexit", false).unwrap();
	assert_eq!(opts, ExecOpts::PIPEFAIL);
	assert!(opts.query("pipefail").unwrap());
	assert!(!opts.query("nounset").unwrap());

	let err = opts.set_opt("vi", true).unwrap_err();
	assert_eq!(err.kind(), &crate::libsh::error::ShErrKind::InvalidOpt);
	insta::assert_snapshot!(opts.to_string(), @r"
	errexit   off
	nounset   off
	pipefail  on
	");
}
