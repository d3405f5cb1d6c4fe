//! The command tree handed to the executor.
//!
//! Lexing and parsing happen upstream; this module only fixes the shape of
//! what they produce. Nodes are treated as immutable once built.

use std::fmt::{self, Display};
use std::os::fd::RawFd;

use nix::libc::{STDIN_FILENO, STDOUT_FILENO};

use crate::expand::brace::BraceRange;

/// A shell word: an ordered sequence of parts
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Word {
	pub parts: Vec<WordPart>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WordPart {
	/// Unquoted text. The brace markers `{`, `,` and `}` always arrive as
	/// their own single character literal parts.
	Literal(String),
	/// Quoted or escaped text, never treated as a brace marker
	Quoted(String),
	/// `$name`, `${name}` or `${name:-default}`
	VarSub { name: String, default: Option<Word> },
	/// A detected `{a,b,...}` group, one word per alternative
	Alt(Vec<Word>),
	/// A detected `{1..10}` or `{a..e}` group
	Range(BraceRange),
}

impl WordPart {
	pub fn lit(text: impl Into<String>) -> Self {
		Self::Literal(text.into())
	}
	/// The brace marker this part stands for, if any
	pub fn brace_marker(&self) -> Option<char> {
		match self {
			Self::Literal(text) if matches!(text.as_str(), "{" | "," | "}") => text.chars().next(),
			_ => None,
		}
	}
	pub fn is_alternation(&self) -> bool {
		matches!(self, Self::Alt(_) | Self::Range(_))
	}
}

impl Display for WordPart {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Literal(text) | Self::Quoted(text) => write!(f, "{text}"),
			Self::VarSub { name, default: None } => write!(f, "${{{name}}}"),
			Self::VarSub { name, default: Some(default) } => write!(f, "${{{name}:-{default}}}"),
			Self::Alt(words) => {
				let alts = words.iter().map(|w| w.to_string()).collect::<Vec<_>>();
				write!(f, "{{{}}}", alts.join(","))
			}
			Self::Range(range) => write!(f, "{range}"),
		}
	}
}

impl Word {
	pub fn new(parts: Vec<WordPart>) -> Self {
		Self { parts }
	}
	/// A word made of one literal part, with no brace markers split out
	pub fn lit(text: impl Into<String>) -> Self {
		Self::new(vec![WordPart::lit(text)])
	}
	pub fn is_empty(&self) -> bool {
		self.parts.is_empty()
	}
	pub fn has_alternation(&self) -> bool {
		self.parts.iter().any(WordPart::is_alternation)
	}

	/// Split raw word text into parts the way the word parser hands them over.
	///
	/// Brace markers become their own literal parts. `$name`, `${name}` and
	/// `${name:-default}` become substitutions. Single quotes and backslash
	/// escapes produce quoted parts, so `\,` and `'{'` are not markers.
	pub fn scan(text: &str) -> Self {
		let mut parts = vec![];
		let mut lit = String::new();
		let mut chars = text.chars().peekable();

		let flush = |lit: &mut String, parts: &mut Vec<WordPart>| {
			if !lit.is_empty() {
				parts.push(WordPart::Literal(std::mem::take(lit)));
			}
		};

		while let Some(ch) = chars.next() {
			match ch {
				'{' | ',' | '}' => {
					flush(&mut lit, &mut parts);
					parts.push(WordPart::Literal(ch.to_string()));
				}
				'\\' => {
					flush(&mut lit, &mut parts);
					let escaped = chars.next().map(|c| c.to_string()).unwrap_or_else(|| "\\".into());
					parts.push(WordPart::Quoted(escaped));
				}
				'\'' => {
					flush(&mut lit, &mut parts);
					let mut quoted = String::new();
					for q_ch in chars.by_ref() {
						if q_ch == '\'' {
							break
						}
						quoted.push(q_ch);
					}
					parts.push(WordPart::Quoted(quoted));
				}
				'$' => match chars.peek().copied() {
					Some('{') => {
						chars.next();
						flush(&mut lit, &mut parts);
						let mut body = String::new();
						let mut depth = 0;
						for b_ch in chars.by_ref() {
							match b_ch {
								'{' => depth += 1,
								'}' if depth == 0 => break,
								'}' => depth -= 1,
								_ => {}
							}
							body.push(b_ch);
						}
						let (name, default) = match body.split_once(":-") {
							Some((name, default)) => (name.to_string(), Some(Word::scan(default))),
							None => (body, None),
						};
						parts.push(WordPart::VarSub { name, default });
					}
					Some(next) if next.is_ascii_alphabetic() || next == '_' => {
						flush(&mut lit, &mut parts);
						let mut name = String::new();
						while let Some(n_ch) = chars.peek().copied() {
							if !(n_ch.is_ascii_alphanumeric() || n_ch == '_') {
								break
							}
							name.push(n_ch);
							chars.next();
						}
						parts.push(WordPart::VarSub { name, default: None });
					}
					Some(next) if next.is_ascii_digit() || "?#@*$!".contains(next) => {
						chars.next();
						flush(&mut lit, &mut parts);
						parts.push(WordPart::VarSub { name: next.to_string(), default: None });
					}
					_ => lit.push('$'),
				},
				_ => lit.push(ch),
			}
		}
		flush(&mut lit, &mut parts);
		Self { parts }
	}
}

impl Display for Word {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for part in &self.parts {
			write!(f, "{part}")?;
		}
		Ok(())
	}
}

impl From<&str> for Word {
	fn from(text: &str) -> Self {
		Word::scan(text)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirOp {
	/// `>`
	Output,
	/// `>>`
	Append,
	/// `<`
	Input,
	/// `<>`
	ReadWrite,
	/// `>&`
	DupOut,
	/// `<&`
	DupIn,
	/// `<<`
	HereDoc,
}

impl RedirOp {
	/// The descriptor a redirect targets when none is written
	pub fn default_fd(&self) -> RawFd {
		match self {
			Self::Output | Self::Append | Self::DupOut => STDOUT_FILENO,
			Self::Input | Self::ReadWrite | Self::DupIn | Self::HereDoc => STDIN_FILENO,
		}
	}
}

/// A redirect as written: `2>file`, `>&2`, `<<EOF`
#[derive(Clone, Debug, PartialEq)]
pub struct RedirNode {
	pub op: RedirOp,
	pub fd: Option<RawFd>,
	/// Filename, descriptor number, or here document body
	pub arg: Word,
}

impl RedirNode {
	pub fn new(op: RedirOp, fd: Option<RawFd>, arg: impl Into<Word>) -> Self {
		Self { op, fd, arg: arg.into() }
	}
	pub fn tgt_fd(&self) -> RawFd {
		self.fd.unwrap_or_else(|| self.op.default_fd())
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct Assign {
	pub name: String,
	pub val: Word,
}

impl Assign {
	pub fn new(name: impl Into<String>, val: impl Into<Word>) -> Self {
		Self { name: name.into(), val: val.into() }
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConjunctOp {
	And,
	Or,
	Null,
}

/// One element of an `a && b || c` chain. The operator joins it to the next
#[derive(Clone, Debug, PartialEq)]
pub struct ConjunctNode {
	pub cmd: Box<Node>,
	pub operator: ConjunctOp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CondNode {
	pub cond: Box<Node>,
	pub body: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaseArm {
	pub patterns: Vec<Word>,
	pub body: Vec<Node>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
	While,
	Until,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowKind {
	Break,
	Continue,
	Return,
	Exit,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NdRule {
	Command { assignments: Vec<Assign>, argv: Vec<Word> },
	Assignment { pairs: Vec<Assign>, local: bool },
	Pipeline { cmds: Vec<Node>, negated: bool },
	AndOr { elements: Vec<ConjunctNode> },
	CommandList { body: Vec<Node> },
	BraceGroup { body: Vec<Node> },
	Subshell { body: Box<Node> },
	If { arms: Vec<CondNode>, else_block: Vec<Node> },
	Loop { kind: LoopKind, cond_node: CondNode },
	/// `for var in words`; `None` iterates over the positional parameters
	ForEach { var: String, words: Option<Vec<Word>>, body: Vec<Node> },
	Case { word: Word, arms: Vec<CaseArm> },
	FuncDef { name: String, body: Box<Node> },
	ControlFlow { kind: FlowKind, arg: Option<Word> },
	NoOp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
	pub class: NdRule,
	pub redirs: Vec<RedirNode>,
}

impl Node {
	pub fn new(class: NdRule) -> Self {
		Self { class, redirs: vec![] }
	}
	pub fn with_redirs(self, redirs: Vec<RedirNode>) -> Self {
		Self { class: self.class, redirs }
	}
	/// A simple command from raw word texts, each run through [`Word::scan`]
	pub fn command<S: AsRef<str>>(argv: &[S]) -> Self {
		let argv = argv.iter().map(|arg| Word::scan(arg.as_ref())).collect();
		Self::new(NdRule::Command { assignments: vec![], argv })
	}
	pub fn with_assignments(self, assigns: Vec<Assign>) -> Self {
		match self.class {
			NdRule::Command { argv, .. } => Self {
				class: NdRule::Command { assignments: assigns, argv },
				redirs: self.redirs,
			},
			class => Self { class, redirs: self.redirs },
		}
	}
	pub fn pipeline(cmds: Vec<Node>) -> Self {
		Self::new(NdRule::Pipeline { cmds, negated: false })
	}
	pub fn list(body: Vec<Node>) -> Self {
		Self::new(NdRule::CommandList { body })
	}
}
