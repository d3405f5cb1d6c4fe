use std::collections::BTreeMap;

use crate::prelude::*;

bitflags! {
	#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
	pub struct VarFlags: u8 {
		const NONE     = 0;
		const EXPORT   = 1 << 0;
		const READONLY = 1 << 1;
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarVal {
	Str(String),
	Array(Vec<String>),
}

impl fmt::Display for VarVal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Str(s) => write!(f, "{s}"),
			Self::Array(items) => write!(f, "{}", items.join(" ")),
		}
	}
}

impl From<String> for VarVal {
	fn from(value: String) -> Self {
		Self::Str(value)
	}
}

impl From<&str> for VarVal {
	fn from(value: &str) -> Self {
		Self::Str(value.to_string())
	}
}

impl From<Vec<String>> for VarVal {
	fn from(value: Vec<String>) -> Self {
		Self::Array(value)
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
	pub val: VarVal,
	pub flags: VarFlags,
}

impl Cell {
	pub fn new(val: VarVal) -> Self {
		Self { val, flags: VarFlags::NONE }
	}
	pub fn with_flags(self, flags: VarFlags) -> Self {
		Self { val: self.val, flags }
	}
	pub fn is_exported(&self) -> bool {
		self.flags.contains(VarFlags::EXPORT)
	}
	pub fn is_readonly(&self) -> bool {
		self.flags.contains(VarFlags::READONLY)
	}
}

#[derive(Clone, Debug, Default)]
pub struct Frame {
	vars: HashMap<String, Cell>,
	/// Positional parameters, present on frames opened for a call
	argv: Option<Vec<String>>,
}

impl Frame {
	pub fn with_bindings<K, V>(bindings: impl IntoIterator<Item = (K, V)>) -> Self
	where
		K: Into<String>,
		V: Into<VarVal>,
	{
		let vars = bindings
			.into_iter()
			.map(|(name, val)| (name.into(), Cell::new(val.into())))
			.collect();
		Self { vars, argv: None }
	}
}

/// The shell's variable memory: a stack of binding frames.
///
/// Lookups scan from the top frame down. The bottom frame holds the globals
/// and can never be popped.
#[derive(Debug)]
pub struct Mem {
	top: Frame,
	lower: Vec<Frame>,
	argv0: String,
	last_status: i32,
}

impl Mem {
	pub fn new(argv0: impl Into<String>, argv: Vec<String>) -> Self {
		let mut top = Frame { vars: HashMap::new(), argv: Some(argv) };
		top.vars.insert("IFS".into(), Cell::new(" \t\n".into()));
		Self { top, lower: vec![], argv0: argv0.into(), last_status: 0 }
	}

	/// A memory whose globals are the process environment, all exported
	pub fn from_env(argv0: impl Into<String>, argv: Vec<String>) -> Self {
		let mut mem = Self::new(argv0, argv);
		for (name, val) in std::env::vars() {
			let cell = Cell::new(val.into()).with_flags(VarFlags::EXPORT);
			mem.top.vars.insert(name, cell);
		}
		if !mem.top.vars.contains_key("PWD") {
			if let Ok(pwd) = std::env::current_dir() {
				let pwd = pwd.to_string_lossy().to_string();
				mem.top.vars.insert("PWD".into(), Cell::new(pwd.into()).with_flags(VarFlags::EXPORT));
			}
		}
		mem
	}

	/// Number of frames, counting the globals
	pub fn depth(&self) -> usize {
		self.lower.len() + 1
	}

	fn frames(&self) -> impl Iterator<Item = &Frame> {
		std::iter::once(&self.top).chain(self.lower.iter().rev())
	}

	fn frames_mut(&mut self) -> impl Iterator<Item = &mut Frame> {
		std::iter::once(&mut self.top).chain(self.lower.iter_mut().rev())
	}

	fn bottom_mut(&mut self) -> &mut Frame {
		match self.lower.first_mut() {
			Some(bottom) => bottom,
			None => &mut self.top,
		}
	}

	fn push_frame(&mut self, frame: Frame) {
		let below = std::mem::replace(&mut self.top, frame);
		self.lower.push(below);
		flog!(TRACE, "pushed variable frame, depth {}", self.depth());
	}

	/// Open a new top frame holding the given bindings
	pub fn push<K, V>(&mut self, bindings: impl IntoIterator<Item = (K, V)>)
	where
		K: Into<String>,
		V: Into<VarVal>,
	{
		self.push_frame(Frame::with_bindings(bindings));
	}

	/// Open a frame for a function call, carrying its positional parameters
	pub fn push_call(&mut self, argv: Vec<String>) {
		self.push_frame(Frame { vars: HashMap::new(), argv: Some(argv) });
	}

	pub fn pop(&mut self) -> ShResult<()> {
		let Some(below) = self.lower.pop() else {
			return Err(ShErr::simple(ShErrKind::InternalErr, "attempted to pop the global variable frame"))
		};
		self.top = below;
		flog!(TRACE, "popped variable frame, depth {}", self.depth());
		Ok(())
	}

	pub fn get_cell(&self, name: &str) -> Option<&Cell> {
		self.frames().find_map(|frame| frame.vars.get(name))
	}

	pub fn get(&self, name: &str) -> Option<String> {
		self.get_cell(name).map(|cell| cell.val.to_string())
	}

	/// Fails if `name` is readonly anywhere it is visible
	pub fn check_writable(&self, name: &str) -> ShResult<()> {
		match self.get_cell(name) {
			Some(cell) if cell.is_readonly() => {
				Err(ShErr::simple(ShErrKind::ExpansionErr, format!("{name}: readonly variable")))
			}
			_ => Ok(()),
		}
	}

	/// Bind each pair in the top frame, shadowing anything below
	pub fn set_local<K, V>(&mut self, pairs: impl IntoIterator<Item = (K, V)>) -> ShResult<()>
	where
		K: Into<String>,
		V: Into<VarVal>,
	{
		for (name, val) in pairs {
			let name = name.into();
			self.check_writable(&name)?;
			let flags = self.top.vars.get(&name).map(|cell| cell.flags).unwrap_or_default();
			self.top.vars.insert(name, Cell::new(val.into()).with_flags(flags));
		}
		Ok(())
	}

	/// Plain assignment: update the nearest binding of `name`, or create it
	/// among the globals
	pub fn assign(&mut self, name: &str, val: impl Into<VarVal>) -> ShResult<()> {
		self.check_writable(name)?;
		let val = val.into();
		if let Some(cell) = self.frames_mut().find_map(|frame| frame.vars.get_mut(name)) {
			cell.val = val;
			return Ok(())
		}
		self.bottom_mut().vars.insert(name.to_string(), Cell::new(val));
		Ok(())
	}

	/// Bind `name` in the global frame regardless of what shadows it
	pub fn set_global(&mut self, name: &str, val: impl Into<VarVal>) -> ShResult<()> {
		self.check_writable(name)?;
		let bottom = self.bottom_mut();
		let flags = bottom.vars.get(name).map(|cell| cell.flags).unwrap_or_default();
		bottom.vars.insert(name.to_string(), Cell::new(val.into()).with_flags(flags));
		Ok(())
	}

	fn add_flags(&mut self, name: &str, flags: VarFlags) {
		if let Some(cell) = self.frames_mut().find_map(|frame| frame.vars.get_mut(name)) {
			cell.flags |= flags;
			return
		}
		let cell = Cell::new(VarVal::Str(String::new())).with_flags(flags);
		self.bottom_mut().vars.insert(name.to_string(), cell);
	}

	/// Mark the nearest binding of `name` for export. An unset name becomes
	/// an empty exported global.
	pub fn set_export(&mut self, name: &str) {
		self.add_flags(name, VarFlags::EXPORT);
	}

	pub fn set_readonly(&mut self, name: &str) {
		self.add_flags(name, VarFlags::READONLY);
	}

	/// The environment handed to child processes. Higher frames win.
	pub fn exported(&self) -> BTreeMap<String, String> {
		let mut env = BTreeMap::new();
		let bottom_up = self.lower.iter().chain(std::iter::once(&self.top));
		for frame in bottom_up {
			for (name, cell) in &frame.vars {
				match &cell.val {
					VarVal::Str(val) if cell.is_exported() => {
						env.insert(name.clone(), val.clone());
					}
					// A shadowing binding that is not exported hides the export below it
					_ => {
						env.remove(name);
					}
				}
			}
		}
		env
	}

	/// Positional parameters of the innermost call
	pub fn argv(&self) -> &[String] {
		self.frames().find_map(|frame| frame.argv.as_deref()).unwrap_or(&[])
	}

	pub fn set_argv(&mut self, argv: Vec<String>) {
		if let Some(frame) = self.frames_mut().find(|frame| frame.argv.is_some()) {
			frame.argv = Some(argv);
			return
		}
		self.bottom_mut().argv = Some(argv);
	}

	pub fn argv0(&self) -> &str {
		&self.argv0
	}

	pub fn last_status(&self) -> i32 {
		self.last_status
	}

	pub fn set_last_status(&mut self, status: i32) {
		self.last_status = status;
	}

	/// Resolve a parameter name, including the special ones
	pub fn lookup_param(&self, name: &str) -> Option<String> {
		match name {
			"?" => Some(self.last_status.to_string()),
			"#" => Some(self.argv().len().to_string()),
			"@" | "*" => Some(self.argv().join(" ")),
			"$" => Some(std::process::id().to_string()),
			"0" => Some(self.argv0.clone()),
			_ => match name.parse::<usize>() {
				Ok(idx) => idx.checked_sub(1).and_then(|idx| self.argv().get(idx)).cloned(),
				Err(_) => self.get(name),
			},
		}
	}
}
