use std::{fmt::Display, str::FromStr};

use crate::prelude::*;

bitflags! {
	/// Execution options, as toggled by `set -o`
	#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
	pub struct ExecOpts: u8 {
		/// Stop a command list at the first failing command
		const ERREXIT  = 0b001;
		/// Expanding an unset variable is an error
		const NOUNSET  = 0b010;
		/// A pipeline fails if any of its stages fail
		const PIPEFAIL = 0b100;
	}
}

impl ExecOpts {
	pub fn set_opt(&mut self, opt: &str, on: bool) -> ShResult<()> {
		let flag: ExecOpts = opt.parse()?;
		self.set(flag, on);
		Ok(())
	}
	pub fn query(&self, opt: &str) -> ShResult<bool> {
		let flag: ExecOpts = opt.parse()?;
		Ok(self.contains(flag))
	}
}

impl FromStr for ExecOpts {
	type Err = ShErr;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"errexit" => Ok(Self::ERREXIT),
			"nounset" => Ok(Self::NOUNSET),
			"pipefail" => Ok(Self::PIPEFAIL),
			_ => Err(ShErr::simple(ShErrKind::InvalidOpt, format!("Invalid option '{s}'"))),
		}
	}
}

impl Display for ExecOpts {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let opts = [("errexit", Self::ERREXIT), ("nounset", Self::NOUNSET), ("pipefail", Self::PIPEFAIL)];
		let lines = opts
			.iter()
			.map(|(name, flag)| {
				let state = if self.contains(*flag) { "on" } else { "off" };
				format!("{name:<10}{state}")
			})
			.collect::<Vec<_>>();
		write!(f, "{}", lines.join("\n"))
	}
}
