use std::fmt::Display;
use std::sync::LazyLock;

use super::term::{Style, Styled};

/// Environment variable holding the log threshold
pub const LOG_LEVEL_VAR: &str = "KELP_LOG_LEVEL";

#[derive(Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Debug)]
#[repr(u8)]
pub enum KelpLogLevel {
	NONE = 0,
	ERROR = 1,
	WARN = 2,
	INFO = 3,
	DEBUG = 4,
	TRACE = 5,
}

impl KelpLogLevel {
	pub fn parse(raw: &str) -> Self {
		use KelpLogLevel::*;
		match raw.trim().to_lowercase().as_str() {
			"error" => ERROR,
			"warn" => WARN,
			"info" => INFO,
			"debug" => DEBUG,
			"trace" => TRACE,
			_ => NONE,
		}
	}
}

impl Display for KelpLogLevel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		use KelpLogLevel::*;
		match self {
			ERROR => write!(f, "{}", "ERROR".styled(Style::Red | Style::Bold)),
			WARN => write!(f, "{}", "WARN".styled(Style::Yellow | Style::Bold)),
			INFO => write!(f, "{}", "INFO".styled(Style::Green | Style::Bold)),
			DEBUG => write!(f, "{}", "DEBUG".styled(Style::Magenta | Style::Bold)),
			TRACE => write!(f, "{}", "TRACE".styled(Style::Blue | Style::Bold)),
			NONE => write!(f, ""),
		}
	}
}

static LOG_LEVEL: LazyLock<KelpLogLevel> = LazyLock::new(|| {
	let raw = std::env::var(LOG_LEVEL_VAR).unwrap_or_default();
	KelpLogLevel::parse(&raw)
});

/// The threshold read from `KELP_LOG_LEVEL` on first use
pub fn log_level() -> KelpLogLevel {
	*LOG_LEVEL
}

/// Structured stderr logging.
///
/// Every line is printed as `[LEVEL][file:line] message`. Three shapes are
/// accepted:
///
/// ```ignore
/// flog!(DEBUG, "forked {} as {}", name, pid); // formatted message
/// flog!(TRACE, "entering", "leaving");        // one line per literal
/// flog!(DEBUG, frame.saved.len());            // `expr = {:#?}`
/// ```
///
/// Nothing is formatted unless the level passes the `KELP_LOG_LEVEL`
/// threshold.
#[macro_export]
macro_rules! flog {
	($level:path, $fmt:literal, $($args:expr),+ $(,)?) => {{
		use $crate::libsh::flog::log_level;
		use $crate::libsh::term::{Style, Styled};

		if $level <= log_level() {
			let file = file!().styled(Style::Cyan);
			let line = line!().to_string().styled(Style::Cyan);

			eprintln!(
				"[{}][{}:{}] {}",
				$level, file, line, format!($fmt, $($args),+)
			);
		}
	}};

	($level:path, $($lit:literal),+ $(,)?) => {{
		use $crate::libsh::flog::log_level;
		use $crate::libsh::term::{Style, Styled};

		if $level <= log_level() {
			let file = file!().styled(Style::Cyan);
			let line = line!().to_string().styled(Style::Cyan);

			$(
				eprintln!("[{}][{}:{}] {}", $level, file, line, $lit);
			)+
		}
	}};

	($level:path, $($val:expr),+ $(,)?) => {{
		use $crate::libsh::flog::log_level;
		use $crate::libsh::term::{Style, Styled};

		if $level <= log_level() {
			let file = file!().styled(Style::Cyan);
			let line = line!().to_string().styled(Style::Cyan);

			$(
				eprintln!(
					"[{}][{}:{}] {} = {:#?}",
					$level, file, line, stringify!($val), &$val
				);
			)+
		}
	}};
}
