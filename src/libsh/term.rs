use std::{fmt::Display, ops::BitOr};

pub trait Styled: Sized + Display {
	fn styled<S: Into<StyleSet>>(self, style: S) -> String {
		let styles: StyleSet = style.into();
		let reset = Style::Reset;
		format!("{styles}{self}{reset}")
	}
}

impl<T: Display> Styled for T {}

/// A single ANSI escape used by the log and error printers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
	Reset,
	Red,
	Green,
	Yellow,
	Blue,
	Magenta,
	Cyan,
	Bold,
	Dim,
}

impl Display for Style {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Style::Reset => write!(f, "\x1b[0m"),
			Style::Red => write!(f, "\x1b[31m"),
			Style::Green => write!(f, "\x1b[32m"),
			Style::Yellow => write!(f, "\x1b[33m"),
			Style::Blue => write!(f, "\x1b[34m"),
			Style::Magenta => write!(f, "\x1b[35m"),
			Style::Cyan => write!(f, "\x1b[36m"),
			Style::Bold => write!(f, "\x1b[1m"),
			Style::Dim => write!(f, "\x1b[2m"),
		}
	}
}

/// An ordered set of styles, built with `|`
#[derive(Debug, Default, Clone)]
pub struct StyleSet {
	styles: Vec<Style>,
}

impl StyleSet {
	pub fn new() -> Self {
		Self { styles: vec![] }
	}

	pub fn styles(&self) -> &[Style] {
		&self.styles
	}

	pub fn add_style(mut self, style: Style) -> Self {
		if !self.styles.contains(&style) {
			self.styles.push(style);
		}
		self
	}
}

impl Display for StyleSet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		for style in &self.styles {
			style.fmt(f)?
		}
		Ok(())
	}
}

impl BitOr for Style {
	type Output = StyleSet;

	fn bitor(self, rhs: Self) -> Self::Output {
		StyleSet::new().add_style(self).add_style(rhs)
	}
}

impl BitOr<Style> for StyleSet {
	type Output = StyleSet;

	fn bitor(self, rhs: Style) -> Self::Output {
		self.add_style(rhs)
	}
}

impl From<Style> for StyleSet {
	fn from(style: Style) -> Self {
		StyleSet::new().add_style(style)
	}
}
