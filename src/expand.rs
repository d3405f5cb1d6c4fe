//! Turning words into strings.
//!
//! Brace expansion runs first and may multiply a word; every resulting word
//! then evaluates to exactly one string.

pub mod brace;

use crate::ast::{Word, WordPart};
use crate::prelude::*;
use crate::state::Mem;

use brace::brace_expand_words;

pub struct Expander<'a> {
	mem: &'a Mem,
	nounset: bool,
}

impl<'a> Expander<'a> {
	pub fn new(mem: &'a Mem) -> Self {
		Self { mem, nounset: false }
	}
	/// Make unset variables an error
	pub fn nounset(self, nounset: bool) -> Self {
		Self { nounset, ..self }
	}

	/// Evaluate one word to a string, without brace expansion
	pub fn eval_word(&self, word: &Word) -> ShResult<String> {
		let mut result = String::new();
		for part in &word.parts {
			match part {
				WordPart::Literal(text) | WordPart::Quoted(text) => result.push_str(text),
				WordPart::VarSub { name, default } => result.push_str(&self.eval_var(name, default.as_ref())?),
				WordPart::Alt(_) | WordPart::Range(_) => result.push_str(&part.to_string()),
			}
		}
		Ok(result)
	}

	fn eval_var(&self, name: &str, default: Option<&Word>) -> ShResult<String> {
		match self.mem.lookup_param(name) {
			Some(val) if !(default.is_some() && val.is_empty()) => Ok(val),
			_ => match default {
				Some(default) => self.eval_word(default),
				None if self.nounset => {
					Err(ShErr::simple(ShErrKind::ExpansionErr, format!("{name}: unbound variable")))
				}
				None => Ok(String::new()),
			},
		}
	}

	/// Brace expand each word, then evaluate every result
	pub fn eval_words(&self, words: &[Word]) -> ShResult<Vec<String>> {
		brace_expand_words(words).iter().map(|word| self.eval_word(word)).collect()
	}
}
