use std::{fmt, sync::LazyLock};

use regex::Regex;

use crate::{
	ast::{Word, WordPart},
	prelude::*,
};

static INT_RANGE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^(-?\d+)\.\.(-?\d+)(?:\.\.(-?\d+))?$").unwrap());
static CHAR_RANGE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^([a-zA-Z])\.\.([a-zA-Z])(?:\.\.(-?\d+))?$").unwrap());

/// A sequence group such as `{1..10}`, `{01..10..3}` or `{a..e}`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BraceRange {
	Int { start: i64, end: i64, step: u64, width: usize },
	Char { start: char, end: char, step: u32 },
}

impl BraceRange {
	/// Parse the body of a comma-free brace group. Returns `None` when the
	/// body is not a range, or when a character range mixes letter cases.
	pub fn parse(body: &str) -> Option<Self> {
		if let Some(caps) = INT_RANGE.captures(body) {
			let left = &caps[1];
			let right = &caps[2];
			let start = left.parse::<i64>().ok()?;
			let end = right.parse::<i64>().ok()?;
			let step = Self::parse_step(caps.get(3).map(|m| m.as_str()))?;

			let padded = |s: &str| {
				let digits = s.trim_start_matches('-');
				digits.len() > 1 && digits.starts_with('0')
			};
			let width = if padded(left) || padded(right) { left.len().max(right.len()) } else { 0 };
			return Some(Self::Int { start, end, step, width })
		}

		let caps = CHAR_RANGE.captures(body)?;
		let start = caps[1].chars().next()?;
		let end = caps[2].chars().next()?;
		if start.is_ascii_uppercase() != end.is_ascii_uppercase() {
			return None
		}
		let step = Self::parse_step(caps.get(3).map(|m| m.as_str()))?;
		Some(Self::Char { start, end, step: u32::try_from(step).ok()? })
	}

	/// Zero and negative steps count as their magnitude, with zero meaning one
	fn parse_step(step: Option<&str>) -> Option<u64> {
		let Some(step) = step else { return Some(1) };
		let step = step.parse::<i64>().ok()?.unsigned_abs();
		Some(step.max(1))
	}

	/// The words this range stands for, walking from start toward end
	pub fn values(&self) -> Vec<String> {
		match *self {
			Self::Int { start, end, step, width } => {
				let step = i64::try_from(step).unwrap_or(i64::MAX);
				let mut values = vec![];
				let mut cur = start;
				loop {
					values.push(format!("{cur:0width$}"));
					let next = if start <= end { cur.checked_add(step) } else { cur.checked_sub(step) };
					match next {
						Some(next) if (start <= end && next <= end) || (start > end && next >= end) => cur = next,
						_ => break,
					}
				}
				values
			}
			Self::Char { start, end, step } => {
				let (lo, hi) = (start as u32, end as u32);
				let mut values = vec![];
				let mut cur = lo;
				loop {
					if let Some(ch) = char::from_u32(cur) {
						values.push(ch.to_string());
					}
					let next = if lo <= hi { cur.checked_add(step) } else { cur.checked_sub(step) };
					match next {
						Some(next) if (lo <= hi && next <= hi) || (lo > hi && next >= hi) => cur = next,
						_ => break,
					}
				}
				values
			}
		}
	}
}

impl fmt::Display for BraceRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match *self {
			Self::Int { start, end, step, width } => {
				write!(f, "{{{start:0width$}..{end:0width$}")?;
				if step != 1 {
					write!(f, "..{step}")?;
				}
				write!(f, "}}")
			}
			Self::Char { start, end, step } => {
				write!(f, "{{{start}..{end}")?;
				if step != 1 {
					write!(f, "..{step}")?;
				}
				write!(f, "}}")
			}
		}
	}
}

/// Find the brace groups in a word and fold them into alternation parts.
///
/// Returns `None` when the word has no valid group, including when its braces
/// are unbalanced. Detection is all or nothing: one bad brace leaves the whole
/// word literal.
pub fn brace_detect(word: &Word) -> Option<Word> {
	// One entry per open brace: the parts that preceded it, and the
	// alternatives closed so far inside it.
	let mut parts_stack: Vec<Vec<WordPart>> = vec![];
	let mut alts_stack: Vec<Vec<Word>> = vec![];
	let mut cur_parts: Vec<WordPart> = vec![];
	let mut found = false;

	for part in &word.parts {
		debug_assert_eq!(parts_stack.len(), alts_stack.len());
		match part.brace_marker() {
			Some('{') => {
				parts_stack.push(std::mem::take(&mut cur_parts));
				alts_stack.push(vec![]);
			}
			Some(',') if !alts_stack.is_empty() => {
				let alt = Word::new(std::mem::take(&mut cur_parts));
				if let Some(alts) = alts_stack.last_mut() {
					alts.push(alt);
				}
			}
			Some('}') => {
				let (Some(outer), Some(mut alts)) = (parts_stack.pop(), alts_stack.pop()) else {
					flog!(DEBUG, "unmatched closing brace in {}", word);
					return None
				};
				let body = std::mem::replace(&mut cur_parts, outer);
				if alts.is_empty() {
					// No comma at this depth
					if let Some(range) = range_body(&body) {
						cur_parts.push(WordPart::Range(range));
						found = true;
					} else {
						cur_parts.push(WordPart::lit("{"));
						cur_parts.extend(body);
						cur_parts.push(WordPart::lit("}"));
					}
				} else {
					alts.push(Word::new(body));
					cur_parts.push(WordPart::Alt(alts));
					found = true;
				}
			}
			_ => cur_parts.push(part.clone()),
		}
	}

	if !parts_stack.is_empty() {
		flog!(DEBUG, "unmatched opening brace in {}", word);
		return None
	}
	found.then(|| Word::new(cur_parts))
}

fn range_body(body: &[WordPart]) -> Option<BraceRange> {
	match body {
		[WordPart::Literal(text)] => BraceRange::parse(text),
		_ => None,
	}
}

/// Expand a part sequence containing alternation parts into every concrete
/// part sequence it denotes. The leftmost group varies slowest.
pub fn brace_expand(parts: &[WordPart]) -> Vec<Vec<WordPart>> {
	let mut alt_positions = parts
		.iter()
		.enumerate()
		.filter(|(_, part)| part.is_alternation())
		.map(|(i, _)| i);

	let Some(first) = alt_positions.next() else {
		return vec![parts.to_vec()]
	};
	let suffixes = match alt_positions.next() {
		Some(second) => {
			let mut suffixes = brace_expand(&parts[second..]);
			for suffix in suffixes.iter_mut() {
				suffix.splice(0..0, parts[first + 1..second].iter().cloned());
			}
			suffixes
		}
		None => vec![parts[first + 1..].to_vec()],
	};

	expand_first(&parts[..first], &parts[first], &suffixes)
}

fn expand_first(prefix: &[WordPart], alt: &WordPart, suffixes: &[Vec<WordPart>]) -> Vec<Vec<WordPart>> {
	let alternatives: Vec<Vec<WordPart>> = match alt {
		WordPart::Alt(words) => words.iter().flat_map(|word| brace_expand(&word.parts)).collect(),
		WordPart::Range(range) => range.values().into_iter().map(|v| vec![WordPart::Literal(v)]).collect(),
		_ => vec![vec![alt.clone()]],
	};

	let mut results = Vec::with_capacity(alternatives.len() * suffixes.len());
	for expanded in &alternatives {
		for suffix in suffixes {
			let mut result = prefix.to_vec();
			result.extend(expanded.iter().cloned());
			result.extend(suffix.iter().cloned());
			results.push(result);
		}
	}
	results
}

/// Brace expand a single word. A word without valid groups comes back alone
/// and unchanged.
pub fn brace_expand_word(word: &Word) -> Vec<Word> {
	match brace_detect(word) {
		Some(detected) => brace_expand(&detected.parts).into_iter().map(Word::new).collect(),
		None => vec![word.clone()],
	}
}

pub fn brace_expand_words(words: &[Word]) -> Vec<Word> {
	words.iter().flat_map(brace_expand_word).collect()
}
