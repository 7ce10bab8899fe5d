//! Tag selection parsing and matching.
//!
//! A tag selection maps tag names to the set of values a requester accepts.
//! A host matches when, for every selected name, it carries that tag with
//! one of the accepted values. Names and values are compared lowercased.
//!
//! Two textual forms are accepted:
//! - structured literal: `{'env': ['prod', 'test'], 'tier': 'gold'}`
//! - flat form: `env=prod|test, tier=gold`
//!
//! The sentinels `None`, `{}` and the empty string mean "no selection".

use std::collections::{BTreeMap, BTreeSet};
use std::iter::Peekable;
use std::str::CharIndices;

use crate::types::HostTags;

/// Why a tag selection string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagSelectionError {
    /// Unexpected character or premature end of input.
    #[error("malformed tag selection at offset {offset}: {detail}")]
    Syntax {
        /// Byte offset into the input.
        offset: usize,
        /// What was expected.
        detail: String,
    },
    /// A tag name was empty.
    #[error("tag selection contains an empty tag name")]
    EmptyName,
    /// A tag listed no acceptable values.
    #[error("tag {0:?} has no acceptable values")]
    NoValues(String),
}

/// Accepted values per tag name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSelection {
    required: BTreeMap<String, BTreeSet<String>>,
}

impl TagSelection {
    /// Parse a selection string.
    ///
    /// Returns `Ok(None)` for the "no selection" sentinels.
    ///
    /// # Errors
    ///
    /// Returns [`TagSelectionError`] for anything that is neither a sentinel
    /// nor a well-formed selection.
    pub fn parse(raw: &str) -> Result<Option<Self>, TagSelectionError> {
        let normalized = raw.trim().to_lowercase();
        if is_sentinel(&normalized) {
            return Ok(None);
        }
        let required = if normalized.starts_with('{') {
            LiteralParser::new(&normalized).parse()?
        } else {
            parse_flat(&normalized)?
        };
        if required.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { required }))
    }

    /// Build a selection from explicit pairs, lowercasing everything.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: IntoIterator,
        V::Item: AsRef<str>,
    {
        let required = pairs
            .into_iter()
            .map(|(name, values)| {
                let values = values
                    .into_iter()
                    .map(|v| v.as_ref().trim().to_lowercase())
                    .collect();
                (name.as_ref().trim().to_lowercase(), values)
            })
            .collect();
        Self { required }
    }

    /// Whether `host_tags` satisfies every selected tag.
    pub fn matches(&self, host_tags: &HostTags) -> bool {
        matches(host_tags, &self.required)
    }

    /// Selected tag names and their accepted values.
    pub fn required(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.required
    }
}

/// Check `host_tags` against a selection.
///
/// True iff every selected name is present on the host with an accepted
/// value. An empty selection is vacuously true; callers decide upstream
/// whether tags are evaluated at all.
pub fn matches(host_tags: &HostTags, selection: &BTreeMap<String, BTreeSet<String>>) -> bool {
    selection.iter().all(|(name, accepted)| {
        host_tags
            .get(name)
            .or_else(|| {
                host_tags
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .is_some_and(|value| accepted.contains(&value.trim().to_lowercase()))
    })
}

fn is_sentinel(normalized: &str) -> bool {
    normalized.is_empty()
        || normalized == "none"
        || normalized.chars().filter(|c| !c.is_whitespace()).eq("{}".chars())
}

/// `env=prod|test, tier=gold`.
fn parse_flat(input: &str) -> Result<BTreeMap<String, BTreeSet<String>>, TagSelectionError> {
    let mut required: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut offset = 0_usize;

    for clause in input.split(',') {
        let clause_offset = offset;
        offset = offset.saturating_add(clause.len()).saturating_add(1);
        if clause.trim().is_empty() {
            continue;
        }
        let Some((name, values)) = clause.split_once('=').or_else(|| clause.split_once(':'))
        else {
            return Err(TagSelectionError::Syntax {
                offset: clause_offset,
                detail: format!("expected name=value, found {:?}", clause.trim()),
            });
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(TagSelectionError::EmptyName);
        }
        let values: BTreeSet<String> = values
            .split('|')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .collect();
        if values.is_empty() {
            return Err(TagSelectionError::NoValues(name.to_owned()));
        }
        required.entry(name.to_owned()).or_default().extend(values);
    }

    Ok(required)
}

/// Recursive-descent parser for the structured literal form.
struct LiteralParser<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> LiteralParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn parse(mut self) -> Result<BTreeMap<String, BTreeSet<String>>, TagSelectionError> {
        let mut required = BTreeMap::new();
        self.expect('{')?;
        loop {
            self.skip_whitespace();
            if self.eat('}') {
                break;
            }
            let name = self.string()?;
            if name.trim().is_empty() {
                return Err(TagSelectionError::EmptyName);
            }
            self.skip_whitespace();
            self.expect(':')?;
            self.skip_whitespace();
            let values = self.values()?;
            if values.is_empty() {
                return Err(TagSelectionError::NoValues(name));
            }
            required.insert(name.trim().to_owned(), values);

            self.skip_whitespace();
            if self.eat(',') {
                continue;
            }
            self.expect('}')?;
            break;
        }
        self.skip_whitespace();
        if let Some(&(offset, c)) = self.chars.peek() {
            return Err(self.syntax(offset, format!("trailing input {c:?}")));
        }
        Ok(required)
    }

    fn values(&mut self) -> Result<BTreeSet<String>, TagSelectionError> {
        let close = match self.chars.peek() {
            Some(&(_, '[')) => ']',
            Some(&(_, '(')) => ')',
            Some(&(_, '{')) => '}',
            _ => return Ok(BTreeSet::from([self.string()?.trim().to_owned()])),
        };
        self.chars.next();

        let mut values = BTreeSet::new();
        loop {
            self.skip_whitespace();
            if self.eat(close) {
                break;
            }
            values.insert(self.string()?.trim().to_owned());
            self.skip_whitespace();
            if self.eat(',') {
                continue;
            }
            self.expect(close)?;
            break;
        }
        Ok(values)
    }

    fn string(&mut self) -> Result<String, TagSelectionError> {
        let (start, quote) = match self.chars.next() {
            Some((offset, c @ ('\'' | '"'))) => (offset, c),
            Some((offset, c)) => {
                return Err(self.syntax(offset, format!("expected quoted string, found {c:?}")))
            }
            None => return Err(self.end_of_input("quoted string")),
        };

        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => return Err(self.end_of_input("escaped character")),
                },
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, c)) => out.push(c),
                None => {
                    return Err(self.syntax(start, "unterminated string".to_owned()));
                }
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|&(_, c)| c.is_whitespace()).is_some() {}
    }

    fn eat(&mut self, expected: char) -> bool {
        self.chars.next_if(|&(_, c)| c == expected).is_some()
    }

    fn expect(&mut self, expected: char) -> Result<(), TagSelectionError> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            Some((offset, c)) => Err(self.syntax(offset, format!("expected {expected:?}, found {c:?}"))),
            None => Err(self.end_of_input(&format!("{expected:?}"))),
        }
    }

    fn syntax(&self, offset: usize, detail: String) -> TagSelectionError {
        TagSelectionError::Syntax { offset, detail }
    }

    fn end_of_input(&self, expected: &str) -> TagSelectionError {
        TagSelectionError::Syntax {
            offset: self.input.len(),
            detail: format!("expected {expected}, found end of input"),
        }
    }
}
