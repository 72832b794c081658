//! G-code line model: a trivial tokenizer plus a typed, semantics-free view
//! over the parsed letter → number map.
//!
//! A line is `[A-Z][±digits.digits]` words interleaved with whitespace,
//! `;…` end-of-line comments and `(…)` inline comments. Lines starting with
//! `%` carry no command. The parser rejects lines whose tokenised words do not
//! reconstruct the stripped input exactly, repeated letters, and lines
//! carrying both a `G` and an `M` word. Interpretation of the words (units,
//! modes, limits) belongs to the dispatcher, not here.

use std::collections::HashMap;
use std::sync::LazyLock;

use core_geometry::Vector4;
use regex::Regex;
use thiserror::Error;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z])([-+]?[0-9.]+)").expect("static regex"));
static CLEAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+|\(.*?\)|;.*").expect("static regex"));

/// Errors produced while tokenising a G-code line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("gcode not found")]
    NoWords,
    #[error("extra characters in line")]
    ExtraCharacters,
    #[error("duplicated gcode entries")]
    DuplicatedWords,
    #[error("g and m command found")]
    AmbiguousCommand,
    #[error("bad number '{0}'")]
    BadNumber(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Word {
    raw: String,
    value: f64,
}

/// One parsed G-code line. Create with [`GcodeLine::parse`].
#[derive(Debug, Clone, PartialEq)]
pub struct GcodeLine {
    words: HashMap<char, Word>,
}

impl GcodeLine {
    /// Parse a raw input line. `Ok(None)` means the line carries nothing to
    /// execute (empty, comment-only, or a `%` program marker).
    pub fn parse(line: &str) -> Result<Option<GcodeLine>, ParseError> {
        let line = line.to_uppercase();
        let stripped = CLEAN_RE.replace_all(&line, "");
        if stripped.is_empty() {
            return Ok(None);
        }
        if stripped.starts_with('%') {
            return Ok(None);
        }

        let pairs: Vec<(char, String)> = WORD_RE
            .captures_iter(&stripped)
            .map(|cap| {
                let letter = cap[1].chars().next().expect("single letter group");
                (letter, cap[2].to_string())
            })
            .collect();
        if pairs.is_empty() {
            return Err(ParseError::NoWords);
        }
        let matched_len: usize = pairs.iter().map(|(_, raw)| 1 + raw.len()).sum();
        if matched_len != stripped.len() {
            return Err(ParseError::ExtraCharacters);
        }
        let mut words = HashMap::new();
        for (letter, raw) in pairs {
            let value = raw
                .parse::<f64>()
                .map_err(|_| ParseError::BadNumber(raw.clone()))?;
            if words.insert(letter, Word { raw, value }).is_some() {
                return Err(ParseError::DuplicatedWords);
            }
        }
        if words.contains_key(&'G') && words.contains_key(&'M') {
            return Err(ParseError::AmbiguousCommand);
        }
        Ok(Some(GcodeLine { words }))
    }

    /// The command word (`"G1"`, `"M104"`, …) or `None` when the line has only
    /// parameters. The numeric part is kept verbatim, so `G01` stays `G01`.
    pub fn command(&self) -> Option<String> {
        if let Some(w) = self.words.get(&'G') {
            return Some(format!("G{}", w.raw));
        }
        if let Some(w) = self.words.get(&'M') {
            return Some(format!("M{}", w.raw));
        }
        None
    }

    pub fn has(&self, letter: char) -> bool {
        self.words.contains_key(&letter)
    }

    /// Value of `letter` times `multiplier`, or `default` when absent.
    pub fn get(&self, letter: char, default: f64, multiplier: f64) -> f64 {
        match self.words.get(&letter) {
            Some(w) => w.value * multiplier,
            None => default,
        }
    }

    /// X/Y/Z/E words as a vector, falling back per axis to `default`.
    pub fn coordinates(&self, default: Vector4, multiplier: f64) -> Vector4 {
        Vector4::new(
            self.get('X', default.x, multiplier),
            self.get('Y', default.y, multiplier),
            self.get('Z', default.z, multiplier),
            self.get('E', default.e, multiplier),
        )
    }

    /// Arc centre offsets: I→x, J→y, K→z. The e component is always zero.
    pub fn radius(&self, default: Vector4, multiplier: f64) -> Vector4 {
        Vector4::new(
            self.get('I', default.x, multiplier),
            self.get('J', default.y, multiplier),
            self.get('K', default.z, multiplier),
            0.0,
        )
    }

    pub fn has_coordinates(&self) -> bool {
        self.has('X') || self.has('Y') || self.has('Z') || self.has('E')
    }
}
