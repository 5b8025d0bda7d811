//! Capability descriptors
//!
//! A `Caps` is an immutable set of alternative `Structure`s, each a media
//! type name plus typed attributes. Caps can be intersected, tested for
//! being a subset of another caps, and classified as raw (terminal) media.
//!
//! Two special values exist besides the structure list:
//! - `ANY`: the type is not known yet (autoplugging is deferred)
//! - `EMPTY`: no type can be produced (unknown stream)
//!
//! The textual form follows the familiar media caps notation:
//!
//! ```text
//! video/x-raw, format=I420, width=[ 16, 4096 ]; audio/x-raw, channels={ 1, 2 }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Typed attribute value inside a `Structure`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    /// Inclusive integer range
    IntRange(i64, i64),
    Str(String),
    /// Set of alternatives; intersects with any member
    List(Vec<Value>),
}

impl Value {
    /// Intersect two values, `None` when they are disjoint
    pub fn intersect(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::List(items), v) | (v, Value::List(items)) => {
                let mut out: Vec<Value> = items.iter().filter_map(|i| i.intersect(v)).collect();
                out.dedup();
                match out.len() {
                    0 => None,
                    1 => out.pop(),
                    _ => Some(Value::List(out)),
                }
            }
            (Value::Int(a), Value::IntRange(lo, hi)) | (Value::IntRange(lo, hi), Value::Int(a)) => {
                (lo <= a && a <= hi).then_some(Value::Int(*a))
            }
            (Value::IntRange(a_lo, a_hi), Value::IntRange(b_lo, b_hi)) => {
                let lo = (*a_lo).max(*b_lo);
                let hi = (*a_hi).min(*b_hi);
                match lo.cmp(&hi) {
                    std::cmp::Ordering::Greater => None,
                    std::cmp::Ordering::Equal => Some(Value::Int(lo)),
                    std::cmp::Ordering::Less => Some(Value::IntRange(lo, hi)),
                }
            }
            (a, b) if a == b => Some(a.clone()),
            _ => None,
        }
    }

    /// True if every concrete value of `self` is allowed by `other`
    pub fn is_subset_of(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(items), _) => items.iter().all(|i| i.is_subset_of(other)),
            (_, Value::List(items)) => items.iter().any(|i| self.is_subset_of(i)),
            (Value::Int(a), Value::IntRange(lo, hi)) => lo <= a && a <= hi,
            (Value::IntRange(a_lo, a_hi), Value::IntRange(b_lo, b_hi)) => b_lo <= a_lo && a_hi <= b_hi,
            (a, b) => a == b,
        }
    }

    /// A fixed value names exactly one alternative
    pub fn is_fixed(&self) -> bool {
        !matches!(self, Value::IntRange(..) | Value::List(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::IntRange(lo, hi) => write!(f, "[ {}, {} ]", lo, hi),
            Value::Str(s) => {
                if s.chars().all(|c| c.is_alphanumeric() || "-_./+".contains(c)) && !s.is_empty() {
                    write!(f, "{}", s)
                } else {
                    write!(f, "\"{}\"", s)
                }
            }
            Value::List(items) => {
                write!(f, "{{ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// One media type alternative: a name plus attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    name: String,
    fields: BTreeMap<String, Value>,
}

impl Structure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn intersect(&self, other: &Structure) -> Option<Structure> {
        if self.name != other.name {
            return None;
        }
        let mut fields = self.fields.clone();
        for (key, theirs) in &other.fields {
            match fields.get(key) {
                Some(ours) => {
                    let merged = ours.intersect(theirs)?;
                    fields.insert(key.clone(), merged);
                }
                None => {
                    fields.insert(key.clone(), theirs.clone());
                }
            }
        }
        Some(Structure {
            name: self.name.clone(),
            fields,
        })
    }

    /// Every field constrained by `other` is present here and within bounds
    pub fn is_subset_of(&self, other: &Structure) -> bool {
        self.name == other.name && self.fields_satisfy(other)
    }

    fn fields_satisfy(&self, other: &Structure) -> bool {
        other.fields.iter().all(|(key, theirs)| match self.fields.get(key) {
            Some(ours) => ours.is_subset_of(theirs),
            None => false,
        })
    }

    pub fn is_fixed(&self) -> bool {
        self.fields.values().all(Value::is_fixed)
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.fields {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Capability descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Caps {
    any: bool,
    structures: Vec<Structure>,
}

impl Caps {
    /// Caps whose type is not known yet
    pub fn new_any() -> Self {
        Self {
            any: true,
            structures: Vec::new(),
        }
    }

    /// Caps that match nothing
    pub fn new_empty() -> Self {
        Self {
            any: false,
            structures: Vec::new(),
        }
    }

    /// Caps with a single field-less structure
    pub fn new_simple(name: impl Into<String>) -> Self {
        Self::from_structures(vec![Structure::new(name)])
    }

    pub fn from_structures(structures: Vec<Structure>) -> Self {
        Self {
            any: false,
            structures,
        }
    }

    pub fn is_any(&self) -> bool {
        self.any
    }

    pub fn is_empty(&self) -> bool {
        !self.any && self.structures.is_empty()
    }

    /// Number of alternative structures (zero for ANY and EMPTY)
    pub fn size(&self) -> usize {
        self.structures.len()
    }

    pub fn structures(&self) -> &[Structure] {
        &self.structures
    }

    pub fn structure(&self, idx: usize) -> Option<&Structure> {
        self.structures.get(idx)
    }

    /// Fixed caps describe exactly one format
    pub fn is_fixed(&self) -> bool {
        !self.any && self.structures.len() == 1 && self.structures[0].is_fixed()
    }

    /// Count structures with distinct media type names
    pub fn distinct_type_count(&self) -> usize {
        let mut names: Vec<&str> = self.structures.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.len()
    }

    pub fn intersect(&self, other: &Caps) -> Caps {
        if self.any {
            return other.clone();
        }
        if other.any {
            return self.clone();
        }
        let mut out: Vec<Structure> = Vec::new();
        for ours in &self.structures {
            for theirs in &other.structures {
                if let Some(s) = ours.intersect(theirs) {
                    if !out.contains(&s) {
                        out.push(s);
                    }
                }
            }
        }
        Caps::from_structures(out)
    }

    pub fn can_intersect(&self, other: &Caps) -> bool {
        if self.any || other.any {
            return true;
        }
        self.structures
            .iter()
            .any(|ours| other.structures.iter().any(|theirs| ours.intersect(theirs).is_some()))
    }

    /// Every alternative of `self` is accepted by some alternative of `other`
    pub fn is_subset_of(&self, other: &Caps) -> bool {
        if other.any {
            return true;
        }
        if self.any {
            return false;
        }
        self.structures
            .iter()
            .all(|ours| other.structures.iter().any(|theirs| ours.is_subset_of(theirs)))
    }

    /// Raw-media check against a list of terminal types
    ///
    /// A structure is raw when its name starts with one of the terminal
    /// structure names and it satisfies that structure's field constraints.
    /// ANY and EMPTY caps are never raw.
    pub fn is_raw_media(&self, raw: &Caps) -> bool {
        if self.any || self.structures.is_empty() {
            return false;
        }
        self.structures.iter().all(|ours| {
            raw.structures
                .iter()
                .any(|t| ours.name.starts_with(t.name.as_str()) && ours.fields_satisfy(t))
        })
    }

    /// Media type name of the first structure
    pub fn first_name(&self) -> Option<&str> {
        self.structures.first().map(|s| s.name.as_str())
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return write!(f, "ANY");
        }
        if self.structures.is_empty() {
            return write!(f, "EMPTY");
        }
        for (i, s) in self.structures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", s)?;
        }
        Ok(())
    }
}

impl FromStr for Caps {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed {
            "ANY" => return Ok(Caps::new_any()),
            "EMPTY" | "NONE" | "" => return Ok(Caps::new_empty()),
            _ => {}
        }
        let mut parser = Parser::new(trimmed);
        let mut structures = Vec::new();
        loop {
            structures.push(parser.structure()?);
            parser.skip_ws();
            match parser.peek() {
                Some(';') => {
                    parser.bump();
                    parser.skip_ws();
                    if parser.peek().is_none() {
                        break;
                    }
                }
                None => break,
                Some(c) => return Err(parser.error(&format!("unexpected '{}'", c))),
            }
        }
        Ok(Caps::from_structures(structures))
    }
}

impl TryFrom<String> for Caps {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Caps> for String {
    fn from(caps: Caps) -> String {
        caps.to_string()
    }
}

/// Minimal recursive-descent parser for the caps notation
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", want))),
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::Caps(format!("{} at offset {} in \"{}\"", msg, self.pos, self.input))
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || "-_./+:".contains(c)) {
            self.bump();
        }
        self.input[start..self.pos].to_string()
    }

    fn structure(&mut self) -> Result<Structure> {
        self.skip_ws();
        let name = self.word();
        if name.is_empty() {
            return Err(self.error("expected structure name"));
        }
        let mut structure = Structure::new(name);
        loop {
            self.skip_ws();
            if self.peek() != Some(',') {
                break;
            }
            self.bump();
            self.skip_ws();
            let key = self.word();
            if key.is_empty() {
                return Err(self.error("expected field name"));
            }
            self.expect('=')?;
            let value = self.value()?;
            structure.fields.insert(key, value);
        }
        Ok(structure)
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_ws();
        // Optional "(type)" annotation is accepted and ignored
        if self.peek() == Some('(') {
            while let Some(c) = self.bump() {
                if c == ')' {
                    break;
                }
            }
            self.skip_ws();
        }
        match self.peek() {
            Some('[') => {
                self.bump();
                let lo = self.int()?;
                self.expect(',')?;
                let hi = self.int()?;
                self.expect(']')?;
                if lo > hi {
                    return Err(self.error("empty range"));
                }
                Ok(Value::IntRange(lo, hi))
            }
            Some('{') => {
                self.bump();
                let mut items = vec![self.value()?];
                loop {
                    self.skip_ws();
                    match self.bump() {
                        Some(',') => items.push(self.value()?),
                        Some('}') => break,
                        _ => return Err(self.error("unterminated list")),
                    }
                }
                Ok(Value::List(items))
            }
            Some('"') => {
                self.bump();
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == '"' {
                        break;
                    }
                    self.bump();
                }
                let s = self.input[start..self.pos].to_string();
                self.expect('"')?;
                Ok(Value::Str(s))
            }
            _ => {
                let w = self.word();
                if w.is_empty() {
                    return Err(self.error("expected value"));
                }
                Ok(match w.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => w.parse::<i64>().map(Value::Int).unwrap_or(Value::Str(w)),
                })
            }
        }
    }

    fn int(&mut self) -> Result<i64> {
        self.skip_ws();
        let w = self.word();
        w.parse::<i64>().map_err(|_| self.error("expected integer"))
    }
}
