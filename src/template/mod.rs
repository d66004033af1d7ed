//! OF-020: OpenNebula dynamic templates.
//!
//! A template is an ordered list of elements, each either a pair
//! `KEY = "value"` or a vector `KEY = [ A = "1", B = "2" ]`. Keys are
//! upper-cased on insertion and parse. Several elements may share a key
//! (one `DISK` vector per disk).

pub mod parser;
pub mod section;
pub mod tags;
pub mod vm;

use std::fmt;
use std::str::FromStr;

/// A `KEY = "value"` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: String,
    pub value: String,
}

/// A `KEY = [ ... ]` vector of pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vector {
    pub key: String,
    pub pairs: Vec<Pair>,
}

/// A single template element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Pair(Pair),
    Vector(Vector),
}

impl Element {
    pub fn key(&self) -> &str {
        match self {
            Self::Pair(p) => &p.key,
            Self::Vector(v) => &v.key,
        }
    }
}

/// An OpenNebula dynamic template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynTemplate {
    pub elements: Vec<Element>,
}

impl Pair {
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_uppercase(),
            value: value.into(),
        }
    }
}

impl Vector {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_uppercase(),
            pairs: Vec::new(),
        }
    }

    pub fn add_pair(&mut self, key: &str, value: impl ToString) {
        self.pairs.push(Pair::new(key, value.to_string()));
    }

    /// Builder form of [`Vector::add_pair`].
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.add_pair(key, value);
        self
    }

    /// First value stored under `key` (case-insensitive).
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|p| p.key.eq_ignore_ascii_case(key))
            .map(|p| p.value.as_str())
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get_str(key).and_then(|v| v.trim().parse().ok())
    }

    /// Remove every pair named `key`. Returns the number removed.
    pub fn del(&mut self, key: &str) -> usize {
        let before = self.pairs.len();
        self.pairs.retain(|p| !p.key.eq_ignore_ascii_case(key));
        before - self.pairs.len()
    }
}

impl DynTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn add_pair(&mut self, key: &str, value: impl ToString) {
        self.elements
            .push(Element::Pair(Pair::new(key, value.to_string())));
    }

    pub fn add_vector(&mut self, vector: Vector) {
        self.elements.push(Element::Vector(vector));
    }

    /// Replace every element named `key` with a single pair.
    pub fn set_pair(&mut self, key: &str, value: impl ToString) {
        self.del(key);
        self.add_pair(key, value);
    }

    /// First pair value stored under `key` (case-insensitive).
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.elements.iter().find_map(|e| match e {
            Element::Pair(p) if p.key.eq_ignore_ascii_case(key) => Some(p.value.as_str()),
            _ => None,
        })
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get_str(key).and_then(|v| v.trim().parse().ok())
    }

    /// First vector stored under `key` (case-insensitive).
    pub fn get_vector(&self, key: &str) -> Option<&Vector> {
        self.vectors(key).next()
    }

    /// All vectors stored under `key`, in document order.
    pub fn vectors<'a, 'k>(&'a self, key: &'k str) -> impl Iterator<Item = &'a Vector> + use<'a, 'k> {
        self.elements.iter().filter_map(move |e| match e {
            Element::Vector(v) if v.key.eq_ignore_ascii_case(key) => Some(v),
            _ => None,
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.elements.iter().any(|e| e.key().eq_ignore_ascii_case(key))
    }

    /// Remove every pair and vector named `key`. Returns the number removed.
    pub fn del(&mut self, key: &str) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| !e.key().eq_ignore_ascii_case(key));
        before - self.elements.len()
    }

    /// Merge-mode update: each key present in `other` replaces all of this
    /// template's elements with that key; other keys are kept.
    pub fn merge(&mut self, other: &DynTemplate) {
        let mut replaced: Vec<&str> = Vec::new();
        for element in &other.elements {
            if !replaced.iter().any(|k| k.eq_ignore_ascii_case(element.key())) {
                self.del(element.key());
                replaced.push(element.key());
            }
        }
        self.elements.extend(other.elements.iter().cloned());
    }

    /// Top-level pairs, minus the excluded keys, as a sorted map.
    pub fn flatten_pairs(&self, exclude: &[&str]) -> std::collections::BTreeMap<String, String> {
        self.elements
            .iter()
            .filter_map(|e| match e {
                Element::Pair(p) if !exclude.iter().any(|x| x.eq_ignore_ascii_case(&p.key)) => {
                    Some((p.key.clone(), p.value.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Render to OpenNebula template text.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

/// Re-key `actual` with the declared spelling of each key. Templates
/// upper-case keys, declarations need not.
pub fn respell(
    actual: std::collections::BTreeMap<String, String>,
    declared: &std::collections::BTreeMap<String, String>,
) -> std::collections::BTreeMap<String, String> {
    actual
        .into_iter()
        .map(|(key, value)| {
            let key = declared
                .keys()
                .find(|d| d.eq_ignore_ascii_case(&key))
                .cloned()
                .unwrap_or(key);
            (key, value)
        })
        .collect()
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl fmt::Display for DynTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.elements {
            match element {
                Element::Pair(p) => writeln!(f, "{}=\"{}\"", p.key, escape(&p.value))?,
                Element::Vector(v) => {
                    if v.pairs.is_empty() {
                        writeln!(f, "{}=[]", v.key)?;
                        continue;
                    }
                    writeln!(f, "{}=[", v.key)?;
                    let last = v.pairs.len() - 1;
                    for (i, p) in v.pairs.iter().enumerate() {
                        let sep = if i == last { " ]" } else { "," };
                        writeln!(f, "  {}=\"{}\"{}", p.key, escape(&p.value), sep)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl FromStr for DynTemplate {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parser::parse(s)
    }
}
