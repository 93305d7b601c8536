//! Line-oriented classad records, the wire format of the collector.
//!
//! One record is a sequence of `Name = Value` lines. Integers are emitted
//! bare, strings double-quoted with `\"` and `\n` escapes, everything else
//! (constraint expressions) verbatim. Records in a multi-classad file are
//! separated by exactly one blank line and the file never starts with one.

use crate::Map;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdValue {
    Int(i64),
    Str(String),
    /// Unquoted classad expression, e.g. a `Requirements` clause.
    Expr(String),
}

impl AdValue {
    /// The raw string form used when the value becomes part of a fold key.
    pub fn key_string(&self) -> String {
        match self {
            AdValue::Int(i) => i.to_string(),
            AdValue::Str(s) | AdValue::Expr(s) => s.clone(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AdValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AdValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A single classad record. Attribute order is preserved so emitted files
/// stay diffable across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassAd {
    attrs: Vec<(String, AdValue)>,
}

impl ClassAd {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.set(name, AdValue::Int(value));
    }

    pub fn set_str(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, AdValue::Str(value.into()));
    }

    pub fn set_expr(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, AdValue::Expr(value.into()));
    }

    pub fn set(&mut self, name: &str, value: AdValue) {
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&AdValue> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Lookup falling back to a case-insensitive match, the way query
    /// results are folded.
    pub fn get_ci(&self, name: &str) -> Option<&AdValue> {
        self.get(name).or_else(|| {
            self.attrs
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_int())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AdValue)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Serialize the record, one attribute per line, trailing newline on the
    /// last line.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.attrs {
            out.push_str(name);
            out.push_str(" = ");
            match value {
                AdValue::Int(i) => out.push_str(&i.to_string()),
                AdValue::Str(s) => {
                    out.push('"');
                    out.push_str(&escape_string(s));
                    out.push('"');
                }
                AdValue::Expr(e) => out.push_str(e),
            }
            out.push('\n');
        }
        out
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('"') => out.push('"'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Serialize several records into one multi-classad file body.
pub fn serialize_multi(ads: &[ClassAd]) -> String {
    ads.iter()
        .map(|ad| ad.serialize())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a (possibly multi-record) classad file body.
///
/// Unparsable lines are skipped; the collector tools emit comments and
/// banners around `-long` output that are not part of any record.
pub fn parse_records(body: &str) -> Vec<ClassAd> {
    let mut records = Vec::new();
    let mut current = ClassAd::new();
    for line in body.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((name, value)) = parse_attr_line(line) {
            current.set(&name, value);
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn parse_attr_line(line: &str) -> Option<(String, AdValue)> {
    let eq = line.find('=')?;
    let name = line[..eq].trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    let raw = line[eq + 1..].trim();
    let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        AdValue::Str(unescape_string(&raw[1..raw.len() - 1]))
    } else if let Ok(i) = raw.parse::<i64>() {
        AdValue::Int(i)
    } else {
        AdValue::Expr(raw.to_string())
    };
    Some((name.to_string(), value))
}

/// Fold records into a map keyed by the values of `key_attrs`.
///
/// Each key component is taken from the record by exact name, falling back
/// to a case-insensitive match; a component missing both ways is dropped
/// from the key. Records sharing a key silently overwrite earlier ones.
pub fn fold_by_key(records: Vec<ClassAd>, key_attrs: &[&str]) -> Map<Vec<String>, ClassAd> {
    let mut out: Map<Vec<String>, ClassAd> = Map::new();
    for record in records {
        let mut key = Vec::with_capacity(key_attrs.len());
        for attr in key_attrs {
            if let Some(v) = record.get_ci(attr) {
                key.push(v.key_string());
            }
        }
        out.insert(key, record);
    }
    out
}
