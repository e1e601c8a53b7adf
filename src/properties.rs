//! Line-oriented `key=value` property storage for `server.properties`.
use std::{fmt, fs, io, path::Path};

use serde::{
    Deserialize, Deserializer,
    de::{MapAccess, Visitor},
};
use tracing::debug;

/// Insertion-ordered property mapping. Keys are unique; the last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, returning the previous value if there was one.
    /// An existing key keeps its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (key, value) in iter {
            props.set(key, value);
        }
        props
    }
}

/// Scalar accepted as a property value in YAML configuration.
#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<ScalarValue> for String {
    fn from(value: ScalarValue) -> Self {
        match value {
            ScalarValue::Bool(v) => v.to_string(),
            ScalarValue::Int(v) => v.to_string(),
            ScalarValue::Float(v) => v.to_string(),
            ScalarValue::Text(v) => v,
        }
    }
}

struct PropertiesVisitor;

impl<'de> Visitor<'de> for PropertiesVisitor {
    type Value = Properties;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a mapping of property names to scalar values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Properties, A::Error> {
        let mut props = Properties::new();
        while let Some((key, value)) = map.next_entry::<String, ScalarValue>()? {
            props.set(key, value);
        }
        Ok(props)
    }
}

/// Deserializes from a mapping, keeping document order.
impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(PropertiesVisitor)
    }
}

/// One physical line of a property file.
#[derive(Debug, Clone)]
enum Line {
    Entry {
        key: String,
        value: String,
        /// Original text, kept so untouched entries are written back verbatim.
        raw: Option<String>,
    },
    Verbatim(String),
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
        return Line::Verbatim(raw.to_string());
    }

    let split_at = trimmed.find(['=', ':']);
    let (key, value) = match split_at {
        Some(index) => (&trimmed[..index], trimmed[index + 1..].trim_start()),
        None => (trimmed, ""),
    };

    Line::Entry {
        key: key.trim_end().to_string(),
        value: value.to_string(),
        raw: Some(raw.to_string()),
    }
}

fn parse_lines(content: &str) -> Vec<Line> {
    content.lines().map(parse_line).collect()
}

fn render_lines(lines: &[Line]) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            Line::Entry {
                raw: Some(raw), ..
            } => out.push_str(raw),
            Line::Entry { key, value, .. } => {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
            }
            Line::Verbatim(raw) => out.push_str(raw),
        }
        out.push('\n');
    }
    out
}

/// Loads the property file at `path`. A missing file yields an empty mapping.
pub fn load_properties(path: &Path) -> io::Result<Properties> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Properties::new()),
        Err(err) => return Err(err),
    };

    let mut props = Properties::new();
    for line in parse_lines(&content) {
        if let Line::Entry { key, value, .. } = line {
            props.set(key, value);
        }
    }
    Ok(props)
}

/// Writes `props` to `path`, replacing any existing file.
pub fn save_properties(path: &Path, props: &Properties) -> io::Result<()> {
    let lines: Vec<Line> = props
        .iter()
        .map(|(key, value)| Line::Entry {
            key: key.to_string(),
            value: value.to_string(),
            raw: None,
        })
        .collect();
    fs::write(path, render_lines(&lines))
}

/// Merges `props` into the file at `path`.
///
/// Existing keys are updated in place, new keys are appended, and every other line
/// (unmanaged keys, comments, blank lines) is written back unchanged.
pub fn merge_properties(path: &Path, props: &Properties) -> io::Result<()> {
    let mut lines = match fs::read_to_string(path) {
        Ok(content) => parse_lines(&content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err),
    };

    for (key, value) in props.iter() {
        let existing = lines.iter_mut().find_map(|line| match line {
            Line::Entry {
                key: existing_key,
                value: existing_value,
                raw,
            } if existing_key == key => Some((existing_value, raw)),
            _ => None,
        });

        match existing {
            Some((existing_value, raw)) => {
                if existing_value != value {
                    *existing_value = value.to_string();
                    *raw = None;
                }
            }
            None => lines.push(Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw: None,
            }),
        }
    }

    debug!("Writing {} properties to {}", props.len(), path.display());
    fs::write(path, render_lines(&lines))
}
