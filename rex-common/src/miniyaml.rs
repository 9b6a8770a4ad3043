//! Tiny YAML-subset parser for config files.
//!
//! Supported:
//! - top-level `key: value` (string or integer scalar)
//! - a top-level key introducing a list of scalars:
//!   ```yaml
//!   key:
//!     - value
//!   ```
//! - a top-level key introducing a list of flat maps:
//!   ```yaml
//!   key:
//!     - a: 1
//!       b: "x"
//!   ```
//!
//! Anything deeper is rejected: nested maps, multiline scalars, anchors.
//! Ambiguous input must error rather than be silently accepted, which is
//! why this is not a full YAML library.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum YamlError {
    #[error("line {line}: expected `key: value`, got {text:?}")]
    ExpectedKeyValue { line: usize, text: String },

    #[error("line {line}: empty key in {text:?}")]
    EmptyKey { line: usize, text: String },

    #[error("line {line}: unexpected indentation: {text:?}")]
    UnexpectedIndent { line: usize, text: String },

    #[error("line {line}: object field outside a list item: {text:?}")]
    DanglingField { line: usize, text: String },

    #[error("line {line}: nested maps are not supported: {text:?}")]
    NestedMap { line: usize, text: String },
}

/// A leaf value: quoted or bare string, or an integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    Str(String),
    Int(i64),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Str(_) => None,
        }
    }

    /// Lenient boolean reading for config flags: accepts 0/1 and the usual
    /// true/false spellings; anything else is `None`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            Self::Int(_) => None,
            Self::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
        }
    }
}

/// One entry of a top-level list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Scalar(Scalar),
    Map(BTreeMap<String, Scalar>),
}

/// A top-level value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Scalar(Scalar),
    List(Vec<Item>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => s.as_str(),
            Self::List(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Scalar(s) => s.as_int(),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Self::List(items) => Some(items),
            Self::Scalar(_) => None,
        }
    }
}

/// Parsed document: top-level keys to values.
pub type Document = BTreeMap<String, Value>;

pub fn parse(input: &str) -> Result<Document, YamlError> {
    let mut root = Document::new();
    let mut current_list_key: Option<String> = None;
    let mut in_map_item = false;

    for (idx, raw) in input.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();

        if indent == 0 {
            in_map_item = false;
            current_list_key = None;
            let (key, value) = parse_key_line(trimmed, lineno)?;
            match value {
                Some(scalar) => {
                    root.insert(key, Value::Scalar(scalar));
                }
                None => {
                    // Bare `key:` starts a list.
                    root.insert(key.clone(), Value::List(Vec::new()));
                    current_list_key = Some(key);
                }
            }
            continue;
        }

        let Some(list_key) = current_list_key.as_deref() else {
            return Err(YamlError::UnexpectedIndent {
                line: lineno,
                text: raw.to_string(),
            });
        };
        let Some(Value::List(items)) = root.get_mut(list_key) else {
            return Err(YamlError::UnexpectedIndent {
                line: lineno,
                text: raw.to_string(),
            });
        };

        if let Some(item_text) = trimmed.strip_prefix("- ") {
            let item_text = item_text.trim();
            if item_text.contains(':') {
                let (key, value) = parse_key_line(item_text, lineno)?;
                let Some(scalar) = value else {
                    return Err(YamlError::NestedMap {
                        line: lineno,
                        text: raw.to_string(),
                    });
                };
                let mut map = BTreeMap::new();
                map.insert(key, scalar);
                items.push(Item::Map(map));
                in_map_item = true;
            } else {
                items.push(Item::Scalar(parse_scalar(item_text)));
                in_map_item = false;
            }
            continue;
        }

        // Continuation field of the current map item.
        if !in_map_item {
            return Err(YamlError::DanglingField {
                line: lineno,
                text: raw.to_string(),
            });
        }
        let (key, value) = parse_key_line(trimmed, lineno)?;
        let Some(scalar) = value else {
            return Err(YamlError::NestedMap {
                line: lineno,
                text: raw.to_string(),
            });
        };
        if let Some(Item::Map(map)) = items.last_mut() {
            map.insert(key, scalar);
        }
    }

    Ok(root)
}

fn parse_key_line(s: &str, line: usize) -> Result<(String, Option<Scalar>), YamlError> {
    let Some((key, rest)) = s.split_once(':') else {
        return Err(YamlError::ExpectedKeyValue {
            line,
            text: s.to_string(),
        });
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(YamlError::EmptyKey {
            line,
            text: s.to_string(),
        });
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return Ok((key.to_string(), None));
    }
    Ok((key.to_string(), Some(parse_scalar(rest))))
}

fn parse_scalar(s: &str) -> Scalar {
    let s = s.trim();
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        let quoted = (bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\'');
        if quoted {
            return Scalar::Str(s[1..s.len() - 1].to_string());
        }
    }
    if let Ok(n) = s.parse::<i64>() {
        return Scalar::Int(n);
    }
    Scalar::Str(s.to_string())
}
