//! Generic backend configuration.
//!
//! A [`Config`] wraps a JSON object and hands out typed fields through
//! consuming accessors. Each accessor marks its key as consumed and
//! records a problem (missing required key, wrong type) instead of
//! failing immediately, so a constructor can read every field it wants
//! and report all problems through one [`validate`](Config::validate)
//! call at the end. Keys nobody consumed fail validation too, which
//! catches misspelled configuration fields.
//!
//! # Example
//!
//! ```rust
//! use sortedkv::Config;
//!
//! # fn main() -> Result<(), sortedkv::Error> {
//! let cfg = Config::parse(r#"{"type": "sled", "file": "/tmp/db"}"#)?;
//! assert_eq!(cfg.required_string("type"), "sled");
//! assert_eq!(cfg.required_string("file"), "/tmp/db");
//! cfg.validate()?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A JSON-object configuration with consumed-key validation.
#[derive(Debug, Default)]
pub struct Config {
    fields: Map<String, Value>,
    consumed: Mutex<HashSet<String>>,
    problems: Mutex<Vec<String>>,
}

impl Config {
    /// Creates an empty configuration, for building programmatically.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON text. The top level must be an
    /// object.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Wraps an already-parsed JSON value. The value must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields, ..Self::default() }),
            other => Err(Error::config(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Sets a field, replacing any existing value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    fn consume(&self, key: &str) -> Option<&Value> {
        self.consumed.lock().insert(key.to_owned());
        self.fields.get(key)
    }

    fn record(&self, problem: String) {
        self.problems.lock().push(problem);
    }

    /// Returns the string at `key`, recording a problem (and returning
    /// an empty string) if the key is missing or not a string.
    pub fn required_string(&self, key: &str) -> String {
        match self.consume(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                self.record(format!(
                    "field {:?} must be a string, got {}",
                    key,
                    json_type_name(other)
                ));
                String::new()
            }
            None => {
                self.record(format!("missing required field {:?}", key));
                String::new()
            }
        }
    }

    /// Returns the string at `key`, or `default` if the key is absent.
    pub fn optional_string(&self, key: &str, default: &str) -> String {
        match self.consume(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                self.record(format!(
                    "field {:?} must be a string, got {}",
                    key,
                    json_type_name(other)
                ));
                default.to_owned()
            }
            None => default.to_owned(),
        }
    }

    /// Returns the integer at `key`, or `default` if the key is absent.
    pub fn optional_int(&self, key: &str, default: i64) -> i64 {
        match self.consume(key) {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(v) => v,
                None => {
                    self.record(format!("field {:?} must be an integer, got {}", key, n));
                    default
                }
            },
            Some(other) => {
                self.record(format!(
                    "field {:?} must be an integer, got {}",
                    key,
                    json_type_name(other)
                ));
                default
            }
            None => default,
        }
    }

    /// Returns the boolean at `key`, or `default` if the key is absent.
    pub fn optional_bool(&self, key: &str, default: bool) -> bool {
        match self.consume(key) {
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                self.record(format!(
                    "field {:?} must be a boolean, got {}",
                    key,
                    json_type_name(other)
                ));
                default
            }
            None => default,
        }
    }

    /// Fails if any accessor recorded a problem or if any field was
    /// never consumed.
    ///
    /// Call this after the constructor has read every field it
    /// understands.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems.lock();
        if let Some(first) = problems.first() {
            return Err(Error::config(first.clone()));
        }
        drop(problems);

        let consumed = self.consumed.lock();
        let mut unknown: Vec<&str> = self
            .fields
            .keys()
            .filter(|k| !consumed.contains(k.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(Error::config(format!("unknown fields: {}", unknown.join(", "))));
        }
        Ok(())
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
