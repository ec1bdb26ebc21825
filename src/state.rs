use std::{collections::HashMap, fmt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Variable bindings of one session, keyed by declared name.
pub type Variables = HashMap<String, StateValue>;

/// The value of a flow variable.
///
/// Flow variables are declared untyped in the editor, so a binding may hold any scalar.
/// Structured JSON never lands here directly, see [`StateValue::from_json`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum StateValue {
    String(String),
    Number(f64),
    Boolean(bool),
    #[default]
    Null,
}

impl StateValue {
    pub fn as_str(&self) -> Option<&str> {
        if let StateValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        if let StateValue::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let StateValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Textual rendering used by the string operators. `Null` has none.
    pub fn as_text(&self) -> Option<String> {
        match self {
            StateValue::String(s) => Some(s.clone()),
            StateValue::Number(n) => Some(n.to_string()),
            StateValue::Boolean(b) => Some(b.to_string()),
            StateValue::Null => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::String(s) => json!(s),
            StateValue::Number(n) => json!(n),
            StateValue::Boolean(b) => json!(b),
            StateValue::Null => Value::Null,
        }
    }

    /// Converts any JSON value into a binding.
    ///
    /// Scalars map onto their variant; arrays and objects are kept as their
    /// serialized JSON text so nothing captured from a service is lost.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => StateValue::String(s),
            Value::Number(n) => match n.as_f64() {
                Some(f) => StateValue::Number(f),
                None => StateValue::String(n.to_string()),
            },
            Value::Bool(b) => StateValue::Boolean(b),
            Value::Null => StateValue::Null,
            other => StateValue::String(other.to_string()),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::String(s) => write!(f, "{s}"),
            StateValue::Number(n) => write!(f, "{n}"),
            StateValue::Boolean(b) => write!(f, "{b}"),
            StateValue::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Number(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Boolean(value)
    }
}
