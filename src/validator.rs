//! Declarative response validation
//!
//! A [`JsonValidator`] mirrors the shape of the expected response body:
//!
//! - `Map` requires every listed key to be present and to validate
//! - `Array` applies its single element validator to every element
//! - `Leaf` receives the value (possibly `Null`) directly
//!
//! ```rust,ignore
//! use courier::validator::{JsonValidator, is_not_null, is_string};
//!
//! let shape = JsonValidator::map([
//!     ("name", JsonValidator::leaf(is_not_null)),
//!     ("items", JsonValidator::array(JsonValidator::leaf(is_string))),
//! ]);
//! assert!(shape.validate(&serde_json::json!({"name": "a", "items": ["x"]})));
//! ```

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type LeafFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum JsonValidator {
    Leaf(LeafFn),
    Map(BTreeMap<String, JsonValidator>),
    Array(Box<JsonValidator>),
}

impl JsonValidator {
    pub fn leaf<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        JsonValidator::Leaf(Arc::new(f))
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, JsonValidator)>,
    {
        JsonValidator::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn array(element: JsonValidator) -> Self {
        JsonValidator::Array(Box::new(element))
    }

    /// Judge `value` against this validator
    pub fn validate(&self, value: &Value) -> bool {
        match self {
            JsonValidator::Leaf(check) => check(value),
            JsonValidator::Map(entries) => {
                let Value::Object(object) = value else {
                    return false;
                };
                entries.iter().all(|(key, validator)| match object.get(key) {
                    Some(child) => validator.validate(child),
                    None => false,
                })
            }
            JsonValidator::Array(element) => {
                let Value::Array(items) = value else {
                    return false;
                };
                items.iter().all(|item| element.validate(item))
            }
        }
    }
}

impl fmt::Debug for JsonValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonValidator::Leaf(_) => f.write_str("Leaf(..)"),
            JsonValidator::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
            JsonValidator::Array(element) => f.debug_list().entry(element).finish(),
        }
    }
}

pub fn is_not_null(value: &Value) -> bool {
    !value.is_null()
}

pub fn is_string(value: &Value) -> bool {
    value.is_string()
}

pub fn is_number(value: &Value) -> bool {
    value.is_number()
}

pub fn is_bool(value: &Value) -> bool {
    value.is_boolean()
}

pub fn is_object(value: &Value) -> bool {
    value.is_object()
}

pub fn is_array(value: &Value) -> bool {
    value.is_array()
}

pub fn any(_value: &Value) -> bool {
    true
}

/// Default status-code acceptance: 2xx
pub fn is_success_status(code: u16) -> bool {
    (200..=299).contains(&code)
}
