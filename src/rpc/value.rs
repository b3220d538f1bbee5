use super::{broker::Proxy, hierarchy::ObjectRef};
use crate::error::{CodecError, Error, UsageError};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Anything that can travel through an RPC channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An object of the peer.
    Proxy(Proxy),
    /// A local object. The peer receives a proxy for it.
    Object(ObjectRef),
    /// An instance of a type registered with the codec.
    Custom {
        type_name: &'static str,
        data: serde_json::Value,
    },
}

impl Value {
    /// Boxes `value` as a custom type. The codecs on both ends need to know
    /// `T`.
    pub fn custom<T: Serialize + 'static>(value: &T) -> Result<Value, Error> {
        let data = serde_json::to_value(value).map_err(|e| CodecError::Encode {
            value: std::any::type_name::<T>().into(),
            reason: e.to_string(),
        })?;
        Ok(Value::Custom {
            type_name: std::any::type_name::<T>(),
            data,
        })
    }

    /// Unboxes a custom type.
    pub fn to_custom<T: DeserializeOwned + 'static>(&self) -> Result<T, Error> {
        let expected = std::any::type_name::<T>();
        match self {
            Value::Custom { type_name, data } if *type_name == expected => {
                serde_json::from_value(data.clone()).map_err(|e| {
                    CodecError::Decode {
                        data: data.to_string(),
                        reason: e.to_string(),
                    }
                    .into()
                })
            }
            other => Err(CodecError::Decode {
                data: format!("{:?}", other),
                reason: format!("not a {}", expected),
            }
            .into()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Value::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Value::Proxy(proxy)
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::Object(object)
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: BTreeMap<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: BTreeMap::new(),
        }
    }

    pub fn get(&self, index: usize) -> Result<&Value, Error> {
        self.positional
            .get(index)
            .ok_or_else(|| UsageError::MissingArgument(index).into())
    }

    pub fn str(&self, index: usize) -> Result<&str, Error> {
        self.get(index)?.as_str().ok_or_else(|| {
            UsageError::ArgumentType {
                index,
                expected: "string",
            }
            .into()
        })
    }

    pub fn int(&self, index: usize) -> Result<i64, Error> {
        self.get(index)?.as_int().ok_or_else(|| {
            UsageError::ArgumentType {
                index,
                expected: "integer",
            }
            .into()
        })
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.get(name)
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }
}
