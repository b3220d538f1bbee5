//! JSON encoding of values and message envelopes.
//!
//! Values that JSON has no notation for are boxed as
//! `{"__type__": [index, value]}`. Registered custom types take the first
//! indices, proxies the next one and local objects the one after that.

use super::{broker::Broker, Value};
use crate::error::{CodecError, Error, ProtocolError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Number};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

const TYPE_KEY: &str = "__type__";

pub struct JsonCodec {
    types: Vec<&'static str>,
    broker: RefCell<Weak<Broker>>,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonCodec {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            broker: RefCell::new(Weak::new()),
        }
    }

    /// Registers a custom type. Both ends have to register the same types
    /// in the same order.
    pub fn with_type<T: Serialize + DeserializeOwned + 'static>(mut self) -> Self {
        self.types.push(std::any::type_name::<T>());
        self
    }

    pub(crate) fn attach(&self, broker: Weak<Broker>) {
        *self.broker.borrow_mut() = broker;
    }

    fn broker(&self) -> Result<Rc<Broker>, Error> {
        self.broker
            .borrow()
            .upgrade()
            .ok_or_else(|| CodecError::Detached.into())
    }

    fn proxy_index(&self) -> usize {
        self.types.len()
    }

    fn boxed(index: usize, value: serde_json::Value) -> serde_json::Value {
        let mut entries = Map::new();
        entries.insert(TYPE_KEY.into(), json!([index, value]));
        serde_json::Value::Object(entries)
    }

    fn to_json(&self, value: &Value) -> Result<serde_json::Value, Error> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(value) => (*value).into(),
            Value::Int(value) => (*value).into(),
            Value::Float(value) => Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::handler(format!("{} has no JSON notation", value)))?,
            Value::Str(text) => text.as_str().into(),
            Value::List(items) => items
                .iter()
                .map(|item| self.to_json(item))
                .collect::<Result<_, _>>()?,
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), self.to_json(value)?)))
                    .collect::<Result<Map<_, _>, Error>>()?,
            ),
            Value::Proxy(proxy) => {
                let broker = self.broker()?;
                if !proxy.belongs_to(&broker) {
                    return Err(CodecError::ForeignProxy(proxy.path().into()).into());
                }
                Self::boxed(self.proxy_index(), proxy.path().into())
            }
            Value::Object(object) => {
                let path = self.broker()?.router().resolve(object)?;
                Self::boxed(self.proxy_index() + 1, path.into())
            }
            Value::Custom { type_name, data } => {
                let index = self
                    .types
                    .iter()
                    .position(|registered| registered == type_name)
                    .ok_or_else(|| Error::handler(format!("{} is not registered", type_name)))?;
                Self::boxed(index, data.clone())
            }
        })
    }

    fn from_json(&self, json: serde_json::Value) -> Result<Value, Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(value),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(value) => Value::Int(value),
                None => Value::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(text) => Value::Str(text),
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.from_json(item))
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(entries) => match unbox(&entries) {
                Some((index, data)) => self.unbox(index, data)?,
                None => Value::Map(
                    entries
                        .into_iter()
                        .map(|(key, value)| Ok((key, self.from_json(value)?)))
                        .collect::<Result<_, Error>>()?,
                ),
            },
        })
    }

    fn unbox(&self, index: i64, data: &serde_json::Value) -> Result<Value, Error> {
        let proxies = self.proxy_index() as i64;
        let path = || {
            data.as_str()
                .ok_or_else(|| Error::from(ProtocolError::MalformedEnvelope))
        };
        match index {
            index if (0..proxies).contains(&index) => Ok(Value::Custom {
                type_name: self.types[index as usize],
                data: data.clone(),
            }),
            // Proxies of the peer address our own objects.
            index if index == proxies => {
                let path = path()?;
                Ok(Value::Object(self.broker()?.router().lookup(path)?))
            }
            index if index == proxies + 1 => {
                let path = path()?;
                Ok(Value::Proxy(self.broker()?.proxy(path)?))
            }
            index => Err(CodecError::InvalidTypeId(index).into()),
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        self.to_json(value)
            .and_then(|json| serde_json::to_vec(&json).map_err(|e| Error::handler(e.to_string())))
            .map_err(|e| encode_error(value, e))
    }

    pub fn decode(&self, data: &[u8]) -> Result<Value, Error> {
        serde_json::from_slice(data)
            .map_err(|e| Error::handler(e.to_string()))
            .and_then(|json| self.from_json(json))
            .map_err(|e| decode_error(data, e))
    }

    pub(crate) fn encode_envelope(&self, kind: i64, id: u64, content: &Value) -> Result<Vec<u8>, Error> {
        let content = self
            .to_json(content)
            .map_err(|e| encode_error(content, e))?;
        serde_json::to_vec(&json!([kind, id, content]))
            .map_err(|e| encode_error(&Value::Null, Error::handler(e.to_string())))
    }

    /// Splits an envelope into its type, id and content.
    pub(crate) fn decode_envelope(&self, data: &[u8]) -> Result<(i64, u64, Value), Error> {
        let Value::List(items) = self.decode(data)? else {
            return Err(ProtocolError::MalformedEnvelope.into());
        };
        let mut items = items.into_iter();
        match (items.next(), items.next(), items.next(), items.next()) {
            (Some(Value::Int(kind)), Some(Value::Int(id)), Some(content), None) if id >= 0 => {
                Ok((kind, id as u64, content))
            }
            _ => Err(ProtocolError::MalformedEnvelope.into()),
        }
    }
}

/// The index and data of a boxed value. Maps whose type entry is not an
/// `[index, data]` pair are ordinary maps.
fn unbox(entries: &Map<String, serde_json::Value>) -> Option<(i64, &serde_json::Value)> {
    match entries.get(TYPE_KEY)?.as_array()?.as_slice() {
        [index, data] => Some((index.as_i64()?, data)),
        _ => None,
    }
}

fn reason(error: Error) -> String {
    match error {
        Error::Handler(reason) => reason,
        other => other.to_string(),
    }
}

fn encode_error(value: &Value, error: Error) -> Error {
    CodecError::Encode {
        value: format!("{:?}", value),
        reason: reason(error),
    }
    .into()
}

fn decode_error(data: &[u8], error: Error) -> Error {
    CodecError::Decode {
        data: String::from_utf8_lossy(data).into_owned(),
        reason: reason(error),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct MyType {
        value: String,
    }

    #[test]
    fn basic_values() {
        let codec = JsonCodec::new();
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert("b".to_string(), Value::Null);
        let value = Value::Map(
            [
                ("str".to_string(), Value::from("spam")),
                ("int".to_string(), Value::Int(42)),
                ("float".to_string(), Value::Float(std::f64::consts::PI)),
                ("list".to_string(), Value::from(vec![1, 2, 3])),
                ("dict".to_string(), Value::Map(map)),
                ("bool".to_string(), Value::Bool(false)),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(codec.decode(&codec.encode(&value).unwrap()), Ok(value));
    }

    #[test]
    fn custom_types() {
        let codec = JsonCodec::new().with_type::<MyType>();
        let value = Value::custom(&MyType {
            value: "spam".into(),
        })
        .unwrap();
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(encoded, br#"{"__type__":[0,{"value":"spam"}]}"#);
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(
            decoded.to_custom::<MyType>().unwrap(),
            MyType {
                value: "spam".into()
            }
        );
    }

    #[test]
    fn malformed_boxes_pass_through() {
        let codec = JsonCodec::new();
        let decoded = codec.decode(br#"{"__type__": [1, 2, 3]}"#).unwrap();
        assert_eq!(
            decoded.as_map().unwrap()["__type__"],
            Value::from(vec![1, 2, 3])
        );
        assert!(codec.decode(br#"{"__type__": [1]}"#).unwrap().as_map().is_some());
    }

    #[test]
    fn invalid_type_ids() {
        let codec = JsonCodec::new();
        let error = codec.decode(br#"{"__type__": [7, ""]}"#).unwrap_err();
        assert!(error.to_string().starts_with("Failed to decode"));
        assert!(error.to_string().contains("Invalid type identifier 7"));
        // Proxies need a broker.
        assert!(codec.decode(br#"{"__type__": [0, ""]}"#).is_err());
    }

    #[test]
    fn unregistered_types_fail_to_encode() {
        let codec = JsonCodec::new();
        let value = Value::custom(&MyType {
            value: "spam".into(),
        })
        .unwrap();
        let error = codec.encode(&value).unwrap_err();
        assert!(error.to_string().starts_with("Failed to encode"));
        assert!(codec.encode(&Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn envelopes() {
        let codec = JsonCodec::new();
        let data = codec.encode_envelope(0, 7, &Value::from("hi")).unwrap();
        assert_eq!(data, br#"[0,7,"hi"]"#);
        assert_eq!(codec.decode_envelope(&data), Ok((0, 7, Value::from("hi"))));
        assert_eq!(
            codec.decode_envelope(b"[0, 7]"),
            Err(ProtocolError::MalformedEnvelope.into())
        );
    }

    fn plain_values() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            // Short decimals, which print and parse back exactly.
            (-1_000_000i32..1_000_000, 0i32..4)
                .prop_map(|(mantissa, places)| Value::Float(
                    f64::from(mantissa) / 10f64.powi(places)
                )),
            ".*".prop_map(Value::Str),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
                prop::collection::btree_map("[a-z_]{0,8}", inner, 0..8).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn plain_values_survive_encoding(value in plain_values()) {
            let codec = JsonCodec::new();
            let encoded = codec.encode(&value).unwrap();
            prop_assert_eq!(codec.decode(&encoded), Ok(value));
        }
    }
}
