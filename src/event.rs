//! Canonical event records and their schemas.
//!
//! Every event the hub produces is an [`EventRecord`]: a fixed prefix shared by
//! all kinds followed by the kind-specific values declared by the event's
//! [`EventSchema`].
//!
//! ## Schemas
//! A schema is composed once, at registration, by concatenating
//! [`BASE_FIELDS`] with the kind fields ([`EventSchema::compose`]). Field order
//! and count never change afterwards, so a record can be written as:
//! - a flat ordered tuple ([`EventRecord::as_tuple`] / [`EventRecord::from_tuple`]),
//!   which is what travels over the transport, or
//! - a fixed-size little-endian binary record ([`EventRecord::encode_fixed`] /
//!   [`EventRecord::decode_fixed`]), which is what the table store appends.
//!
//! ## Prefix conventions
//! - `event_id` is assigned by the dispatcher, never by a backend.
//! - `hub_time` is always on the shared [`clock`](crate::clock).
//! - `confidence_interval` is `>= 0`; `0` means unknown / not applicable.
//! - `experiment_id` / `session_id` of `0` mean "unset".
//!
//! Strings are stored in fixed-width slots (`FieldType::Str(n)`); longer values
//! are truncated on a character boundary when encoded.

use crate::constants::EventTypeId;
use crate::error::RecordError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// Storage type of one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I16,
    I32,
    F32,
    F64,
    /// UTF-8 text in a fixed number of bytes.
    Str(usize),
}

impl FieldType {
    /// Width in bytes of the fixed-layout encoding.
    pub fn size(self) -> usize {
        match self {
            FieldType::U8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
            FieldType::U64 | FieldType::F64 => 8,
            FieldType::Str(n) => n,
        }
    }

    pub fn default_value(self) -> FieldValue {
        match self {
            FieldType::U8 | FieldType::U16 | FieldType::U32 | FieldType::U64 => FieldValue::UInt(0),
            FieldType::I16 | FieldType::I32 => FieldValue::Int(0),
            FieldType::F32 | FieldType::F64 => FieldValue::Float(0.0),
            FieldType::Str(_) => FieldValue::Text(String::new()),
        }
    }

    fn max_unsigned(self) -> u64 {
        match self {
            FieldType::U8 => u8::MAX as u64,
            FieldType::U16 => u16::MAX as u64,
            FieldType::U32 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }

    /// Interpret a JSON value as this field type.
    pub fn coerce(self, value: &Value) -> Result<FieldValue, String> {
        match self {
            FieldType::U8 | FieldType::U16 | FieldType::U32 | FieldType::U64 => {
                let v = integral(value).and_then(|n| u64::try_from(n).ok());
                match v {
                    Some(v) if v <= self.max_unsigned() => Ok(FieldValue::UInt(v)),
                    _ => Err(format!("expected {:?}, got {}", self, value)),
                }
            }
            FieldType::I16 | FieldType::I32 => {
                let (lo, hi) = if self == FieldType::I16 {
                    (i16::MIN as i128, i16::MAX as i128)
                } else {
                    (i32::MIN as i128, i32::MAX as i128)
                };
                match integral(value) {
                    Some(v) if (lo..=hi).contains(&v) => Ok(FieldValue::Int(v as i64)),
                    _ => Err(format!("expected {:?}, got {}", self, value)),
                }
            }
            FieldType::F32 | FieldType::F64 => value
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(|| format!("expected {:?}, got {}", self, value)),
            FieldType::Str(_) => value
                .as_str()
                .map(|s| FieldValue::Text(s.to_string()))
                .ok_or_else(|| format!("expected text, got {}", value)),
        }
    }
}

fn integral(value: &Value) -> Option<i128> {
    if let Some(u) = value.as_u64() {
        return Some(u as i128);
    }
    if let Some(i) = value.as_i64() {
        return Some(i as i128);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.is_finite() => Some(f as i128),
        _ => None,
    }
}

/// One named, typed slot in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
}

impl FieldDef {
    pub fn new(name: &str, ty: FieldType) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

/// Shorthand for declaring kind field lists.
pub fn fields(defs: &[(&str, FieldType)]) -> Vec<FieldDef> {
    defs.iter().map(|(n, t)| FieldDef::new(n, *t)).collect()
}

/// The invariant prefix carried by every event, in order.
pub const BASE_FIELDS: [(&str, FieldType); 11] = [
    ("experiment_id", FieldType::U32),
    ("session_id", FieldType::U32),
    ("device_id", FieldType::U16),
    ("event_id", FieldType::U64),
    ("type", FieldType::U8),
    ("device_time", FieldType::F64),
    ("logged_time", FieldType::F64),
    ("time", FieldType::F64),
    ("confidence_interval", FieldType::F32),
    ("delay", FieldType::F32),
    ("filter_id", FieldType::I16),
];

/// A value held in one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::UInt(v) => Some(*v as f64),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(v) => Some(*v),
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::UInt(v) => i64::try_from(*v).ok(),
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::UInt(v) => Value::from(*v),
            FieldValue::Int(v) => Value::from(*v),
            FieldValue::Float(v) => Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Ordered field layout of one event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSchema {
    pub type_id: EventTypeId,
    pub name: String,
    /// Base fields followed by kind fields.
    pub fields: Vec<FieldDef>,
    /// Bytes per fixed-layout record.
    pub record_size: usize,
}

impl EventSchema {
    /// Concatenate the base prefix with `kind_fields`.
    pub fn compose(type_id: EventTypeId, name: &str, kind_fields: Vec<FieldDef>) -> Self {
        let mut all: Vec<FieldDef> = BASE_FIELDS
            .iter()
            .map(|(n, t)| FieldDef::new(n, *t))
            .collect();
        all.extend(kind_fields);
        let record_size = all.iter().map(|f| f.ty.size()).sum();
        Self {
            type_id,
            name: name.to_string(),
            fields: all,
            record_size,
        }
    }

    pub fn kind_fields(&self) -> &[FieldDef] {
        &self.fields[BASE_FIELDS.len()..]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Build kind values from a JSON object, defaulting absent fields.
    pub fn kind_values_from(&self, obj: &Map<String, Value>) -> Result<Vec<FieldValue>, RecordError> {
        self.kind_fields()
            .iter()
            .map(|f| match obj.get(&f.name) {
                Some(v) => f
                    .ty
                    .coerce(v)
                    .map_err(|e| RecordError::new(self.type_id.0, format!("{}: {}", f.name, e))),
                None => Ok(f.ty.default_value()),
            })
            .collect()
    }
}

/// One canonical event.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub experiment_id: u32,
    pub session_id: u32,
    pub device_id: u16,
    pub event_id: u64,
    pub event_type: EventTypeId,
    pub device_time: f64,
    pub logged_time: f64,
    pub hub_time: f64,
    pub confidence_interval: f32,
    pub delay: f32,
    pub filter_id: i16,
    /// Kind values, in `schema.kind_fields()` order.
    pub values: Vec<FieldValue>,
    pub schema: Arc<EventSchema>,
}

impl PartialEq for EventRecord {
    fn eq(&self, other: &Self) -> bool {
        self.experiment_id == other.experiment_id
            && self.session_id == other.session_id
            && self.device_id == other.device_id
            && self.event_id == other.event_id
            && self.event_type == other.event_type
            && self.device_time == other.device_time
            && self.logged_time == other.logged_time
            && self.hub_time == other.hub_time
            && self.confidence_interval == other.confidence_interval
            && self.delay == other.delay
            && self.filter_id == other.filter_id
            && self.values == other.values
    }
}

impl EventRecord {
    /// Record with a zeroed prefix and the given kind values.
    pub fn new(schema: Arc<EventSchema>, values: Vec<FieldValue>) -> Result<Self, RecordError> {
        let expected = schema.kind_fields().len();
        if values.len() != expected {
            return Err(RecordError::new(
                schema.type_id.0,
                format!("expected {} kind values, got {}", expected, values.len()),
            ));
        }
        Ok(Self {
            experiment_id: 0,
            session_id: 0,
            device_id: 0,
            event_id: 0,
            event_type: schema.type_id,
            device_time: 0.0,
            logged_time: 0.0,
            hub_time: 0.0,
            confidence_interval: 0.0,
            delay: 0.0,
            filter_id: 0,
            values,
            schema,
        })
    }

    /// Value of a field by name, base or kind.
    pub fn get(&self, name: &str) -> Option<FieldValue> {
        let idx = self.schema.index_of(name)?;
        if idx < BASE_FIELDS.len() {
            Some(self.base_value(idx))
        } else {
            self.values.get(idx - BASE_FIELDS.len()).cloned()
        }
    }

    fn base_value(&self, idx: usize) -> FieldValue {
        match idx {
            0 => FieldValue::UInt(self.experiment_id as u64),
            1 => FieldValue::UInt(self.session_id as u64),
            2 => FieldValue::UInt(self.device_id as u64),
            3 => FieldValue::UInt(self.event_id),
            4 => FieldValue::UInt(self.event_type.0 as u64),
            5 => FieldValue::Float(self.device_time),
            6 => FieldValue::Float(self.logged_time),
            7 => FieldValue::Float(self.hub_time),
            8 => FieldValue::Float(self.confidence_interval as f64),
            9 => FieldValue::Float(self.delay as f64),
            _ => FieldValue::Int(self.filter_id as i64),
        }
    }

    fn all_values(&self) -> impl Iterator<Item = FieldValue> + '_ {
        (0..BASE_FIELDS.len())
            .map(|i| self.base_value(i))
            .chain(self.values.iter().cloned())
    }

    /// Flat ordered tuple: prefix then kind values.
    pub fn as_tuple(&self) -> Vec<Value> {
        self.all_values().map(|v| v.to_json()).collect()
    }

    /// Rebuild a record from its tuple form.
    pub fn from_tuple(schema: Arc<EventSchema>, tuple: &[Value]) -> Result<Self, RecordError> {
        let type_id = schema.type_id.0;
        if tuple.len() != schema.fields.len() {
            return Err(RecordError::new(
                type_id,
                format!("expected {} fields, got {}", schema.fields.len(), tuple.len()),
            ));
        }
        let mut decoded = Vec::with_capacity(tuple.len());
        for (field, value) in schema.fields.iter().zip(tuple) {
            let v = field
                .ty
                .coerce(value)
                .map_err(|e| RecordError::new(type_id, format!("{}: {}", field.name, e)))?;
            decoded.push(v);
        }
        Self::from_values(schema, decoded)
    }

    fn from_values(schema: Arc<EventSchema>, mut all: Vec<FieldValue>) -> Result<Self, RecordError> {
        let type_id = schema.type_id.0;
        let values = all.split_off(BASE_FIELDS.len());
        let u = |i: usize| all[i].as_u64().unwrap_or(0);
        let f = |i: usize| all[i].as_f64().unwrap_or(0.0);
        if u(4) != type_id as u64 {
            return Err(RecordError::new(
                type_id,
                format!("record carries event type {}", u(4)),
            ));
        }
        Ok(Self {
            experiment_id: u(0) as u32,
            session_id: u(1) as u32,
            device_id: u(2) as u16,
            event_id: u(3),
            event_type: schema.type_id,
            device_time: f(5),
            logged_time: f(6),
            hub_time: f(7),
            confidence_interval: f(8) as f32,
            delay: f(9) as f32,
            filter_id: all[10].as_i64().unwrap_or(0) as i16,
            values,
            schema,
        })
    }

    /// Fixed-size little-endian encoding, `schema.record_size` bytes.
    pub fn encode_fixed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.schema.record_size);
        for (field, value) in self.schema.fields.iter().zip(self.all_values()) {
            write_fixed(&mut out, field.ty, &value);
        }
        out
    }

    pub fn decode_fixed(schema: Arc<EventSchema>, bytes: &[u8]) -> Result<Self, RecordError> {
        let type_id = schema.type_id.0;
        if bytes.len() != schema.record_size {
            return Err(RecordError::new(
                type_id,
                format!("expected {} bytes, got {}", schema.record_size, bytes.len()),
            ));
        }
        let mut at = 0;
        let mut all = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            let n = field.ty.size();
            all.push(read_fixed(field.ty, &bytes[at..at + n]));
            at += n;
        }
        Self::from_values(schema, all)
    }
}

fn write_fixed(out: &mut Vec<u8>, ty: FieldType, value: &FieldValue) {
    let u = value.as_u64().unwrap_or(0);
    let i = value.as_i64().unwrap_or(0);
    let f = value.as_f64().unwrap_or(0.0);
    match ty {
        FieldType::U8 => out.push(u as u8),
        FieldType::U16 => out.extend_from_slice(&(u as u16).to_le_bytes()),
        FieldType::U32 => out.extend_from_slice(&(u as u32).to_le_bytes()),
        FieldType::U64 => out.extend_from_slice(&u.to_le_bytes()),
        FieldType::I16 => out.extend_from_slice(&(i as i16).to_le_bytes()),
        FieldType::I32 => out.extend_from_slice(&(i as i32).to_le_bytes()),
        FieldType::F32 => out.extend_from_slice(&(f as f32).to_le_bytes()),
        FieldType::F64 => out.extend_from_slice(&f.to_le_bytes()),
        FieldType::Str(n) => {
            let s = value.as_str().unwrap_or("");
            let mut end = s.len().min(n);
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            out.extend_from_slice(&s.as_bytes()[..end]);
            out.resize(out.len() + (n - end), 0);
        }
    }
}

fn read_fixed(ty: FieldType, b: &[u8]) -> FieldValue {
    let arr = |n: usize| {
        let mut a = [0u8; 8];
        a[..n].copy_from_slice(&b[..n]);
        a
    };
    match ty {
        FieldType::U8 => FieldValue::UInt(b[0] as u64),
        FieldType::U16 => FieldValue::UInt(u16::from_le_bytes([b[0], b[1]]) as u64),
        FieldType::U32 => FieldValue::UInt(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64),
        FieldType::U64 => FieldValue::UInt(u64::from_le_bytes(arr(8))),
        FieldType::I16 => FieldValue::Int(i16::from_le_bytes([b[0], b[1]]) as i64),
        FieldType::I32 => FieldValue::Int(i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64),
        FieldType::F32 => FieldValue::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64),
        FieldType::F64 => FieldValue::Float(f64::from_le_bytes(arr(8))),
        FieldType::Str(_) => {
            let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
            FieldValue::Text(String::from_utf8_lossy(&b[..end]).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::event_type;
    use serde_json::json;

    fn message_schema() -> Arc<EventSchema> {
        Arc::new(EventSchema::compose(
            event_type::MESSAGE,
            "MessageEvent",
            fields(&[
                ("msg_offset", FieldType::F32),
                ("prefix", FieldType::Str(3)),
                ("text", FieldType::Str(8)),
            ]),
        ))
    }

    #[test]
    fn schema_starts_with_base_prefix() {
        let schema = message_schema();
        assert_eq!(schema.fields.len(), BASE_FIELDS.len() + 3);
        assert_eq!(schema.fields[3].name, "event_id");
        assert_eq!(schema.kind_fields()[2].name, "text");
        assert_eq!(schema.record_size, 4 + 4 + 2 + 8 + 1 + 8 * 3 + 4 + 4 + 2 + 4 + 3 + 8);
    }

    #[test]
    fn tuple_layout_is_prefix_then_kind() {
        let schema = message_schema();
        let mut rec = EventRecord::new(
            schema.clone(),
            vec![
                FieldValue::Float(0.0),
                FieldValue::Text("EXP".into()),
                FieldValue::Text("hi".into()),
            ],
        )
        .unwrap();
        rec.event_id = 42;
        rec.hub_time = 12.5;
        let tuple = rec.as_tuple();
        assert_eq!(tuple[3], json!(42));
        assert_eq!(tuple[4], json!(151));
        assert_eq!(tuple[7], json!(12.5));
        assert_eq!(tuple[13], json!("hi"));

        let back = EventRecord::from_tuple(schema, &tuple).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.get("text"), Some(FieldValue::Text("hi".into())));
    }

    #[test]
    fn from_tuple_rejects_wrong_arity_and_type() {
        let schema = message_schema();
        assert!(EventRecord::from_tuple(schema.clone(), &[json!(1)]).is_err());

        let mut tuple: Vec<Value> = vec![json!(0); BASE_FIELDS.len()];
        tuple[4] = json!(151);
        tuple.extend([json!(0.0), json!("EXP"), json!(5)]);
        let err = EventRecord::from_tuple(schema, &tuple).unwrap_err();
        assert!(err.reason.contains("text"));
    }

    #[test]
    fn fixed_layout_truncates_long_text() {
        let schema = message_schema();
        let mut rec = EventRecord::new(
            schema.clone(),
            vec![
                FieldValue::Float(1.5),
                FieldValue::Text("EXP".into()),
                FieldValue::Text("a longer message".into()),
            ],
        )
        .unwrap();
        rec.filter_id = -3;
        let bytes = rec.encode_fixed();
        assert_eq!(bytes.len(), schema.record_size);

        let back = EventRecord::decode_fixed(schema, &bytes).unwrap();
        assert_eq!(back.filter_id, -3);
        assert_eq!(back.values[0], FieldValue::Float(1.5));
        assert_eq!(back.values[2], FieldValue::Text("a longer".into()));
    }

    #[test]
    fn kind_values_default_missing_fields() {
        let schema = message_schema();
        let obj = json!({ "text": "x" });
        let values = schema.kind_values_from(obj.as_object().unwrap()).unwrap();
        assert_eq!(values[0], FieldValue::Float(0.0));
        assert_eq!(values[1], FieldValue::Text(String::new()));
        assert_eq!(values[2], FieldValue::Text("x".into()));
    }
}
