//! Host values as they travel to and from the database.
//!
//! `Value` is the common currency of the binder and the materializer. Every
//! variant knows its `ColumnType`, including nulls and empty arrays, so a
//! parameter can always be bound with a concrete type.
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value as Json;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::error::{ConfigurationError, ConversionError};

const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Real,
    Double,
    Text,
    Bytes,
    Uuid,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Array(Box<ColumnType>),
}

impl ColumnType {
    pub fn array_of(element: ColumnType) -> Self {
        ColumnType::Array(Box::new(element))
    }

    /// The value `DefaultOnNotFound` substitutes for a missing column.
    pub fn zero_value(&self) -> Value {
        match self {
            ColumnType::Bool => Value::Bool(false),
            ColumnType::SmallInt => Value::SmallInt(0),
            ColumnType::Int => Value::Int(0),
            ColumnType::BigInt => Value::BigInt(0),
            ColumnType::Real => Value::Real(0.0),
            ColumnType::Double => Value::Double(0.0),
            ColumnType::Text => Value::Text(String::new()),
            ColumnType::Bytes => Value::Bytes(Vec::new()),
            ColumnType::Uuid => Value::Uuid(Uuid::nil()),
            ColumnType::Date => Value::Date(NaiveDate::default()),
            ColumnType::Timestamp => Value::Timestamp(NaiveDateTime::default()),
            ColumnType::TimestampTz => Value::TimestampTz(DateTime::<Utc>::default()),
            ColumnType::Json => Value::Json(Json::Null),
            ColumnType::Array(element) => Value::Array((**element).clone(), Vec::new()),
        }
    }

    /// Maps a Postgres type name as reported by the driver.
    pub fn from_pg_name(name: &str) -> Option<Self> {
        if let Some(element) = name.strip_suffix("[]") {
            return Self::from_pg_name(element).map(Self::array_of);
        }
        let ty = match name {
            "BOOL" => ColumnType::Bool,
            "INT2" => ColumnType::SmallInt,
            "INT4" => ColumnType::Int,
            "INT8" => ColumnType::BigInt,
            "FLOAT4" => ColumnType::Real,
            "FLOAT8" => ColumnType::Double,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => ColumnType::Text,
            "BYTEA" => ColumnType::Bytes,
            "UUID" => ColumnType::Uuid,
            "DATE" => ColumnType::Date,
            "TIMESTAMP" => ColumnType::Timestamp,
            "TIMESTAMPTZ" => ColumnType::TimestampTz,
            "JSON" | "JSONB" => ColumnType::Json,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => f.write_str("bool"),
            ColumnType::SmallInt => f.write_str("smallint"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::BigInt => f.write_str("bigint"),
            ColumnType::Real => f.write_str("real"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Bytes => f.write_str("bytes"),
            ColumnType::Uuid => f.write_str("uuid"),
            ColumnType::Date => f.write_str("date"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::TimestampTz => f.write_str("timestamptz"),
            ColumnType::Json => f.write_str("json"),
            ColumnType::Array(element) => write!(f, "{element}[]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null(ColumnType),
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Json),
    Array(ColumnType, Vec<Value>),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null(ty) => ty.clone(),
            Value::Bool(_) => ColumnType::Bool,
            Value::SmallInt(_) => ColumnType::SmallInt,
            Value::Int(_) => ColumnType::Int,
            Value::BigInt(_) => ColumnType::BigInt,
            Value::Real(_) => ColumnType::Real,
            Value::Double(_) => ColumnType::Double,
            Value::Text(_) => ColumnType::Text,
            Value::Bytes(_) => ColumnType::Bytes,
            Value::Uuid(_) => ColumnType::Uuid,
            Value::Date(_) => ColumnType::Date,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::TimestampTz(_) => ColumnType::TimestampTz,
            Value::Json(_) => ColumnType::Json,
            Value::Array(element, _) => ColumnType::array_of(element.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Value::Null(_) => "null".to_string(),
            other => other.column_type().to_string(),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts to `target`, used when a property carries an explicit column type.
    pub fn coerce(self, target: &ColumnType) -> Result<Value, ConfigurationError> {
        if &self.column_type() == target {
            return Ok(self);
        }
        let mismatch = |from: &Value| ConfigurationError::Coercion {
            from: from.describe(),
            to: target.to_string(),
        };
        let coerced = match (self, target) {
            (Value::Null(_), ty) => Value::Null(ty.clone()),
            (v @ (Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_)), ty)
                if matches!(ty, ColumnType::SmallInt | ColumnType::Int | ColumnType::BigInt) =>
            {
                let wide = v.as_i64().unwrap_or_default();
                match ty {
                    ColumnType::SmallInt => i16::try_from(wide)
                        .map(Value::SmallInt)
                        .map_err(|_| mismatch(&v))?,
                    ColumnType::Int => i32::try_from(wide)
                        .map(Value::Int)
                        .map_err(|_| mismatch(&v))?,
                    _ => Value::BigInt(wide),
                }
            }
            (Value::Real(v), ColumnType::Double) => Value::Double(f64::from(v)),
            (Value::Double(v), ColumnType::Real) => Value::Real(v as f32),
            (Value::Text(s), ColumnType::Json) => match serde_json::from_str(&s) {
                Ok(json) => Value::Json(json),
                Err(_) => return Err(mismatch(&Value::Text(s))),
            },
            (Value::Json(json), ColumnType::Text) => Value::Text(json.to_string()),
            (Value::Text(s), ColumnType::Uuid) => match Uuid::parse_str(&s) {
                Ok(id) => Value::Uuid(id),
                Err(_) => return Err(mismatch(&Value::Text(s))),
            },
            (Value::Uuid(id), ColumnType::Text) => Value::Text(id.to_string()),
            (Value::Timestamp(naive), ColumnType::TimestampTz) => {
                Value::TimestampTz(Utc.from_utc_datetime(&naive))
            }
            (Value::TimestampTz(at), ColumnType::Timestamp) => Value::Timestamp(at.naive_utc()),
            (Value::Text(s), ColumnType::Timestamp | ColumnType::TimestampTz) => {
                match parse_temporal(&s) {
                    Some(parsed) => parsed.coerce(target)?,
                    None => return Err(mismatch(&Value::Text(s))),
                }
            }
            (Value::Text(s), ColumnType::Date) => match NaiveDate::parse_from_str(&s, DATE_FORMAT) {
                Ok(date) => Value::Date(date),
                Err(_) => return Err(mismatch(&Value::Text(s))),
            },
            (Value::Array(_, items), ColumnType::Array(element)) => Value::Array(
                (**element).clone(),
                items
                    .into_iter()
                    .map(|item| item.coerce(element))
                    .collect::<Result<_, _>>()?,
            ),
            (v, ColumnType::Json) => Value::Json(v.to_json()),
            (v, _) => return Err(mismatch(&v)),
        };
        Ok(coerced)
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null(_) => Json::Null,
            Value::Bool(v) => Json::from(*v),
            Value::SmallInt(v) => Json::from(*v),
            Value::Int(v) => Json::from(*v),
            Value::BigInt(v) => Json::from(*v),
            Value::Real(v) => Json::from(f64::from(*v)),
            Value::Double(v) => Json::from(*v),
            Value::Text(s) => Json::String(s.clone()),
            Value::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            Value::Uuid(id) => Json::String(id.to_string()),
            Value::Date(date) => Json::String(date.format(DATE_FORMAT).to_string()),
            Value::Timestamp(naive) => Json::String(format_naive(naive)),
            Value::TimestampTz(at) => Json::String(format_instant(at)),
            Value::Json(json) => json.clone(),
            Value::Array(_, items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    pub fn from_json(json: Json) -> Value {
        match json {
            Json::Null => Value::Null(ColumnType::Json),
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::BigInt(i),
                None => Value::Double(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Value::Text(s),
            Json::Array(items) => {
                Value::Array(ColumnType::Json, items.into_iter().map(Value::from_json).collect())
            }
            object @ Json::Object(_) => Value::Json(object),
        }
    }

    /// SQL literal rendering. Diagnostics only; commands always bind parameters.
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Null(_) => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::SmallInt(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Text(s) => quote_literal(s),
            Value::Bytes(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                format!("'\\x{hex}'")
            }
            Value::Uuid(id) => quote_literal(&id.to_string()),
            Value::Date(date) => quote_literal(&date.format(DATE_FORMAT).to_string()),
            Value::Timestamp(naive) => quote_literal(&format_naive(naive)),
            Value::TimestampTz(at) => quote_literal(&format_instant(at)),
            Value::Json(json) => quote_literal(&json.to_string()),
            Value::Array(_, items) => {
                let inner: Vec<String> = items.iter().map(Value::sql_literal).collect();
                format!("ARRAY[{}]", inner.join(", "))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_literal())
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub(crate) fn format_naive(naive: &NaiveDateTime) -> String {
    naive.format(NAIVE_FORMAT).to_string()
}

/// Fixed-width RFC 3339 so stored text orders the same way as the instants.
pub(crate) fn format_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub(crate) fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Offset-aware when the text carries an offset, naive otherwise.
fn parse_temporal(s: &str) -> Option<Value> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Some(Value::TimestampTz(at.with_timezone(&Utc)));
    }
    if let Ok(at) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(Value::TimestampTz(at.with_timezone(&Utc)));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(Value::Timestamp)
}

/// Static column type of a host type.
pub trait SqlType {
    fn column_type() -> ColumnType;

    fn nullable() -> bool {
        false
    }
}

pub trait IntoValue {
    fn to_value(&self) -> Value;
}

pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ConversionError>;
}

impl<T: IntoValue + ?Sized> IntoValue for &T {
    fn to_value(&self) -> Value {
        (**self).to_value()
    }
}

impl IntoValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        Ok(value)
    }
}

impl SqlType for bool {
    fn column_type() -> ColumnType {
        ColumnType::Bool
    }
}

impl IntoValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => other
                .as_i64()
                .map(|i| i != 0)
                .ok_or_else(|| ConversionError::new("bool", &other)),
        }
    }
}

impl SqlType for i16 {
    fn column_type() -> ColumnType {
        ColumnType::SmallInt
    }
}

impl IntoValue for i16 {
    fn to_value(&self) -> Value {
        Value::SmallInt(*self)
    }
}

impl FromValue for i16 {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        value
            .as_i64()
            .and_then(|i| i16::try_from(i).ok())
            .ok_or_else(|| ConversionError::new("smallint", &value))
    }
}

impl SqlType for i32 {
    fn column_type() -> ColumnType {
        ColumnType::Int
    }
}

impl IntoValue for i32 {
    fn to_value(&self) -> Value {
        Value::Int(*self)
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        value
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .ok_or_else(|| ConversionError::new("int", &value))
    }
}

impl SqlType for i64 {
    fn column_type() -> ColumnType {
        ColumnType::BigInt
    }
}

impl IntoValue for i64 {
    fn to_value(&self) -> Value {
        Value::BigInt(*self)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        value
            .as_i64()
            .ok_or_else(|| ConversionError::new("bigint", &value))
    }
}

impl SqlType for f32 {
    fn column_type() -> ColumnType {
        ColumnType::Real
    }
}

impl IntoValue for f32 {
    fn to_value(&self) -> Value {
        Value::Real(*self)
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Real(v) => Ok(v),
            Value::Double(v) => Ok(v as f32),
            other => other
                .as_i64()
                .map(|i| i as f32)
                .ok_or_else(|| ConversionError::new("real", &other)),
        }
    }
}

impl SqlType for f64 {
    fn column_type() -> ColumnType {
        ColumnType::Double
    }
}

impl IntoValue for f64 {
    fn to_value(&self) -> Value {
        Value::Double(*self)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Double(v) => Ok(v),
            Value::Real(v) => Ok(f64::from(v)),
            other => other
                .as_i64()
                .map(|i| i as f64)
                .ok_or_else(|| ConversionError::new("double", &other)),
        }
    }
}

impl SqlType for String {
    fn column_type() -> ColumnType {
        ColumnType::Text
    }
}

impl IntoValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl IntoValue for str {
    fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Text(s) => Ok(s),
            Value::Json(Json::String(s)) => Ok(s),
            Value::Uuid(id) => Ok(id.to_string()),
            other => Err(ConversionError::new("text", &other)),
        }
    }
}

impl SqlType for Vec<u8> {
    fn column_type() -> ColumnType {
        ColumnType::Bytes
    }
}

impl IntoValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(ConversionError::new("bytes", &other)),
        }
    }
}

impl SqlType for Uuid {
    fn column_type() -> ColumnType {
        ColumnType::Uuid
    }
}

impl IntoValue for Uuid {
    fn to_value(&self) -> Value {
        Value::Uuid(*self)
    }
}

impl FromValue for Uuid {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match &value {
            Value::Uuid(id) => Ok(*id),
            Value::Text(s) => Uuid::parse_str(s).map_err(|_| ConversionError::new("uuid", &value)),
            Value::Bytes(bytes) => {
                Uuid::from_slice(bytes).map_err(|_| ConversionError::new("uuid", &value))
            }
            _ => Err(ConversionError::new("uuid", &value)),
        }
    }
}

impl SqlType for NaiveDate {
    fn column_type() -> ColumnType {
        ColumnType::Date
    }
}

impl IntoValue for NaiveDate {
    fn to_value(&self) -> Value {
        Value::Date(*self)
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match &value {
            Value::Date(date) => Ok(*date),
            Value::Timestamp(naive) => Ok(naive.date()),
            Value::Text(s) => NaiveDate::parse_from_str(s, DATE_FORMAT)
                .map_err(|_| ConversionError::new("date", &value)),
            _ => Err(ConversionError::new("date", &value)),
        }
    }
}

impl SqlType for NaiveDateTime {
    fn column_type() -> ColumnType {
        ColumnType::Timestamp
    }
}

impl IntoValue for NaiveDateTime {
    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match &value {
            Value::Timestamp(naive) => Ok(*naive),
            Value::TimestampTz(at) => Ok(at.naive_utc()),
            Value::Text(s) => match parse_temporal(s) {
                Some(Value::Timestamp(naive)) => Ok(naive),
                Some(Value::TimestampTz(at)) => Ok(at.naive_utc()),
                _ => Err(ConversionError::new("timestamp", &value)),
            },
            _ => Err(ConversionError::new("timestamp", &value)),
        }
    }
}

impl SqlType for DateTime<Utc> {
    fn column_type() -> ColumnType {
        ColumnType::TimestampTz
    }
}

impl IntoValue for DateTime<Utc> {
    fn to_value(&self) -> Value {
        Value::TimestampTz(*self)
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match &value {
            Value::TimestampTz(at) => Ok(*at),
            Value::Timestamp(naive) => Ok(Utc.from_utc_datetime(naive)),
            Value::Text(s) => match parse_temporal(s) {
                Some(Value::TimestampTz(at)) => Ok(at),
                Some(Value::Timestamp(naive)) => Ok(Utc.from_utc_datetime(&naive)),
                _ => Err(ConversionError::new("timestamptz", &value)),
            },
            _ => Err(ConversionError::new("timestamptz", &value)),
        }
    }
}

impl SqlType for DateTime<FixedOffset> {
    fn column_type() -> ColumnType {
        ColumnType::TimestampTz
    }
}

impl IntoValue for DateTime<FixedOffset> {
    fn to_value(&self) -> Value {
        Value::TimestampTz(self.with_timezone(&Utc))
    }
}

impl FromValue for DateTime<FixedOffset> {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        DateTime::<Utc>::from_value(value).map(|at| at.fixed_offset())
    }
}

impl SqlType for Json {
    fn column_type() -> ColumnType {
        ColumnType::Json
    }
}

impl IntoValue for Json {
    fn to_value(&self) -> Value {
        Value::Json(self.clone())
    }
}

impl FromValue for Json {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Json(json) => Ok(json),
            Value::Text(s) => {
                serde_json::from_str(&s).map_err(|_| ConversionError::new("json", &Value::Text(s)))
            }
            other => Ok(other.to_json()),
        }
    }
}

impl<T: SqlType> SqlType for Option<T> {
    fn column_type() -> ColumnType {
        T::column_type()
    }

    fn nullable() -> bool {
        true
    }
}

impl<T: SqlType + IntoValue> IntoValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null(T::column_type()),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(value).map(Some)
    }
}

fn sequence<'a, T, I>(items: I) -> Value
where
    T: SqlType + IntoValue + 'a,
    I: IntoIterator<Item = &'a T>,
{
    Value::Array(
        T::column_type(),
        items.into_iter().map(IntoValue::to_value).collect(),
    )
}

impl<T: SqlType> SqlType for Vec<T> {
    fn column_type() -> ColumnType {
        ColumnType::array_of(T::column_type())
    }
}

impl<T: SqlType + IntoValue> IntoValue for Vec<T> {
    fn to_value(&self) -> Value {
        sequence(self)
    }
}

impl<T: SqlType + IntoValue> IntoValue for [T] {
    fn to_value(&self) -> Value {
        sequence(self)
    }
}

impl<T: SqlType + IntoValue> IntoValue for VecDeque<T> {
    fn to_value(&self) -> Value {
        sequence(self)
    }
}

impl<T: SqlType + IntoValue> IntoValue for HashSet<T> {
    fn to_value(&self) -> Value {
        sequence(self)
    }
}

impl<T: SqlType + IntoValue> IntoValue for BTreeSet<T> {
    fn to_value(&self) -> Value {
        sequence(self)
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, ConversionError> {
        let items = match value {
            Value::Array(_, items) => items,
            Value::Json(Json::Array(items)) => items.into_iter().map(Value::from_json).collect(),
            // SQLite keeps arrays as JSON text.
            Value::Text(s) => match serde_json::from_str::<Json>(&s) {
                Ok(Json::Array(items)) => items.into_iter().map(Value::from_json).collect(),
                _ => return Err(ConversionError::new("array", &Value::Text(s))),
            },
            other => return Err(ConversionError::new("array", &other)),
        };
        items.into_iter().map(T::from_value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sequences_keep_their_element_type() {
        let tags: Vec<String> = Vec::new();
        assert_eq!(tags.to_value(), Value::Array(ColumnType::Text, vec![]));

        let ids: BTreeSet<i64> = [3, 1].into_iter().collect();
        assert_eq!(
            ids.to_value(),
            Value::Array(ColumnType::BigInt, vec![Value::BigInt(1), Value::BigInt(3)])
        );
    }

    #[test]
    fn none_is_a_typed_null() {
        let missing: Option<Uuid> = None;
        assert_eq!(missing.to_value(), Value::Null(ColumnType::Uuid));
    }

    #[test]
    fn sqlite_storage_classes_decode_leniently() {
        assert!(bool::from_value(Value::BigInt(1)).unwrap());
        assert_eq!(i32::from_value(Value::BigInt(42)).unwrap(), 42);
        assert!(i16::from_value(Value::BigInt(1 << 20)).is_err());

        let id = Uuid::new_v4();
        assert_eq!(Uuid::from_value(Value::Text(id.to_string())).unwrap(), id);

        let tags = Vec::<String>::from_value(Value::Text(r#"["a","b"]"#.into())).unwrap();
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let stored = Value::Text(format_instant(&at));
        assert_eq!(DateTime::<Utc>::from_value(stored).unwrap(), at);
    }

    #[test]
    fn text_timestamps_pick_offset_awareness() {
        let aware = Value::Text("2024-05-01T12:00:00+02:00".into())
            .coerce(&ColumnType::TimestampTz)
            .unwrap();
        assert_eq!(
            aware,
            Value::TimestampTz(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );

        let naive = Value::Text("2024-05-01 12:00:00".into())
            .coerce(&ColumnType::Timestamp)
            .unwrap();
        assert!(matches!(naive, Value::Timestamp(_)));
    }

    #[test]
    fn coercion_rejects_unrelated_types() {
        let err = Value::Bool(true).coerce(&ColumnType::Uuid).unwrap_err();
        assert!(matches!(err, ConfigurationError::Coercion { .. }));
        assert_eq!(
            Value::Int(5).coerce(&ColumnType::BigInt).unwrap(),
            Value::BigInt(5)
        );
        assert_eq!(
            Value::Null(ColumnType::Text).coerce(&ColumnType::Json).unwrap(),
            Value::Null(ColumnType::Json)
        );
    }

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(Value::Text("it's".into()).sql_literal(), "'it''s'");
        assert_eq!(
            Value::Array(ColumnType::BigInt, vec![Value::BigInt(1), Value::BigInt(2)])
                .sql_literal(),
            "ARRAY[1, 2]"
        );
    }
}
