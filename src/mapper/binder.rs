//! Property values to driver parameters.
//!
//! Values are typed before they reach the driver: sequences are already
//! concrete arrays with an element type, nulls carry the property's column
//! type, and an explicit column type on the directive wins over the host type.
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as Json;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Postgres, Sqlite};
use uuid::Uuid;

use super::metadata::{EntityDescriptor, PropertyDirective, PropertyValues};
use super::value::{format_date, format_instant, format_naive, ColumnType, FromValue, Value};
use crate::error::{ConfigurationError, ConversionError};

/// Ordered parameter list that hands out `$n` placeholders.
#[derive(Debug, Default, Clone)]
pub struct Params {
    values: Vec<Value>,
}

impl Params {
    pub fn push(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// The bindable value of `prop` for one written entity.
pub fn property_value(
    descriptor: &EntityDescriptor,
    values: &PropertyValues,
    prop: &PropertyDirective,
) -> Result<Value, ConfigurationError> {
    let value = values
        .get(prop.name)
        .cloned()
        .ok_or_else(|| ConfigurationError::MissingPropertyValue {
            type_name: descriptor.type_name,
            property: prop.name.to_string(),
        })?;
    prepare(value, prop)
}

pub fn prepare(value: Value, prop: &PropertyDirective) -> Result<Value, ConfigurationError> {
    match &prop.explicit_type {
        Some(ty) => value.coerce(ty),
        None if value.is_null() => Ok(Value::Null(prop.host_type.clone())),
        None => value.coerce(&prop.host_type),
    }
}

pub(crate) fn bind_sqlite<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null(_) => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::SmallInt(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::BigInt(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Double(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(bytes) => query.bind(bytes.clone()),
        Value::Uuid(id) => query.bind(id.to_string()),
        Value::Date(date) => query.bind(format_date(date)),
        Value::Timestamp(naive) => query.bind(format_naive(naive)),
        Value::TimestampTz(at) => query.bind(format_instant(at)),
        Value::Json(json) => query.bind(json.to_string()),
        // No array type in SQLite; stored as JSON text.
        Value::Array(..) => query.bind(value.to_json().to_string()),
    }
}

pub(crate) fn bind_pg<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Result<Query<'q, Postgres, PgArguments>, sqlx::Error> {
    let query = match value {
        Value::Null(ty) => bind_pg_null(query, ty),
        Value::Bool(v) => query.bind(*v),
        Value::SmallInt(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::BigInt(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Double(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(bytes) => query.bind(bytes.clone()),
        Value::Uuid(id) => query.bind(*id),
        Value::Date(date) => query.bind(*date),
        Value::Timestamp(naive) => query.bind(*naive),
        Value::TimestampTz(at) => query.bind(*at),
        Value::Json(json) => query.bind(json.clone()),
        Value::Array(element, items) => return bind_pg_array(query, element, items, value),
    };
    Ok(query)
}

fn bind_pg_null<'q>(
    query: Query<'q, Postgres, PgArguments>,
    ty: &ColumnType,
) -> Query<'q, Postgres, PgArguments> {
    match ty {
        ColumnType::Bool => query.bind(None::<bool>),
        ColumnType::SmallInt => query.bind(None::<i16>),
        ColumnType::Int => query.bind(None::<i32>),
        ColumnType::BigInt => query.bind(None::<i64>),
        ColumnType::Real => query.bind(None::<f32>),
        ColumnType::Double => query.bind(None::<f64>),
        ColumnType::Text => query.bind(None::<String>),
        ColumnType::Bytes => query.bind(None::<Vec<u8>>),
        ColumnType::Uuid => query.bind(None::<Uuid>),
        ColumnType::Date => query.bind(None::<NaiveDate>),
        ColumnType::Timestamp => query.bind(None::<NaiveDateTime>),
        ColumnType::TimestampTz => query.bind(None::<DateTime<Utc>>),
        ColumnType::Json => query.bind(None::<Json>),
        ColumnType::Array(element) => match element.as_ref() {
            ColumnType::Bool => query.bind(None::<Vec<bool>>),
            ColumnType::SmallInt => query.bind(None::<Vec<i16>>),
            ColumnType::Int => query.bind(None::<Vec<i32>>),
            ColumnType::BigInt => query.bind(None::<Vec<i64>>),
            ColumnType::Real => query.bind(None::<Vec<f32>>),
            ColumnType::Double => query.bind(None::<Vec<f64>>),
            ColumnType::Text => query.bind(None::<Vec<String>>),
            ColumnType::Bytes => query.bind(None::<Vec<Vec<u8>>>),
            ColumnType::Uuid => query.bind(None::<Vec<Uuid>>),
            ColumnType::Date => query.bind(None::<Vec<NaiveDate>>),
            ColumnType::Timestamp => query.bind(None::<Vec<NaiveDateTime>>),
            ColumnType::TimestampTz => query.bind(None::<Vec<DateTime<Utc>>>),
            ColumnType::Json | ColumnType::Array(_) => query.bind(None::<Json>),
        },
    }
}

fn elements<T: FromValue>(items: &[Value]) -> Result<Vec<Option<T>>, sqlx::Error> {
    items
        .iter()
        .map(|item| Option::<T>::from_value(item.clone()))
        .collect::<Result<Vec<_>, ConversionError>>()
        .map_err(|err| sqlx::Error::Encode(Box::new(err)))
}

fn bind_pg_array<'q>(
    query: Query<'q, Postgres, PgArguments>,
    element: &ColumnType,
    items: &[Value],
    whole: &Value,
) -> Result<Query<'q, Postgres, PgArguments>, sqlx::Error> {
    let query = match element {
        ColumnType::Bool => query.bind(elements::<bool>(items)?),
        ColumnType::SmallInt => query.bind(elements::<i16>(items)?),
        ColumnType::Int => query.bind(elements::<i32>(items)?),
        ColumnType::BigInt => query.bind(elements::<i64>(items)?),
        ColumnType::Real => query.bind(elements::<f32>(items)?),
        ColumnType::Double => query.bind(elements::<f64>(items)?),
        ColumnType::Text => query.bind(elements::<String>(items)?),
        ColumnType::Bytes => query.bind(elements::<Vec<u8>>(items)?),
        ColumnType::Uuid => query.bind(elements::<Uuid>(items)?),
        ColumnType::Date => query.bind(elements::<NaiveDate>(items)?),
        ColumnType::Timestamp => query.bind(elements::<NaiveDateTime>(items)?),
        ColumnType::TimestampTz => query.bind(elements::<DateTime<Utc>>(items)?),
        ColumnType::Json => query.bind(elements::<Json>(items)?),
        // Multi-dimensional arrays go over as a JSON document.
        ColumnType::Array(_) => query.bind(whole.to_json()),
    };
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::metadata::{InsertRole, UpdateRole};

    fn directive(host_type: ColumnType, explicit_type: Option<ColumnType>) -> PropertyDirective {
        PropertyDirective {
            name: "payload",
            column: None,
            insert_role: InsertRole::Include,
            update_role: UpdateRole::Updatable,
            is_record_identifier: false,
            is_scope_identifier: false,
            explicit_type,
            host_type,
            nullable: true,
        }
    }

    #[test]
    fn placeholders_are_numbered_in_push_order() {
        let mut params = Params::default();
        assert_eq!(params.push(Value::BigInt(1)), "$1");
        assert_eq!(params.push(Value::Text("a".into())), "$2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn explicit_type_wins() {
        let prop = directive(ColumnType::Text, Some(ColumnType::Json));
        let bound = prepare(Value::Text(r#"{"a":1}"#.into()), &prop).unwrap();
        assert_eq!(bound, Value::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn nulls_take_the_host_type() {
        let prop = directive(ColumnType::TimestampTz, None);
        let bound = prepare(Value::Null(ColumnType::Text), &prop).unwrap();
        assert_eq!(bound, Value::Null(ColumnType::TimestampTz));
    }

    #[test]
    fn host_type_widens_values() {
        let prop = directive(ColumnType::BigInt, None);
        assert_eq!(prepare(Value::Int(3), &prop).unwrap(), Value::BigInt(3));
        assert!(prepare(Value::Bool(true), &prop).is_err());
    }

    #[test]
    fn array_elements_keep_nulls() {
        let items = vec![Value::BigInt(1), Value::Null(ColumnType::BigInt)];
        assert_eq!(elements::<i64>(&items).unwrap(), vec![Some(1), None]);
    }

    #[test]
    fn unconvertible_array_elements_fail_the_bind() {
        let items = vec![Value::BigInt(1), Value::Text("two".into())];
        let err = elements::<i64>(&items).unwrap_err();
        assert!(matches!(err, sqlx::Error::Encode(_)));
    }
}
