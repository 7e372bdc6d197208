//! Result rows to mapping-constructor arguments.
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::postgres::{PgRow, PgTypeKind, PgValueFormat};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tracing::debug;
use uuid::Uuid;

use super::metadata::{Args, Entity, EntityDescriptor};
use super::naming::NamingConvention;
use super::value::{ColumnType, Value};
use crate::error::{MapResult, NameResolutionError};

/// What to do when a constructor parameter has no matching column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingColumnPolicy {
    #[default]
    #[serde(rename = "fail")]
    FailOnNotFound,
    #[serde(rename = "null")]
    NullOnNotFound,
    #[serde(rename = "default")]
    DefaultOnNotFound,
}

/// A driver-independent result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self { columns, values }
    }

    /// Exact match first, then ASCII case-insensitive.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(column))
            })?;
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Lines the row up with the mapping constructor's parameters.
pub fn arguments(
    descriptor: &EntityDescriptor,
    row: &Row,
    naming: NamingConvention,
    policy: MissingColumnPolicy,
) -> MapResult<Args> {
    let mut columns = Vec::with_capacity(descriptor.constructor.len());
    let mut values = Vec::with_capacity(descriptor.constructor.len());
    for param in &descriptor.constructor {
        let column = descriptor.param_column(param, naming);
        let value = match row.get(&column) {
            Some(value) => value.clone(),
            None => match policy {
                MissingColumnPolicy::FailOnNotFound => {
                    return Err(NameResolutionError {
                        type_name: descriptor.type_name,
                        parameter: param.name,
                        column,
                    }
                    .into())
                }
                MissingColumnPolicy::NullOnNotFound => Value::Null(param.column_type.clone()),
                MissingColumnPolicy::DefaultOnNotFound if param.nullable => {
                    Value::Null(param.column_type.clone())
                }
                MissingColumnPolicy::DefaultOnNotFound => param.column_type.zero_value(),
            },
        };
        columns.push(column);
        values.push(value);
    }
    Ok(Args::new(columns, values))
}

/// `None` when every resolved argument is null.
pub fn materialize<T: Entity>(
    descriptor: &EntityDescriptor,
    row: &Row,
    naming: NamingConvention,
    policy: MissingColumnPolicy,
) -> MapResult<Option<T>> {
    let mut args = arguments(descriptor, row, naming, policy)?;
    if !args.is_empty() && args.all_null() {
        return Ok(None);
    }
    T::construct(&mut args).map(Some)
}

/// Materializes every row. All-null rows are dropped: an entity whose columns
/// are all nullable cannot tell a legitimately empty row from "no data".
pub fn materialize_all<T: Entity>(
    descriptor: &EntityDescriptor,
    rows: &[Row],
    naming: NamingConvention,
    policy: MissingColumnPolicy,
) -> MapResult<Vec<T>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(entity) = materialize(descriptor, row, naming, policy)? {
            out.push(entity);
        }
    }
    let dropped = rows.len() - out.len();
    if dropped > 0 {
        debug!(
            type_name = descriptor.type_name,
            dropped, "dropped all-null rows from result"
        );
    }
    Ok(out)
}

pub(crate) fn decode_sqlite_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            values.push(Value::Null(ColumnType::Text));
            continue;
        }
        // Runtime storage class, not the declared column type.
        let storage = raw.type_info().name().to_ascii_uppercase();
        let value = match storage.as_str() {
            "INTEGER" | "BOOLEAN" => Value::BigInt(row.try_get_unchecked::<i64, _>(i)?),
            "REAL" => Value::Double(row.try_get_unchecked::<f64, _>(i)?),
            "BLOB" => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(i)?),
            _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
        };
        values.push(value);
    }
    Ok(Row { columns, values })
}

pub(crate) fn decode_pg_row(row: &PgRow) -> Result<Row, sqlx::Error> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        let value = match ColumnType::from_pg_name(column.type_info().name()) {
            Some(ty) => decode_pg_value(row, i, &ty)?,
            None => {
                let raw = row.try_get_raw(i)?;
                if raw.is_null() {
                    Value::Null(ColumnType::Text)
                } else {
                    let textual = raw.format() == PgValueFormat::Text
                        || matches!(column.type_info().kind(), PgTypeKind::Enum(_));
                    opaque_value(raw.as_bytes().map_err(sqlx::Error::Decode)?, textual)
                }
            }
        };
        values.push(value);
    }
    Ok(Row { columns, values })
}

/// Columns of types without a mapping (NUMERIC, INET, user enums, ...) are
/// kept as text when the wire value is text, else as their raw bytes.
fn opaque_value(bytes: &[u8], textual: bool) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) if textual => Value::Text(text.to_string()),
        _ => Value::Bytes(bytes.to_vec()),
    }
}

fn or_null<T>(value: Option<T>, wrap: impl FnOnce(T) -> Value, ty: &ColumnType) -> Value {
    value.map(wrap).unwrap_or_else(|| Value::Null(ty.clone()))
}

fn decode_pg_value(row: &PgRow, i: usize, ty: &ColumnType) -> Result<Value, sqlx::Error> {
    let value = match ty {
        ColumnType::Bool => or_null(row.try_get(i)?, Value::Bool, ty),
        ColumnType::SmallInt => or_null(row.try_get(i)?, Value::SmallInt, ty),
        ColumnType::Int => or_null(row.try_get(i)?, Value::Int, ty),
        ColumnType::BigInt => or_null(row.try_get(i)?, Value::BigInt, ty),
        ColumnType::Real => or_null(row.try_get(i)?, Value::Real, ty),
        ColumnType::Double => or_null(row.try_get(i)?, Value::Double, ty),
        ColumnType::Text => or_null(row.try_get(i)?, Value::Text, ty),
        ColumnType::Bytes => or_null(row.try_get(i)?, Value::Bytes, ty),
        ColumnType::Uuid => or_null(row.try_get(i)?, Value::Uuid, ty),
        ColumnType::Date => or_null(row.try_get(i)?, Value::Date, ty),
        ColumnType::Timestamp => or_null(row.try_get(i)?, Value::Timestamp, ty),
        ColumnType::TimestampTz => or_null(row.try_get(i)?, Value::TimestampTz, ty),
        ColumnType::Json => or_null(row.try_get(i)?, Value::Json, ty),
        ColumnType::Array(element) => decode_pg_array(row, i, element)?,
    };
    Ok(value)
}

fn array_of<T>(items: Option<Vec<Option<T>>>, element: &ColumnType, wrap: fn(T) -> Value) -> Value {
    match items {
        Some(items) => Value::Array(
            element.clone(),
            items
                .into_iter()
                .map(|item| or_null(item, wrap, element))
                .collect(),
        ),
        None => Value::Null(ColumnType::array_of(element.clone())),
    }
}

fn decode_pg_array(row: &PgRow, i: usize, element: &ColumnType) -> Result<Value, sqlx::Error> {
    let value = match element {
        ColumnType::Bool => array_of::<bool>(row.try_get(i)?, element, Value::Bool),
        ColumnType::SmallInt => array_of::<i16>(row.try_get(i)?, element, Value::SmallInt),
        ColumnType::Int => array_of::<i32>(row.try_get(i)?, element, Value::Int),
        ColumnType::BigInt => array_of::<i64>(row.try_get(i)?, element, Value::BigInt),
        ColumnType::Real => array_of::<f32>(row.try_get(i)?, element, Value::Real),
        ColumnType::Double => array_of::<f64>(row.try_get(i)?, element, Value::Double),
        ColumnType::Text => array_of::<String>(row.try_get(i)?, element, Value::Text),
        ColumnType::Bytes => array_of::<Vec<u8>>(row.try_get(i)?, element, Value::Bytes),
        ColumnType::Uuid => array_of::<Uuid>(row.try_get(i)?, element, Value::Uuid),
        ColumnType::Date => array_of::<NaiveDate>(row.try_get(i)?, element, Value::Date),
        ColumnType::Timestamp => {
            array_of::<NaiveDateTime>(row.try_get(i)?, element, Value::Timestamp)
        }
        ColumnType::TimestampTz => {
            array_of::<DateTime<Utc>>(row.try_get(i)?, element, Value::TimestampTz)
        }
        ColumnType::Json => array_of::<Json>(row.try_get(i)?, element, Value::Json),
        ColumnType::Array(_) => or_null(row.try_get(i)?, Value::Json, &ColumnType::Json),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::metadata::{EntityBuilder, PropertyValues};

    #[derive(Debug, PartialEq)]
    struct Reading {
        sensor_id: i64,
        label: Option<String>,
        level: i32,
    }

    impl Entity for Reading {
        fn describe(mapping: &mut EntityBuilder) {
            mapping
                .constructor()
                .param::<i64>("sensorId")
                .param::<Option<String>>("label")
                .param::<i32>("level");
        }

        fn construct(args: &mut Args) -> MapResult<Self> {
            Ok(Self {
                sensor_id: args.next()?,
                label: args.next()?,
                level: args.next()?,
            })
        }

        fn write(&self, values: &mut PropertyValues) {
            values.set("sensorId", &self.sensor_id);
        }
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::resolve::<Reading>().unwrap()
    }

    const NAMING: NamingConvention = NamingConvention::SnakeCase;

    #[test]
    fn columns_resolve_through_the_naming_convention() {
        let row = Row::from_pairs([
            ("LEVEL", Value::BigInt(3)),
            ("sensor_id", Value::BigInt(9)),
            ("label", Value::Text("north".into())),
        ]);
        let reading: Reading =
            materialize(&descriptor(), &row, NAMING, MissingColumnPolicy::FailOnNotFound)
                .unwrap()
                .unwrap();
        assert_eq!(
            reading,
            Reading {
                sensor_id: 9,
                label: Some("north".into()),
                level: 3
            }
        );
    }

    #[test]
    fn unmapped_pg_types_decode_without_failing() {
        // An enum label or a text-format NUMERIC comes back as text.
        assert_eq!(opaque_value(b"draft", true), Value::Text("draft".into()));
        assert_eq!(opaque_value(b"12.50", true), Value::Text("12.50".into()));
        // Binary wire values (INET, binary NUMERIC) keep their bytes.
        assert_eq!(
            opaque_value(&[2, 32, 0, 4, 10, 0, 0, 1], false),
            Value::Bytes(vec![2, 32, 0, 4, 10, 0, 0, 1])
        );
        assert_eq!(opaque_value(&[0xff, 0xfe], true), Value::Bytes(vec![0xff, 0xfe]));
    }

    #[test]
    fn missing_column_policies() {
        let row = Row::from_pairs([("sensor_id", Value::BigInt(9))]);
        let d = descriptor();

        let err = materialize::<Reading>(&d, &row, NAMING, MissingColumnPolicy::FailOnNotFound)
            .unwrap_err();
        assert!(err.to_string().contains("label"));

        let args = arguments(&d, &row, NAMING, MissingColumnPolicy::NullOnNotFound).unwrap();
        assert_eq!(args.len(), 3);
        let mut args = args;
        assert_eq!(args.next::<i64>().unwrap(), 9);
        assert_eq!(args.next::<Option<String>>().unwrap(), None);

        let reading: Reading =
            materialize(&d, &row, NAMING, MissingColumnPolicy::DefaultOnNotFound)
                .unwrap()
                .unwrap();
        assert_eq!(reading.label, None);
        assert_eq!(reading.level, 0);
    }

    #[test]
    fn all_null_rows_are_dropped() {
        let rows = vec![
            Row::from_pairs([
                ("sensor_id", Value::Null(ColumnType::BigInt)),
                ("label", Value::Null(ColumnType::Text)),
                ("level", Value::Null(ColumnType::Int)),
            ]),
            Row::from_pairs([
                ("sensor_id", Value::BigInt(1)),
                ("label", Value::Null(ColumnType::Text)),
                ("level", Value::BigInt(2)),
            ]),
        ];
        let readings: Vec<Reading> = materialize_all(
            &descriptor(),
            &rows,
            NAMING,
            MissingColumnPolicy::FailOnNotFound,
        )
        .unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor_id, 1);
    }

    #[test]
    fn policy_names_in_config() {
        let policy: MissingColumnPolicy = serde_yaml::from_str("null").unwrap();
        assert_eq!(policy, MissingColumnPolicy::NullOnNotFound);
    }
}
