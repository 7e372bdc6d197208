//! Parameterized SQL for the typed operations.
//!
//! Every identifier is quoted and every value is bound; nothing is
//! interpolated into the command text. Builders return `None` when there is
//! nothing to do (an empty batch) so callers can skip the round trip.
use tracing::debug;

use super::binder::{prepare, property_value, Params};
use super::metadata::{EntityDescriptor, PropertyDirective, PropertyValues, TypeMetadata, UpdateRole};
use super::naming::NamingConvention;
use super::value::{IntoValue, Value};
use super::{quote_ident, Dialect};
use crate::error::{ConfigurationError, MapResult};

/// SQL text plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Command {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// How identifier conditions within one row are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Joiner {
    #[default]
    And,
    Or,
}

impl Joiner {
    fn keyword(self) -> &'static str {
        match self {
            Joiner::And => " AND ",
            Joiner::Or => " OR ",
        }
    }
}

/// Explicit parent scope for a sync, as (property name, value) pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParentIdentifiers {
    values: Vec<(String, Value)>,
}

impl ParentIdentifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<V: IntoValue>(mut self, property: impl Into<String>, value: V) -> Self {
        self.values.push((property.into(), value.to_value()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(p, v)| (p.as_str(), v))
    }
}

pub struct QueryBuilder<'a> {
    descriptor: &'a EntityDescriptor,
    meta: TypeMetadata,
    naming: NamingConvention,
    dialect: Dialect,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(
        descriptor: &'a EntityDescriptor,
        meta: TypeMetadata,
        naming: NamingConvention,
        dialect: Dialect,
    ) -> Self {
        Self {
            descriptor,
            meta,
            naming,
            dialect,
        }
    }

    pub fn descriptor(&self) -> &'a EntityDescriptor {
        self.descriptor
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn column(&self, prop: &PropertyDirective) -> String {
        quote_ident(&prop.column_name(self.naming))
    }

    fn column_list(&self, props: &[&PropertyDirective]) -> String {
        props
            .iter()
            .map(|p| self.column(p))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `SELECT * FROM table [clause]`.
    pub fn select(&self, clause: &str, params: Vec<Value>) -> Command {
        let mut sql = format!("SELECT * FROM {}", self.meta.qualified());
        let clause = normalize_clause(clause);
        if !clause.is_empty() {
            sql.push(' ');
            sql.push_str(&clause);
        }
        Command::new(sql, params)
    }

    fn insertable(&self) -> MapResult<Vec<&'a PropertyDirective>> {
        let props: Vec<_> = self
            .descriptor
            .properties
            .iter()
            .filter(|p| p.is_insertable())
            .collect();
        if props.is_empty() {
            return Err(ConfigurationError::NoInsertableColumns {
                type_name: self.descriptor.type_name,
            }
            .into());
        }
        Ok(props)
    }

    /// `(…), (…)` with one placeholder per property per row.
    fn value_tuples(
        &self,
        rows: &[PropertyValues],
        props: &[&PropertyDirective],
        params: &mut Params,
    ) -> MapResult<String> {
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let mut slots = Vec::with_capacity(props.len());
            for prop in props {
                let value = property_value(self.descriptor, row, prop)?;
                slots.push(params.push(value));
            }
            tuples.push(format!("({})", slots.join(", ")));
        }
        Ok(tuples.join(", "))
    }

    fn insert_text(
        &self,
        rows: &[PropertyValues],
        params: &mut Params,
    ) -> MapResult<(String, Vec<&'a PropertyDirective>)> {
        let props = self.insertable()?;
        let tuples = self.value_tuples(rows, &props, params)?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.meta.qualified(),
            self.column_list(&props),
            tuples
        );
        Ok((sql, props))
    }

    pub fn insert(&self, rows: &[PropertyValues]) -> MapResult<Option<Command>> {
        if rows.is_empty() {
            return Ok(None);
        }
        let mut params = Params::default();
        let (sql, _) = self.insert_text(rows, &mut params)?;
        Ok(Some(Command::new(sql, params.into_values())))
    }

    /// Insert that reports `returning` (a property name) for each new row.
    pub fn insert_returning(
        &self,
        rows: &[PropertyValues],
        returning: &str,
    ) -> MapResult<Option<Command>> {
        let prop = self.descriptor.property(returning).ok_or_else(|| {
            ConfigurationError::UnknownProperty {
                type_name: self.descriptor.type_name,
                property: returning.to_string(),
            }
        })?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut params = Params::default();
        let (sql, _) = self.insert_text(rows, &mut params)?;
        let sql = format!("{sql} RETURNING {}", self.column(prop));
        Ok(Some(Command::new(sql, params.into_values())))
    }

    /// Insert with `ON CONFLICT` over the scope identifiers and record key.
    pub fn upsert(&self, rows: &[PropertyValues]) -> MapResult<Option<Command>> {
        let conflict = self.descriptor.conflict_key()?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut params = Params::default();
        let (mut sql, props) = self.insert_text(rows, &mut params)?;
        let updates: Vec<String> = props
            .iter()
            .filter(|p| p.update_role == UpdateRole::Updatable)
            .map(|p| {
                let col = self.column(p);
                format!("{col} = EXCLUDED.{col}")
            })
            .collect();
        sql.push_str(&format!(" ON CONFLICT ({})", self.column_list(&conflict)));
        if updates.is_empty() {
            sql.push_str(" DO NOTHING");
        } else {
            sql.push_str(&format!(" DO UPDATE SET {}", updates.join(", ")));
        }
        Ok(Some(Command::new(sql, params.into_values())))
    }

    /// Batched update joined against a VALUES list on the identifier columns.
    pub fn update(&self, rows: &[PropertyValues], joiner: Joiner) -> MapResult<Option<Command>> {
        let identifiers: Vec<_> = self.descriptor.identifiers().collect();
        if identifiers.is_empty() {
            return Err(ConfigurationError::MissingIdentifiers {
                type_name: self.descriptor.type_name,
                operation: "update",
            }
            .into());
        }
        if rows.is_empty() {
            return Ok(None);
        }
        self.shared_parent(rows, None)?;
        let updatable: Vec<_> = self
            .descriptor
            .properties
            .iter()
            .filter(|p| p.update_role == UpdateRole::Updatable)
            .collect();
        if updatable.is_empty() {
            debug!(
                type_name = self.descriptor.type_name,
                "no updatable properties; update skipped"
            );
            return Ok(None);
        }

        let mut params = Params::default();
        let columns: Vec<&PropertyDirective> =
            identifiers.iter().chain(updatable.iter()).copied().collect();
        let tuples = self.value_tuples(rows, &columns, &mut params)?;
        let set = updatable
            .iter()
            .map(|p| {
                let col = self.column(p);
                format!("{col} = b.{col}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let matches = identifiers
            .iter()
            .map(|p| {
                let col = self.column(p);
                format!("t.{col} = b.{col}")
            })
            .collect::<Vec<_>>()
            .join(joiner.keyword());
        let table = self.meta.qualified();
        let column_list = self.column_list(&columns);
        let sql = match self.dialect {
            Dialect::Postgres => format!(
                "UPDATE {table} AS t SET {set} FROM (VALUES {tuples}) AS b({column_list}) WHERE ({matches})"
            ),
            Dialect::Sqlite => format!(
                "WITH b({column_list}) AS (VALUES {tuples}) UPDATE {table} AS t SET {set} FROM b WHERE ({matches})"
            ),
        };
        Ok(Some(Command::new(sql, params.into_values())))
    }

    /// One OR-ed condition group per row over that row's identifier columns.
    pub fn remove(&self, rows: &[PropertyValues], joiner: Joiner) -> MapResult<Option<Command>> {
        let identifiers: Vec<_> = self.descriptor.identifiers().collect();
        if identifiers.is_empty() {
            return Err(ConfigurationError::MissingIdentifiers {
                type_name: self.descriptor.type_name,
                operation: "remove",
            }
            .into());
        }
        if rows.is_empty() {
            return Ok(None);
        }
        let mut params = Params::default();
        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let mut conditions = Vec::with_capacity(identifiers.len());
            for prop in &identifiers {
                let value = property_value(self.descriptor, row, prop)?;
                conditions.push(condition(&self.column(prop), value, &mut params));
            }
            groups.push(format!("({})", conditions.join(joiner.keyword())));
        }
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.meta.qualified(),
            groups.join(" OR ")
        );
        Ok(Some(Command::new(sql, params.into_values())))
    }

    /// The delete half of a sync: removes the parent's rows whose record key
    /// is not among `rows`, or every row of the parent when `rows` is empty.
    pub fn sync_delete(
        &self,
        rows: &[PropertyValues],
        parents: Option<&ParentIdentifiers>,
    ) -> MapResult<Option<Command>> {
        self.descriptor.require_sync_roles("sync")?;
        let parents = parents.filter(|p| !p.is_empty());

        let scope = match (parents, rows.first()) {
            (Some(explicit), _) => self.explicit_parent(explicit)?,
            (None, Some(_)) => self.shared_parent(rows, None)?,
            (None, None) => return Ok(None),
        };
        if parents.is_some() && !rows.is_empty() {
            self.shared_parent(rows, Some(scope.as_slice()))?;
        }

        let mut params = Params::default();
        let mut conditions: Vec<String> = scope
            .iter()
            .map(|(prop, value)| condition(&self.column(prop), value.clone(), &mut params))
            .collect();

        if !rows.is_empty() {
            let key: Vec<_> = self.descriptor.record_key().collect();
            if let Some(exclusion) = self.exclusion(rows, &key, &mut params)? {
                conditions.push(exclusion);
            }
        }

        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.meta.qualified(),
            conditions.join(" AND ")
        );
        Ok(Some(Command::new(sql, params.into_values())))
    }

    fn exclusion(
        &self,
        rows: &[PropertyValues],
        key: &[&PropertyDirective],
        params: &mut Params,
    ) -> MapResult<Option<String>> {
        let mut tuples: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
        for row in rows {
            let tuple = key
                .iter()
                .map(|prop| property_value(self.descriptor, row, prop))
                .collect::<Result<Vec<_>, _>>()?;
            // A NULL in a NOT IN set would keep every row.
            if tuple.iter().any(Value::is_null) {
                continue;
            }
            tuples.push(tuple);
        }
        if tuples.is_empty() {
            return Ok(None);
        }

        if let [single] = key {
            let col = self.column(single);
            let values: Vec<Value> = tuples.into_iter().flatten().collect();
            let clause = match self.dialect {
                Dialect::Postgres => {
                    let element = single
                        .explicit_type
                        .clone()
                        .unwrap_or_else(|| single.host_type.clone());
                    let placeholder = params.push(Value::Array(element, values));
                    format!("NOT ({col} = ANY({placeholder}))")
                }
                Dialect::Sqlite => {
                    let slots: Vec<String> = values.into_iter().map(|v| params.push(v)).collect();
                    format!("{col} NOT IN ({})", slots.join(", "))
                }
            };
            return Ok(Some(clause));
        }

        let rows_sql: Vec<String> = tuples
            .into_iter()
            .map(|tuple| {
                let slots: Vec<String> = tuple.into_iter().map(|v| params.push(v)).collect();
                format!("({})", slots.join(", "))
            })
            .collect();
        Ok(Some(format!(
            "({}) NOT IN (VALUES {})",
            self.column_list(key),
            rows_sql.join(", ")
        )))
    }

    fn explicit_parent(
        &self,
        parents: &ParentIdentifiers,
    ) -> MapResult<Vec<(&'a PropertyDirective, Value)>> {
        parents
            .iter()
            .map(|(name, value)| -> MapResult<(&'a PropertyDirective, Value)> {
                let prop = self.descriptor.property(name).ok_or_else(|| {
                    ConfigurationError::UnknownProperty {
                        type_name: self.descriptor.type_name,
                        property: name.to_string(),
                    }
                })?;
                if !prop.is_scope_identifier {
                    return Err(ConfigurationError::NotAScopeIdentifier {
                        type_name: self.descriptor.type_name,
                        property: name.to_string(),
                    }
                    .into());
                }
                Ok((prop, prepare(value.clone(), prop)?))
            })
            .collect()
    }

    /// Scope identifier values shared by every row. Rows disagreeing with
    /// each other, or with `expected`, are a configuration error.
    fn shared_parent(
        &self,
        rows: &[PropertyValues],
        expected: Option<&[(&'a PropertyDirective, Value)]>,
    ) -> MapResult<Vec<(&'a PropertyDirective, Value)>> {
        let scope: Vec<_> = self.descriptor.scope_identifiers().collect();
        let mut first: Option<Vec<(&'a PropertyDirective, Value)>> = None;
        for row in rows {
            let tuple = scope
                .iter()
                .map(|prop| Ok((*prop, property_value(self.descriptor, row, prop)?)))
                .collect::<MapResult<Vec<_>>>()?;
            let reference = match (&first, expected) {
                (Some(first), _) => Some(first.as_slice()),
                (None, Some(expected)) => Some(expected),
                (None, None) => None,
            };
            if let Some(reference) = reference {
                for (prop, value) in &tuple {
                    let known = reference.iter().find(|(p, _)| p.name == prop.name);
                    if let Some((_, expected_value)) = known {
                        if expected_value != value {
                            return Err(ConfigurationError::MixedParents {
                                type_name: self.descriptor.type_name,
                                first: expected_value.to_string(),
                                other: value.to_string(),
                            }
                            .into());
                        }
                    }
                }
            }
            if first.is_none() {
                first = Some(tuple);
            }
        }
        Ok(first.unwrap_or_default())
    }
}

/// `"col" = $n`, or `"col" IS NULL` for a null value.
fn condition(column: &str, value: Value, params: &mut Params) -> String {
    if value.is_null() {
        return format!("{column} IS NULL");
    }
    format!("{column} = {}", params.push(value))
}

/// Prefixes `WHERE` unless the clause already starts with a clause keyword.
fn normalize_clause(clause: &str) -> String {
    let trimmed = clause.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match first.as_str() {
        "WHERE" | "ORDER" | "GROUP" | "LIMIT" => trimmed.to_string(),
        _ => format!("WHERE {trimmed}"),
    }
}
