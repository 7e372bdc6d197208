//! Per-type mapping metadata.
//!
//! An entity describes itself once through [`EntityBuilder`]: constructor-level
//! directives (schema, table), exactly one mapping constructor whose parameter
//! names drive row materialization, and one directive per writable property.
//! The resulting [`EntityDescriptor`] is immutable and safe to share.
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::naming::{short_type_name, NamingConvention};
use super::quote_ident;
use super::value::{ColumnType, FromValue, IntoValue, SqlType, Value};
use crate::error::{ConfigurationError, ConversionError, MapResult};

pub trait Entity: Sized + Send + Sync + 'static {
    fn describe(mapping: &mut EntityBuilder);

    /// Builds the entity from mapping-constructor arguments, in declaration order.
    fn construct(args: &mut Args) -> MapResult<Self>;

    fn write(&self, values: &mut PropertyValues);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertRole {
    Include,
    ExcludeFromInsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRole {
    Updatable,
    ExcludedFromUpdate,
    Identifier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDirective {
    pub name: &'static str,
    pub column: Option<String>,
    pub insert_role: InsertRole,
    pub update_role: UpdateRole,
    pub is_record_identifier: bool,
    pub is_scope_identifier: bool,
    pub explicit_type: Option<ColumnType>,
    pub host_type: ColumnType,
    pub nullable: bool,
}

impl PropertyDirective {
    pub fn column_name(&self, naming: NamingConvention) -> String {
        self.column
            .clone()
            .unwrap_or_else(|| naming.translate(self.name))
    }

    pub fn is_identifier(&self) -> bool {
        self.update_role == UpdateRole::Identifier
    }

    pub fn is_insertable(&self) -> bool {
        self.insert_role == InsertRole::Include
    }
}

#[derive(Debug, Default)]
pub struct EntityBuilder {
    schema: Option<String>,
    table: Option<String>,
    constructors: Vec<Vec<Param>>,
    properties: Vec<PropertyDirective>,
}

impl EntityBuilder {
    pub fn schema(&mut self, schema: impl Into<String>) -> &mut Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn table(&mut self, table: impl Into<String>) -> &mut Self {
        self.table = Some(table.into());
        self
    }

    /// Declares the mapping constructor. Must be called exactly once.
    pub fn constructor(&mut self) -> ConstructorBuilder<'_> {
        let idx = self.constructors.len();
        self.constructors.push(Vec::new());
        ConstructorBuilder {
            params: &mut self.constructors[idx],
        }
    }

    pub fn property<T: SqlType>(&mut self, name: &'static str) -> PropertyBuilder<'_> {
        let idx = self.properties.len();
        self.properties.push(PropertyDirective {
            name,
            column: None,
            insert_role: InsertRole::Include,
            update_role: UpdateRole::Updatable,
            is_record_identifier: false,
            is_scope_identifier: false,
            explicit_type: None,
            host_type: T::column_type(),
            nullable: T::nullable(),
        });
        PropertyBuilder {
            directive: &mut self.properties[idx],
        }
    }
}

pub struct ConstructorBuilder<'a> {
    params: &'a mut Vec<Param>,
}

impl<'a> ConstructorBuilder<'a> {
    pub fn param<T: SqlType>(self, name: &'static str) -> Self {
        self.params.push(Param {
            name,
            column_type: T::column_type(),
            nullable: T::nullable(),
        });
        self
    }
}

pub struct PropertyBuilder<'a> {
    directive: &'a mut PropertyDirective,
}

impl<'a> PropertyBuilder<'a> {
    pub fn column(self, column: impl Into<String>) -> Self {
        self.directive.column = Some(column.into());
        self
    }

    pub fn exclude_from_insert(self) -> Self {
        self.directive.insert_role = InsertRole::ExcludeFromInsert;
        self
    }

    /// No effect on identifiers, which are never written by an update.
    pub fn exclude_from_update(self) -> Self {
        if self.directive.update_role != UpdateRole::Identifier {
            self.directive.update_role = UpdateRole::ExcludedFromUpdate;
        }
        self
    }

    pub fn identifier(self) -> Self {
        self.directive.update_role = UpdateRole::Identifier;
        self
    }

    /// Uniquely identifies one child row within its parent. Implies `identifier`.
    pub fn record_identifier(self) -> Self {
        self.directive.is_record_identifier = true;
        self.identifier()
    }

    /// Identifies the owning aggregate. Implies `identifier`.
    pub fn scope_identifier(self) -> Self {
        self.directive.is_scope_identifier = true;
        self.identifier()
    }

    pub fn column_type(self, ty: ColumnType) -> Self {
        self.directive.explicit_type = Some(ty);
        self
    }
}

/// Resolved schema and table for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    pub schema: String,
    pub table: String,
}

impl TypeMetadata {
    /// `"schema"."table"`, or just `"table"` when no schema applies.
    pub fn qualified(&self) -> String {
        if self.schema.is_empty() {
            quote_ident(&self.table)
        } else {
            format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub type_name: &'static str,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub constructor: Vec<Param>,
    pub properties: Vec<PropertyDirective>,
}

impl EntityDescriptor {
    pub fn resolve<T: Entity>() -> MapResult<Self> {
        let type_name = short_type_name(type_name::<T>());
        let mut builder = EntityBuilder::default();
        T::describe(&mut builder);

        let EntityBuilder {
            schema,
            table,
            mut constructors,
            properties,
        } = builder;
        let constructor = match constructors.len() {
            0 => return Err(ConfigurationError::MissingConstructor { type_name }.into()),
            1 => constructors.remove(0),
            count => {
                return Err(ConfigurationError::AmbiguousConstructor { type_name, count }.into())
            }
        };
        Ok(Self {
            type_name,
            schema,
            table,
            constructor,
            properties,
        })
    }

    /// Per-call override, then declared metadata, then the translated type name.
    pub fn type_metadata(
        &self,
        schema: Option<&str>,
        table: Option<&str>,
        naming: NamingConvention,
    ) -> TypeMetadata {
        let schema = schema
            .map(str::to_string)
            .or_else(|| self.schema.clone())
            .unwrap_or_default();
        let table = table
            .map(str::to_string)
            .or_else(|| self.table.clone())
            .unwrap_or_else(|| naming.translate(self.type_name));
        TypeMetadata { schema, table }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDirective> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Column a constructor parameter reads from. A property of the same name
    /// with a column override wins over translation.
    pub fn param_column(&self, param: &Param, naming: NamingConvention) -> String {
        match self.property(param.name) {
            Some(prop) => prop.column_name(naming),
            None => naming.translate(param.name),
        }
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &PropertyDirective> {
        self.properties.iter().filter(|p| p.is_identifier())
    }

    pub fn scope_identifiers(&self) -> impl Iterator<Item = &PropertyDirective> {
        self.identifiers().filter(|p| p.is_scope_identifier)
    }

    /// Identifier columns that tell children of one parent apart: the record
    /// identifier plus any other identifier that is not a scope identifier.
    pub fn record_key(&self) -> impl Iterator<Item = &PropertyDirective> {
        self.identifiers().filter(|p| !p.is_scope_identifier)
    }

    /// Upsert conflict target: the scope identifiers plus the record key, in
    /// declaration order. Sync deletes and upserts by this same key.
    pub fn conflict_key(&self) -> MapResult<Vec<&PropertyDirective>> {
        let flagged = self
            .properties
            .iter()
            .any(|p| p.is_record_identifier || p.is_scope_identifier);
        if !flagged {
            return Err(ConfigurationError::MissingConflictColumns {
                type_name: self.type_name,
            }
            .into());
        }
        Ok(self.identifiers().collect())
    }

    /// Sync needs exactly one record identifier and at least one scope identifier.
    pub fn require_sync_roles(&self, operation: &'static str) -> Result<(), ConfigurationError> {
        let found = self
            .identifiers()
            .filter(|p| p.is_record_identifier)
            .count();
        if found != 1 {
            return Err(ConfigurationError::RecordIdentifier {
                type_name: self.type_name,
                operation,
                found,
            });
        }
        if self.scope_identifiers().next().is_none() {
            return Err(ConfigurationError::MissingScopeIdentifier {
                type_name: self.type_name,
                operation,
            });
        }
        Ok(())
    }
}

/// Immutable per-type descriptor cache owned by the mapper.
#[derive(Debug, Default)]
pub struct MetadataCache {
    enabled: bool,
    entries: RwLock<HashMap<TypeId, Arc<EntityDescriptor>>>,
}

impl MetadataCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: RwLock::default(),
        }
    }

    pub fn get<T: Entity>(&self) -> MapResult<Arc<EntityDescriptor>> {
        if !self.enabled {
            return EntityDescriptor::resolve::<T>().map(Arc::new);
        }
        let key = TypeId::of::<T>();
        if let Some(found) = self.entries.read().ok().and_then(|m| m.get(&key).cloned()) {
            return Ok(found);
        }
        let descriptor = Arc::new(EntityDescriptor::resolve::<T>()?);
        if let Ok(mut entries) = self.entries.write() {
            entries.entry(key).or_insert_with(|| descriptor.clone());
        }
        Ok(descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Property values of one entity instance, keyed by property name.
#[derive(Debug, Default, Clone)]
pub struct PropertyValues {
    values: Vec<(&'static str, Value)>,
}

impl PropertyValues {
    pub fn set<V: IntoValue + ?Sized>(&mut self, name: &'static str, value: &V) -> &mut Self {
        self.values.push((name, value.to_value()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn of<T: Entity>(entity: &T) -> Self {
        let mut values = Self::default();
        entity.write(&mut values);
        values
    }
}

/// Mapping-constructor arguments produced by the row materializer.
#[derive(Debug)]
pub struct Args {
    columns: Vec<String>,
    values: Vec<Value>,
    position: usize,
}

impl Args {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            columns,
            values,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn all_null(&self) -> bool {
        self.values.iter().all(Value::is_null)
    }

    /// Takes the next argument, converted to the parameter's host type.
    pub fn next<T: FromValue>(&mut self) -> MapResult<T> {
        let idx = self.position;
        let Some(slot) = self.values.get_mut(idx) else {
            return Err(ConversionError {
                column: None,
                expected: format!("constructor argument #{}", idx + 1),
                found: format!("only {} arguments", self.values.len()),
            }
            .into());
        };
        self.position += 1;
        let value = std::mem::replace(slot, Value::Null(ColumnType::Text));
        let column = self.columns.get(idx).cloned().unwrap_or_default();
        T::from_value(value).map_err(|e| e.at(column).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl Entity for Bare {
        fn describe(mapping: &mut EntityBuilder) {
            mapping.property::<i64>("id").identifier();
        }

        fn construct(_args: &mut Args) -> MapResult<Self> {
            Ok(Bare)
        }

        fn write(&self, _values: &mut PropertyValues) {}
    }

    struct Twice;

    impl Entity for Twice {
        fn describe(mapping: &mut EntityBuilder) {
            mapping.constructor().param::<i64>("id");
            mapping.constructor().param::<i64>("id");
        }

        fn construct(_args: &mut Args) -> MapResult<Self> {
            Ok(Twice)
        }

        fn write(&self, _values: &mut PropertyValues) {}
    }

    struct AuditEntry;

    impl Entity for AuditEntry {
        fn describe(mapping: &mut EntityBuilder) {
            mapping.schema("audit");
            mapping
                .constructor()
                .param::<i64>("entryId")
                .param::<Option<String>>("note");
            mapping.property::<i64>("entryId").column("id").identifier();
            mapping.property::<Option<String>>("note");
        }

        fn construct(_args: &mut Args) -> MapResult<Self> {
            Ok(AuditEntry)
        }

        fn write(&self, _values: &mut PropertyValues) {}
    }

    #[test]
    fn missing_constructor_is_a_configuration_error() {
        let err = EntityDescriptor::resolve::<Bare>().unwrap_err();
        assert!(err.is_configuration());
        let err = EntityDescriptor::resolve::<Twice>().unwrap_err();
        assert!(err.to_string().contains("2 mapping constructors"));
    }

    #[test]
    fn table_name_priority() {
        let d = EntityDescriptor::resolve::<AuditEntry>().unwrap();
        let naming = NamingConvention::SnakeCase;

        let meta = d.type_metadata(None, None, naming);
        assert_eq!(meta.table, "audit_entry");
        assert_eq!(meta.qualified(), "\"audit\".\"audit_entry\"");

        let meta = d.type_metadata(Some("other"), Some("entries"), naming);
        assert_eq!(meta.qualified(), "\"other\".\"entries\"");

        let meta = d.type_metadata(None, None, NamingConvention::CamelCase);
        assert_eq!(meta.table, "auditEntry");
    }

    #[test]
    fn column_override_applies_to_reads() {
        let d = EntityDescriptor::resolve::<AuditEntry>().unwrap();
        let naming = NamingConvention::SnakeCase;
        assert_eq!(d.param_column(&d.constructor[0], naming), "id");
        assert_eq!(d.param_column(&d.constructor[1], naming), "note");
        assert!(d.constructor[1].nullable);
    }

    #[test]
    fn sync_roles_are_checked() {
        let d = EntityDescriptor::resolve::<AuditEntry>().unwrap();
        let err = d.require_sync_roles("sync").unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::RecordIdentifier { found: 0, .. }
        ));
    }

    struct Membership;

    impl Entity for Membership {
        fn describe(mapping: &mut EntityBuilder) {
            mapping.constructor().param::<i64>("groupId");
            mapping
                .property::<i64>("groupId")
                .scope_identifier()
                .exclude_from_update();
            mapping
                .property::<i64>("userId")
                .exclude_from_update()
                .record_identifier();
            mapping.property::<String>("role").exclude_from_update();
        }

        fn construct(_args: &mut Args) -> MapResult<Self> {
            Ok(Membership)
        }

        fn write(&self, _values: &mut PropertyValues) {}
    }

    #[test]
    fn identifier_roles_survive_directive_order() {
        let d = EntityDescriptor::resolve::<Membership>().unwrap();
        d.require_sync_roles("sync").unwrap();
        let ids: Vec<_> = d.identifiers().map(|p| p.name).collect();
        assert_eq!(ids, vec!["groupId", "userId"]);
        assert_eq!(
            d.property("role").unwrap().update_role,
            UpdateRole::ExcludedFromUpdate
        );
    }

    #[test]
    fn cache_resolves_once() {
        let cache = MetadataCache::new(true);
        let a = cache.get::<AuditEntry>().unwrap();
        let b = cache.get::<AuditEntry>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let uncached = MetadataCache::new(false);
        uncached.get::<AuditEntry>().unwrap();
        assert!(uncached.is_empty());
    }

    #[test]
    fn args_convert_in_order() {
        let mut args = Args::new(
            vec!["id".into(), "note".into()],
            vec![Value::BigInt(4), Value::Null(ColumnType::Text)],
        );
        assert_eq!(args.next::<i64>().unwrap(), 4);
        assert_eq!(args.next::<Option<String>>().unwrap(), None);
        assert!(args.next::<i64>().is_err());
    }
}
