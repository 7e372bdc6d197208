//! Replace-the-children synchronization.
//!
//! A sync deletes the parent's rows that are absent from the incoming set and
//! then upserts the whole set. The two statements are not wrapped in a
//! transaction here; callers that need atomicity pass their own.
use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::binder::property_value;
use super::executor::{execute, Connection};
use super::metadata::{EntityDescriptor, PropertyValues};
use super::query::{ParentIdentifiers, QueryBuilder};
use crate::error::MapResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    ValidateIdentifierRoles,
    ComputeCurrentIdentifierSet,
    DeleteStale,
    UpsertAll,
    Done,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::ValidateIdentifierRoles => "validate_identifier_roles",
            SyncStage::ComputeCurrentIdentifierSet => "compute_current_identifier_set",
            SyncStage::DeleteStale => "delete_stale",
            SyncStage::UpsertAll => "upsert_all",
            SyncStage::Done => "done",
        }
    }
}

/// Runs one single-parent sync and returns deleted plus upserted rows.
///
/// Both commands are built before either runs, so configuration problems
/// surface before any SQL is issued.
pub(crate) async fn sync(
    conn: &mut dyn Connection,
    builder: &QueryBuilder<'_>,
    rows: &[PropertyValues],
    parents: Option<&ParentIdentifiers>,
    cancel: Option<&CancellationToken>,
) -> MapResult<u64> {
    let type_name = builder.descriptor().type_name;
    let mut stage = SyncStage::ValidateIdentifierRoles;
    let mut delete = None;
    let mut upsert = None;
    let mut total = 0;
    loop {
        debug!(type_name, stage = stage.as_str(), rows = rows.len(), "sync");
        stage = match stage {
            SyncStage::ValidateIdentifierRoles => {
                builder.descriptor().require_sync_roles("sync")?;
                SyncStage::ComputeCurrentIdentifierSet
            }
            SyncStage::ComputeCurrentIdentifierSet => {
                delete = builder.sync_delete(rows, parents)?;
                upsert = builder.upsert(rows)?;
                SyncStage::DeleteStale
            }
            SyncStage::DeleteStale => {
                if let Some(command) = delete.take() {
                    let deleted = execute(conn, &command, cancel).await?;
                    debug!(type_name, deleted, "stale rows removed");
                    total += deleted;
                }
                SyncStage::UpsertAll
            }
            SyncStage::UpsertAll => {
                if let Some(command) = upsert.take() {
                    total += execute(conn, &command, cancel).await?;
                }
                SyncStage::Done
            }
            SyncStage::Done => return Ok(total),
        }
    }
}

/// Groups rows by their scope identifier tuple, keyed by the `|`-joined
/// literals. First-seen order of parents and of rows within a parent is kept.
pub(crate) fn partition(
    descriptor: &EntityDescriptor,
    rows: Vec<PropertyValues>,
) -> MapResult<Vec<(String, Vec<PropertyValues>)>> {
    descriptor.require_sync_roles("sync_multi_parent")?;
    let scope: Vec<_> = descriptor.scope_identifiers().collect();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<PropertyValues>)> = Vec::new();
    for row in rows {
        let mut parts = Vec::with_capacity(scope.len());
        for prop in &scope {
            parts.push(property_value(descriptor, &row, prop)?.sql_literal());
        }
        let key = parts.join("|");
        match index.get(&key) {
            Some(&slot) => groups[slot].1.push(row),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![row]));
            }
        }
    }
    Ok(groups)
}

/// Runs one sync per parent partition, sequentially. A failure stops the
/// loop; earlier partitions stay applied unless the caller rolls back.
pub(crate) async fn sync_multi_parent(
    conn: &mut dyn Connection,
    builder: &QueryBuilder<'_>,
    rows: Vec<PropertyValues>,
    cancel: Option<&CancellationToken>,
) -> MapResult<u64> {
    let partitions = partition(builder.descriptor(), rows)?;
    debug!(
        type_name = builder.descriptor().type_name,
        partitions = partitions.len(),
        "multi-parent sync"
    );
    let mut total = 0;
    for (key, group) in &partitions {
        debug!(parent = %key, rows = group.len(), "syncing partition");
        total += sync(conn, builder, group, None, cancel).await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::metadata::{Args, Entity, EntityBuilder};

    struct Tag {
        post_id: i64,
        label: String,
    }

    impl Entity for Tag {
        fn describe(mapping: &mut EntityBuilder) {
            mapping
                .constructor()
                .param::<i64>("postId")
                .param::<String>("label");
            mapping.property::<i64>("postId").scope_identifier();
            mapping.property::<String>("label").record_identifier();
        }

        fn construct(args: &mut Args) -> MapResult<Self> {
            Ok(Self {
                post_id: args.next()?,
                label: args.next()?,
            })
        }

        fn write(&self, values: &mut PropertyValues) {
            values
                .set("postId", &self.post_id)
                .set("label", &self.label);
        }
    }

    fn tag(post_id: i64, label: &str) -> PropertyValues {
        PropertyValues::of(&Tag {
            post_id,
            label: label.into(),
        })
    }

    #[test]
    fn partitions_never_mix_parents() {
        let d = EntityDescriptor::resolve::<Tag>().unwrap();
        let groups = partition(
            &d,
            vec![tag(2, "a"), tag(1, "b"), tag(2, "c"), tag(3, "d"), tag(1, "e")],
        )
        .unwrap();

        let keys: Vec<&str> = groups.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["2", "1", "3"]);
        for (key, rows) in &groups {
            for row in rows {
                assert_eq!(&row.get("postId").unwrap().sql_literal(), key);
            }
        }
        let labels: Vec<String> = groups[0]
            .1
            .iter()
            .map(|r| r.get("label").unwrap().to_string())
            .collect();
        assert_eq!(labels, vec!["'a'", "'c'"]);
    }

    #[test]
    fn partition_requires_sync_roles() {
        struct Loose;
        impl Entity for Loose {
            fn describe(mapping: &mut EntityBuilder) {
                mapping.constructor().param::<i64>("id");
                mapping.property::<i64>("id").identifier();
            }
            fn construct(_args: &mut Args) -> MapResult<Self> {
                Ok(Loose)
            }
            fn write(&self, _values: &mut PropertyValues) {}
        }

        let d = EntityDescriptor::resolve::<Loose>().unwrap();
        assert!(partition(&d, vec![]).unwrap_err().is_configuration());
    }

    #[test]
    fn stage_names() {
        assert_eq!(SyncStage::DeleteStale.as_str(), "delete_stale");
        assert_eq!(SyncStage::Done.as_str(), "done");
    }
}
