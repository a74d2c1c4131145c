//! Keyspace and table scoping for backup and restore requests.
//!
//! A request names either whole keyspaces (`ks1,ks2`) or explicit tables
//! (`ks1.t1,ks2.t2`). Renames (`ks1.t1=ks1.t2`) redirect restored data of one
//! table into another one.

pub mod cassandra_data;

pub use cassandra_data::CassandraData;

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Keyspaces owned by Cassandra itself.
pub const SYSTEM_KEYSPACES: &[&str] = &[
    "system",
    "system_schema",
    "system_auth",
    "system_distributed",
    "system_traces",
    "system_views",
    "system_virtual_schema",
];

/// System keyspaces a brand-new cluster needs to come up with the restored schema.
pub const BOOTSTRAP_KEYSPACES: &[&str] = &["system_schema"];

pub fn is_system_keyspace(keyspace: &str) -> bool {
    SYSTEM_KEYSPACES.contains(&keyspace)
}

/// Whether a keyspace survives system keyspace filtering.
pub fn filter_system_keyspace(keyspace: &str, include_system: bool, new_cluster: bool) -> bool {
    if !is_system_keyspace(keyspace) || include_system {
        return true;
    }
    new_cluster && BOOTSTRAP_KEYSPACES.contains(&keyspace)
}

/// A fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyspaceTable {
    pub keyspace: String,
    pub table: String,
}

impl KeyspaceTable {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
        }
    }

    /// Parse `keyspace.table`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().split_once('.') {
            Some((ks, table)) if !ks.is_empty() && !table.is_empty() && !table.contains('.') => {
                Ok(Self::new(ks, table))
            }
            _ => Err(BackupError::Validation(format!(
                "'{}' is not of the form keyspace.table",
                value
            ))),
        }
    }
}

impl fmt::Display for KeyspaceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.table)
    }
}

/// Set of keyspaces or of tables a request applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseEntities {
    keyspaces: BTreeSet<String>,
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl DatabaseEntities {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_keyspaces<I, S>(keyspaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keyspaces: keyspaces.into_iter().map(Into::into).collect(),
            tables: BTreeMap::new(),
        }
    }

    pub fn from_tables<I>(tables: I) -> Self
    where
        I: IntoIterator<Item = KeyspaceTable>,
    {
        let mut entities = Self::default();
        for kt in tables {
            entities.add_table(kt);
        }
        entities
    }

    /// Parse a comma separated list such as `ks1,ks2` or `ks1.t1,ks2.t2`.
    ///
    /// Mixing both forms is accepted here and rejected by [`DatabaseEntities::validate`].
    pub fn parse(value: &str) -> Result<Self> {
        let mut entities = Self::default();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if item.contains('.') {
                entities.add_table(KeyspaceTable::parse(item)?);
            } else {
                entities.keyspaces.insert(item.to_string());
            }
        }
        Ok(entities)
    }

    pub fn is_empty(&self) -> bool {
        self.keyspaces.is_empty() && self.tables.is_empty()
    }

    pub fn table_subset_only(&self) -> bool {
        !self.tables.is_empty() && self.keyspaces.is_empty()
    }

    pub fn keyspaces_only(&self) -> bool {
        !self.keyspaces.is_empty() && self.tables.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.keyspaces.is_empty() && !self.tables.is_empty() {
            return Err(BackupError::Validation(format!(
                "entities must be either keyspaces or tables, not both: '{}'",
                self
            )));
        }
        Ok(())
    }

    pub fn add_table(&mut self, kt: KeyspaceTable) {
        self.tables.entry(kt.keyspace).or_default().insert(kt.table);
    }

    pub fn remove_table(&mut self, kt: &KeyspaceTable) -> bool {
        let Some(tables) = self.tables.get_mut(&kt.keyspace) else {
            return false;
        };
        let removed = tables.remove(&kt.table);
        if tables.is_empty() {
            self.tables.remove(&kt.keyspace);
        }
        removed
    }

    pub fn contains_table(&self, kt: &KeyspaceTable) -> bool {
        self.tables
            .get(&kt.keyspace)
            .is_some_and(|tables| tables.contains(&kt.table))
    }

    pub fn contains_keyspace(&self, keyspace: &str) -> bool {
        self.keyspaces.contains(keyspace) || self.tables.contains_key(keyspace)
    }

    pub fn keyspaces(&self) -> impl Iterator<Item = &str> {
        self.keyspaces.iter().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = KeyspaceTable> + '_ {
        self.tables.iter().flat_map(|(ks, tables)| {
            tables.iter().map(move |table| KeyspaceTable::new(ks.clone(), table.clone()))
        })
    }

    pub fn table_count(&self) -> usize {
        self.tables.values().map(BTreeSet::len).sum()
    }

    /// Intersect `self`, the known tables, with what a request asked for.
    ///
    /// Keyspace requests keep every known table of those keyspaces; table
    /// requests keep the named tables and drop system keyspace tables unless
    /// `include_system` is set (bootstrap keyspaces survive for a new cluster).
    /// An empty request selects every known non-system table.
    pub fn filter(
        &self,
        requested: &DatabaseEntities,
        include_system: bool,
        new_cluster: bool,
    ) -> DatabaseEntities {
        let known = self.tables();
        let selected = known.filter(|kt| {
            if requested.is_empty() {
                filter_system_keyspace(&kt.keyspace, include_system, new_cluster)
            } else if requested.keyspaces_only() {
                requested.keyspaces.contains(&kt.keyspace)
            } else {
                requested.contains_table(kt)
                    && filter_system_keyspace(&kt.keyspace, include_system, new_cluster)
            }
        });
        DatabaseEntities::from_tables(selected.collect::<Vec<_>>())
    }
}

impl fmt::Display for DatabaseEntities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .keyspaces
            .iter()
            .cloned()
            .chain(self.tables().map(|kt| kt.to_string()))
            .collect();
        write!(f, "{}", items.join(","))
    }
}

/// Table renames applied while restoring, `from` → `to`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenamedEntities {
    renames: BTreeMap<KeyspaceTable, KeyspaceTable>,
}

impl RenamedEntities {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse `ks1.t1=ks1.t2,ks2.a=ks3.b`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut renames = BTreeMap::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (from, to) = item.split_once('=').ok_or_else(|| {
                BackupError::Validation(format!("rename '{}' is not of the form ks.from=ks.to", item))
            })?;
            let from = KeyspaceTable::parse(from)?;
            let to = KeyspaceTable::parse(to)?;
            if renames.insert(from.clone(), to).is_some() {
                return Err(BackupError::Validation(format!(
                    "table {} is renamed more than once",
                    from
                )));
            }
        }
        Ok(Self { renames })
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (KeyspaceTable, KeyspaceTable)>,
    {
        Self {
            renames: pairs.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    /// Renames may cross keyspaces. Chains, self renames and two tables
    /// renamed into the same target are rejected.
    pub fn validate(&self) -> Result<()> {
        let mut targets = BTreeSet::new();
        for (from, to) in &self.renames {
            if from == to {
                return Err(BackupError::Validation(format!(
                    "table {} is renamed to itself",
                    from
                )));
            }
            if self.renames.contains_key(to) {
                return Err(BackupError::Validation(format!(
                    "rename target {} is itself renamed",
                    to
                )));
            }
            if !targets.insert(to) {
                return Err(BackupError::Validation(format!(
                    "more than one table is renamed to {}",
                    to
                )));
            }
        }
        Ok(())
    }

    pub fn froms(&self) -> impl Iterator<Item = &KeyspaceTable> {
        self.renames.keys()
    }

    pub fn tos(&self) -> impl Iterator<Item = &KeyspaceTable> {
        self.renames.values()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&KeyspaceTable, &KeyspaceTable)> {
        self.renames.iter()
    }

    /// The table whose backed up data lands in `to`.
    pub fn source_of(&self, to: &KeyspaceTable) -> Option<&KeyspaceTable> {
        self.renames
            .iter()
            .find_map(|(from, target)| (target == to).then_some(from))
    }
}

impl fmt::Display for RenamedEntities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .renames
            .iter()
            .map(|(from, to)| format!("{}={}", from, to))
            .collect();
        write!(f, "{}", items.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keyspaces_and_tables() {
        let keyspaces = DatabaseEntities::parse("ks1, ks2").unwrap();
        assert!(keyspaces.keyspaces_only());
        assert!(!keyspaces.table_subset_only());

        let tables = DatabaseEntities::parse("ks1.t1,ks2.t2").unwrap();
        assert!(tables.table_subset_only());
        assert_eq!(tables.table_count(), 2);
        assert!(tables.contains_table(&KeyspaceTable::new("ks2", "t2")));
    }

    #[test]
    fn test_mixed_entities_fail_validation() {
        let mixed = DatabaseEntities::parse("ks1,ks2.t2").unwrap();
        assert!(!mixed.keyspaces_only());
        assert!(!mixed.table_subset_only());
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn test_parse_rejects_nested_names() {
        assert!(DatabaseEntities::parse("ks.t.x").is_err());
        assert!(KeyspaceTable::parse(".t").is_err());
    }

    #[test]
    fn test_filter_drops_system_tables_for_table_requests() {
        let known = DatabaseEntities::from_tables(vec![
            KeyspaceTable::new("ks1", "t1"),
            KeyspaceTable::new("system_schema", "tables"),
            KeyspaceTable::new("system_auth", "roles"),
        ]);
        let requested = DatabaseEntities::parse("ks1.t1,system_schema.tables,system_auth.roles").unwrap();

        let filtered = known.filter(&requested, false, false);
        assert_eq!(filtered.to_string(), "ks1.t1");

        let new_cluster = known.filter(&requested, false, true);
        assert_eq!(new_cluster.to_string(), "ks1.t1,system_schema.tables");

        let with_system = known.filter(&requested, true, false);
        assert_eq!(with_system.table_count(), 3);
    }

    #[test]
    fn test_filter_empty_request_selects_non_system() {
        let known = DatabaseEntities::from_tables(vec![
            KeyspaceTable::new("ks1", "t1"),
            KeyspaceTable::new("ks2", "t2"),
            KeyspaceTable::new("system", "local"),
        ]);
        let filtered = known.filter(&DatabaseEntities::empty(), false, false);
        assert_eq!(filtered.to_string(), "ks1.t1,ks2.t2");
    }

    #[test]
    fn test_filter_keyspace_request() {
        let known = DatabaseEntities::from_tables(vec![
            KeyspaceTable::new("ks1", "t1"),
            KeyspaceTable::new("ks1", "t2"),
            KeyspaceTable::new("ks2", "t3"),
        ]);
        let filtered = known.filter(&DatabaseEntities::from_keyspaces(["ks1"]), false, false);
        assert_eq!(filtered.to_string(), "ks1.t1,ks1.t2");
    }

    #[test]
    fn test_renames_allow_cross_keyspace() {
        let renames = RenamedEntities::parse("test2.test2=test.test").unwrap();
        renames.validate().unwrap();
        assert_eq!(
            renames.source_of(&KeyspaceTable::new("test", "test")),
            Some(&KeyspaceTable::new("test2", "test2"))
        );
    }

    #[test]
    fn test_renames_reject_chains_and_duplicates() {
        let chain = RenamedEntities::parse("ks.a=ks.b,ks.b=ks.c").unwrap();
        assert!(chain.validate().is_err());

        let same_target = RenamedEntities::parse("ks.a=ks.c,ks.b=ks.c").unwrap();
        assert!(same_target.validate().is_err());

        assert!(RenamedEntities::parse("ks.a=ks.b,ks.a=ks.c").is_err());
        assert!(RenamedEntities::parse("ks.a").is_err());
    }
}
