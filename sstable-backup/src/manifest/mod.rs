//! Snapshot manifest: which files belong to a backup, with schema and tokens.
//!
//! Serialized as JSON under `manifests/<tag>-<schemaVersion>-<epochMillis>.json`.
//! Data object keys follow the on-disk layout, with the content hash embedded
//! in front of the SSTable component so a reused file name never aliases an
//! older object:
//!
//! ```text
//! data/<keyspace>/<table>-<tableId>/nb-1-big-<hash>-Data.db
//! data/<keyspace>/<table>-<tableId>/.<index>/nb-1-big-<hash>-Data.db   (secondary index)
//! data/<keyspace>/<table>-<tableId>/schema.cql
//! ```

pub mod builder;

use crate::entities::{DatabaseEntities, KeyspaceTable};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DATA_PREFIX: &str = "data";
pub const MANIFESTS_PREFIX: &str = "manifests";
pub const SCHEMA_FILE_NAME: &str = "schema.cql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManifestEntryType {
    File,
    ManifestFile,
    CqlSchema,
    CommitLog,
}

/// One file of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Path relative to the node prefix in remote storage.
    pub object_key: String,
    #[serde(rename = "type")]
    pub entry_type: ManifestEntryType,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Local counterpart, filled in by enrichment or at backup time.
    #[serde(skip)]
    pub local_file: Option<PathBuf>,
    #[serde(skip)]
    pub keyspace_table: Option<KeyspaceTable>,
}

impl ManifestEntry {
    pub fn new(object_key: impl Into<String>, entry_type: ManifestEntryType, size: u64) -> Self {
        Self {
            object_key: object_key.into(),
            entry_type,
            size,
            hash: None,
            local_file: None,
            keyspace_table: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn with_local_file(mut self, local_file: impl Into<PathBuf>) -> Self {
        self.local_file = Some(local_file.into());
        self
    }

    /// Local file path, an error when the entry was never localized.
    pub fn local_path(&self) -> Result<&Path> {
        self.local_file.as_deref().ok_or_else(|| {
            BackupError::Validation(format!(
                "manifest entry {} has no local file, manifest was not enriched",
                self.object_key
            ))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub entries: Vec<ManifestEntry>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_content: Option<String>,
}

impl Table {
    /// Directory name of this table, `<table>-<id>`.
    pub fn dir_name(&self, table: &str) -> String {
        format!("{}-{}", table, self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyspace {
    pub tables: BTreeMap<String, Table>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub keyspaces: BTreeMap<String, Keyspace>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub snapshot: Snapshot,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub schema_version: String,
    /// Where this manifest itself lives in storage.
    #[serde(skip)]
    pub manifest_entry: Option<ManifestEntry>,
    #[serde(skip)]
    enriched: bool,
}

/// Object key of a data file of a table, `relative` to the table directory.
pub fn data_object_key(keyspace: &str, table_dir: &str, relative: &str, hash: Option<&str>) -> String {
    let relative = match hash {
        Some(hash) => hashed_file_name(relative, hash),
        None => relative.to_string(),
    };
    format!("{}/{}/{}/{}", DATA_PREFIX, keyspace, table_dir, relative)
}

/// `nb-1-big-Data.db` becomes `nb-1-big-<hash>-Data.db`.
fn hashed_file_name(relative: &str, hash: &str) -> String {
    let (dir, name) = match relative.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, relative),
    };
    let hashed = match name.rsplit_once('-') {
        Some((stem, component)) => format!("{}-{}-{}", stem, hash, component),
        None => format!("{}-{}", hash, name),
    };
    match dir {
        Some(dir) => format!("{}/{}", dir, hashed),
        None => hashed,
    }
}

fn is_content_hash(part: &str) -> bool {
    part.len() == 64 && part.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Local file name of an object name, without its embedded content hash.
fn strip_content_hash(name: &str) -> String {
    name.split('-')
        .filter(|part| !is_content_hash(part))
        .collect::<Vec<_>>()
        .join("-")
}

/// Object key of a manifest, `manifests/<tag>-<schemaVersion>-<epochMillis>.json`.
pub fn manifest_object_key(snapshot_tag: &str, schema_version: &str, epoch_millis: i64) -> String {
    format!(
        "{}/{}-{}-{}.json",
        MANIFESTS_PREFIX, snapshot_tag, schema_version, epoch_millis
    )
}

/// Parsed manifest object name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestName {
    pub object_key: String,
    pub snapshot_tag: String,
    pub schema_version: Option<String>,
    pub epoch_millis: i64,
}

impl ManifestName {
    /// Parse `[manifests/]<tag>[-<schemaVersion>]-<epochMillis>.json`.
    pub fn parse(object_key: &str) -> Option<Self> {
        let file_name = object_key.rsplit('/').next()?;
        let stem = file_name.strip_suffix(".json")?;
        let (rest, millis) = stem.rsplit_once('-')?;
        let epoch_millis = millis.parse::<i64>().ok()?;

        // A schema version is a UUID, 36 characters, preceded by a dash.
        let (snapshot_tag, schema_version) = match rest.len().checked_sub(37) {
            Some(split)
                if rest.is_char_boundary(split)
                    && rest[split..].starts_with('-')
                    && uuid::Uuid::parse_str(&rest[split + 1..]).is_ok() =>
            {
                (rest[..split].to_string(), Some(rest[split + 1..].to_string()))
            }
            _ => (rest.to_string(), None),
        };
        if snapshot_tag.is_empty() {
            return None;
        }

        Some(Self {
            object_key: object_key.to_string(),
            snapshot_tag,
            schema_version,
            epoch_millis,
        })
    }
}

/// Pick the newest manifest of `snapshot_tag` among `object_keys`.
///
/// Candidates with a malformed timestamp are skipped with a warning. When
/// `schema_version` is given only manifests taken with that schema qualify.
pub fn parse_latest_manifest(
    object_keys: &[String],
    snapshot_tag: &str,
    schema_version: Option<&str>,
) -> Result<String> {
    let mut latest: Option<ManifestName> = None;

    for key in object_keys {
        let Some(name) = ManifestName::parse(key) else {
            let prefix = format!("{}-", snapshot_tag);
            if key.rsplit('/').next().is_some_and(|f| f.starts_with(&prefix)) {
                warn!(object_key = %key, "Skipping manifest with malformed timestamp");
            }
            continue;
        };
        if name.snapshot_tag != snapshot_tag {
            continue;
        }
        if let Some(wanted) = schema_version {
            if name.schema_version.as_deref() != Some(wanted) {
                continue;
            }
        }
        if latest.as_ref().map_or(true, |l| name.epoch_millis >= l.epoch_millis) {
            latest = Some(name);
        }
    }

    latest.map(|l| l.object_key).ok_or_else(|| {
        BackupError::ManifestNotFound(match schema_version {
            Some(schema) => format!(
                "no manifest for snapshot {} with schema version {}",
                snapshot_tag, schema
            ),
            None => format!("no manifest for snapshot {}", snapshot_tag),
        })
    })
}

impl Manifest {
    pub fn new(snapshot: Snapshot, tokens: Vec<String>, schema_version: impl Into<String>) -> Self {
        Self {
            snapshot,
            tokens,
            schema_version: schema_version.into(),
            manifest_entry: None,
            enriched: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_enriched(&self) -> bool {
        self.enriched
    }

    pub fn table(&self, kt: &KeyspaceTable) -> Option<&Table> {
        self.snapshot.keyspaces.get(&kt.keyspace)?.tables.get(&kt.table)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.snapshot
            .keyspaces
            .values()
            .flat_map(|ks| ks.tables.values())
            .flat_map(|t| t.entries.iter())
    }

    pub fn total_size(&self) -> u64 {
        self.entries().map(|e| e.size).sum()
    }

    /// Every table recorded in the manifest.
    pub fn get_database_entities(&self) -> DatabaseEntities {
        DatabaseEntities::from_tables(
            self.snapshot
                .keyspaces
                .iter()
                .flat_map(|(ks, keyspace)| {
                    keyspace
                        .tables
                        .keys()
                        .map(move |t| KeyspaceTable::new(ks.clone(), t.clone()))
                })
                .collect::<Vec<_>>(),
        )
    }

    /// Fill in `local_file` and `keyspace_table` of every entry, relative to `local_root`.
    ///
    /// Runs once; later calls are ignored.
    pub fn enrich_manifest_entries(&mut self, local_root: &Path) {
        if self.enriched {
            debug!(root = %local_root.display(), "Manifest already enriched");
            return;
        }
        for (ks, keyspace) in self.snapshot.keyspaces.iter_mut() {
            for (table, t) in keyspace.tables.iter_mut() {
                for entry in t.entries.iter_mut() {
                    let (local_file, kt) = localize(&entry.object_key, local_root);
                    entry.local_file = Some(local_file);
                    entry.keyspace_table =
                        Some(kt.unwrap_or_else(|| KeyspaceTable::new(ks.clone(), table.clone())));
                }
            }
        }
        self.enriched = true;
    }

    /// Entries of the requested entities, in manifest order.
    ///
    /// Requested tables or keyspaces absent from the manifest fail with
    /// [`BackupError::NotInManifest`]. Schema files are only returned with
    /// `include_schemas`.
    pub fn get_manifest_files(
        &self,
        entities: &DatabaseEntities,
        include_system: bool,
        new_cluster: bool,
        include_schemas: bool,
    ) -> Result<Vec<ManifestEntry>> {
        entities.validate()?;

        if entities.table_subset_only() {
            for kt in entities.tables() {
                if self.table(&kt).is_none() {
                    return Err(BackupError::NotInManifest(format!(
                        "table {} is not in the manifest",
                        kt
                    )));
                }
            }
        } else if entities.keyspaces_only() {
            for ks in entities.keyspaces() {
                if !self.snapshot.keyspaces.contains_key(ks) {
                    return Err(BackupError::NotInManifest(format!(
                        "keyspace {} is not in the manifest",
                        ks
                    )));
                }
            }
        }

        let selected = self
            .get_database_entities()
            .filter(entities, include_system, new_cluster);

        let mut files = Vec::new();
        for (ks, keyspace) in &self.snapshot.keyspaces {
            for (table, t) in &keyspace.tables {
                if !selected.contains_table(&KeyspaceTable::new(ks.clone(), table.clone())) {
                    continue;
                }
                files.extend(
                    t.entries
                        .iter()
                        .filter(|e| include_schemas || e.entry_type != ManifestEntryType::CqlSchema)
                        .cloned(),
                );
            }
        }
        Ok(files)
    }
}

/// Local path and table of an object key under `local_root`.
fn localize(object_key: &str, local_root: &Path) -> (PathBuf, Option<KeyspaceTable>) {
    let segments: Vec<&str> = object_key.split('/').collect();
    if let [DATA_PREFIX, keyspace, table_dir, .., name] = segments.as_slice() {
        let table = crate::entities::cassandra_data::split_table_dir_name(table_dir)
            .map(|(table, _)| table)
            .unwrap_or(*table_dir);
        let kt = KeyspaceTable::new(*keyspace, table);
        let local = segments[1..segments.len() - 1]
            .iter()
            .fold(local_root.to_path_buf(), |path, segment| path.join(segment))
            .join(strip_content_hash(name));
        return (local, Some(kt));
    }
    (local_root.join(object_key), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0123456789abcdef0123456789abcdef";
    const SCHEMA: &str = "e84b6a60-24cf-30ca-9b58-452d92911703";
    const HASH: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn table(ks: &str, name: &str, files: &[&str]) -> Table {
        let dir = format!("{}-{}", name, ID);
        let mut entries: Vec<ManifestEntry> = files
            .iter()
            .map(|f| {
                ManifestEntry::new(data_object_key(ks, &dir, f, Some(HASH)), ManifestEntryType::File, 10)
                    .with_hash(HASH)
            })
            .collect();
        entries.push(ManifestEntry::new(
            data_object_key(ks, &dir, SCHEMA_FILE_NAME, None),
            ManifestEntryType::CqlSchema,
            5,
        ));
        Table {
            entries,
            id: ID.to_string(),
            schema_content: Some(format!("CREATE TABLE {}.{} (id int PRIMARY KEY);", ks, name)),
        }
    }

    fn manifest() -> Manifest {
        let mut snapshot = Snapshot::default();
        for (ks, name) in [("ks1", "t1"), ("ks1", "t2"), ("ks2", "t3"), ("system_schema", "tables"), ("system", "local")] {
            snapshot
                .keyspaces
                .entry(ks.to_string())
                .or_default()
                .tables
                .insert(name.to_string(), table(ks, name, &["nb-1-big-Data.db", ".idx/nb-1-big-Data.db"]));
        }
        Manifest::new(snapshot, vec!["-100".into(), "200".into()], SCHEMA)
    }

    #[test]
    fn test_json_shape() {
        let json = manifest().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["snapshot"]["keyspaces"]["ks1"]["tables"]["t1"]["entries"].is_array());
        assert_eq!(value["schemaVersion"], SCHEMA);
        assert_eq!(value["tokens"][1], "200");
        assert_eq!(
            value["snapshot"]["keyspaces"]["ks1"]["tables"]["t1"]["entries"][0]["type"],
            "FILE"
        );
        assert!(value["snapshot"]["keyspaces"]["ks1"]["tables"]["t1"]["schemaContent"].is_string());

        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(back.snapshot, manifest().snapshot);
    }

    #[test]
    fn test_data_object_keys_carry_content_hash() {
        let dir = format!("t1-{}", ID);
        assert_eq!(
            data_object_key("ks1", &dir, "nb-1-big-Data.db", Some(HASH)),
            format!("data/ks1/{}/nb-1-big-{}-Data.db", dir, HASH)
        );
        assert_eq!(
            data_object_key("ks1", &dir, ".idx/nb-1-big-Data.db", Some(HASH)),
            format!("data/ks1/{}/.idx/nb-1-big-{}-Data.db", dir, HASH)
        );
        assert_eq!(
            data_object_key("ks1", &dir, "md5sum", Some(HASH)),
            format!("data/ks1/{}/{}-md5sum", dir, HASH)
        );
        assert_ne!(
            data_object_key("ks1", &dir, "nb-1-big-Data.db", Some(HASH)),
            data_object_key("ks1", &dir, "nb-1-big-Data.db", Some(&HASH.replace('b', "c")))
        );

        let (local, _) = localize(&format!("data/ks1/{}/{}-md5sum", dir, HASH), Path::new("/stage"));
        assert_eq!(local, Path::new("/stage/ks1").join(&dir).join("md5sum"));
    }

    #[test]
    fn test_enrich_sets_local_files() {
        let mut m = manifest();
        m.enrich_manifest_entries(Path::new("/stage"));
        assert!(m.is_enriched());

        let t1 = m.table(&KeyspaceTable::new("ks1", "t1")).unwrap();
        let dir = format!("t1-{}", ID);
        assert_eq!(
            t1.entries[0].local_file.as_deref(),
            Some(Path::new("/stage/ks1").join(&dir).join("nb-1-big-Data.db").as_path())
        );
        assert_eq!(
            t1.entries[1].local_file.as_deref(),
            Some(Path::new("/stage/ks1").join(&dir).join(".idx/nb-1-big-Data.db").as_path())
        );
        assert_eq!(t1.entries[1].keyspace_table, Some(KeyspaceTable::new("ks1", "t1")));

        // second enrichment is ignored
        m.enrich_manifest_entries(Path::new("/other"));
        let t1 = m.table(&KeyspaceTable::new("ks1", "t1")).unwrap();
        assert!(t1.entries[0].local_file.as_ref().unwrap().starts_with("/stage"));
    }

    #[test]
    fn test_manifest_files_for_empty_entities() {
        let m = manifest();
        let files = m
            .get_manifest_files(&DatabaseEntities::empty(), false, false, false)
            .unwrap();
        // ks1.t1, ks1.t2, ks2.t3 with two data files each
        assert_eq!(files.len(), 6);
        assert!(files.iter().all(|f| f.entry_type == ManifestEntryType::File));

        let with_schemas = m
            .get_manifest_files(&DatabaseEntities::empty(), false, false, true)
            .unwrap();
        assert_eq!(with_schemas.len(), 9);

        let with_system = m
            .get_manifest_files(&DatabaseEntities::empty(), true, false, false)
            .unwrap();
        assert_eq!(with_system.len(), 10);
    }

    #[test]
    fn test_manifest_files_for_tables() {
        let m = manifest();
        let entities = DatabaseEntities::parse("ks1.t2,system_schema.tables").unwrap();

        let files = m.get_manifest_files(&entities, false, false, false).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.object_key.starts_with("data/ks1/t2-")));

        let new_cluster = m.get_manifest_files(&entities, false, true, false).unwrap();
        assert_eq!(new_cluster.len(), 4);
    }

    #[test]
    fn test_manifest_files_missing_entities() {
        let m = manifest();
        let err = m
            .get_manifest_files(&DatabaseEntities::parse("ks1.nope").unwrap(), false, false, false)
            .unwrap_err();
        assert!(matches!(err, BackupError::NotInManifest(_)));

        let err = m
            .get_manifest_files(&DatabaseEntities::parse("ks9").unwrap(), false, false, false)
            .unwrap_err();
        assert!(matches!(err, BackupError::NotInManifest(_)));
    }

    #[test]
    fn test_manifest_files_for_keyspaces() {
        let m = manifest();
        let files = m
            .get_manifest_files(&DatabaseEntities::parse("ks1").unwrap(), false, false, false)
            .unwrap();
        assert_eq!(files.len(), 4);
    }

    #[test]
    fn test_latest_manifest_wins() {
        let keys = vec![
            "manifests/tag-1000.json".to_string(),
            "manifests/tag-2000.json".to_string(),
        ];
        assert_eq!(
            parse_latest_manifest(&keys, "tag", None).unwrap(),
            "manifests/tag-2000.json"
        );
    }

    #[test]
    fn test_latest_manifest_with_schema_versions() {
        let other = "11111111-2222-3333-4444-555555555555";
        let keys = vec![
            manifest_object_key("snap", SCHEMA, 1000),
            manifest_object_key("snap", other, 3000),
            manifest_object_key("snap-2", SCHEMA, 9000),
            "manifests/snap-notanumber.json".to_string(),
        ];
        assert_eq!(
            parse_latest_manifest(&keys, "snap", None).unwrap(),
            manifest_object_key("snap", other, 3000)
        );
        assert_eq!(
            parse_latest_manifest(&keys, "snap", Some(SCHEMA)).unwrap(),
            manifest_object_key("snap", SCHEMA, 1000)
        );
    }

    #[test]
    fn test_latest_manifest_not_found() {
        let keys = vec!["manifests/other-1000.json".to_string(), "manifests/tag-x.json".to_string()];
        let err = parse_latest_manifest(&keys, "tag", None).unwrap_err();
        assert!(matches!(err, BackupError::ManifestNotFound(_)));
    }

    #[test]
    fn test_manifest_name_parse() {
        let name = ManifestName::parse(&manifest_object_key("my-snap", SCHEMA, 42)).unwrap();
        assert_eq!(name.snapshot_tag, "my-snap");
        assert_eq!(name.schema_version.as_deref(), Some(SCHEMA));
        assert_eq!(name.epoch_millis, 42);

        let plain = ManifestName::parse("tag-1000.json").unwrap();
        assert_eq!(plain.snapshot_tag, "tag");
        assert!(plain.schema_version.is_none());

        assert!(ManifestName::parse("manifests/tag.json").is_none());
    }
}
