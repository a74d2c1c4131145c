//! [`CassandraInteraction`] backed by the `nodetool` and `cqlsh` command line tools.

use super::{CassandraInteraction, CassandraVersion, TopologyChanges};
use crate::config::CassandraConfig;
use crate::entities::DatabaseEntities;
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct NodetoolInteraction {
    config: CassandraConfig,
}

impl NodetoolInteraction {
    pub fn new(config: CassandraConfig) -> Self {
        Self { config }
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<String> {
        debug!(program, args = ?args, "Running");
        let output = Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Cassandra(format!("unable to run {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(BackupError::Cassandra(format!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn nodetool(&self, args: &[&str]) -> Result<String> {
        let mut full = vec![
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.jmx_port.to_string(),
        ];
        full.extend(args.iter().map(|a| a.to_string()));
        self.run(&self.config.nodetool, full).await
    }

    async fn cql(&self, statement: &str) -> Result<String> {
        let args = vec![
            self.config.host.clone(),
            self.config.cql_port.to_string(),
            "--no-color".to_string(),
            "-e".to_string(),
            statement.to_string(),
        ];
        self.run(&self.config.cqlsh, args).await
    }
}

/// Values of a single column query as printed by cqlsh.
pub(crate) fn parse_cqlsh_column(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .map(str::trim)
        .take_while(|line| !line.is_empty() && !line.starts_with('('))
        .map(str::to_string)
        .collect()
}

/// Value of the first `key : value` line with the given key.
pub(crate) fn parse_key_value<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Tokens listed by `nodetool info -T`.
pub(crate) fn parse_info_tokens(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == "Token").then(|| v.trim().to_string())
        })
        .collect()
}

/// Down count and ring changes from `nodetool status`.
pub(crate) fn parse_status(output: &str) -> (usize, TopologyChanges) {
    let mut down = 0;
    let mut changes = TopologyChanges::default();

    for line in output.lines() {
        let mut columns = line.split_whitespace();
        let (Some(state), Some(address)) = (columns.next(), columns.next()) else {
            continue;
        };
        let mut chars = state.chars();
        let (Some(status), Some(mode), None) = (chars.next(), chars.next(), chars.next()) else {
            continue;
        };
        if !matches!(status, 'U' | 'D') || !matches!(mode, 'N' | 'L' | 'J' | 'M') {
            continue;
        }
        if status == 'D' {
            down += 1;
        }
        match mode {
            'J' => changes.joining.push(address.to_string()),
            'L' => changes.leaving.push(address.to_string()),
            'M' => changes.moving.push(address.to_string()),
            _ => {}
        }
    }
    (down, changes)
}

/// `Schema versions:` section of `nodetool describecluster`.
pub(crate) fn parse_schema_versions(output: &str) -> BTreeMap<String, Vec<String>> {
    output
        .lines()
        .skip_while(|line| line.trim() != "Schema versions:")
        .skip(1)
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (version, endpoints) = line.trim().split_once(':')?;
            let endpoints = endpoints
                .trim()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            Some((version.trim().to_string(), endpoints))
        })
        .collect()
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[async_trait]
impl CassandraInteraction for NodetoolInteraction {
    async fn get_schema_version(&self) -> Result<String> {
        let output = self.cql("SELECT schema_version FROM system.local").await?;
        parse_cqlsh_column(&output)
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::Cassandra("no schema version in system.local".into()))
    }

    async fn get_release_version(&self) -> Result<CassandraVersion> {
        let output = self.nodetool(&["version"]).await?;
        let version = parse_key_value(&output, "ReleaseVersion")
            .ok_or_else(|| BackupError::Cassandra("no ReleaseVersion in nodetool version".into()))?;
        CassandraVersion::parse(version)
    }

    async fn get_local_tokens(&self) -> Result<Vec<String>> {
        let tokens = parse_info_tokens(&self.nodetool(&["info", "-T"]).await?);
        if tokens.is_empty() {
            return Err(BackupError::Cassandra("node reports no tokens".into()));
        }
        Ok(tokens)
    }

    async fn get_operation_mode(&self) -> Result<String> {
        let output = self.nodetool(&["netstats"]).await?;
        parse_key_value(&output, "Mode")
            .map(str::to_string)
            .ok_or_else(|| BackupError::Cassandra("no Mode in nodetool netstats".into()))
    }

    async fn get_failure_detector_down_count(&self) -> Result<usize> {
        Ok(parse_status(&self.nodetool(&["status"]).await?).0)
    }

    async fn get_topology_changes(&self) -> Result<TopologyChanges> {
        Ok(parse_status(&self.nodetool(&["status"]).await?).1)
    }

    async fn get_cluster_schema_versions(&self) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(parse_schema_versions(&self.nodetool(&["describecluster"]).await?))
    }

    async fn truncate_table(&self, keyspace: &str, table: &str) -> Result<()> {
        self.cql(&format!("TRUNCATE {}.{}", quote(keyspace), quote(table)))
            .await
            .map(|_| ())
    }

    async fn import_sstables(&self, keyspace: &str, table: &str, directory: &Path) -> Result<()> {
        let directory = directory.to_string_lossy();
        self.nodetool(&["import", keyspace, table, directory.as_ref()])
            .await
            .map(|_| ())
    }

    async fn refresh_table(&self, keyspace: &str, table: &str) -> Result<()> {
        self.nodetool(&["refresh", keyspace, table]).await.map(|_| ())
    }

    async fn take_snapshot(&self, entities: &DatabaseEntities, tag: &str) -> Result<()> {
        let tables: Vec<String> = entities.tables().map(|kt| kt.to_string()).collect();
        let table_list = tables.join(",");
        let mut args = vec!["snapshot", "-t", tag];
        if !tables.is_empty() {
            args.push("-kt");
            args.push(&table_list);
        } else {
            args.extend(entities.keyspaces());
        }
        self.nodetool(&args).await.map(|_| ())
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<()> {
        self.nodetool(&["clearsnapshot", "-t", tag]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cqlsh_column() {
        let output = "\n schema_version\n--------------------------------------\n e84b6a60-24cf-30ca-9b58-452d92911703\n\n(1 rows)\n";
        assert_eq!(
            parse_cqlsh_column(output),
            vec!["e84b6a60-24cf-30ca-9b58-452d92911703".to_string()]
        );
        assert!(parse_cqlsh_column("nothing here").is_empty());
    }

    #[test]
    fn test_parse_info() {
        let output = "ID                     : 6f0d\nGossip active          : true\nToken                  : -9223372036854775808\nToken                  : 3074457345618258602\n";
        assert_eq!(
            parse_info_tokens(output),
            vec!["-9223372036854775808".to_string(), "3074457345618258602".to_string()]
        );
        assert_eq!(parse_key_value("ReleaseVersion: 4.0.11\n", "ReleaseVersion"), Some("4.0.11"));
        assert_eq!(parse_key_value("Mode: NORMAL\nNot sending any streams.\n", "Mode"), Some("NORMAL"));
    }

    #[test]
    fn test_parse_status() {
        let output = "\
Datacenter: dc1
===============
Status=Up/Down
|/ State=Normal/Leaving/Joining/Moving
--  Address    Load       Tokens  Owns (effective)  Host ID                               Rack
UN  10.0.0.1   1.2 MiB    16      66.7%             6f0d2a3e-0000-0000-0000-000000000001  rack1
DN  10.0.0.2   1.1 MiB    16      66.7%             6f0d2a3e-0000-0000-0000-000000000002  rack1
UJ  10.0.0.3   0 bytes    16      ?                 6f0d2a3e-0000-0000-0000-000000000003  rack1
UL  10.0.0.4   1.0 MiB    16      66.7%             6f0d2a3e-0000-0000-0000-000000000004  rack1
";
        let (down, changes) = parse_status(output);
        assert_eq!(down, 1);
        assert_eq!(changes.joining, vec!["10.0.0.3".to_string()]);
        assert_eq!(changes.leaving, vec!["10.0.0.4".to_string()]);
        assert!(changes.moving.is_empty());
    }

    #[test]
    fn test_parse_schema_versions() {
        let output = "\
Cluster Information:
\tName: Test Cluster
\tSnitch: org.apache.cassandra.locator.SimpleSnitch
\tSchema versions:
\t\te84b6a60-24cf-30ca-9b58-452d92911703: [10.0.0.1, 10.0.0.2]

\t\t11111111-2222-3333-4444-555555555555: [10.0.0.3]
";
        let versions = parse_schema_versions(output);
        assert_eq!(versions.len(), 1);
        assert_eq!(
            versions["e84b6a60-24cf-30ca-9b58-452d92911703"],
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
    }

    #[test]
    fn test_quote_identifiers() {
        assert_eq!(quote("ks"), "\"ks\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }
}
