//! Directory traversal for snapshot, table and commit log directories.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Directory names that are not descended into
    pub skip_dirs: Vec<String>,
}

impl WalkOptions {
    /// Live table directory: skips the `snapshots` and `backups` subdirectories.
    pub fn table_directory() -> Self {
        Self {
            skip_dirs: vec!["snapshots".to_string(), "backups".to_string()],
            ..Self::default()
        }
    }

    /// Files directly inside the root only.
    pub fn flat() -> Self {
        Self {
            max_depth: Some(1),
            ..Self::default()
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root, always `/` separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let path = entry.path().to_path_buf();
        let relative_path = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self {
            size: entry.metadata()?.len(),
            path,
            relative_path,
        })
    }
}

/// Walk a directory tree and collect every regular file, sorted by relative path.
///
/// A missing root yields no files.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut files = Vec::new();
    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e, &options.skip_dirs));

    for entry in entries {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

fn is_skipped_dir(entry: &DirEntry, skip_dirs: &[String]) -> bool {
    entry.file_type().is_dir()
        && skip_dirs
            .iter()
            .any(|name| entry.file_name().to_string_lossy() == name.as_str())
}
