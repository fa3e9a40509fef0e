// restoretool/src/restore/package.rs
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::errors::{RestoreError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCHEMA_FILE: &str = "schema.clean.sql";
pub const STORAGE_DIR: &str = "storage";

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub format: Option<String>,
    /// Written as a string or a number depending on the producer.
    #[serde(default)]
    pub version: Option<serde_json::Value>,
    #[serde(default)]
    pub tables: Vec<TableEntry>,
}

impl Manifest {
    pub fn is_ndjson(&self) -> bool {
        self.format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("ndjson"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    #[serde(alias = "dataFile")]
    pub data_file: String,
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub columns: u64,
}

/// Which database path a package takes.
#[derive(Debug, Clone, Copy)]
pub enum DatabaseSource<'a> {
    Ndjson(&'a Manifest),
    SqlDump(&'a Path),
    Absent,
}

/// A backup directory as found on disk.
#[derive(Debug, Clone)]
pub struct BackupPackage {
    pub root: PathBuf,
    pub manifest: Option<Manifest>,
    /// First `.sql` file in path order, outside `storage/`.
    pub sql_file: Option<PathBuf>,
    pub storage_dir: Option<PathBuf>,
}

impl BackupPackage {
    /// Validates and inspects a backup directory. The root must hold at least
    /// one of `manifest.json`, a `.sql` file or a `storage/` directory.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(RestoreError::Package(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest_present = manifest_path.is_file();
        let manifest = if manifest_present {
            match load_manifest(&manifest_path) {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    // Unreadable manifest: fall back to the legacy SQL path.
                    warn!(path = %manifest_path.display(), error = %e, "Ignoring unreadable manifest");
                    None
                }
            }
        } else {
            None
        };

        let storage = root.join(STORAGE_DIR);
        let storage_dir = storage.is_dir().then_some(storage);
        let sql_file = find_sql_files(root).into_iter().next();

        if !manifest_present && sql_file.is_none() && storage_dir.is_none() {
            return Err(RestoreError::Package(format!(
                "{} contains no {}, .sql file or {}/ directory",
                root.display(),
                MANIFEST_FILE,
                STORAGE_DIR
            )));
        }

        let package = BackupPackage {
            root: root.to_path_buf(),
            manifest,
            sql_file,
            storage_dir,
        };
        info!(
            root = %package.root.display(),
            ndjson = package.manifest.as_ref().is_some_and(Manifest::is_ndjson),
            sql_file = ?package.sql_file,
            storage = package.storage_dir.is_some(),
            "Opened backup package"
        );
        Ok(package)
    }

    pub fn database_source(&self) -> DatabaseSource<'_> {
        match (&self.manifest, &self.sql_file) {
            (Some(manifest), _) if manifest.is_ndjson() => DatabaseSource::Ndjson(manifest),
            (_, Some(sql)) => DatabaseSource::SqlDump(sql),
            _ => DatabaseSource::Absent,
        }
    }

    pub fn schema_script_path(&self) -> PathBuf {
        self.root.join(SCHEMA_FILE)
    }

    /// Resolves a table's data file, refusing paths that leave the package.
    pub fn table_data_path(&self, entry: &TableEntry) -> Result<PathBuf> {
        let relative = Path::new(&entry.data_file);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if entry.data_file.trim().is_empty() || escapes {
            return Err(RestoreError::Package(format!(
                "data file '{}' for table {} is outside the backup",
                entry.data_file, entry.name
            )));
        }
        Ok(self.root.join(relative))
    }
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// `.sql` files under `root`, sorted by path, skipping the storage snapshot.
fn find_sql_files(root: &Path) -> Vec<PathBuf> {
    let storage = root.join(STORAGE_DIR);
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.path() != storage)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        })
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}
