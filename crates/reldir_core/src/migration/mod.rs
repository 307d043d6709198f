//! Schema migrations.
//!
//! The database carries a semver stamp in `_system/version`; a database
//! without one is at `0.0.0`. On open, every registered migration newer
//! than the stamp and not newer than [`REQUIRED_VERSION`] runs in
//! ascending order.
//!
//! Each step:
//!
//! 1. writes a backup image of the database beside it as
//!    `{stem}-{current version}{ext}` (in memory for in-memory databases),
//! 2. opens the backup read-only,
//! 3. runs the step reading from the backup and writing the live database,
//!    and stamps the new version, all in one write transaction.
//!
//! A failing or interrupted step leaves the live database as it was, so
//! running the migrations again retries the step from scratch and simply
//! overwrites its backup.
//!
//! ## Usage
//!
//! ```rust
//! use reldir_core::migration::{read_version, MigrationManager, REQUIRED_VERSION};
//! use reldir_storage::Db;
//!
//! let db = Db::open_in_memory().unwrap();
//! let result = MigrationManager::builtin().run(&db).unwrap();
//! assert_eq!(result.final_version, REQUIRED_VERSION);
//! assert_eq!(read_version(&db.begin_read()).unwrap(), REQUIRED_VERSION);
//! ```

pub mod legacy;
mod steps;

use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{SYSTEM, VERSION_KEY};
use reldir_storage::{Db, InMemoryBackend, Options, ReadTx, Tx, WriteTx};
use semver::Version;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

/// Schema version this build reads and writes.
pub const REQUIRED_VERSION: Version = Version::new(0, 0, 8);

/// A versioned schema transform.
pub trait Migration: Send + Sync {
    /// Version the database has after this migration.
    fn version(&self) -> Version;

    /// Short name for logs.
    fn name(&self) -> &str;

    /// Transforms the database. `ro` is a read-only copy taken before the
    /// step started; all writes go to `rw`.
    ///
    /// # Errors
    ///
    /// Any error aborts the step and leaves `rw` unchanged.
    fn run(&self, ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()>;
}

/// Information about a registered migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Target version.
    pub version: Version,
    /// Name.
    pub name: String,
}

/// An applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    /// Target version.
    pub version: Version,
    /// Name.
    pub name: String,
    /// Backup file written before the step; `None` in memory.
    pub backup: Option<PathBuf>,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRunResult {
    /// Version before the run.
    pub from: Version,
    /// Version after the run.
    pub final_version: Version,
    /// Applied steps in order.
    pub migrations: Vec<MigrationResult>,
}

impl MigrationRunResult {
    /// Number of steps applied.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.migrations.len()
    }
}

/// Registered migrations, keyed by version.
pub struct MigrationManager {
    migrations: BTreeMap<Version, Box<dyn Migration>>,
    required: Version,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new(REQUIRED_VERSION)
    }
}

impl MigrationManager {
    /// Creates a manager without migrations that brings databases up to
    /// `required`.
    #[must_use]
    pub fn new(required: Version) -> Self {
        Self {
            migrations: BTreeMap::new(),
            required,
        }
    }

    /// Creates a manager with every built-in step.
    #[must_use]
    pub fn builtin() -> Self {
        let mut manager = Self::default();
        for migration in steps::builtin() {
            manager.migrations.insert(migration.version(), migration);
        }
        manager
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// `MigrationFailed` if the version is already taken.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> DirectoryResult<()> {
        let version = migration.version();
        if self.migrations.contains_key(&version) {
            return Err(DirectoryError::migration_failed(
                &version,
                "a migration with this version is already registered",
            ));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Version databases are brought up to.
    #[must_use]
    pub fn required(&self) -> &Version {
        &self.required
    }

    /// All registered migrations in order.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| info_of(m.as_ref())).collect()
    }

    /// Migrations a database at `current` still needs.
    #[must_use]
    pub fn pending(&self, current: &Version) -> Vec<MigrationInfo> {
        self.migrations
            .values()
            .filter(|m| m.version() > *current && m.version() <= self.required)
            .map(|m| info_of(m.as_ref()))
            .collect()
    }

    /// Brings `db` up to the required version.
    ///
    /// # Errors
    ///
    /// `IncompatibleVersion` if the database is newer than the required
    /// version, `MigrationFailed` naming the step that failed.
    pub fn run(&self, db: &Db) -> DirectoryResult<MigrationRunResult> {
        self.run_to(db, &self.required)
    }

    /// Brings `db` up to `target`, which must not exceed the required
    /// version.
    ///
    /// # Errors
    ///
    /// See [`MigrationManager::run`].
    pub fn run_to(&self, db: &Db, target: &Version) -> DirectoryResult<MigrationRunResult> {
        let from = read_version(&db.begin_read())?;
        check_supported(&from, &self.required)?;

        let mut current = from.clone();
        let mut applied = Vec::new();
        for (version, migration) in &self.migrations {
            if *version <= from || version > target || *version > self.required {
                continue;
            }
            let backup = Backup::take(db, &current)
                .map_err(|err| DirectoryError::migration_failed(version, err.to_string()))?;
            info!(
                from = %current,
                to = %version,
                name = migration.name(),
                backup = ?backup.path(),
                "running migration"
            );
            let snapshot = backup
                .open()
                .map_err(|err| DirectoryError::migration_failed(version, err.to_string()))?;
            let ro = snapshot.begin_read();
            db.update(|rw| {
                migration.run(&ro, rw)?;
                write_version(rw, version)
            })
            .map_err(|err| DirectoryError::migration_failed(version, err.to_string()))?;

            applied.push(MigrationResult {
                version: version.clone(),
                name: migration.name().to_string(),
                backup: backup.path().map(Path::to_path_buf),
            });
            current = version.clone();
        }

        if !applied.is_empty() {
            info!(from = %from, to = %current, steps = applied.len(), "migrations complete");
        }
        Ok(MigrationRunResult {
            from,
            final_version: current,
            migrations: applied,
        })
    }
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("versions", &self.migrations.keys().collect::<Vec<_>>())
            .field("required", &self.required)
            .finish()
    }
}

fn info_of(migration: &dyn Migration) -> MigrationInfo {
    MigrationInfo {
        version: migration.version(),
        name: migration.name().to_string(),
    }
}

/// Reads the version stamp; `0.0.0` when there is none.
///
/// # Errors
///
/// `Validation` for a stamp that is not a semver version.
pub fn read_version(tx: &impl Tx) -> DirectoryResult<Version> {
    match tx.get(SYSTEM, VERSION_KEY) {
        Ok(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|text| Version::parse(text).ok())
            .ok_or_else(|| {
                DirectoryError::Validation(format!(
                    "version stamp {:?} is not a semver version",
                    String::from_utf8_lossy(&bytes)
                ))
            }),
        Err(err) if err.is_not_found() => Ok(Version::new(0, 0, 0)),
        Err(err) => Err(err.into()),
    }
}

/// Writes the version stamp.
///
/// # Errors
///
/// Storage errors.
pub fn write_version(tx: &mut WriteTx<'_>, version: &Version) -> DirectoryResult<()> {
    tx.create_bucket_if_not_exists(SYSTEM)?;
    tx.put(SYSTEM, VERSION_KEY, version.to_string().as_bytes())?;
    Ok(())
}

/// Fails for a database written by a newer build.
///
/// # Errors
///
/// `IncompatibleVersion`.
pub fn check_supported(found: &Version, supported: &Version) -> DirectoryResult<()> {
    if found > supported {
        return Err(DirectoryError::IncompatibleVersion {
            found: found.to_string(),
            supported: supported.to_string(),
        });
    }
    Ok(())
}

/// Where the backup of `db_path` at `version` is written.
#[must_use]
pub fn backup_path(db_path: &Path, version: &Version) -> PathBuf {
    let stem = db_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}-{version}");
    if let Some(ext) = db_path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    db_path.with_file_name(name)
}

enum Backup {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl Backup {
    fn take(db: &Db, version: &Version) -> DirectoryResult<Self> {
        let tx = db.begin_read();
        match db.path() {
            Some(path) => {
                let target = backup_path(path, version);
                let mut file = File::create(&target)?;
                tx.write_to(&mut file)?;
                file.sync_all()?;
                Ok(Self::File(target))
            }
            None => {
                let mut image = Vec::new();
                tx.write_to(&mut image)?;
                Ok(Self::Memory(image))
            }
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory(_) => None,
        }
    }

    fn open(&self) -> DirectoryResult<Db> {
        let options = Options::default().read_only(true);
        let db = match self {
            Self::File(path) => Db::open(path, options)?,
            Self::Memory(image) => {
                Db::open_with_backend(Box::new(InMemoryBackend::with_data(image.clone())), options)?
            }
        };
        Ok(db)
    }
}
