//! Migration scaffolding: a fresh id and two template scripts

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{MigrationError, MigrationResult};
use crate::id::MigrationId;

const UP_TEMPLATE: &str = "-- Write your UP migration here\n";
const DOWN_TEMPLATE: &str = "-- Write your DOWN migration here\n";

/// Files written by [`create_migration`]
#[derive(Debug, Clone)]
pub struct ScaffoldedMigration {
    pub id: MigrationId,
    pub name: String,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
}

/// Validate a migration name and replace whitespace runs with `_`
pub fn normalize_name(name: &str) -> MigrationResult<String> {
    let invalid = |reason: &str| MigrationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if trimmed.contains(['/', '\\']) {
        return Err(invalid("name cannot contain path separators"));
    }

    Ok(trimmed.split_whitespace().collect::<Vec<_>>().join("_"))
}

/// Write `<id>_<name>.up.sql` and `<id>_<name>.down.sql` into `dir`
pub fn create_migration(dir: &Path, name: &str) -> MigrationResult<ScaffoldedMigration> {
    let name = normalize_name(name)?;
    fs::create_dir_all(dir)?;

    let id = MigrationId::generate();
    let up_path = dir.join(format!("{}_{}.up.sql", id, name));
    let down_path = dir.join(format!("{}_{}.down.sql", id, name));

    write_new(&up_path, UP_TEMPLATE)?;
    write_new(&down_path, DOWN_TEMPLATE)?;

    tracing::info!(
        migration = %format!("{}_{}", id, name),
        dir = %dir.display(),
        "created migration"
    );
    Ok(ScaffoldedMigration {
        id,
        name,
        up_path,
        down_path,
    })
}

fn write_new(path: &Path, contents: &str) -> MigrationResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => MigrationError::FileExists {
                path: path.to_path_buf(),
            },
            _ => MigrationError::Io(e),
        })?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}
