//! Migration Discovery - Finds paired migration scripts on disk
//!
//! A migration is two files sharing an id and a name:
//! `<id>_<name>.up.sql` and `<id>_<name>.down.sql`. Discovery only looks at
//! file names; script contents are read later, when a migration runs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::definitions::MigrationDirection;
use crate::error::{MigrationError, MigrationResult};

static MIGRATION_FILE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-HJKMNP-TV-Z]{26})_(.+)\.(up|down)\.sql$")
        .expect("migration file pattern is a valid regex")
});

/// A forward/reverse script pair found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationUnit {
    pub id: String,
    pub name: String,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
}

impl MigrationUnit {
    /// `<id>_<name>`, the label used in logs and error messages
    pub fn key(&self) -> String {
        format!("{}_{}", self.id, self.name)
    }

    /// Script to run for the given direction
    pub fn script_path(&self, direction: MigrationDirection) -> &Path {
        match direction {
            MigrationDirection::Up => &self.up_path,
            MigrationDirection::Down => &self.down_path,
        }
    }
}

#[derive(Default)]
struct PendingPair {
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

/// Split a file name into id, name and direction
pub fn parse_file_name(file_name: &str) -> Option<(String, String, MigrationDirection)> {
    let captures = MIGRATION_FILE_PATTERN.captures(file_name)?;
    let direction = match &captures[3] {
        "up" => MigrationDirection::Up,
        _ => MigrationDirection::Down,
    };
    Some((captures[1].to_string(), captures[2].to_string(), direction))
}

/// Scan `dir` and return its migrations sorted by id.
///
/// Fails without returning anything when any id/name pair lacks one of its
/// two scripts, or when one id is shared by two different names.
pub fn discover_migrations(dir: &Path) -> MigrationResult<Vec<MigrationUnit>> {
    let unreadable = |source| MigrationError::DirectoryUnreadable {
        path: dir.to_path_buf(),
        source,
    };

    let mut pairs: BTreeMap<(String, String), PendingPair> = BTreeMap::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        if entry.file_type().map_err(unreadable)?.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some((id, name, direction)) = parse_file_name(file_name) else {
            continue;
        };

        let path = dir.join(file_name);
        let pair = pairs.entry((id, name)).or_default();
        match direction {
            MigrationDirection::Up => pair.up = Some(path),
            MigrationDirection::Down => pair.down = Some(path),
        }
    }

    // BTreeMap iteration already yields ascending (id, name)
    let mut units: Vec<MigrationUnit> = Vec::with_capacity(pairs.len());
    for ((id, name), pair) in pairs {
        let (Some(up_path), Some(down_path)) = (pair.up, pair.down) else {
            return Err(MigrationError::IncompletePair {
                key: format!("{}_{}", id, name),
            });
        };

        if let Some(previous) = units.last() {
            if previous.id == id {
                return Err(MigrationError::DuplicateId {
                    first: previous.key(),
                    second: format!("{}_{}", id, name),
                    id,
                });
            }
        }

        units.push(MigrationUnit {
            id,
            name,
            up_path,
            down_path,
        });
    }

    tracing::debug!(dir = %dir.display(), count = units.len(), "discovered migrations");
    Ok(units)
}
