use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use keel_migrate::{migration_file_name, migration_template, next_migration_id, sql};

/// Write a timestamp-named SQL migration template into `dir`
pub fn create(name: &str, dir: &Path) -> anyhow::Result<PathBuf> {
    if sql::normalize_name(name).is_empty() {
        bail!("Migration name '{}' has no usable characters", name);
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create migrations directory {}", dir.display()))?;

    let id = next_migration_id();
    let path = dir.join(migration_file_name(id, name));
    if path.exists() {
        bail!("Migration file {} already exists", path.display());
    }

    fs::write(&path, migration_template(id, name))
        .with_context(|| format!("Failed to write migration file {}", path.display()))?;

    println!("Created migration: {}", path.display());
    println!("Register it with SqlMigration::parse({}, \"{}\", include_str!(...))", id, sql::normalize_name(name));
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_migrate::SqlMigration;

    #[test]
    fn writes_parseable_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = create("Add Price To Item", dir.path()).unwrap();

        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.ends_with("_add_price_to_item.sql"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("-- Up"));
        assert!(content.contains("-- Down"));

        // The untouched template has an empty up section
        assert!(SqlMigration::parse(1, "add_price_to_item", &content).is_err());
    }

    #[test]
    fn rejects_unusable_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(create("!!!", dir.path()).is_err());
    }
}
