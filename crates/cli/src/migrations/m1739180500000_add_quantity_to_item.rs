use keel_migrate::prelude::*;

const SCRIPT: &str = include_str!("sql/1739180500000_add_quantity_to_item.sql");

/// Adds the `quantity` column to `item`; the script is portable across dialects
pub fn add_quantity_to_item() -> MigrateResult<SqlMigration> {
    SqlMigration::parse(1739180500000, "add_quantity_to_item", SCRIPT)
}
