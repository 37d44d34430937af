//! Migrations shipped with the CLI

mod m1739180400000_create_item_table;
mod m1739180500000_add_quantity_to_item;

pub use m1739180400000_create_item_table::CreateItemTable;
pub use m1739180500000_add_quantity_to_item::add_quantity_to_item;

use keel_migrate::prelude::*;

/// Every built-in migration, validated
pub fn registry() -> MigrateResult<MigrationRegistry> {
    Ok(MigrationRegistry::builder()
        .add(CreateItemTable)
        .add(add_quantity_to_item()?)
        .build()?)
}
