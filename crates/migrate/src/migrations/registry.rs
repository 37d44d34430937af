//! Migration Registry - the ordered, validated set of known migrations

use std::collections::BTreeMap;
use std::fmt;

use super::definitions::{Migration, MigrationId};
use crate::error::RegistryError;

/// Ordered collection of registered migrations.
///
/// Validation happens once at construction, so a registry that exists is
/// known to have unique, positive identifiers and non-empty names.
pub struct MigrationRegistry {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRegistry {
    /// Build a registry from migrations in any order
    pub fn new(migrations: Vec<Box<dyn Migration>>) -> Result<Self, RegistryError> {
        let mut seen: BTreeMap<MigrationId, String> = BTreeMap::new();

        for migration in &migrations {
            let id = migration.id();
            if id.value() <= 0 {
                return Err(RegistryError::InvalidId {
                    id: id.value(),
                    name: migration.name().to_string(),
                });
            }
            if migration.name().trim().is_empty() {
                return Err(RegistryError::EmptyName { id });
            }
            if let Some(first) = seen.get(&id) {
                return Err(RegistryError::DuplicateId {
                    id,
                    first: first.clone(),
                    second: migration.name().to_string(),
                });
            }
            seen.insert(id, migration.name().to_string());
        }

        let mut migrations = migrations;
        migrations.sort_by_key(|m| m.id());

        Ok(Self { migrations })
    }

    /// Start building a registry
    pub fn builder() -> MigrationRegistryBuilder {
        MigrationRegistryBuilder::default()
    }

    /// An empty registry
    pub fn empty() -> Self {
        Self {
            migrations: Vec::new(),
        }
    }

    /// All migrations in ascending identifier order
    pub fn list(&self) -> impl Iterator<Item = &dyn Migration> + '_ {
        self.migrations.iter().map(|m| m.as_ref())
    }

    /// All identifiers in ascending order
    pub fn ids(&self) -> Vec<MigrationId> {
        self.migrations.iter().map(|m| m.id()).collect()
    }

    /// Look up a migration by identifier
    pub fn get(&self, id: MigrationId) -> Option<&dyn Migration> {
        self.migrations
            .binary_search_by_key(&id, |m| m.id())
            .ok()
            .map(|index| self.migrations[index].as_ref())
    }

    pub fn contains(&self, id: MigrationId) -> bool {
        self.get(id).is_some()
    }

    /// Highest registered identifier
    pub fn latest(&self) -> Option<MigrationId> {
        self.migrations.last().map(|m| m.id())
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|m| (m.id(), m.name().to_string())))
            .finish()
    }
}

/// Builder collecting migrations before validation
#[derive(Default)]
pub struct MigrationRegistryBuilder {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRegistryBuilder {
    /// Register a migration
    pub fn add<M: Migration + 'static>(mut self, migration: M) -> Self {
        self.migrations.push(Box::new(migration));
        self
    }

    /// Register an already boxed migration
    pub fn add_boxed(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Validate and build the registry
    pub fn build(self) -> Result<MigrationRegistry, RegistryError> {
        MigrationRegistry::new(self.migrations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::definitions::SqlMigration;

    fn sql(id: i64, name: &str) -> SqlMigration {
        SqlMigration::new(id, name, "SELECT 1", None)
    }

    #[test]
    fn lists_in_identifier_order() {
        let registry = MigrationRegistry::builder()
            .add(sql(1100, "add_quantity"))
            .add(sql(1000, "create_item"))
            .add(sql(1050, "index_item"))
            .build()
            .unwrap();

        let names: Vec<&str> = registry.list().map(|m| m.name()).collect();
        assert_eq!(names, vec!["create_item", "index_item", "add_quantity"]);
        assert_eq!(registry.latest(), Some(MigrationId::new(1100)));
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get(MigrationId::new(1050)).map(|m| m.name()),
            Some("index_item")
        );
        assert!(!registry.contains(MigrationId::new(999)));
    }

    #[test]
    fn rejects_duplicate_identifiers() {
        let err = MigrationRegistry::builder()
            .add(sql(1000, "create_item"))
            .add(sql(1000, "create_other"))
            .build()
            .unwrap_err();

        match err {
            RegistryError::DuplicateId { id, first, second } => {
                assert_eq!(id, MigrationId::new(1000));
                assert_eq!(first, "create_item");
                assert_eq!(second, "create_other");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_identifiers_and_names() {
        assert!(matches!(
            MigrationRegistry::builder().add(sql(0, "zero")).build(),
            Err(RegistryError::InvalidId { id: 0, .. })
        ));
        assert!(matches!(
            MigrationRegistry::builder().add(sql(5, "  ")).build(),
            Err(RegistryError::EmptyName { .. })
        ));
    }

    #[test]
    fn empty_registry_is_valid() {
        let registry = MigrationRegistry::builder().build().unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.latest(), None);
        assert_eq!(registry.list().count(), 0);
    }
}
