use keel_migrate::prelude::*;

/// Creates the `item` table
pub struct CreateItemTable;

#[async_trait]
impl Migration for CreateItemTable {
    fn id(&self) -> MigrationId {
        MigrationId::new(1739180400000)
    }

    fn name(&self) -> &str {
        "create_item_table"
    }

    async fn up(&self, tx: &mut dyn DatabaseTransaction) -> DatabaseResult<()> {
        let sql = match tx.dialect() {
            SqlDialect::PostgreSQL => {
                r#"CREATE TABLE "item" ("id" uuid NOT NULL DEFAULT gen_random_uuid(), "name" character varying(255) NOT NULL, "description" text, "isActive" boolean NOT NULL DEFAULT true, "created_at" TIMESTAMP NOT NULL DEFAULT now(), "updated_at" TIMESTAMP NOT NULL DEFAULT now(), CONSTRAINT "PK_item" PRIMARY KEY ("id"))"#
            }
            SqlDialect::SQLite => {
                r#"CREATE TABLE "item" ("id" TEXT NOT NULL, "name" VARCHAR(255) NOT NULL, "description" TEXT, "isActive" BOOLEAN NOT NULL DEFAULT 1, "created_at" TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, "updated_at" TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, CONSTRAINT "PK_item" PRIMARY KEY ("id"))"#
            }
        };
        tx.execute(sql, &[]).await?;
        Ok(())
    }

    fn is_reversible(&self) -> bool {
        true
    }

    async fn down(&self, tx: &mut dyn DatabaseTransaction) -> DatabaseResult<()> {
        tx.execute(r#"DROP TABLE "item""#, &[]).await?;
        Ok(())
    }
}
