/// Segment directory access on the coordinator
///
/// The catalog is the source of truth for cluster topology. Workflows
/// register segments through it and read the topology back as a `GpArray`
/// after every change.
pub mod postgres;

use crate::core::{GpArray, Segment};
use crate::error::HubResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Database used for catalog access unless a statement names another
pub const DEFAULT_DATABASE: &str = "template1";

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Every registered segment ordered by content, primaries first
    async fn read_segments(&self) -> HubResult<Vec<Segment>>;

    /// Register the coordinator as dbid 1, content -1
    async fn register_coordinator(&self, coordinator: &Segment) -> HubResult<()>;

    /// Register primaries in order; content ids are assigned from 0
    async fn register_primaries(&self, primaries: &[Segment]) -> HubResult<()>;

    /// Register mirrors for the content ids they carry
    async fn register_mirrors(&self, mirrors: &[Segment]) -> HubResult<()>;

    /// Run one statement on the named database
    async fn exec_on_database(&self, dbname: &str, statement: &str) -> HubResult<()>;

    async fn trigger_fts_probe(&self) -> HubResult<()>;
}

/// Opens catalog sessions against the coordinator owning a data directory
#[async_trait]
pub trait CatalogConnector: Send + Sync {
    /// `utility` selects a coordinator-only session, required before the
    /// cluster runs in production mode.
    async fn connect(&self, coordinator_data_dir: &str, utility: bool) -> HubResult<Arc<dyn Catalog>>;
}

pub async fn read_gparray(catalog: &dyn Catalog) -> HubResult<GpArray> {
    GpArray::from_segments(catalog.read_segments().await?)
}

/// Quote an SQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote an SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub async fn create_gp_toolkit_ext(catalog: &dyn Catalog) -> HubResult<()> {
    for dbname in [DEFAULT_DATABASE, "postgres"] {
        catalog
            .exec_on_database(dbname, "CREATE EXTENSION gp_toolkit")
            .await?;
    }
    Ok(())
}

/// Import the operating system collations into every template and the
/// maintenance database. template0 only accepts connections while this runs.
pub async fn import_collations(catalog: &dyn Catalog) -> HubResult<()> {
    const IMPORT: &str = "SELECT pg_import_system_collations('pg_catalog'); ANALYZE;";

    catalog
        .exec_on_database("postgres", "ALTER DATABASE template0 ALLOW_CONNECTIONS on")
        .await?;
    catalog.exec_on_database("template0", IMPORT).await?;
    catalog.exec_on_database("template0", "VACUUM FREEZE").await?;
    catalog
        .exec_on_database("postgres", "ALTER DATABASE template0 ALLOW_CONNECTIONS off")
        .await?;

    for dbname in [DEFAULT_DATABASE, "postgres"] {
        catalog.exec_on_database(dbname, IMPORT).await?;
        catalog.exec_on_database(dbname, "VACUUM FREEZE").await?;
    }
    Ok(())
}

pub async fn create_database(catalog: &dyn Catalog, dbname: &str) -> HubResult<()> {
    debug!("Creating database {}", dbname);
    catalog
        .exec_on_database(
            DEFAULT_DATABASE,
            &format!("CREATE DATABASE {}", quote_ident(dbname)),
        )
        .await
}

pub async fn set_user_password(catalog: &dyn Catalog, user: &str, password: &str) -> HubResult<()> {
    catalog
        .exec_on_database(
            DEFAULT_DATABASE,
            &format!(
                "ALTER USER {} WITH PASSWORD {}",
                quote_ident(user),
                quote_literal(password)
            ),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCatalog {
        statements: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Catalog for RecordingCatalog {
        async fn read_segments(&self) -> HubResult<Vec<Segment>> {
            Ok(Vec::new())
        }
        async fn register_coordinator(&self, _coordinator: &Segment) -> HubResult<()> {
            Ok(())
        }
        async fn register_primaries(&self, _primaries: &[Segment]) -> HubResult<()> {
            Ok(())
        }
        async fn register_mirrors(&self, _mirrors: &[Segment]) -> HubResult<()> {
            Ok(())
        }
        async fn exec_on_database(&self, dbname: &str, statement: &str) -> HubResult<()> {
            self.statements
                .lock()
                .unwrap()
                .push((dbname.to_string(), statement.to_string()));
            Ok(())
        }
        async fn trigger_fts_probe(&self) -> HubResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("sales"), "\"sales\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[tokio::test]
    async fn test_import_collations_order() {
        let catalog = RecordingCatalog::default();
        import_collations(&catalog).await.unwrap();

        let statements = catalog.statements.lock().unwrap();
        let dbs: Vec<_> = statements.iter().map(|(db, _)| db.as_str()).collect();
        assert_eq!(
            dbs,
            vec![
                "postgres",
                "template0",
                "template0",
                "postgres",
                "template1",
                "template1",
                "postgres",
                "postgres"
            ]
        );
        assert_eq!(statements[0].1, "ALTER DATABASE template0 ALLOW_CONNECTIONS on");
        assert_eq!(statements[3].1, "ALTER DATABASE template0 ALLOW_CONNECTIONS off");
    }

    #[tokio::test]
    async fn test_create_database_and_password() {
        let catalog = RecordingCatalog::default();
        create_database(&catalog, "sales").await.unwrap();
        set_user_password(&catalog, "gpadmin", "s3cr'et").await.unwrap();
        create_gp_toolkit_ext(&catalog).await.unwrap();

        let statements = catalog.statements.lock().unwrap();
        assert_eq!(
            statements[0],
            ("template1".to_string(), "CREATE DATABASE \"sales\"".to_string())
        );
        assert_eq!(
            statements[1].1,
            "ALTER USER \"gpadmin\" WITH PASSWORD 's3cr''et'"
        );
        assert_eq!(statements[2].1, "CREATE EXTENSION gp_toolkit");
        assert_eq!(statements[3].0, "postgres");
    }
}
