/// Catalog backed by a libpq-protocol session on the coordinator
use super::{quote_literal, Catalog, CatalogConnector, DEFAULT_DATABASE};
use crate::agent::UTILITY_MODE_OPTIONS;
use crate::core::{Role, Segment};
use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

const READ_SEGMENTS: &str = "SELECT dbid, content, role, preferred_role, port, hostname, address, datadir \
     FROM pg_catalog.gp_segment_configuration ORDER BY content ASC, role DESC";

/// gp_add_segment_primary() numbers primaries from 1
const SHIFT_CONTENT_IDS: &str = "SET allow_system_table_mods=true; \
     UPDATE gp_segment_configuration SET content = content - 1 where content > 0;";

fn catalog_error(err: tokio_postgres::Error) -> HubError {
    HubError::catalog(err.to_string())
}

pub fn register_coordinator_sql(seg: &Segment) -> String {
    format!(
        "SELECT pg_catalog.gp_add_segment(1::int2, -1::int2, 'p', 'p', 's', 'u', {}, {}, {}, {})",
        seg.port,
        quote_literal(&seg.hostname),
        quote_literal(&seg.address),
        quote_literal(&seg.data_directory)
    )
}

pub fn register_primary_sql(seg: &Segment) -> String {
    format!(
        "SELECT pg_catalog.gp_add_segment_primary({}, {}, {}, {})",
        quote_literal(&seg.hostname),
        quote_literal(&seg.address),
        seg.port,
        quote_literal(&seg.data_directory)
    )
}

pub fn register_mirror_sql(seg: &Segment) -> String {
    format!(
        "SELECT pg_catalog.gp_add_segment_mirror({}::int2, {}, {}, {}, {})",
        seg.content_id,
        quote_literal(&seg.hostname),
        quote_literal(&seg.address),
        seg.port,
        quote_literal(&seg.data_directory)
    )
}

/// Last value set for `key` in a data directory's postgresql.conf
pub fn read_config_value(data_dir: &Path, key: &str) -> HubResult<String> {
    let path = data_dir.join("postgresql.conf");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| HubError::catalog(format!("reading {}: {}", path.display(), e)))?;

    content
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next()?.trim();
            let (name, value) = line.split_once('=')?;
            if name.trim() == key {
                Some(value.trim().trim_matches('\'').to_string())
            } else {
                None
            }
        })
        .last()
        .ok_or_else(|| HubError::catalog(format!("{} not set in {}", key, path.display())))
}

/// Connects to the coordinator running on this host
pub struct PgCatalogConnector {
    user: String,
}

impl PgCatalogConnector {
    pub fn new<S: Into<String>>(user: S) -> Self {
        Self { user: user.into() }
    }
}

#[async_trait]
impl CatalogConnector for PgCatalogConnector {
    async fn connect(&self, coordinator_data_dir: &str, utility: bool) -> HubResult<Arc<dyn Catalog>> {
        let port = read_config_value(Path::new(coordinator_data_dir), "port")?;
        let port: u16 = port
            .parse()
            .map_err(|_| HubError::catalog(format!("invalid coordinator port {:?}", port)))?;

        let catalog = PgCatalog {
            port,
            user: self.user.clone(),
            utility,
        };
        // Fail early when the coordinator is not accepting connections
        catalog.client(DEFAULT_DATABASE).await?;
        Ok(Arc::new(catalog))
    }
}

/// One session per call, so statements can target any database
pub struct PgCatalog {
    port: u16,
    user: String,
    utility: bool,
}

impl PgCatalog {
    async fn client(&self, dbname: &str) -> HubResult<Client> {
        let mut config = tokio_postgres::Config::new();
        config
            .host("localhost")
            .port(self.port)
            .user(&self.user)
            .dbname(dbname);
        if self.utility {
            config.options(UTILITY_MODE_OPTIONS);
        }

        let (client, connection) = config.connect(NoTls).await.map_err(catalog_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("catalog connection error: {}", e);
            }
        });
        Ok(client)
    }

    async fn batch(&self, dbname: &str, sql: &str) -> HubResult<()> {
        debug!("Executing query {:?} on {}", sql, dbname);
        self.client(dbname)
            .await?
            .batch_execute(sql)
            .await
            .map_err(catalog_error)
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn read_segments(&self) -> HubResult<Vec<Segment>> {
        let client = self.client(DEFAULT_DATABASE).await?;
        let rows = client.query(READ_SEGMENTS, &[]).await.map_err(catalog_error)?;

        rows.iter()
            .map(|row| {
                let role: i8 = row.try_get("role").map_err(catalog_error)?;
                let preferred_role: i8 = row.try_get("preferred_role").map_err(catalog_error)?;
                let port: i32 = row.try_get("port").map_err(catalog_error)?;
                Ok(Segment {
                    dbid: i32::from(row.try_get::<_, i16>("dbid").map_err(catalog_error)?),
                    content_id: i32::from(row.try_get::<_, i16>("content").map_err(catalog_error)?),
                    role: Role::from_char(role as u8 as char)?,
                    preferred_role: Role::from_char(preferred_role as u8 as char)?,
                    hostname: row.try_get("hostname").map_err(catalog_error)?,
                    address: row.try_get("address").map_err(catalog_error)?,
                    port: u16::try_from(port)
                        .map_err(|_| HubError::catalog(format!("invalid port {}", port)))?,
                    data_directory: row.try_get("datadir").map_err(catalog_error)?,
                })
            })
            .collect()
    }

    async fn register_coordinator(&self, coordinator: &Segment) -> HubResult<()> {
        self.batch(DEFAULT_DATABASE, &register_coordinator_sql(coordinator))
            .await
    }

    async fn register_primaries(&self, primaries: &[Segment]) -> HubResult<()> {
        let client = self.client(DEFAULT_DATABASE).await?;
        for seg in primaries {
            client
                .batch_execute(&register_primary_sql(seg))
                .await
                .map_err(catalog_error)?;
        }
        client
            .batch_execute(SHIFT_CONTENT_IDS)
            .await
            .map_err(catalog_error)
    }

    async fn register_mirrors(&self, mirrors: &[Segment]) -> HubResult<()> {
        let client = self.client(DEFAULT_DATABASE).await?;
        for seg in mirrors {
            client
                .batch_execute(&register_mirror_sql(seg))
                .await
                .map_err(catalog_error)?;
        }
        Ok(())
    }

    async fn exec_on_database(&self, dbname: &str, statement: &str) -> HubResult<()> {
        self.batch(dbname, statement).await
    }

    async fn trigger_fts_probe(&self) -> HubResult<()> {
        self.batch(DEFAULT_DATABASE, "SELECT gp_request_fts_probe_scan()")
            .await
            .map_err(|e| e.context("triggering FTS probe"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_registration_sql() {
        let mut seg = Segment::new("sdw1", "sdw1-1", 7002, "/data/primary/gpseg0");
        assert_eq!(
            register_primary_sql(&seg),
            "SELECT pg_catalog.gp_add_segment_primary('sdw1', 'sdw1-1', 7002, '/data/primary/gpseg0')"
        );

        seg.content_id = 3;
        assert_eq!(
            register_mirror_sql(&seg),
            "SELECT pg_catalog.gp_add_segment_mirror(3::int2, 'sdw1', 'sdw1-1', 7002, '/data/primary/gpseg0')"
        );

        let coordinator = Segment::new("cdw", "cdw", 7000, "/data/coordinator/gpseg-1");
        assert_eq!(
            register_coordinator_sql(&coordinator),
            "SELECT pg_catalog.gp_add_segment(1::int2, -1::int2, 'p', 'p', 's', 'u', 7000, 'cdw', 'cdw', '/data/coordinator/gpseg-1')"
        );
    }

    #[test]
    fn test_read_config_value_last_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("postgresql.conf"),
            "# port = 5432\nport = 6000\nlisten_addresses = '*'\nport=7000 # set by initdb\n",
        )
        .unwrap();

        assert_eq!(read_config_value(dir.path(), "port").unwrap(), "7000");
        assert_eq!(read_config_value(dir.path(), "listen_addresses").unwrap(), "*");
        assert!(read_config_value(dir.path(), "shared_buffers").is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_config_file() {
        let dir = TempDir::new().unwrap();
        let connector = PgCatalogConnector::new("gpadmin");
        let err = connector
            .connect(dir.path().to_str().unwrap(), true)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Catalog { .. }));
    }
}
