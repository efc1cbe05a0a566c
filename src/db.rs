//! SQLite Record Store with Diesel ORM
//!
//! One append-only table of connection observations. Fixed-shape reads go
//! through the Diesel DSL; the filtered reads are raw SQL built around the
//! shared [`Predicate`] so that count, page and aggregate queries all filter
//! identically.

use crate::config::DbConfig;
use crate::error::StoreError;
use crate::filter::{ConnectionFilter, Page, Predicate, SqlParam};
use crate::schema::connections;
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::{BigInt, Integer, Text};
use diesel::sqlite::{Sqlite, SqliteConnection};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Name of the Record Store table
pub const TABLE_NAME: &str = "connections";

/// Columns every query relies on. `file_date` is informational only.
pub const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "timestamp",
    "servername",
    "local_ip",
    "remote_ip",
    "port",
    "state",
];

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable connection observation
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = connections)]
pub struct NewObservation {
    /// `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
    pub local_ip: String,
    pub remote_ip: String,
    pub port: i32,
    pub state: String,
    pub servername: String,
    /// Date of the log batch the row came from
    pub file_date: String,
}

/// One row of the listing endpoint, with the API's field names
#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRow {
    #[diesel(sql_type = Integer)]
    pub id: i32,
    #[diesel(sql_type = Text)]
    pub timestamp: String,
    #[diesel(sql_type = Text)]
    pub server: String,
    #[diesel(sql_type = Text)]
    pub local_ip: String,
    #[diesel(sql_type = Text)]
    pub remote_ip: String,
    #[diesel(sql_type = Integer)]
    pub port: i32,
    #[diesel(sql_type = Text)]
    pub status: String,
}

/// Group count over a text column
#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize)]
pub struct TextCount {
    #[diesel(sql_type = Text)]
    pub value: String,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

/// Group count over the port column
#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize)]
pub struct PortCount {
    #[diesel(sql_type = Integer)]
    pub value: i32,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

/// Group count over (server, remote IP)
#[derive(QueryableByName, Debug, Clone, PartialEq, Serialize)]
pub struct PairCount {
    #[diesel(sql_type = Text)]
    pub server: String,
    #[diesel(sql_type = Text)]
    pub remote_ip: String,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

// ============================================================================
// Query Results
// ============================================================================

/// Distinct values per filterable dimension
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterVocabulary {
    pub servers: Vec<String>,
    pub local_ips: Vec<String>,
    pub remote_ips: Vec<String>,
    pub ports: Vec<i32>,
}

/// One page of the listing endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionPage {
    pub connections: Vec<ConnectionRow>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

/// Per-dimension counts, each sorted by count descending
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DimensionStats {
    #[serde(rename = "remoteIp")]
    pub remote_ip: Vec<TextCount>,
    pub server: Vec<TextCount>,
    pub port: Vec<PortCount>,
}

/// Top (server, remote IP) pairs plus every known server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PairStats {
    pub data: Vec<PairCount>,
    pub servers: Vec<String>,
}

/// Text columns the stats endpoint groups by
#[derive(Debug, Clone, Copy)]
enum TextDimension {
    RemoteIp,
    Server,
}

impl TextDimension {
    fn column(self) -> &'static str {
        match self {
            TextDimension::RemoteIp => "remote_ip",
            TextDimension::Server => "servername",
        }
    }
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;
type BoxedQuery<'f> = BoxedSqlQuery<'f, Sqlite, SqlQuery>;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Record Store handle with connection pool.
///
/// Cheap to clone; clones share the pool. Each operation checks out one
/// connection for its queries and returns it when the guard drops, on success
/// and on error alike.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Open the store described by `config`.
    pub fn open(config: &DbConfig) -> Result<Self> {
        Self::open_at(&config.database, config.pool_size)
    }

    /// Open database at specified path. Does not create the table; see
    /// [`Store::migrate`].
    pub fn open_at<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Create the table and its indexes if they don't exist
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                timestamp TEXT NOT NULL,
                local_ip VARCHAR(45) NOT NULL,
                remote_ip VARCHAR(45) NOT NULL,
                port INTEGER NOT NULL CHECK (port >= 0),
                state VARCHAR(50) NOT NULL,
                servername VARCHAR(255) NOT NULL,
                file_date TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_connections_timestamp ON connections(timestamp)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_connections_remote_ip ON connections(remote_ip)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_connections_servername ON connections(servername)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_connections_port ON connections(port)").execute(&mut conn)?;

        Ok(())
    }

    /// Check that the table exists and has every required column.
    pub fn verify_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        let tables: Vec<String> = diesel::sql_query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .load::<NameRow>(&mut conn)?
        .into_iter()
        .map(|r| r.name)
        .collect();

        if !tables.iter().any(|t| t == TABLE_NAME) {
            return Err(StoreError::Structure {
                table: TABLE_NAME.to_string(),
                missing: vec![],
                existing: tables,
            });
        }

        let columns: Vec<String> = diesel::sql_query(format!("PRAGMA table_info({})", TABLE_NAME))
            .load::<NameRow>(&mut conn)?
            .into_iter()
            .map(|r| r.name)
            .collect();

        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !columns.iter().any(|have| have == *c))
            .map(|c| c.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(StoreError::Structure {
                table: TABLE_NAME.to_string(),
                missing,
                existing: columns,
            });
        }

        Ok(())
    }

    /// Version string reported by the SQLite library
    pub fn server_version(&self) -> Result<String> {
        let mut conn = self.get_conn()?;
        let version = diesel::select(diesel::dsl::sql::<Text>("sqlite_version()"))
            .get_result::<String>(&mut conn)?;
        Ok(version)
    }

    /// Total number of stored observations
    pub fn row_count(&self) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let total: i64 = connections::table.count().get_result(&mut conn)?;
        Ok(total)
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Append observations in a single transaction
    pub fn insert_observations(&self, rows: &[NewObservation]) -> Result<usize> {
        let mut conn = self.get_conn()?;

        let inserted = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut n = 0;
            for row in rows {
                n += diesel::insert_into(connections::table).values(row).execute(conn)?;
            }
            Ok(n)
        })?;

        Ok(inserted)
    }

    // ========================================================================
    // Filter Vocabulary
    // ========================================================================

    /// Distinct servers, local IPs, remote IPs and ports, each ascending
    pub fn filter_vocabulary(&self) -> Result<FilterVocabulary> {
        let mut conn = self.get_conn()?;

        let servers = Self::distinct_servers(&mut conn)?;

        let local_ips = connections::table
            .select(connections::local_ip)
            .distinct()
            .order(connections::local_ip.asc())
            .load::<String>(&mut conn)?;

        let remote_ips = connections::table
            .select(connections::remote_ip)
            .distinct()
            .order(connections::remote_ip.asc())
            .load::<String>(&mut conn)?;

        let ports = connections::table
            .select(connections::port)
            .distinct()
            .order(connections::port.asc())
            .load::<i32>(&mut conn)?;

        Ok(FilterVocabulary { servers, local_ips, remote_ips, ports })
    }

    /// Every distinct server name, ascending, ignoring filters
    fn distinct_servers(conn: &mut DbConn) -> Result<Vec<String>> {
        let servers = connections::table
            .select(connections::servername)
            .distinct()
            .order(connections::servername.asc())
            .load::<String>(conn)?;
        Ok(servers)
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Number of rows matching `filter`
    pub fn count(&self, filter: &ConnectionFilter) -> Result<i64> {
        let mut conn = self.get_conn()?;
        Self::count_matching(&mut conn, &filter.predicate())
    }

    fn count_matching(conn: &mut DbConn, predicate: &Predicate) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) AS total FROM {} {}", TABLE_NAME, predicate.clause());
        let row = bind_predicate(sql, predicate).get_result::<CountRow>(conn)?;
        Ok(row.total)
    }

    /// One page of matching rows, newest first, with the overall total.
    ///
    /// A page past the end is empty, not an error.
    pub fn list_connections(&self, filter: &ConnectionFilter, page: Page) -> Result<ConnectionPage> {
        let mut conn = self.get_conn()?;
        let predicate = filter.predicate();

        let total = Self::count_matching(&mut conn, &predicate)?;

        let sql = format!(
            "SELECT id, timestamp, servername AS server, local_ip, remote_ip, port, state AS status \
             FROM {} {} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            TABLE_NAME,
            predicate.clause()
        );
        let connections = bind_predicate(sql, &predicate)
            .bind::<BigInt, _>(page.limit)
            .bind::<BigInt, _>(page.offset())
            .load::<ConnectionRow>(&mut conn)?;

        Ok(ConnectionPage {
            connections,
            total,
            page: page.page,
            limit: page.limit,
            pages: page.page_count(total),
        })
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// Counts per remote IP, per server and per port under `filter`
    pub fn dimension_stats(&self, filter: &ConnectionFilter) -> Result<DimensionStats> {
        let mut conn = self.get_conn()?;
        let predicate = filter.predicate();

        let remote_ip = Self::text_counts(&mut conn, TextDimension::RemoteIp, &predicate)?;
        let server = Self::text_counts(&mut conn, TextDimension::Server, &predicate)?;

        let sql = format!(
            "SELECT port AS value, COUNT(*) AS count FROM {} {} GROUP BY port ORDER BY count DESC, value ASC",
            TABLE_NAME,
            predicate.clause()
        );
        let port = bind_predicate(sql, &predicate).load::<PortCount>(&mut conn)?;

        Ok(DimensionStats { remote_ip, server, port })
    }

    fn text_counts(conn: &mut DbConn, dimension: TextDimension, predicate: &Predicate) -> Result<Vec<TextCount>> {
        let column = dimension.column();
        let sql = format!(
            "SELECT {col} AS value, COUNT(*) AS count FROM {table} {clause} GROUP BY {col} ORDER BY count DESC, value ASC",
            col = column,
            table = TABLE_NAME,
            clause = predicate.clause()
        );
        let counts = bind_predicate(sql, predicate).load::<TextCount>(conn)?;
        Ok(counts)
    }

    /// Top `limit` (server, remote IP) pairs under `filter`, plus the
    /// unfiltered server list for colour assignment.
    pub fn pair_stats(&self, filter: &ConnectionFilter, limit: i64) -> Result<PairStats> {
        let mut conn = self.get_conn()?;
        let predicate = filter.predicate();

        let sql = format!(
            "SELECT servername AS server, remote_ip, COUNT(*) AS count FROM {} {} \
             GROUP BY servername, remote_ip ORDER BY count DESC, server ASC, remote_ip ASC LIMIT ?",
            TABLE_NAME,
            predicate.clause()
        );
        let data = bind_predicate(sql, &predicate)
            .bind::<BigInt, _>(limit)
            .load::<PairCount>(&mut conn)?;

        let servers = Self::distinct_servers(&mut conn)?;

        Ok(PairStats { data, servers })
    }
}

/// Box `sql` and bind the predicate's parameters in placeholder order.
fn bind_predicate<'f>(sql: String, predicate: &Predicate) -> BoxedQuery<'f> {
    debug!(sql = %sql, params = predicate.params().len(), "query");
    let mut query = diesel::sql_query(sql).into_boxed::<Sqlite>();
    for (_, param) in predicate.params() {
        query = match param {
            SqlParam::Text(v) => query.bind::<Text, _>(v.clone()),
            SqlParam::Int(v) => query.bind::<Integer, _>(*v),
        };
    }
    query
}
