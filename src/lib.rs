//! netstat-dash - Dashboard for netstat connection snapshots
//!
//! Connection observations captured from `netstat` on a fleet of servers are
//! stored one row per connection. netstat-dash serves a small read-only JSON
//! API over that table, and a browser dashboard that filters, pages and charts it.
//!
//! # Overview
//!
//! Every endpoint runs one or more SQL queries that share a single predicate
//! built from the request's filters (servers, local IP, remote IP, ports,
//! date range). Because all endpoints share one builder, the listing total
//! and the per-dimension counts always agree for the same filter set.
//!
//! # Quick Start
//!
//! ```no_run
//! use netstat_dash::{ConnectionFilter, Page, RawQuery, Store};
//!
//! let store = Store::open_at("netstat.db", 4)?;
//! store.migrate()?;
//!
//! let raw = RawQuery::parse("servers=web01,web02&ports=443")?;
//! let filter = ConnectionFilter::from_query(&raw)?;
//!
//! let page = store.list_connections(&filter, Page { page: 1, limit: 10 })?;
//! println!("{} of {} connections", page.connections.len(), page.total);
//!
//! let stats = store.dimension_stats(&filter)?;
//! for c in &stats.remote_ip {
//!     println!("{:<40} {}", c.value, c.count);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # API
//!
//! | Path | Response |
//! |------|----------|
//! | `/api/v1/connections/filters` | distinct servers, local IPs, remote IPs, ports |
//! | `/api/v1/connections` | one page of rows plus `total`, `page`, `limit`, `pages` |
//! | `/api/v1/connections/stats` | counts per remote IP, server and port |
//! | `/api/v1/connections/stats/advanced` | top (server, remote IP) pairs |
//!
//! # Modules
//!
//! - [`filter`]: query-string parsing and the shared SQL predicate
//! - [`db`]: the Record Store and its queries
//! - [`serve`]: HTTP server and embedded dashboard
//! - [`selection`]: dashboard filter state and refresh cycle
//! - [`config`]: YAML/CLI configuration

pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod schema;
pub mod selection;
pub mod serve;

pub use config::{Config, DbConfig, SchemaCheck};
pub use db::{
    ConnectionPage, ConnectionRow, DimensionStats, FilterVocabulary, NewObservation, PairStats, Store,
};
pub use error::{ApiError, ConfigError, InputError, ServeError, StoreError};
pub use filter::{ConnectionFilter, Page, Predicate, RawQuery, SENTINEL};
pub use selection::{Dashboard, FilterState, MultiSelect};
