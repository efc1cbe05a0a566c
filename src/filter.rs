//! Filter-query builder
//!
//! Turns the dashboard's query-string filters into one SQL predicate plus the
//! values to bind to it. Every endpoint goes through [`ConnectionFilter::predicate`],
//! so the listing, stats and pairwise endpoints can never disagree about what
//! a filter means.
//!
//! # Rules
//!
//! - `"all"` is the sentinel for "no restriction". A single-value filter equal
//!   to it, or a list filter containing it, adds no clause.
//! - Absent, empty, and sentinel are all equivalent.
//! - Filters combine with `AND`; values inside a list filter combine with `OR`
//!   (rendered as `IN (...)`).
//! - Values are only ever bound as parameters, never spliced into the SQL text.
//! - `ports`, `page` and `limit` must be integers and dates must be
//!   `YYYY-MM-DD`; anything else is rejected with an [`InputError`].

use crate::error::InputError;
use chrono::NaiveDate;
use serde::Deserialize;

/// Reserved filter value meaning "no restriction on this dimension".
pub const SENTINEL: &str = "all";

/// Default page size for the listing endpoint.
pub const DEFAULT_PAGE_LIMIT: i64 = 10;

/// Default row cap for the pairwise aggregation endpoint.
pub const DEFAULT_PAIR_LIMIT: i64 = 20;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Query-string parameters exactly as the client sends them.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawQuery {
    pub servers: Option<String>,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
    pub ports: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl RawQuery {
    /// Parse the part of a URL after `?`.
    pub fn parse(query: &str) -> Result<Self, InputError> {
        serde_urlencoded::from_str(query).map_err(|e| InputError::Malformed(e.to_string()))
    }

    /// Parse the query string of a full request URL. A URL without `?` yields
    /// an empty query.
    pub fn from_url(url: &str) -> Result<Self, InputError> {
        match url.split_once('?') {
            Some((_, query)) => Self::parse(query),
            None => Ok(Self::default()),
        }
    }
}

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Int(i32),
}

/// A `WHERE` clause and the parameters for its placeholders, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    clause: String,
    params: Vec<(String, SqlParam)>,
}

impl Predicate {
    /// Either empty or `WHERE ...`, ready to splice between `FROM` and
    /// `GROUP BY`/`ORDER BY`.
    pub fn clause(&self) -> &str {
        &self.clause
    }

    /// Named parameter values, in placeholder order.
    pub fn params(&self) -> &[(String, SqlParam)] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.clause.is_empty()
    }

    /// Value bound under `name`, if any.
    pub fn param(&self, name: &str) -> Option<&SqlParam> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// The filter set shared by every connection query.
///
/// Empty vectors and `None` mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionFilter {
    pub servers: Vec<String>,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
    pub ports: Vec<i32>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl ConnectionFilter {
    /// Build a filter from raw query-string values, applying the sentinel
    /// rules and rejecting values that do not coerce.
    pub fn from_query(raw: &RawQuery) -> Result<Self, InputError> {
        let servers = list_values(raw.servers.as_deref())
            .into_iter()
            .map(str::to_string)
            .collect();

        let ports = list_values(raw.ports.as_deref())
            .into_iter()
            .map(parse_port)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            servers,
            local_ip: single_value(raw.local_ip.as_deref()).map(str::to_string),
            remote_ip: single_value(raw.remote_ip.as_deref()).map(str::to_string),
            ports,
            date_from: parse_date("dateFrom", raw.date_from.as_deref())?,
            date_to: parse_date("dateTo", raw.date_to.as_deref())?,
        })
    }

    /// True when no dimension is restricted.
    pub fn is_unrestricted(&self) -> bool {
        self.servers.is_empty()
            && self.local_ip.is_none()
            && self.remote_ip.is_none()
            && self.ports.is_empty()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }

    /// Render the shared predicate.
    pub fn predicate(&self) -> Predicate {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<(String, SqlParam)> = Vec::new();

        if let Some(from) = self.date_from {
            conditions.push("date(timestamp) >= ?".to_string());
            params.push(("date_from".to_string(), SqlParam::Text(from.format(DATE_FORMAT).to_string())));
        }

        if let Some(to) = self.date_to {
            conditions.push("date(timestamp) <= ?".to_string());
            params.push(("date_to".to_string(), SqlParam::Text(to.format(DATE_FORMAT).to_string())));
        }

        if !self.servers.is_empty() {
            conditions.push(format!("servername IN ({})", placeholders(self.servers.len())));
            for (i, server) in self.servers.iter().enumerate() {
                params.push((format!("server{}", i), SqlParam::Text(server.clone())));
            }
        }

        if let Some(ref ip) = self.local_ip {
            conditions.push("local_ip = ?".to_string());
            params.push(("local_ip".to_string(), SqlParam::Text(ip.clone())));
        }

        if let Some(ref ip) = self.remote_ip {
            conditions.push("remote_ip = ?".to_string());
            params.push(("remote_ip".to_string(), SqlParam::Text(ip.clone())));
        }

        if !self.ports.is_empty() {
            conditions.push(format!("port IN ({})", placeholders(self.ports.len())));
            for (i, port) in self.ports.iter().enumerate() {
                params.push((format!("port{}", i), SqlParam::Int(*port)));
            }
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        Predicate { clause, params }
    }
}

/// 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl Page {
    pub fn from_query(raw: &RawQuery, default_limit: i64) -> Result<Self, InputError> {
        Ok(Self {
            page: parse_positive("page", raw.page.as_deref(), 1)?,
            limit: parse_positive("limit", raw.limit.as_deref(), default_limit)?,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    /// `ceil(total / limit)`; zero for an empty result. Holds for any
    /// `limit >= 1`, including `i64::MAX`.
    pub fn page_count(&self, total: i64) -> i64 {
        if total <= 0 {
            0
        } else {
            total / self.limit + i64::from(total % self.limit != 0)
        }
    }
}

/// Row cap for endpoints that take `limit` without `page`.
pub fn parse_limit(raw: &RawQuery, default_limit: i64) -> Result<i64, InputError> {
    parse_positive("limit", raw.limit.as_deref(), default_limit)
}

// ============================================================================
// Value coercion
// ============================================================================

/// Split a comma-separated list. Returns no values when the list is absent,
/// empty, or mentions the sentinel anywhere.
fn list_values(raw: Option<&str>) -> Vec<&str> {
    let tokens: Vec<&str> = match raw {
        Some(s) => s.split(',').map(str::trim).filter(|t| !t.is_empty()).collect(),
        None => return Vec::new(),
    };
    if tokens.iter().any(|t| *t == SENTINEL) {
        Vec::new()
    } else {
        tokens
    }
}

fn single_value(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|v| !v.is_empty() && *v != SENTINEL)
}

fn parse_port(token: &str) -> Result<i32, InputError> {
    token
        .parse::<u16>()
        .map(i32::from)
        .map_err(|_| InputError::InvalidInteger { param: "ports", value: token.to_string() })
}

fn parse_date(param: &'static str, raw: Option<&str>) -> Result<Option<NaiveDate>, InputError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => NaiveDate::parse_from_str(v, DATE_FORMAT)
            .map(Some)
            .map_err(|_| InputError::InvalidDate { param, value: v.to_string() }),
        None => Ok(None),
    }
}

fn parse_positive(param: &'static str, raw: Option<&str>, default: i64) -> Result<i64, InputError> {
    let value = match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| InputError::InvalidInteger { param, value: v.to_string() })?,
        None => return Ok(default),
    };
    if value < 1 {
        return Err(InputError::OutOfRange { param, value });
    }
    Ok(value)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
