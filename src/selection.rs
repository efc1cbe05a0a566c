//! Dashboard filter state
//!
//! The rules the dashboard's select widgets follow, and the refresh cycle
//! that ties them to the API. The CLI query commands build their filters
//! through [`FilterState`] and [`MultiSelect`], so both front ends send
//! identical parameters.
//!
//! [`Dashboard`] is a model of the refresh logic in the embedded page's
//! JavaScript (`ui.html`), kept so that logic can be tested in Rust. The
//! binary never runs it; the browser runs the JavaScript copy, and the two
//! must be changed together.
//!
//! # Multi-select rules
//!
//! - Choosing `"all"` clears every other choice.
//! - Choosing a concrete value drops `"all"`.
//! - Clearing the last concrete value falls back to `"all"`.
//!
//! # Refresh cycle
//!
//! ```text
//! Loading ──vocabulary ok──▶ Loading(initial fetch) ──both parts settled──▶ Ready
//!    │                                                                        │ ▲
//!    └──vocabulary failed──▶ Error                          filter change ────┘ │
//!                                                       Filtering ──settled─────┘
//! ```
//!
//! Every refresh gets a new generation number. Responses carrying an older
//! generation are dropped, so a slow response to a superseded filter change
//! can never overwrite a newer one.

use crate::filter::{RawQuery, DEFAULT_PAGE_LIMIT, SENTINEL};
use tracing::warn;

/// Multi-value selection with the `"all"` sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiSelect {
    selected: Vec<String>,
}

impl Default for MultiSelect {
    fn default() -> Self {
        Self { selected: vec![SENTINEL.to_string()] }
    }
}

impl MultiSelect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.selected.iter().any(|v| v == SENTINEL)
    }

    pub fn values(&self) -> &[String] {
        &self.selected
    }

    /// Add one option to the selection.
    pub fn select(&mut self, value: &str) {
        if value == SENTINEL {
            self.reset();
            return;
        }
        self.selected.retain(|v| v != SENTINEL);
        if !self.selected.iter().any(|v| v == value) {
            self.selected.push(value.to_string());
        }
    }

    /// Remove one option from the selection.
    pub fn deselect(&mut self, value: &str) {
        self.selected.retain(|v| v != value);
        if self.selected.is_empty() {
            self.reset();
        }
    }

    /// Apply the full selection a widget reports after a change event.
    pub fn apply_change<S: AsRef<str>>(&mut self, reported: &[S]) {
        let reported: Vec<&str> = reported.iter().map(AsRef::as_ref).collect();
        let has_sentinel = reported.contains(&SENTINEL);
        let concrete: Vec<&str> = reported.iter().copied().filter(|v| *v != SENTINEL).collect();

        if concrete.is_empty() || (has_sentinel && !self.is_all()) {
            // Emptied, or "all" was just picked
            self.reset();
        } else {
            // Either no sentinel, or a concrete value was added next to it
            self.selected = Vec::new();
            for v in concrete {
                self.select(v);
            }
        }
    }

    pub fn reset(&mut self) {
        self.selected = vec![SENTINEL.to_string()];
    }

    /// Comma-joined value to send, or `None` when unrestricted.
    pub fn query_value(&self) -> Option<String> {
        if self.is_all() {
            None
        } else {
            Some(self.selected.join(","))
        }
    }
}

/// Single-value selection with the `"all"` sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingleSelect {
    value: Option<String>,
}

impl SingleSelect {
    pub fn set(&mut self, value: &str) {
        let value = value.trim();
        self.value = if value.is_empty() || value == SENTINEL {
            None
        } else {
            Some(value.to_string())
        };
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

/// Everything the dashboard's filter bar and pager hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterState {
    pub servers: MultiSelect,
    pub local_ip: SingleSelect,
    pub remote_ip: SingleSelect,
    pub ports: MultiSelect,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub page: i64,
    pub limit: i64,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            servers: MultiSelect::new(),
            local_ip: SingleSelect::default(),
            remote_ip: SingleSelect::default(),
            ports: MultiSelect::new(),
            date_from: None,
            date_to: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl FilterState {
    /// Query parameters for the filter set, sentinel values omitted.
    pub fn filter_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = self.servers.query_value() {
            pairs.push(("servers", v));
        }
        if let Some(v) = self.local_ip.value() {
            pairs.push(("localIp", v.to_string()));
        }
        if let Some(v) = self.remote_ip.value() {
            pairs.push(("remoteIp", v.to_string()));
        }
        if let Some(v) = self.ports.query_value() {
            pairs.push(("ports", v));
        }
        if let Some(ref v) = self.date_from {
            pairs.push(("dateFrom", v.clone()));
        }
        if let Some(ref v) = self.date_to {
            pairs.push(("dateTo", v.clone()));
        }
        pairs
    }

    /// Query string for the listing endpoint: filters plus page and limit.
    pub fn listing_query(&self) -> String {
        let mut pairs = vec![("page", self.page.to_string()), ("limit", self.limit.to_string())];
        pairs.extend(self.filter_pairs());
        encode(&pairs)
    }

    /// Query string for the aggregate endpoints.
    pub fn stats_query(&self) -> String {
        encode(&self.filter_pairs())
    }

    /// The same values as the query string, already split into fields.
    pub fn to_raw_query(&self) -> RawQuery {
        RawQuery {
            servers: self.servers.query_value(),
            local_ip: self.local_ip.value().map(str::to_string),
            remote_ip: self.remote_ip.value().map(str::to_string),
            ports: self.ports.query_value(),
            date_from: self.date_from.clone(),
            date_to: self.date_to.clone(),
            page: Some(self.page.to_string()),
            limit: Some(self.limit.to_string()),
        }
    }
}

fn encode(pairs: &[(&str, String)]) -> String {
    // Encoding string pairs cannot fail
    serde_urlencoded::to_string(pairs).unwrap_or_default()
}

// ============================================================================
// Refresh cycle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Ready,
    Filtering,
    Error(String),
}

/// The two requests a refresh issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Listing,
    Stats,
}

/// Handed out when a refresh starts; presented back with each response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
}

/// What the caller should do with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Render it.
    Apply,
    /// It failed; keep what is on screen.
    Keep,
    /// A newer refresh has started; drop it.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Dashboard {
    phase: Phase,
    filters: FilterState,
    generation: u64,
    listing_pending: bool,
    stats_pending: bool,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Dashboard {
    pub fn new() -> Self {
        Self {
            phase: Phase::Loading,
            filters: FilterState::default(),
            generation: 0,
            listing_pending: false,
            stats_pending: false,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn filters(&self) -> &FilterState {
        &self.filters
    }

    /// The filter vocabulary arrived; start the initial data fetch.
    pub fn vocabulary_loaded(&mut self) -> Ticket {
        self.start_refresh()
    }

    /// The filter vocabulary could not be fetched. Only a reload recovers.
    pub fn vocabulary_failed(&mut self, message: &str) {
        warn!("failed to load filter options: {}", message);
        self.phase = Phase::Error(message.to_string());
    }

    /// Change filters and start a refresh. Filter changes go back to page 1;
    /// set `page` in the closure afterwards to move the pager instead.
    pub fn update<F: FnOnce(&mut FilterState)>(&mut self, change: F) -> Option<Ticket> {
        if matches!(self.phase, Phase::Loading | Phase::Error(_)) {
            return None;
        }
        let before = self.filters.filter_pairs();
        change(&mut self.filters);
        if self.filters.filter_pairs() != before {
            self.filters.page = 1;
        }
        self.phase = Phase::Filtering;
        Some(self.start_refresh())
    }

    /// Move to another page without touching filters.
    pub fn go_to_page(&mut self, page: i64) -> Option<Ticket> {
        if matches!(self.phase, Phase::Loading | Phase::Error(_)) || page < 1 {
            return None;
        }
        self.filters.page = page;
        self.phase = Phase::Filtering;
        Some(self.start_refresh())
    }

    fn start_refresh(&mut self) -> Ticket {
        self.generation += 1;
        self.listing_pending = true;
        self.stats_pending = true;
        Ticket { generation: self.generation }
    }

    /// Record the response to one part of a refresh.
    pub fn settle(&mut self, ticket: Ticket, part: Part, result: Result<(), String>) -> Outcome {
        if ticket.generation != self.generation {
            return Outcome::Stale;
        }

        match part {
            Part::Listing => self.listing_pending = false,
            Part::Stats => self.stats_pending = false,
        }

        let outcome = match result {
            Ok(()) => Outcome::Apply,
            Err(message) => {
                warn!(?part, "refresh request failed: {}", message);
                Outcome::Keep
            }
        };

        if !self.listing_pending && !self.stats_pending {
            self.phase = Phase::Ready;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ConnectionFilter;

    // ==========================================================================
    // MULTI-SELECT TESTS
    // ==========================================================================

    #[test]
    fn test_multiselect_starts_at_all() {
        let s = MultiSelect::new();
        assert!(s.is_all());
        assert_eq!(s.query_value(), None);
    }

    #[test]
    fn test_concrete_choice_drops_sentinel() {
        let mut s = MultiSelect::new();
        s.select("web01");
        s.select("web02");
        s.select("web01");
        assert!(!s.is_all());
        assert_eq!(s.values(), &["web01".to_string(), "web02".to_string()]);
        assert_eq!(s.query_value().as_deref(), Some("web01,web02"));
    }

    #[test]
    fn test_choosing_all_clears_others() {
        let mut s = MultiSelect::new();
        s.select("web01");
        s.select(SENTINEL);
        assert!(s.is_all());
        assert_eq!(s.values().len(), 1);
    }

    #[test]
    fn test_clearing_last_value_reverts_to_all() {
        let mut s = MultiSelect::new();
        s.select("web01");
        s.deselect("web01");
        assert!(s.is_all());
    }

    #[test]
    fn test_widget_change_events() {
        let mut s = MultiSelect::new();

        // concrete option added alongside the pre-selected "all"
        s.apply_change(&["all", "80"]);
        assert_eq!(s.query_value().as_deref(), Some("80"));

        // "all" picked while concrete values are selected
        s.apply_change(&["80", "all"]);
        assert!(s.is_all());

        s.apply_change(&["443", "22"]);
        assert_eq!(s.query_value().as_deref(), Some("443,22"));

        // everything deselected
        s.apply_change::<&str>(&[]);
        assert!(s.is_all());
    }

    #[test]
    fn test_single_select_sentinel() {
        let mut s = SingleSelect::default();
        s.set("10.0.0.1");
        assert_eq!(s.value(), Some("10.0.0.1"));
        s.set("all");
        assert_eq!(s.value(), None);
        s.set("  ");
        assert_eq!(s.value(), None);
    }

    // ==========================================================================
    // QUERY RENDERING TESTS
    // ==========================================================================

    #[test]
    fn test_default_state_sends_no_filters() {
        let state = FilterState::default();
        assert_eq!(state.stats_query(), "");
        assert_eq!(state.listing_query(), "page=1&limit=10");
    }

    #[test]
    fn test_query_matches_server_side_parsing() {
        let mut state = FilterState::default();
        state.servers.select("A");
        state.servers.select("B");
        state.ports.select("80");
        state.remote_ip.set("1.1.1.1");
        state.date_from = Some("2024-01-01".to_string());

        assert_eq!(
            state.stats_query(),
            "servers=A%2CB&remoteIp=1.1.1.1&ports=80&dateFrom=2024-01-01"
        );

        let via_string = ConnectionFilter::from_query(&RawQuery::parse(&state.listing_query()).unwrap()).unwrap();
        let via_fields = ConnectionFilter::from_query(&state.to_raw_query()).unwrap();
        assert_eq!(via_string, via_fields);
        assert_eq!(via_fields.servers, vec!["A", "B"]);
        assert_eq!(via_fields.ports, vec![80]);
    }

    // ==========================================================================
    // REFRESH CYCLE TESTS
    // ==========================================================================

    #[test]
    fn test_initial_load_reaches_ready_after_both_parts() {
        let mut d = Dashboard::new();
        assert_eq!(d.phase(), &Phase::Loading);
        assert!(d.update(|f| f.servers.select("A")).is_none());

        let t = d.vocabulary_loaded();
        assert_eq!(d.settle(t, Part::Stats, Ok(())), Outcome::Apply);
        assert_eq!(d.phase(), &Phase::Loading);
        assert_eq!(d.settle(t, Part::Listing, Ok(())), Outcome::Apply);
        assert_eq!(d.phase(), &Phase::Ready);
    }

    #[test]
    fn test_vocabulary_failure_is_terminal() {
        let mut d = Dashboard::new();
        d.vocabulary_failed("connection refused");
        assert_eq!(d.phase(), &Phase::Error("connection refused".to_string()));
        assert!(d.go_to_page(2).is_none());
    }

    #[test]
    fn test_stale_responses_are_dropped() {
        let mut d = Dashboard::new();
        let t0 = d.vocabulary_loaded();
        d.settle(t0, Part::Listing, Ok(()));
        d.settle(t0, Part::Stats, Ok(()));

        let t1 = d.update(|f| f.servers.select("A")).unwrap();
        let t2 = d.update(|f| f.servers.select("B")).unwrap();
        assert_eq!(d.phase(), &Phase::Filtering);

        // the superseded refresh answers late
        assert_eq!(d.settle(t1, Part::Listing, Ok(())), Outcome::Stale);
        assert_eq!(d.settle(t1, Part::Stats, Ok(())), Outcome::Stale);
        assert_eq!(d.phase(), &Phase::Filtering);

        assert_eq!(d.settle(t2, Part::Listing, Ok(())), Outcome::Apply);
        assert_eq!(d.settle(t2, Part::Stats, Ok(())), Outcome::Apply);
        assert_eq!(d.phase(), &Phase::Ready);
    }

    #[test]
    fn test_partial_failure_keeps_previous_and_finishes() {
        let mut d = Dashboard::new();
        let t0 = d.vocabulary_loaded();
        d.settle(t0, Part::Listing, Ok(()));
        d.settle(t0, Part::Stats, Ok(()));

        let t = d.update(|f| f.ports.select("443")).unwrap();
        assert_eq!(d.settle(t, Part::Stats, Err("500".to_string())), Outcome::Keep);
        assert_eq!(d.settle(t, Part::Listing, Ok(())), Outcome::Apply);
        assert_eq!(d.phase(), &Phase::Ready);
    }

    #[test]
    fn test_filter_change_resets_page() {
        let mut d = Dashboard::new();
        let t0 = d.vocabulary_loaded();
        d.settle(t0, Part::Listing, Ok(()));
        d.settle(t0, Part::Stats, Ok(()));

        d.go_to_page(3).unwrap();
        assert_eq!(d.filters().page, 3);

        d.update(|f| f.local_ip.set("10.0.0.1")).unwrap();
        assert_eq!(d.filters().page, 1);
    }
}
