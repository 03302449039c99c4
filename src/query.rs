//! Declarative event queries: filters, constraints, and sort directives.
//!
//! A [`Query`] describes which events to fetch from a store and how to sort
//! them. Queries are plain values: build them with the chainable `with_*`
//! methods, combine them with [`merge`](Query::merge), and compare them
//! through their [`normalize`](Query::normalize)d form.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event::{Event, SortDirection, SortKey, SortOptions};

/// An aggregate constraint inside a query: `(name, id)` with an optional
/// exact version.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct AggregateFilter {
    pub name: String,
    pub id: Uuid,
    /// `None` matches any version of the aggregate.
    pub version: Option<u64>,
}

/// Constraints on the aggregate version of matching events.
///
/// `min`/`max` are inclusive bounds, `exact` is a version set, and `ranges`
/// holds inclusive `(from, to)` pairs; an event matches when it satisfies
/// every populated constraint (any one of `ranges` suffices).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionConstraints {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub exact: Vec<u64>,
    pub ranges: Vec<(u64, u64)>,
}

impl VersionConstraints {
    pub(crate) fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.exact.is_empty() && self.ranges.is_empty()
    }

    pub(crate) fn matches(&self, version: u64) -> bool {
        if self.min.is_some_and(|min| version < min) {
            return false;
        }
        if self.max.is_some_and(|max| version > max) {
            return false;
        }
        if !self.exact.is_empty() && !self.exact.contains(&version) {
            return false;
        }
        if !self.ranges.is_empty()
            && !self
                .ranges
                .iter()
                .any(|&(from, to)| version >= from && version <= to)
        {
            return false;
        }
        true
    }
}

/// Constraints on the time of matching events.
///
/// `after`/`before` are exclusive bounds; `ranges` holds inclusive pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimeConstraints {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub ranges: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl TimeConstraints {
    pub(crate) fn is_empty(&self) -> bool {
        self.after.is_none() && self.before.is_none() && self.ranges.is_empty()
    }

    pub(crate) fn matches(&self, time: DateTime<Utc>) -> bool {
        if self.after.is_some_and(|after| time <= after) {
            return false;
        }
        if self.before.is_some_and(|before| time >= before) {
            return false;
        }
        if !self.ranges.is_empty()
            && !self
                .ranges
                .iter()
                .any(|&(from, to)| time >= from && time <= to)
        {
            return false;
        }
        true
    }
}

/// A declarative event filter.
///
/// All fields start empty; an empty constraint group matches everything,
/// so `Query::new()` matches every event.
///
/// # Examples
///
/// ```
/// use replay_es::event::{SortDirection, SortKey};
/// use replay_es::query::Query;
///
/// let q = Query::new()
///     .with_name("order.placed")
///     .with_aggregate_name("order")
///     .with_min_version(2)
///     .sort_by(SortKey::Time, SortDirection::Asc);
///
/// assert_eq!(q.names(), ["order.placed"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Query {
    names: Vec<String>,
    ids: Vec<Uuid>,
    aggregate_names: Vec<String>,
    aggregate_ids: Vec<Uuid>,
    aggregates: Vec<AggregateFilter>,
    versions: VersionConstraints,
    times: TimeConstraints,
    sortings: Vec<SortOptions>,
}

impl Query {
    /// The query that matches every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to events with the given name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    /// Restrict to events with any of the given names.
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Restrict to the event with the given id.
    pub fn with_event_id(mut self, id: Uuid) -> Self {
        self.ids.push(id);
        self
    }

    /// Restrict to events of aggregates with the given name.
    pub fn with_aggregate_name(mut self, name: impl Into<String>) -> Self {
        self.aggregate_names.push(name.into());
        self
    }

    /// Restrict to events of aggregates with the given instance id.
    pub fn with_aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.push(id);
        self
    }

    /// Restrict to events of the aggregate `(name, id)`, any version.
    pub fn with_aggregate(mut self, name: impl Into<String>, id: Uuid) -> Self {
        self.aggregates.push(AggregateFilter {
            name: name.into(),
            id,
            version: None,
        });
        self
    }

    /// Restrict to the event of aggregate `(name, id)` at exactly `version`.
    pub fn with_aggregate_at(mut self, name: impl Into<String>, id: Uuid, version: u64) -> Self {
        self.aggregates.push(AggregateFilter {
            name: name.into(),
            id,
            version: Some(version),
        });
        self
    }

    /// Require an aggregate version of at least `min`. Combining multiple
    /// `min` bounds keeps the tightest.
    pub fn with_min_version(mut self, min: u64) -> Self {
        self.versions.min = Some(self.versions.min.map_or(min, |v| v.max(min)));
        self
    }

    /// Require an aggregate version of at most `max`. Combining multiple
    /// `max` bounds keeps the tightest.
    pub fn with_max_version(mut self, max: u64) -> Self {
        self.versions.max = Some(self.versions.max.map_or(max, |v| v.min(max)));
        self
    }

    /// Add `version` to the exact-version set.
    pub fn with_version(mut self, version: u64) -> Self {
        self.versions.exact.push(version);
        self
    }

    /// Add an inclusive aggregate-version range.
    pub fn with_version_range(mut self, from: u64, to: u64) -> Self {
        self.versions.ranges.push((from, to));
        self
    }

    /// Require an event time strictly after `time`. Combining multiple
    /// `after` bounds keeps the latest (their intersection).
    pub fn with_after(mut self, time: DateTime<Utc>) -> Self {
        self.times.after = Some(self.times.after.map_or(time, |t| t.max(time)));
        self
    }

    /// Require an event time strictly before `time`. Combining multiple
    /// `before` bounds keeps the earliest.
    pub fn with_before(mut self, time: DateTime<Utc>) -> Self {
        self.times.before = Some(self.times.before.map_or(time, |t| t.min(time)));
        self
    }

    /// Add an inclusive time range.
    pub fn with_time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.times.ranges.push((from, to));
        self
    }

    /// Append a sort directive. Directives apply in insertion order.
    pub fn sort_by(mut self, key: SortKey, direction: SortDirection) -> Self {
        self.sortings.push(SortOptions::new(key, direction));
        self
    }

    /// Append several sort directives.
    pub fn sort_by_multi(mut self, sortings: impl IntoIterator<Item = SortOptions>) -> Self {
        self.sortings.extend(sortings);
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn event_ids(&self) -> &[Uuid] {
        &self.ids
    }

    pub fn aggregate_names(&self) -> &[String] {
        &self.aggregate_names
    }

    pub fn aggregate_ids(&self) -> &[Uuid] {
        &self.aggregate_ids
    }

    pub fn aggregates(&self) -> &[AggregateFilter] {
        &self.aggregates
    }

    pub fn versions(&self) -> &VersionConstraints {
        &self.versions
    }

    pub fn times(&self) -> &TimeConstraints {
        &self.times
    }

    pub fn sortings(&self) -> &[SortOptions] {
        &self.sortings
    }

    /// Merge `other` into `self`.
    ///
    /// Identifier and name sets are unioned, `min`/`max` and `after`/`before`
    /// bounds are intersected, exact/range lists are concatenated, and
    /// `other`'s sort directives are appended after `self`'s (the caller's
    /// query merges last, so its sortings take the lowest priority).
    pub fn merge(mut self, other: Query) -> Self {
        self.names.extend(other.names);
        self.ids.extend(other.ids);
        self.aggregate_names.extend(other.aggregate_names);
        self.aggregate_ids.extend(other.aggregate_ids);
        self.aggregates.extend(other.aggregates);

        if let Some(min) = other.versions.min {
            self = self.with_min_version(min);
        }
        if let Some(max) = other.versions.max {
            self = self.with_max_version(max);
        }
        self.versions.exact.extend(other.versions.exact);
        self.versions.ranges.extend(other.versions.ranges);

        if let Some(after) = other.times.after {
            self = self.with_after(after);
        }
        if let Some(before) = other.times.before {
            self = self.with_before(before);
        }
        self.times.ranges.extend(other.times.ranges);

        self.sortings.extend(other.sortings);
        self
    }

    /// The canonical form: every set sorted and deduplicated.
    ///
    /// Two queries are equivalent exactly when their normalised forms are
    /// equal (and therefore serialise to the same bytes). Sort directives
    /// are order-significant and left untouched.
    pub fn normalize(mut self) -> Self {
        self.names.sort();
        self.names.dedup();
        self.ids.sort();
        self.ids.dedup();
        self.aggregate_names.sort();
        self.aggregate_names.dedup();
        self.aggregate_ids.sort();
        self.aggregate_ids.dedup();
        self.aggregates.sort();
        self.aggregates.dedup();
        self.versions.exact.sort_unstable();
        self.versions.exact.dedup();
        self.versions.ranges.sort_unstable();
        self.versions.ranges.dedup();
        self.times.ranges.sort();
        self.times.ranges.dedup();
        self
    }

    /// Whether `evt` satisfies every populated constraint group.
    pub fn test(&self, evt: &Event) -> bool {
        if !self.names.is_empty() && !self.names.iter().any(|n| n == evt.name()) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&evt.id()) {
            return false;
        }

        let tuple = evt.aggregate();

        if !self.aggregate_names.is_empty() {
            match tuple {
                Some(t) if self.aggregate_names.iter().any(|n| n == &t.name) => {}
                _ => return false,
            }
        }
        if !self.aggregate_ids.is_empty() {
            match tuple {
                Some(t) if self.aggregate_ids.contains(&t.id) => {}
                _ => return false,
            }
        }
        if !self.aggregates.is_empty() {
            match tuple {
                Some(t)
                    if self.aggregates.iter().any(|f| {
                        f.name == t.name
                            && f.id == t.id
                            && f.version.map_or(true, |v| v == t.version)
                    }) => {}
                _ => return false,
            }
        }
        if !self.versions.is_empty() {
            match tuple {
                Some(t) if self.versions.matches(t.version) => {}
                _ => return false,
            }
        }
        if !self.times.is_empty() && !self.times.matches(evt.time()) {
            return false;
        }
        true
    }
}
