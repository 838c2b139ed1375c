//! Fluent query pipeline.
//!
//! A [`Query`] is an ordered list of operations bound to one table. Building
//! it does no I/O; every terminal (`to_vec`, `count`, `sum`, …) fetches the
//! table's live records through the adapter and then applies the operations
//! **in the order they were declared**:
//!
//! ```no_run
//! # use tessera_storage::{Direction, Storage, StorageResult};
//! # async fn run(storage: &Storage) -> StorageResult<()> {
//! let adults_in_paris = storage
//!     .query("users")?
//!     .equals("city", "Paris")
//!     .above("age", 17)
//!     .order_by("age", Direction::Desc)
//!     .page(1, 20)
//!     .to_vec()
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! Successive filters intersect; use [`Query::or`] to combine alternatives.
//! Sorting is stable, so equal elements keep their previous relative order.
//! Out-of-range pagination yields fewer or zero results, never an error.

mod compare;
mod condition;
mod similarity;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::compare::{compare_values, group_key};
pub use self::condition::{Condition, ConditionType, DEFAULT_SEARCH_THRESHOLD};
pub use self::similarity::{levenshtein, ratio, score};
use crate::adapter::StorageAdapter;
use crate::error::{StorageError, StorageResult};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first. The exact reverse of [`Direction::Asc`], so ties
    /// come out in reverse of their stored order.
    Desc,
}

/// A reusable record predicate.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

impl Predicate {
    /// Wrap a closure over whole records.
    pub fn new(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Evaluate against a record.
    #[must_use]
    pub fn test(&self, record: &Value) -> bool {
        (self.0)(record)
    }

    /// Closure over one field; missing fields are passed as `null`.
    pub fn field(
        field: impl Into<String>,
        f: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        let field = field.into();
        Self::new(move |record| f(compare::field(record, &field)))
    }

    /// `field == value`.
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::field(field, move |v| compare_values(v, &value).is_eq())
    }

    /// `field != value`.
    pub fn not_equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::equals(field, value).negate()
    }

    /// `lo <= field <= hi`.
    pub fn between(field: impl Into<String>, lo: impl Into<Value>, hi: impl Into<Value>) -> Self {
        let (lo, hi) = (lo.into(), hi.into());
        Self::field(field, move |v| {
            compare::same_kind(v, &lo)
                && compare_values(v, &lo).is_ge()
                && compare_values(v, &hi).is_le()
        })
    }

    fn bound(
        field: impl Into<String>,
        bound: impl Into<Value>,
        accept: fn(std::cmp::Ordering) -> bool,
    ) -> Self {
        let bound = bound.into();
        Self::field(field, move |v| {
            compare::same_kind(v, &bound) && accept(compare_values(v, &bound))
        })
    }

    /// `field > value`.
    pub fn above(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::bound(field, value, std::cmp::Ordering::is_gt)
    }

    /// `field >= value`.
    pub fn above_or_equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::bound(field, value, std::cmp::Ordering::is_ge)
    }

    /// `field < value`.
    pub fn below(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::bound(field, value, std::cmp::Ordering::is_lt)
    }

    /// `field <= value`.
    pub fn below_or_equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::bound(field, value, std::cmp::Ordering::is_le)
    }

    /// String `field` starts with `prefix`.
    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::field(field, move |v| v.as_str().is_some_and(|s| s.starts_with(&prefix)))
    }

    /// String `field` starts with `prefix`, ignoring case.
    pub fn starts_with_ignore_case(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().to_lowercase();
        Self::field(field, move |v| {
            v.as_str()
                .is_some_and(|s| s.to_lowercase().starts_with(&prefix))
        })
    }

    /// `field` equals one of `values`.
    pub fn any_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(field, move |v| {
            values.iter().any(|c| compare_values(v, c).is_eq())
        })
    }

    /// Logical negation.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::new(move |record| !self.test(record))
    }

    /// True when every predicate holds (and for an empty list).
    pub fn all(predicates: impl IntoIterator<Item = Self>) -> Self {
        let predicates: Vec<Self> = predicates.into_iter().collect();
        Self::new(move |record| predicates.iter().all(|p| p.test(record)))
    }

    /// True when any predicate holds (false for an empty list).
    pub fn any(predicates: impl IntoIterator<Item = Self>) -> Self {
        let predicates: Vec<Self> = predicates.into_iter().collect();
        Self::new(move |record| predicates.iter().any(|p| p.test(record)))
    }
}

type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Clone)]
enum Op {
    Filter(Predicate),
    OrderBy(String, Direction),
    Offset(usize),
    Limit(usize),
    Reverse,
    Modify(Transform),
    Search(String, f64),
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter(_) => f.write_str("Filter"),
            Self::OrderBy(field, dir) => write!(f, "OrderBy({field}, {dir:?})"),
            Self::Offset(n) => write!(f, "Offset({n})"),
            Self::Limit(n) => write!(f, "Limit({n})"),
            Self::Reverse => f.write_str("Reverse"),
            Self::Modify(_) => f.write_str("Modify"),
            Self::Search(q, t) => write!(f, "Search({q:?}, {t})"),
        }
    }
}

impl Op {
    fn apply(&self, mut records: Vec<Value>) -> Vec<Value> {
        match self {
            Self::Filter(p) => records.retain(|r| p.test(r)),
            Self::OrderBy(field, direction) => {
                records.sort_by(|a, b| {
                    compare_values(compare::field(a, field), compare::field(b, field))
                });
                // Descending is the exact mirror of ascending, ties included.
                if *direction == Direction::Desc {
                    records.reverse();
                }
            },
            Self::Offset(n) => {
                records.drain(..(*n).min(records.len()));
            },
            Self::Limit(n) => records.truncate(*n),
            Self::Reverse => records.reverse(),
            Self::Modify(f) => return records.into_iter().map(f.as_ref()).collect(),
            Self::Search(query, threshold) => {
                records.retain(|r| similarity::score(r, query) >= *threshold);
            },
        }
        records
    }
}

/// Records sharing one value of the grouping field.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// The shared field value (`null` when missing).
    pub key: Value,
    /// Records in pipeline order.
    pub values: Vec<Value>,
}

/// A lazily evaluated pipeline over one table.
#[derive(Clone)]
pub struct Query {
    adapter: Arc<dyn StorageAdapter>,
    table: String,
    ops: Vec<Op>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("ops", &self.ops)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Start an empty pipeline over `table`.
    pub fn new(adapter: Arc<dyn StorageAdapter>, table: impl Into<String>) -> Self {
        Self {
            adapter,
            table: table.into(),
            ops: Vec::new(),
        }
    }

    /// Table this pipeline reads.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no operation is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    /// Keep records matching `predicate`.
    #[must_use]
    pub fn matching(self, predicate: Predicate) -> Self {
        self.push(Op::Filter(predicate))
    }

    /// Keep records whose `field` equals `value`.
    #[must_use]
    pub fn equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.matching(Predicate::equals(field, value))
    }

    /// Keep records with `lo <= field <= hi`.
    #[must_use]
    pub fn between(
        self,
        field: impl Into<String>,
        lo: impl Into<Value>,
        hi: impl Into<Value>,
    ) -> Self {
        self.matching(Predicate::between(field, lo, hi))
    }

    /// Keep records with `field > value`.
    #[must_use]
    pub fn above(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.matching(Predicate::above(field, value))
    }

    /// Keep records with `field < value`.
    #[must_use]
    pub fn below(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.matching(Predicate::below(field, value))
    }

    /// Keep records whose `field` equals one of `values`.
    #[must_use]
    pub fn any_of(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.matching(Predicate::any_of(field, values))
    }

    /// Keep records whose string `field` starts with `prefix`.
    #[must_use]
    pub fn starts_with(self, field: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.matching(Predicate::starts_with(field, prefix))
    }

    /// Keep records whose string `field` starts with `prefix`, ignoring case.
    #[must_use]
    pub fn starts_with_ignore_case(
        self,
        field: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        self.matching(Predicate::starts_with_ignore_case(field, prefix))
    }

    /// Keep records whose `field` value satisfies `f` (`null` when missing).
    #[must_use]
    pub fn where_field(
        self,
        field: impl Into<String>,
        f: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.matching(Predicate::field(field, f))
    }

    /// Keep records satisfying `f`.
    #[must_use]
    pub fn filter(self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.matching(Predicate::new(f))
    }

    /// Drop records matching `predicate`.
    #[must_use]
    pub fn not(self, predicate: Predicate) -> Self {
        self.matching(predicate.negate())
    }

    /// Keep records matching every predicate.
    #[must_use]
    pub fn and(self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.matching(Predicate::all(predicates))
    }

    /// Keep records matching at least one predicate.
    #[must_use]
    pub fn or(self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.matching(Predicate::any(predicates))
    }

    /// Stable sort by `field`.
    #[must_use]
    pub fn order_by(self, field: impl Into<String>, direction: Direction) -> Self {
        self.push(Op::OrderBy(field.into(), direction))
    }

    /// Keep at most `n` records.
    #[must_use]
    pub fn limit(self, n: usize) -> Self {
        self.push(Op::Limit(n))
    }

    /// Skip the first `n` records.
    #[must_use]
    pub fn offset(self, n: usize) -> Self {
        self.push(Op::Offset(n))
    }

    /// Keep page `page_number` (1-based) of `page_size` records.
    ///
    /// Page 0 is empty.
    #[must_use]
    pub fn page(self, page_number: usize, page_size: usize) -> Self {
        let Some(before) = page_number.checked_sub(1) else {
            return self.limit(0);
        };
        self.offset(before.saturating_mul(page_size)).limit(page_size)
    }

    /// Reverse the current order.
    #[must_use]
    pub fn reverse(self) -> Self {
        self.push(Op::Reverse)
    }

    /// Transform every record. Results are not written back.
    #[must_use]
    pub fn modify(self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.push(Op::Modify(Arc::new(f)))
    }

    /// Keep records whose text scores at least `threshold` against `query`.
    #[must_use]
    pub fn search(self, query: impl Into<String>, threshold: f64) -> Self {
        self.push(Op::Search(query.into(), threshold))
    }

    /// Append one operation per condition.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidQuery`] if an operand has the wrong
    /// shape for its condition type.
    pub fn build(self, conditions: impl IntoIterator<Item = Condition>) -> StorageResult<Self> {
        conditions.into_iter().try_fold(self, |query, c| {
            let field = c.field.clone();
            Ok(match c.kind {
                ConditionType::Equals => query.equals(field, c.value),
                ConditionType::NotEqual => query.matching(Predicate::not_equal(field, c.value)),
                ConditionType::Between => {
                    let (lo, hi) = c.range()?;
                    query.between(field, lo, hi)
                },
                ConditionType::StartsWith => query.starts_with(field, c.text()?),
                ConditionType::StartsWithIgnoreCase => {
                    query.starts_with_ignore_case(field, c.text()?)
                },
                ConditionType::Above => query.above(field, c.value),
                ConditionType::AboveOrEqual => {
                    query.matching(Predicate::above_or_equal(field, c.value))
                },
                ConditionType::Below => query.below(field, c.value),
                ConditionType::BelowOrEqual => {
                    query.matching(Predicate::below_or_equal(field, c.value))
                },
                ConditionType::AnyOf => query.any_of(field, c.candidates()?),
                ConditionType::Search => {
                    let (text, threshold) = c.search()?;
                    query.search(text, threshold)
                },
            })
        })
    }

    /// Drop every queued operation.
    #[must_use]
    pub fn reset(mut self) -> Self {
        self.ops.clear();
        self
    }

    /// Run the pipeline over an already materialized record set.
    #[must_use]
    pub fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        self.ops.iter().fold(records, |records, op| op.apply(records))
    }

    /// Fetch live records and run the pipeline.
    ///
    /// # Errors
    ///
    /// Returns any error from the adapter.
    pub async fn to_vec(&self) -> StorageResult<Vec<Value>> {
        let records = self.adapter.get_all(&self.table).await?;
        Ok(self.apply(records))
    }

    /// Number of resulting records.
    ///
    /// # Errors
    ///
    /// Returns any error from the adapter.
    pub async fn count(&self) -> StorageResult<usize> {
        Ok(self.to_vec().await?.len())
    }

    /// First resulting record.
    ///
    /// # Errors
    ///
    /// Returns any error from the adapter.
    pub async fn first(&self) -> StorageResult<Option<Value>> {
        Ok(self.to_vec().await?.into_iter().next())
    }

    /// Last resulting record.
    ///
    /// # Errors
    ///
    /// Returns any error from the adapter.
    pub async fn last(&self) -> StorageResult<Option<Value>> {
        Ok(self.to_vec().await?.pop())
    }

    async fn numbers(&self, field: &str) -> StorageResult<Vec<f64>> {
        let records = self.to_vec().await?;
        let mut numbers = Vec::with_capacity(records.len());
        for record in &records {
            match compare::as_number(compare::field(record, field)) {
                Ok(Some(n)) => numbers.push(n),
                Ok(None) => {},
                Err(kind) => {
                    return Err(StorageError::Aggregate {
                        field: field.to_owned(),
                        reason: format!("expected a number, found {kind}"),
                    });
                },
            }
        }
        Ok(numbers)
    }

    /// Smallest numeric value of `field`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Aggregate`] if a record holds a non-numeric
    /// value in `field`.
    pub async fn min(&self, field: &str) -> StorageResult<Option<f64>> {
        Ok(self.numbers(field).await?.into_iter().reduce(f64::min))
    }

    /// Largest numeric value of `field`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Aggregate`] if a record holds a non-numeric
    /// value in `field`.
    pub async fn max(&self, field: &str) -> StorageResult<Option<f64>> {
        Ok(self.numbers(field).await?.into_iter().reduce(f64::max))
    }

    /// Sum of `field`; 0 when no record has a value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Aggregate`] if a record holds a non-numeric
    /// value in `field`.
    pub async fn sum(&self, field: &str) -> StorageResult<f64> {
        Ok(self.numbers(field).await?.into_iter().sum())
    }

    /// Mean of `field` over records that have a value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Aggregate`] if a record holds a non-numeric
    /// value in `field`.
    #[allow(clippy::cast_precision_loss)]
    pub async fn average(&self, field: &str) -> StorageResult<Option<f64>> {
        let numbers = self.numbers(field).await?;
        if numbers.is_empty() {
            return Ok(None);
        }
        Ok(Some(numbers.iter().sum::<f64>() / numbers.len() as f64))
    }

    /// Records grouped by the textual value of `field`.
    ///
    /// Groups come back sorted by that text, not in the order their first
    /// record appears; use [`to_grouped`](Self::to_grouped) for that. Records
    /// inside a group keep pipeline order.
    ///
    /// # Errors
    ///
    /// Returns any error from the adapter.
    pub async fn group_by(&self, field: &str) -> StorageResult<BTreeMap<String, Vec<Value>>> {
        let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for record in self.to_vec().await? {
            let key = group_key(compare::field(&record, field));
            groups.entry(key).or_default().push(record);
        }
        Ok(groups)
    }

    /// Records grouped by `field`, groups in first-appearance order.
    ///
    /// # Errors
    ///
    /// Returns any error from the adapter.
    pub async fn to_grouped(&self, field: &str) -> StorageResult<Vec<Group>> {
        let mut groups: Vec<Group> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for record in self.to_vec().await? {
            let key = compare::field(&record, field).clone();
            let slot = *positions.entry(key.to_string()).or_insert_with(|| {
                groups.push(Group {
                    key,
                    values: Vec::new(),
                });
                groups.len().saturating_sub(1)
            });
            if let Some(group) = groups.get_mut(slot) {
                group.values.push(record);
            }
        }
        Ok(groups)
    }
}
