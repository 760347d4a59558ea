//! Worklist criteria: server-side filter and sort clauses.
//!
//! Criteria are assembled with [`WorklistCriteriaBuilder`] and frozen into a
//! [`WorklistCriteria`]. Both clause lists keep insertion order because the
//! backend evaluates filters left to right and sorts by clause precedence.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A worklist property that can be filtered or sorted on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WcField {
    ProcessFolder,
    ProcessName,
    ProcessFullName,
    ProcessFolio,
    ProcessPriority,
    ProcessStartDate,
    ProcessStatus,
    ActivityName,
    ActivityStartDate,
    WorklistItemStatus,
    /// A named process data field
    ProcessData(String),
}

/// What kind of value a field compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Integer,
    Date,
    Any,
}

impl WcField {
    fn value_kind(&self) -> ValueKind {
        match self {
            WcField::ProcessFolder
            | WcField::ProcessName
            | WcField::ProcessFullName
            | WcField::ProcessFolio
            | WcField::ProcessStatus
            | WcField::ActivityName
            | WcField::WorklistItemStatus => ValueKind::Text,
            WcField::ProcessPriority => ValueKind::Integer,
            WcField::ProcessStartDate | WcField::ActivityStartDate => ValueKind::Date,
            WcField::ProcessData(_) => ValueKind::Any,
        }
    }
}

impl fmt::Display for WcField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcField::ProcessFolder => write!(f, "process_folder"),
            WcField::ProcessName => write!(f, "process_name"),
            WcField::ProcessFullName => write!(f, "process_full_name"),
            WcField::ProcessFolio => write!(f, "process_folio"),
            WcField::ProcessPriority => write!(f, "process_priority"),
            WcField::ProcessStartDate => write!(f, "process_start_date"),
            WcField::ProcessStatus => write!(f, "process_status"),
            WcField::ActivityName => write!(f, "activity_name"),
            WcField::ActivityStartDate => write!(f, "activity_start_date"),
            WcField::WorklistItemStatus => write!(f, "worklist_item_status"),
            WcField::ProcessData(name) => write!(f, "process_data[{}]", name),
        }
    }
}

/// Comparison operator of a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WcCompare {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    /// Text match where `*` matches any run of characters
    Like,
    NotLike,
}

impl WcCompare {
    fn is_pattern(&self) -> bool {
        matches!(self, WcCompare::Like | WcCompare::NotLike)
    }
}

/// Connective joining a filter clause to everything before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WcLogical {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WcSortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Right-hand side of a filter clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CriteriaValue {
    String(String),
    Integer(i64),
    Date(DateTime<Utc>),
}

impl CriteriaValue {
    fn kind(&self) -> ValueKind {
        match self {
            CriteriaValue::String(_) => ValueKind::Text,
            CriteriaValue::Integer(_) => ValueKind::Integer,
            CriteriaValue::Date(_) => ValueKind::Date,
        }
    }
}

impl From<&str> for CriteriaValue {
    fn from(value: &str) -> Self {
        CriteriaValue::String(value.to_string())
    }
}

impl From<String> for CriteriaValue {
    fn from(value: String) -> Self {
        CriteriaValue::String(value)
    }
}

impl From<i64> for CriteriaValue {
    fn from(value: i64) -> Self {
        CriteriaValue::Integer(value)
    }
}

impl From<i32> for CriteriaValue {
    fn from(value: i32) -> Self {
        CriteriaValue::Integer(i64::from(value))
    }
}

impl From<DateTime<Utc>> for CriteriaValue {
    fn from(value: DateTime<Utc>) -> Self {
        CriteriaValue::Date(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    /// `None` only on the first clause
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub connective: Option<WcLogical>,
    pub field: WcField,
    pub compare: WcCompare,
    pub value: CriteriaValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortClause {
    pub field: WcField,
    pub order: WcSortOrder,
}

/// A window over the matching items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub start_index: u32,
    pub page_size: u32,
}

/// Frozen filter and sort specification for a worklist query.
///
/// The default value has no clauses and means "no filtering", which returns
/// the whole worklist. That is the expensive path: callers with large
/// worklists should always filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorklistCriteria {
    #[serde(default)]
    filters: Vec<FilterClause>,
    #[serde(default)]
    sorts: Vec<SortClause>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    paging: Option<Paging>,
}

impl WorklistCriteria {
    pub fn builder() -> WorklistCriteriaBuilder {
        WorklistCriteriaBuilder::new()
    }

    pub fn filters(&self) -> &[FilterClause] {
        &self.filters
    }

    pub fn sorts(&self) -> &[SortClause] {
        &self.sorts
    }

    pub fn paging(&self) -> Option<Paging> {
        self.paging
    }

    /// True when the criteria neither filters, sorts nor pages.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.sorts.is_empty() && self.paging.is_none()
    }

    /// Serialize the criteria the way it is sent to a backend.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse criteria received from a client, re-checking the clause rules.
    pub fn from_wire(wire: &str) -> Result<Self> {
        let parsed: WorklistCriteria = serde_json::from_str(wire)?;
        let mut builder = WorklistCriteriaBuilder::new();
        for clause in parsed.filters {
            builder.add_filter(clause.connective, clause.field, clause.compare, clause.value)?;
        }
        for sort in parsed.sorts {
            builder.add_sort(sort.field, sort.order);
        }
        if let Some(paging) = parsed.paging {
            builder.page(paging.start_index, paging.page_size)?;
        }
        Ok(builder.build())
    }
}

/// Incremental builder for [`WorklistCriteria`].
///
/// ```
/// use worklist::{WcCompare, WcField, WcLogical, WcSortOrder, WorklistCriteria};
///
/// let mut builder = WorklistCriteria::builder();
/// builder
///     .add_filter(None, WcField::ProcessFolder, WcCompare::Equal, "Finance")?
///     .add_filter(Some(WcLogical::And), WcField::ProcessPriority, WcCompare::Equal, 1)?
///     .add_sort(WcField::ProcessStartDate, WcSortOrder::Descending);
/// let criteria = builder.build();
/// assert_eq!(criteria.filters().len(), 2);
/// # Ok::<(), worklist::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct WorklistCriteriaBuilder {
    filters: Vec<FilterClause>,
    sorts: Vec<SortClause>,
    paging: Option<Paging>,
}

impl WorklistCriteriaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter clause.
    ///
    /// The first clause must have no connective and every later clause must
    /// have one. The value has to fit the field: priorities take integers,
    /// dates take dates, pattern comparisons take text.
    pub fn add_filter(
        &mut self,
        connective: Option<WcLogical>,
        field: WcField,
        compare: WcCompare,
        value: impl Into<CriteriaValue>,
    ) -> Result<&mut Self> {
        let value = value.into();

        match (self.filters.is_empty(), connective) {
            (true, Some(c)) => {
                return Err(Error::InvalidInput(format!(
                    "First filter clause cannot have a connective, got {:?}",
                    c
                )));
            }
            (false, None) => {
                return Err(Error::InvalidInput(format!(
                    "Filter clause on {} needs a connective to the previous clause",
                    field
                )));
            }
            _ => {}
        }

        let expected = field.value_kind();
        if expected != ValueKind::Any && expected != value.kind() {
            return Err(Error::InvalidInput(format!(
                "Value {:?} does not fit field {}",
                value, field
            )));
        }
        if compare.is_pattern() && value.kind() != ValueKind::Text {
            return Err(Error::InvalidInput(format!(
                "{:?} needs a text value on field {}",
                compare, field
            )));
        }
        if let WcField::ProcessData(name) = &field {
            if name.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "Process data field name cannot be empty".to_string(),
                ));
            }
        }

        self.filters.push(FilterClause {
            connective,
            field,
            compare,
            value,
        });
        Ok(self)
    }

    /// Append the first filter clause, or an `AND` clause after existing ones.
    pub fn filter(
        &mut self,
        field: WcField,
        compare: WcCompare,
        value: impl Into<CriteriaValue>,
    ) -> Result<&mut Self> {
        let connective = if self.filters.is_empty() {
            None
        } else {
            Some(WcLogical::And)
        };
        self.add_filter(connective, field, compare, value)
    }

    /// Append a sort clause. Earlier clauses take precedence.
    pub fn add_sort(&mut self, field: WcField, order: WcSortOrder) -> &mut Self {
        self.sorts.push(SortClause { field, order });
        self
    }

    /// Restrict the result to `page_size` items starting at `start_index`.
    pub fn page(&mut self, start_index: u32, page_size: u32) -> Result<&mut Self> {
        if page_size == 0 {
            return Err(Error::InvalidInput(
                "Page size must be greater than zero".to_string(),
            ));
        }
        self.paging = Some(Paging {
            start_index,
            page_size,
        });
        Ok(self)
    }

    pub fn build(self) -> WorklistCriteria {
        WorklistCriteria {
            filters: self.filters,
            sorts: self.sorts,
            paging: self.paging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_first_clause_rejects_connective() {
        let mut builder = WorklistCriteria::builder();
        let err = builder
            .add_filter(
                Some(WcLogical::And),
                WcField::ProcessFolder,
                WcCompare::Equal,
                "Finance",
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_later_clause_requires_connective() {
        let mut builder = WorklistCriteria::builder();
        builder
            .add_filter(None, WcField::ProcessFolder, WcCompare::Equal, "Finance")
            .unwrap();
        assert!(
            builder
                .add_filter(None, WcField::ProcessPriority, WcCompare::Equal, 1)
                .is_err()
        );
        // The failed clause was not appended
        assert_eq!(builder.build().filters().len(), 1);
    }

    #[test]
    fn test_value_must_fit_field() {
        let mut builder = WorklistCriteria::builder();
        assert!(
            builder
                .filter(WcField::ProcessPriority, WcCompare::Equal, "high")
                .is_err()
        );
        assert!(
            builder
                .filter(WcField::ProcessStartDate, WcCompare::Greater, 5)
                .is_err()
        );
        assert!(
            builder
                .filter(WcField::ProcessData("Amount".into()), WcCompare::Like, 5)
                .is_err()
        );
        assert!(
            builder
                .filter(WcField::ProcessData("Amount".into()), WcCompare::Greater, 5)
                .is_ok()
        );
    }

    #[test]
    fn test_filter_helper_chains_with_and() {
        let mut builder = WorklistCriteria::builder();
        builder
            .filter(WcField::ProcessFolder, WcCompare::Equal, "Finance")
            .unwrap()
            .filter(WcField::ProcessPriority, WcCompare::Equal, 1)
            .unwrap();
        let criteria = builder.build();
        assert_eq!(criteria.filters()[0].connective, None);
        assert_eq!(criteria.filters()[1].connective, Some(WcLogical::And));
    }

    #[test]
    fn test_wire_form_preserves_clause_order() {
        let fields = [
            WcField::ProcessFolio,
            WcField::ActivityName,
            WcField::ProcessFolder,
            WcField::ProcessName,
            WcField::ProcessFullName,
        ];
        let sorts = [
            (WcField::ProcessPriority, WcSortOrder::Ascending),
            (WcField::ProcessStartDate, WcSortOrder::Descending),
            (WcField::ActivityName, WcSortOrder::Ascending),
        ];

        let mut builder = WorklistCriteria::builder();
        for (i, field) in fields.iter().enumerate() {
            let connective = match i {
                0 => None,
                i if i % 2 == 0 => Some(WcLogical::Or),
                _ => Some(WcLogical::And),
            };
            builder
                .add_filter(connective, field.clone(), WcCompare::Equal, format!("v{i}"))
                .unwrap();
        }
        for (field, order) in sorts.iter() {
            builder.add_sort(field.clone(), *order);
        }
        let criteria = builder.build();

        let wire = criteria.to_wire().unwrap();
        let parsed = WorklistCriteria::from_wire(&wire).unwrap();
        assert_eq!(parsed, criteria);

        let got: Vec<&WcField> = parsed.filters().iter().map(|c| &c.field).collect();
        let want: Vec<&WcField> = fields.iter().collect();
        assert_eq!(got, want);
        let got_sorts: Vec<(WcField, WcSortOrder)> = parsed
            .sorts()
            .iter()
            .map(|s| (s.field.clone(), s.order))
            .collect();
        assert_eq!(got_sorts, sorts.to_vec());

        // Textual order in the wire form matches insertion order too
        let positions: Vec<usize> = (0..fields.len())
            .map(|i| wire.find(&format!("\"v{i}\"")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_from_wire_rejects_bad_connectives() {
        let wire = r#"{"filters":[{"connective":"and","field":"process_folio","compare":"equal","value":{"type":"string","value":"x"}}],"sorts":[]}"#;
        assert!(WorklistCriteria::from_wire(wire).is_err());
    }

    #[test]
    fn test_empty_criteria() {
        let criteria = WorklistCriteria::default();
        assert!(criteria.is_empty());
        assert_eq!(criteria.to_wire().unwrap(), r#"{"filters":[],"sorts":[]}"#);
    }

    #[test]
    fn test_paging() {
        let mut builder = WorklistCriteria::builder();
        assert!(builder.page(0, 0).is_err());
        builder.page(10, 5).unwrap();
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        builder
            .filter(WcField::ActivityStartDate, WcCompare::GreaterOrEqual, date)
            .unwrap();
        let criteria = builder.build();
        assert_eq!(
            criteria.paging(),
            Some(Paging {
                start_index: 10,
                page_size: 5
            })
        );
        assert!(!criteria.is_empty());
    }
}
