//! Cursor pagination planning for journal listings.
//!
//! [`plan_page`] turns a [`PageRequest`] into the SQL fragments and
//! parameters for one page; [`PagePlan::finish`] turns the fetched rows back
//! into a page in nominal sort order. Neither touches the database.
//!
//! The comparison against the cursor is driven only by [`CursorDir`]; the
//! `descending` flag only affects `ORDER BY`. A `cursor_reverse` request
//! (fetching the page before the cursor) inverts the sort so the rows nearest
//! the cursor come first, then reverses the fetched slice.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::Value;

use crate::error::StoreError;

/// Page size used when the request does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a single request may return.
pub const MAX_PAGE_SIZE: usize = 200;

/// Direction of the cursor bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDir {
    /// `seq > cursor`.
    Forward,
    /// `seq < cursor`.
    Backward,
}

impl CursorDir {
    /// Wire form: `fwd` or `bwd`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "fwd",
            Self::Backward => "bwd",
        }
    }

    const fn operator(self) -> &'static str {
        match self {
            Self::Forward => ">",
            Self::Backward => "<",
        }
    }
}

impl fmt::Display for CursorDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CursorDir {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fwd" => Ok(Self::Forward),
            "bwd" => Ok(Self::Backward),
            other => Err(StoreError::validation(format!(
                "cursor direction must be fwd or bwd, got {other:?}"
            ))),
        }
    }
}

/// Position a page continues from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub seq: u64,
    pub dir: CursorDir,
}

/// Additional SQL predicate narrowing a listing, with positional `?`
/// parameters.
///
/// The clause is trusted caller SQL over `events` columns, e.g.
/// `session_id = ?`.
#[derive(Debug, Clone, PartialEq)]
pub struct PageFilter {
    pub clause: String,
    pub params: Vec<Value>,
}

impl PageFilter {
    /// Creates a filter.
    #[must_use]
    pub fn new(clause: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            clause: clause.into(),
            params,
        }
    }

    /// Filter on `session_id`.
    #[must_use]
    pub fn session(session_id: &str) -> Self {
        Self::new("session_id = ?", vec![Value::Text(session_id.to_string())])
    }
}

/// A request for one page of a campaign's events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRequest {
    pub campaign_id: String,
    /// Only events with `seq > after_seq` are considered (0 = no floor).
    pub after_seq: u64,
    /// Clamped to `[1, MAX_PAGE_SIZE]`; 0 selects [`DEFAULT_PAGE_SIZE`].
    pub page_size: usize,
    pub cursor: Option<PageCursor>,
    /// Fetch the page on the near side of the cursor ("previous page").
    pub cursor_reverse: bool,
    pub descending: bool,
    pub filter: Option<PageFilter>,
}

impl PageRequest {
    /// A first-page request for `campaign_id` with default settings.
    #[must_use]
    pub fn new(campaign_id: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            ..Self::default()
        }
    }
}

/// SQL fragments for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PagePlan {
    /// `WHERE` body for the page query, including the cursor bound.
    pub where_clause: String,
    pub params: Vec<Value>,
    /// `WHERE` body for the total count (no cursor bound).
    pub count_where_clause: String,
    pub count_params: Vec<Value>,
    /// `ORDER BY` body.
    pub order_by: &'static str,
    /// Rows to fetch: one more than the page size.
    pub limit: usize,
    pub page_size: usize,
    pub reverse_results: bool,
    pub cursor_supplied: bool,
}

/// Rows of one page, in nominal sort order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

/// Clamps a requested page size to `[1, MAX_PAGE_SIZE]`, mapping 0 to the
/// default.
#[must_use]
pub fn clamp_page_size(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    }
}

/// Plans the queries for `request`.
pub fn plan_page(request: &PageRequest) -> Result<PagePlan, StoreError> {
    let campaign_id = request.campaign_id.trim();
    if campaign_id.is_empty() {
        return Err(StoreError::validation("campaign id is required"));
    }

    let mut conditions = vec!["campaign_id = ?".to_string()];
    let mut params = vec![Value::Text(campaign_id.to_string())];

    if request.after_seq > 0 {
        conditions.push("seq > ?".to_string());
        params.push(seq_value(request.after_seq)?);
    }

    if let Some(filter) = &request.filter {
        let clause = filter.clause.trim();
        if clause.is_empty() {
            return Err(StoreError::validation("page filter clause is empty"));
        }
        let placeholders = clause.matches('?').count();
        if placeholders != filter.params.len() {
            return Err(StoreError::validation(format!(
                "page filter has {placeholders} placeholders but {} params",
                filter.params.len()
            )));
        }
        conditions.push(format!("({clause})"));
        params.extend(filter.params.iter().cloned());
    }

    let count_where_clause = conditions.join(" AND ");
    let count_params = params.clone();

    if let Some(cursor) = request.cursor {
        conditions.push(format!("seq {} ?", cursor.dir.operator()));
        params.push(seq_value(cursor.seq)?);
    }

    let fetch_descending = request.descending != request.cursor_reverse;
    let page_size = clamp_page_size(request.page_size);

    Ok(PagePlan {
        where_clause: conditions.join(" AND "),
        params,
        count_where_clause,
        count_params,
        order_by: if fetch_descending {
            "seq DESC"
        } else {
            "seq ASC"
        },
        limit: page_size + 1,
        page_size,
        reverse_results: request.cursor_reverse,
        cursor_supplied: request.cursor.is_some(),
    })
}

fn seq_value(seq: u64) -> Result<Value, StoreError> {
    i64::try_from(seq)
        .map(Value::Integer)
        .map_err(|_| StoreError::validation(format!("sequence {seq} out of range")))
}

impl PagePlan {
    /// Trims the look-ahead row, restores nominal order and computes the
    /// navigation flags.
    #[must_use]
    pub fn finish<T>(&self, mut rows: Vec<T>, total_count: u64) -> Page<T> {
        let found_extra = rows.len() > self.page_size;
        rows.truncate(self.page_size);

        let (has_next_page, has_prev_page) = if self.reverse_results {
            rows.reverse();
            (self.cursor_supplied, found_extra)
        } else {
            (found_extra, self.cursor_supplied)
        };

        Page {
            items: rows,
            total_count,
            has_next_page,
            has_prev_page,
        }
    }
}
