//! Page, sort and filter parameters shared by list-style adapter verbs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const DEFAULT_PER_PAGE: u32 = 10;

/// Field filter object as produced by list views (`{"status": "draft", "q": "rust"}`).
pub type Filter = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("page numbers start at 1")]
    ZeroPage,
    #[error("per_page must be greater than zero")]
    ZeroPerPage,
    #[error("unknown sort order `{0}`")]
    UnknownOrder(String),
}

/// One-based page request. Both fields are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPagination")]
pub struct Pagination {
    page: u32,
    per_page: u32,
}

#[derive(Deserialize)]
struct RawPagination {
    page: u32,
    per_page: u32,
}

impl TryFrom<RawPagination> for Pagination {
    type Error = PaginationError;

    fn try_from(raw: RawPagination) -> Result<Self, Self::Error> {
        Self::new(raw.page, raw.per_page)
    }
}

impl Pagination {
    pub fn new(page: u32, per_page: u32) -> Result<Self, PaginationError> {
        if page == 0 {
            return Err(PaginationError::ZeroPage);
        }
        if per_page == 0 {
            return Err(PaginationError::ZeroPerPage);
        }
        Ok(Self { page, per_page })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    /// Zero-based index of the first record on this page.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.per_page as usize
    }

    /// Inclusive zero-based range, the form REST backends expect.
    pub fn range(&self) -> (usize, usize) {
        let start = self.offset();
        (start, start + self.per_page as usize - 1)
    }

    pub fn is_first(&self) -> bool {
        self.page == 1
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = PaginationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortOrder::Asc),
            "DESC" => Ok(SortOrder::Desc),
            _ => Err(PaginationError::UnknownOrder(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

impl Default for Sort {
    fn default() -> Self {
        Self::new("id", SortOrder::Asc)
    }
}
