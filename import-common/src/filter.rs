use thiserror::Error;
use uuid::Uuid;

use crate::model::JobStatus;

const HRID_FIELD: &str = "hrid";
const FILE_NAME_FIELD: &str = "file_name";

/// Fields the audit query surface may sort job listings by.
const SORTABLE_FIELDS: &[&str] = &[
    "completed_date",
    "started_date",
    "progress_total",
    "status",
    "hrid",
    "file_name",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is not a sortable field")]
    InvalidSortField(String),
    #[error("{0} is not a valid sort order, expected asc or desc")]
    InvalidSortOrder(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A validated sort criterion for the job listing, e.g. `completed_date DESC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    field: &'static str,
    order: SortOrder,
}

impl SortField {
    pub fn new(field: &str, order: SortOrder) -> Result<Self, ValidationError> {
        let field = SORTABLE_FIELDS
            .iter()
            .find(|allowed| **allowed == field)
            .ok_or_else(|| ValidationError::InvalidSortField(field.to_owned()))?;

        Ok(Self { field, order })
    }

    /// Parses the `field,order` form the query surface receives.
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let (field, order) = expression
            .split_once(',')
            .ok_or_else(|| ValidationError::InvalidSortOrder(expression.to_owned()))?;
        let order = match order {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            invalid => return Err(ValidationError::InvalidSortOrder(invalid.to_owned())),
        };
        Self::new(field, order)
    }
}

impl std::fmt::Display for SortField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let order = match self.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        write!(f, "{} {}", self.field, order)
    }
}

/// Selection criteria for the job listing. `*` wildcards in the hrid and
/// file-name patterns translate to SQL LIKE wildcards; when both patterns are
/// present a job matching either one is selected.
#[derive(Debug, Clone, Default)]
pub struct JobExecutionFilter {
    status_any: Vec<JobStatus>,
    profile_id_not_any: Vec<Uuid>,
    status_not: Option<JobStatus>,
    hrid_pattern: Option<String>,
    file_name_pattern: Option<String>,
}

impl JobExecutionFilter {
    pub fn with_status_any(mut self, status_any: Vec<JobStatus>) -> Self {
        self.status_any = status_any;
        self
    }

    pub fn with_profile_id_not_any(mut self, profile_id_not_any: Vec<Uuid>) -> Self {
        self.profile_id_not_any = profile_id_not_any;
        self
    }

    pub fn with_status_not(mut self, status_not: JobStatus) -> Self {
        self.status_not = Some(status_not);
        self
    }

    pub fn with_hrid_pattern(mut self, pattern: &str) -> Self {
        self.hrid_pattern = Some(pattern.to_owned());
        self
    }

    pub fn with_file_name_pattern(mut self, pattern: &str) -> Self {
        self.file_name_pattern = Some(pattern.to_owned());
        self
    }

    pub fn build_where_clause(&self) -> String {
        let mut condition = String::from("TRUE");

        if !self.status_any.is_empty() {
            let statuses = self
                .status_any
                .iter()
                .map(|status| format!("'{status}'"))
                .collect::<Vec<_>>()
                .join(", ");
            condition.push_str(&format!(" AND status IN ({statuses})"));
        }

        if !self.profile_id_not_any.is_empty() {
            let profile_ids = self
                .profile_id_not_any
                .iter()
                .map(|id| format!("'{id}'"))
                .collect::<Vec<_>>()
                .join(", ");
            condition.push_str(&format!(" AND job_profile_id NOT IN ({profile_ids})"));
        }

        if let Some(status_not) = self.status_not {
            condition.push_str(&format!(" AND status <> '{status_not}'"));
        }

        match (&self.hrid_pattern, &self.file_name_pattern) {
            (Some(hrid), Some(file_name)) => {
                condition.push_str(&format!(
                    " AND ({} OR {})",
                    like_condition(HRID_FIELD, hrid),
                    like_condition(FILE_NAME_FIELD, file_name)
                ));
            }
            (Some(hrid), None) => {
                condition.push_str(&format!(" AND {}", like_condition(HRID_FIELD, hrid)));
            }
            (None, Some(file_name)) => {
                condition.push_str(&format!(
                    " AND {}",
                    like_condition(FILE_NAME_FIELD, file_name)
                ));
            }
            (None, None) => {}
        }

        condition
    }
}

fn like_condition(column: &str, pattern: &str) -> String {
    // Patterns are user input: escape quotes and the LIKE metacharacters
    // before translating the `*` wildcard, so a literal `%` or `_` in a
    // pattern matches itself.
    let prepared = pattern
        .replace('\\', "\\\\")
        .replace('\'', "''")
        .replace('%', "\\%")
        .replace('_', "\\_")
        .replace('*', "%");
    format!("{column}::text LIKE '{prepared}'")
}
