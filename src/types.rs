//! Shared types: broker task, parsed CSV row, import statistics

use serde::{Deserialize, Serialize};

/// One parsed CSV row describing a company.
///
/// All fields are free text, already trimmed by the parser. `category` and
/// `subcategory` hold comma-separated lists; the loader splits them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanyRecord {
    pub name: String,
    pub region: String,
    pub district: String,
    pub city: String,
    pub email: String,
    pub phone: String,
    pub category: String,
    pub subcategory: String,
}

/// Import task published by the upload endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportTask {
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub priority: TaskPriority,
    pub created_at: String,
}

/// Queue tier of an import task. The broker-level message priority travels
/// in the delivery properties, not here; this field is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Normal,
    Large,
}

/// Cumulative import statistics reported by a worker's loader.
///
/// `company` counts first insertions observed by this loader; `category` and
/// `subcategory_companies` count distinct companies holding links of each
/// kind; `subcategory`, `region`, `district` and `city` are dictionary-cache
/// sizes. `errors` is the ordered diagnostics list, including retry notices.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub company: usize,
    pub category: usize,
    pub subcategory: usize,
    pub subcategory_companies: usize,
    pub region: usize,
    pub district: usize,
    pub city: usize,
    pub errors: Vec<String>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_task_decodes_lowercase_priority() {
        let body = r#"{
            "file_path": "/app/storage/csv/companies.csv",
            "file_name": "companies.csv",
            "file_size": 1048576,
            "priority": "high",
            "created_at": "2024-05-01T10:00:00"
        }"#;
        let task: ImportTask = serde_json::from_str(body).unwrap();
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.file_size, 1_048_576);
    }

    #[test]
    fn import_task_rejects_unknown_priority() {
        let body = r#"{"file_path":"a","file_name":"a","file_size":1,"priority":"urgent","created_at":""}"#;
        assert!(serde_json::from_str::<ImportTask>(body).is_err());
    }
}
