use serde::{Deserialize, Serialize};

/// State of a streaming import job on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Pending,
    Started,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ImportStatus {
    /// Polling stops once a job reaches one of these
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "Pending",
            ImportStatus::Started => "Started",
            ImportStatus::Running => "Running",
            ImportStatus::Completed => "Completed",
            ImportStatus::Failed => "Failed",
            ImportStatus::Unknown => "Unknown",
        }
    }
}

/// Response of `GET /import/progress/{jobId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub status: ImportStatus,
    #[serde(default)]
    pub processed_messages: u64,
    #[serde(default)]
    pub imported_messages: u64,
    #[serde(default)]
    pub duplicate_messages_final: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl ImportProgress {
    /// One-line summary for status output
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {} processed, {} imported, {} duplicates",
            self.status.display_name(),
            self.processed_messages,
            self.imported_messages,
            self.duplicate_messages_final
        );
        if let Some(ref error) = self.error {
            line.push_str(&format!(" ({})", error));
        }
        line
    }
}
