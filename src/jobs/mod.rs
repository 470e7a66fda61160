pub mod scheduler;
pub mod token_refresh;

use crate::error::AppError;
use async_trait::async_trait;
use std::time::Duration;

pub use scheduler::JobScheduler;
pub use token_refresh::{RefreshError, RefreshGrantClient, TokenRefreshJob};

/// Result of job execution
#[derive(Debug, Clone)]
pub struct JobResult {
    pub success: bool,
    pub message: String,
    pub items_processed: u64,
}

impl JobResult {
    pub fn success_with_count(count: u64) -> Self {
        Self {
            success: true,
            message: format!("Successfully processed {count} items"),
            items_processed: count,
        }
    }

    pub fn success() -> Self {
        Self {
            success: true,
            message: "Job completed successfully".to_string(),
            items_processed: 0,
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
            items_processed: 0,
        }
    }
}

/// Trait for executable jobs
#[async_trait]
pub trait Job: Send + Sync {
    /// Get the job name for logging and identification
    fn name(&self) -> &str;

    /// Time between the end of one run and the start of the next
    fn interval(&self) -> Duration;

    /// Execute the job and return the result
    async fn execute(&self) -> Result<JobResult, AppError>;
}
