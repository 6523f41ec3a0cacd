//! Component D: the send engine. Implements the batch-window protocol —
//! claim, select, format, invoke, optional cleanup — with the store's
//! unique constraints as the only mutual-exclusion mechanism.

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::format::invoker::CliInvoker;
use crate::format::format_transactions;
use crate::models::{SendResult, SendStatus};
use crate::store::AllocationStore;

pub struct SendEngine {
    store: Arc<dyn AllocationStore>,
    invoker: Arc<dyn CliInvoker>,
    output_dir: std::path::PathBuf,
    file_cleanup_enabled: bool,
}

impl SendEngine {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        invoker: Arc<dyn CliInvoker>,
        output_dir: impl Into<std::path::PathBuf>,
        file_cleanup_enabled: bool,
    ) -> Self {
        Self {
            store,
            invoker,
            output_dir: output_dir.into(),
            file_cleanup_enabled,
        }
    }

    /// Returns `Err(PipelineError::WindowContended)` for a `Conflict`
    /// outcome; every other outcome (`empty`, `success`, `error`) is
    /// returned as `Ok(SendResult)`.
    pub async fn send_batch(&self) -> Result<SendResult, PipelineError> {
        let (prev, now) = match self.store.try_claim_batch_window().await {
            Ok(window) => window,
            Err(PipelineError::WindowContended) => return Err(PipelineError::WindowContended),
            Err(e) => return Err(e),
        };
        info!(?prev, ?now, "claimed batch window");

        let selection = match self.store.select_for_window(prev, now).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to select allocations for claimed window");
                return Ok(SendResult {
                    processed: 0,
                    file_name: String::new(),
                    status: SendStatus::Error,
                    message: e.to_string(),
                });
            }
        };

        if selection.is_empty() {
            return Ok(SendResult {
                processed: 0,
                file_name: String::new(),
                status: SendStatus::Empty,
                message: "no allocations ready in this window".to_string(),
            });
        }

        let file_name = format!("transactions_{}.csv", now.format("%Y%m%d_%H%M%S"));
        let file_path = self.output_dir.join(&file_name);
        let csv_body = format_transactions(&selection);

        if let Err(e) = tokio::fs::create_dir_all(&self.output_dir).await {
            warn!(error = %e, "failed to create output directory");
            return Ok(SendResult {
                processed: selection.len(),
                file_name,
                status: SendStatus::Error,
                message: format!("failed to create output directory: {e}"),
            });
        }
        if let Err(e) = tokio::fs::write(&file_path, csv_body).await {
            warn!(error = %e, "failed to write transaction file");
            return Ok(SendResult {
                processed: selection.len(),
                file_name,
                status: SendStatus::Error,
                message: format!("failed to write transaction file: {e}"),
            });
        }

        let output_dir_str = self.output_dir.to_string_lossy().to_string();
        if let Err(e) = self.invoker.invoke(&file_name, &output_dir_str).await {
            warn!(error = %e, "cli invocation failed");
            return Ok(SendResult {
                processed: selection.len(),
                file_name,
                status: SendStatus::Error,
                message: e.to_string(),
            });
        }

        if self.file_cleanup_enabled {
            if let Err(e) = tokio::fs::remove_file(&file_path).await {
                warn!(error = %e, file = %file_path.display(), "failed to clean up transaction file");
            }
        }

        info!(processed = selection.len(), %file_name, "batch sent successfully");
        Ok(SendResult {
            processed: selection.len(),
            file_name,
            status: SendStatus::Success,
            message: "ok".to_string(),
        })
    }
}
