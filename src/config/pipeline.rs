//! Configuration of the pipeline core: worker naming, stage naming and the
//! size of the unhandled-failure history.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    /// Prefix of the two worker thread names (`{prefix}-pipeline`,
    /// `{prefix}-callback`). Kept short so the full name fits the 15 byte
    /// thread name limit on Linux.
    #[validate(length(min = 1, max = 8, message = "Thread name prefix must be 1 to 8 characters"))]
    pub thread_name_prefix: String,

    /// Name of the protocol stage as it appears in log lines.
    #[validate(length(min = 1, message = "Stage name must not be empty"))]
    pub stage_name: String,

    /// How many unhandled background failures are remembered for inspection.
    #[validate(range(min = 1, max = 1024))]
    pub unhandled_history: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "hubpipe".to_string(),
            stage_name: "MQTTClientStage".to_string(),
            unhandled_history: 64,
        }
    }
}
