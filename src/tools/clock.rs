//! Current time tool

use super::{no_parameters, Tool, ToolContext};
use crate::error::ToolExecutionError;
use async_trait::async_trait;
use serde_json::{json, Value};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reports the local wall-clock time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &'static str {
        "get_current_time"
    }

    fn description(&self) -> String {
        "Returns the current time.".to_string()
    }

    fn parameters(&self) -> Value {
        no_parameters()
    }

    async fn run(&self, _input: Value, _ctx: ToolContext) -> Result<Value, ToolExecutionError> {
        let now = chrono::Local::now().format(TIME_FORMAT).to_string();
        Ok(json!({ "current_time": now }))
    }
}
