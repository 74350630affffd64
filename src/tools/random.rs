//! Random number tool

use super::{no_parameters, Tool, ToolContext};
use crate::error::ToolExecutionError;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

/// Draws a number between 1 and 100 inclusive.
pub struct RandomNumberTool;

#[async_trait]
impl Tool for RandomNumberTool {
    fn name(&self) -> &'static str {
        "get_random_number"
    }

    fn description(&self) -> String {
        "Returns a random number between 1 and 100.".to_string()
    }

    fn parameters(&self) -> Value {
        no_parameters()
    }

    async fn run(&self, _input: Value, _ctx: ToolContext) -> Result<Value, ToolExecutionError> {
        let n: u32 = rand::thread_rng().gen_range(1..=100);
        Ok(json!({ "random_number": n }))
    }
}
