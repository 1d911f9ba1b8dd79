use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod mock;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),
    #[error("Tool execution was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool
    pub fn register_tool(&mut self, tool: Tool) {
        self.tools.push(tool);
    }

    /// Get available tools
    pub fn get_tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Find a tool by name
    pub fn find_tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name.clone()).collect()
    }

    /// Execute a registered tool with cancellation support
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel_token: CancellationToken,
    ) -> Result<String, ToolError> {
        if cancel_token.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        if self.find_tool(name).is_none() {
            return Err(ToolError::NotFound(format!("Tool '{}' not found", name)));
        }

        log::info!("🔧 Running tool {} with {}", name, arguments);
        let result = tokio::select! {
            result = dispatch(name, arguments) => result,
            _ = cancel_token.cancelled() => Err(ToolError::Cancelled),
        };
        match &result {
            Ok(output) => log::debug!("🔧 {} -> {}", name, output),
            Err(e) => log::warn!("🔧 {} failed: {}", name, e),
        }
        result
    }

    /// Get tool definitions for LLM function calling
    pub fn get_tool_definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    }
                })
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(name: &str, arguments: Value) -> Result<String, ToolError> {
    match name {
        "get_random_number" => mock::get_random_number(arguments).await,
        "calculate_fibonacci" => mock::calculate_fibonacci(arguments).await,
        "get_weather" => mock::get_weather(arguments).await,
        _ => Err(ToolError::NotFound(format!("Tool '{}' has no implementation", name))),
    }
}

/// Initialize the default tool registry with the demo tools
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register_tool(Tool {
        name: "get_random_number".to_string(),
        description: "Get a random number between 1 and 100".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
    });

    registry.register_tool(Tool {
        name: "calculate_fibonacci".to_string(),
        description: "Calculate the nth Fibonacci number (n from 1 to 20)".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "n": {
                    "type": "integer",
                    "description": "Position in the Fibonacci sequence, 1 to 20"
                }
            },
            "required": ["n"]
        }),
    });

    registry.register_tool(Tool {
        name: "get_weather".to_string(),
        description: "Get the current weather for a city".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "city": {
                    "type": "string",
                    "description": "City to get the weather for"
                }
            },
            "required": ["city"]
        }),
    });

    registry
}
