//! MCP server implementation using rmcp.
//!
//! Exposes the bridge to an agent: raw script execution, catalog operations,
//! the catalog listing and a host liveness probe. Every call goes through the
//! gateway, so tool invocations are serialized onto the single channel slot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::catalog;
use crate::config::{Config, TransportKind};
use crate::envelope::Response;
use crate::error::BridgeError;
use crate::gateway::Gateway;
use crate::transport::{FileGatewayChannel, GatewayChannel, HttpGatewayChannel};

/// Extra time the HTTP client allows beyond the gateway's own deadline.
const HTTP_GRACE: Duration = Duration::from_secs(1);

/// MCP server in front of the request gateway.
#[derive(Clone)]
pub struct BridgeServer {
    gateway: Arc<Gateway>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute_code tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    /// Rhai source run inside the host. Assign `result` to return a value.
    #[schemars(
        description = "Rhai script run inside the CAD host. Bindings: app, root, ui, point3d(x,y,z), vector3d(x,y,z). Assign `result` to return a value."
    )]
    pub code: String,
}

/// Parameters for the run_operation tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunOperationParams {
    /// Catalog operation name (see list_operations).
    #[schemars(description = "Catalog operation name, e.g. 'create_cube' (see list_operations)")]
    pub operation: String,

    /// Operation parameters as a JSON object.
    #[schemars(description = "Operation parameters as a JSON object")]
    #[serde(default)]
    pub parameters: Value,
}

/// Map a gateway outcome onto a tool result.
fn tool_result(result: Result<Response, BridgeError>) -> Result<CallToolResult, McpError> {
    let response = match result {
        Ok(response) => response,
        Err(BridgeError::MalformedCommand(msg)) => return Err(McpError::invalid_params(msg, None)),
        Err(e) => {
            error!(error = %e, "Command was not delivered");
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "{}: {}",
                e.kind(),
                e.message()
            ))]));
        }
    };

    if let Some(err) = response.error {
        return Ok(CallToolResult::error(vec![Content::text(format!(
            "{}: {}",
            err.kind, err.message
        ))]));
    }
    let text = match response.value {
        None | Some(Value::Null) => "ok".to_string(),
        Some(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
    };
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

#[tool_router]
impl BridgeServer {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
            tool_router: Self::tool_router(),
        }
    }

    /// Run arbitrary script source inside the host.
    #[tool(description = "Execute a Rhai script inside the CAD host and return the value assigned to `result`")]
    async fn execute_code(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(code_len = params.code.len(), "Executing code");
        tool_result(self.gateway.execute_code(params.code).await)
    }

    /// Run one catalog operation.
    #[tool(description = "Run a named CAD operation from the catalog (shapes, selection, fillet, move, rotate, boolean, undo/redo)")]
    async fn run_operation(
        &self,
        Parameters(params): Parameters<RunOperationParams>,
    ) -> Result<CallToolResult, McpError> {
        let parameters = match params.parameters {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(McpError::invalid_params(
                    format!("parameters must be a JSON object, got {other}"),
                    None,
                ))
            }
        };
        info!(operation = %params.operation, "Running operation");
        tool_result(self.gateway.run_operation(params.operation, parameters).await)
    }

    /// Describe the catalog.
    #[tool(description = "List the catalog operations with their parameter schemas")]
    async fn list_operations(&self) -> Result<CallToolResult, McpError> {
        let listing: Vec<Value> = catalog::operations()
            .iter()
            .map(|op| {
                json!({
                    "name": op.name,
                    "description": op.description,
                    "input_schema": op.input_schema(),
                })
            })
            .collect();
        let text = serde_json::to_string_pretty(&listing)
            .map_err(|e| McpError::internal_error(format!("failed to encode catalog: {e}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Liveness of the host behind the channel.
    #[tool(description = "Report whether the CAD host is reachable and whether a command is in flight")]
    async fn host_status(&self) -> Result<CallToolResult, McpError> {
        let status = self.gateway.status().await;
        let text = serde_json::to_string_pretty(&status)
            .map_err(|e| McpError::internal_error(format!("failed to encode status: {e}"), None))?;
        if status.available {
            Ok(CallToolResult::success(vec![Content::text(text)]))
        } else {
            Ok(CallToolResult::error(vec![Content::text(text)]))
        }
    }
}

#[tool_handler]
impl ServerHandler for BridgeServer {
    fn get_info(&self) -> ServerInfo {
        let operations: Vec<_> = catalog::operations().iter().map(|op| op.name).collect();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "cad-mcp-bridge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Drive a running CAD host. Commands run one at a time on the host's thread.\n\
                 \n\
                 - execute_code: Rhai script with bindings app, root, ui, point3d, vector3d; \
                 assign `result` to return a value\n\
                 - run_operation: one of {operations:?}\n\
                 - list_operations: parameter schemas for the catalog\n\
                 - host_status: check the host is reachable\n\
                 \n\
                 Calls time out after {}ms; a timed-out command may still complete on the host.",
                self.gateway.timeout().as_millis()
            )),
        }
    }
}

/// Build the gateway and its channel from configuration.
pub fn gateway_from_config(config: &Config) -> anyhow::Result<Gateway> {
    let channel: Arc<dyn GatewayChannel> = match config.transport {
        TransportKind::File => Arc::new(FileGatewayChannel::new(config.file_paths())),
        TransportKind::Http => Arc::new(
            HttpGatewayChannel::new(&config.endpoint, config.timeout() + HTTP_GRACE)
                .context("Failed to create HTTP channel")?,
        ),
    };
    Ok(Gateway::new(channel, config.poll_interval(), config.timeout()))
}

/// Serve the bridge over stdio.
pub async fn serve_stdio(config: Config) -> anyhow::Result<()> {
    let server = BridgeServer::new(gateway_from_config(&config)?);

    info!(transport = ?config.transport, "Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Command, CommandKind};
    use crate::error::ErrorKind;
    use crate::transport::HostStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every command from a fixed function, like a host that never waits.
    struct MockChannel {
        answer: fn(&Command) -> Response,
        pending: Mutex<Option<Response>>,
    }

    #[async_trait]
    impl GatewayChannel for MockChannel {
        async fn write_command(&self, command: &Command) -> Result<bool, BridgeError> {
            *self.pending.lock().unwrap() = Some((self.answer)(command));
            Ok(true)
        }

        async fn try_read_response(&self) -> Result<Option<Response>, BridgeError> {
            Ok(self.pending.lock().unwrap().take())
        }

        async fn probe(&self) -> HostStatus {
            HostStatus {
                transport: "mock",
                available: true,
                busy: Some(false),
                detail: "mock host".into(),
            }
        }
    }

    fn server(answer: fn(&Command) -> Response) -> BridgeServer {
        let channel = Arc::new(MockChannel {
            answer,
            pending: Mutex::new(None),
        });
        BridgeServer::new(Gateway::new(
            channel,
            Duration::from_millis(5),
            Duration::from_millis(500),
        ))
    }

    fn text(result: &CallToolResult) -> String {
        let content = serde_json::to_value(&result.content[0]).unwrap();
        content["text"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_execute_code_success() {
        let server = server(|cmd| Response::success(&cmd.id, Some(json!(2))));
        let params = Parameters(ExecuteCodeParams {
            code: "result = 1 + 1".to_string(),
        });

        let result = server.execute_code(params).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
        assert_eq!(text(&result), "2");
    }

    #[tokio::test]
    async fn test_execute_code_without_result() {
        let server = server(|cmd| Response::success(&cmd.id, None));
        let params = Parameters(ExecuteCodeParams {
            code: "ui.message_box(\"hi\")".to_string(),
        });

        let result = server.execute_code(params).await.unwrap();
        assert_eq!(text(&result), "ok");
    }

    #[tokio::test]
    async fn test_execute_code_host_failure() {
        let server = server(|cmd| {
            Response::error(
                &cmd.id,
                ErrorKind::HostExecutionFailure,
                "Variable not found: undefined_name",
            )
        });
        let params = Parameters(ExecuteCodeParams {
            code: "undefined_name.do_thing()".to_string(),
        });

        let result = server.execute_code(params).await.unwrap();
        assert!(result.is_error.unwrap_or(false));
        assert_eq!(
            text(&result),
            "HostExecutionFailure: Variable not found: undefined_name"
        );
    }

    #[tokio::test]
    async fn test_execute_code_empty_is_invalid_params() {
        let server = server(|cmd| Response::success(&cmd.id, None));
        let params = Parameters(ExecuteCodeParams {
            code: "  ".to_string(),
        });

        let err = server.execute_code(params).await.unwrap_err();
        assert!(err.message.contains("non-empty source"));
    }

    #[tokio::test]
    async fn test_run_operation_passes_parameters() {
        let server = server(|cmd| match &cmd.kind {
            CommandKind::Operation { name, parameters } => {
                Response::success(&cmd.id, Some(json!({ "name": name, "size": parameters["size"] })))
            }
            CommandKind::ExecuteCode { .. } => Response::success(&cmd.id, None),
        });
        let params = Parameters(RunOperationParams {
            operation: "create_cube".to_string(),
            parameters: json!({ "size": 12 }),
        });

        let result = server.run_operation(params).await.unwrap();
        let value: Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(value, json!({ "name": "create_cube", "size": 12 }));
    }

    #[tokio::test]
    async fn test_run_operation_rejects_bad_input() {
        let server = server(|cmd| Response::success(&cmd.id, None));

        let unknown = Parameters(RunOperationParams {
            operation: "teleport".to_string(),
            parameters: Value::Null,
        });
        assert!(server.run_operation(unknown).await.is_err());

        let not_an_object = Parameters(RunOperationParams {
            operation: "create_cube".to_string(),
            parameters: json!([1, 2]),
        });
        assert!(server.run_operation(not_an_object).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_is_a_tool_error() {
        // The answer goes to a different id, so the caller never sees its own.
        let server = server(|_| Response::success("someone-else", None));
        let params = Parameters(ExecuteCodeParams {
            code: "result = 1".to_string(),
        });

        let result = server.execute_code(params).await.unwrap();
        assert!(result.is_error.unwrap_or(false));
        assert!(text(&result).starts_with("Timeout: "));
    }

    #[tokio::test]
    async fn test_list_operations() {
        let server = server(|cmd| Response::success(&cmd.id, None));
        let result = server.list_operations().await.unwrap();
        let listing: Vec<Value> = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(listing.len(), catalog::operations().len());
        assert!(listing.iter().any(|op| op["name"] == "create_cube"));
    }

    #[tokio::test]
    async fn test_host_status() {
        let server = server(|cmd| Response::success(&cmd.id, None));
        let result = server.host_status().await.unwrap();
        let status: Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(status["available"], true);
        assert_eq!(status["transport"], "mock");
    }

    #[test]
    fn test_gateway_from_config() {
        let config = Config::from_json(r#"{"transport": "http", "timeout_ms": 1234}"#).unwrap();
        let gateway = gateway_from_config(&config).unwrap();
        assert_eq!(gateway.timeout(), Duration::from_millis(1234));
    }
}
