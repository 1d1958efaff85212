//! Whelk MCP Server
//!
//! An MCP server that exposes whelk shell sessions as tools. An AI agent
//! gets persistent virtual shells: commands run in a shell's tracked
//! working directory, every run is recorded, and `cd dir && pwd` style
//! commands move the shell for subsequent calls.

use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::*,
    schemars::{self, JsonSchema},
    service::{RequestContext, RoleServer},
};
use serde::{Deserialize, Serialize};
use whelk::{DEFAULT_HISTORY_LIMIT, HistoryEntry, SessionError, ShellId, StoreError, Whelk};

/// Parameters for the command execution tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCommandParams {
    /// The shell command to execute. It is handed to the interpreter with
    /// `-c`, so pipes, redirects, and `&&` chaining all work.
    pub command: String,

    /// Shell to run in. Omit to use the current shell.
    #[serde(default)]
    pub shell_id: Option<String>,

    /// Wall-clock timeout in milliseconds (default: the server's configured
    /// timeout)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Parameters for the directory listing tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListFilesParams {
    /// Shell whose working directory to list. Omit for the current shell.
    #[serde(default)]
    pub shell_id: Option<String>,
}

/// Parameters for the history tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HistoryParams {
    /// Shell whose history to fetch. Omit for the current shell.
    #[serde(default)]
    pub shell_id: Option<String>,

    /// Maximum number of entries, most recent first (default: 20)
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Parameters for the shell creation tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewShellParams {}

/// Parameters for the shell switching tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UseShellParams {
    /// Shell to make current.
    pub shell_id: String,
}

/// Parameters for the shell listing tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListShellsParams {}

/// Parameters for the shell close tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CloseShellParams {
    /// Shell to close. Its history is deleted with it.
    pub shell_id: String,
}

/// MCP server that provides persistent shell sessions via whelk
#[derive(Clone)]
pub struct WhelkServer {
    whelk: Arc<Whelk>,
}

impl std::fmt::Debug for WhelkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhelkServer").finish_non_exhaustive()
    }
}

fn internal_error(e: SessionError) -> McpError {
    McpError::internal_error(format!("Session error: {}", e), None)
}

/// Map a session error on a caller-supplied shell id to a parameter error.
fn shell_error(id: &str, e: SessionError) -> McpError {
    match e {
        SessionError::Store(StoreError::NotFound { .. }) => {
            McpError::invalid_params(format!("Unknown shell: {}", id), None)
        }
        other => internal_error(other),
    }
}

fn parse_params<P: serde::de::DeserializeOwned>(
    arguments: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Result<P, McpError> {
    let args = arguments.cloned().unwrap_or_default();
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e), None))
}

fn input_schema<S: Serialize>(schema: S) -> Arc<serde_json::Map<String, serde_json::Value>> {
    let schema_json = serde_json::to_value(schema).unwrap_or_default();
    match schema_json {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    }
}

/// Format a recorded run the way an agent wants to read it.
fn format_entry(entry: &HistoryEntry) -> String {
    let mut output = String::new();

    if !entry.output.is_empty() {
        output.push_str(&entry.output);
    }

    if !entry.error.is_empty() {
        if !output.is_empty() {
            output.push_str("\n--- stderr ---\n");
        }
        output.push_str(&entry.error);
    }

    if output.is_empty() {
        output = format!("(no output, success: {})", entry.success);
    } else if !entry.success {
        output.push_str("\n(command failed)");
    }

    output
}

impl WhelkServer {
    /// Create a server over a configured session.
    pub fn new(whelk: Whelk) -> Self {
        Self {
            whelk: Arc::new(whelk),
        }
    }

    /// Execute a command in a tracked shell and report the recorded outcome.
    async fn run_command(&self, params: RunCommandParams) -> Result<CallToolResult, McpError> {
        let shell = params.shell_id.map(ShellId::from);

        let mut limits = self.whelk.limits().clone();
        if let Some(ms) = params.timeout_ms {
            limits.timeout = Duration::from_millis(ms);
        }

        match self
            .whelk
            .run_command_with_limits(&params.command, shell.as_ref(), &limits)
            .await
        {
            Ok(_) => {}
            // The attempt is on the record; tell the agent what happened.
            Err(e) if e.is_timeout() => {
                return Ok(CallToolResult::success(vec![Content::text(e.to_string())]));
            }
            Err(e) => match &shell {
                Some(id) => return Err(shell_error(id.as_str(), e)),
                None => return Err(internal_error(e)),
            },
        }

        let entries = self
            .whelk
            .history(shell.as_ref(), 1)
            .await
            .map_err(internal_error)?;
        let text = entries
            .first()
            .map(format_entry)
            .unwrap_or_else(|| "(no output recorded)".to_string());

        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// List the working directory of a shell.
    async fn list_files(&self, params: ListFilesParams) -> Result<CallToolResult, McpError> {
        let shell = params.shell_id.map(ShellId::from);

        let lines = match self.whelk.list_files(shell.as_ref()).await {
            Ok(lines) => lines,
            Err(e) => match &shell {
                Some(id) => return Err(shell_error(id.as_str(), e)),
                None => return Err(internal_error(e)),
            },
        };

        let text = if lines.is_empty() {
            "(no entries)".to_string()
        } else {
            lines.join("\n")
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Fetch a shell's recent history as a transcript.
    async fn history(&self, params: HistoryParams) -> Result<CallToolResult, McpError> {
        let shell = params.shell_id.map(ShellId::from);
        let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);

        let entries = self
            .whelk
            .history(shell.as_ref(), limit)
            .await
            .map_err(internal_error)?;

        let text = if entries.is_empty() {
            "(no history)".to_string()
        } else {
            entries.iter().map(HistoryEntry::format_block).collect()
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Create an additional shell.
    async fn new_shell(&self) -> Result<CallToolResult, McpError> {
        let shell = self.whelk.new_shell().await.map_err(internal_error)?;
        let text = format!(
            "Created shell {} (cwd: {}). It is not current; switch with use_shell.",
            shell.id,
            shell.cwd.display()
        );
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Switch the current shell.
    async fn use_shell(&self, params: UseShellParams) -> Result<CallToolResult, McpError> {
        let id = ShellId::from(params.shell_id);
        self.whelk
            .set_current_shell(&id)
            .await
            .map_err(|e| shell_error(id.as_str(), e))?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Current shell is now {}",
            id
        ))]))
    }

    /// List every tracked shell.
    async fn list_shells(&self) -> Result<CallToolResult, McpError> {
        let shells = self
            .whelk
            .list_active_shells()
            .await
            .map_err(internal_error)?;

        let text = if shells.is_empty() {
            "(no shells)".to_string()
        } else {
            shells
                .iter()
                .map(|shell| {
                    let marker = if shell.current { "*" } else { " " };
                    format!("{} {} (cwd: {})", marker, shell.id, shell.cwd.display())
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Close a shell and delete its history.
    async fn close_shell(&self, params: CloseShellParams) -> Result<CallToolResult, McpError> {
        let id = ShellId::from(params.shell_id);
        self.whelk
            .close_shell(&id)
            .await
            .map_err(|e| shell_error(id.as_str(), e))?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Closed shell {}",
            id
        ))]))
    }

    fn run_command_tool(&self) -> Tool {
        Tool {
            name: "run_command".into(),
            title: Some("Run Shell Command".into()),
            description: Some(
                "Execute a shell command in a persistent virtual shell. The command runs in \
                the shell's tracked working directory and is recorded in its history. A \
                successful command whose output ends with a directory path (e.g. `cd sub && \
                pwd`) moves the shell there for subsequent commands."
                    .into(),
            ),
            input_schema: input_schema(schemars::schema_for!(RunCommandParams)),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn list_files_tool(&self) -> Tool {
        Tool {
            name: "list_files".into(),
            title: Some("List Files".into()),
            description: Some(
                "List the contents of a shell's working directory in long format, one entry \
                per line."
                    .into(),
            ),
            input_schema: input_schema(schemars::schema_for!(ListFilesParams)),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn history_tool(&self) -> Tool {
        Tool {
            name: "history".into(),
            title: Some("Command History".into()),
            description: Some(
                "Fetch a shell's recent command history as a transcript of Command / Success / \
                Output / Error blocks, most recent first."
                    .into(),
            ),
            input_schema: input_schema(schemars::schema_for!(HistoryParams)),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn new_shell_tool(&self) -> Tool {
        Tool {
            name: "new_shell".into(),
            title: Some("New Shell".into()),
            description: Some(
                "Create an additional virtual shell rooted at the server's working directory. \
                The new shell is not current until use_shell selects it."
                    .into(),
            ),
            input_schema: input_schema(schemars::schema_for!(NewShellParams)),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn use_shell_tool(&self) -> Tool {
        Tool {
            name: "use_shell".into(),
            title: Some("Switch Shell".into()),
            description: Some(
                "Make the given shell current. Tools called without a shell_id target the \
                current shell."
                    .into(),
            ),
            input_schema: input_schema(schemars::schema_for!(UseShellParams)),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn list_shells_tool(&self) -> Tool {
        Tool {
            name: "list_shells".into(),
            title: Some("List Shells".into()),
            description: Some(
                "List every tracked shell with its working directory. The current shell is \
                marked with *."
                    .into(),
            ),
            input_schema: input_schema(schemars::schema_for!(ListShellsParams)),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn close_shell_tool(&self) -> Tool {
        Tool {
            name: "close_shell".into(),
            title: Some("Close Shell".into()),
            description: Some("Remove a shell and delete its recorded history.".into()),
            input_schema: input_schema(schemars::schema_for!(CloseShellParams)),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for WhelkServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Whelk provides persistent virtual shells for running commands. Each shell \
                tracks a working directory and records everything it runs; end a command with \
                a printed directory path (e.g. `cd sub && pwd`) to move the shell there. Use \
                run_command for execution, history to review past runs, and new_shell / \
                use_shell / list_shells / close_shell to manage parallel working contexts."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: vec![
                self.run_command_tool(),
                self.list_files_tool(),
                self.history_tool(),
                self.new_shell_tool(),
                self.use_shell_tool(),
                self.list_shells_tool(),
                self.close_shell_tool(),
            ],
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request.arguments.as_ref();
        match request.name.as_ref() {
            "run_command" => self.run_command(parse_params(args)?).await,
            "list_files" => self.list_files(parse_params(args)?).await,
            "history" => self.history(parse_params(args)?).await,
            "new_shell" => self.new_shell().await,
            "use_shell" => self.use_shell(parse_params(args)?).await,
            "list_shells" => self.list_shells().await,
            "close_shell" => self.close_shell(parse_params(args)?).await,
            _ => Err(McpError::invalid_params(
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}
