//! Routing, normalization, and dispatch for the Unified Tool Executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sa_domain::error::Result;
use serde_json::Value;

/// The "factory cluster" a tool_fqn routes to (§3.5, §4.5).
pub const CLUSTER_LOCAL_MCP: &str = "local_mcp";
pub const CLUSTER_SEM_HUB: &str = "sem-hub";
pub const CLUSTER_WP_HUB: &str = "wp-hub";
pub const CLUSTER_N8N: &str = "n8n";

/// Route a tool_fqn to its factory cluster by prefix/substring (§4.5 table).
/// Order matters: the first matching rule wins, falling back to `local_mcp`.
pub fn resolve_cluster(tool_fqn: &str) -> &'static str {
    let name = tool_fqn.to_ascii_lowercase();
    if name.starts_with("local_") || name.contains("mcp") {
        CLUSTER_LOCAL_MCP
    } else if name.contains("sem-") {
        CLUSTER_SEM_HUB
    } else if name.contains("wp") || name.contains("wordpress") {
        CLUSTER_WP_HUB
    } else if name.contains("n8n") {
        CLUSTER_N8N
    } else {
        CLUSTER_LOCAL_MCP
    }
}

/// Apply the one documented parameter-rename normalization (§4.5, §9 Open
/// Question — kept scoped to this single case, not a general alias table).
pub fn normalize_parameters(tool_fqn: &str, mut params: HashMap<String, Value>) -> HashMap<String, Value> {
    if tool_fqn == "filesystem_write_file" {
        if let Some(path) = params.remove("path") {
            params.entry("file_path".to_string()).or_insert(path);
        }
    }
    params
}

/// The outcome of one dispatch, before the caller persists it to the Tool
/// Call store. `is_error` distinguishes a backend-reported failure from a
/// successful call whose content happens to describe an error.
pub struct ToolDispatch {
    pub cluster: &'static str,
    pub response: Value,
    pub is_error: bool,
    pub duration: Duration,
}

/// A backend adapter for one factory cluster. Concrete adapters (local MCP
/// server, SemanticHub client, WordPress client, n8n webhook caller) are not
/// specified further by the contract (§4.5) — only that `execute` resolves
/// the call and returns a JSON result or an error.
#[async_trait::async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(&self, tool_fqn: &str, params: HashMap<String, Value>) -> Result<Value>;
}

/// Maps factory clusters to their backend. Clusters with no registered
/// backend fall back to `local_mcp` if present, else report an error.
#[derive(Default)]
pub struct ToolRegistry {
    backends: HashMap<&'static str, Arc<dyn ToolBackend>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cluster: &'static str, backend: Arc<dyn ToolBackend>) {
        self.backends.insert(cluster, backend);
    }

    fn backend_for(&self, cluster: &'static str) -> Option<Arc<dyn ToolBackend>> {
        self.backends
            .get(cluster)
            .or_else(|| self.backends.get(CLUSTER_LOCAL_MCP))
            .cloned()
    }
}

/// `run_tool` (§4.5): resolve the cluster, normalize parameters, dispatch,
/// and time the call. Does not persist a Tool Call row — that is the
/// caller's job (the durable store lives with the Task Store family so it
/// can share the execution_id/step_id context).
pub async fn dispatch_tool(
    registry: &ToolRegistry,
    tool_fqn: &str,
    params: HashMap<String, Value>,
) -> ToolDispatch {
    let cluster = resolve_cluster(tool_fqn);
    let params = normalize_parameters(tool_fqn, params);
    let started = Instant::now();

    let backend = registry.backend_for(cluster);
    let result = match backend {
        Some(b) => b.execute(tool_fqn, params).await,
        None => Err(sa_domain::error::Error::Execution(format!(
            "no backend registered for cluster '{cluster}' (tool '{tool_fqn}')"
        ))),
    };

    let duration = started.elapsed();
    match result {
        Ok(response) => ToolDispatch {
            cluster,
            response,
            is_error: false,
            duration,
        },
        Err(e) => ToolDispatch {
            cluster,
            response: Value::String(e.to_string()),
            is_error: true,
            duration,
        },
    }
}
