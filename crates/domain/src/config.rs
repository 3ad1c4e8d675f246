use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workspace: WorkspaceDefaultsConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub task_store: TaskStoreConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            ConfigSeverity::Warning => "warning",
            ConfigSeverity::Error => "error",
        };
        write!(f, "[{label}] {}", self.message)
    }
}

impl Config {
    /// Cheap structural checks run at startup and by `serialagent doctor`
    /// (§9 "config validation"); nothing here talks to a network or disk.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let t = &self.coordinator;
        if !(t.readonly_threshold_low < t.readonly_threshold_medium
            && t.readonly_threshold_medium < t.readonly_threshold_high)
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "coordinator thresholds must be strictly increasing \
                          (readonly_threshold_low < _medium < _high)"
                    .to_string(),
            });
        }
        if !(0.0..=1.0).contains(&t.default_soft_write_threshold) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "coordinator.default_soft_write_threshold must be in [0, 1]".to_string(),
            });
        }

        if self.runner.tool_loop_iteration_cap == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "runner.tool_loop_iteration_cap must be at least 1".to_string(),
            });
        }

        if self.llm.base_url.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "llm.base_url must not be empty".to_string(),
            });
        }
        if std::env::var(&self.llm.api_key_env).unwrap_or_default().is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "{} is not set; LLM calls will be rejected by the provider",
                    self.llm.api_key_env
                ),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace defaults (§3.1)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Defaults applied when a workspace record omits execution_mode/priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDefaultsConfig {
    #[serde(default = "d_priority")]
    pub default_priority: crate::model::ExecutionPriority,
    #[serde(default = "d_mode")]
    pub default_mode: crate::model::ExecutionMode,
}

impl Default for WorkspaceDefaultsConfig {
    fn default() -> Self {
        Self {
            default_priority: d_priority(),
            default_mode: d_mode(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution Coordinator (§4.1)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The priority→threshold table was left undetermined upstream; these are
/// the documented defaults, fixed once chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "d_thresh_low")]
    pub readonly_threshold_low: f64,
    #[serde(default = "d_thresh_medium")]
    pub readonly_threshold_medium: f64,
    #[serde(default = "d_thresh_high")]
    pub readonly_threshold_high: f64,
    /// Default `soft_write` confidence threshold when a pack doesn't
    /// override it (§4.1 "Auto-execute threshold").
    #[serde(default = "d_soft_write_threshold")]
    pub default_soft_write_threshold: f64,
    /// Duplicate-suppression lookback window, in minutes.
    #[serde(default = "d_dup_window_minutes")]
    pub duplicate_window_minutes: i64,
    /// Pack ids that are always valid regardless of catalog registration.
    #[serde(default = "d_builtin_packs")]
    pub builtin_packs: Vec<String>,
    /// Pack ids treated as "background" (affects suggestion's `is_background`).
    #[serde(default = "d_background_packs")]
    pub background_packs: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            readonly_threshold_low: d_thresh_low(),
            readonly_threshold_medium: d_thresh_medium(),
            readonly_threshold_high: d_thresh_high(),
            default_soft_write_threshold: d_soft_write_threshold(),
            duplicate_window_minutes: d_dup_window_minutes(),
            builtin_packs: d_builtin_packs(),
            background_packs: d_background_packs(),
        }
    }
}

impl CoordinatorConfig {
    pub fn readonly_threshold(&self, priority: crate::model::ExecutionPriority) -> f64 {
        use crate::model::ExecutionPriority::*;
        match priority {
            Low => self.readonly_threshold_low,
            Medium => self.readonly_threshold_medium,
            High => self.readonly_threshold_high,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Playbook Runner (§4.3, §4.4)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Tool-loop iteration cap. Fixed at 5 per §8's testable boundary; not
    /// meant to be tuned, but kept as a named constant rather than a magic
    /// number scattered through the runner.
    #[serde(default = "d_tool_loop_cap")]
    pub tool_loop_iteration_cap: usize,
    /// Per-task execution budget for conversational playbooks (§5 "Timeouts").
    #[serde(default = "d_task_budget_secs")]
    pub task_budget_seconds: i64,
    /// Max chars of each per-tool JSON excerpt in the system summary turn.
    #[serde(default = "d_tool_summary_chars")]
    pub tool_summary_excerpt_chars: usize,
    /// Max chars for the top-level execution-failure message (§7).
    #[serde(default = "d_execution_error_chars")]
    pub execution_error_truncate_chars: usize,
    /// Max chars for a per-tool-call error message (§4.5).
    #[serde(default = "d_tool_error_chars")]
    pub tool_error_truncate_chars: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tool_loop_iteration_cap: d_tool_loop_cap(),
            task_budget_seconds: d_task_budget_secs(),
            tool_summary_excerpt_chars: d_tool_summary_chars(),
            execution_error_truncate_chars: d_execution_error_chars(),
            tool_error_truncate_chars: d_tool_error_chars(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task Store (§4.2)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    #[serde(default = "d_heartbeat_ttl_min")]
    pub heartbeat_ttl_minutes: i64,
    #[serde(default = "d_no_heartbeat_ttl_min")]
    pub no_heartbeat_ttl_minutes: i64,
    #[serde(default = "d_runner_heartbeat_max_age")]
    pub runner_heartbeat_max_age_seconds: i64,
    #[serde(default = "d_reap_interval")]
    pub reap_sweep_interval_seconds: u64,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_minutes: d_heartbeat_ttl_min(),
            no_heartbeat_ttl_minutes: d_no_heartbeat_ttl_min(),
            runner_heartbeat_max_age_seconds: d_runner_heartbeat_max_age(),
            reap_sweep_interval_seconds: d_reap_interval(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming projection (§4.7)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "d_tick_ms")]
    pub tick_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: d_tick_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider (§1 "LLMProvider.Chat" — one OpenAI-compatible endpoint)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_llm_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key, not the key
    /// itself (never stored in config on disk).
    #[serde(default = "d_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_llm_model")]
    pub default_model: String,
    #[serde(default = "d_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_base_url(),
            api_key_env: d_llm_api_key_env(),
            default_model: d_llm_model(),
            timeout_seconds: d_llm_timeout_seconds(),
        }
    }
}

fn d_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_llm_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_llm_model() -> String {
    "gpt-4o".into()
}
fn d_llm_timeout_seconds() -> u64 {
    120
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default value helpers (serde)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_port() -> u16 {
    8787
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_priority() -> crate::model::ExecutionPriority {
    crate::model::ExecutionPriority::Medium
}
fn d_mode() -> crate::model::ExecutionMode {
    crate::model::ExecutionMode::Hybrid
}
fn d_thresh_low() -> f64 {
    0.6
}
fn d_thresh_medium() -> f64 {
    0.75
}
fn d_thresh_high() -> f64 {
    0.9
}
fn d_soft_write_threshold() -> f64 {
    0.8
}
fn d_dup_window_minutes() -> i64 {
    60
}
fn d_builtin_packs() -> Vec<String> {
    vec!["intent_extraction".into(), "semantic_seeds".into()]
}
fn d_background_packs() -> Vec<String> {
    vec!["habit_learning".into()]
}
fn d_tool_loop_cap() -> usize {
    5
}
fn d_task_budget_secs() -> i64 {
    300
}
fn d_tool_summary_chars() -> usize {
    500
}
fn d_execution_error_chars() -> usize {
    1000
}
fn d_tool_error_chars() -> usize {
    500
}
fn d_heartbeat_ttl_min() -> i64 {
    10
}
fn d_no_heartbeat_ttl_min() -> i64 {
    30
}
fn d_runner_heartbeat_max_age() -> i64 {
    120
}
fn d_reap_interval() -> u64 {
    60
}
fn d_tick_ms() -> u64 {
    1000
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
