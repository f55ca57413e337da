//! Client-facing tool surface.
//!
//! Thin adapters over [`MemoryEngine`] for assistant clients:
//!
//! - **add_memory**: Store a memory (classified and deduplicated)
//! - **search_memories**: Hybrid retrieval with filters and mode
//! - **get_context**: Session context independent of any query
//! - **consolidate**: Plan or apply a consolidation pass
//!
//! [`ToolRegistry::call`] always answers with a well-formed JSON object.
//! Failures become `{"error": {"kind", "message", "retryable"}}`; nothing
//! is written to stdout.

use crate::consolidate::ConsolidationReport;
use crate::dedup::DedupDecision;
use crate::error::{Error, Result};
use crate::memory::{Layer, MemoryFilters, Provenance, RetrievalMode, Sublayer};
use crate::orchestrator::{
    ContextBundle, IngestRequest, IngestStatus, MemoryEngine, SearchRequest, SearchResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// A tool definition as advertised to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (must be unique)
    pub name: String,
    pub description: String,
    /// JSON Schema for input parameters
    pub input_schema: Value,
    /// Whether the client should confirm before calling
    pub requires_confirmation: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Object(Default::default()),
            requires_confirmation: false,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn requires_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }
}

/// Optional attributes accepted by add_memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetadataInput {
    #[serde(default)]
    pub importance: Option<u8>,
    #[serde(default)]
    pub layer: Option<Layer>,
    #[serde(default)]
    pub sublayer: Option<Sublayer>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub contradicts: bool,
}

/// Input for add_memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMemoryInput {
    pub content: String,
    #[serde(default)]
    pub metadata: MemoryMetadataInput,
}

impl From<AddMemoryInput> for IngestRequest {
    fn from(input: AddMemoryInput) -> Self {
        let m = input.metadata;
        IngestRequest {
            content: input.content,
            importance: m.importance,
            layer: m.layer,
            sublayer: m.sublayer,
            domain: m.domain,
            category: m.category,
            tags: m.tags,
            session_id: m.session_id,
            entities: m.entities,
            contradicts: m.contradicts,
        }
    }
}

/// Output of add_memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMemoryOutput {
    pub id: String,
    pub status: IngestStatus,
    pub title: String,
    pub decision: DedupDecision,
    pub layer: Layer,
    pub sublayer: Sublayer,
}

/// Input for search_memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMemoriesInput {
    pub query: String,
    #[serde(default)]
    pub filters: MemoryFilters,
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One search hit as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub content: String,
    pub layer: Layer,
    pub sublayer: Sublayer,
    pub importance: u8,
    pub score: f64,
    pub decayed_importance: f64,
    pub provenance: Provenance,
}

/// Output of search_memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMemoriesOutput {
    pub results: Vec<SearchHit>,
    pub total: usize,
    pub mode: RetrievalMode,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl From<SearchResponse> for SearchMemoriesOutput {
    fn from(response: SearchResponse) -> Self {
        let results = response
            .results
            .into_iter()
            .map(|m| SearchHit {
                id: m.record.id.to_string(),
                title: m.record.title,
                content: m.record.content,
                layer: m.record.layer,
                sublayer: m.record.sublayer,
                importance: m.record.importance,
                score: m.score,
                decayed_importance: m.decayed_importance,
                provenance: m.provenance,
            })
            .collect();
        Self {
            results,
            total: response.total,
            mode: response.mode,
            degraded: response.degraded,
            warnings: response.warnings,
        }
    }
}

/// Input for get_context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContextInput {
    pub session_id: String,
}

/// Input for consolidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidateInput {
    /// Apply the plan instead of reporting it
    #[serde(default)]
    pub force: bool,
}

pub async fn add_memory(engine: &MemoryEngine, input: AddMemoryInput) -> Result<AddMemoryOutput> {
    let result = engine.ingest(input.into()).await?;
    Ok(AddMemoryOutput {
        id: result.id.to_string(),
        status: result.status,
        title: result.title,
        decision: result.decision,
        layer: result.layer,
        sublayer: result.sublayer,
    })
}

pub async fn search_memories(engine: &MemoryEngine, input: SearchMemoriesInput) -> SearchMemoriesOutput {
    let mut request = SearchRequest::new(input.query)
        .with_mode(input.mode)
        .with_filters(input.filters);
    if let Some(limit) = input.limit {
        request = request.with_limit(limit);
    }
    engine.search(request).await.into()
}

pub async fn get_context(engine: &MemoryEngine, input: GetContextInput) -> Result<ContextBundle> {
    engine.get_context(&input.session_id).await
}

pub async fn consolidate(engine: &MemoryEngine, input: ConsolidateInput) -> Result<ConsolidationReport> {
    engine.consolidate(input.force).await
}

/// The error object carried in a tool response.
pub fn error_response(error: &Error) -> Value {
    json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
            "retryable": error.is_retryable(),
        }
    })
}

/// Tool definitions bound to an engine.
pub struct ToolRegistry {
    engine: MemoryEngine,
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn new(engine: MemoryEngine) -> Self {
        Self {
            engine,
            tools: default_tools(),
        }
    }

    pub fn engine(&self) -> &MemoryEngine {
        &self.engine
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Definitions in the shape clients list tools with.
    pub fn export_schema(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();

        json!({ "tools": tools })
    }

    /// Run a tool by name. Never fails; errors are encoded in the response.
    pub async fn call(&self, name: &str, input: Value) -> Value {
        debug!(tool = name, "Tool call");
        match self.dispatch(name, input).await {
            Ok(value) => value,
            Err(e) => error_response(&e),
        }
    }

    async fn dispatch(&self, name: &str, input: Value) -> Result<Value> {
        match name {
            "add_memory" => {
                let output = add_memory(&self.engine, parse_input(name, input)?).await?;
                Ok(serde_json::to_value(output)?)
            }
            "search_memories" => {
                let output = search_memories(&self.engine, parse_input(name, input)?).await;
                Ok(serde_json::to_value(output)?)
            }
            "get_context" => {
                let output = get_context(&self.engine, parse_input(name, input)?).await?;
                Ok(serde_json::to_value(output)?)
            }
            "consolidate" => {
                let input = if input.is_null() {
                    ConsolidateInput::default()
                } else {
                    parse_input(name, input)?
                };
                let output = consolidate(&self.engine, input).await?;
                Ok(serde_json::to_value(output)?)
            }
            other => Err(Error::validation(format!("unknown tool: {}", other))),
        }
    }
}

fn parse_input<T: serde::de::DeserializeOwned>(tool: &str, input: Value) -> Result<T> {
    serde_json::from_value(input)
        .map_err(|e| Error::validation(format!("invalid input for {}: {}", tool, e)))
}

fn filters_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "memory_type": { "type": "string", "description": "Match the memory's category" },
            "domain": { "type": "string" },
            "min_importance": { "type": "integer", "minimum": 1, "maximum": 10 },
            "layer": { "type": "string", "enum": ["self", "world", "intent"] }
        }
    })
}

fn default_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "add_memory",
            "Store a memory. Content is classified into a layer and deduplicated against \
             similar memories; near-duplicates reinforce the existing memory instead of \
             creating a new one.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The memory text" },
                "metadata": {
                    "type": "object",
                    "properties": {
                        "importance": { "type": "integer", "minimum": 1, "maximum": 10, "default": 5 },
                        "layer": { "type": "string", "enum": ["self", "world", "intent"] },
                        "sublayer": {
                            "type": "string",
                            "enum": [
                                "identity", "preference", "constraint",
                                "fact", "failure", "method",
                                "rule", "goal", "anti_pattern"
                            ]
                        },
                        "domain": { "type": "string" },
                        "category": { "type": "string" },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "session_id": { "type": "string" },
                        "entities": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Names of entities this memory is about"
                        },
                        "contradicts": {
                            "type": "boolean",
                            "description": "This memory contradicts its closest existing memory",
                            "default": false
                        }
                    }
                }
            },
            "required": ["content"]
        })),
        ToolDefinition::new(
            "search_memories",
            "Search memories by meaning and by entity relationships. Results are ranked by \
             relevance weighted with importance that decays over time.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "filters": filters_schema(),
                "mode": {
                    "type": "string",
                    "enum": ["semantic", "structured", "hybrid", "auto"],
                    "default": "auto"
                },
                "limit": { "type": "integer", "minimum": 1 }
            },
            "required": ["query"]
        })),
        ToolDefinition::new(
            "get_context",
            "Recent memories from a session plus standing high-importance facts about the user.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" }
            },
            "required": ["session_id"]
        })),
        ToolDefinition::new(
            "consolidate",
            "Merge near-duplicate low-importance memories. Reports the plan unless force is set.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "force": { "type": "boolean", "default": false }
            }
        }))
        .requires_confirmation(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(MemoryEngine::in_memory().unwrap())
    }

    #[test]
    fn test_default_tools() {
        let registry = registry();
        assert_eq!(registry.count(), 4);
        for name in ["add_memory", "search_memories", "get_context", "consolidate"] {
            let tool = registry.get_tool(name).unwrap();
            assert!(tool.input_schema.is_object());
        }
        assert!(registry.get_tool("consolidate").unwrap().requires_confirmation);

        let schema = registry.export_schema();
        assert_eq!(schema["tools"].as_array().unwrap().len(), 4);
        assert_eq!(schema["tools"][0]["inputSchema"]["required"][0], "content");
    }

    #[tokio::test]
    async fn test_add_memory_response_shape() {
        let registry = registry();
        let response = registry
            .call(
                "add_memory",
                json!({ "content": "I prefer dark mode", "metadata": { "importance": 7 } }),
            )
            .await;
        assert_eq!(response["status"], "created");
        assert_eq!(response["title"], "I prefer dark mode");
        assert_eq!(response["layer"], "self");
        assert!(response["id"].is_string());

        let again = registry
            .call("add_memory", json!({ "content": "I prefer dark mode" }))
            .await;
        assert_eq!(again["status"], "reinforced");
        assert_eq!(again["id"], response["id"]);
    }

    #[tokio::test]
    async fn test_search_memories_response_shape() {
        let registry = registry();
        registry
            .call(
                "add_memory",
                json!({ "content": "The build fails when cache is stale" }),
            )
            .await;

        let response = registry
            .call(
                "search_memories",
                json!({ "query": "build failures", "mode": "semantic" }),
            )
            .await;
        assert_eq!(response["total"], 1);
        assert_eq!(response["mode"], "semantic");
        assert_eq!(response["degraded"], false);
        assert_eq!(response["results"][0]["provenance"], "semantic");
        assert!(response.get("warnings").is_none());
    }

    #[tokio::test]
    async fn test_errors_are_encoded() {
        let registry = registry();

        let response = registry
            .call("add_memory", json!({ "content": "x", "metadata": { "importance": 42 } }))
            .await;
        assert_eq!(response["error"]["kind"], "validation");
        assert_eq!(response["error"]["retryable"], false);

        let response = registry.call("add_memory", json!({ "nope": true })).await;
        assert_eq!(response["error"]["kind"], "validation");

        let response = registry.call("drop_tables", json!({})).await;
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));

        let response = registry.call("get_context", json!({ "session_id": "" })).await;
        assert_eq!(response["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn test_context_and_consolidate() {
        let registry = registry();
        let session = registry.engine().start_session().await.unwrap();
        registry
            .call(
                "add_memory",
                json!({
                    "content": "Migrated the orders table",
                    "metadata": { "session_id": session.id }
                }),
            )
            .await;

        let context = registry
            .call("get_context", json!({ "session_id": session.id }))
            .await;
        assert_eq!(context["recent"].as_array().unwrap().len(), 1);
        assert_eq!(context["session"]["id"], session.id);

        let report = registry.call("consolidate", Value::Null).await;
        assert_eq!(report["dry_run"], true);
        let report = registry.call("consolidate", json!({ "force": true })).await;
        assert_eq!(report["dry_run"], false);
    }
}
