//! Tools the reasoning agent may call while diagnosing an event
//!
//! Tools are registered once at startup. The backend advertises every
//! registered tool to the model and routes tool calls back through the
//! registry by name.

use crate::error::ToolError;
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A capability offered to the reasoning agent
pub trait Tool: Send + Sync {
    /// Name the model uses to call the tool
    fn name(&self) -> &str;

    /// What the tool does, shown to the model
    fn description(&self) -> &str;

    /// JSON schema of the tool's arguments
    fn input_schema(&self) -> Value;

    /// Run the tool with already-parsed arguments
    fn invoke<'a>(
        &'a self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;
}

/// Description of a registered tool, independent of any backend wire format
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Fixed set of tools assembled at startup
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool, replacing any earlier tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if let Some(existing) = self.tools.iter().position(|t| t.name() == tool.name()) {
            warn!("Replacing already registered tool '{}'", tool.name());
            self.tools[existing] = tool;
        } else {
            info!("Registered tool '{}'", tool.name());
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Invoke a tool by name with raw JSON arguments
    ///
    /// Failures come back as text so the model can read them and carry on.
    pub async fn invoke(&self, name: &str, raw_arguments: &str) -> String {
        match self.try_invoke(name, raw_arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Tool '{}' failed: {}", name, e);
                format!("Error: {}", e)
            }
        }
    }

    async fn try_invoke(&self, name: &str, raw_arguments: &str) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let input = if raw_arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(raw_arguments)
                .map_err(|e| ToolError::InvalidInput(format!("{}: {}", e, raw_arguments)))?
        };

        tool.invoke(input).await
    }
}

/// Lists ownership groups from the developer-portal catalog
///
/// Helps the model name the team that most likely owns a misrouted message.
pub struct CatalogGroupsTool {
    client: Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntity {
    kind: String,
    #[serde(default)]
    metadata: CatalogMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

impl CatalogGroupsTool {
    pub fn new(api_url: String, token: String, timeout: Duration) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::RequestFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url,
            token,
        })
    }

    fn entities_url(&self) -> String {
        format!("{}/catalog/entities", self.api_url.trim_end_matches('/'))
    }

    /// Render group entities as a bullet list of entity refs
    fn format_groups(entities: &[CatalogEntity]) -> String {
        let groups: Vec<String> = entities
            .iter()
            .filter(|entity| entity.kind.eq_ignore_ascii_case("group"))
            .map(|entity| {
                let meta = &entity.metadata;
                let namespace = meta.namespace.as_deref().unwrap_or("default");
                let display = meta
                    .title
                    .as_deref()
                    .filter(|title| !title.is_empty())
                    .unwrap_or(meta.name.as_str());
                format!("- **{}** (group:{}/{})", display, namespace, meta.name)
            })
            .collect();

        if groups.is_empty() {
            return "No groups found in the catalog.".to_string();
        }

        format!(
            "Found {} group(s) in the catalog:\n\n{}",
            groups.len(),
            groups.join("\n")
        )
    }
}

impl Tool for CatalogGroupsTool {
    fn name(&self) -> &str {
        "catalog_groups"
    }

    fn description(&self) -> &str {
        "List all groups from the developer-portal catalog. Use it to identify the team that \
         owns the kind of message that failed to route. Takes no arguments."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    fn invoke<'a>(
        &'a self,
        _input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            info!("Querying catalog for groups");

            let url = format!("{}?filter=kind=group", self.entities_url());
            let mut request = self.client.get(url);
            if !self.token.is_empty() {
                request = request.bearer_auth(&self.token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ToolError::RequestFailed(format!("Catalog request failed: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(ToolError::RequestFailed(format!(
                    "Catalog returned {}: {}",
                    status, body
                )));
            }

            let entities: Vec<CatalogEntity> = response.json().await.map_err(|e| {
                ToolError::RequestFailed(format!("Failed to parse catalog response: {}", e))
            })?;

            Ok(Self::format_groups(&entities))
        })
    }
}
