use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tally_types::ToolSchema;

mod error;
mod invoicing;
mod records;

pub use error::ToolError;
pub use invoicing::{
    summarize_invoice, DraftPaymentReminderTool, GetInvoiceTool, ListInvoicesTool,
    PolishTextTool, RegisterInvoiceNumberTool, UpdateInvoiceStatusTool, INVOICE_STATUSES,
};
pub use records::{RecordApiClient, RecordApiConfig};

/// The caller's credential, forwarded verbatim to the record API.
#[derive(Clone, Default)]
pub struct Credential {
    pub authorization: Option<String>,
    pub cookie: Option<String>,
}

impl Credential {
    pub fn is_empty(&self) -> bool {
        self.authorization.is_none() && self.cookie.is_none()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub credential: Credential,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(credential: Credential, cancel: CancellationToken) -> Self {
        Self { credential, cancel }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(value: Value) -> Self {
        Self {
            value,
            is_error: false,
        }
    }

    pub fn failed(err: &ToolError) -> Self {
        Self {
            value: err.to_output(),
            is_error: true,
        }
    }
}

/// What the agent loop needs from a tool catalog. Execution never fails:
/// every failure comes back as a structured `{error, message}` output so the
/// model can read it on the next step.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn schemas(&self) -> Vec<ToolSchema>;
    async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutput;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in tools {
            map.insert(tool.schema().name, tool);
        }
        Self {
            tools: Arc::new(map),
        }
    }

    /// The invoicing catalog, every tool bound to the same record API client.
    pub fn invoicing(client: RecordApiClient) -> Self {
        Self::from_tools(vec![
            Arc::new(ListInvoicesTool::new(client.clone())),
            Arc::new(GetInvoiceTool::new(client.clone())),
            Arc::new(UpdateInvoiceStatusTool::new(client.clone())),
            Arc::new(RegisterInvoiceNumberTool::new(client.clone())),
            Arc::new(DraftPaymentReminderTool::new(client.clone())),
            Arc::new(PolishTextTool::new(client)),
        ])
    }

    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self.tools.values().map(|t| t.schema()).collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    async fn run(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };
        let args = if args.is_null() { json!({}) } else { args };
        validate_args(&tool.schema().input_schema, &args).map_err(ToolError::InvalidArguments)?;
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
            result = tool.execute(args, ctx) => result,
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn schemas(&self) -> Vec<ToolSchema> {
        self.list()
    }

    async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutput {
        match self.run(name, args, ctx).await {
            Ok(value) => {
                tracing::debug!(tool = name, "tool call succeeded");
                ToolOutput::ok(value)
            }
            Err(err) => {
                tracing::warn!(tool = name, kind = err.kind(), error = %err, "tool call failed");
                ToolOutput::failed(&err)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        if schema.input_schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path: "$".to_string(),
                reason: "tool input must be an object schema".to_string(),
            });
        }
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }
    if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
        let props = obj.get("properties").and_then(|v| v.as_object());
        for key in required.iter().filter_map(Value::as_str) {
            if !props.is_some_and(|p| p.contains_key(key)) {
                return Err(ToolSchemaValidationError {
                    tool_name: tool_name.to_string(),
                    path: path.to_string(),
                    reason: format!("required property `{key}` is not declared"),
                });
            }
        }
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    Ok(())
}

/// Checks call arguments against the subset of JSON Schema the catalog uses:
/// object shape, `required`, primitive `type` and `enum`.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match obj.get(key) {
                None | Some(Value::Null) => return Err(format!("missing required field `{key}`")),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return Err(format!("field `{key}` must not be empty"))
                }
                _ => {}
            }
        }
    }
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in obj {
        if value.is_null() {
            continue;
        }
        let Some(prop) = props.get(key) else {
            continue;
        };
        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return Err(format!("field `{key}` must be of type {expected}"));
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let names = allowed
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(format!("field `{key}` must be one of: {names}"));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn registry() -> ToolRegistry {
        ToolRegistry::invoicing(RecordApiClient::new(&RecordApiConfig::default()))
    }

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"lines":{"type":"array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.lines"));
    }

    #[test]
    fn validator_rejects_undeclared_required_property() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: String::new(),
            input_schema: json!({"type":"object","properties":{},"required":["invoiceId"]}),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("undeclared required");
        assert!(err.reason.contains("invoiceId"));
    }

    #[test]
    fn registry_schemas_are_unique_and_valid() {
        let schemas = registry().list();
        validate_tool_schemas(&schemas).expect("registry tool schemas should validate");
        let unique = schemas
            .iter()
            .map(|schema| schema.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), schemas.len(), "tool schemas must be unique by name");
        assert_eq!(
            unique,
            HashSet::from([
                "draft_payment_reminder",
                "get_invoice",
                "list_invoices",
                "polish_text",
                "register_invoice_number",
                "update_invoice_status",
            ])
        );
    }

    #[test]
    fn args_validation_reports_missing_and_mistyped_fields() {
        let schema = json!({
            "type": "object",
            "properties": {
                "invoiceId": {"type": "string"},
                "status": {"type": "string", "enum": ["draft", "paid"]},
                "limit": {"type": "integer"}
            },
            "required": ["invoiceId"]
        });
        assert!(validate_args(&schema, &json!({"invoiceId": "inv_1"})).is_ok());
        assert!(validate_args(&schema, &json!({}))
            .unwrap_err()
            .contains("invoiceId"));
        assert!(validate_args(&schema, &json!({"invoiceId": "  "}))
            .unwrap_err()
            .contains("empty"));
        assert!(validate_args(&schema, &json!({"invoiceId": "a", "limit": "ten"}))
            .unwrap_err()
            .contains("integer"));
        assert!(validate_args(&schema, &json!({"invoiceId": "a", "status": "void"}))
            .unwrap_err()
            .contains("draft, paid"));
        assert!(validate_args(&schema, &json!(["a"])).is_err());
    }

    #[tokio::test]
    async fn unknown_tool_yields_structured_error() {
        let out = registry()
            .execute("delete_everything", json!({}), &ToolContext::default())
            .await;
        assert!(out.is_error);
        assert_eq!(out.value["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_record_api() {
        let out = registry()
            .execute(
                "update_invoice_status",
                json!({"invoiceId": "inv_1", "status": "shredded"}),
                &ToolContext::default(),
            )
            .await;
        assert!(out.is_error);
        assert_eq!(out.value["error"], "invalid_arguments");
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = ToolContext::default();
        ctx.cancel.cancel();
        let out = registry()
            .execute("list_invoices", json!({}), &ctx)
            .await;
        assert!(out.is_error);
        assert_eq!(out.value["error"], "cancelled");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential {
            authorization: Some("Bearer secret-token".to_string()),
            cookie: None,
        };
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }
}
