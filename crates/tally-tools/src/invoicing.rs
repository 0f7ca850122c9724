use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};

use tally_types::ToolSchema;

use crate::{RecordApiClient, Tool, ToolContext, ToolError};

pub const INVOICE_STATUSES: [&str; 5] = ["draft", "sent", "paid", "overdue", "cancelled"];

const DEFAULT_LIST_LIMIT: u64 = 10;
const MAX_LIST_LIMIT: u64 = 50;

/// Reduces a raw invoice record to the fields the model needs to talk about
/// it. Accepts either a bare record or one wrapped as `{"invoice": {...}}`.
pub fn summarize_invoice(raw: &Value) -> Value {
    let record = raw.get("invoice").filter(|v| v.is_object()).unwrap_or(raw);
    let mut out = Map::new();
    copy_first(record, &mut out, "invoiceId", &["invoiceId", "id", "_id"]);
    copy_first(
        record,
        &mut out,
        "invoiceNumber",
        &["invoiceNumber", "number", "invoice_number"],
    );
    copy_first(record, &mut out, "status", &["status"]);
    if let Some(client) = client_name(record) {
        out.insert("client".to_string(), Value::String(client));
    }
    copy_first(
        record,
        &mut out,
        "total",
        &["total", "totalAmount", "grandTotal", "amount"],
    );
    copy_first(record, &mut out, "currency", &["currency"]);
    copy_first(record, &mut out, "issueDate", &["issueDate", "issuedAt", "date"]);
    copy_first(record, &mut out, "dueDate", &["dueDate", "dueAt"]);
    copy_first(record, &mut out, "paidAt", &["paidAt", "paidDate"]);
    Value::Object(out)
}

fn copy_first(record: &Value, out: &mut Map<String, Value>, target: &str, keys: &[&str]) {
    if let Some(value) = keys
        .iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null())
    {
        out.insert(target.to_string(), value.clone());
    }
}

fn client_name(record: &Value) -> Option<String> {
    for key in ["client", "customer"] {
        match record.get(key) {
            Some(Value::String(name)) => return Some(name.clone()),
            Some(Value::Object(obj)) => {
                if let Some(name) = obj.get("name").and_then(Value::as_str) {
                    return Some(name.to_string());
                }
            }
            _ => {}
        }
    }
    record
        .get("clientName")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Pulls the record list out of the shapes the record API returns.
fn invoice_list(value: &Value) -> Vec<Value> {
    if let Some(items) = value.as_array() {
        return items.clone();
    }
    for key in ["invoices", "data", "items", "results"] {
        if let Some(items) = value.get(key).and_then(Value::as_array) {
            return items.clone();
        }
    }
    Vec::new()
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required field `{key}`")))
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Record ids are interpolated into request paths, so only plain slugs pass.
fn invoice_id(args: &Value) -> Result<&str, ToolError> {
    let id = required_str(args, "invoiceId")?;
    if id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(id)
    } else {
        Err(ToolError::InvalidArguments(format!(
            "invoiceId `{id}` contains unsupported characters"
        )))
    }
}

fn status_enum() -> Value {
    json!(INVOICE_STATUSES)
}

pub struct ListInvoicesTool {
    client: RecordApiClient,
}

impl ListInvoicesTool {
    pub fn new(client: RecordApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for ListInvoicesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "list_invoices".to_string(),
            description: "List the caller's invoices, newest first. Optionally filter by status or client name.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {"type": "string", "enum": status_enum()},
                    "client": {"type": "string", "description": "Client name, partial match"},
                    "limit": {"type": "integer", "description": "Maximum records to return (1-50)"}
                }
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let mut query = vec![
            ("limit", limit.to_string()),
            ("sort", "-issueDate".to_string()),
        ];
        if let Some(status) = optional_str(&args, "status") {
            query.push(("status", status.to_string()));
        }
        if let Some(client) = optional_str(&args, "client") {
            query.push(("client", client.to_string()));
        }
        let raw = self.client.get("/api/invoices", &query, ctx).await?;
        let invoices = invoice_list(&raw)
            .iter()
            .map(summarize_invoice)
            .collect::<Vec<_>>();
        Ok(json!({
            "count": invoices.len(),
            "invoices": invoices,
        }))
    }
}

pub struct GetInvoiceTool {
    client: RecordApiClient,
}

impl GetInvoiceTool {
    pub fn new(client: RecordApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for GetInvoiceTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_invoice".to_string(),
            description: "Fetch one invoice by id or invoice number. With neither, returns the most recent invoice.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "invoiceId": {"type": "string"},
                    "invoiceNumber": {"type": "string"}
                }
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        if optional_str(&args, "invoiceId").is_some() {
            let id = invoice_id(&args)?;
            let raw = self
                .client
                .get(&format!("/api/invoices/{id}"), &[], ctx)
                .await?;
            return Ok(summarize_invoice(&raw));
        }
        let (query, missing) = match optional_str(&args, "invoiceNumber") {
            Some(number) => (
                vec![("number", number.to_string()), ("limit", "1".to_string())],
                format!("no invoice numbered {number}"),
            ),
            None => (
                vec![
                    ("limit", "1".to_string()),
                    ("sort", "-issueDate".to_string()),
                ],
                "no invoices on record".to_string(),
            ),
        };
        let raw = self.client.get("/api/invoices", &query, ctx).await?;
        invoice_list(&raw)
            .first()
            .map(summarize_invoice)
            .ok_or(ToolError::NotFound(missing))
    }
}

pub struct UpdateInvoiceStatusTool {
    client: RecordApiClient,
}

impl UpdateInvoiceStatusTool {
    pub fn new(client: RecordApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for UpdateInvoiceStatusTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "update_invoice_status".to_string(),
            description: "Change the status of an invoice, e.g. mark it paid or sent.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "invoiceId": {"type": "string"},
                    "status": {"type": "string", "enum": status_enum()}
                },
                "required": ["invoiceId", "status"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let id = invoice_id(&args)?;
        let status = required_str(&args, "status")?;
        let raw = self
            .client
            .send(
                Method::PATCH,
                &format!("/api/invoices/{id}"),
                json!({"status": status}),
                ctx,
            )
            .await?;
        let mut summary = summarize_invoice(&raw);
        if let Some(obj) = summary.as_object_mut() {
            obj.entry("invoiceId")
                .or_insert_with(|| Value::String(id.to_string()));
            obj.insert("updated".to_string(), Value::Bool(true));
        }
        Ok(summary)
    }
}

pub struct RegisterInvoiceNumberTool {
    client: RecordApiClient,
}

impl RegisterInvoiceNumberTool {
    pub fn new(client: RecordApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for RegisterInvoiceNumberTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "register_invoice_number".to_string(),
            description: "Assign an official invoice number to a draft invoice.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "invoiceId": {"type": "string"},
                    "invoiceNumber": {"type": "string"}
                },
                "required": ["invoiceId", "invoiceNumber"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let id = invoice_id(&args)?;
        let number = required_str(&args, "invoiceNumber")?;
        let raw = self
            .client
            .send(
                Method::PUT,
                &format!("/api/invoices/{id}/number"),
                json!({"invoiceNumber": number}),
                ctx,
            )
            .await?;
        let mut summary = summarize_invoice(&raw);
        if let Some(obj) = summary.as_object_mut() {
            obj.entry("invoiceId")
                .or_insert_with(|| Value::String(id.to_string()));
            obj.entry("invoiceNumber")
                .or_insert_with(|| Value::String(number.to_string()));
            obj.insert("registered".to_string(), Value::Bool(true));
        }
        Ok(summary)
    }
}

pub struct DraftPaymentReminderTool {
    client: RecordApiClient,
}

impl DraftPaymentReminderTool {
    pub fn new(client: RecordApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for DraftPaymentReminderTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "draft_payment_reminder".to_string(),
            description: "Draft a payment reminder email for an unpaid invoice. Nothing is sent.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "invoiceId": {"type": "string"},
                    "tone": {"type": "string", "enum": ["friendly", "firm", "final"]},
                    "language": {"type": "string"}
                },
                "required": ["invoiceId"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let id = invoice_id(&args)?;
        let tone = optional_str(&args, "tone").unwrap_or("friendly");
        let mut body = json!({"tone": tone});
        if let Some(language) = optional_str(&args, "language") {
            body["language"] = Value::String(language.to_string());
        }
        let raw = self
            .client
            .send(
                Method::POST,
                &format!("/api/invoices/{id}/reminder"),
                body,
                ctx,
            )
            .await?;
        let subject = raw.get("subject").and_then(Value::as_str);
        let text = raw
            .get("body")
            .or_else(|| raw.get("text"))
            .and_then(Value::as_str);
        let Some(text) = text else {
            return Err(ToolError::InvalidResponse(
                "reminder draft has no body".to_string(),
            ));
        };
        Ok(json!({
            "invoiceId": id,
            "tone": tone,
            "subject": subject,
            "body": text,
        }))
    }
}

pub struct PolishTextTool {
    client: RecordApiClient,
}

impl PolishTextTool {
    pub fn new(client: RecordApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for PolishTextTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "polish_text".to_string(),
            description: "Polish a piece of business text, or translate it when mode is `translate`.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "mode": {"type": "string", "enum": ["polish", "translate"]},
                    "targetLanguage": {"type": "string"}
                },
                "required": ["text"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let text = required_str(&args, "text")?;
        let mode = optional_str(&args, "mode").unwrap_or("polish");
        let target = optional_str(&args, "targetLanguage");
        if mode == "translate" && target.is_none() {
            return Err(ToolError::InvalidArguments(
                "translate mode needs `targetLanguage`".to_string(),
            ));
        }
        let raw = self
            .client
            .send(
                Method::POST,
                "/api/text/polish",
                json!({"text": text, "mode": mode, "targetLanguage": target}),
                ctx,
            )
            .await?;
        let Some(polished) = raw.get("text").and_then(Value::as_str) else {
            return Err(ToolError::InvalidResponse(
                "polish response has no text".to_string(),
            ));
        };
        let mut out = json!({"text": polished, "mode": mode});
        if let Some(target) = target {
            out["targetLanguage"] = Value::String(target.to_string());
        }
        Ok(out)
    }
}
