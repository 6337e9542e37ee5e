//! Remote CRM client
//!
//! Speaks the CRM's method-per-URL JSON API: `{base}/{entity}.list` for
//! paginated reads and `{base}/{entity}.upsert` for batched writes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::DestinationError;
use crate::services::source::{CrmPage, PageFetcher};
use crate::types::{CrmFilter, MappedRecord, RawRecord};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest response excerpt carried into error messages
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    result: Vec<Map<String, Value>>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    next: Option<u64>,
}

pub struct CrmClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl CrmClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("leadflow-worker/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn endpoint(&self, entity: &str, method: &str) -> String {
        format!("{}/{}.{}", self.base_url, entity, method)
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, DestinationError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DestinationError::Unavailable(format!("request to {} failed: {}", url, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DestinationError::Unavailable(format!("cannot read response: {}", e)))?;

        if status.is_client_error() {
            return Err(DestinationError::Rejected(format!(
                "{} {}",
                status,
                excerpt(&text)
            )));
        }
        if !status.is_success() {
            return Err(DestinationError::Unavailable(format!(
                "{} {}",
                status,
                excerpt(&text)
            )));
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            DestinationError::Unavailable(format!("invalid JSON from {}: {}", url, e))
        })?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let description = value
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Err(DestinationError::Rejected(format!("{} {}", error, description)));
        }
        Ok(value)
    }

    /// Fetch one page of `entity` starting at record offset `start`
    pub async fn list_page(&self, filter: &CrmFilter, start: u64) -> Result<CrmPage, DestinationError> {
        let url = self.endpoint(&filter.entity, "list");
        let body = json!({
            "filter": filter_json(filter),
            "order": { "ID": "ASC" },
            "select": ["*", "UF_*"],
            "start": start,
        });

        let value = self.post(&url, &body).await?;
        let response: ListResponse = serde_json::from_value(value).map_err(|e| {
            DestinationError::Unavailable(format!("unexpected list response: {}", e))
        })?;

        debug!(
            "CRM {} page at {}: {} items, total {:?}, next {:?}",
            filter.entity,
            start,
            response.result.len(),
            response.total,
            response.next
        );

        Ok(CrmPage {
            items: response
                .result
                .into_iter()
                .map(RawRecord::from_json_object)
                .collect(),
            total: response.total,
            next: response.next,
        })
    }

    /// Create or update `items` in `entity`, matched on `key` when given
    pub async fn upsert(
        &self,
        entity: &str,
        key: Option<&str>,
        items: &[MappedRecord],
    ) -> Result<(), DestinationError> {
        let url = self.endpoint(entity, "upsert");
        let body = json!({
            "key": key,
            "items": items.iter().map(MappedRecord::to_json_object).collect::<Vec<_>>(),
        });
        self.post(&url, &body).await?;
        Ok(())
    }

    /// Records of `entity` whose `key_field` is one of `keys`, reduced to `fields`
    pub async fn find_by_keys(
        &self,
        entity: &str,
        key_field: &str,
        fields: &[&str],
        keys: &[String],
    ) -> Result<Vec<Map<String, Value>>, DestinationError> {
        let url = self.endpoint(entity, "list");
        let mut filter = Map::new();
        filter.insert(format!("@{}", key_field), json!(keys));

        let mut items = Vec::new();
        let mut start = 0;
        loop {
            let body = json!({ "filter": filter, "select": fields, "start": start });
            let value = self.post(&url, &body).await?;
            let page: ListResponse = serde_json::from_value(value).map_err(|e| {
                DestinationError::Unavailable(format!("unexpected list response: {}", e))
            })?;
            let next = page.next;
            items.extend(page.result);
            match next {
                Some(next) if next > start => start = next,
                _ => break,
            }
        }
        Ok(items)
    }

    /// Cheapest call proving the entity endpoint answers
    pub async fn ping(&self, entity: &str) -> Result<(), DestinationError> {
        let url = self.endpoint(entity, "list");
        let body = json!({ "filter": { "@ID": [] }, "select": ["ID"], "start": 0 });
        self.post(&url, &body).await?;
        Ok(())
    }
}

#[async_trait]
impl PageFetcher for CrmClient {
    async fn fetch_page(&self, filter: &CrmFilter, start: u64) -> Result<CrmPage> {
        Ok(self.list_page(filter, start).await?)
    }
}

/// Build the CRM list filter from the job's source descriptor
pub fn filter_json(filter: &CrmFilter) -> Value {
    let mut out = Map::new();
    if let Some(from) = filter.date_from {
        out.insert(
            ">=DATE_CREATE".to_string(),
            Value::String(format!("{}T00:00:00", from.format("%Y-%m-%d"))),
        );
    }
    if let Some(to) = filter.date_to {
        out.insert(
            "<=DATE_CREATE".to_string(),
            Value::String(format!("{}T23:59:59", to.format("%Y-%m-%d"))),
        );
    }
    if !filter.ids.is_empty() {
        out.insert("@ID".to_string(), json!(filter.ids));
    }
    if let Some(since) = filter.updated_since {
        out.insert(">DATE_MODIFY".to_string(), Value::String(since.to_rfc3339()));
    }
    Value::Object(out)
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_filter_json_uses_crm_operators() {
        let filter = CrmFilter {
            entity: "crm.lead".into(),
            date_from: NaiveDate::from_ymd_opt(2024, 3, 1),
            date_to: NaiveDate::from_ymd_opt(2024, 3, 31),
            ids: vec!["10".into(), "11".into()],
            updated_since: Some(Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()),
        };
        let json = filter_json(&filter);
        assert_eq!(json[">=DATE_CREATE"], "2024-03-01T00:00:00");
        assert_eq!(json["<=DATE_CREATE"], "2024-03-31T23:59:59");
        assert_eq!(json["@ID"], json!(["10", "11"]));
        assert!(json[">DATE_MODIFY"].as_str().unwrap().starts_with("2024-04-01T12:00:00"));
    }

    #[test]
    fn test_empty_filter_is_empty_object() {
        let filter = CrmFilter { entity: "crm.lead".into(), ..Default::default() };
        assert_eq!(filter_json(&filter), json!({}));
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client = CrmClient::new("https://crm.example.com/rest/", None).unwrap();
        assert_eq!(
            client.endpoint("crm.lead", "list"),
            "https://crm.example.com/rest/crm.lead.list"
        );
    }

    #[test]
    fn test_list_response_tolerates_missing_paging_fields() {
        let response: ListResponse =
            serde_json::from_value(json!({ "result": [{ "ID": "1", "TITLE": "Lead" }] })).unwrap();
        assert_eq!(response.result.len(), 1);
        assert!(response.total.is_none());
        assert!(response.next.is_none());
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_ERROR_BODY + 10);
        assert_eq!(excerpt(&long).chars().count(), MAX_ERROR_BODY);
        assert_eq!(excerpt("short"), "short");
    }
}
