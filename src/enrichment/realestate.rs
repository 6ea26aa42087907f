use log::{debug, info};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::EnrichmentError;
use crate::core::config::RealEstateConfig;
use crate::leads::Lead;

const PROVIDER: &str = "RealEstateAPI";

pub const BULK_SKIP_TRACE_LIMIT: usize = 250;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipTraceInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl SkipTraceInput {
    pub fn from_lead(lead: &Lead) -> Self {
        Self {
            first_name: lead.first_name.clone(),
            last_name: lead.last_name.clone(),
            address: lead.address.clone(),
            city: lead.city.clone(),
            state: lead.state.clone(),
            zip: lead.zip.clone(),
            email: lead.email.clone(),
            phone: lead.phone.clone(),
        }
    }

    /// A trace needs a street address with a zip, or with a city and state.
    pub fn is_traceable(&self) -> bool {
        self.address.is_some()
            && (self.zip.is_some() || (self.city.is_some() && self.state.is_some()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracedPhone {
    pub phone_number: String,
    pub phone_type: Option<String>,
    pub is_connected: Option<bool>,
    pub is_primary: Option<bool>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracedEmail {
    pub email_address: String,
    pub is_valid: Option<bool>,
    pub is_primary: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkipTraceOutput {
    #[serde(default)]
    pub phones: Vec<TracedPhone>,
    #[serde(default)]
    pub emails: Vec<TracedEmail>,
    pub identity: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkipTraceResult {
    #[serde(default)]
    pub success: bool,
    pub output: Option<SkipTraceOutput>,
    pub match_score: Option<f64>,
}

impl SkipTraceResult {
    /// Primary, then connected, then the highest score. Disconnected lines
    /// are never chosen.
    pub fn best_phone(&self) -> Option<&str> {
        let phones = &self.output.as_ref()?.phones;
        phones
            .iter()
            .filter(|p| p.is_connected != Some(false))
            .max_by(|a, b| {
                let rank = |p: &TracedPhone| {
                    (
                        p.is_primary.unwrap_or(false),
                        p.is_connected.unwrap_or(false),
                        p.score.unwrap_or(0.0),
                    )
                };
                let (ap, ac, asc) = rank(a);
                let (bp, bc, bsc) = rank(b);
                (ap, ac)
                    .cmp(&(bp, bc))
                    .then(asc.partial_cmp(&bsc).unwrap_or(std::cmp::Ordering::Equal))
            })
            .map(|p| p.phone_number.as_str())
    }

    pub fn best_email(&self) -> Option<&str> {
        let emails = &self.output.as_ref()?.emails;
        emails
            .iter()
            .filter(|e| e.is_valid != Some(false))
            .max_by_key(|e| e.is_primary.unwrap_or(false))
            .map(|e| e.email_address.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSkipTraceJob {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub total_requests: u32,
    #[serde(default)]
    pub completed_requests: u32,
    #[serde(default)]
    pub failed_requests: u32,
    pub results: Option<Vec<SkipTraceResult>>,
    pub estimated_completion_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertySearchResult {
    pub count: u64,
    pub data: Vec<Value>,
}

#[derive(Deserialize)]
struct RawSearch {
    #[serde(alias = "resultCount")]
    count: Option<u64>,
    #[serde(alias = "properties")]
    data: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSearchInput {
    pub name: String,
    pub filters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSearch {
    #[serde(alias = "searchId", alias = "search_id")]
    pub id: String,
    #[serde(alias = "searchName", default)]
    pub name: String,
    #[serde(default)]
    pub filters: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SavedSearchList {
    Wrapped { data: Vec<SavedSearch> },
    Bare(Vec<SavedSearch>),
}

pub struct RealEstateClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl RealEstateClient {
    pub fn new(config: &RealEstateConfig) -> Self {
        Self {
            http_client: Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, EnrichmentError> {
        debug!("RealEstateAPI {path}");
        let response = request
            .header("x-api-key", &self.api_key)
            .header("x-user-id", "nextier")
            .send()
            .await
            .map_err(|e| EnrichmentError::Network(e.to_string()))?;
        super::read_json(PROVIDER, response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, EnrichmentError> {
        let request = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        self.send(request, path).await
    }

    pub async fn search_properties(&self, filters: &Value) -> Result<PropertySearchResult, EnrichmentError> {
        let raw: RawSearch = self.post("/v2/PropertySearch", filters).await?;
        let data = raw.data.unwrap_or_default();
        Ok(PropertySearchResult {
            count: raw.count.unwrap_or(data.len() as u64),
            data,
        })
    }

    pub async fn property_detail(&self, query: &Value) -> Result<Value, EnrichmentError> {
        self.post("/v2/PropertyDetail", query).await
    }

    pub async fn property_comps(&self, query: &Value) -> Result<Value, EnrichmentError> {
        self.post("/v2/PropertyComps", query).await
    }

    pub async fn create_saved_search(&self, input: &SavedSearchInput) -> Result<SavedSearch, EnrichmentError> {
        let body = serde_json::json!({
            "search_name": input.name,
            "search_query": input.filters,
        });
        self.post("/v1/SavedSearch/Create", &body).await
    }

    pub async fn list_saved_searches(&self) -> Result<Vec<SavedSearch>, EnrichmentError> {
        let list: SavedSearchList = self
            .post("/v1/SavedSearch/List", &serde_json::json!({}))
            .await?;
        Ok(match list {
            SavedSearchList::Wrapped { data } => data,
            SavedSearchList::Bare(data) => data,
        })
    }

    pub async fn skip_trace(&self, input: &SkipTraceInput) -> Result<SkipTraceResult, EnrichmentError> {
        if !input.is_traceable() {
            return Err(EnrichmentError::Invalid(
                "skip trace needs an address with a zip or city and state".to_string(),
            ));
        }
        self.post("/v2/SkipTrace", input).await
    }

    pub async fn bulk_skip_trace(
        &self,
        inputs: &[SkipTraceInput],
        webhook_url: Option<&str>,
    ) -> Result<BulkSkipTraceJob, EnrichmentError> {
        if inputs.is_empty() {
            return Err(EnrichmentError::Invalid("no skip trace inputs".to_string()));
        }
        if inputs.len() > BULK_SKIP_TRACE_LIMIT {
            return Err(EnrichmentError::TooMany {
                given: inputs.len(),
                limit: BULK_SKIP_TRACE_LIMIT,
            });
        }
        let body = serde_json::json!({ "inputs": inputs, "webhook_url": webhook_url });
        let job: BulkSkipTraceJob = self.post("/v2/SkipTrace/Bulk", &body).await?;
        info!("Submitted bulk skip trace {} ({} inputs)", job.job_id, inputs.len());
        Ok(job)
    }

    pub async fn bulk_skip_trace_status(&self, job_id: &str) -> Result<BulkSkipTraceJob, EnrichmentError> {
        let path = format!("/v2/SkipTrace/Bulk/{}", urlencoding::encode(job_id));
        let request = self.http_client.get(format!("{}{}", self.base_url, path));
        self.send(request, &path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> RealEstateClient {
        RealEstateClient::new(&RealEstateConfig {
            api_key: "re-key".to_string(),
            base_url: server.url(),
        })
    }

    fn input() -> SkipTraceInput {
        SkipTraceInput {
            first_name: Some("Maria".into()),
            last_name: Some("Ruiz".into()),
            address: Some("12 Elm St".into()),
            zip: Some("78701".into()),
            ..Default::default()
        }
    }

    fn phone(number: &str, primary: bool, connected: Option<bool>, score: f64) -> TracedPhone {
        TracedPhone {
            phone_number: number.to_string(),
            phone_type: Some("mobile".into()),
            is_connected: connected,
            is_primary: Some(primary),
            score: Some(score),
        }
    }

    #[test]
    fn picks_primary_connected_phone() {
        let result = SkipTraceResult {
            success: true,
            output: Some(SkipTraceOutput {
                phones: vec![
                    phone("5550000001", false, Some(true), 99.0),
                    phone("5550000002", true, Some(false), 90.0),
                    phone("5550000003", true, Some(true), 40.0),
                ],
                emails: vec![
                    TracedEmail {
                        email_address: "old@example.com".into(),
                        is_valid: Some(false),
                        is_primary: Some(true),
                    },
                    TracedEmail {
                        email_address: "maria@example.com".into(),
                        is_valid: Some(true),
                        is_primary: Some(false),
                    },
                ],
                identity: None,
            }),
            match_score: None,
        };
        assert_eq!(result.best_phone(), Some("5550000003"));
        assert_eq!(result.best_email(), Some("maria@example.com"));
        assert_eq!(SkipTraceResult::default().best_phone(), None);
    }

    #[test]
    fn traceability_needs_a_located_address() {
        assert!(input().is_traceable());
        assert!(!SkipTraceInput {
            first_name: Some("Maria".into()),
            ..Default::default()
        }
        .is_traceable());
    }

    #[tokio::test]
    async fn bulk_is_capped_before_the_network() {
        let server = mockito::Server::new_async().await;
        let inputs = vec![input(); BULK_SKIP_TRACE_LIMIT + 1];
        let err = client(&server).bulk_skip_trace(&inputs, None).await.unwrap_err();
        assert!(matches!(err, EnrichmentError::TooMany { given: 251, limit: 250 }));
    }

    #[tokio::test]
    async fn skip_trace_sends_snake_case_input() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/SkipTrace")
            .match_header("x-api-key", "re-key")
            .match_body(Matcher::Json(serde_json::json!({
                "first_name": "Maria",
                "last_name": "Ruiz",
                "address": "12 Elm St",
                "zip": "78701"
            })))
            .with_status(200)
            .with_body(r#"{"success":true,"output":{"phones":[{"phone_number":"5125550101","is_primary":true}],"emails":[]}}"#)
            .create_async()
            .await;

        let result = client(&server).skip_trace(&input()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(result.best_phone(), Some("5125550101"));
    }

    #[tokio::test]
    async fn search_reads_either_count_field() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/PropertySearch")
            .with_status(200)
            .with_body(r#"{"resultCount":1200,"data":[{"id":"p1"},{"id":"p2"}]}"#)
            .create_async()
            .await;

        let found = client(&server)
            .search_properties(&serde_json::json!({ "state": "TX", "size": 2 }))
            .await
            .unwrap();
        assert_eq!(found.count, 1200);
        assert_eq!(found.data.len(), 2);
    }

    #[tokio::test]
    async fn upstream_failures_name_the_provider() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/PropertyDetail")
            .with_status(401)
            .with_body(r#"{"message":"Invalid API key"}"#)
            .create_async()
            .await;

        let err = client(&server)
            .property_detail(&serde_json::json!({ "id": "p1" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "RealEstateAPI error 401: Invalid API key");
    }
}
