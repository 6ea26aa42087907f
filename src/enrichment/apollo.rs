use log::debug;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::EnrichmentError;
use crate::core::config::ApolloConfig;

const PROVIDER: &str = "Apollo";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub reveal_phone_number: bool,
}

impl PersonMatch {
    /// Apollo needs an email, a LinkedIn URL, or a name plus a company.
    pub fn is_matchable(&self) -> bool {
        let named = self.first_name.is_some() && self.last_name.is_some();
        let company = self.organization_name.is_some() || self.domain.is_some();
        self.email.is_some() || self.linkedin_url.is_some() || (named && company)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApolloPhone {
    pub raw_number: Option<String>,
    pub sanitized_number: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApolloOrganization {
    pub id: Option<String>,
    pub name: Option<String>,
    pub website_url: Option<String>,
    pub primary_domain: Option<String>,
    pub industry: Option<String>,
    pub estimated_num_employees: Option<i64>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApolloPerson {
    pub id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub email_status: Option<String>,
    pub title: Option<String>,
    pub linkedin_url: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub phone_numbers: Vec<ApolloPhone>,
    pub organization: Option<ApolloOrganization>,
}

impl ApolloPerson {
    pub fn best_phone(&self) -> Option<&str> {
        self.phone_numbers
            .iter()
            .find_map(|p| p.sanitized_number.as_deref().or(p.raw_number.as_deref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonMatchResponse {
    pub person: Option<ApolloPerson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationResponse {
    pub organization: Option<ApolloOrganization>,
}

pub struct ApolloClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl ApolloClient {
    pub fn new(config: &ApolloConfig) -> Self {
        Self {
            http_client: Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Apollo takes the key in the JSON body next to the query fields.
    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, EnrichmentError> {
        let mut payload =
            serde_json::to_value(body).map_err(|e| EnrichmentError::Parse(e.to_string()))?;
        if let Value::Object(map) = &mut payload {
            map.insert("api_key".to_string(), Value::String(self.api_key.clone()));
        }

        debug!("Apollo POST {path}");
        let response = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .header("Cache-Control", "no-cache")
            .json(&payload)
            .send()
            .await
            .map_err(|e| EnrichmentError::Network(e.to_string()))?;

        super::read_json(PROVIDER, response).await
    }

    pub async fn match_person(&self, query: &PersonMatch) -> Result<PersonMatchResponse, EnrichmentError> {
        if !query.is_matchable() {
            return Err(EnrichmentError::Invalid(
                "need an email, a LinkedIn URL, or a full name with a company".to_string(),
            ));
        }
        self.post("/people/match", query).await
    }

    pub async fn enrich_organization(&self, domain: &str) -> Result<OrganizationResponse, EnrichmentError> {
        let domain = domain
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("www.")
            .trim_end_matches('/');
        if domain.is_empty() {
            return Err(EnrichmentError::Invalid("domain is required".to_string()));
        }
        self.post("/organizations/enrich", &serde_json::json!({ "domain": domain }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> ApolloClient {
        ApolloClient::new(&ApolloConfig {
            api_key: "apollo-key".to_string(),
            base_url: server.url(),
        })
    }

    #[tokio::test]
    async fn matches_person_with_key_in_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/people/match")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "api_key": "apollo-key",
                "email": "maria@ruizroofing.com"
            })))
            .with_status(200)
            .with_body(r#"{"person":{"id":"p1","first_name":"Maria","email":"maria@ruizroofing.com","phone_numbers":[{"raw_number":"(512) 555-0101","sanitized_number":"+15125550101","type":"mobile"}],"organization":{"name":"Ruiz Roofing","primary_domain":"ruizroofing.com"}}}"#)
            .create_async()
            .await;

        let found = client(&server)
            .match_person(&PersonMatch {
                email: Some("maria@ruizroofing.com".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        mock.assert_async().await;
        let person = found.person.unwrap();
        assert_eq!(person.best_phone(), Some("+15125550101"));
        assert_eq!(person.organization.unwrap().name.as_deref(), Some("Ruiz Roofing"));
    }

    #[tokio::test]
    async fn refuses_unmatchable_queries_locally() {
        let server = mockito::Server::new_async().await;
        let err = client(&server)
            .match_person(&PersonMatch {
                first_name: Some("Maria".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichmentError::Invalid(_)));
    }

    #[tokio::test]
    async fn strips_scheme_from_domains() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/organizations/enrich")
            .match_body(Matcher::PartialJson(serde_json::json!({ "domain": "ruizroofing.com" })))
            .with_status(200)
            .with_body(r#"{"organization":{"name":"Ruiz Roofing","estimated_num_employees":12}}"#)
            .create_async()
            .await;

        let org = client(&server)
            .enrich_organization("https://www.ruizroofing.com/")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(org.organization.unwrap().estimated_num_employees, Some(12));
    }
}
