use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use url::Url;

use crate::cache::{Fetcher, Record, ResourceKey, SubjectId};
use crate::config::Config;

use super::api_types::ApiResponse;

/// Spreadsheet API client
#[derive(Clone)]
pub struct SheetsClient {
  http: reqwest::Client,
  base_url: Url,
  sheet_param: String,
  subject_param: String,
  /// Sheet name per resource key
  sheets: std::collections::HashMap<String, String>,
}

impl SheetsClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid API url '{}': {}", config.api.url, e))?;

    let mut headers = HeaderMap::new();
    if let Some(token) = Config::get_api_token() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let sheets = config
      .resources
      .iter()
      .map(|r| (r.name.clone(), r.sheet().to_string()))
      .collect();

    Ok(Self {
      http,
      base_url,
      sheet_param: config.api.sheet_param.clone(),
      subject_param: config.api.subject_param.clone(),
      sheets,
    })
  }

  /// URL that returns `resource`'s rows for `subject`.
  pub fn rows_url(&self, resource: &ResourceKey, subject: &SubjectId) -> Url {
    let sheet = self
      .sheets
      .get(resource.as_str())
      .map(String::as_str)
      .unwrap_or(resource.as_str());

    let mut url = self.base_url.clone();
    url
      .query_pairs_mut()
      .append_pair(&self.sheet_param, sheet)
      .append_pair(&self.subject_param, subject.as_str());
    url
  }

  /// Fetch all rows of a resource for a subject
  pub async fn fetch_rows(&self, resource: &ResourceKey, subject: &SubjectId) -> Result<Vec<Record>> {
    let url = self.rows_url(resource, subject);
    tracing::debug!(%resource, %subject, "fetching rows");

    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", resource, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to fetch {}: {}", resource, e))?;

    let body: ApiResponse = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", resource, e))?;

    body.into_records()
  }

  /// A cache fetcher bound to one resource and subject.
  pub fn fetcher(&self, resource: &ResourceKey, subject: &SubjectId) -> Fetcher {
    let client = self.clone();
    let resource = resource.clone();
    let subject = subject.clone();
    Fetcher::new(move || {
      let client = client.clone();
      let resource = resource.clone();
      let subject = subject.clone();
      async move { client.fetch_rows(&resource, &subject).await }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client() -> SheetsClient {
    let config = Config::parse(
      r#"
api:
  url: https://example.com/macros/exec?key=abc
resources:
  - name: fms
    sheet: FMS Tasks
"#,
    )
    .unwrap();
    SheetsClient::new(&config).unwrap()
  }

  #[test]
  fn test_rows_url_uses_sheet_name() {
    let url = client().rows_url(&"fms".into(), &"alice@example.com".into());
    assert_eq!(
      url.as_str(),
      "https://example.com/macros/exec?key=abc&sheet=FMS+Tasks&user=alice%40example.com"
    );
  }

  #[test]
  fn test_rows_url_defaults_to_resource_name() {
    let url = client().rows_url(&"delegation".into(), &"bob".into());
    assert_eq!(
      url.query(),
      Some("key=abc&sheet=delegation&user=bob")
    );
  }
}
