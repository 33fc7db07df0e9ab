use log::debug;
use reqwest::blocking::{Client, Request};

use crate::{secret::Secret, Result};

/// Relays the project info produced by the build to an external API.
pub trait Reporter: Sync {
    fn report(&self, endpoint: &str, bearer_token: Option<&Secret>, project_info: &str)
        -> Result<()>;
}

#[derive(Debug, serde::Serialize)]
struct ProjectInfoReport<'a> {
    #[serde(rename = "buildInfo")]
    build_info: &'a str,
}

pub struct HttpReporter {
    client: Client,
}

impl HttpReporter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds the `POST` request carrying `{"buildInfo": <project info>}`. The `Authorization`
    /// header is only set for a non-empty token.
    pub fn request(
        &self,
        endpoint: &str,
        bearer_token: Option<&Secret>,
        project_info: &str,
    ) -> reqwest::Result<Request> {
        let mut builder = self.client.post(endpoint).json(&ProjectInfoReport {
            build_info: project_info,
        });
        if let Some(token) = bearer_token.filter(|token| !token.is_empty()) {
            builder = builder.bearer_auth(token.expose());
        }
        builder.build()
    }
}

impl Default for HttpReporter {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl Reporter for HttpReporter {
    fn report(
        &self,
        endpoint: &str,
        bearer_token: Option<&Secret>,
        project_info: &str,
    ) -> Result<()> {
        let request = self.request(endpoint, bearer_token, project_info)?;
        let response = self.client.execute(request)?.error_for_status()?;
        debug!("project info accepted with status {}", response.status());
        Ok(())
    }
}
