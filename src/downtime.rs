use crate::errors::CommandError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_DOWNTIME_SECONDS: i64 = 10_800;

#[derive(Serialize)]
struct CreateDowntimeRequest<'a> {
    message: &'a str,
    scope: Vec<String>,
    end: i64,
}

#[derive(Deserialize)]
struct CreateDowntimeResponse {
    id: i64,
}

/// Datadog-style downtime-window client: opens a scoped downtime at run
/// start, closes it at run end. Best-effort — the roll must not fail
/// because the observability side-channel is unavailable.
pub struct DowntimeWindow {
    api_key: String,
    app_key: String,
    http: reqwest::blocking::Client,
}

impl DowntimeWindow {
    pub fn new(api_key: String, app_key: String) -> Self {
        DowntimeWindow {
            api_key,
            app_key,
            http: reqwest::blocking::Client::new(),
        }
    }

    pub fn start(&self, cluster: &str) -> Result<i64, CommandError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let request = CreateDowntimeRequest {
            message: "Downtime for kubernetes cluster roll",
            scope: vec![format!("cluster:{cluster}")],
            end: now + DEFAULT_DOWNTIME_SECONDS,
        };

        let response = self
            .http
            .post("https://api.datadoghq.com/api/v1/downtime")
            .query(&[("api_key", self.api_key.as_str()), ("application_key", self.app_key.as_str())])
            .json(&request)
            .send()
            .map_err(|e| CommandError::new("failed to open downtime window".to_string(), Some(e.to_string())))?
            .json::<CreateDowntimeResponse>()
            .map_err(|e| CommandError::new("failed to parse downtime window response".to_string(), Some(e.to_string())))?;

        Ok(response.id)
    }

    pub fn end(&self, id: i64) -> Result<(), CommandError> {
        self.http
            .delete(format!("https://api.datadoghq.com/api/v1/downtime/{id}"))
            .query(&[("api_key", self.api_key.as_str()), ("application_key", self.app_key.as_str())])
            .send()
            .map_err(|e| CommandError::new(format!("failed to close downtime window {id}"), Some(e.to_string())))?;
        Ok(())
    }
}
