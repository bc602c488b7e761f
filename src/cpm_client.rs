// HTTP access to the CP feed and the Overpass railway data
use crate::cpm_config::CPMConfig;
use crate::cpm_models::{
    CPMError, Result, StationIndex, TrainDetail, TrainSnapshot, parse_station_index,
    parse_station_trains, parse_train_detail,
};
use log::debug;
use reqwest::Client;
use std::future::Future;
use std::time::Duration;

/// Upstream train data. Every call is bounded by a timeout and never touches caches.
pub trait TrainFeed: Send + Sync + 'static {
    fn fetch_station_index(&self) -> impl Future<Output = Result<StationIndex>> + Send;

    fn fetch_station_trains(
        &self,
        station_id: &str,
    ) -> impl Future<Output = Result<Vec<TrainSnapshot>>> + Send;

    fn fetch_train_detail(&self, train_id: &str) -> impl Future<Output = Result<TrainDetail>> + Send;
}

pub struct CPMClient {
    http: Client,
    base_url: String,
    overpass_url: String,
}

impl CPMClient {
    const OVERPASS_TIMEOUT_SECS: u64 = 60;

    pub fn new(config: &CPMConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CPMError::UpstreamError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(CPMClient {
            http,
            base_url: config.api_base_url.clone(),
            overpass_url: config.overpass_url.clone(),
        })
    }

    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);

        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| upstream(&format!("Failed to fetch {}", path), e))?;

        if !response.status().is_success() {
            return Err(CPMError::UpstreamError(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| upstream(&format!("Failed to read {}", path), e))
    }

    /// Raw Overpass JSON for the given query.
    pub async fn fetch_overpass(&self, query: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.overpass_url)
            .timeout(Duration::from_secs(Self::OVERPASS_TIMEOUT_SECS))
            .body(query.to_string())
            .send()
            .await
            .map_err(|e| upstream("Failed to fetch railway data", e))?;

        if !response.status().is_success() {
            return Err(CPMError::UpstreamError(format!(
                "Overpass returned {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| upstream("Failed to read railway data", e))
    }
}

impl TrainFeed for CPMClient {
    async fn fetch_station_index(&self) -> Result<StationIndex> {
        let body = self.get_text("station-index", &[]).await?;
        parse_station_index(&body)
    }

    async fn fetch_station_trains(&self, station_id: &str) -> Result<Vec<TrainSnapshot>> {
        let body = self
            .get_text("station/trains", &[("stationId", station_id)])
            .await?;
        parse_station_trains(&body)
    }

    async fn fetch_train_detail(&self, train_id: &str) -> Result<TrainDetail> {
        let body = self
            .get_text("station/trains/train", &[("trainId", train_id)])
            .await?;
        parse_train_detail(train_id, &body)
    }
}

fn upstream(context: &str, e: reqwest::Error) -> CPMError {
    if e.is_timeout() {
        CPMError::UpstreamTimeout(format!("{}: {}", context, e))
    } else {
        CPMError::UpstreamError(format!("{}: {}", context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_upstream_fails_instead_of_hanging() {
        let config = CPMConfig {
            // Reserved TEST-NET address, nothing answers there.
            api_base_url: "http://192.0.2.1:9".to_string(),
            request_timeout: Duration::from_millis(200),
            ..CPMConfig::default()
        };
        let client = CPMClient::new(&config).unwrap();

        let outcome = client.fetch_station_trains("94-31039").await;
        assert!(matches!(
            outcome,
            Err(CPMError::UpstreamTimeout(_)) | Err(CPMError::UpstreamError(_))
        ));
    }
}
