use std::time::Duration;

use reqwest::{Client, Url};
use serde_json::Value;

use crate::error::HubError;
use crate::types::HubResult;

/// Client for the read-only results API. A plain request/response
/// pass-through; nothing here touches the feed session.
pub struct ResultsClient {
    base_url: Url,
    client: Client,
}

pub struct ResultsClientArgs {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
}

impl ResultsClient {
    pub fn new(args: ResultsClientArgs) -> HubResult<Self> {
        let base_url = Url::parse(&args.base_url)
            .map_err(|e| HubError::ResultsFetchError(format!("bad results url: {e}")))?;
        let client = Client::builder()
            .user_agent(format!("dob-edge/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(args.connect_timeout)
            .timeout(args.socket_timeout)
            .build()
            .map_err(|e| HubError::ResultsFetchError(e.to_string()))?;
        Ok(ResultsClient { base_url, client })
    }

    fn endpoint(&self, segments: &[&str]) -> HubResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                HubError::ResultsFetchError("results url cannot be a base".into())
            })?;
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn get(&self, mut url: Url, range: (Option<&str>, Option<&str>)) -> HubResult<Value> {
        if let Some(from) = range.0 {
            url.query_pairs_mut().append_pair("from", from);
        }
        if let Some(to) = range.1 {
            url.query_pairs_mut().append_pair("to", to);
        }
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(HubError::ResultsFetchError(format!(
                "results upstream answered {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    pub async fn competitions(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> HubResult<Value> {
        let url = self.endpoint(&["competitions"])?;
        self.get(url, (from, to)).await
    }

    pub async fn games(
        &self,
        sport_id: u64,
        from: Option<&str>,
        to: Option<&str>,
    ) -> HubResult<Value> {
        let url = self.endpoint(&["games", &sport_id.to_string()])?;
        self.get(url, (from, to)).await
    }

    pub async fn game(&self, game_id: u64) -> HubResult<Value> {
        let url = self.endpoint(&["game", &game_id.to_string()])?;
        self.get(url, (None, None)).await
    }
}
