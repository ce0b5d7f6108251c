//! Remote host forwarding over HTTP.
//!
//! A remote tuner is another instance reachable at `http://<host>`. Streams
//! are pulled from `/api/channels/<type>/<channel>/stream` and EPG data is
//! imported from `/api/programs`.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info};
use reqwest::Client;
use tokio::sync::broadcast;
use tunerd_model::{service_item_id, ChannelKey, Program, TunerError};

use crate::catalog::Catalog;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_error(err: reqwest::Error) -> TunerError {
    TunerError::Io(err.to_string())
}

/// Client for one remote host.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    host: String,
    client: Client,
}

impl RemoteClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            client: Client::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn stream_url(&self, channel: &ChannelKey) -> String {
        format!(
            "http://{}/api/channels/{}/{}/stream",
            self.host, channel.channel_type, channel.channel
        )
    }

    pub fn programs_url(&self, network_id: u16, service_id: u16) -> String {
        format!(
            "http://{}/api/programs?networkId={}&serviceId={}",
            self.host, network_id, service_id
        )
    }

    /// Open the remote stream for `channel`.
    pub async fn open_stream(&self, channel: &ChannelKey) -> Result<reqwest::Response, TunerError> {
        let url = self.stream_url(channel);
        info!("[Remote] GET {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http_error)?;
        Ok(response)
    }

    /// Copy a streaming response body into `tx`.
    pub async fn forward(
        response: reqwest::Response,
        tx: broadcast::Sender<Bytes>,
        mut on_chunk: impl FnMut(usize),
    ) -> Result<u64, TunerError> {
        let mut body = response.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(http_error)?;
            if chunk.is_empty() {
                continue;
            }
            total += chunk.len() as u64;
            on_chunk(chunk.len());
            let _ = tx.send(chunk);
        }
        Ok(total)
    }

    pub async fn fetch_programs(
        &self,
        network_id: u16,
        service_id: u16,
    ) -> Result<Vec<Program>, TunerError> {
        let url = self.programs_url(network_id, service_id);
        debug!("[Remote] GET {}", url);
        let programs = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http_error)?
            .json::<Vec<Program>>()
            .await
            .map_err(http_error)?;
        Ok(programs)
    }

    /// Replace the programs of every known service on `channel` with the
    /// remote host's copy. Returns the number of programs imported.
    pub async fn import_programs(
        &self,
        catalog: &Catalog,
        channel: &ChannelKey,
    ) -> Result<usize, TunerError> {
        let mut imported = 0;
        for service in catalog.services.find_by_channel(channel) {
            let programs = self
                .fetch_programs(service.network_id, service.service_id)
                .await?;
            imported += programs.len();
            catalog.programs.import(
                service_item_id(service.network_id, service.service_id),
                programs,
            );
        }
        info!(
            "[Remote] Imported {} programs for {} from {}",
            imported, channel, self.host
        );
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunerd_model::ChannelType;

    #[test]
    fn test_urls() {
        let client = RemoteClient::new("192.168.0.10:40772");
        assert_eq!(
            client.stream_url(&ChannelKey::new(ChannelType::Bs, "BS15_0")),
            "http://192.168.0.10:40772/api/channels/BS/BS15_0/stream"
        );
        assert_eq!(
            client.programs_url(4, 101),
            "http://192.168.0.10:40772/api/programs?networkId=4&serviceId=101"
        );
    }

    #[test]
    fn test_program_payload_decodes() {
        let body = r#"[{"id":40010100123,"eventId":123,"serviceId":101,"networkId":4,
            "startAt":1700000000000,"duration":1800000,"isFree":true,"name":"News",
            "genres":[{"lv1":0,"lv2":1,"un1":15,"un2":15}]}]"#;
        let programs: Vec<Program> = serde_json::from_str(body).unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].id, tunerd_model::program_id(4, 101, 123));
        assert_eq!(programs[0].name.as_deref(), Some("News"));
    }
}
