//! Outbound delivery of a stored record to a remote HTTP endpoint
//!
//! The payload is streamed as a `multipart/form-data` POST with a single
//! file field named `File`. The remote response body is handed back as text.

use crate::error::{Result, StorageError};
use crate::events::StorageEvent;
use crate::record;
use crate::store::Store;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Multipart field carrying the payload
pub const FILE_FIELD: &str = "File";

impl Store {
    /// POST record `id` to `url`; `headers` are added to the request
    pub async fn send(&self, id: u64, url: &str, headers: Option<HeaderMap>) -> Result<String> {
        let result = self.deliver(id, url, headers).await;
        if let Err(ref e) = result {
            self.events().error(Some(id), e.to_string());
        }
        result
    }

    async fn deliver(&self, id: u64, url: &str, headers: Option<HeaderMap>) -> Result<String> {
        let record = self.stat(id).await?;
        let stream = record::open_payload(&self.record_path(id), id, 0, record.length).await?;

        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(stream)), record.length)
            .file_name(record.name.clone())
            .mime_str(&record.content_type)?;
        let form = Form::new().part(FILE_FIELD, part);

        let mut request_headers = headers.unwrap_or_default();
        request_headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));

        let client = Client::builder()
            .timeout(self.delivery_timeout)
            .build()
            .map_err(|e| StorageError::Delivery(format!("client: {}", e)))?;

        debug!(id, url = %url, "Sending record");
        let response = client
            .post(url)
            .headers(request_headers)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        info!(id, url = %url, status = status.as_u16(), "Sent record");

        self.events().emit(StorageEvent::Send {
            id,
            header: record,
            url: url.to_string(),
        });
        Ok(body)
    }
}
