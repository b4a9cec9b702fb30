//! Result store and queue over HTTP.
//!
//! - `GET {base}/results/{uniqueKey}`: 200 when a result exists, 404 otherwise
//! - `POST {base}/results`: publish one `ResultMessage`; 409 means another
//!   worker published the same key first and is treated as success

use reqwest::Method;
use tillmatch_recon::emitter::StoreError;
use tillmatch_recon::{ResultMessage, ResultPublisher, ResultStore};
use tracing::debug;

use super::common::{HttpError, RemoteClient};

pub struct HttpResultSink {
    client: RemoteClient,
}

impl HttpResultSink {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

impl ResultStore for HttpResultSink {
    fn exists(&self, unique_key: &str) -> Result<bool, StoreError> {
        let url = self.client.endpoint(&["results", unique_key]);
        self.client
            .execute(|http| http.get(url.clone()))
            .map(|body| body.is_some())
            .map_err(store_error)
    }
}

impl ResultPublisher for HttpResultSink {
    fn publish(&self, message: &ResultMessage) -> Result<(), StoreError> {
        let url = self.client.endpoint(&["results"]);
        match self.client.send_json(Method::POST, &url, message) {
            Ok(true) => Ok(()),
            Ok(false) => Err(StoreError::Rejected(format!(
                "{} has no results endpoint",
                self.client.service()
            ))),
            Err(err) if err.status() == Some(409) => {
                debug!(key = message.unique_key(), "result already published upstream");
                Ok(())
            }
            Err(err) => Err(store_error(err)),
        }
    }
}

fn store_error(err: HttpError) -> StoreError {
    if err.is_transient() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Rejected(err.to_string())
    }
}
