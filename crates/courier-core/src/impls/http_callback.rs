//! HttpCallbackSink - callback を JSON で POST する（reqwest）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::CallbackRecord;
use crate::ports::{CallbackError, CallbackSink, DeliveryReceipt};

/// POSTs each record to one fixed URL with a request timeout.
///
/// The `reqwest::Client` is cheap to clone and shared by every slot.
#[derive(Debug, Clone)]
pub struct HttpCallbackSink {
    client: reqwest::Client,
    url: reqwest::Url,
    timeout: Duration,
}

impl HttpCallbackSink {
    pub fn new(url: reqwest::Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }

    fn classify(&self, err: reqwest::Error) -> CallbackError {
        if err.is_timeout() {
            CallbackError::Timeout(self.timeout)
        } else if err.is_connect() {
            CallbackError::Connect(err.to_string())
        } else {
            CallbackError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl CallbackSink for HttpCallbackSink {
    async fn deliver(&self, record: &CallbackRecord) -> Result<DeliveryReceipt, CallbackError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(record)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let success = response.status().is_success();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        if success {
            Ok(DeliveryReceipt { status, body })
        } else {
            Err(CallbackError::Status { status, body })
        }
    }
}
