//! Transport double shared by processor tests.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessingError;
use crate::transport::{ServiceKind, ServiceTransport};

/// Records every request and answers with a fixed response.
pub(crate) struct RecordingTransport {
    response: Result<serde_json::Value, ProcessingError>,
    pub(crate) calls: Mutex<Vec<(ServiceKind, serde_json::Value)>>,
}

impl RecordingTransport {
    pub(crate) fn ok(value: serde_json::Value) -> Self {
        Self {
            response: Ok(value),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(error: ProcessingError) -> Self {
        Self {
            response: Err(error),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn last_call(&self) -> (ServiceKind, serde_json::Value) {
        self.calls
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no call recorded")
    }
}

#[async_trait]
impl ServiceTransport for RecordingTransport {
    async fn call(
        &self,
        service: ServiceKind,
        request: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError> {
        self.calls.lock().unwrap().push((service, request));
        self.response.clone()
    }
}
