//! Supervisor-side protocol client.

use crate::messages::{InputEvent, OutputEvent, StartData};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use w3f_types::ContextData;

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("timed out connecting to the guest protocol server after {0:?}")]
    ConnectTimeout(Duration),
    #[error("protocol transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("guest protocol server replied with status {0}")]
    Status(u16),
}

/// Client for the guest's protocol endpoint at
/// `http://<host>:<port>/<mount_path>`.
pub struct ProtocolClient {
    base_url: String,
    http: reqwest::Client,
}

impl ProtocolClient {
    pub fn new(host: &str, port: u16, mount_path: &str) -> Self {
        // No overall request timeout: the reply to `input_event` is the
        // terminal output event and the supervisor bounds it externally.
        let http = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(1))
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://{host}:{port}/{mount_path}"),
            http,
        }
    }

    /// Polls the guest until it answers its ping route, or the start-up
    /// budget elapses.
    pub async fn connect(&self, budget: Duration) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + budget;
        let url = format!("{}/ping", self.base_url);
        loop {
            let probe = self
                .http
                .get(&url)
                .timeout(CONNECT_PROBE_TIMEOUT)
                .send()
                .await;
            if let Ok(resp) = probe {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if Instant::now() + CONNECT_POLL_INTERVAL >= deadline {
                return Err(ProtocolError::ConnectTimeout(budget));
            }
            sleep(CONNECT_POLL_INTERVAL).await;
        }
    }

    /// Sends the single `start` message. The HTTP response carries the
    /// guest's terminal `output_event`; this future stays pending for as
    /// long as the handler runs.
    pub async fn send_start(&self, context: ContextData) -> Result<OutputEvent, ProtocolError> {
        let url = format!("{}/input_event", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&InputEvent::Start(StartData { context }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ProtocolError::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<OutputEvent>().await?)
    }
}
