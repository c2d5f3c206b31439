//! Meta test: the client describes itself in `key:value` messages.

use ndt_proto::TestKind;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{PhaseDriver, TestContext, TestError, REPLY_TIMEOUT};
use crate::control::{ControlChannel, ControlError};

/// Longest key or value kept, in bytes.
const MAX_FIELD_LEN: usize = 256;
/// Upper bound on pairs accepted from one client.
const MAX_PAIRS: usize = 64;

/// Client facts gathered by the meta test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientMeta {
    pub os: Option<String>,
    pub browser: Option<String>,
    pub application: Option<String>,
    pub kernel: Option<String>,
    pub version: Option<String>,
    /// Every pair received, in order.
    pub additional: Vec<(String, String)>,
}

impl ClientMeta {
    /// Record one pair. Known keys also fill their named field.
    pub fn insert(&mut self, key: &str, value: &str) {
        let value = truncate(value);
        let slot = match key {
            "os" | "client.os.name" => Some(&mut self.os),
            "browser" | "client.browser.name" => Some(&mut self.browser),
            "application" | "client.application" => Some(&mut self.application),
            "kernel" | "client.kernel.version" => Some(&mut self.kernel),
            "version" | "client.version" => Some(&mut self.version),
            _ => None,
        };
        if let Some(slot) = slot {
            *slot = Some(value.clone());
        }
        if self.additional.len() < MAX_PAIRS {
            self.additional.push((truncate(key), value));
        }
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_FIELD_LEN {
        return s.to_string();
    }
    let mut end = MAX_FIELD_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

pub async fn run<S>(_ctx: &TestContext, ctl: &mut ControlChannel<S>) -> Result<Option<ClientMeta>, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut phase = PhaseDriver::new(ctl, TestKind::Meta);
    let outcome = exchange(&mut phase).await;
    phase.conclude(outcome).await
}

async fn exchange<S>(phase: &mut PhaseDriver<'_, S>) -> Result<ClientMeta, TestError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    phase.prepare("").await?;
    phase.start("").await?;

    let invalid = |code| TestError::protocol(code, "Invalid meta data received");
    let mut meta = ClientMeta::default();
    loop {
        let frame = phase
            .recv_msg("meta data", REPLY_TIMEOUT)
            .await
            .map_err(|e| match e {
                TestError::Protocol { code, .. } => invalid(code),
                other => other,
            })?;
        if frame.payload.is_empty() {
            break;
        }
        let text = frame.payload_str();
        let (key, value) = text.split_once(':').ok_or_else(|| invalid(4))?;
        tracing::debug!(key, value, "meta pair");
        meta.insert(key, value);
    }

    phase.finalize().await?;
    Ok(meta)
}
