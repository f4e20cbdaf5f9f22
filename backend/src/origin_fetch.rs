//! `fetch_live_origin` — the one piece of the interactive origin-fetch
//! utility that the core depends on by shape (SPEC_FULL.md §1). The utility
//! itself (an operator-facing CLI/TUI for seeding a GNSS origin by hand) is
//! an external collaborator and out of scope; this module implements only
//! its timeout contract: a caller-supplied deadline (default 30 s) after
//! which the fetch gives up and reports nothing, rather than blocking the
//! caller indefinitely on a slow or unreachable reference service.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Default caller-supplied timeout per spec.md §5.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LiveOriginFix {
    pub lat: f64,
    pub lon: f64,
    pub h: f64,
}

/// Fetches a one-shot live position fix from an installation-configured
/// reference endpoint (e.g. a survey-grade base-station receiver exposing
/// its current solution as JSON). Returns `None` on any failure: request
/// error, non-success status, malformed body, or exceeding `timeout`. Never
/// panics and never blocks past `timeout`.
pub async fn fetch_live_origin(client: &reqwest::Client, url: &str, timeout: Duration) -> Option<LiveOriginFix> {
    let request = client.get(url).send();
    let response = match tokio::time::timeout(timeout, request).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!(url, error = %err, "fetch_live_origin request failed");
            return None;
        }
        Err(_) => {
            warn!(url, timeout_secs = timeout.as_secs(), "fetch_live_origin timed out");
            return None;
        }
    };

    if !response.status().is_success() {
        warn!(url, status = %response.status(), "fetch_live_origin non-success status");
        return None;
    }

    match tokio::time::timeout(timeout, response.json::<LiveOriginFix>()).await {
        Ok(Ok(fix)) => Some(fix),
        Ok(Err(err)) => {
            warn!(url, error = %err, "fetch_live_origin body decode failed");
            None
        }
        Err(_) => {
            warn!(url, "fetch_live_origin timed out reading body");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_returns_none_within_timeout() {
        let client = reqwest::Client::new();
        // Port 1 on loopback: nothing listens there, connection refused fast.
        let fix = fetch_live_origin(&client, "http://127.0.0.1:1/origin", Duration::from_millis(500)).await;
        assert!(fix.is_none());
    }

    #[test]
    fn default_timeout_is_thirty_seconds() {
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(30));
    }
}
