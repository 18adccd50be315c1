//! DNS-over-HTTPS sub-relay.
//!
//! Tunneled UDP payload on port 53 is a stream of 2-byte length-prefixed
//! DNS messages. Each complete message is POSTed individually to the
//! configured DoH endpoint; responses are reframed the same way for the
//! client. A failed round trip drops that query only — DNS clients retry,
//! so the session stays up.

use relay_core::{FrameDecoder, TunnelError, TunnelResult};
use std::time::Duration;

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

pub struct DohRelay {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    decoder: FrameDecoder,
}

impl DohRelay {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
            decoder: FrameDecoder::new(),
        }
    }

    /// Feed raw tunnel payload; returns the complete DNS messages it
    /// contained, in arrival order. Partial frames stay buffered.
    pub fn extract(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.decoder.feed(chunk)
    }

    /// One DoH round trip for a single DNS message.
    pub async fn query(&self, message: &[u8]) -> TunnelResult<Vec<u8>> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .body(message.to_vec())
            .send()
            .await
            .map_err(|e| TunnelError::Dns(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TunnelError::Dns(format!(
                "doh endpoint returned {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TunnelError::Dns(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::frame_encode;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay_for(server: &MockServer) -> DohRelay {
        DohRelay::new(
            format!("{}/dns-query", server.uri()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn extract_splits_concatenated_messages() {
        let mut relay = DohRelay::new("https://1.1.1.1/dns-query", Duration::from_secs(5));
        let mut chunk = frame_encode(b"query-one").unwrap();
        chunk.extend(frame_encode(b"query-two").unwrap());

        let messages = relay.extract(&chunk);
        assert_eq!(messages, vec![b"query-one".to_vec(), b"query-two".to_vec()]);
    }

    #[test]
    fn extract_buffers_partial_frames() {
        let mut relay = DohRelay::new("https://1.1.1.1/dns-query", Duration::from_secs(5));
        let frame = frame_encode(b"query").unwrap();

        assert!(relay.extract(&frame[..4]).is_empty());
        assert_eq!(relay.extract(&frame[4..]), vec![b"query".to_vec()]);
    }

    #[tokio::test]
    async fn query_posts_dns_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dns-query"))
            .and(header("content-type", "application/dns-message"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"answer".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        let answer = relay.query(b"question").await.unwrap();
        assert_eq!(answer, b"answer");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dns-query"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        assert!(matches!(
            relay.query(b"question").await,
            Err(TunnelError::Dns(_))
        ));
    }
}
