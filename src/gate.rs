use axum::http::StatusCode;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::{
    error::AppError,
    models::{HandshakeQuery, LifecycleBatch, NotificationBatch},
    token::TokenVerifier,
};

#[derive(Debug)]
pub enum GateDecision<T> {
    Handshake(String),
    Continue(T),
}

pub struct NotificationGate {
    verifier: TokenVerifier,
    client_state: String,
}

impl NotificationGate {
    pub fn new(verifier: TokenVerifier, client_state: impl Into<String>) -> Self {
        Self {
            verifier,
            client_state: client_state.into(),
        }
    }

    pub async fn admit_changes(
        &self,
        query: &HandshakeQuery,
        body: &[u8],
    ) -> Result<GateDecision<Vec<Value>>, AppError> {
        if let Some(reply) = handshake_reply(query) {
            return Ok(GateDecision::Handshake(reply));
        }

        let batch: NotificationBatch = parse_body(body)?;
        if let Some(tokens) = batch.validation_tokens.as_deref() {
            self.check_validation_tokens(tokens).await?;
        }

        match batch.value {
            Some(value) => Ok(GateDecision::Continue(value)),
            None => {
                warn!("notification payload without value; ignoring");
                Ok(GateDecision::Continue(Vec::new()))
            }
        }
    }

    pub fn admit_lifecycle(
        &self,
        query: &HandshakeQuery,
        body: &[u8],
    ) -> Result<GateDecision<Vec<Value>>, AppError> {
        if let Some(reply) = handshake_reply(query) {
            return Ok(GateDecision::Handshake(reply));
        }

        let batch: LifecycleBatch = parse_body(body)?;
        match batch.value {
            Some(value) => Ok(GateDecision::Continue(value)),
            None => {
                warn!("lifecycle payload without value; ignoring");
                Ok(GateDecision::Continue(Vec::new()))
            }
        }
    }

    pub async fn check_validation_tokens(&self, tokens: &[String]) -> Result<(), AppError> {
        for (index, token) in tokens.iter().enumerate() {
            if !self.verifier.verify(token).await {
                warn!(index, "rejecting notification batch: invalid validation token");
                return Err(AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "Invalid validation token",
                ));
            }
        }
        debug!(count = tokens.len(), "validation tokens verified");
        Ok(())
    }

    pub fn client_state_matches(&self, client_state: Option<&str>) -> bool {
        let provided = client_state.unwrap_or("");
        provided
            .as_bytes()
            .ct_eq(self.client_state.as_bytes())
            .into()
    }
}

// Graph percent-encodes the token inside an already encoded query string, so the
// extracted value is decoded once more before it is echoed.
pub fn handshake_reply(query: &HandshakeQuery) -> Option<String> {
    let token = query
        .validation_token
        .as_deref()
        .filter(|token| !token.is_empty())?;
    Some(escape_html(&percent_decode_str(token).decode_utf8_lossy()))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    let no_data = || AppError::new(StatusCode::BAD_REQUEST, "No notification data provided");

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(no_data());
    }
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            format!("invalid notification payload: {err}"),
        )
    })?;
    match &value {
        serde_json::Value::Object(map) if !map.is_empty() => {}
        _ => return Err(no_data()),
    }
    serde_json::from_value(value).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            format!("invalid notification payload: {err}"),
        )
    })
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        graph::fake::FakeGraph,
        token::{
            testing::{jwk, valid_token},
            GRAPH_PUBLISHER_APP_ID,
        },
    };

    const AUDIENCE: &str = "app-id";

    fn gate() -> (Arc<FakeGraph>, NotificationGate) {
        let fake = Arc::new(FakeGraph::with_keys(vec![jwk()]));
        let verifier = TokenVerifier::new(
            fake.clone(),
            AUDIENCE,
            GRAPH_PUBLISHER_APP_ID,
            Duration::from_secs(300),
        );
        (fake, NotificationGate::new(verifier, "expected-state"))
    }

    fn handshake(token: Option<&str>) -> HandshakeQuery {
        HandshakeQuery {
            validation_token: token.map(str::to_string),
        }
    }

    #[test]
    fn escapes_handshake_token() {
        let reply = handshake_reply(&handshake(Some("a<b>&\"c'"))).unwrap();
        assert_eq!(reply, "a&lt;b&gt;&amp;&quot;c&#x27;");
        assert_eq!(
            handshake_reply(&handshake(Some("Validation: Testing client"))).unwrap(),
            "Validation: Testing client"
        );
        assert!(handshake_reply(&handshake(None)).is_none());
    }

    #[test]
    fn handshake_token_is_decoded_before_escaping() {
        assert_eq!(handshake_reply(&handshake(Some("a%20b"))).unwrap(), "a b");
        assert_eq!(
            handshake_reply(&handshake(Some("%3Cscript%3E"))).unwrap(),
            "&lt;script&gt;"
        );
        assert_eq!(handshake_reply(&handshake(Some("100%"))).unwrap(), "100%");
    }

    #[tokio::test]
    async fn empty_handshake_token_falls_through_to_body() {
        let (fake, gate) = gate();
        assert!(handshake_reply(&handshake(Some(""))).is_none());

        let err = gate
            .admit_changes(&handshake(Some("")), b"")
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let body = br#"{"value": [{"subscriptionId": "s1", "lifecycleEvent": "missed"}]}"#;
        let decision = gate.admit_lifecycle(&handshake(Some("")), body).unwrap();
        assert!(matches!(decision, GateDecision::Continue(value) if value.len() == 1));
        assert_eq!(FakeGraph::count(&fake.key_fetches), 0);
    }

    #[tokio::test]
    async fn malformed_items_do_not_fail_the_batch() {
        let (_, gate) = gate();
        let body = serde_json::json!({
            "validationTokens": [valid_token(AUDIENCE)],
            "value": [
                {"subscriptionId": "s1", "clientState": "expected-state", "changeType": "created"},
                {"clientState": "expected-state"},
                42
            ]
        });
        let decision = gate
            .admit_changes(&handshake(None), body.to_string().as_bytes())
            .await
            .unwrap();
        assert!(matches!(decision, GateDecision::Continue(value) if value.len() == 3));
    }

    #[tokio::test]
    async fn handshake_short_circuits_without_io() {
        let (fake, gate) = gate();
        let decision = gate
            .admit_changes(&handshake(Some("token")), b"")
            .await
            .unwrap();
        assert!(matches!(decision, GateDecision::Handshake(reply) if reply == "token"));
        assert_eq!(FakeGraph::count(&fake.key_fetches), 0);
    }

    #[tokio::test]
    async fn empty_body_is_bad_request() {
        let (_, gate) = gate();
        let bodies: [&[u8]; 5] = [b"", b"  ", b"{}", b"null", b"not json"];
        for body in bodies {
            let err = gate.admit_changes(&handshake(None), body).await.unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn unknown_shape_is_a_no_op() {
        let (_, gate) = gate();
        let decision = gate
            .admit_changes(&handshake(None), br#"{"somethingElse": true}"#)
            .await
            .unwrap();
        assert!(matches!(decision, GateDecision::Continue(value) if value.is_empty()));
    }

    #[tokio::test]
    async fn one_bad_token_rejects_the_batch() {
        let (_, gate) = gate();
        let body = serde_json::json!({
            "validationTokens": [valid_token(AUDIENCE), "forged"],
            "value": [{"subscriptionId": "s1", "clientState": "expected-state", "changeType": "created"}]
        });
        let err = gate
            .admit_changes(&handshake(None), body.to_string().as_bytes())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_tokens_admit_the_batch() {
        let (_, gate) = gate();
        let body = serde_json::json!({
            "validationTokens": [valid_token(AUDIENCE)],
            "value": [{"subscriptionId": "s1", "clientState": "expected-state", "changeType": "created"}]
        });
        let decision = gate
            .admit_changes(&handshake(None), body.to_string().as_bytes())
            .await
            .unwrap();
        assert!(matches!(decision, GateDecision::Continue(value) if value.len() == 1));
    }

    #[test]
    fn lifecycle_gate_parses_value() {
        let (_, gate) = gate();
        let body = br#"{"value": [{"subscriptionId": "s1", "clientState": "x", "lifecycleEvent": "missed"}]}"#;
        let decision = gate.admit_lifecycle(&handshake(None), body).unwrap();
        assert!(matches!(decision, GateDecision::Continue(value) if value.len() == 1));

        let err = gate.admit_lifecycle(&handshake(None), b"").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn client_state_comparison() {
        let (_, gate) = gate();
        assert!(gate.client_state_matches(Some("expected-state")));
        assert!(!gate.client_state_matches(Some("expected-stat")));
        assert!(!gate.client_state_matches(Some("")));
        assert!(!gate.client_state_matches(None));
    }
}
