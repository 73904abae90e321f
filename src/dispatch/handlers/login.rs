//! `wtv-head-waiter:/login`.
//!
//! Stores the client's ticket on first sight, otherwise checks the
//! challenge response and issues a new challenge when it is missing or wrong.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};

use crate::crypto::{expected_challenge_response, generate_challenge};
use crate::dispatch::router::{DispatchError, Handler, HandlerContext};
use crate::protocol::{DecodedRequest, Response};

/// Characters of the challenge response that are compared.
const CHALLENGE_RESPONSE_PREFIX: usize = 85;

const MIN_TICKET_LEN: usize = 8;

#[derive(Debug, Default)]
pub struct LoginHandler;

impl LoginHandler {
    /// `Some(challenge)` when the client must be challenged.
    fn check_credentials(&self, request: &DecodedRequest, ctx: &HandlerContext) -> Option<String> {
        let ssid = request.ssid.as_deref()?;
        let identity = ctx.registry.touch(ssid);

        if let Some(ticket) = request.header("wtv-ticket") {
            if identity.ticket_b64.is_none() && ticket.len() > MIN_TICKET_LEN {
                ctx.registry.set_ticket(ssid, ticket);
            }
            return None;
        }

        let expected = identity
            .ticket_b64
            .as_deref()
            .zip(identity.challenge_b64.as_deref())
            .and_then(|(ticket, challenge)| expected_challenge_response(ticket, challenge).ok());
        let presented = request.header("wtv-challenge-response");

        if let (Some(expected), Some(presented)) = (expected, presented) {
            if prefix(&expected) == prefix(presented) {
                tracing::info!(ssid, "Challenge response accepted");
                return None;
            }
            tracing::info!(ssid, "Challenge response rejected");
        }

        let challenge = BASE64_STANDARD.encode(generate_challenge());
        ctx.registry.set_challenge(ssid, &challenge);
        Some(challenge)
    }
}

fn prefix(value: &str) -> &str {
    match value.char_indices().nth(CHALLENGE_RESPONSE_PREFIX) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

impl Handler for LoginHandler {
    fn handle(&self, request: &DecodedRequest, ctx: &HandlerContext) -> Result<Response, DispatchError> {
        let challenge = self.check_credentials(request, ctx);

        let mut response = Response::new("200 OK")
            .header("Connection", "Keep-Alive")
            .header("Expires", "Wed, 09 Oct 1991 22:00:00 GMT")
            .header("wtv-expire-all", "wtv-head-waiter:");

        if let Some(lines) = ctx.services.service_string("wtv-log") {
            for line in lines.lines() {
                if let Some(value) = line.strip_prefix("wtv-service: ") {
                    response = response.header("wtv-service", value);
                }
            }
        }
        response = response.header("wtv-log-url", "wtv-log:/log");
        if let Some(challenge) = challenge {
            response = response.header("wtv-challenge", challenge);
        }

        Ok(response
            .header("wtv-relogin-url", "wtv-1800:/preregister?relogin=true")
            .header("wtv-reconnect-url", "wtv-1800:/preregister?reconnect=true")
            .header("wtv-visit", "wtv-head-waiter:/login-stage-two?")
            .header("Content-type", "text/html"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use crate::config::ServerConfig;
    use crate::dispatch::services::ServiceTable;
    use crate::net::ConnectionId;
    use crate::protocol::headers::parse;
    use crate::session::SessionRegistry;

    const TICKET: &str = "VGVzdFRpY2tldA==";

    fn context() -> HandlerContext {
        let config: ServerConfig = toml::from_str("[services.wtv-log]\nport = 1620").unwrap();
        HandlerContext {
            connection_id: ConnectionId::from(3),
            services: Arc::new(ServiceTable::from_config(&config)),
            registry: SessionRegistry::new(None),
            log_dir: PathBuf::from("unused"),
        }
    }

    fn login(extra: &str) -> DecodedRequest {
        let headers = parse(&format!("GET wtv-head-waiter:/login HTTP/1.0\r\n{}", extra), false);
        DecodedRequest::new(headers, None, Some("abc123".to_string()), vec![]).unwrap()
    }

    #[test]
    fn stores_first_ticket() {
        let ctx = context();
        let response = LoginHandler
            .handle(&login(&format!("wtv-ticket: {}", TICKET)), &ctx)
            .unwrap();

        assert_eq!(ctx.registry.get("abc123").unwrap().ticket_b64.as_deref(), Some(TICKET));
        assert!(response.headers.get("wtv-challenge").is_none());
        assert_eq!(
            response.headers.get("wtv-service"),
            Some("name=wtv-log host=127.0.0.1 port=1620")
        );
    }

    #[test]
    fn challenges_without_response() {
        let ctx = context();
        ctx.registry.set_ticket("abc123", TICKET);

        let response = LoginHandler.handle(&login(""), &ctx).unwrap();
        let challenge = response.headers.get("wtv-challenge").unwrap().to_string();
        assert_eq!(
            ctx.registry.get("abc123").unwrap().challenge_b64.as_deref(),
            Some(challenge.as_str())
        );
    }

    #[test]
    fn accepts_correct_response() {
        let ctx = context();
        ctx.registry.set_ticket("abc123", TICKET);
        LoginHandler.handle(&login(""), &ctx).unwrap();

        let challenge = ctx.registry.get("abc123").unwrap().challenge_b64.unwrap();
        let answer = expected_challenge_response(TICKET, &challenge).unwrap();
        let response = LoginHandler
            .handle(&login(&format!("wtv-challenge-response: {}", answer)), &ctx)
            .unwrap();
        assert!(response.headers.get("wtv-challenge").is_none());

        let response = LoginHandler
            .handle(&login("wtv-challenge-response: bm9wZQ=="), &ctx)
            .unwrap();
        assert!(response.headers.get("wtv-challenge").is_some());
    }

    #[test]
    fn anonymous_login_still_answers() {
        let ctx = context();
        let headers = parse("GET wtv-head-waiter:/login HTTP/1.0", false);
        let request = DecodedRequest::new(headers, None, None, vec![]).unwrap();

        let response = LoginHandler.handle(&request, &ctx).unwrap();
        assert_eq!(response.headers.get("wtv-visit"), Some("wtv-head-waiter:/login-stage-two?"));
        assert_eq!(ctx.registry.identity_count(), 0);
    }
}
