//! HTTP target handler
//!
//! POSTs alarm/value payloads to a configured endpoint with exponential
//! backoff. Body formats: JSON (optionally template-expanded), XML, or
//! form-encoded. Auth: none, bearer, basic, or a named api-key header.
//! Success is any 2xx.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::gateway::template::{expand, TemplateVars};
use crate::types::{CspAlarmMessage, CspValueMessage, TargetSendResult};

use super::TargetHandler;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const RESPONSE_BODY_CAP: usize = 4 * 1024;

pub struct HttpTargetHandler {
    /// Clients keyed by `(timeout_ms, verify_ssl)` — reqwest clients pool
    /// connections, so reuse across sends matters.
    clients: Mutex<HashMap<(u64, bool), reqwest::Client>>,
}

impl HttpTargetHandler {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, config: &serde_json::Value) -> Result<reqwest::Client, String> {
        let timeout_ms = config
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let verify_ssl = config
            .get("verify_ssl")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&(timeout_ms, verify_ssl)) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(|e| format!("HTTP client build failed: {}", e))?;
        clients.insert((timeout_ms, verify_ssl), client.clone());
        Ok(client)
    }

    /// Render the request body and its content type for an alarm.
    pub fn build_alarm_body(
        alarm: &CspAlarmMessage,
        config: &serde_json::Value,
    ) -> (String, &'static str) {
        let format = config
            .get("body_format")
            .and_then(|v| v.as_str())
            .unwrap_or("json");
        match format {
            "xml" => (alarm_to_xml(alarm), "application/xml"),
            "form" => (alarm_to_form(alarm), "application/x-www-form-urlencoded"),
            _ => {
                let body = match config.get("body_template").and_then(|v| v.as_str()) {
                    Some(template) => expand(template, &TemplateVars::from_alarm(alarm)),
                    None => serde_json::to_string(alarm).unwrap_or_default(),
                };
                (body, "application/json")
            }
        }
    }

    /// Backoff before retry `attempt` (1-based): initial × multiplier^(n-1),
    /// capped.
    pub fn backoff_delay(attempt: u32, config: &serde_json::Value) -> Duration {
        let initial = config
            .get("initial_delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_INITIAL_DELAY_MS);
        let max = config
            .get("max_delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_DELAY_MS);
        let multiplier = config
            .get("backoff_multiplier")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER);

        let delay = initial as f64 * multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((delay as u64).min(max))
    }

    fn apply_auth(
        request: reqwest::RequestBuilder,
        config: &serde_json::Value,
    ) -> reqwest::RequestBuilder {
        let Some(auth) = config.get("auth") else {
            return request;
        };
        match auth.get("type").and_then(|v| v.as_str()).unwrap_or("none") {
            "bearer" => {
                let token = auth.get("bearer_token").and_then(|v| v.as_str()).unwrap_or("");
                request.bearer_auth(token)
            }
            "basic" => {
                let user = auth
                    .get("basic_username")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let pass = auth.get("basic_password").and_then(|v| v.as_str());
                request.basic_auth(user, pass)
            }
            "api_key" => {
                let header = auth
                    .get("api_key_header")
                    .and_then(|v| v.as_str())
                    .unwrap_or("X-API-Key");
                let key = auth.get("api_key").and_then(|v| v.as_str()).unwrap_or("");
                request.header(header, key)
            }
            _ => request,
        }
    }

    async fn send_payload(
        &self,
        body: String,
        content_type: &'static str,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        let start = Instant::now();
        let mut result = TargetSendResult {
            target_type: "HTTP".to_string(),
            content_size: body.len(),
            sent_payload: body.clone(),
            ..TargetSendResult::default()
        };

        let url = match config.get("url").and_then(|v| v.as_str()) {
            Some(url) => url.to_string(),
            None => {
                result.error_message = "Missing url in HTTP target config".to_string();
                return result;
            }
        };
        let method = config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("POST")
            .to_ascii_uppercase();
        let max_attempts = config
            .get("max_attempts")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS as u64) as u32;

        let client = match self.client_for(config) {
            Ok(client) => client,
            Err(e) => {
                result.error_message = e;
                return result;
            }
        };

        for attempt in 1..=max_attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(Self::backoff_delay(attempt - 1, config)).await;
                result.retry_count = attempt - 1;
            }

            let mut request = match method.as_str() {
                "PUT" => client.put(&url),
                "PATCH" => client.patch(&url),
                "GET" => client.get(&url),
                _ => client.post(&url),
            };
            request = request.header("Content-Type", content_type);
            if let Some(headers) = config.get("headers").and_then(|v| v.as_object()) {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        request = request.header(name.as_str(), value);
                    }
                }
            }
            request = Self::apply_auth(request, config);
            if method != "GET" {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(response) => {
                    result.status_code = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    result.response_body = text.chars().take(RESPONSE_BODY_CAP).collect();
                    if result.is_http_success() {
                        result.success = true;
                        break;
                    }
                    result.error_message = format!("HTTP status {}", result.status_code);
                    debug!(
                        url = %url,
                        status = result.status_code,
                        attempt,
                        "HTTP send returned non-2xx"
                    );
                }
                Err(e) => {
                    result.error_message = format!("HTTP request failed: {}", e);
                    warn!(url = %url, attempt, error = %e, "HTTP send failed");
                }
            }
        }

        result.response_time_ms = start.elapsed().as_millis() as u64;
        result
    }
}

impl Default for HttpTargetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetHandler for HttpTargetHandler {
    fn handler_type(&self) -> &'static str {
        "HTTP"
    }

    async fn send_alarm(
        &self,
        alarm: &CspAlarmMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        let (body, content_type) = Self::build_alarm_body(alarm, config);
        self.send_payload(body, content_type, config).await
    }

    async fn send_value(
        &self,
        value: &CspValueMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        let body = serde_json::to_string(value).unwrap_or_default();
        self.send_payload(body, "application/json", config).await
    }

    async fn test_connection(&self, config: &serde_json::Value) -> bool {
        let Some(url) = config.get("url").and_then(|v| v.as_str()) else {
            return false;
        };
        let Ok(client) = self.client_for(config) else {
            return false;
        };
        match client.get(url).send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        match config.get("url").and_then(|v| v.as_str()) {
            None => errors.push("url is required".to_string()),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                errors.push(format!("url must be http(s):// — got '{}'", url));
            }
            _ => {}
        }
        if let Some(method) = config.get("method").and_then(|v| v.as_str()) {
            if !matches!(
                method.to_ascii_uppercase().as_str(),
                "GET" | "POST" | "PUT" | "PATCH"
            ) {
                errors.push(format!("unsupported method '{}'", method));
            }
        }
        if let Some(format) = config.get("body_format").and_then(|v| v.as_str()) {
            if !matches!(format, "json" | "xml" | "form") {
                errors.push(format!("unsupported body_format '{}'", format));
            }
        }
        if let Some(auth_type) = config
            .get("auth")
            .and_then(|a| a.get("type"))
            .and_then(|v| v.as_str())
        {
            if !matches!(auth_type, "none" | "bearer" | "basic" | "api_key") {
                errors.push(format!("unsupported auth type '{}'", auth_type));
            }
        }
        errors
    }
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn alarm_to_xml(alarm: &CspAlarmMessage) -> String {
    format!(
        "<alarm><bd>{}</bd><nm>{}</nm><vl>{}</vl><tm>{}</tm><al>{}</al><st>{}</st><des>{}</des></alarm>",
        alarm.bd,
        xml_escape(&alarm.nm),
        alarm.vl,
        xml_escape(&alarm.tm),
        alarm.al,
        alarm.st,
        xml_escape(&alarm.des),
    )
}

fn form_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn alarm_to_form(alarm: &CspAlarmMessage) -> String {
    format!(
        "bd={}&nm={}&vl={}&tm={}&al={}&st={}&des={}",
        alarm.bd,
        form_encode(&alarm.nm),
        alarm.vl,
        form_encode(&alarm.tm),
        alarm.al,
        alarm.st,
        form_encode(&alarm.des),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alarm() -> CspAlarmMessage {
        CspAlarmMessage {
            bd: 101,
            nm: "boiler<temp>".to_string(),
            vl: 150.5,
            tm: "2024-01-18 08:00:00.000".to_string(),
            al: 1,
            st: 1,
            des: "High & rising".to_string(),
            point_id: 1,
            site_id: 101,
        }
    }

    #[test]
    fn json_body_defaults_to_wire_shape() {
        let (body, ct) = HttpTargetHandler::build_alarm_body(&alarm(), &json!({}));
        assert_eq!(ct, "application/json");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["bd"], 101);
        assert_eq!(parsed["al"], 1);
    }

    #[test]
    fn json_template_expansion() {
        let config = json!({
            "body_format": "json",
            "body_template": "{\"site\": {building_id}, \"point\": \"{point_name}\", \"v\": {value}}",
        });
        let (body, _) = HttpTargetHandler::build_alarm_body(&alarm(), &config);
        assert!(body.contains("\"site\": 101"));
        assert!(body.contains("\"point\": \"boiler<temp>\""));
        assert!(body.contains("\"v\": 150.5"));
    }

    #[test]
    fn xml_body_escapes_markup() {
        let (body, ct) = HttpTargetHandler::build_alarm_body(&alarm(), &json!({"body_format": "xml"}));
        assert_eq!(ct, "application/xml");
        assert!(body.contains("<nm>boiler&lt;temp&gt;</nm>"));
        assert!(body.contains("<des>High &amp; rising</des>"));
    }

    #[test]
    fn form_body_percent_encodes() {
        let (body, ct) = HttpTargetHandler::build_alarm_body(&alarm(), &json!({"body_format": "form"}));
        assert_eq!(ct, "application/x-www-form-urlencoded");
        assert!(body.contains("nm=boiler%3Ctemp%3E"));
        assert!(body.contains("des=High+%26+rising"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = json!({
            "initial_delay_ms": 100,
            "max_delay_ms": 1000,
            "backoff_multiplier": 2.0,
        });
        assert_eq!(
            HttpTargetHandler::backoff_delay(1, &config),
            Duration::from_millis(100)
        );
        assert_eq!(
            HttpTargetHandler::backoff_delay(2, &config),
            Duration::from_millis(200)
        );
        assert_eq!(
            HttpTargetHandler::backoff_delay(3, &config),
            Duration::from_millis(400)
        );
        assert_eq!(
            HttpTargetHandler::backoff_delay(10, &config),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn validation_catches_bad_config() {
        let handler = HttpTargetHandler::new();
        let errors = handler.validate_config(&json!({
            "url": "ftp://example.com",
            "method": "DELETE",
            "body_format": "yaml",
            "auth": {"type": "oauth"},
        }));
        assert_eq!(errors.len(), 4);

        let ok = handler.validate_config(&json!({
            "url": "https://example.com/alarms",
            "method": "POST",
            "body_format": "json",
            "auth": {"type": "bearer", "bearer_token": "t"},
        }));
        assert!(ok.is_empty());
    }
}
