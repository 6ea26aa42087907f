use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::HashMap;
use std::fmt::Write;

use crate::core::shared::ApiError;

pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("missing webhook field {0}")]
    MissingField(&'static str),
}

impl From<TwilioError> for ApiError {
    fn from(err: TwilioError) -> Self {
        match err {
            TwilioError::InvalidSignature => Self::Forbidden(err.to_string()),
            TwilioError::MissingField(_) => Self::BadRequest(err.to_string()),
        }
    }
}

fn signing_payload(url: &str, params: &HashMap<String, String>) -> String {
    let mut sorted: Vec<(&String, &String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut data = url.to_string();
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }
    data
}

/// Base64 HMAC-SHA1 of the full URL followed by every POST parameter
/// (sorted by name, name then value, no separators).
pub fn compute_signature(
    auth_token: &str,
    url: &str,
    params: &HashMap<String, String>,
) -> Option<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(signing_payload(url, params).as_bytes());
    Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn validate_signature(
    auth_token: &str,
    signature: &str,
    url: &str,
    params: &HashMap<String, String>,
) -> Result<(), TwilioError> {
    let provided = base64::engine::general_purpose::STANDARD
        .decode(signature.trim())
        .map_err(|_| TwilioError::InvalidSignature)?;
    let mut mac = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes())
        .map_err(|_| TwilioError::InvalidSignature)?;
    mac.update(signing_payload(url, params).as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| TwilioError::InvalidSignature)
}

pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Minimal TwiML writer. Verbs render in the order they are added.
#[derive(Debug, Default, Clone)]
pub struct Twiml {
    verbs: Vec<String>,
}

impl Twiml {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn say(mut self, text: &str) -> Self {
        self.verbs
            .push(format!("<Say voice=\"Polly.Joanna\">{}</Say>", escape_xml(text)));
        self
    }

    pub fn dial(mut self, number: &str, timeout_secs: u32, action: Option<&str>) -> Self {
        let mut verb = format!("<Dial timeout=\"{timeout_secs}\"");
        if let Some(action) = action {
            let _ = write!(verb, " action=\"{}\"", escape_xml(action));
        }
        let _ = write!(verb, ">{}</Dial>", escape_xml(number));
        self.verbs.push(verb);
        self
    }

    pub fn record(mut self, max_length_secs: u32, action: Option<&str>) -> Self {
        let mut verb = format!("<Record maxLength=\"{max_length_secs}\" playBeep=\"true\"");
        if let Some(action) = action {
            let _ = write!(verb, " action=\"{}\"", escape_xml(action));
        }
        verb.push_str(" />");
        self.verbs.push(verb);
        self
    }

    pub fn hangup(mut self) -> Self {
        self.verbs.push("<Hangup />".to_string());
        self
    }

    pub fn build(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>");
        for verb in &self.verbs {
            xml.push_str("\n  ");
            xml.push_str(verb);
        }
        xml.push_str("\n</Response>");
        xml
    }
}

/// The fields we use from Twilio's voice webhooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallWebhook {
    pub call_sid: String,
    pub from: String,
    pub to: String,
    pub status: String,
    pub direction: String,
    pub duration_secs: i32,
}

impl CallWebhook {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, TwilioError> {
        let get = |key: &'static str| -> Result<String, TwilioError> {
            params
                .get(key)
                .cloned()
                .ok_or(TwilioError::MissingField(key))
        };

        Ok(Self {
            call_sid: get("CallSid")?,
            from: params.get("From").cloned().unwrap_or_default(),
            to: params.get("To").cloned().unwrap_or_default(),
            status: params
                .get("CallStatus")
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "ringing".to_string()),
            direction: match params.get("Direction").map(String::as_str) {
                Some(d) if d.starts_with("outbound") => "outbound".to_string(),
                _ => "inbound".to_string(),
            },
            duration_secs: params
                .get("CallDuration")
                .or_else(|| params.get("DialCallDuration"))
                .and_then(|d| d.parse().ok())
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HashMap<String, String> {
        [
            ("CallSid", "CA1234567890ABCDE"),
            ("Caller", "+12349013030"),
            ("Digits", "1234"),
            ("From", "+12349013030"),
            ("To", "+18005551212"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    const URL: &str = "https://mycompany.com/myapp.php?foo=1&bar=2";

    #[test]
    fn signs_url_and_sorted_params() {
        let sig = compute_signature("12345", URL, &params()).unwrap();
        assert_eq!(sig, "0/KCTR6DLpKmkAf8muzZqo1nDgQ=");
        assert!(validate_signature("12345", &sig, URL, &params()).is_ok());
    }

    #[test]
    fn rejects_tampered_requests() {
        let sig = compute_signature("12345", URL, &params()).unwrap();
        let mut tampered = params();
        tampered.insert("Digits".to_string(), "9999".to_string());
        assert!(validate_signature("12345", &sig, URL, &tampered).is_err());
        assert!(validate_signature("other", &sig, URL, &params()).is_err());
        assert!(validate_signature("12345", "not base64!", URL, &params()).is_err());
    }

    #[test]
    fn twiml_escapes_and_orders_verbs() {
        let xml = Twiml::new()
            .say("Tom & Jerry's <office>")
            .dial("+15550001111", 20, Some("/api/voice/status?a=1&b=2"))
            .build();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("Tom &amp; Jerry&apos;s &lt;office&gt;"));
        assert!(xml.contains("action=\"/api/voice/status?a=1&amp;b=2\""));
        assert!(xml.find("<Say").unwrap() < xml.find("<Dial").unwrap());
        assert!(xml.ends_with("</Response>"));
    }

    #[test]
    fn parses_status_callbacks() {
        let mut p = params();
        p.insert("CallStatus".into(), "Completed".into());
        p.insert("CallDuration".into(), "42".into());
        p.insert("Direction".into(), "outbound-api".into());
        let call = CallWebhook::from_params(&p).unwrap();
        assert_eq!(call.status, "completed");
        assert_eq!(call.duration_secs, 42);
        assert_eq!(call.direction, "outbound");

        p.remove("CallSid");
        assert!(matches!(
            CallWebhook::from_params(&p),
            Err(TwilioError::MissingField("CallSid"))
        ));
    }
}
