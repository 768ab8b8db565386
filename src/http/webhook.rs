//! Telephony status callback parsing.
//!
//! The provider posts one request per call state transition, as either
//! `application/x-www-form-urlencoded` or `application/json`, with
//! provider-cased field names (`CallSid`) or snake_case (`call_sid`).
//! Missing identifiers are the only malformed case; everything else is
//! acknowledged so the provider never enters a retry storm against us.

use serde::Deserialize;

use crate::db::CallStatus;

/// A normalized status callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCallback {
    pub call_sid: String,
    pub call_status: String,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JsonCallback {
    #[serde(alias = "CallSid", alias = "callSid")]
    call_sid: Option<String>,
    #[serde(alias = "CallStatus", alias = "callStatus")]
    call_status: Option<String>,
    #[serde(
        alias = "CallDuration",
        alias = "Duration",
        alias = "callDuration",
        alias = "duration"
    )]
    call_duration: Option<serde_json::Value>,
}

/// Parse a callback body according to its content type. Returns a static
/// message suitable for a 400 body when required identifiers are absent.
pub fn parse_status_callback(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<StatusCallback, &'static str> {
    let is_json = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false);

    let (call_sid, call_status, duration) = if is_json {
        let parsed: JsonCallback =
            serde_json::from_slice(body).map_err(|_| "invalid JSON body")?;
        let duration = parsed.call_duration.and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        (parsed.call_sid, parsed.call_status, duration)
    } else {
        // Default to form encoding: the provider's documented primary format.
        let mut call_sid = None;
        let mut call_status = None;
        let mut duration = None;
        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "CallSid" | "call_sid" => call_sid = Some(value.into_owned()),
                "CallStatus" | "call_status" => call_status = Some(value.into_owned()),
                "CallDuration" | "Duration" | "call_duration" => {
                    duration = value.parse().ok();
                }
                _ => {}
            }
        }
        (call_sid, call_status, duration)
    };

    let call_sid = call_sid.filter(|s| !s.is_empty()).ok_or("missing CallSid")?;
    let call_status = call_status
        .filter(|s| !s.is_empty())
        .ok_or("missing CallStatus")?;

    Ok(StatusCallback {
        call_sid,
        call_status,
        duration_seconds: duration,
    })
}

/// Map the provider's status vocabulary onto the attempt state machine.
/// `in-progress` means the callee picked up; `completed` is the post-answer
/// hangup and likewise proves the call was answered. Unknown values return
/// None and are acknowledged without a state change.
pub fn map_provider_status(raw: &str) -> Option<CallStatus> {
    match raw {
        "queued" => Some(CallStatus::Queued),
        "initiated" => Some(CallStatus::Initiated),
        "ringing" => Some(CallStatus::Ringing),
        "in-progress" | "answered" | "completed" => Some(CallStatus::Answered),
        "no-answer" => Some(CallStatus::NoAnswer),
        "busy" => Some(CallStatus::Busy),
        "failed" | "canceled" => Some(CallStatus::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_form_provider_casing() {
        let body = b"CallSid=CA-1&CallStatus=no-answer&CallDuration=0";
        let parsed = parse_status_callback(
            Some("application/x-www-form-urlencoded"),
            body,
        )
        .unwrap();
        assert_eq!(parsed.call_sid, "CA-1");
        assert_eq!(parsed.call_status, "no-answer");
        assert_eq!(parsed.duration_seconds, Some(0));
    }

    #[test]
    fn test_parse_form_snake_case() {
        let body = b"call_sid=CA-2&call_status=busy";
        let parsed = parse_status_callback(None, body).unwrap();
        assert_eq!(parsed.call_sid, "CA-2");
        assert_eq!(parsed.call_status, "busy");
        assert_eq!(parsed.duration_seconds, None);
    }

    #[test]
    fn test_parse_json_variants() {
        let body = br#"{"CallSid": "CA-3", "CallStatus": "completed", "CallDuration": "42"}"#;
        let parsed = parse_status_callback(Some("application/json"), body).unwrap();
        assert_eq!(parsed.call_sid, "CA-3");
        assert_eq!(parsed.call_status, "completed");
        assert_eq!(parsed.duration_seconds, Some(42));

        let body = br#"{"call_sid": "CA-4", "call_status": "ringing", "duration": 7}"#;
        let parsed =
            parse_status_callback(Some("application/json; charset=utf-8"), body).unwrap();
        assert_eq!(parsed.call_sid, "CA-4");
        assert_eq!(parsed.duration_seconds, Some(7));
    }

    #[test]
    fn test_missing_identifiers_rejected() {
        assert!(parse_status_callback(None, b"CallStatus=busy").is_err());
        assert!(parse_status_callback(None, b"CallSid=CA-1").is_err());
        assert!(
            parse_status_callback(Some("application/json"), b"{}").is_err()
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_provider_status("ringing"), Some(CallStatus::Ringing));
        assert_eq!(
            map_provider_status("in-progress"),
            Some(CallStatus::Answered)
        );
        assert_eq!(
            map_provider_status("completed"),
            Some(CallStatus::Answered)
        );
        assert_eq!(map_provider_status("canceled"), Some(CallStatus::Failed));
        assert_eq!(map_provider_status("shouting"), None);
    }
}
