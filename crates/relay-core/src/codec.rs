//! Conversions between envelopes, persisted tasks and outbound messages.
//!
//! payload は受信から実行まで base64 文字列のまま保持する。
//! デコードは経路ごとに 1 回だけ:
//! - dispatch 判定の前 (検証と即時転送のため)
//! - scheduled task の実行時
//!
//! Decoding is lenient: padding bits need not be zero and CR/LF line breaks
//! are ignored.

use std::borrow::Cow;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use bytes::Bytes;

use crate::domain::{Headers, InboundEnvelope, OutboundMessage, RelayError, ScheduledTask};

/// Standard alphabet with padding, tolerant of non-zero trailing bits.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::RequireCanonical)
        .with_decode_allow_trailing_bits(true),
);

/// Decode a base64 payload (standard alphabet, padded).
///
/// Line breaks (`\r`, `\n`) anywhere in the text are ignored, so wrapped
/// base64 from producers decodes the same as the single-line form.
pub fn decode_payload(payload: &str) -> Result<Bytes, RelayError> {
    let text: Cow<'_, str> = if payload.contains(['\r', '\n']) {
        Cow::Owned(payload.chars().filter(|c| !matches!(c, '\r' | '\n')).collect())
    } else {
        Cow::Borrowed(payload)
    };
    Ok(Bytes::from(PAYLOAD_ENGINE.decode(text.as_bytes())?))
}

/// Build the persisted task for a delayed envelope.
///
/// `body` keeps the inbound base64 text; headers are the source message's.
pub fn to_task(envelope: &InboundEnvelope, headers: &Headers) -> ScheduledTask {
    ScheduledTask {
        topic: envelope.topic.clone(),
        body: envelope.payload.clone(),
        headers: headers.clone(),
    }
}

/// Reconstruct the outbound message a task stands for.
pub fn from_task(task: &ScheduledTask) -> Result<OutboundMessage, RelayError> {
    let payload = decode_payload(&task.body)?;
    Ok(OutboundMessage::new(
        task.topic.clone(),
        payload,
        task.headers.clone(),
    ))
}

/// Outbound message for an envelope forwarded without delay.
pub fn immediate_message(
    envelope: &InboundEnvelope,
    payload: Bytes,
    headers: &Headers,
) -> OutboundMessage {
    OutboundMessage::new(envelope.topic.clone(), payload, headers.clone())
}

/// Serialize a task into its persisted JSON form.
pub fn encode_task(task: &ScheduledTask) -> Result<Vec<u8>, RelayError> {
    serde_json::to_vec(task).map_err(RelayError::TaskEncoding)
}

pub fn decode_task(raw: &[u8]) -> Result<ScheduledTask, RelayError> {
    serde_json::from_slice(raw).map_err(RelayError::TaskEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use rstest::rstest;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::two_pad("AAEC/w==", &[0x00, 0x01, 0x02, 0xff], &[("trace-id", "abc"), ("tenant", "t1")])]
    #[case::empty_payload("", &[], &[("trace-id", "abc")])]
    #[case::empty_headers("aGVsbG8=", b"hello", &[])]
    #[case::one_pad("aGVsbG8hISE=", b"hello!!!", &[("k", "v")])]
    #[case::no_pad("aGVsbG8h", b"hello!", &[])]
    #[case::binary_with_equals_in_header("//79", &[0xff, 0xfe, 0xfd], &[("a=b", "c==")])]
    fn task_round_trip_restores_original_message(
        #[case] body: &str,
        #[case] bytes: &[u8],
        #[case] pairs: &[(&str, &str)],
    ) {
        let envelope = InboundEnvelope::new("billing", body).with_process_in(60);
        let hdrs = headers(pairs);

        let task = to_task(&envelope, &hdrs);
        let persisted = encode_task(&task).unwrap();
        let message = from_task(&decode_task(&persisted).unwrap()).unwrap();

        assert_eq!(message.topic, "billing");
        assert_eq!(message.payload.as_ref(), bytes);
        assert_eq!(message.headers, hdrs);
    }

    #[test]
    fn persisted_form_uses_wire_field_names() {
        let task = to_task(
            &InboundEnvelope::new("orders", "aGVsbG8="),
            &headers(&[("k", "v")]),
        );
        let json: serde_json::Value = serde_json::from_slice(&encode_task(&task).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Topic": "orders", "Body": "aGVsbG8=", "Headers": {"k": "v"}})
        );
    }

    #[test]
    fn empty_headers_are_omitted() {
        let task = to_task(&InboundEnvelope::new("orders", ""), &Headers::new());
        let raw = encode_task(&task).unwrap();
        assert_eq!(raw, br#"{"Topic":"orders","Body":""}"#);
    }

    #[test]
    fn null_or_missing_headers_decode_as_empty() {
        let null = decode_task(br#"{"Topic":"a","Body":"","Headers":null}"#).unwrap();
        let missing = decode_task(br#"{"Topic":"a","Body":""}"#).unwrap();
        assert!(null.headers.is_empty());
        assert_eq!(null, missing);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = decode_payload("not-base64!!").unwrap_err();
        assert!(matches!(err, RelayError::PayloadDecode(_)));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn corrupt_task_body_fails_at_execution() {
        let task = ScheduledTask {
            topic: "orders".into(),
            body: "%%%".into(),
            headers: Headers::new(),
        };
        assert!(matches!(from_task(&task), Err(RelayError::PayloadDecode(_))));
    }

    #[test]
    fn unreadable_task_json_is_encoding_error() {
        let err = decode_task(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, RelayError::TaskEncoding(_)));
        assert!(!err.is_retryable());
    }

    #[rstest]
    #[case::non_zero_trailing_bits("aGl=", b"hi")]
    #[case::lf_wrapped("aGVs\nbG8=", b"hello")]
    #[case::crlf_wrapped("aGVs\r\nbG8=\r\n", b"hello")]
    fn lenient_payloads_decode(#[case] text: &str, #[case] expected: &[u8]) {
        assert_eq!(decode_payload(text).unwrap().as_ref(), expected);
    }

    #[test]
    fn wrapped_task_body_decodes_at_execution() {
        let task = ScheduledTask {
            topic: "orders".into(),
            body: "aGVs\nbG8=".into(),
            headers: Headers::new(),
        };
        assert_eq!(from_task(&task).unwrap().payload.as_ref(), b"hello");
    }

    #[rstest]
    #[case::missing_padding("aGk")]
    #[case::space_inside("aGVs bG8=")]
    #[case::url_safe_alphabet("__79")]
    fn malformed_payloads_still_fail(#[case] text: &str) {
        assert!(matches!(decode_payload(text), Err(RelayError::PayloadDecode(_))));
    }

    #[test]
    fn empty_payload_decodes_to_empty_bytes() {
        assert!(decode_payload("").unwrap().is_empty());
    }
}
