//! Control request decoding
//!
//! Turns the body of a `POST /gpio` request into a [`ControlCommand`]:
//!
//! ```text
//! {"GPIO": 5, "sts": "on"}
//! ```
//!
//! `GPIO` must be a number in `0..=46` and `sts` a string; `"on"` (any case)
//! drives the pin high, every other token drives it low. Unknown fields are
//! ignored.

use alloc::vec::Vec;

use embedded_io_async::Read;
use log::{debug, warn};
use serde_json::Value;
use thiserror_no_std::Error;

use crate::gpio::{Level, PinId};

/// Largest accepted request body in bytes
pub const MAX_BODY_SIZE: usize = 1024;

/// Name of the pin field in the request body
const PIN_FIELD: &str = "GPIO";
/// Name of the state field in the request body
const STATE_FIELD: &str = "sts";

/// A validated actuation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCommand {
    pub pin: PinId,
    pub level: Level,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("declared body length is zero, negative or too large")]
    SizeInvalid,
    #[error("no memory for the request body")]
    ResourceExhausted,
    #[error("connection failed before the body was complete")]
    TransportFailure,
    #[error("body is not valid JSON")]
    MalformedPayload,
    #[error("GPIO must be a number and sts a string")]
    FieldInvalid,
    #[error("GPIO is outside 0-46")]
    PinOutOfRange,
}

impl DecodeError {
    /// Short text sent back to the client
    pub const fn reason(self) -> &'static str {
        match self {
            Self::SizeInvalid => "Body size invalid",
            Self::ResourceExhausted => "No memory",
            Self::TransportFailure => "Body read failed",
            Self::MalformedPayload => "JSON parse error",
            Self::FieldInvalid => "Invalid fields",
            Self::PinOutOfRange => "GPIO out of range",
        }
    }
}

/// Reads a request body of `declared_len` bytes from `body` and decodes it.
///
/// The length is checked before anything is read, so an empty or oversized
/// request never touches the transport. A read that returns zero bytes or an
/// error (timeouts included) before `declared_len` bytes have arrived is a
/// [`DecodeError::TransportFailure`].
pub async fn decode<R: Read>(
    declared_len: i64,
    body: &mut R,
    max_size: usize,
) -> Result<ControlCommand, DecodeError> {
    if declared_len <= 0 || declared_len as u64 > max_size as u64 {
        return Err(DecodeError::SizeInvalid);
    }
    let len = declared_len as usize;

    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| DecodeError::ResourceExhausted)?;
    buf.resize(len, 0);

    let mut received = 0;
    while received < len {
        match body.read(&mut buf[received..]).await {
            Ok(0) => {
                debug!("peer closed after {} of {} body bytes", received, len);
                return Err(DecodeError::TransportFailure);
            }
            Ok(n) => received += n,
            Err(e) => {
                debug!("body read failed after {} bytes: {:?}", received, e);
                return Err(DecodeError::TransportFailure);
            }
        }
    }

    parse_command(&buf)
}

/// Decodes a complete body that is already in memory.
pub fn parse_command(bytes: &[u8]) -> Result<ControlCommand, DecodeError> {
    let document: Value =
        serde_json::from_slice(bytes).map_err(|_| DecodeError::MalformedPayload)?;

    let (Some(pin), Some(Value::String(state))) =
        (document.get(PIN_FIELD), document.get(STATE_FIELD))
    else {
        return Err(DecodeError::FieldInvalid);
    };

    let raw_pin = pin_number(pin).ok_or(DecodeError::FieldInvalid)?;
    let pin = PinId::new(raw_pin).ok_or(DecodeError::PinOutOfRange)?;

    if !state.eq_ignore_ascii_case("on") && !state.eq_ignore_ascii_case("off") {
        warn!("unrecognized sts token {:?} for {}; driving low", state.as_str(), pin);
    }

    Ok(ControlCommand {
        pin,
        level: Level::from_token(state),
    })
}

/// Integer value of a JSON number; fractions truncate toward zero and
/// magnitudes beyond `i64` saturate.
fn pin_number(value: &Value) -> Option<i64> {
    let Value::Number(number) = value else {
        return None;
    };
    number
        .as_i64()
        .or_else(|| number.as_u64().map(|_| i64::MAX))
        .or_else(|| number.as_f64().map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embedded_io_async::ErrorType;

    #[derive(Debug)]
    struct MockError;

    impl core::fmt::Display for MockError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str("mock transport error")
        }
    }

    impl core::error::Error for MockError {}

    impl embedded_io::Error for MockError {
        fn kind(&self) -> embedded_io::ErrorKind {
            embedded_io::ErrorKind::TimedOut
        }
    }

    /// Hands out `data` in chunks of at most `chunk` bytes, then either
    /// reports end-of-stream or fails.
    struct ChunkedBody<'a> {
        data: &'a [u8],
        chunk: usize,
        fail_at_end: bool,
        reads: usize,
    }

    impl<'a> ChunkedBody<'a> {
        fn new(data: &'a [u8]) -> Self {
            Self {
                data,
                chunk: usize::MAX,
                fail_at_end: false,
                reads: 0,
            }
        }
    }

    impl ErrorType for ChunkedBody<'_> {
        type Error = MockError;
    }

    impl Read for ChunkedBody<'_> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.reads += 1;
            if self.data.is_empty() && self.fail_at_end {
                return Err(MockError);
            }
            let n = self.data.len().min(buf.len()).min(self.chunk);
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn decode_body(body: &[u8]) -> Result<ControlCommand, DecodeError> {
        let mut reader = ChunkedBody::new(body);
        block_on(decode(body.len() as i64, &mut reader, MAX_BODY_SIZE))
    }

    #[test]
    fn test_every_pin_and_token() {
        for p in 0..=46i64 {
            for (token, high) in [("on", true), ("On", true), ("off", false), ("x", false)] {
                let body = alloc::format!(r#"{{"GPIO":{p},"sts":"{token}"}}"#);
                let command = decode_body(body.as_bytes()).unwrap();
                assert_eq!(command.pin.number() as i64, p);
                assert_eq!(command.level, Level::from(high));
            }
        }
    }

    #[test]
    fn test_pin_out_of_range() {
        for p in [-1i64, -46, 47, 50, 1000] {
            let body = alloc::format!(r#"{{"GPIO":{p},"sts":"on"}}"#);
            assert_eq!(decode_body(body.as_bytes()), Err(DecodeError::PinOutOfRange));
        }
        assert_eq!(
            decode_body(br#"{"GPIO":18446744073709551615,"sts":"on"}"#),
            Err(DecodeError::PinOutOfRange)
        );
    }

    #[test]
    fn test_fractional_pin_truncates() {
        let command = decode_body(br#"{"GPIO":5.9,"sts":"on"}"#).unwrap();
        assert_eq!(command.pin.number(), 5);
    }

    #[test]
    fn test_size_checked_before_read() {
        for declared in [0i64, -1, -1024, 1025, 4096] {
            let mut reader = ChunkedBody::new(br#"{"GPIO":5,"sts":"on"}"#);
            let result = block_on(decode(declared, &mut reader, MAX_BODY_SIZE));
            assert_eq!(result, Err(DecodeError::SizeInvalid));
            assert_eq!(reader.reads, 0, "no read for declared length {declared}");
        }
    }

    #[test]
    fn test_max_size_body_is_accepted() {
        let mut body = alloc::vec::Vec::from(&br#"{"GPIO":7,"sts":"on","pad":""#[..]);
        body.resize(MAX_BODY_SIZE - 2, b'a');
        body.extend_from_slice(b"\"}");
        assert_eq!(body.len(), MAX_BODY_SIZE);

        let command = decode_body(&body).unwrap();
        assert_eq!(command.pin.number(), 7);
    }

    #[test]
    fn test_short_body_is_transport_failure() {
        let body = br#"{"GPIO":5,"sts":"on"}"#;
        let mut reader = ChunkedBody::new(body);
        let result = block_on(decode(body.len() as i64 + 10, &mut reader, MAX_BODY_SIZE));
        assert_eq!(result, Err(DecodeError::TransportFailure));

        let mut reader = ChunkedBody::new(&body[..4]);
        reader.fail_at_end = true;
        let result = block_on(decode(body.len() as i64, &mut reader, MAX_BODY_SIZE));
        assert_eq!(result, Err(DecodeError::TransportFailure));
    }

    #[test]
    fn test_body_arrives_in_pieces() {
        let body = br#"{"GPIO":12,"sts":"ON"}"#;
        let mut reader = ChunkedBody::new(body);
        reader.chunk = 3;

        let command = block_on(decode(body.len() as i64, &mut reader, MAX_BODY_SIZE)).unwrap();
        assert_eq!(command.pin.number(), 12);
        assert_eq!(command.level, Level::High);
        assert!(reader.reads > 1);
    }

    #[test]
    fn test_malformed_payload() {
        assert_eq!(decode_body(b"GPIO=5&sts=on"), Err(DecodeError::MalformedPayload));
        assert_eq!(decode_body(br#"{"GPIO":5,"#), Err(DecodeError::MalformedPayload));
        assert_eq!(decode_body(&[0xff, 0xfe]), Err(DecodeError::MalformedPayload));
    }

    #[test]
    fn test_field_invalid() {
        let cases: [&[u8]; 7] = [
            br#"{"sts":"on"}"#,
            br#"{"GPIO":5}"#,
            br#"{"GPIO":"5","sts":"on"}"#,
            br#"{"GPIO":5,"sts":1}"#,
            br#"{"GPIO":null,"sts":"on"}"#,
            br#"{"gpio":5,"sts":"on"}"#,
            br#"[5,"on"]"#,
        ];
        for body in cases {
            assert_eq!(decode_body(body), Err(DecodeError::FieldInvalid));
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let command = decode_body(br#"{"GPIO":3,"sts":"off","extra":[1,2,3]}"#).unwrap();
        assert_eq!(command.pin.number(), 3);
        assert_eq!(command.level, Level::Low);
    }
}
