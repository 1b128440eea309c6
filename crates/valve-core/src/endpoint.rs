//! The `POST /gpio` control endpoint and the per-connection request loop

use embedded_io_async::{Read, Write};
use log::{debug, info, warn};

use crate::control::{self, DecodeError, MAX_BODY_SIZE};
use crate::gpio::PinActuator;
use crate::http::{
    self, HeadError, MAX_HEAD_SIZE, Method, Prefixed, RequestHead, Response, StatusCode,
};

/// Path of the only registered route
pub const CONTROL_PATH: &str = "/gpio";

const OK_BODY: &str = r#"{"result":"ok"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Control,
    MethodNotAllowed,
    NotFound,
}

pub fn route(head: &RequestHead<'_>) -> Route {
    match (head.method, head.path) {
        (Method::Post, CONTROL_PATH) => Route::Control,
        (_, CONTROL_PATH) => Route::MethodNotAllowed,
        _ => Route::NotFound,
    }
}

pub fn decode_error_response(error: DecodeError) -> Response {
    let status = match error {
        DecodeError::ResourceExhausted => StatusCode::InternalServerError,
        _ => StatusCode::BadRequest,
    };
    Response::text(status, error.reason())
}

/// Handles one control request whose head has already been parsed.
///
/// The pin is only touched after the body decoded cleanly, and exactly once.
pub async fn handle_control<R: Read, A: PinActuator>(
    declared_len: i64,
    body: &mut R,
    actuator: &A,
) -> Response {
    let command = match control::decode(declared_len, body, MAX_BODY_SIZE).await {
        Ok(command) => command,
        Err(e) => {
            debug!("rejected control request: {}", e);
            return decode_error_response(e);
        }
    };

    match actuator.set_output(command.pin, command.level) {
        Ok(()) => {
            info!("{} -> {:?}", command.pin, command.level);
            Response::json(StatusCode::Ok, OK_BODY)
        }
        Err(e) => {
            warn!("actuation failed: {}", e);
            Response::text(StatusCode::InternalServerError, "GPIO config failed")
        }
    }
}

/// Serves exactly one request on `socket` and writes the response.
///
/// Returns `Ok(())` without writing anything when the peer closes before
/// sending a byte. Transport errors while reading the head or writing the
/// response are returned to the caller, which drops the connection.
pub async fn serve_connection<S, A>(socket: &mut S, actuator: &A) -> Result<(), S::Error>
where
    S: Read + Write,
    A: PinActuator,
{
    let mut buf = [0u8; MAX_HEAD_SIZE];
    let mut total = 0;

    let head_end = loop {
        if let Some(end) = http::find_head_end(&buf[..total]) {
            break end;
        }
        if total == buf.len() {
            let response = Response::text(
                StatusCode::HeaderFieldsTooLarge,
                "Request header too large",
            );
            debug!("{}", HeadError::TooLarge(MAX_HEAD_SIZE));
            return http::write_response(socket, &response).await;
        }
        let n = socket.read(&mut buf[total..]).await?;
        if n == 0 {
            if total > 0 {
                debug!("peer closed mid-head after {} bytes", total);
            }
            return Ok(());
        }
        total += n;
    };

    let (head_bytes, early_body) = buf[..total].split_at(head_end);
    let head = match http::parse_head(head_bytes) {
        Ok(head) => head,
        Err(e) => {
            debug!("bad request head: {}", e);
            let response = Response::text(StatusCode::BadRequest, "Malformed request");
            return http::write_response(socket, &response).await;
        }
    };

    let response = match route(&head) {
        Route::Control => {
            let mut body = Prefixed::new(early_body, socket);
            handle_control(head.declared_len(), &mut body, actuator).await
        }
        Route::MethodNotAllowed => Response {
            allow: Some("POST"),
            ..Response::text(StatusCode::MethodNotAllowed, "Method not allowed")
        },
        Route::NotFound => Response::text(StatusCode::NotFound, "Not found"),
    };

    debug!(
        "{:?} {} -> {}",
        head.method,
        head.path,
        response.status.code()
    );
    http::write_response(socket, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use embassy_futures::block_on;
    use embedded_io_async::ErrorType;

    use crate::gpio::{ActuationError, Level, PinAvailability, PinId};

    #[derive(Debug)]
    struct Closed;

    impl core::fmt::Display for Closed {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str("connection reset")
        }
    }

    impl core::error::Error for Closed {}

    impl embedded_io::Error for Closed {
        fn kind(&self) -> embedded_io::ErrorKind {
            embedded_io::ErrorKind::ConnectionReset
        }
    }

    /// In-memory connection: the request is read in `chunk`-sized pieces,
    /// everything written is captured.
    struct MockSocket<'a> {
        request: &'a [u8],
        chunk: usize,
        written: Vec<u8>,
        reads: usize,
        flushes: usize,
    }

    impl<'a> MockSocket<'a> {
        fn new(request: &'a [u8]) -> Self {
            Self {
                request,
                chunk: usize::MAX,
                written: Vec::new(),
                reads: 0,
                flushes: 0,
            }
        }

        fn response(&self) -> String {
            String::from_utf8(self.written.clone()).unwrap()
        }
    }

    impl ErrorType for MockSocket<'_> {
        type Error = Closed;
    }

    impl Read for MockSocket<'_> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.reads += 1;
            let n = self.request.len().min(buf.len()).min(self.chunk);
            buf[..n].copy_from_slice(&self.request[..n]);
            self.request = &self.request[n..];
            Ok(n)
        }
    }

    impl Write for MockSocket<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            self.flushes += 1;
            Ok(())
        }
    }

    /// Records every actuation; pins reserved on the ESP32-S3 fail.
    #[derive(Default)]
    struct RecordingPins {
        calls: RefCell<Vec<(u8, Level)>>,
    }

    impl PinActuator for RecordingPins {
        fn set_output(&self, pin: PinId, level: Level) -> Result<(), ActuationError> {
            PinAvailability::ESP32S3.check(pin)?;
            self.calls.borrow_mut().push((pin.number(), level));
            Ok(())
        }
    }

    fn post(body: &str) -> String {
        alloc::format!(
            "POST /gpio HTTP/1.1\r\nHost: 192.168.4.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    }

    fn serve(request: &[u8], pins: &RecordingPins) -> String {
        let mut socket = MockSocket::new(request);
        block_on(serve_connection(&mut socket, pins)).unwrap();
        socket.response()
    }

    #[test]
    fn test_on_drives_pin_high() {
        let pins = RecordingPins::default();
        let response = serve(post(r#"{"GPIO":5,"sts":"ON"}"#).as_bytes(), &pins);

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: application/json\r\n"));
        assert!(response.ends_with("\r\n\r\n{\"result\":\"ok\"}"));
        assert_eq!(*pins.calls.borrow(), [(5, Level::High)]);
    }

    #[test]
    fn test_off_drives_pin_low() {
        let pins = RecordingPins::default();
        let response = serve(post(r#"{"GPIO":5,"sts":"off"}"#).as_bytes(), &pins);

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(*pins.calls.borrow(), [(5, Level::Low)]);
    }

    #[test]
    fn test_last_write_wins() {
        let pins = RecordingPins::default();
        serve(post(r#"{"GPIO":9,"sts":"on"}"#).as_bytes(), &pins);
        serve(post(r#"{"GPIO":9,"sts":"off"}"#).as_bytes(), &pins);

        let calls = pins.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls.last(), Some(&(9, Level::Low)));
    }

    #[test]
    fn test_out_of_range_pin_rejected_without_mutation() {
        let pins = RecordingPins::default();
        let response = serve(post(r#"{"GPIO":50,"sts":"on"}"#).as_bytes(), &pins);

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.ends_with("GPIO out of range"));
        assert!(pins.calls.borrow().is_empty());
    }

    #[test]
    fn test_empty_body_rejected_without_read() {
        let pins = RecordingPins::default();
        let request = b"POST /gpio HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        let mut socket = MockSocket::new(request);
        block_on(serve_connection(&mut socket, &pins)).unwrap();

        assert!(socket.response().starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(socket.response().ends_with("Body size invalid"));
        // One read delivered the whole head; the body was never requested
        assert_eq!(socket.reads, 1);
        assert!(pins.calls.borrow().is_empty());
    }

    #[test]
    fn test_response_is_flushed() {
        let pins = RecordingPins::default();
        let request = post(r#"{"GPIO":5,"sts":"on"}"#);
        let mut socket = MockSocket::new(request.as_bytes());
        block_on(serve_connection(&mut socket, &pins)).unwrap();

        assert!(socket.response().starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(socket.flushes, 1);
    }

    #[test]
    fn test_huge_content_length_is_size_invalid() {
        let pins = RecordingPins::default();
        let response = serve(
            b"POST /gpio HTTP/1.1\r\nContent-Length: 99999999999999999999\r\n\r\n",
            &pins,
        );

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.ends_with("Body size invalid"));
        assert!(pins.calls.borrow().is_empty());
    }

    #[test]
    fn test_missing_content_length_is_size_invalid() {
        let pins = RecordingPins::default();
        let response = serve(b"POST /gpio HTTP/1.1\r\n\r\n", &pins);
        assert!(response.ends_with("Body size invalid"));
    }

    #[test]
    fn test_body_split_across_reads() {
        let pins = RecordingPins::default();
        let request = post(r#"{"GPIO":14,"sts":"on"}"#);
        let mut socket = MockSocket::new(request.as_bytes());
        socket.chunk = 7;
        block_on(serve_connection(&mut socket, &pins)).unwrap();

        assert!(socket.response().starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(*pins.calls.borrow(), [(14, Level::High)]);
    }

    #[test]
    fn test_truncated_body_is_bad_request() {
        let pins = RecordingPins::default();
        let request = b"POST /gpio HTTP/1.1\r\nContent-Length: 40\r\n\r\n{\"GPIO\":5";
        let response = serve(request, &pins);

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.ends_with("Body read failed"));
        assert!(pins.calls.borrow().is_empty());
    }

    #[test]
    fn test_actuation_failure_is_server_error() {
        let pins = RecordingPins::default();
        let response = serve(post(r#"{"GPIO":27,"sts":"on"}"#).as_bytes(), &pins);

        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(response.ends_with("GPIO config failed"));
        assert!(pins.calls.borrow().is_empty());
    }

    #[test]
    fn test_routing() {
        let pins = RecordingPins::default();

        let response = serve(b"GET /gpio HTTP/1.1\r\n\r\n", &pins);
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.contains("Allow: POST\r\n"));

        let response = serve(post(r#"{"GPIO":5,"sts":"on"}"#).replace("/gpio", "/valve").as_bytes(), &pins);
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let response = serve(b"POST /gpio SPDY/3\r\n\r\n", &pins);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        assert!(pins.calls.borrow().is_empty());
    }

    #[test]
    fn test_oversized_head() {
        let pins = RecordingPins::default();
        let mut request = Vec::from(&b"POST /gpio HTTP/1.1\r\nX-Padding: "[..]);
        request.resize(MAX_HEAD_SIZE + 10, b'x');
        let response = serve(&request, &pins);

        assert!(response.starts_with("HTTP/1.1 431 "));
    }

    #[test]
    fn test_silent_peer() {
        let pins = RecordingPins::default();
        assert_eq!(serve(b"", &pins), "");
    }
}
