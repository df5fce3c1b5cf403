//! HTTP transport.
//!
//! The host runs a tiny HTTP/1.1 endpoint:
//!
//! - `POST /command` with `{"command": <Command>}` answers `{"result": <Response>}`
//!   once the host thread has executed the command, `409` while another
//!   command occupies the slot, `400` for an unreadable body.
//! - `GET /health` answers `{"status": "ok", "host": <name>, "busy": <bool>}`.
//!
//! The connection task parks the command in a shared slot and waits on a
//! oneshot; the host thread picks it up on its next tick and completes it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{GatewayChannel, HostChannel, HostStatus, Incoming, MAX_ENVELOPE_SIZE};
use crate::envelope::{self, Command, Response};
use crate::error::{BridgeError, ErrorKind};

const READ_CHUNK_BYTES: usize = 16 * 1024;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Caller side
// ---------------------------------------------------------------------------

/// Caller side: each `write_command` is one blocking round trip and the
/// response is held until `try_read_response` takes it.
pub struct HttpGatewayChannel {
    client: reqwest::Client,
    endpoint: String,
    received: Mutex<Option<Response>>,
}

impl HttpGatewayChannel {
    /// `timeout` bounds a whole round trip, including host execution.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::channel("failed creating HTTP client", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            received: Mutex::new(None),
        })
    }

    fn received(&self) -> MutexGuard<'_, Option<Response>> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn error_field(body: &Value) -> String {
    body.get("error")
        .and_then(Value::as_str)
        .unwrap_or("no error detail")
        .to_string()
}

#[async_trait]
impl GatewayChannel for HttpGatewayChannel {
    async fn write_command(&self, command: &Command) -> Result<bool, BridgeError> {
        let url = format!("{}/command", self.endpoint);
        let reply = self
            .client
            .post(&url)
            .json(&json!({ "command": command }))
            .send()
            .await
            .map_err(|e| BridgeError::channel(&format!("POST {url} failed"), e))?;

        let status = reply.status();
        if status == reqwest::StatusCode::CONFLICT {
            debug!(command_id = %command.id, "Host slot still occupied");
            return Ok(false);
        }
        let body: Value = reply
            .json()
            .await
            .map_err(|e| BridgeError::channel("unreadable reply from host", e))?;

        if !status.is_success() {
            return Err(BridgeError::ChannelUnavailable(format!(
                "host answered {status}: {}",
                error_field(&body)
            )));
        }

        let result = body
            .get("result")
            .cloned()
            .ok_or_else(|| BridgeError::ChannelUnavailable("host reply has no result".into()))?;
        let response: Response = serde_json::from_value(result)
            .map_err(|e| BridgeError::channel("undecodable response", e))?;
        *self.received() = Some(response);
        Ok(true)
    }

    async fn try_read_response(&self) -> Result<Option<Response>, BridgeError> {
        Ok(self.received().take())
    }

    async fn probe(&self) -> HostStatus {
        let url = format!("{}/health", self.endpoint);
        let reply = self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await;
        match reply {
            Ok(reply) if reply.status().is_success() => {
                let body: Value = reply.json().await.unwrap_or(Value::Null);
                HostStatus {
                    transport: "http",
                    available: true,
                    busy: body.get("busy").and_then(Value::as_bool),
                    detail: format!(
                        "host '{}' at {}",
                        body.get("host").and_then(Value::as_str).unwrap_or("unknown"),
                        self.endpoint
                    ),
                }
            }
            Ok(reply) => HostStatus {
                transport: "http",
                available: false,
                busy: None,
                detail: format!("health check answered {}", reply.status()),
            },
            Err(e) => HostStatus {
                transport: "http",
                available: false,
                busy: None,
                detail: format!("{url} unreachable: {e}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    /// Received but not yet picked up by the host thread.
    pending: Option<(Command, oneshot::Sender<Response>)>,
    /// Picked up and executing.
    in_flight: Option<(String, oneshot::Sender<Response>)>,
}

impl SlotState {
    const fn is_occupied(&self) -> bool {
        self.pending.is_some() || self.in_flight.is_some()
    }
}

#[derive(Clone, Default)]
struct Slot(Arc<Mutex<SlotState>>);

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Host-thread side of the HTTP slot.
pub struct HttpHostChannel {
    slot: Slot,
}

impl HostChannel for HttpHostChannel {
    fn try_read_command(&mut self) -> Result<Option<Incoming>, BridgeError> {
        let mut state = self.slot.lock();
        let Some((command, reply)) = state.pending.take() else {
            return Ok(None);
        };
        state.in_flight = Some((command.id.clone(), reply));
        Ok(Some(Incoming::Command(command)))
    }

    fn write_response(&mut self, response: &Response) -> Result<(), BridgeError> {
        let waiter = self.slot.lock().in_flight.take();
        match waiter {
            Some((id, reply)) if id == response.command_id => {
                if reply.send(response.clone()).is_err() {
                    debug!(command_id = %id, "Caller disconnected before the response");
                }
                Ok(())
            }
            Some((id, reply)) => {
                warn!(expected = %id, got = %response.command_id, "Response does not match the command in flight");
                self.slot.lock().in_flight = Some((id, reply));
                Err(BridgeError::ChannelUnavailable(format!(
                    "no caller waiting for command {}",
                    response.command_id
                )))
            }
            None => Err(BridgeError::ChannelUnavailable(format!(
                "no caller waiting for command {}",
                response.command_id
            ))),
        }
    }
}

/// Listener half of the HTTP transport, run on the tokio runtime.
pub struct HttpHostServer {
    listener: TcpListener,
    slot: Slot,
    host_name: Arc<str>,
}

impl HttpHostServer {
    /// Bind the endpoint and return it together with the host-thread side.
    pub async fn bind(addr: &str, host_name: &str) -> Result<(Self, HttpHostChannel)> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed binding host endpoint on {addr}"))?;
        let slot = Slot::default();
        let server = Self {
            listener,
            slot: slot.clone(),
            host_name: Arc::from(host_name),
        };
        Ok((server, HttpHostChannel { slot }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed reading bound address")
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(addr = %self.local_addr()?, "Host endpoint listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let slot = self.slot.clone();
                        let host_name = Arc::clone(&self.host_name);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, slot, host_name).await {
                                warn!(%remote, error = %e, "Host endpoint connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Host endpoint accept failed"),
                },
            }
        }
        Ok(())
    }
}

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

async fn handle_connection(mut stream: TcpStream, slot: Slot, host_name: Arc<str>) -> Result<()> {
    let request = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(&mut stream))
        .await
        .context("timed out reading request")??;
    let Some(request) = request else {
        return Ok(());
    };

    let (status, body) = match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let busy = slot.lock().is_occupied();
            (200, json!({ "status": "ok", "host": &*host_name, "busy": busy }))
        }
        ("POST", "/command") => submit(&slot, &request.body).await,
        (_, "/health" | "/command") => (405, json!({ "error": "method not allowed" })),
        _ => (404, json!({ "error": "not found" })),
    };
    write_json(&mut stream, status, &body).await
}

/// Park a command in the slot and wait for the host thread to answer it.
async fn submit(slot: &Slot, body: &[u8]) -> (u16, Value) {
    let raw = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(mut map)) => map.remove("command").unwrap_or(Value::Null),
        Ok(_) => return (400, json!({ "error": "body must be {\"command\": ...}" })),
        Err(e) => return (400, json!({ "error": format!("body is not valid JSON: {e}") })),
    };
    let command = match envelope::command_from_value(raw) {
        Ok(command) => command,
        Err(e) => {
            return match e.id {
                Some(id) => {
                    let response = Response::error(id, ErrorKind::MalformedCommand, e.reason);
                    (200, json!({ "result": response }))
                }
                None => (400, json!({ "error": e.reason })),
            };
        }
    };

    let (tx, rx) = oneshot::channel();
    {
        let mut state = slot.lock();
        if state.is_occupied() {
            return (409, json!({ "error": "host is busy with another command" }));
        }
        debug!(command_id = %command.id, "Command parked for the host thread");
        state.pending = Some((command, tx));
    }

    match rx.await {
        Ok(response) => (200, json!({ "result": response })),
        Err(_) => (503, json!({ "error": "host stopped before answering" })),
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|idx| (idx, 2))
}

fn parse_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

async fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(READ_CHUNK_BYTES);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut framing: Option<(usize, usize)> = None;

    loop {
        if let Some((body_start, content_length)) = framing {
            if buffer.len() - body_start >= content_length {
                break;
            }
        }
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        anyhow::ensure!(
            buffer.len() <= MAX_ENVELOPE_SIZE,
            "request exceeds max size: {} > {MAX_ENVELOPE_SIZE}",
            buffer.len()
        );
        if framing.is_none() {
            if let Some((header_end, separator_len)) = find_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_content_length(&headers).unwrap_or(0);
                anyhow::ensure!(
                    content_length <= MAX_ENVELOPE_SIZE,
                    "declared body exceeds max size: {content_length} > {MAX_ENVELOPE_SIZE}"
                );
                framing = Some((header_end + separator_len, content_length));
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    let (body_start, content_length) =
        framing.context("invalid request: missing header terminator")?;
    anyhow::ensure!(
        buffer.len() - body_start >= content_length,
        "truncated request body"
    );

    let headers = String::from_utf8_lossy(&buffer[..body_start]);
    let mut request_line = headers.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_ascii_uppercase();
    anyhow::ensure!(!method.is_empty(), "invalid request line");
    let target = request_line.next().unwrap_or("/");
    let path = target.split('?').next().unwrap_or(target).to_string();

    Ok(Some(HttpRequest {
        method,
        path,
        body: buffer[body_start..body_start + content_length].to_vec(),
    }))
}

async fn write_json(stream: &mut TcpStream, status: u16, payload: &Value) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing response body")?;
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing response headers")?;
    stream
        .write_all(&body)
        .await
        .context("failed writing response body")?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn start() -> (SocketAddr, HttpHostChannel, oneshot::Sender<()>) {
        let (server, channel) = HttpHostServer::bind("127.0.0.1:0", "test-host").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));
        (addr, channel, stop_tx)
    }

    /// Answer every parked command from a plain thread, like the host loop does.
    fn echo_host(mut channel: HttpHostChannel, rounds: usize) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut answered = 0;
            while answered < rounds {
                match channel.try_read_command().unwrap() {
                    Some(Incoming::Command(cmd)) => {
                        let value = json!(cmd.kind.label());
                        channel
                            .write_response(&Response::success(&cmd.id, Some(value)))
                            .unwrap();
                        answered += 1;
                    }
                    Some(Incoming::Malformed(_)) => unreachable!("the server answers those"),
                    None => std::thread::sleep(Duration::from_millis(5)),
                }
            }
        })
    }

    #[tokio::test]
    async fn round_trip_through_the_host_thread() {
        let (addr, channel, _stop) = start().await;
        let host = echo_host(channel, 1);

        let gateway =
            HttpGatewayChannel::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
        let command = Command::execute_code("result = 1");
        gateway.write_command(&command).await.unwrap();

        let response = gateway.try_read_response().await.unwrap().unwrap();
        assert_eq!(response.command_id, command.id);
        assert_eq!(response.value, Some(json!("execute_code")));
        assert!(gateway.try_read_response().await.unwrap().is_none());
        host.join().unwrap();
    }

    #[tokio::test]
    async fn occupied_slot_reports_busy() {
        let (addr, mut channel, _stop) = start().await;
        let endpoint = format!("http://{addr}");

        let first = HttpGatewayChannel::new(&endpoint, Duration::from_secs(5)).unwrap();
        let command = Command::execute_code("1");
        let pending = tokio::spawn(async move { first.write_command(&command).await });

        // Wait until the first command is parked.
        let parked = loop {
            if let Some(Incoming::Command(cmd)) = channel.try_read_command().unwrap() {
                break cmd;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let second = HttpGatewayChannel::new(&endpoint, Duration::from_secs(5)).unwrap();
        let placed = second
            .write_command(&Command::execute_code("2"))
            .await
            .unwrap();
        assert!(!placed);
        assert!(second.try_read_response().await.unwrap().is_none());
        assert!(second.probe().await.busy.unwrap());

        channel
            .write_response(&Response::success(&parked.id, None))
            .unwrap();
        assert!(pending.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn malformed_command_with_id_gets_an_error_response() {
        let (addr, _channel, _stop) = start().await;
        let gateway = HttpGatewayChannel::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();

        let mut command = Command::execute_code("x");
        if let crate::envelope::CommandKind::ExecuteCode { source } = &mut command.kind {
            source.clear();
        }
        gateway.write_command(&command).await.unwrap();
        let response = gateway.try_read_response().await.unwrap().unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::MalformedCommand));
    }

    #[tokio::test]
    async fn health_and_unreachable_host() {
        let (addr, _channel, _stop) = start().await;
        let gateway = HttpGatewayChannel::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
        let status = gateway.probe().await;
        assert!(status.available);
        assert_eq!(status.busy, Some(false));
        assert!(status.detail.contains("test-host"));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);
        let gateway = HttpGatewayChannel::new(&format!("http://{dead}"), Duration::from_secs(1)).unwrap();
        assert!(!gateway.probe().await.available);
        let err = gateway
            .write_command(&Command::execute_code("1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelUnavailable);
    }

    /// Feed raw bytes to `read_request` over a loopback connection.
    async fn read_raw(raw: &'static [u8]) -> Result<Option<HttpRequest>> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(raw).await.unwrap();
            let _ = stream.shutdown().await;
        });
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        client.await.unwrap();
        request
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected() {
        let err = read_raw(b"POST /command HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n{}")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("exceeds max size"), "{err}");

        let err = read_raw(b"POST /command HTTP/1.1\r\nContent-Length: 16777217\r\n\r\n")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("exceeds max size"), "{err}");
    }

    #[tokio::test]
    async fn body_is_framed_by_content_length() {
        let request = read_raw(b"POST /command?x=1 HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/command");
        assert_eq!(request.body, b"{}");

        let err = read_raw(b"POST /command HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn header_helpers() {
        assert_eq!(find_header_terminator(b"GET / HTTP/1.1\r\n\r\n"), Some((14, 4)));
        assert_eq!(find_header_terminator(b"GET /\n\nbody"), Some((5, 2)));
        assert_eq!(
            parse_content_length("POST /command HTTP/1.1\r\ncontent-length: 42\r\n"),
            Some(42)
        );
        assert_eq!(parse_content_length("GET / HTTP/1.1"), None);
    }
}
