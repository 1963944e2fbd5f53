//! Thin HTTP/SSE adapter over the command facade.
//!
//! Translates the operator surface one-to-one onto supervisor calls and
//! streams status snapshots as server-sent events. Every response is
//! `{ok: true, ...}` or `{ok: false, error}`; no error escapes as a
//! panic or a raw 500 with an empty body. Each request runs on its own
//! short-lived thread so a slow SSE consumer never blocks commands.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nestor_common::error::Error;
use nestor_common::types::Mode;
use serde::Deserialize;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;

// ─── Request bodies (defaults match the operator UI) ────────────────

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ReasonBody {
    reason: String,
}

impl Default for ReasonBody {
    fn default() -> Self {
        Self {
            reason: "user stop".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct JogBody {
    rpm: u16,
    seconds: f64,
}

impl Default for JogBody {
    fn default() -> Self {
        Self {
            rpm: 200,
            seconds: 1.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HallRunBody {
    rpm: u16,
    seconds: f64,
    direction: String,
}

impl Default for HallRunBody {
    fn default() -> Self {
        Self {
            rpm: 200,
            seconds: 0.0,
            direction: "forward".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TestBody {
    rpm: u16,
    seconds: f64,
}

impl Default for TestBody {
    fn default() -> Self {
        Self {
            rpm: 350,
            seconds: 10.0,
        }
    }
}

// ─── Server loop ────────────────────────────────────────────────────

/// Serve the HTTP adapter until supervisor shutdown. Blocking.
pub fn serve(sup: &Arc<Supervisor>, host: &str, port: u16) -> std::io::Result<()> {
    let server = Server::http((host, port))
        .map_err(|e| std::io::Error::other(format!("bind {host}:{port}: {e}")))?;
    info!(host, port, "http adapter listening");

    while !sup.is_shutdown() {
        match server.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(request)) => {
                let sup = Arc::clone(sup);
                let spawned = thread::Builder::new()
                    .name("http-request".to_string())
                    .spawn(move || handle(&sup, request));
                if let Err(e) = spawned {
                    warn!(error = %e, "request worker spawn failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "http accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    info!("http adapter stopped");
    Ok(())
}

fn handle(sup: &Arc<Supervisor>, mut request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    debug!(%method, %url, "request");

    let response = match (&method, url.as_str()) {
        (Method::Get, "/status") => status_response(sup),
        (Method::Get, "/events") => {
            respond_sse(sup, request);
            return;
        }
        (Method::Post, "/mode/idle") => set_mode(sup, Mode::Idle),
        (Method::Post, "/mode/setup") => set_mode(sup, Mode::Setup),
        (Method::Post, "/mode/test") => set_mode(sup, Mode::Test),
        (Method::Post, "/fault/clear") => {
            sup.record_command("fault", "clear");
            result_response(sup.clear_fault().map(|()| json!({})))
        }
        (Method::Post, "/stop") => {
            let body: ReasonBody = read_body(&mut request);
            sup.record_command("stop", &body.reason);
            sup.stop_all(&body.reason, false);
            ok_response(json!({"stopped": true, "reason": body.reason}))
        }
        (Method::Post, "/stop/all") => {
            let body = read_body_or(&mut request, ReasonBody {
                reason: "emergency stop".to_string(),
            });
            sup.record_command("stop_all", &body.reason);
            sup.emergency_stop(&body.reason);
            ok_response(json!({"stopped": true, "fault": true, "reason": body.reason}))
        }
        (Method::Post, "/job/cancel") => {
            let body = read_body_or(&mut request, ReasonBody {
                reason: "user cancel".to_string(),
            });
            sup.record_command("cancel_job", &body.reason);
            sup.cancel_job(&body.reason);
            ok_response(json!({"cancelled": true, "reason": body.reason}))
        }
        (Method::Post, "/setup/jog") => {
            let body: JogBody = read_body(&mut request);
            sup.record_command("setup_jog", &format!("rpm={} sec={}", body.rpm, body.seconds));
            result_response(
                sup.setup_jog(body.rpm, body.seconds)
                    .map(|job| json!({"job": job})),
            )
        }
        (Method::Post, "/setup/hall") => {
            let body: HallRunBody = read_body(&mut request);
            sup.record_command(
                "setup_hall",
                &format!("rpm={} dir={}", body.rpm, body.direction),
            );
            result_response(
                sup.setup_hall_run(body.rpm, body.seconds, &body.direction)
                    .map(|job| json!({"job": job})),
            )
        }
        (Method::Post, "/test/up") => {
            let body: TestBody = read_body(&mut request);
            sup.record_command("test_up", &format!("rpm={} sec={}", body.rpm, body.seconds));
            result_response(
                sup.test_up(body.rpm, body.seconds)
                    .map(|job| json!({"job": job})),
            )
        }
        (Method::Post, path) if path.starts_with("/test/dir/") => {
            let name = path.trim_start_matches("/test/dir/").to_string();
            let body = read_body_or(&mut request, TestBody {
                rpm: 350,
                seconds: 6.0,
            });
            sup.record_command(
                "test_dir",
                &format!("dir={name} rpm={} sec={}", body.rpm, body.seconds),
            );
            result_response(
                sup.test_direction(&name, body.rpm, body.seconds)
                    .map(|job| json!({"job": job})),
            )
        }
        _ => json_response(404, &json!({"ok": false, "error": "not found"})),
    };

    if let Err(e) = request.respond(response) {
        debug!(error = %e, "client went away before response");
    }
}

fn set_mode(sup: &Arc<Supervisor>, mode: Mode) -> Response<std::io::Cursor<Vec<u8>>> {
    sup.record_command("mode", mode.as_str());
    result_response(sup.set_mode(mode).map(|()| json!({})))
}

fn status_response(sup: &Arc<Supervisor>) -> Response<std::io::Cursor<Vec<u8>>> {
    match serde_json::to_value(sup.get_status()) {
        Ok(value) => json_response(200, &value),
        Err(e) => json_response(500, &json!({"ok": false, "error": e.to_string()})),
    }
}

// ─── Plumbing ───────────────────────────────────────────────────────

fn read_body<T: serde::de::DeserializeOwned + Default>(request: &mut Request) -> T {
    read_body_or(request, T::default())
}

/// Parse the JSON body; an empty or malformed body falls back to the
/// given defaults, matching the permissive operator UI contract.
fn read_body_or<T: serde::de::DeserializeOwned>(request: &mut Request, fallback: T) -> T {
    let mut text = String::new();
    if request.as_reader().read_to_string(&mut text).is_err() {
        return fallback;
    }
    if text.trim().is_empty() {
        return fallback;
    }
    serde_json::from_str(&text).unwrap_or(fallback)
}

fn ok_response(mut data: Value) -> Response<std::io::Cursor<Vec<u8>>> {
    if let Some(map) = data.as_object_mut() {
        map.insert("ok".to_string(), Value::Bool(true));
    }
    json_response(200, &data)
}

fn result_response(result: Result<Value, Error>) -> Response<std::io::Cursor<Vec<u8>>> {
    match result {
        Ok(data) => ok_response(data),
        Err(e) => json_response(400, &json!({"ok": false, "error": e.to_string()})),
    }
}

fn json_response(status: u16, body: &Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response =
        Response::from_string(body.to_string()).with_status_code(StatusCode(status));
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response.add_header(header);
    }
    response
}

/// Reader that produces one status snapshot per interval as an SSE event.
struct SseStream {
    sup: Arc<Supervisor>,
    interval: Duration,
    pending: Vec<u8>,
    offset: usize,
    first: bool,
}

impl Read for SseStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.pending.len() {
            if self.sup.is_shutdown() {
                return Ok(0);
            }
            if self.first {
                self.first = false;
            } else {
                thread::sleep(self.interval);
            }
            let payload = serde_json::to_string(&self.sup.get_status())
                .unwrap_or_else(|e| json!({"ok": false, "error": e.to_string()}).to_string());
            self.pending = format!("data: {payload}\n\n").into_bytes();
            self.offset = 0;
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

fn respond_sse(sup: &Arc<Supervisor>, request: Request) {
    let interval = Duration::from_secs_f64(sup.config().api.events_interval_s.max(0.02));
    let stream = SseStream {
        sup: Arc::clone(sup),
        interval,
        pending: Vec::new(),
        offset: 0,
        first: true,
    };
    let mut headers = Vec::new();
    for (name, value) in [
        ("Content-Type", "text/event-stream"),
        ("Cache-Control", "no-cache"),
    ] {
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            headers.push(header);
        }
    }
    let response = Response::new(StatusCode(200), headers, stream, None, None);
    if let Err(e) = request.respond(response) {
        debug!(error = %e, "sse client disconnected");
    }
}
