//! HTTP front end over `std::net`. The accept loop hands every connection to
//! its own thread; each connection carries exactly one request.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::SignedRequest;
use crate::dispatcher::{Dispatched, Gateway, JobStream};
use crate::error::GatewayError;
use crate::intent::{Intent, IntentKind, IntentParams};
use crate::schema::ValidationError;

pub mod http;

use http::{HttpError, HttpRequest};

pub const DOCUMENT_HEADER: &str = "x-quantum-document";
pub const KEY_VERSION_HEADER: &str = "x-quantum-key-version";
const MAX_DOCUMENT_BYTES: u64 = 1024 * 1024;
const MAX_CONNECTIONS: usize = 256;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    addr: String,
    gateway: Arc<Gateway>,
}

impl ApiServer {
    pub fn new(addr: impl Into<String>, gateway: Arc<Gateway>) -> Self {
        Self {
            addr: addr.into(),
            gateway,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let gateway = self.gateway;
        let join = std::thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, gateway, shutdown_thread) {
                    log::error!("api stopped: {}", err);
                }
            })?;
        log::info!("api listening on {addr}");

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, gateway: Arc<Gateway>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((mut stream, peer)) => {
                if active.load(Ordering::SeqCst) >= MAX_CONNECTIONS {
                    log::warn!("connection limit reached; refusing {peer}");
                    let _ = reply_error(&mut stream, 503, "over_capacity", "too many connections");
                    continue;
                }
                active.fetch_add(1, Ordering::SeqCst);
                let gateway = gateway.clone();
                let active_conn = active.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &gateway, peer.ip()) {
                            log::warn!("api request from {peer} failed: {err}");
                        }
                        active_conn.fetch_sub(1, Ordering::SeqCst);
                    });
                if let Err(err) = spawned {
                    active.fetch_sub(1, Ordering::SeqCst);
                    log::error!("failed to spawn connection worker: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, gateway: &Gateway, client_ip: IpAddr) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut request = match http::read_head(&mut stream) {
        Ok(request) => request,
        Err(HttpError::Closed) => return Ok(()),
        Err(err) => {
            reply_error(&mut stream, err.status(), "bad_request", &err.to_string())?;
            return Err(err.into());
        }
    };

    let (method, path) = (request.method.clone(), request.path.clone());
    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => {
            http::write_json(&mut stream, 200, &json!({"status": "ok"}))?;
            Ok(())
        }
        ("GET", "/ready") => {
            let readiness = gateway.readiness();
            let status = if readiness.ready { 200 } else { 503 };
            http::write_json(
                &mut stream,
                status,
                &json!({
                    "status": if readiness.ready { "ready" } else { "unavailable" },
                    "checks": readiness.checks,
                }),
            )?;
            Ok(())
        }
        ("POST", "/intents") => {
            let document = match read_document(&mut request, &mut stream) {
                Ok(document) => document,
                Err(err) => return reply_http_error(&mut stream, err),
            };
            let outcome = admit(gateway, &request, &document, client_ip).and_then(|intent| {
                if intent.kind() == IntentKind::StoreArtifact {
                    return Err(wrong_route("storeArtifact must be posted to /artifacts"));
                }
                gateway.dispatch(intent, None)
            });
            respond(&mut stream, outcome)
        }
        ("POST", "/artifacts") => {
            let Some(document) = signed_document(&request) else {
                return missing_document(&mut stream);
            };
            if request.content_length()?.is_none() {
                return reply_error(
                    &mut stream,
                    411,
                    "length_required",
                    "Content-Length is required",
                );
            }
            let outcome = admit(gateway, &request, &document, client_ip).and_then(|intent| {
                if intent.kind() != IntentKind::StoreArtifact {
                    return Err(wrong_route("only storeArtifact may be posted to /artifacts"));
                }
                let mut body = request.body(&mut stream).map_err(|err| {
                    GatewayError::Validation(ValidationError::Malformed(err.to_string()))
                })?;
                gateway.dispatch(intent, Some(&mut body))
            });
            respond(&mut stream, outcome)
        }
        ("GET", path) if path.starts_with("/jobs/") => {
            let Ok(job_id) = path["/jobs/".len()..].parse::<Uuid>() else {
                return reply_error(&mut stream, 404, "not_found", "unknown job");
            };
            let Some(document) = signed_document(&request) else {
                return missing_document(&mut stream);
            };
            let outcome = admit(gateway, &request, &document, client_ip).and_then(|intent| {
                match &intent.params {
                    IntentParams::JobStatus { job_id: signed } if *signed == job_id => {}
                    IntentParams::JobStatus { .. } => {
                        return Err(GatewayError::Validation(ValidationError::Invalid {
                            path: "/manifest/job_id".to_string(),
                            message: "job_id does not match the request path".to_string(),
                        }))
                    }
                    _ => return Err(wrong_route("only jobStatus may be sent to /jobs/{id}")),
                }
                gateway.dispatch(intent, None)
            });
            respond(&mut stream, outcome)
        }
        (_, "/health" | "/ready" | "/intents" | "/artifacts") => {
            reply_error(&mut stream, 405, "method_not_allowed", "method not allowed")
        }
        _ => reply_error(&mut stream, 404, "not_found", "no such route"),
    }
}

/// Routes whose body is not the document carry it in `X-Quantum-Document`.
fn signed_document(request: &HttpRequest) -> Option<Vec<u8>> {
    request
        .header(DOCUMENT_HEADER)
        .map(|document| document.as_bytes().to_vec())
}

fn missing_document(stream: &mut TcpStream) -> Result<()> {
    reply_error(
        stream,
        422,
        "validation_failed",
        "missing X-Quantum-Document header",
    )
}

/// The signed document: `X-Quantum-Document` when present, else the body.
fn read_document(
    request: &mut HttpRequest,
    stream: &mut TcpStream,
) -> Result<Vec<u8>, HttpError> {
    if let Some(document) = request.header(DOCUMENT_HEADER) {
        return Ok(document.as_bytes().to_vec());
    }
    if request.content_length()?.unwrap_or(0) > MAX_DOCUMENT_BYTES {
        return Err(HttpError::BadRequest("document too large".to_string()));
    }
    let mut document = Vec::new();
    request.body(stream)?.read_to_end(&mut document)?;
    Ok(document)
}

fn admit(
    gateway: &Gateway,
    request: &HttpRequest,
    document: &[u8],
    client_ip: IpAddr,
) -> Result<Intent, GatewayError> {
    let signed = SignedRequest {
        method: &request.method,
        path: &request.path,
        authorization: request.header("authorization"),
        key_version: request.header(KEY_VERSION_HEADER),
        document,
        client_ip,
    };
    let caller = gateway.authenticate(&signed)?;
    gateway.admit(&caller, document)
}

fn wrong_route(message: &str) -> GatewayError {
    GatewayError::Validation(ValidationError::Invalid {
        path: "/type".to_string(),
        message: message.to_string(),
    })
}

fn respond(stream: &mut TcpStream, outcome: Result<Dispatched, GatewayError>) -> Result<()> {
    let dispatched = match outcome {
        Ok(dispatched) => dispatched,
        Err(err) => {
            if err.status() >= 500 {
                log::error!("request failed: {err}");
            } else {
                log::info!("request rejected: {err}");
            }
            http::write_json(stream, err.status(), &err.body())?;
            return Ok(());
        }
    };
    match dispatched {
        Dispatched::Accepted(job) => http::write_json(
            stream,
            202,
            &json!({"jobId": job.job_id, "status": "accepted"}),
        )?,
        Dispatched::Stream(logs) => stream_job(stream, logs)?,
        Dispatched::Stored(receipt) => {
            http::write_json(stream, 201, &serde_json::to_value(&receipt)?)?
        }
        Dispatched::Artifact { meta, mut reader } => {
            let headers = [
                ("X-Artifact-Id", meta.artifact_id.to_string()),
                ("X-Artifact-Size", meta.size_bytes.to_string()),
                ("X-Artifact-Hash", meta.content_hash.clone()),
            ];
            let content_type = meta
                .mime_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            http::start_sized(stream, 200, content_type, meta.size_bytes, &headers)?;
            // Headers are out; an integrity failure here can only cut the
            // connection short.
            io::copy(&mut reader, stream)?;
            stream.flush()?;
        }
        Dispatched::Deleted(artifact_id) => http::write_json(
            stream,
            200,
            &json!({"deleted": true, "artifactId": artifact_id}),
        )?,
        Dispatched::Updated(meta) => http::write_json(stream, 200, &serde_json::to_value(&meta)?)?,
        Dispatched::Page(page) => http::write_json(stream, 200, &serde_json::to_value(&page)?)?,
        Dispatched::Job(job) => http::write_json(stream, 200, &serde_json::to_value(&job)?)?,
    }
    Ok(())
}

/// NDJSON log lines, then one `exit` line with the final job state.
fn stream_job(stream: &mut TcpStream, mut logs: JobStream) -> Result<()> {
    let job_id = logs.job_id();
    let mut out = http::start_chunked(&mut *stream, 200, "application/x-ndjson")?;
    out.write_all(format!("{}\n", json!({"event": "start", "jobId": job_id})).as_bytes())?;
    for event in logs.by_ref() {
        let line = json!({
            "event": "log",
            "stream": event.stream,
            "line": event.line,
            "at": event.at_ms,
        });
        out.write_all(format!("{line}\n").as_bytes())?;
        out.flush()?;
    }
    let exit = match logs.finish() {
        Ok(job) => json!({
            "event": "exit",
            "jobId": job.job_id,
            "status": job.status,
            "exitCode": job.result.as_ref().and_then(|result| result.exit_code),
            "durationMs": job.result.as_ref().map(|result| result.duration_ms),
            "error": job.error,
        }),
        Err(err) => json!({
            "event": "exit",
            "jobId": job_id,
            "status": "failed",
            "error": err.public_message(),
        }),
    };
    out.write_all(format!("{exit}\n").as_bytes())?;
    out.finish()?;
    Ok(())
}

fn reply_http_error(stream: &mut TcpStream, err: HttpError) -> Result<()> {
    reply_error(stream, err.status(), "bad_request", &err.to_string())?;
    Err(err.into())
}

fn reply_error(stream: &mut TcpStream, status: u16, code: &str, message: &str) -> Result<()> {
    let body: Value = json!({"error": code, "message": message});
    http::write_json(stream, status, &body)?;
    Ok(())
}
