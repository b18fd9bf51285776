use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alert::WebhookNotifier;
use crate::broker::StatusPublisher;
use crate::classify::{classify, Status};
use crate::detect::DetectorBackend;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const UPLOAD_FIELD: &str = "imageFile";
const TIPPED_ALERT: &str = "ALERT: feeder cup tipped over";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5001".to_string(),
        }
    }
}

/// Everything one upload needs: the detector, the broker seam, and the
/// alert notifier. Owned by the server thread; requests borrow it in turn.
pub struct AppContext {
    pub detector: Box<dyn DetectorBackend>,
    pub publisher: Arc<dyn StatusPublisher>,
    pub notifier: WebhookNotifier,
}

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
                .map_err(|_| anyhow!("upload server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: AppContext,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: AppContext) -> Self {
        Self { cfg, ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let mut ctx = self.ctx;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &mut ctx, shutdown_thread) {
                log::error!("upload server stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    ctx: &mut AppContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, ctx) {
                    log::warn!("upload request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &mut AppContext) -> Result<()> {
    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/upload") => handle_upload(&mut stream, &request, ctx),
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        (_, "/upload") | (_, "/health") => {
            write_text_response(&mut stream, 405, "Method not allowed")
        }
        _ => write_text_response(&mut stream, 404, "Not found"),
    }
}

fn handle_upload(
    stream: &mut TcpStream,
    request: &HttpRequest,
    ctx: &mut AppContext,
) -> Result<()> {
    let image_bytes = request
        .headers
        .get("content-type")
        .and_then(|ct| multipart_boundary(ct))
        .and_then(|boundary| extract_multipart_field(&request.body, &boundary, UPLOAD_FIELD));
    let Some(image_bytes) = image_bytes else {
        return write_text_response(stream, 400, "No image sent");
    };

    log::info!("processing uploaded image ({} bytes)", image_bytes.len());
    let (pixels, width, height) = match decode_image(image_bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::warn!("rejecting undecodable upload: {}", err);
            return write_text_response(stream, 400, "Could not decode image");
        }
    };

    let detections = match ctx.detector.detect(&pixels, width, height) {
        Ok(detections) => detections,
        Err(err) => {
            log::error!("detection failed: {}", err);
            return write_text_response(stream, 500, "Detection failed");
        }
    };
    for detection in &detections {
        log::info!("detected {} ({:.2})", detection.label, detection.confidence);
    }

    let status = classify(&detections);
    if status == Status::Tipped {
        ctx.notifier.notify(TIPPED_ALERT);
    }
    ctx.publisher.publish_status(status.as_str());

    write_text_response(stream, 200, &format!("Processed: {}", status))
}

fn decode_image(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode upload")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request header too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .map(|v| v.parse::<usize>())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }

    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before body was complete"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn write_text_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "text/plain", body.as_bytes())
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let kind = parts.next()?.trim();
    if !kind.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("boundary") {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Find the data of the multipart part whose Content-Disposition carries
/// `name="<field>"`. Returns None when the body has no such part.
fn extract_multipart_field<'a>(body: &'a [u8], boundary: &str, field: &str) -> Option<&'a [u8]> {
    let delimiter = format!("--{}", boundary).into_bytes();
    // first segment is the preamble
    for part in split_on(body, &delimiter).into_iter().skip(1) {
        if part.starts_with(b"--") {
            // closing delimiter
            break;
        }
        let part = part.strip_prefix(b"\r\n").unwrap_or(part);
        let part = part.strip_suffix(b"\r\n").unwrap_or(part);
        let Some(header_end) = find_subslice(part, b"\r\n\r\n") else {
            continue;
        };
        let (headers, data) = part.split_at(header_end);
        if part_field_name(headers).as_deref() == Some(field) {
            return Some(&data[4..]);
        }
    }
    None
}

fn part_field_name(headers: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(headers);
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        for param in value.split(';') {
            if let Some((key, val)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("name") {
                    return Some(val.trim().trim_matches('"').to_string());
                }
            }
        }
    }
    None
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(pos) = find_subslice(&haystack[start..], needle) {
        parts.push(&haystack[start..start + pos]);
        start += pos + needle.len();
    }
    parts.push(&haystack[start..]);
    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form_body(boundary: &str, field: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"frame.jpg\"\r\n",
                field
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }

    #[test]
    fn boundary_parsed_from_content_type() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=xyz"),
            Some("xyz".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(multipart_boundary("application/json"), None);
        assert_eq!(multipart_boundary("multipart/form-data"), None);
    }

    #[test]
    fn extracts_named_field() {
        let body = form_body("xyz", "imageFile", b"\xff\xd8jpegdata\xff\xd9");
        let data = extract_multipart_field(&body, "xyz", "imageFile").expect("field");
        assert_eq!(data, b"\xff\xd8jpegdata\xff\xd9");
    }

    #[test]
    fn missing_field_returns_none() {
        let body = form_body("xyz", "otherField", b"data");
        assert!(extract_multipart_field(&body, "xyz", "imageFile").is_none());
    }

    #[test]
    fn second_part_is_found() {
        let boundary = "xyz";
        let mut body = Vec::new();
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"comment\"\r\n\r\n");
        body.extend_from_slice(b"hello\r\n");
        body.extend_from_slice(&form_body(boundary, "imageFile", b"imagebytes"));
        let data = extract_multipart_field(&body, boundary, "imageFile").expect("field");
        assert_eq!(data, b"imagebytes");
    }

    #[test]
    fn find_subslice_positions() {
        assert_eq!(find_subslice(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subslice(b"abcdef", b"xy"), None);
        assert_eq!(find_subslice(b"ab", b"abc"), None);
    }
}
