use serde_json::json;
use std::io::{Cursor, Read};
use tiny_http::{Header, Method, Request, Response, StatusCode};
use tracing::{info, warn};

use crate::server::{
    multipart::{extract_boundary, file_part},
    StyleTransfer,
};

/// Name of the form field the front-end uploads under.
const UPLOAD_FIELD: &str = "file";
/// Largest request body read into memory.
pub const MAX_UPLOAD_BYTES: u64 = 16 * 1024 * 1024;

// ////////////////////////////////////////////////////////////////////////////
// Replies

#[derive(Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}
impl Reply {
    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    /// Error body in the `{"detail": ...}` shape the front-end reads.
    fn detail(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "detail": message.into() }))
    }

    fn jpeg(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "image/jpeg",
            body,
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    pub fn into_response(self) -> Response<Cursor<Vec<u8>>> {
        let headers = [
            ("Content-Type", self.content_type),
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
            ("Access-Control-Allow-Headers", "*"),
        ]
        .into_iter()
        .filter_map(|(name, value)| Header::from_bytes(name, value).ok())
        .collect();
        let len = self.body.len();

        Response::new(
            StatusCode(self.status),
            headers,
            Cursor::new(self.body),
            Some(len),
            None,
        )
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Handlers

fn too_large() -> Reply {
    Reply::detail(
        413,
        format!("Upload exceeds {} MiB", MAX_UPLOAD_BYTES / (1024 * 1024)),
    )
}

/// True when the declared `Content-Length` alone rules the request out.
fn declared_too_large(body_length: Option<usize>) -> bool {
    body_length.is_some_and(|length| length as u64 > MAX_UPLOAD_BYTES)
}

fn health() -> Reply {
    Reply::json(
        200,
        json!({ "status": "healthy", "message": "Service is up and running" }),
    )
}

fn transform(content_type: Option<&str>, body: &mut dyn Read, stylizer: &dyn StyleTransfer) -> Reply {
    let Some(boundary) = content_type.and_then(extract_boundary) else {
        return Reply::detail(400, "Expected a multipart/form-data upload");
    };
    let mut bytes = Vec::new();
    if let Err(err) = Read::take(body, MAX_UPLOAD_BYTES + 1).read_to_end(&mut bytes) {
        return Reply::detail(400, format!("Could not read request body: {err}"));
    }
    if bytes.len() as u64 > MAX_UPLOAD_BYTES {
        return too_large();
    }
    let Some(file) = file_part(&bytes, &boundary, UPLOAD_FIELD) else {
        return Reply::detail(400, "No file was uploaded");
    };

    let is_image = file
        .content_type
        .as_deref()
        .is_some_and(|content_type| content_type.starts_with("image/"));
    if !is_image {
        return Reply::detail(400, "File provided is not an image");
    }

    match stylizer.transfer(file.data) {
        Ok(jpeg) => Reply::jpeg(jpeg),
        Err(err) => {
            warn!("Transform of {:?} failed: {err}", file.filename);
            Reply::detail(500, format!("Error processing image: {err}"))
        }
    }
}

/// Routes one request. `body` is only read by handlers that need it.
pub fn route(
    method: &Method,
    url: &str,
    content_type: Option<&str>,
    body: &mut dyn Read,
    stylizer: &dyn StyleTransfer,
) -> Reply {
    let path = url.split_once('?').map_or(url, |(path, _)| path);

    match (method, path) {
        (Method::Post, "/transform/" | "/transform") => transform(content_type, body, stylizer),
        (Method::Get, "/health") => health(),
        (Method::Options, _) => Reply::empty(204),
        _ => Reply::detail(404, "Not Found"),
    }
}

/// Answers `request` on the calling thread.
pub fn dispatch(mut request: Request, stylizer: &dyn StyleTransfer) {
    let method = request.method().clone();
    let url = request.url().to_owned();
    let content_type = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Content-Type"))
        .map(|h| h.value.as_str().to_owned());

    let reply = if declared_too_large(request.body_length()) {
        too_large()
    } else {
        route(
            &method,
            &url,
            content_type.as_deref(),
            request.as_reader(),
            stylizer,
        )
    };
    info!("{method} {url} -> {}", reply.status);

    if let Err(err) = request.respond(reply.into_response()) {
        warn!("Failed to send response for {method} {url}: {err}");
    }
}
