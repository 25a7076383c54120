//! JSON-RPC 2.0 over stdio with `Content-Length` framing.
//!
//! Frames are HTTP-style: `Content-Length: <n>\r\n\r\n<n bytes of JSON>`.
//! Unknown headers before the blank line are skipped, which keeps the
//! reader compatible with LSP-flavoured writers that add a Content-Type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

//─────────────────────────────
//  Error codes
//─────────────────────────────

/// JSON-RPC 2.0 reserved error codes.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Application-level: permission denied by policy.
    pub const PERMISSION_DENIED: i64 = -32001;
}

/// Errors raised by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the stream.
    #[error("stream closed")]
    Eof,
    /// The frame header was malformed.
    #[error("malformed frame header: {0}")]
    BadHeader(String),
    /// The frame body was not valid JSON.
    #[error("malformed frame body: {0}")]
    BadBody(String),
    /// Underlying I/O failure.
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

//─────────────────────────────
//  Message types
//─────────────────────────────

/// JSON-RPC 2.0 request (or notification when `id` is absent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: String,
    /// Request ID; notifications carry none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name, e.g. `vault.read`.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Request with the given ID, method and params.
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    /// Error code (see [`codes`]).
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: String,
    /// ID of the request being answered.
    pub id: Value,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Successful response.
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    /// Error response.
    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject { code, message: message.into(), data: None }),
        }
    }
}

//─────────────────────────────
//  Framing
//─────────────────────────────

/// Write one framed JSON value.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &Value,
) -> Result<(), FrameError> {
    let body = value.to_string();
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed JSON value.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Value, FrameError> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(FrameError::Eof);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(rest) = trimmed
            .strip_prefix("Content-Length:")
            .or_else(|| trimmed.strip_prefix("content-length:"))
        {
            content_length = Some(
                rest.trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::BadHeader(trimmed.to_string()))?,
            );
        }
        // Other headers (Content-Type, …) are tolerated and ignored.
    }

    let length =
        content_length.ok_or_else(|| FrameError::BadHeader("missing Content-Length".into()))?;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Eof
        } else {
            FrameError::Io(e)
        }
    })?;

    serde_json::from_slice(&body).map_err(|e| FrameError::BadBody(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frame_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let request = serde_json::to_value(RpcRequest::new(1, "vault.read", json!({"entity_id": "task-1"}))).unwrap();
        write_frame(&mut client_write, &request).await.unwrap();

        let mut reader = BufReader::new(server_read);
        let received = read_frame(&mut reader).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn multiple_frames_in_sequence() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _sw) = tokio::io::split(server);
        let (_cr, mut client_write) = tokio::io::split(client);

        for i in 0..3 {
            write_frame(&mut client_write, &json!({"seq": i})).await.unwrap();
        }

        let mut reader = BufReader::new(server_read);
        for i in 0..3 {
            let value = read_frame(&mut reader).await.unwrap();
            assert_eq!(value["seq"], i);
        }
    }

    #[tokio::test]
    async fn extra_headers_are_tolerated() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _sw) = tokio::io::split(server);
        let (_cr, mut client_write) = tokio::io::split(client);

        let body = "{\"ok\":true}";
        let raw = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}",
            body.len(),
            body
        );
        tokio::io::AsyncWriteExt::write_all(&mut client_write, raw.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(server_read);
        assert_eq!(read_frame(&mut reader).await.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn missing_content_length_is_an_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _sw) = tokio::io::split(server);
        let (_cr, mut client_write) = tokio::io::split(client);

        tokio::io::AsyncWriteExt::write_all(&mut client_write, b"X-Other: 1\r\n\r\n{}")
            .await
            .unwrap();
        let mut reader = BufReader::new(server_read);
        assert!(matches!(read_frame(&mut reader).await, Err(FrameError::BadHeader(_))));
    }

    #[tokio::test]
    async fn closed_stream_is_eof() {
        let (client, server) = tokio::io::duplex(64);
        let (server_read, _sw) = tokio::io::split(server);
        drop(client);
        let mut reader = BufReader::new(server_read);
        assert!(matches!(read_frame(&mut reader).await, Err(FrameError::Eof)));
    }

    #[test]
    fn response_constructors() {
        let ok = RpcResponse::success(json!(1), json!({"done": true}));
        assert!(ok.error.is_none());
        let err = RpcResponse::error(json!(1), codes::METHOD_NOT_FOUND, "no such method");
        assert_eq!(err.error.unwrap().code, -32601);
    }
}
