//! The store's HTTP surface.
//!
//! `GET /db/<key>?type=string|int64` reads a key, `POST /db/<key>` with a
//! `{"value": ...}` JSON body writes one. JSON numbers are stored as
//! int64 (truncating); strings are stored as strings.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{KvError, Result};
use crate::http::{self, Request, Response};
use crate::store::Store;
use crate::thread_pool::ThreadPool;

/// An HTTP server over a [`Store`].
///
/// Listens for connections on a socket address and processes each one on
/// a thread from the pool; every handler thread gets its own clone of the
/// store handle.
pub struct DbServer<P: ThreadPool> {
    /// the storage engine behind the HTTP surface
    store: Store,
    /// a pool of threads that serve connections against the store
    pool: P,
}

impl<P: ThreadPool> DbServer<P> {
    /// Creates a server over the given store and pool.
    pub fn new(store: Store, pool: P) -> Self {
        DbServer { store, pool }
    }

    /// Binds `addr` and serves connections until the process exits.
    ///
    /// # Errors
    /// Returns [`KvError::Io`] if the listener cannot be bound.
    pub fn run<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.serve_on(listener)
    }

    /// Serves connections from an already-bound listener.
    pub fn serve_on(self, listener: TcpListener) -> Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let store = self.store.clone();
                    self.pool.spawn(move || {
                        if let Err(e) = serve(store, stream) {
                            error!("Error on serving client: {}", e);
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }
        Ok(())
    }
}

/// JSON shape of every store response; empty fields are omitted.
#[derive(Debug, Serialize, Deserialize)]
struct DbResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DbResponse {
    fn value(key: &str, value: serde_json::Value) -> DbResponse {
        DbResponse {
            key: Some(key.to_string()),
            value: Some(value),
            error: None,
        }
    }

    fn error(key: Option<&str>, message: String) -> DbResponse {
        DbResponse {
            key: key.map(String::from),
            value: None,
            error: Some(message),
        }
    }
}

/// JSON body of a `POST /db/<key>` request.
#[derive(Debug, Deserialize)]
struct PutBody {
    value: serde_json::Value,
}

/// Reads the single request of a connection, dispatches it against the
/// store and writes the response back.
fn serve(store: Store, tcp: TcpStream) -> Result<()> {
    let peer_addr = tcp.peer_addr()?;
    let mut reader = BufReader::new(tcp.try_clone()?);
    let mut writer = BufWriter::new(&tcp);

    let request = match http::read_request(&mut reader)? {
        Some(request) => request,
        None => return Ok(()),
    };
    debug!(
        peer = %peer_addr,
        method = %request.method,
        path = %request.path,
        "request received"
    );

    let response = handle(&store, &request);
    http::write_response(&mut writer, &response)
}

/// Routes one request against the store.
fn handle(store: &Store, request: &Request) -> Response {
    let key = match request.path.strip_prefix("/db/") {
        Some(key) => key,
        None => return Response::text(404, "404 page not found"),
    };

    match request.method.as_str() {
        "GET" => {
            if key.is_empty() {
                return Response::text(400, "Key is missing in URL path for GET request");
            }
            handle_get(store, key, request)
        }
        "POST" => {
            if key.is_empty() {
                return Response::text(400, "Key is missing in URL path for POST request");
            }
            handle_post(store, key, request)
        }
        _ => json_response(
            405,
            &DbResponse::error(None, "Method not allowed".to_string()),
        ),
    }
}

fn handle_get(store: &Store, key: &str, request: &Request) -> Response {
    let data_type = request
        .query_param("type")
        .unwrap_or_else(|| "string".to_string());

    let result = match data_type.as_str() {
        "string" => store.get(key).map(serde_json::Value::from),
        "int64" => store.get_int64(key).map(serde_json::Value::from),
        _ => {
            return json_response(
                400,
                &DbResponse::error(
                    Some(key),
                    "Invalid type parameter. Supported types: string, int64".to_string(),
                ),
            )
        }
    };

    match result {
        Ok(value) => json_response(200, &DbResponse::value(key, value)),
        Err(KvError::NotFound) => {
            json_response(404, &DbResponse::error(Some(key), "not found".to_string()))
        }
        Err(e @ KvError::WrongType) => {
            json_response(400, &DbResponse::error(Some(key), e.to_string()))
        }
        Err(e) => json_response(500, &DbResponse::error(Some(key), e.to_string())),
    }
}

fn handle_post(store: &Store, key: &str, request: &Request) -> Response {
    let body: PutBody = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(e) => {
            return json_response(
                400,
                &DbResponse::error(Some(key), format!("Failed to decode request body: {}", e)),
            )
        }
    };

    let put_result = match &body.value {
        serde_json::Value::String(s) => store.put(key, s),
        serde_json::Value::Number(n) => {
            // JSON numbers become int64; fractional values truncate
            let v = match n.as_i64() {
                Some(v) => v,
                None => n.as_f64().unwrap_or(0.0) as i64,
            };
            store.put_int64(key, v)
        }
        other => {
            return json_response(
                400,
                &DbResponse::error(
                    Some(key),
                    format!(
                        "Invalid value type in request body: {}. Supported: string, number (for int64)",
                        json_type_name(other)
                    ),
                ),
            )
        }
    };

    match put_result {
        Ok(()) => json_response(201, &DbResponse::value(key, body.value)),
        Err(e) => json_response(500, &DbResponse::error(Some(key), e.to_string())),
    }
}

fn json_response(status: u16, body: &DbResponse) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::json(status, bytes),
        Err(e) => {
            error!("failed to encode response body: {}", e);
            Response::text(500, "internal encoding error")
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
