//! Request routing onto the forwarding manager

use serde::Deserialize;
use tracing::debug;

use super::http::{Request, Response};
use crate::forwarding::{ForwardingManager, MappingError};

/// Body of `POST /mappings`
#[derive(Debug, Deserialize)]
pub struct CreateMappingRequest {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

fn error_response(e: &MappingError) -> Response {
    Response::detail(e.status_code(), &e.to_string())
}

fn method_not_allowed(allowed: &str) -> Response {
    Response::detail(405, &format!("Method not allowed, expected {}", allowed))
}

fn parse_port(raw: &str) -> Result<u16, Response> {
    raw.parse::<u16>()
        .map_err(|_| Response::detail(400, &format!("Invalid port: {}", raw)))
}

/// Dispatch one request
pub async fn handle_request(manager: &ForwardingManager, request: &Request) -> Response {
    // Handle CORS preflight
    if request.method == "OPTIONS" {
        return Response::no_content();
    }

    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => Response::json(200, &serde_json::json!({ "status": "ok" })),
        (_, ["health"]) => method_not_allowed("GET"),

        ("POST", ["mappings"]) => create_mapping(manager, &request.body).await,
        ("GET", ["mappings"]) => Response::serialized(200, &manager.list_mappings().await),
        (_, ["mappings"]) => method_not_allowed("GET or POST"),

        ("DELETE", ["mappings", port]) => match parse_port(port) {
            Ok(port) => match manager.stop_mapping(port).await {
                Ok(_) => Response::success(),
                Err(e) => error_response(&e),
            },
            Err(resp) => resp,
        },
        (_, ["mappings", _]) => method_not_allowed("DELETE"),

        ("GET", ["mappings", port, "status"]) => match parse_port(port) {
            Ok(port) => match manager.get_status(port).await {
                Ok(view) => Response::serialized(200, &view),
                Err(e) => error_response(&e),
            },
            Err(resp) => resp,
        },
        (_, ["mappings", _, "status"]) => method_not_allowed("GET"),

        _ => Response::detail(404, "Not Found"),
    }
}

async fn create_mapping(manager: &ForwardingManager, body: &[u8]) -> Response {
    let request: CreateMappingRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            debug!("Rejected mapping request body: {}", e);
            return Response::detail(400, &format!("Invalid request body: {}", e));
        }
    };

    match manager
        .create_mapping(request.local_port, &request.remote_host, request.remote_port)
        .await
    {
        Ok(_) => Response::success(),
        Err(e) => error_response(&e),
    }
}
