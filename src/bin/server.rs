//! HTTP server for the NL->SQL pipeline.
//! Simple HTTP server using tokio and basic HTTP handling; `POST /api/query`
//! streams the run's events as chunked newline-delimited JSON.

use nl2sql_engine::config::{RunConfig, DEFAULT_BASE_URL, DEFAULT_CATALOG, DEFAULT_MODEL};
use nl2sql_engine::db::Database;
use nl2sql_engine::events::EventEmitter;
use nl2sql_engine::llm::LlmClient;
use nl2sql_engine::observability::{QueryLogEntry, RunLogger};
use nl2sql_engine::pipeline::Pipeline;
use nl2sql_engine::schema::SchemaDescriptor;
use nl2sql_engine::stages::LlmAgents;

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    question: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Clone)]
struct ServerState {
    db: Database,
    logger: RunLogger,
    catalog: String,
    base_url: String,
    default_model: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let db_path = PathBuf::from(
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| "data/database.db".to_string()),
    );
    let catalog = std::env::var("CATALOG").unwrap_or_else(|_| DEFAULT_CATALOG.to_string());
    let base_url = std::env::var("LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    let default_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let log_file = std::env::var("QUERY_LOG_FILE").ok().map(PathBuf::from);

    if std::env::var("OPENAI_API_KEY").is_ok() {
        info!("OpenAI API key found in environment");
    } else {
        warn!("OPENAI_API_KEY not set; requests must carry their own api_key");
    }

    let state = ServerState {
        db: Database::open(&db_path, &catalog)?,
        logger: RunLogger::new(log_file, 1000),
        catalog,
        base_url,
        default_model,
    };

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server listening on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from {}", addr);
        let state = state.clone();
        tokio::spawn(handle_connection(stream, state));
    }
}

async fn handle_connection(mut stream: TcpStream, state: ServerState) {
    use tokio::time::{timeout, Duration};

    // Read the request with a timeout so a stalled client cannot hang the task.
    let mut buffer = Vec::new();
    let mut temp_buf = [0; 8192];

    let read_result = timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut temp_buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&temp_buf[..n]);
                    if let Ok(s) = std::str::from_utf8(&buffer) {
                        if let Some(headers_end) = s.find("\r\n\r\n") {
                            match extract_content_length(s) {
                                Some(content_length) => {
                                    if buffer.len() >= headers_end + 4 + content_length {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    if buffer.len() > 1_000_000 {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stream: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    })
    .await;

    if read_result.is_err() || buffer.is_empty() {
        return;
    }

    let request = match String::from_utf8(buffer) {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to parse request as UTF-8: {}", e);
            return;
        }
    };

    let (method, path) = parse_request_line(&request);
    info!("Request: {} {}", method, path);

    match (method.as_str(), path.as_str()) {
        ("POST", "/api/query") => {
            let body = request_body(&request);
            stream_query(&mut stream, body, &state).await;
        }
        _ => {
            let response = handle_request(&method, &path, &state).await;
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                error!("Failed to write response: {}", e);
            }
        }
    }
}

fn parse_request_line(request: &str) -> (String, String) {
    let request_line = request.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let full_path = parts.next().unwrap_or_default();
    // Drop any query string and trailing slash.
    let path = full_path.split('?').next().unwrap_or_default();
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    (method, path.to_string())
}

fn extract_content_length(request: &str) -> Option<usize> {
    for line in request.lines() {
        if line.to_lowercase().starts_with("content-length:") {
            if let Some(value) = line.split(':').nth(1) {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

fn request_body(request: &str) -> &str {
    match request.find("\r\n\r\n") {
        Some(idx) => request[idx + 4..].trim(),
        None => "",
    }
}

async fn handle_request(method: &str, path: &str, state: &ServerState) -> String {
    match (method, path) {
        ("GET", "/api/health") => create_response(
            200,
            "OK",
            r#"{"status":"ok","service":"nl2sql-engine"}"#,
        ),
        ("GET", "/api/schema") => match SchemaDescriptor::snapshot(&state.db) {
            Ok(schema) => match serde_json::to_string(&schema) {
                Ok(json) => create_response(200, "OK", &json),
                Err(e) => create_response(
                    500,
                    "Internal Server Error",
                    &error_body(&e.to_string()),
                ),
            },
            Err(e) => create_response(500, "Internal Server Error", &error_body(&e.to_string())),
        },
        ("GET", "/api/queries/recent") => {
            let recent = state.logger.recent(50);
            match serde_json::to_string(&serde_json::json!({ "queries": recent })) {
                Ok(json) => create_response(200, "OK", &json),
                Err(e) => create_response(
                    500,
                    "Internal Server Error",
                    &error_body(&e.to_string()),
                ),
            }
        }
        ("POST", _) | ("GET", _) => create_response(404, "Not Found", r#"{"error":"Not found"}"#),
        _ => create_response(405, "Method Not Allowed", r#"{"error":"Method not allowed"}"#),
    }
}

/// Run the pipeline for one request, forwarding each event envelope as a
/// chunk of newline-delimited JSON. A departed client stops the forwarding;
/// the run itself finishes in the background and its remaining events are
/// discarded.
async fn stream_query(stream: &mut TcpStream, body: &str, state: &ServerState) {
    let request: QueryRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => {
            let response =
                create_response(400, "Bad Request", &error_body(&format!("Invalid JSON: {}", e)));
            let _ = stream.write_all(response.as_bytes()).await;
            return;
        }
    };

    let api_key = request
        .api_key
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_default();
    let model = request
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.default_model.clone());
    let question = request.question;

    let config = RunConfig::new(api_key.clone(), model.clone())
        .with_base_url(state.base_url.clone())
        .with_catalog(state.catalog.clone());
    let llm = LlmClient::new(api_key, model, state.base_url.clone());
    let agents = Arc::new(LlmAgents::new(llm, state.catalog.clone()));
    let (emitter, mut rx) = EventEmitter::new();
    let pipeline = Pipeline::new(agents, state.db.clone(), emitter, config);

    let logger = state.logger.clone();
    let run_question = question.clone();
    tokio::spawn(async move {
        let outcome = pipeline.run(&run_question).await;
        if let Err(e) = logger.log(QueryLogEntry::from_outcome(&run_question, &outcome)) {
            warn!("Failed to log run: {}", e);
        }
    });

    let headers = "HTTP/1.1 200 OK\r\n\
                   Content-Type: application/x-ndjson\r\n\
                   Transfer-Encoding: chunked\r\n\
                   Access-Control-Allow-Origin: *\r\n\
                   Cache-Control: no-cache\r\n\
                   Connection: close\r\n\r\n";
    if stream.write_all(headers.as_bytes()).await.is_err() {
        return;
    }

    while let Some(event) = rx.recv().await {
        let line = format!("{}\n", event.to_json_line());
        let chunk = format!("{:X}\r\n{}\r\n", line.len(), line);
        if stream.write_all(chunk.as_bytes()).await.is_err() {
            // Client went away: stop forwarding. Dropping the receiver turns
            // every later emit into a no-op while the run finishes.
            warn!("Client disconnected mid-stream");
            return;
        }
        let _ = stream.flush().await;
    }

    let _ = stream.write_all(b"0\r\n\r\n").await;
    let _ = stream.flush().await;
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body
    )
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
