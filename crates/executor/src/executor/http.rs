//! Executor over the server's HTTP interface.

use async_trait::async_trait;
use grntest_core::{Command, InputType, Interface};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, StatusCode, Url};

use super::driver::needs_output_type_argument;
use super::Executor;
use crate::context::ExecutionContext;
use crate::error::{ExecutorError, TransportError};

/// Longest URI a load is sent in before switching to a POST body.
pub const MAX_URI_SIZE: usize = 4096;

/// Size of each piece of a chunked request body.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub const ARROW_STREAMING_CONTENT_TYPE: &str = "application/x-apache-arrow-streaming";

/// Statuses the server uses for request-level errors. Their bodies are
/// ordinary responses.
const RESPONSE_STATUSES: [StatusCode; 4] = [
    StatusCode::BAD_REQUEST,
    StatusCode::NOT_FOUND,
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::INTERNAL_SERVER_ERROR,
];

#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    base_url: Url,
}

impl HttpExecutor {
    pub fn new(host: &str, port: u16) -> Result<Self, ExecutorError> {
        let base_url = Url::parse(&format!("http://{host}:{port}/"))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let client = Client::builder()
            .build()
            .map_err(TransportError::Http)?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path_and_query: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path_and_query)
            .map_err(|e| TransportError::InvalidRequest(format!("{path_and_query}: {e}")))
    }

    async fn read_response(response: reqwest::Response) -> Result<Vec<u8>, TransportError> {
        let status = response.status();
        if status.is_success() || RESPONSE_STATUSES.contains(&status) {
            return Ok(response.bytes().await?.to_vec());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_plain(&self, command: &Command, ctx: &ExecutionContext) -> Result<Vec<u8>, TransportError> {
        let command = with_output_type(command, ctx);
        let request = if ctx.use_http_post {
            let pairs = command.named_arguments().map_err(invalid)?;
            self.client
                .post(self.url(&format!("/d/{}", command.name()))?)
                .form(&pairs)
        } else {
            let uri = command.to_uri_format().map_err(invalid)?;
            self.client.get(self.url(&uri)?)
        };
        Self::read_response(request.send().await?).await
    }

    async fn send_load(&self, command: &Command, ctx: &ExecutionContext) -> Result<Vec<u8>, TransportError> {
        let mut command = with_output_type(command, ctx);
        let values = match command.remove_argument("values") {
            Some(values) => values.into_bytes(),
            None => command.body_lines().to_vec(),
        };

        // Bodies that are not UTF-8 can only travel as a POST body.
        if let (InputType::Json, Ok(text)) = (ctx.input_type, std::str::from_utf8(&values)) {
            let mut inline = command.clone();
            inline.set_argument("values", text.trim());
            let uri = inline.to_uri_format().map_err(invalid)?;
            if uri.len() <= MAX_URI_SIZE {
                return Self::read_response(self.client.get(self.url(&uri)?).send().await?).await;
            }
        }

        let (content_type, payload) = match ctx.input_type {
            InputType::Json => ("application/json", values),
            InputType::ApacheArrow => {
                command.set_argument("input_type", "apache-arrow");
                let text = String::from_utf8_lossy(&values);
                (ARROW_STREAMING_CONTENT_TYPE, arrow_payload(&text)?)
            }
        };
        let uri = command.to_uri_format().map_err(invalid)?;
        let body = if ctx.use_http_chunked {
            chunked_body(payload)
        } else {
            Body::from(payload)
        };
        let request = self
            .client
            .post(self.url(&uri)?)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        Self::read_response(request.send().await?).await
    }
}

fn invalid(error: grntest_core::CommandParseError) -> TransportError {
    TransportError::InvalidRequest(error.to_string())
}

fn with_output_type(command: &Command, ctx: &ExecutionContext) -> Command {
    let mut command = command.clone();
    if needs_output_type_argument(&command, ctx) {
        command.set_argument("output_type", ctx.output_type.as_str());
    }
    command
}

fn chunked_body(payload: Vec<u8>) -> Body {
    let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
        payload.chunks(CHUNK_SIZE).map(|chunk| Ok(chunk.to_vec())).collect();
    Body::wrap_stream(futures::stream::iter(chunks))
}

#[cfg(feature = "apache-arrow")]
fn arrow_payload(values: &str) -> Result<Vec<u8>, TransportError> {
    crate::arrow::json_values_to_ipc_stream(values)
        .map_err(|e| TransportError::InvalidRequest(format!("apache-arrow: {e}")))
}

#[cfg(not(feature = "apache-arrow"))]
fn arrow_payload(_values: &str) -> Result<Vec<u8>, TransportError> {
    Err(TransportError::InvalidRequest(
        "apache-arrow input requires the apache-arrow feature".to_string(),
    ))
}

#[async_trait]
impl Executor for HttpExecutor {
    fn interface(&self) -> Interface {
        Interface::Http
    }

    async fn send_command(
        &mut self,
        command: &Command,
        ctx: &ExecutionContext,
    ) -> Result<Vec<u8>, ExecutorError> {
        let body = if command.is_load() {
            self.send_load(command, ctx).await?
        } else {
            self.send_plain(command, ctx).await?
        };
        Ok(body)
    }

    fn create_sub_executor(&self) -> Box<dyn Executor> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
