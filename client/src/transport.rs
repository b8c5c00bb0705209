use crate::default_client::GaiaHttpClient;
use crate::default_client::GaiaRequestBuilder;
use crate::error::TransportError;
use crate::request::Request;
use crate::request::Response;
use async_trait::async_trait;
use tracing::Level;
use tracing::enabled;
use tracing::trace;

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, req: Request) -> Result<Response, TransportError>;
}

#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: GaiaHttpClient,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client: GaiaHttpClient::new(client),
        }
    }

    fn build(&self, req: Request) -> GaiaRequestBuilder {
        let Request {
            method,
            url,
            headers,
            form,
            timeout,
        } = req;

        let mut builder = self.client.request(method, &url);

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder = builder.headers(headers);
        if let Some(form) = form {
            builder = builder.form(&form);
        }
        builder
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::Build(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, req: Request) -> Result<Response, TransportError> {
        if enabled!(Level::TRACE) {
            trace!("{} to {}: {:?}", req.method, req.url, req.form);
        }

        let url = req.url.clone();
        let builder = self.build(req);
        let resp = builder.send().await.map_err(Self::map_error)?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await.map_err(Self::map_error)?;
        if !status.is_success() {
            let body = String::from_utf8(bytes.to_vec()).ok();
            return Err(TransportError::Http {
                status,
                url: Some(url),
                headers: Some(headers),
                body,
            });
        }
        if enabled!(Level::TRACE) {
            trace!("response from {url}: {}", String::from_utf8_lossy(&bytes));
        }
        Ok(Response {
            status,
            headers,
            body: bytes,
        })
    }
}
