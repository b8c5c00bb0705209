use reqwest::IntoUrl;
use reqwest::Method;
use reqwest::Response;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::TransportError;

const USER_AGENT: &str = concat!("reconcilor/", env!("CARGO_PKG_VERSION"));

/// Builds the shared reqwest client used for every remote identity call.
///
/// The client keeps its own cookie store so that session mutations made by
/// one call are visible to the next one.
pub fn build_reqwest_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .cookie_store(true)
        .build()
        .map_err(|err| TransportError::Build(err.to_string()))
}

#[derive(Clone, Debug)]
pub struct GaiaHttpClient {
    inner: reqwest::Client,
}

impl GaiaHttpClient {
    pub fn new(inner: reqwest::Client) -> Self {
        Self { inner }
    }

    pub fn request<U>(&self, method: Method, url: U) -> GaiaRequestBuilder
    where
        U: IntoUrl,
    {
        let url_str = url.as_str().to_string();
        GaiaRequestBuilder::new(self.inner.request(method.clone(), url), method, url_str)
    }
}

#[must_use = "requests are not sent unless `send` is awaited"]
#[derive(Debug)]
pub struct GaiaRequestBuilder {
    builder: reqwest::RequestBuilder,
    method: Method,
    url: String,
}

impl GaiaRequestBuilder {
    fn new(builder: reqwest::RequestBuilder, method: Method, url: String) -> Self {
        Self {
            builder,
            method,
            url,
        }
    }

    fn map(self, f: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder) -> Self {
        Self {
            builder: f(self.builder),
            method: self.method,
            url: self.url,
        }
    }

    pub fn headers(self, headers: HeaderMap) -> Self {
        self.map(|builder| builder.headers(headers))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|builder| builder.timeout(timeout))
    }

    pub fn form(self, fields: &[(String, String)]) -> Self {
        self.map(|builder| builder.form(fields))
    }

    /// Sends the request, logging its outcome at `debug` level together with
    /// any request ids the identity service echoed back.
    pub async fn send(self) -> Result<Response, reqwest::Error> {
        let Self {
            builder,
            method,
            url,
        } = self;
        builder
            .send()
            .await
            .inspect(|response| {
                tracing::debug!(
                    %method,
                    %url,
                    status = %response.status(),
                    request_ids = ?Self::extract_request_ids(response),
                    "gaia request completed"
                );
            })
            .inspect_err(|error| {
                tracing::debug!(
                    %method,
                    %url,
                    status = error.status().map(|status| status.as_u16()),
                    %error,
                    timed_out = error.is_timeout(),
                    "gaia request failed"
                );
            })
    }

    fn extract_request_ids(response: &Response) -> HashMap<String, String> {
        ["x-request-id", "x-goog-request-id", "x-guploader-uploadid"]
            .iter()
            .filter_map(|&name| {
                let header_name = HeaderName::from_static(name);
                let value = response.headers().get(header_name)?;
                let value = value.to_str().ok()?.to_owned();
                Some((name.to_owned(), value))
            })
            .collect()
    }
}
