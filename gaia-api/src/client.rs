use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use reconcilor_client::HttpTransport;
use reconcilor_client::Request;
use reconcilor_client::Response;
use reconcilor_protocol::AccountId;
use reconcilor_protocol::ConnectionCheckTarget;
use reconcilor_protocol::GaiaError;
use reconcilor_protocol::ListedAccount;
use tracing::debug;

use crate::error::map_transport_error;
use crate::parse::parse_check_connection_info;
use crate::parse::parse_list_accounts;
use crate::parse::truncate_probe_result;
use crate::urls::GaiaUrls;

/// Network operations against the remote identity service.
///
/// Every error is already classified as transient or persistent; callers
/// never see raw transport failures.
#[async_trait]
pub trait GaiaClient: Send + Sync {
    /// Phase 1: trades the account's long-lived credential for a short-lived
    /// session assertion ("ubertoken").
    async fn exchange_for_session_token(
        &self,
        account_id: &AccountId,
        credential: &str,
    ) -> Result<String, GaiaError>;

    /// Phase 2 of an add: merges the account behind `ubertoken` into the
    /// session cookie jar.
    async fn merge_session(
        &self,
        account_id: &AccountId,
        ubertoken: &str,
        external_cc_result: &str,
    ) -> Result<(), GaiaError>;

    async fn list_accounts(&self) -> Result<Vec<ListedAccount>, GaiaError>;

    /// Invalidates the whole remote session.
    async fn log_out(&self) -> Result<(), GaiaError>;

    async fn get_check_connection_info(&self) -> Result<Vec<ConnectionCheckTarget>, GaiaError>;

    /// Fetches one connectivity-check url. The returned body is already
    /// truncated for use in the merge header.
    async fn probe(&self, url: &str) -> Result<String, GaiaError>;
}

pub struct HttpGaiaClient<T: HttpTransport> {
    transport: T,
    urls: GaiaUrls,
    request_timeout: Option<Duration>,
}

impl<T: HttpTransport> HttpGaiaClient<T> {
    pub fn new(transport: T, urls: GaiaUrls) -> Self {
        Self {
            transport,
            urls,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn urls(&self) -> &GaiaUrls {
        &self.urls
    }

    fn request(&self, method: Method, url: String) -> Request {
        Request::new(method, url).with_timeout(self.request_timeout)
    }

    async fn send(&self, req: Request) -> Result<Response, GaiaError> {
        self.transport.execute(req).await.map_err(map_transport_error)
    }
}

#[async_trait]
impl<T: HttpTransport> GaiaClient for HttpGaiaClient<T> {
    async fn exchange_for_session_token(
        &self,
        account_id: &AccountId,
        credential: &str,
    ) -> Result<String, GaiaError> {
        let mut req = self.request(Method::GET, self.urls.oauth_login());
        let value = http::HeaderValue::try_from(format!("Bearer {credential}"))
            .map_err(|_| GaiaError::InvalidCredentials("malformed credential".to_string()))?;
        req.headers.insert(http::header::AUTHORIZATION, value);

        let resp = self.send(req).await?;
        let token = resp.text().trim().to_string();
        if token.is_empty() {
            return Err(GaiaError::UnexpectedServiceResponse("empty ubertoken".to_string()));
        }
        debug!(%account_id, "obtained ubertoken");
        Ok(token)
    }

    async fn merge_session(
        &self,
        account_id: &AccountId,
        ubertoken: &str,
        external_cc_result: &str,
    ) -> Result<(), GaiaError> {
        let url = self.urls.merge_session(ubertoken, external_cc_result);
        self.send(self.request(Method::GET, url)).await?;
        debug!(%account_id, "merged session");
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<ListedAccount>, GaiaError> {
        let req = self
            .request(Method::POST, self.urls.list_accounts())
            .with_form([("json", "standard")]);
        let resp = self.send(req).await?;
        parse_list_accounts(&resp.text())
    }

    async fn log_out(&self) -> Result<(), GaiaError> {
        self.send(self.request(Method::GET, self.urls.log_out())).await?;
        Ok(())
    }

    async fn get_check_connection_info(&self) -> Result<Vec<ConnectionCheckTarget>, GaiaError> {
        let resp = self
            .send(self.request(Method::GET, self.urls.check_connection_info()))
            .await?;
        parse_check_connection_info(&resp.text())
    }

    async fn probe(&self, url: &str) -> Result<String, GaiaError> {
        // Bounded by the fetcher's aggregate timer rather than a per-request one.
        let resp = self
            .transport
            .execute(Request::new(Method::GET, url.to_string()))
            .await
            .map_err(map_transport_error)?;
        Ok(truncate_probe_result(&resp.text()))
    }
}
