use url::Url;

pub const DEFAULT_SOURCE: &str = "ChromiumBrowser";

/// Where a merged session lands once the remote service has set its cookies.
const CONTINUE_URL: &str = "https://www.google.com/";

/// Endpoint layout of the remote identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaiaUrls {
    base: Url,
    source: String,
}

impl GaiaUrls {
    pub fn new(base_url: &str, source: impl Into<String>) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            source: source.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Host whose cookie settings gate every session mutation.
    pub fn cookie_domain(&self) -> Option<&str> {
        self.base.host_str()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn oauth_login(&self) -> String {
        self.endpoint("OAuthLogin", &[("issueuberauth", "1")])
    }

    pub fn merge_session(&self, ubertoken: &str, external_cc_result: &str) -> String {
        self.endpoint(
            "MergeSession",
            &[
                ("uberauth", ubertoken),
                ("continue", CONTINUE_URL),
                ("externalCcResult", external_cc_result),
            ],
        )
    }

    pub fn list_accounts(&self) -> String {
        self.endpoint("ListAccounts", &[])
    }

    pub fn log_out(&self) -> String {
        self.endpoint("Logout", &[])
    }

    pub fn check_connection_info(&self) -> String {
        self.endpoint("GetCheckConnectionInfo", &[])
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> String {
        let mut url = self.base.clone();
        let joined = format!("{}{path}", self.base.path());
        url.set_path(&joined);
        url.set_query(None);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("source", &self.source);
        }
        url.into()
    }
}
