use crate::errors::{MoodleError, Result};
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use tracing::instrument;
use url::Url;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    /// Fails with [`MoodleError::ErrorStatusCode`] unless the status is 2xx.
    pub fn require_success(self, url: &Url) -> Result<Self> {
        if !self.status.is_success() {
            tracing::error!("Error status code received : {} |{}|", self.status, url);
            return Err(MoodleError::ErrorStatusCode {
                status_code: self.status.to_string(),
                url: url.to_string(),
            });
        }
        Ok(self)
    }

    /// The `Location` header of a redirect, resolved against the requested url.
    pub fn redirect_location(&self, url: &Url) -> Option<Url> {
        if !self.status.is_redirection() {
            return None;
        }
        let location = self.headers.get(LOCATION)?.to_str().ok()?;
        url.join(location).ok()
    }
}

/// The network side of a portal session. Implementations keep cookies between
/// calls and hand redirects back to the caller instead of following them.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn get(&self, url: &Url) -> Result<HttpResponse>;
    async fn post(&self, url: &Url, form: &[(&str, &str)]) -> Result<HttpResponse>;
    async fn head(&self, url: &Url) -> Result<HeaderMap>;
}

/// [`Transport`] backed by a reqwest client with a cookie store.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
}

impl HttpSession {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .redirect(Policy::none())
            .build()
            .map_err(|e| MoodleError::NetworkError(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

async fn into_response(response: reqwest::Response) -> Result<HttpResponse> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await?;
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

impl Transport for HttpSession {
    #[instrument(skip(self))]
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            tracing::error!("Error fetching {}\n{}", url, e);
            MoodleError::NetworkError(e.to_string())
        })?;
        into_response(response).await
    }

    #[instrument(skip(self, form))]
    async fn post(&self, url: &Url, form: &[(&str, &str)]) -> Result<HttpResponse> {
        let response = self
            .client
            .post(url.clone())
            .form(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Error posting to {}\n{}", url, e);
                MoodleError::NetworkError(e.to_string())
            })?;
        into_response(response).await
    }

    #[instrument(skip(self))]
    async fn head(&self, url: &Url) -> Result<HeaderMap> {
        let response = self.client.head(url.clone()).send().await.map_err(|e| {
            tracing::error!("Error fetching headers for {}\n{}", url, e);
            MoodleError::NetworkError(e.to_string())
        })?;
        Ok(response.headers().clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

/// Auth state and cached entry points of one portal login. Only
/// [`Session::begin_login`] and [`Session::finish_login`] move the state.
#[derive(Debug)]
pub struct Session<T> {
    pub(crate) transport: T,
    state: AuthState,
    /// Where the portal root redirects before logging in
    pub(crate) login_url: Option<Url>,
    /// Where the portal root redirects once logged in
    pub(crate) home_url: Option<Url>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: AuthState::Unauthenticated,
            login_url: None,
            home_url: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Checked before any course, folder or file request.
    pub fn require_auth(&self) -> Result<&T> {
        if !self.is_authenticated() {
            tracing::error!("Do login first!");
            return Err(MoodleError::NotAuthenticated);
        }
        Ok(&self.transport)
    }

    pub(crate) fn begin_login(&mut self) -> Result<()> {
        if self.state == AuthState::Authenticated {
            tracing::error!("Already logged in!");
            return Err(MoodleError::AlreadyAuthenticated);
        }
        self.state = AuthState::Authenticating;
        Ok(())
    }

    pub(crate) fn finish_login(&mut self, succeeded: bool) {
        self.state = if succeeded {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
    }

    /// Requests `url` without following redirects and returns where it points to,
    /// or `url` itself when the response isn't a redirect.
    pub async fn redirect_location(&self, url: &Url) -> Result<Url> {
        let response = self.transport.get(url).await?;
        Ok(response
            .redirect_location(url)
            .unwrap_or_else(|| url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn response(status: u16, location: Option<&str>) -> HttpResponse {
        let mut headers = HeaderMap::new();
        if let Some(location) = location {
            headers.insert(LOCATION, HeaderValue::from_str(location).unwrap());
        }
        HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            body: String::new(),
        }
    }

    #[test]
    fn test_redirect_location_is_resolved() {
        let url = Url::parse("https://moodle.example.edu/").unwrap();
        let location = response(303, Some("/login/index.php"))
            .redirect_location(&url)
            .unwrap();
        assert_eq!(location.as_str(), "https://moodle.example.edu/login/index.php");
    }

    #[test]
    fn test_no_redirect_without_3xx_or_location() {
        let url = Url::parse("https://moodle.example.edu/").unwrap();
        assert!(response(200, Some("/elsewhere")).redirect_location(&url).is_none());
        assert!(response(302, None).redirect_location(&url).is_none());
    }

    #[test]
    fn test_require_success() {
        let url = Url::parse("https://moodle.example.edu/my/").unwrap();
        assert!(response(200, None).require_success(&url).is_ok());
        assert_eq!(
            response(404, None).require_success(&url).unwrap_err(),
            MoodleError::ErrorStatusCode {
                status_code: "404 Not Found".into(),
                url: "https://moodle.example.edu/my/".into(),
            }
        );
    }
}
