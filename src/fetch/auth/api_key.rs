use crate::fetch::client::HttpClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects a credential as an HTTP header.
///
/// Socrata reads app tokens from `X-App-Token`; private feeds such as the
/// vacancy registry take their credential the same way. The header is
/// validated once at construction so requests never fail on a bad value.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    value: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())
            .with_context(|| format!("invalid credential header name '{header_name}'"))?;
        let mut value =
            HeaderValue::from_str(key.trim()).context("credential is not a valid header value")?;
        value.set_sensitive(true);
        Ok(Self {
            inner,
            header_name,
            value,
        })
    }

    /// Socrata app token (`X-App-Token: <key>`).
    pub fn app_token(inner: C, key: &str) -> Result<Self> {
        Self::new(inner, "X-App-Token", key)
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    /// Copies the credential header onto `req`, replacing any existing value.
    fn decorate(&self, req: &mut reqwest::Request) {
        req.headers_mut()
            .insert(self.header_name.clone(), self.value.clone());
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.decorate(&mut req);
        self.inner.execute(req).await
    }
}
