use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;

use super::{FetchError, FetchRequest, Fetcher, Response};
use crate::config::Config;

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("festcache/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(config.network_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      token: Config::api_token(),
    })
  }

  async fn send(
    client: reqwest::Client,
    token: Option<String>,
    request: FetchRequest,
  ) -> Result<Response> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method {}: {}", request.method, e))?;

    let mut builder = client.request(method, &request.url);
    if let Some(token) = token {
      builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(body) = request.body {
      builder = builder
        .header(CONTENT_TYPE, "application/json")
        .body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::failed(&request.url, e.to_string()))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::failed(&request.url, e.to_string()))?;

    Ok(Response {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Response>> {
    Self::send(self.client.clone(), self.token.clone(), request).boxed()
  }
}
