//! HTTP client backed by reqwest.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use super::{HttpClient, HttpProgress, HttpResponse, HttpResult};

/// The User-Agent string sent with every request.
const BUILDPATCH_USER_AGENT: &str = concat!("BuildPatch/", env!("CARGO_PKG_VERSION"));

/// An HTTP client using reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> reqwest::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BUILDPATCH_USER_AGENT));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, progress: HttpProgress<'_>) -> HttpResult {
        let res = self.client.get(url).send().await?;
        let status = res.status().as_u16();

        let mut body = BytesMut::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
            progress(body.len() as u64);
        }

        Ok(HttpResponse {
            status,
            body: body.freeze(),
        })
    }
}
