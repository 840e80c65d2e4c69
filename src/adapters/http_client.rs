//! Upstream HTTP transport built on Hyper with Rustls (HTTP/1.1, ALPN h2).
//!
//! The adapter is deliberately thin: connection pooling lives in the hyper
//! client, per-request deadlines are enforced by the proxy core, and health
//! probes get their own short timeout here.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{Request, Response, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::{
    core::error::{ProxyError, ProxyResult},
    ports::http_client::HttpClient,
};

pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add a native root certificate");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);

        Ok(Self { client })
    }

    fn map_error(e: hyper_util::client::legacy::Error) -> ProxyError {
        if e.is_connect() {
            ProxyError::ConnectionRefused(e.to_string())
        } else {
            ProxyError::Upstream(e.to_string())
        }
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn forward(&self, req: Request<Body>) -> ProxyResult<Response<Body>> {
        let response = self
            .client
            .request(req)
            .await
            .map_err(Self::map_error)?;

        let (mut parts, body) = response.into_parts();
        // The body is re-framed on the way out; stale framing headers would
        // contradict what the inbound server writes.
        parts.headers.remove(header::TRANSFER_ENCODING);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    async fn probe(&self, url: &str, probe_timeout: Duration) -> ProxyResult<u16> {
        let req = Request::builder()
            .method(hyper::Method::GET)
            .uri(url)
            .header(header::USER_AGENT, "switchyard-healthcheck")
            .body(Body::empty())
            .map_err(|e| ProxyError::InvalidRequest(format!("probe request: {e}")))?;

        let response = timeout(probe_timeout, self.client.request(req))
            .await
            .map_err(|_| ProxyError::Timeout(probe_timeout))?
            .map_err(Self::map_error)?;

        Ok(response.status().as_u16())
    }
}
