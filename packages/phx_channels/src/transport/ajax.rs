//! One-shot HTTP requests for the long-poll transport.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AjaxRequest {
    pub method: Method,
    pub url: String,
    pub accept: &'static str,
    pub body: Option<String>,
    pub timeout: Duration,
}

/// How a request ended.
///
/// `Response(None)` covers every failure that is not a timeout: connection
/// errors and bodies that are not JSON alike. The long-poll protocol treats
/// those as status 0.
#[derive(Debug, Clone, PartialEq)]
pub enum AjaxOutcome {
    Response(Option<Value>),
    TimedOut,
}

/// Request primitive the long-poller is built on.
pub trait Ajax: Send + Sync {
    fn request(&self, req: AjaxRequest) -> BoxFuture<'static, AjaxOutcome>;
}

/// [`Ajax`] over a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestAjax {
    client: reqwest::Client,
}

impl ReqwestAjax {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Ajax for ReqwestAjax {
    fn request(&self, req: AjaxRequest) -> BoxFuture<'static, AjaxOutcome> {
        let mut builder = match req.method {
            Method::Get => self.client.get(&req.url),
            Method::Post => self.client.post(&req.url),
        };
        builder = builder
            .header(reqwest::header::ACCEPT, req.accept)
            .header(reqwest::header::CONTENT_TYPE, req.accept)
            .timeout(req.timeout);
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        async move {
            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => return AjaxOutcome::TimedOut,
                Err(e) => {
                    debug!("ajax request failed: {}", e);
                    return AjaxOutcome::Response(None);
                }
            };
            match resp.text().await {
                Ok(text) => AjaxOutcome::Response(parse_json(&text)),
                Err(e) if e.is_timeout() => AjaxOutcome::TimedOut,
                Err(e) => {
                    debug!("ajax response body failed: {}", e);
                    AjaxOutcome::Response(None)
                }
            }
        }
        .boxed()
    }
}

fn parse_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    serde_json::from_str(text).ok()
}
