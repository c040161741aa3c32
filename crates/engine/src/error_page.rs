//! Turns request failures into HTTP responses.

use std::error::Error as StdError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;

use crate::error::EnvError;
use crate::module::HttpResponse;

/// Produces the HTML document for a diagnostic page.
pub trait DiagnosticRenderer: Send + Sync {
    fn render_html(&self, error: &(dyn StdError + 'static), status: StatusCode) -> String;
}

/// Default diagnostic page: message, then the `source()` chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlDiagnostics;

impl DiagnosticRenderer for HtmlDiagnostics {
    fn render_html(&self, error: &(dyn StdError + 'static), status: StatusCode) -> String {
        let mut causes = String::new();
        let mut current = error.source();
        while let Some(cause) = current {
            causes.push_str("<li>");
            causes.push_str(&escape_html(&cause.to_string()));
            causes.push_str("</li>");
            current = cause.source();
        }
        let chain = if causes.is_empty() {
            String::new()
        } else {
            format!("<h2>Caused by</h2><ol>{}</ol>", causes)
        };
        format!(
            "<!doctype html><html><head><meta charset=\"utf-8\"><title>{code} {reason}</title>\
             <style>body{{font-family:ui-monospace,monospace;margin:2rem;color:#1f2937}}\
             h1{{color:#b91c1c}}pre{{background:#f3f4f6;padding:1rem;white-space:pre-wrap}}</style>\
             </head><body><h1>{code} {reason}</h1><pre>{message}</pre>{chain}</body></html>",
            code = status.as_u16(),
            reason = status.canonical_reason().unwrap_or("Error"),
            message = escape_html(&error.to_string()),
            chain = chain,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Development,
    Production,
}

#[derive(Clone)]
pub struct ErrorRenderer {
    mode: RenderMode,
    diagnostics: Arc<dyn DiagnosticRenderer>,
}

impl Default for ErrorRenderer {
    fn default() -> Self {
        Self::production()
    }
}

impl ErrorRenderer {
    pub fn new(dev: bool) -> Self {
        if dev {
            Self::development()
        } else {
            Self::production()
        }
    }

    pub fn development() -> Self {
        Self {
            mode: RenderMode::Development,
            diagnostics: Arc::new(HtmlDiagnostics),
        }
    }

    pub fn production() -> Self {
        Self {
            mode: RenderMode::Production,
            diagnostics: Arc::new(HtmlDiagnostics),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticRenderer>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Never fails. Anything going wrong in here yields a plain-text 500.
    pub fn render(&self, error: &EnvError) -> HttpResponse {
        tracing::debug!("rendering error response: {}", error);
        match catch_unwind(AssertUnwindSafe(|| self.try_render(error))) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::warn!("error page could not be built: {}", err);
                plain_internal_error()
            }
            Err(_) => {
                tracing::warn!("diagnostic renderer panicked");
                plain_internal_error()
            }
        }
    }

    fn try_render(&self, error: &EnvError) -> Result<HttpResponse, axum::http::Error> {
        let status = error.status();
        let body = match self.mode {
            RenderMode::Development => self.diagnostics.render_html(error, status),
            RenderMode::Production => generic_page(status),
        };
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate")
            .header(header::PRAGMA, "no-cache")
            .header(header::EXPIRES, "0")
            .body(Body::from(body))
    }
}

fn generic_page(status: StatusCode) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{code}</title></head>\
         <body><h1>{code} {reason}</h1></body></html>",
        code = status.as_u16(),
        reason = status.canonical_reason().unwrap_or("Error"),
    )
}

pub fn plain_internal_error() -> HttpResponse {
    let mut response = Response::new(Body::from("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
