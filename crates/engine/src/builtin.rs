//! Loaders that ship with the runtime.
//!
//! - `static:<dir>` serves files from a directory (index.html fallback)
//! - `text:<body>` answers every request with a fixed plain-text body

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::{HandlerError, LoadError};
use crate::module::{FetchHandler, HttpRequest, HttpResponse, Module, ModuleLoader, handler_fn};

#[derive(Debug, Clone)]
pub struct BuiltinLoader {
    base_dir: PathBuf,
}

impl BuiltinLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve_dir(&self, dir: &str) -> PathBuf {
        let path = Path::new(dir);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    async fn load_entry(&self, entry: String) -> Result<Module, LoadError> {
        if let Some(dir) = entry.strip_prefix("static:") {
            let root = self.resolve_dir(dir);
            let metadata = tokio::fs::metadata(&root).await.map_err(|err| {
                LoadError::new(
                    entry.clone(),
                    format!("Cannot open static root {}", root.display()),
                )
                .with_source(err)
            })?;
            if !metadata.is_dir() {
                return Err(LoadError::new(
                    entry.clone(),
                    format!("Static root is not a directory: {}", root.display()),
                ));
            }
            tracing::debug!("static site loaded from {}", root.display());
            return Ok(Module::new().with_default(Arc::new(StaticSite::new(root))));
        }

        if let Some(body) = entry.strip_prefix("text:") {
            let body = body.to_string();
            return Ok(Module::new().with_export(
                "fetch",
                handler_fn(move |_req| {
                    let body = body.clone();
                    async move { Ok(body.into_response()) }
                }),
            ));
        }

        Err(LoadError::new(
            entry.clone(),
            format!("Unsupported entry '{}' (expected static:<dir> or text:<body>)", entry),
        ))
    }
}

impl ModuleLoader for BuiltinLoader {
    fn load(&self, entry: &str) -> BoxFuture<'_, Result<Module, LoadError>> {
        self.load_entry(entry.to_string()).boxed()
    }
}

/// Read-only file server rooted at one directory.
#[derive(Debug, Clone)]
pub struct StaticSite {
    root: PathBuf,
}

impl StaticSite {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File path for a request path. Percent-escapes are decoded before
    /// the path is checked, so an encoded `..` is rejected too.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(request_path).ok()?;
        if decoded.contains('\0') {
            return None;
        }
        let relative = Path::new(decoded.trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }

    async fn serve(&self, request: HttpRequest) -> Result<HttpResponse, HandlerError> {
        let method = request.method().clone();
        if method != Method::GET && method != Method::HEAD {
            return Ok((StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response());
        }

        let Some(mut path) = self.resolve(request.uri().path()) else {
            return Ok(not_found());
        };
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        if is_dir {
            path.push("index.html");
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(not_found()),
            Err(err) => {
                return Err(HandlerError::new(format!("Failed to read {}", path.display()))
                    .with_source(err));
            }
        };

        let mime = get_mime_type(&path.to_string_lossy());
        let length = bytes.len();
        let body = if method == Method::HEAD {
            Vec::new()
        } else {
            bytes
        };
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime)
            .header(header::CONTENT_LENGTH, length)
            .body(body.into())
            .map_err(|err| HandlerError::new("Failed to build response").with_source(err))
    }
}

impl FetchHandler for StaticSite {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, HandlerError>> {
        self.serve(request).boxed()
    }
}

fn not_found() -> HttpResponse {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn get_mime_type(path: &str) -> &'static str {
    if path.ends_with(".html") {
        "text/html; charset=utf-8"
    } else if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".js") || path.ends_with(".mjs") {
        "application/javascript"
    } else if path.ends_with(".json") {
        "application/json"
    } else if path.ends_with(".txt") {
        "text/plain; charset=utf-8"
    } else if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else if path.ends_with(".woff") {
        "font/woff"
    } else if path.ends_with(".woff2") {
        "font/woff2"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn body_text(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    fn get(path: &str) -> HttpRequest {
        axum::http::Request::get(path).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn static_entry_serves_files_and_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").expect("write");
        std::fs::write(dir.path().join("app.css"), "body{}").expect("write");

        let loader = BuiltinLoader::new(dir.path());
        let module = loader.load("static:.").await.expect("load");
        let handler = module.fetch_export().expect("export");

        let response = handler.fetch(get("/")).await.expect("index");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "<h1>home</h1>");

        let response = handler.fetch(get("/app.css")).await.expect("css");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");

        let response = handler.fetch(get("/missing.js")).await.expect("missing");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_site_rejects_parent_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let site = StaticSite::new(dir.path());
        let response = site.fetch(get("/../etc/passwd")).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_site_decodes_escaped_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("public");
        std::fs::create_dir_all(root.join("sub dir")).expect("mkdir");
        std::fs::write(root.join("my file.txt"), "spaced").expect("write");
        std::fs::write(root.join("sub dir/index.html"), "nested").expect("write");
        std::fs::write(dir.path().join("secret.txt"), "hidden").expect("write");
        let site = StaticSite::new(&root);

        let response = site.fetch(get("/my%20file.txt")).await.expect("file");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "spaced");

        let response = site.fetch(get("/sub%20dir/")).await.expect("index");
        assert_eq!(body_text(response).await, "nested");

        for escaped in ["/%2e%2e/secret.txt", "/%2E%2E%2Fsecret.txt", "/..%2fsecret.txt"] {
            let response = site.fetch(get(escaped)).await.expect("response");
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", escaped);
        }

        let response = site.fetch(get("/bad%ffname")).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn text_entry_answers_every_path() {
        let loader = BuiltinLoader::new(".");
        let module = loader.load("text:ok").await.expect("load");
        let handler = module.fetch_export().expect("export");
        let response = handler.fetch(get("/anything")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn missing_root_and_unknown_scheme_fail_to_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loader = BuiltinLoader::new(dir.path());
        let err = loader.load("static:./nope").await.unwrap_err();
        assert!(err.message.contains("Cannot open static root"));
        let err = loader.load("./entry.ts").await.unwrap_err();
        assert!(err.message.contains("Unsupported entry"));
    }
}
