//! Static Pages
//!
//! Answers browser GETs on the control port. `pages.json` in the pages
//! directory maps request paths to file names in the same directory.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

/// Index file name inside the pages directory.
pub const PAGE_INDEX_FILE: &str = "pages.json";

/// Fallback page file name inside the pages directory.
pub const NOT_FOUND_FILE: &str = "404.html";

const NOT_FOUND_BODY: &str = "<!DOCTYPE html><html><body><h1>404 Not Found</h1></body></html>";
const MISCONFIGURED_BODY: &str = "The server's page directory is misconfigured";

/// Page lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// No pages directory configured.
    #[error("no pages directory configured")]
    NotConfigured,

    /// Directory or index unreadable.
    #[error("failed to read page index: {0}")]
    Io(#[from] std::io::Error),

    /// Index is not a JSON object of strings.
    #[error("invalid page index: {0}")]
    InvalidIndex(#[from] serde_json::Error),
}

/// A rendered page.
#[derive(Debug)]
pub struct Page {
    /// HTTP status.
    pub status: StatusCode,
    /// Content type header value.
    pub content_type: &'static str,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl IntoResponse for Page {
    fn into_response(self) -> Response {
        (self.status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

fn content_type_for(file: &str) -> &'static str {
    match Path::new(file).extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Only bare file names may be served out of the directory.
fn is_plain_file_name(file: &str) -> bool {
    let mut components = Path::new(file).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

async fn load_index(dir: &Path) -> Result<BTreeMap<String, String>, PageError> {
    let raw = tokio::fs::read(dir.join(PAGE_INDEX_FILE)).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn not_found(dir: &Path) -> Page {
    let body = tokio::fs::read(dir.join(NOT_FOUND_FILE))
        .await
        .unwrap_or_else(|_| NOT_FOUND_BODY.as_bytes().to_vec());
    Page {
        status: StatusCode::NOT_FOUND,
        content_type: "text/html; charset=utf-8",
        body,
    }
}

fn misconfigured(err: &PageError) -> Page {
    error!("Cannot serve pages: {}", err);
    Page {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        content_type: "text/plain; charset=utf-8",
        body: MISCONFIGURED_BODY.as_bytes().to_vec(),
    }
}

/// Look up and read the page for `request_path`.
pub async fn serve_page(pages_dir: Option<&Path>, request_path: &str) -> Page {
    let Some(dir) = pages_dir else {
        return misconfigured(&PageError::NotConfigured);
    };
    let index = match load_index(dir).await {
        Ok(index) => index,
        Err(e) => return misconfigured(&e),
    };

    let Some(file) = index.get(request_path).filter(|f| is_plain_file_name(f)) else {
        debug!("No page mapped for {}", request_path);
        return not_found(dir).await;
    };

    match tokio::fs::read(dir.join(file)).await {
        Ok(body) => Page {
            status: StatusCode::OK,
            content_type: content_type_for(file),
            body,
        },
        Err(e) => {
            debug!("Page {} for {} unreadable: {}", file, request_path, e);
            not_found(dir).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct TempPages(PathBuf);

    impl TempPages {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "tgc-pages-{}-{}",
                tag,
                uuid::Uuid::new_v4()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        fn write(&self, name: &str, contents: &str) {
            std::fs::write(self.0.join(name), contents).unwrap();
        }
    }

    impl Drop for TempPages {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("index.html"));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name("/etc/passwd"));
        assert!(!is_plain_file_name("sub/page.html"));
        assert!(!is_plain_file_name(""));
    }

    #[tokio::test]
    async fn test_mapped_page() {
        let pages = TempPages::new("mapped");
        pages.write(PAGE_INDEX_FILE, r#"{ "/": "index.html" }"#);
        pages.write("index.html", "<h1>hi</h1>");

        let page = serve_page(Some(&pages.0), "/").await;
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.body, b"<h1>hi</h1>");
        assert!(page.content_type.starts_with("text/html"));
    }

    #[tokio::test]
    async fn test_unmapped_uses_404_page() {
        let pages = TempPages::new("unmapped");
        pages.write(PAGE_INDEX_FILE, r#"{ "/gone": "gone.html", "/up": "../up.html" }"#);
        pages.write(NOT_FOUND_FILE, "custom missing");

        for path in ["/nope", "/gone", "/up"] {
            let page = serve_page(Some(&pages.0), path).await;
            assert_eq!(page.status, StatusCode::NOT_FOUND);
            assert_eq!(page.body, b"custom missing");
        }
    }

    #[tokio::test]
    async fn test_builtin_404_without_page() {
        let pages = TempPages::new("builtin");
        pages.write(PAGE_INDEX_FILE, "{}");
        let page = serve_page(Some(&pages.0), "/").await;
        assert_eq!(page.status, StatusCode::NOT_FOUND);
        assert_eq!(page.body, NOT_FOUND_BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_misconfigured_dir() {
        let page = serve_page(None, "/").await;
        assert_eq!(page.status, StatusCode::INTERNAL_SERVER_ERROR);

        let missing = std::env::temp_dir().join("tgc-pages-does-not-exist");
        let page = serve_page(Some(&missing), "/").await;
        assert_eq!(page.status, StatusCode::INTERNAL_SERVER_ERROR);

        let pages = TempPages::new("badindex");
        pages.write(PAGE_INDEX_FILE, "[1, 2]");
        let page = serve_page(Some(&pages.0), "/").await;
        assert_eq!(page.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
