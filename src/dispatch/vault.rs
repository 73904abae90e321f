//! Static content lookup under the service vault.
//!
//! # Lookup Order
//! For `<root>/<service>/<path>`:
//! 1. the exact file, typed by extension
//! 2. `<path>.txt`, a raw response (header text, blank line, body)
//! 3. `<path>.html`, served as `text/html`
//! 4. nothing: the caller answers 404
//!
//! Paths that try to leave the service directory never match.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::dispatch::router::DispatchError;
use crate::protocol::Response;

/// Read-only view of the content tree.
#[derive(Debug, Clone)]
pub struct ServiceVault {
    root: PathBuf,
}

impl ServiceVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find content for `service:/path`.
    pub fn lookup(&self, service: &str, path: &str) -> Result<Option<Response>, DispatchError> {
        let Some(base) = self.resolve(service, path) else {
            tracing::debug!(service, path, "Rejected vault path");
            return Ok(None);
        };

        if base.is_file() {
            tracing::debug!(file = ?base, "Serving vault file");
            let body = read(&base)?;
            return Ok(Some(
                Response::new("200 OK")
                    .header("Content-Type", content_type(&base, service))
                    .body(body),
            ));
        }

        let raw = with_suffix(&base, "txt");
        if raw.is_file() {
            tracing::debug!(file = ?raw, "Serving raw vault response");
            let text = String::from_utf8_lossy(&read(&raw)?).into_owned();
            return Ok(Some(raw_response(&text)));
        }

        let html = with_suffix(&base, "html");
        if html.is_file() {
            tracing::debug!(file = ?html, "Serving vault page");
            return Ok(Some(
                Response::new("200 OK")
                    .header("Content-Type", "text/html")
                    .body(read(&html)?),
            ));
        }

        Ok(None)
    }

    fn resolve(&self, service: &str, path: &str) -> Option<PathBuf> {
        if service.is_empty() || service.contains(['/', '\\']) || service == ".." || service == "." {
            return None;
        }

        let path = path.replace('\\', "/");
        let mut resolved = self.root.join(service);
        for component in Path::new(&path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(resolved)
    }
}

/// Split a raw `.txt` response into header text and body.
///
/// The first `\n\n` wins; otherwise the first `\r\n\r\n`, with carriage
/// returns dropped from the header text. Without a blank line the whole file
/// is header text.
pub fn raw_response(text: &str) -> Response {
    if let Some(pos) = text.find("\n\n").filter(|&pos| pos > 0) {
        return Response::from_raw(&text[..pos], text[pos + 2..].to_string());
    }
    if let Some(pos) = text.find("\r\n\r\n").filter(|&pos| pos > 0) {
        let head = text[..pos].replace('\r', "");
        return Response::from_raw(&head, text[pos + 4..].to_string());
    }
    Response::from_raw(text, "")
}

/// Content type for a vault file.
pub fn content_type(path: &Path, service: &str) -> String {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "rom" | "brom" if service == "wtv-flashrom" => "binary/x-wtv-flashblock".to_string(),
        "rmf" => "audio/x-rmf".to_string(),
        _ => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn read(path: &Path) -> Result<Vec<u8>, DispatchError> {
    fs::read(path).map_err(|source| DispatchError::Io {
        path: path.to_path_buf(),
        source,
    })
}
