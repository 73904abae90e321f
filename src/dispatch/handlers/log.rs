//! `wtv-log:/log`: client diagnostics upload.

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use crate::dispatch::router::{DispatchError, Handler, HandlerContext};
use crate::protocol::headers::unescape;
use crate::protocol::{DecodedRequest, Response};

const LOG_SERVICE: &str = "wtv-log";

#[derive(Debug, Default)]
pub struct LogHandler;

impl LogHandler {
    /// Query entries, then a blank line and the POST body if there is one.
    fn format(request: &DecodedRequest) -> BytesMut {
        let mut out = BytesMut::new();
        for (key, value) in request.query.iter() {
            out.put_slice(format!("{}={}\r\n", key, unescape(value)).as_bytes());
        }
        if let Some(post) = &request.post_data {
            out.put_slice(b"\r\n");
            out.put_slice(post);
        }
        out
    }

    fn file_name(request: &DecodedRequest) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let kind = request
            .query
            .get_decoded("type")
            .map(|kind| sanitize(&kind))
            .filter(|kind| !kind.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        match request.ssid.as_deref() {
            Some(ssid) => format!("{}_{}_{}.txt", secs, kind, sanitize(ssid)),
            None => format!("{}_{}.txt", secs, kind),
        }
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

impl Handler for LogHandler {
    fn handle(&self, request: &DecodedRequest, ctx: &HandlerContext) -> Result<Response, DispatchError> {
        let write = ctx
            .services
            .get(LOG_SERVICE)
            .map(|service| service.write_logs_to_disk)
            .unwrap_or(false);

        if write {
            fs::create_dir_all(&ctx.log_dir).map_err(|source| DispatchError::Write {
                path: ctx.log_dir.clone(),
                source,
            })?;
            let path = ctx.log_dir.join(Self::file_name(request));
            fs::write(&path, Self::format(request)).map_err(|source| DispatchError::Write {
                path: path.clone(),
                source,
            })?;
            tracing::info!(
                ssid = ?request.ssid,
                connection_id = %ctx.connection_id,
                file = ?path,
                "Wrote client log"
            );
        }

        Ok(Response::new("200 OK")
            .header("Connection", "Keep-Alive")
            .header("Content-length", "0"))
    }
}
