//! Canned responses.

use crate::protocol::Response;

const NOT_FOUND_TEXT: &str = "The service could not find the requested page.";
const INTERNAL_ERROR_STATUS: &str = "400 HackTV ran into a technical problem.";
const INTERNAL_ERROR_TEXT: &str = "An internal server error has occured.";

/// 404 page.
pub fn not_found() -> Response {
    Response::new(format!("404 {}", NOT_FOUND_TEXT))
        .header("Content-Type", "text/html")
        .body(NOT_FOUND_TEXT)
}

/// 400 page, optionally carrying what went wrong.
pub fn internal_error(detail: Option<&str>) -> Response {
    let body = match detail {
        Some(detail) => format!(
            "{}<br><br>The interpreter said:<br><pre>{}</pre>",
            INTERNAL_ERROR_TEXT,
            escape_html(detail)
        ),
        None => INTERNAL_ERROR_TEXT.to_string(),
    };
    Response::new(INTERNAL_ERROR_STATUS)
        .header("Content-Type", "text/html")
        .body(body)
}

/// Greeting for something that is clearly not a set-top box.
pub fn stranger() -> Response {
    Response::new("HTTP/1.1 200 OK")
        .header("Content-Type", "text/html")
        .body("Hello, stranger!")
}

/// Tell the client its encryption stream is gone and it must log in again.
pub fn relogin() -> Response {
    Response::new("200 OK")
        .header("Connection", "Keep-Alive")
        .header("Expires", "Wed, 09 Oct 1991 22:00:00 GMT")
        .header("wtv-expire-all", "wtv-head-waiter:")
        .header("wtv-expire-all", "wtv-1800:")
        .header("wtv-visit", "client:relog")
        .header("Content-type", "text/html")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
