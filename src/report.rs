use axum::http::{HeaderMap, Method, Uri, header};
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// The only path that renders a report; everything else is a 404.
pub const REPORT_PATH: &str = "/azenv";

const REPORT_HEAD: &str = "<html>\n<head>\n<title>AZenv</title>\n</head>\n<body>\n<pre>\n";
const REPORT_TAIL: &str = "</pre>\n</body>\n</html>";

/// Splits a remote-address string on the last colon into (host, port).
///
/// Splitting on the last colon keeps bracketed IPv6 addresses intact
/// (`[::1]:8080` -> `[::1]`, `8080`). An address with no colon yields an
/// empty port.
pub fn split_remote_addr(remote: &str) -> (&str, &str) {
    match remote.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => (remote, ""),
    }
}

/// Converts a header name to PHP's `$_SERVER` convention: `X-Test` -> `HTTP_X_TEST`.
fn server_style_name(name: &str) -> String {
    format!("HTTP_{}", name.replace('-', "_").to_uppercase())
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Renders the request-metadata report as a complete HTML document.
///
/// Line order is fixed: `REMOTE_ADDR`, `REMOTE_PORT`, `REQUEST_URI`,
/// `REQUEST_METHOD`, `HTTP_HOST`, then the remaining headers, then
/// `REQUEST_TIME_FLOAT` and `REQUEST_TIME`. The `Host` header itself is
/// skipped since `HTTP_HOST` already carries it. Multi-valued headers emit
/// one line per value, preserving value order; ordering across distinct
/// header names follows the header map's own iteration order.
pub fn render_report(
    remote_addr: &str,
    method: &Method,
    uri: &Uri,
    host: &str,
    headers: &HeaderMap,
    unix_time: f64,
) -> String {
    let mut out = String::with_capacity(512);
    out.push_str(REPORT_HEAD);

    let (addr, port) = split_remote_addr(remote_addr);
    let _ = writeln!(out, "REMOTE_ADDR = {addr}");
    let _ = writeln!(out, "REMOTE_PORT = {port}");

    let request_uri = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let _ = writeln!(out, "REQUEST_URI = {request_uri}");
    let _ = writeln!(out, "REQUEST_METHOD = {method}");

    let _ = writeln!(out, "HTTP_HOST = {host}");
    for name in headers.keys() {
        // Skip the Host header; HTTP_HOST above already covers it.
        if name == header::HOST {
            continue;
        }
        let label = server_style_name(name.as_str());
        for value in headers.get_all(name) {
            let _ = writeln!(out, "{label} = {}", String::from_utf8_lossy(value.as_bytes()));
        }
    }

    let _ = writeln!(out, "REQUEST_TIME_FLOAT = {unix_time:.4}");
    let _ = writeln!(out, "REQUEST_TIME = {}", unix_time as i64);

    out.push_str(REPORT_TAIL);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn report_lines(report: &str) -> Vec<&str> {
        let start = report.find("<pre>\n").expect("report has no <pre>") + "<pre>\n".len();
        let end = report.find("</pre>").expect("report has no </pre>");
        report[start..end].lines().collect()
    }

    #[test]
    fn test_fixed_field_order() {
        let headers = HeaderMap::new();
        let report = render_report(
            "203.0.113.5:54321",
            &Method::GET,
            &"/azenv".parse().unwrap(),
            "example.com",
            &headers,
            1_700_000_000.1234,
        );
        let lines = report_lines(&report);
        assert_eq!(lines[0], "REMOTE_ADDR = 203.0.113.5");
        assert_eq!(lines[1], "REMOTE_PORT = 54321");
        assert_eq!(lines[2], "REQUEST_URI = /azenv");
        assert_eq!(lines[3], "REQUEST_METHOD = GET");
        assert_eq!(lines[4], "HTTP_HOST = example.com");
    }

    #[test]
    fn test_query_string_preserved_in_request_uri() {
        let report = render_report(
            "198.51.100.7:1234",
            &Method::POST,
            &"/azenv?foo=bar&baz=1".parse().unwrap(),
            "example.com",
            &HeaderMap::new(),
            0.0,
        );
        assert!(report.contains("REQUEST_URI = /azenv?foo=bar&baz=1\n"));
        assert!(report.contains("REQUEST_METHOD = POST\n"));
    }

    #[test]
    fn test_remote_addr_split_on_last_colon() {
        assert_eq!(split_remote_addr("203.0.113.5:54321"), ("203.0.113.5", "54321"));
        assert_eq!(split_remote_addr("[::1]:8080"), ("[::1]", "8080"));
        assert_eq!(split_remote_addr("unix-socket"), ("unix-socket", ""));
    }

    #[test]
    fn test_multi_value_headers_preserve_value_order() {
        let mut headers = HeaderMap::new();
        headers.append("X-Test", HeaderValue::from_static("a"));
        headers.append("X-Test", HeaderValue::from_static("b"));
        headers.insert("Host", HeaderValue::from_static("example.com"));

        let report = render_report(
            "203.0.113.5:54321",
            &Method::GET,
            &"/azenv".parse().unwrap(),
            "example.com",
            &headers,
            0.0,
        );

        let a = report.find("HTTP_X_TEST = a\n").expect("missing first value");
        let b = report.find("HTTP_X_TEST = b\n").expect("missing second value");
        assert!(a < b, "multi-value order not preserved");
    }

    #[test]
    fn test_host_header_not_duplicated() {
        let mut headers = HeaderMap::new();
        headers.insert("Host", HeaderValue::from_static("example.com"));
        headers.insert("User-Agent", HeaderValue::from_static("curl/8.0"));

        let report = render_report(
            "203.0.113.5:54321",
            &Method::GET,
            &"/azenv".parse().unwrap(),
            "example.com",
            &headers,
            0.0,
        );

        // Exactly one HTTP_HOST line: the one from the dedicated host field.
        assert_eq!(report.matches("HTTP_HOST = ").count(), 1);
        assert!(report.contains("HTTP_USER_AGENT = curl/8.0\n"));
    }

    #[test]
    fn test_header_name_conversion() {
        assert_eq!(server_style_name("x-forwarded-for"), "HTTP_X_FORWARDED_FOR");
        assert_eq!(server_style_name("accept"), "HTTP_ACCEPT");
        assert_eq!(server_style_name("x-b3-traceid"), "HTTP_X_B3_TRACEID");
    }

    #[test]
    fn test_request_time_is_truncation_of_float() {
        let report = render_report(
            "203.0.113.5:54321",
            &Method::GET,
            &"/azenv".parse().unwrap(),
            "example.com",
            &HeaderMap::new(),
            1_700_000_123.9876,
        );
        assert!(report.contains("REQUEST_TIME_FLOAT = 1700000123.9876\n"));
        assert!(report.contains("REQUEST_TIME = 1700000123\n"));
    }

    #[test]
    fn test_time_float_has_four_decimal_places() {
        let report = render_report(
            "h:1",
            &Method::GET,
            &"/azenv".parse().unwrap(),
            "",
            &HeaderMap::new(),
            42.5,
        );
        assert!(report.contains("REQUEST_TIME_FLOAT = 42.5000\n"));
        assert!(report.contains("REQUEST_TIME = 42\n"));
    }

    #[test]
    fn test_html_skeleton() {
        let report = render_report(
            "203.0.113.5:54321",
            &Method::GET,
            &"/azenv".parse().unwrap(),
            "example.com",
            &HeaderMap::new(),
            0.0,
        );
        assert!(report.starts_with("<html>\n<head>\n<title>AZenv</title>\n</head>\n<body>\n<pre>\n"));
        assert!(report.ends_with("</pre>\n</body>\n</html>"));
    }

    #[test]
    fn test_non_utf8_header_value_rendered_lossily() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Raw", HeaderValue::from_bytes(b"caf\xe9").unwrap());

        let report = render_report(
            "203.0.113.5:54321",
            &Method::GET,
            &"/azenv".parse().unwrap(),
            "example.com",
            &headers,
            0.0,
        );
        assert!(report.contains("HTTP_X_RAW = caf\u{FFFD}\n"));
    }
}
