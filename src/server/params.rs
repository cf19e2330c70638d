//! Request parameter extraction
//!
//! Decodes GET query strings and urlencoded POST bodies into a flat map for
//! plain HTTP handlers. Repeated keys keep their first value. Multipart
//! bodies are not decoded.

use std::collections::HashMap;

use tracing::debug;

use super::handshake::HttpRequest;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Collect request parameters
///
/// GET reads the query string, POST reads a urlencoded form body. Any other
/// method, or a POST with another content type, yields an empty map.
pub fn parse_params(request: &HttpRequest) -> HashMap<String, String> {
    match request.method.as_str() {
        "GET" => decode(request.query().unwrap_or_default().as_bytes()),
        "POST" => {
            let content_type = request.header("content-type").unwrap_or_default();
            if content_type
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
            {
                decode(&request.body)
            } else {
                debug!("Ignoring POST body with content type {:?}", content_type);
                HashMap::new()
            }
        }
        other => {
            debug!("Parameters not supported for {} requests", other);
            HashMap::new()
        }
    }
}

fn decode(input: &[u8]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(input) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_get_query_params() {
        let req = request("GET", "/login?user=alice&room=general%20chat", &[], "");
        let params = parse_params(&req);
        assert_eq!(params.get("user").map(String::as_str), Some("alice"));
        assert_eq!(params.get("room").map(String::as_str), Some("general chat"));
    }

    #[test]
    fn test_get_repeated_key_keeps_first() {
        let req = request("GET", "/?tag=a&tag=b", &[], "");
        assert_eq!(parse_params(&req).get("tag").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_get_without_query() {
        let req = request("GET", "/websocket", &[], "");
        assert!(parse_params(&req).is_empty());
    }

    #[test]
    fn test_post_form_params() {
        let req = request(
            "POST",
            "/login",
            &[("Content-Type", "application/x-www-form-urlencoded; charset=UTF-8")],
            "user=bob&note=hi+there",
        );
        let params = parse_params(&req);
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("note").map(String::as_str), Some("hi there"));
    }

    #[test]
    fn test_post_other_content_type() {
        let req = request(
            "POST",
            "/login",
            &[("Content-Type", "application/json")],
            "{\"user\":\"bob\"}",
        );
        assert!(parse_params(&req).is_empty());
    }

    #[test]
    fn test_post_multipart_is_not_decoded() {
        let req = request(
            "POST",
            "/login",
            &[("Content-Type", "multipart/form-data; boundary=XyZ")],
            "--XyZ\r\nContent-Disposition: form-data; name=\"user\"\r\n\r\nbob\r\n--XyZ--\r\n",
        );
        assert!(parse_params(&req).is_empty());
    }

    #[test]
    fn test_unsupported_method() {
        let req = request("PUT", "/login?user=alice", &[], "");
        assert!(parse_params(&req).is_empty());
    }
}
