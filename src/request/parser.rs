use axum::http::HeaderMap;
use serde_json::{Map, Value};

/// Parse a request body based on Content-Type.
pub fn parse_body(content_type: Option<&str>, body: &[u8]) -> Result<Value, String> {
    let ct = content_type.unwrap_or("application/json");

    if ct.contains("application/json") {
        serde_json::from_slice(body).map_err(|e| format!("Invalid JSON: {e}"))
    } else if ct.contains("application/x-www-form-urlencoded") {
        parse_form_urlencoded(body)
    } else if ct.starts_with("text/") {
        std::str::from_utf8(body)
            .map(|text| Value::String(text.to_string()))
            .map_err(|e| format!("Invalid UTF-8: {e}"))
    } else {
        serde_json::from_slice(body)
            .or_else(|_| parse_form_urlencoded(body))
            .map_err(|e| format!("Unable to parse body: {e}"))
    }
}

fn parse_form_urlencoded(body: &[u8]) -> Result<Value, String> {
    std::str::from_utf8(body).map_err(|e| format!("Invalid UTF-8: {e}"))?;
    Ok(pairs_to_object(form_urlencoded::parse(body)))
}

/// Query string as a flat object; a repeated key keeps its last value.
pub fn parse_query(query: Option<&str>) -> Map<String, Value> {
    match query {
        Some(q) => match pairs_to_object(form_urlencoded::parse(q.as_bytes())) {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        None => Map::new(),
    }
}

fn pairs_to_object<'a>(pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>) -> Value {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k.into_owned(), Value::String(v.into_owned()));
    }
    Value::Object(map)
}

/// Parse multipart form data using multer. File parts are read as text.
pub async fn parse_multipart(headers: &HeaderMap, body: bytes::Bytes) -> Result<Value, String> {
    let boundary = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or_else(|| "Missing multipart boundary".to_string())?;

    let stream = futures_util::stream::once(async { Ok::<_, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut map = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("Multipart error: {e}"))?
    {
        let name = field.name().unwrap_or("unknown").to_string();
        let value = field
            .text()
            .await
            .map_err(|e| format!("Field read error: {e}"))?;
        map.insert(name, Value::String(value));
    }

    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_body() {
        let value = parse_body(Some("application/json; charset=utf-8"), br#"{"x":1}"#).unwrap();
        assert_eq!(value, json!({"x": 1}));
    }

    #[test]
    fn form_body() {
        let value = parse_body(Some("application/x-www-form-urlencoded"), b"a=1&b=two+words").unwrap();
        assert_eq!(value, json!({"a": "1", "b": "two words"}));
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(parse_body(Some("application/json"), b"{nope").is_err());
    }

    #[test]
    fn query_pairs() {
        let query = parse_query(Some("q=rust&page=2&q=last"));
        assert_eq!(query.get("q"), Some(&json!("last")));
        assert_eq!(query.get("page"), Some(&json!("2")));
        assert!(parse_query(None).is_empty());
    }
}
