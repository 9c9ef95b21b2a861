use http::HeaderMap;
use serde_json::{Map, Value as JsonValue};
use url::form_urlencoded;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Returns the value of `name` in `headers`, if it is valid text.
pub fn get_req_header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Every text header as owned `(name, value)` pairs, names lowercased.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Parses a query string into JSON string parameters. The first occurrence
/// of a repeated key wins.
pub fn parse_query(query: Option<&str>) -> Map<String, JsonValue> {
    let mut params = Map::new();
    let query = match query {
        Some(query) => query,
        None => return params,
    };

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key.is_empty() || params.contains_key(&*key) {
            continue;
        }
        params.insert(key.into_owned(), JsonValue::String(value.into_owned()));
    }
    params
}
