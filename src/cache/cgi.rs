//! `key=value&key=value` opaque strings as carried in replica URLs

use std::collections::BTreeMap;

/// Key holding the hexadecimal file id in a replica's redirect URL
pub const ID_KEY: &str = "mgm.id";

/// Parse an opaque string; a leading `?` is ignored, as are empty pairs.
/// Later duplicates win.
pub fn import(opaque: &str) -> BTreeMap<String, String> {
    opaque
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Render pairs back into an opaque string in key order
pub fn export(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// The query part of `url` (empty when there is none)
pub fn query(url: &str) -> &str {
    url.split_once('?').map_or("", |(_, q)| q)
}

/// Replace the query part of `url` with `params`
pub fn with_query(url: &str, params: &str) -> String {
    let base = url.split_once('?').map_or(url, |(b, _)| b);
    if params.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, params)
    }
}

/// File id encoded as hex under `mgm.id` in the URL's query, 0 if absent
pub fn id_from_url(url: &str) -> u64 {
    import(query(url))
        .get(ID_KEY)
        .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
        .unwrap_or(0)
}
