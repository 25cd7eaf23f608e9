//! Draft ids carried in shareable resume links.

use url::Url;

/// Non-empty draft id from the `param` query parameter, if present.
pub fn draft_id_from_url(url: &Url, param: &str) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| name == param)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `url` with `param` set to `draft_id`, replacing earlier occurrences and
/// keeping every other query parameter in order. Meant for a history
/// replace, not a push.
pub fn with_draft_id(url: &Url, param: &str, draft_id: &str) -> Url {
    let others: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != param)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut updated = url.clone();
    updated
        .query_pairs_mut()
        .clear()
        .extend_pairs(others)
        .append_pair(param, draft_id);
    updated
}

/// `url` without `param`; drops the query string entirely when nothing is left.
pub fn without_draft_id(url: &Url, param: &str) -> Url {
    let others: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != param)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut updated = url.clone();
    if others.is_empty() {
        updated.set_query(None);
    } else {
        updated.query_pairs_mut().clear().extend_pairs(others);
    }
    updated
}
