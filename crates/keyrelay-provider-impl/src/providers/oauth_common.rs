pub(crate) fn parse_query_value(query: Option<&str>, key: &str) -> Option<String> {
    let raw = query?;
    if raw.is_empty() {
        return None;
    }
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut iter = pair.splitn(2, '=');
        let k = iter.next().unwrap_or_default();
        if k.is_empty() || k != key {
            continue;
        }
        let v = iter.next().unwrap_or_default();
        let decoded = urlencoding::decode(v).ok()?;
        let value = decoded.trim();
        if value.is_empty() {
            return None;
        }
        return Some(value.to_string());
    }
    None
}

pub(crate) fn extract_code_state_from_callback_url(
    callback_url: &str,
) -> (Option<String>, Option<String>) {
    let raw = callback_url.trim();
    if raw.is_empty() {
        return (None, None);
    }
    let query = if let Some(idx) = raw.find('?') {
        &raw[idx + 1..]
    } else {
        raw
    };
    let query = query.split('#').next().unwrap_or(query);
    if query.is_empty() {
        return (None, None);
    }
    (
        parse_query_value(Some(query), "code"),
        parse_query_value(Some(query), "state"),
    )
}

#[cfg(test)]
mod tests {
    use super::extract_code_state_from_callback_url;

    #[test]
    fn callback_url_extracts_code_and_state() {
        let (code, state) = extract_code_state_from_callback_url(
            "http://localhost:8787/cb?code=abc-123&state=st_1",
        );
        assert_eq!(code.as_deref(), Some("abc-123"));
        assert_eq!(state.as_deref(), Some("st_1"));
    }

    #[test]
    fn callback_url_query_string_only_is_supported() {
        let (code, state) = extract_code_state_from_callback_url("code=opaque%2Bvalue&state=s1");
        assert_eq!(code.as_deref(), Some("opaque+value"));
        assert_eq!(state.as_deref(), Some("s1"));
    }
}
