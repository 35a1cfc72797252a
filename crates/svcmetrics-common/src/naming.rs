//! Metric and label name rules shared by the registry and the config layer.

/// Checks the exposition-format name grammar `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_alphabetic() || first == '_' || first == ':')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
}

/// Label names follow the metric grammar without colons; the `__` prefix is reserved.
pub fn is_valid_label_name(name: &str) -> bool {
    !name.starts_with("__") && !name.contains(':') && is_valid_metric_name(name)
}

pub fn qualified_name(service_identity: &str, logical_name: &str) -> String {
    format!("{service_identity}_{logical_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_name_grammar() {
        assert!(is_valid_metric_name("orders_requests_total"));
        assert!(is_valid_metric_name("_hidden"));
        assert!(is_valid_metric_name("ns:sub"));
        assert!(!is_valid_metric_name(""));
        assert!(!is_valid_metric_name("9lives"));
        assert!(!is_valid_metric_name("orders-api"));
        assert!(!is_valid_metric_name("with space"));
    }

    #[test]
    fn label_name_grammar() {
        assert!(is_valid_label_name("method"));
        assert!(!is_valid_label_name("__name__"));
        assert!(!is_valid_label_name("a:b"));
    }

    #[test]
    fn qualified_name_joins_with_underscore() {
        assert_eq!(qualified_name("orders", "requests_total"), "orders_requests_total");
    }
}
