/// Separator between a namespace and a tool name in a qualified name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Sanitize a tool name into a valid JavaScript identifier fragment.
///
/// Keeps only `[A-Za-z0-9_$]`, prefixes a leading digit with `_`, and maps
/// an empty result to `_`. Idempotent: sanitizing twice yields the same
/// string.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
        .collect();

    if out.is_empty() {
        return "_".to_string();
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Build the globally unique qualified name `<namespace>__<sanitized-name>`.
pub fn qualified_name(namespace: &str, name: &str) -> String {
    format!("{namespace}{NAMESPACE_SEPARATOR}{}", sanitize_name(name))
}

/// Split a qualified name back into `(namespace, tool)` at the first `__`.
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(NAMESPACE_SEPARATOR)
}
