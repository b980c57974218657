//! Identity sanitization
//!
//! Every per-user resource name and hostname is derived from the caller's
//! identity through [`sanitize`]. The mapping is lossy: two raw identities
//! that differ only in dropped characters, case, or in which of `.`, `_`, `@`
//! they use sanitize to the same id and therefore share one workspace. That
//! collision is accepted; callers that need stricter isolation must reject
//! such identities upstream.

/// Maximum length of a DNS-1123 label
pub const DNS_LABEL_MAX: usize = 63;

/// Turn an arbitrary identity into a DNS-label-safe name fragment.
///
/// ASCII letters are lowercased, digits and `-` are kept, `.`, `_` and `@`
/// become `-`, everything else is dropped. Leading and trailing dashes are
/// stripped and the result is clamped to 63 characters.
///
/// The function is total: an identity with no usable characters yields an
/// empty string, which callers must treat as invalid.
///
/// ```
/// use devplane_common::identity::sanitize;
///
/// assert_eq!(sanitize("John.Doe@Example"), "john-doe-example");
/// assert_eq!(sanitize("--a--"), "a");
/// ```
pub fn sanitize(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            '.' | '_' | '@' => Some('-'),
            _ => None,
        })
        .collect();

    clamp_label(mapped.trim_matches('-'))
}

/// Clamp an already label-safe string to [`DNS_LABEL_MAX`] characters.
///
/// Truncation can expose a dash at the new end, so trailing dashes are
/// stripped after cutting.
pub fn clamp_label(label: &str) -> String {
    // Input is ASCII by construction, so byte and char offsets agree.
    let cut = if label.len() > DNS_LABEL_MAX {
        &label[..DNS_LABEL_MAX]
    } else {
        label
    };
    cut.trim_end_matches('-').to_string()
}

/// Build a resource name from a fixed prefix and a sanitized id
pub fn prefixed_name(prefix: &str, id: &str) -> String {
    clamp_label(&format!("{prefix}-{id}"))
}

/// Build the externally visible workspace hostname for a sanitized id
pub fn workspace_host(id: &str, base_domain: &str) -> String {
    format!("{}.{}", prefixed_name("code", id), base_domain)
}

/// Make an arbitrary string usable as a Kubernetes label value.
///
/// Label values allow `[A-Za-z0-9._-]`, at most 63 characters, and must start
/// and end with an alphanumeric character. Characters outside the set become
/// `-`.
pub fn label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let cut = if trimmed.len() > DNS_LABEL_MAX {
        &trimmed[..DNS_LABEL_MAX]
    } else {
        trimmed
    };
    cut.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
