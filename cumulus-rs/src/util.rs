/// Convert CR/LF line endings into LF ones.
///
/// Text that came through a browser form or a Windows machine carries CR/LF
/// endings; everything persisted by Cumulus uses LF.
pub fn to_unix_eols(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Treat empty and all-whitespace strings as absent.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Borrowing variant of [`non_blank`].
pub fn non_blank_str(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
