use thiserror::Error;

/// Longest local part accepted unless relaxed parsing is enabled.
pub const MAX_LOCAL_PART: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is not enclosed in angle brackets")]
    MissingBrackets,
    #[error("address is empty")]
    Empty,
    #[error("address starts or ends with whitespace or a control character")]
    SurroundingWhitespace,
    #[error("address has no domain part")]
    MissingAt,
    #[error("local part exceeds {MAX_LOCAL_PART} characters")]
    LocalPartTooLong,
}

/// Null reverse-path as sent in `MAIL FROM:<>`.
pub fn is_null_sender(raw: &str) -> bool {
    raw.contains("<>")
}

/// Extract the mailbox between the first `<` and the last `>` of an SMTP
/// path argument.
pub fn extract_address(raw: &str, relaxed_local_part: bool) -> Result<String, AddressError> {
    let start = raw.find('<').ok_or(AddressError::MissingBrackets)?;
    let stop = raw.rfind('>').ok_or(AddressError::MissingBrackets)?;
    if stop <= start {
        return Err(AddressError::MissingBrackets);
    }

    let inner = &raw[start + 1..stop];
    if inner.is_empty() {
        return Err(AddressError::Empty);
    }

    let bytes = inner.as_bytes();
    if is_edge_byte(bytes[0]) || is_edge_byte(bytes[bytes.len() - 1]) {
        return Err(AddressError::SurroundingWhitespace);
    }

    let (local, _) = inner.rsplit_once('@').ok_or(AddressError::MissingAt)?;
    if !relaxed_local_part && local.len() > MAX_LOCAL_PART {
        return Err(AddressError::LocalPartTooLong);
    }

    Ok(inner.to_string())
}

/// Domain part of a mailbox, after the last `@`.
pub fn domain_of(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}

// BEL through CR, plus space
fn is_edge_byte(b: u8) -> bool {
    (0x07..=0x0d).contains(&b) || b == b' '
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_address() {
        assert_eq!(
            extract_address("<user@example.com>", false),
            Ok("user@example.com".to_string())
        );
        assert_eq!(
            extract_address("<user@example.com> SIZE=1024", false),
            Ok("user@example.com".to_string())
        );
    }

    #[test]
    fn test_rejects_malformed_paths() {
        assert_eq!(
            extract_address("user@example.com", false),
            Err(AddressError::MissingBrackets)
        );
        assert_eq!(
            extract_address(">user@example.com<", false),
            Err(AddressError::MissingBrackets)
        );
        assert_eq!(extract_address("<>", false), Err(AddressError::Empty));
        assert_eq!(
            extract_address("< user@example.com>", false),
            Err(AddressError::SurroundingWhitespace)
        );
        assert_eq!(
            extract_address("<user@example.com\t>", false),
            Err(AddressError::SurroundingWhitespace)
        );
        assert_eq!(
            extract_address("<postmaster>", false),
            Err(AddressError::MissingAt)
        );
    }

    #[test]
    fn test_local_part_limit() {
        let long = format!("<{}@example.com>", "a".repeat(MAX_LOCAL_PART + 1));
        assert_eq!(
            extract_address(&long, false),
            Err(AddressError::LocalPartTooLong)
        );
        assert!(extract_address(&long, true).is_ok());

        let exact = format!("<{}@example.com>", "a".repeat(MAX_LOCAL_PART));
        assert!(extract_address(&exact, false).is_ok());
    }

    #[test]
    fn test_null_sender_and_domain() {
        assert!(is_null_sender("<>"));
        assert!(!is_null_sender("<user@example.com>"));
        assert_eq!(domain_of("user@Example.COM"), Some("Example.COM"));
        assert_eq!(domain_of("\"a@b\"@example.org"), Some("example.org"));
        assert_eq!(domain_of("nobody"), None);
    }
}
