use super::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }

    /// Size as counted against SETTINGS_MAX_HEADER_LIST_SIZE (RFC 7540 Section 6.5.2).
    pub fn list_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Checks that every pseudo-header precedes the regular ones and that names
/// are non-empty lower-case tokens.
pub fn validate_header_block(headers: &[Header]) -> Result<(), ProtocolError> {
    let mut regular_seen = false;
    for header in headers {
        if header.name.is_empty() {
            return Err(ProtocolError::MalformedHeaders(
                "Empty header name".to_string(),
            ));
        }
        if header.name.contains(char::is_whitespace) {
            return Err(ProtocolError::MalformedHeaders(format!(
                "Header name contains whitespace: {}",
                header.name
            )));
        }
        if header.name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(ProtocolError::MalformedHeaders(format!(
                "Header name must be lower-case: {}",
                header.name
            )));
        }
        if header.is_pseudo() {
            if regular_seen {
                return Err(ProtocolError::MalformedHeaders(format!(
                    "Pseudo-header {} after regular headers",
                    header.name
                )));
            }
        } else {
            regular_seen = true;
        }
    }
    Ok(())
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Parses `:status` out of a response header block.
pub fn status_code(headers: &[Header]) -> Option<u16> {
    header_value(headers, ":status").and_then(|v| v.parse::<u16>().ok())
}
