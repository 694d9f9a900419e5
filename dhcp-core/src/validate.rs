//! Option-value validators: every value exported into the configurator's
//! environment passes through one of these first.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} exceeds maximum length")]
    TooLong { field: &'static str },
    #[error("{field} label \"{label}\" is invalid")]
    BadLabel { field: &'static str, label: String },
    #[error("{field} contains a disallowed character")]
    BadCharacter { field: &'static str },
    #[error("{field} is not valid UTF-8")]
    NotUtf8 { field: &'static str },
}

const MAX_DOMAIN_NAME_LEN: usize = 256;

/// `domain-name`, `host-name`, `nis-domain`, `netbios-scope`: a single
/// dot-separated DNS name.
pub fn validate_domain_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_DOMAIN_NAME_LEN {
        return Err(ValidationError::TooLong { field });
    }
    for label in value.split('.') {
        validate_label(field, label)?;
    }
    Ok(())
}

fn validate_label(field: &'static str, label: &str) -> Result<(), ValidationError> {
    if label.is_empty() || label.len() > 63 {
        return Err(ValidationError::BadLabel { field, label: label.to_string() });
    }
    if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return Err(ValidationError::BadLabel { field, label: label.to_string() });
    }
    let first = label.as_bytes()[0];
    let last = label.as_bytes()[label.len() - 1];
    if first == b'-' || first == b'_' || last == b'-' || last == b'_' {
        return Err(ValidationError::BadLabel { field, label: label.to_string() });
    }
    Ok(())
}

/// `domain-search`: a space-separated list of domain names.
pub fn validate_domain_search(value: &str) -> Result<(), ValidationError> {
    for name in value.split_whitespace() {
        validate_domain_name("domain-search", name)?;
    }
    Ok(())
}

/// `root-path`: a printable subset, no shell metacharacters.
pub fn validate_root_path(value: &str) -> Result<(), ValidationError> {
    let allowed = |b: u8| {
        b.is_ascii_alphanumeric()
            || matches!(b, b'#' | b'%' | b'+' | b'-' | b'_' | b':' | b'.' | b',' | b'@' | b'~' | b'\\' | b'/' | b'[' | b']' | b'=' | b' ')
    };
    if !value.bytes().all(allowed) {
        return Err(ValidationError::BadCharacter { field: "root-path" });
    }
    Ok(())
}

/// Option families recognized for validation, keyed by the
/// configurator-facing name (after `-`→`_` translation has *not* yet
/// happened — validation runs on the option's canonical name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFamily {
    DomainName,
    DomainSearch,
    RootPath,
    Opaque,
}

pub fn family_for_option_name(name: &str) -> OptionFamily {
    match name {
        "domain-name" | "host-name" | "nis-domain" | "netbios-scope" => OptionFamily::DomainName,
        "domain-search" => OptionFamily::DomainSearch,
        "root-path" => OptionFamily::RootPath,
        _ => OptionFamily::Opaque,
    }
}

/// Validate raw bytes intended for export as an environment variable.
/// Non-UTF8 bytes fail closed for the families that require text.
pub fn validate_for_export(name: &str, bytes: &[u8]) -> Result<(), ValidationError> {
    match family_for_option_name(name) {
        OptionFamily::Opaque => Ok(()),
        family => {
            let text = std::str::from_utf8(bytes).map_err(|_| ValidationError::NotUtf8 { field: "value" })?;
            match family {
                OptionFamily::DomainName => validate_domain_name("domain-name", text),
                OptionFamily::DomainSearch => validate_domain_search(text),
                OptionFamily::RootPath => validate_root_path(text),
                OptionFamily::Opaque => unreachable!(),
            }
        }
    }
}
