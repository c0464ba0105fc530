//! Input validation and sanitization functions for vpnfw
//!
//! Everything that ends up in an iptables or ipset argument list passes
//! through here first, so no caller-supplied string can smuggle in extra
//! options or shell metacharacters.

/// Kernel limit for ipset names (`IPSET_MAXNAMELEN` - 1)
pub const MAX_SET_NAME_LEN: usize = 31;

/// Sanitizes text for use in an iptables `--comment` match.
///
/// Keeps ASCII alphanumerics and `-`, `_`, `.`, `:`; whitespace is dropped
/// because the native binding splits rule strings on it. Limited to 64 bytes.
///
/// # Examples
///
/// ```
/// use vpnfw::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("pritunl-5f2a"), "pritunl-5f2a");
/// assert_eq!(sanitize_comment("a b\"c"), "abc");
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: Use ASCII-only to prevent Unicode bypasses and multi-byte issues
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
        })
        .take(64)
        .collect()
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// An empty name is accepted and means "no interface".
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    // Check for valid characters (ASCII alphanumeric only, plus dot, dash, underscore)
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a server id or server type used to build set names and tags.
///
/// # Errors
///
/// Returns `Err` if the identifier is empty or contains anything other than
/// ASCII alphanumerics, `_` and `-`.
pub fn validate_identifier(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Identifier cannot be empty".to_string());
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err("Identifier contains invalid characters (use only a-z, 0-9, _, -)".to_string());
    }

    Ok(())
}

/// Validates a protocol name or number for a `-p` match.
///
/// # Errors
///
/// Returns `Err` if the protocol is empty, longer than 32 characters or
/// contains anything other than ASCII alphanumerics.
pub fn validate_protocol(protocol: &str) -> Result<(), String> {
    if protocol.is_empty() {
        return Err("Protocol cannot be empty".to_string());
    }

    if protocol.len() > 32 {
        return Err("Protocol name too long (max 32 characters)".to_string());
    }

    if !protocol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("Protocol contains invalid characters".to_string());
    }

    Ok(())
}

/// Validates an ipset name against the kernel length limit.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than [`MAX_SET_NAME_LEN`] or
/// contains characters outside `[A-Za-z0-9_-]`.
pub fn validate_set_name(name: &str) -> Result<(), String> {
    validate_identifier(name)?;

    if name.len() > MAX_SET_NAME_LEN {
        return Err(format!(
            "Set name '{name}' too long ({} > {MAX_SET_NAME_LEN} characters)",
            name.len()
        ));
    }

    Ok(())
}
