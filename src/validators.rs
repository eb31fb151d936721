//! Input validation and sanitization functions for appwall
//!
//! Package names and UIDs end up inside privileged shell commands
//! (`iptables ... --uid-owner`, `cmd connectivity ... <package>`), so
//! everything is validated here before it gets near a root or broker shell.

use crate::core::rule::{LAST_APPLICATION_UID, PER_USER_RANGE};

/// Maximum profile id accepted (Android caps users well below this).
pub const MAX_PROFILE_ID: u32 = 999;

/// Sanitizes a label for display and logging.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 characters.
///
/// # Examples
///
/// ```
/// use appwall::validators::sanitize_label;
///
/// let safe = sanitize_label("Normal Label");
/// assert_eq!(safe, "Normal Label");
///
/// let unsafe_label = "Test\nNewline\"Quote";
/// let safe = sanitize_label(unsafe_label);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: Use ASCII-only to prevent Unicode bypasses and multi-byte issues
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':')
        })
        .take(64)
        .collect()
}

/// Validates an Android package name.
///
/// Accepts dot-separated segments of `[A-Za-z0-9_]`, each starting with a
/// letter, at most 255 characters. Shared-UID pseudo packages such as
/// `android` (single segment) are accepted as well.
///
/// # Errors
///
/// Returns `Err` with a description when the name is empty, too long, or
/// contains anything other than letters, digits, `_` and `.`.
pub fn validate_package_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Package name cannot be empty".to_string());
    }

    if name.len() > 255 {
        return Err("Package name too long (max 255 chars)".to_string());
    }

    for segment in name.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            Some(_) => {
                return Err(format!(
                    "Package segment '{segment}' must start with a letter"
                ));
            }
            None => return Err("Package name contains an empty segment".to_string()),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!(
                "Package segment '{segment}' contains invalid characters"
            ));
        }
    }

    Ok(())
}

/// Validates a profile (Android user) id.
pub fn validate_profile_id(profile_id: u32) -> Result<u32, String> {
    if profile_id > MAX_PROFILE_ID {
        return Err(format!(
            "Profile id {profile_id} out of range (max {MAX_PROFILE_ID})"
        ));
    }
    Ok(profile_id)
}

/// Validates an absolute UID before it is passed to a privileged command.
///
/// Only application UIDs are accepted; system UIDs (root, shell, system)
/// must never be firewalled.
pub fn validate_app_uid(uid: u32) -> Result<u32, String> {
    let (profile_id, app_id) = (uid / PER_USER_RANGE, uid % PER_USER_RANGE);
    validate_profile_id(profile_id)?;
    if !(crate::core::rule::FIRST_APPLICATION_UID..=LAST_APPLICATION_UID).contains(&app_id) {
        return Err(format!("UID {uid} is not an application UID"));
    }
    Ok(uid)
}
