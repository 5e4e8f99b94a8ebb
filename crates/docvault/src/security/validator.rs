//! Entry name validation

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{VaultError, VaultResult};

/// Characters never allowed in an entry name: separators and control characters
static FORBIDDEN_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[/\\\x00-\x1f\x7f]").unwrap());

const MAX_NAME_BYTES: usize = 255;

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Validate a single file or folder name before it is joined onto a parent.
///
/// # Returns
/// * `Ok(())` if the name can be used as one path segment
/// * `Err(VaultError::InvalidPath)` otherwise
pub fn validate_entry_name(name: &str) -> VaultResult<()> {
    let reject = |reason: &str| Err(VaultError::invalid_path(name, reason));

    if name.trim().is_empty() {
        return reject("name cannot be empty");
    }
    if name == "." || name == ".." {
        return reject("relative segments are not allowed");
    }
    if FORBIDDEN_NAME_CHARS.is_match(name) {
        return reject("name contains path separators or control characters");
    }
    if name.len() > MAX_NAME_BYTES {
        return reject("name is too long");
    }

    // Reserved device names on Windows, with or without an extension
    let upper_name = name.to_uppercase();
    let base_name = upper_name.split('.').next().unwrap_or(&upper_name);
    if RESERVED_NAMES.contains(&base_name) {
        return reject("reserved device name");
    }

    Ok(())
}

/// Lowercased extension of a file name, if any. Dotfiles such as `.env`
/// have no extension.
pub fn file_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

/// Reject a file rename that would change the file type
pub fn ensure_same_extension(old_name: &str, new_name: &str) -> VaultResult<()> {
    if file_extension(old_name) != file_extension(new_name) {
        return Err(VaultError::ExtensionMismatch {
            from: old_name.to_string(),
            to: new_name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_entry_name() {
        assert!(validate_entry_name("report.pdf").is_ok());
        assert!(validate_entry_name("Quarterly Report (final).docx").is_ok());
        assert!(validate_entry_name(".env").is_ok());

        assert!(validate_entry_name("").is_err());
        assert!(validate_entry_name("   ").is_err());
        assert!(validate_entry_name("..").is_err());
        assert!(validate_entry_name("a/b").is_err());
        assert!(validate_entry_name("a\\b").is_err());
        assert!(validate_entry_name("a\0b").is_err());
        assert!(validate_entry_name("CON").is_err());
        assert!(validate_entry_name("com1.txt").is_err());
        assert!(validate_entry_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_extension_rules() {
        assert_eq!(file_extension("photo.PNG").as_deref(), Some("png"));
        assert_eq!(file_extension(".bashrc"), None);
        assert_eq!(file_extension("archive.tar.gz").as_deref(), Some("gz"));

        assert!(ensure_same_extension("photo.png", "holiday.PNG").is_ok());
        assert!(ensure_same_extension("README", "NOTES").is_ok());
        assert!(matches!(
            ensure_same_extension("photo.png", "photo.jpg"),
            Err(VaultError::ExtensionMismatch { .. })
        ));
        assert!(ensure_same_extension("notes", "notes.txt").is_err());
    }
}
