//! # Input Validation Utilities
//!
//! Security-focused checks applied at the protocol boundary before anything
//! reaches the store: npm package names, semantic versions, tarball file
//! names and dist-tag names.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, AppResult};

/// Maximum allowed package name length (npm's own limit)
pub const MAX_PACKAGE_NAME_LENGTH: usize = 214;

/// Maximum allowed version string length
pub const MAX_VERSION_LENGTH: usize = 64;

/// Maximum allowed filename length
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Maximum allowed dist-tag length
pub const MAX_TAG_LENGTH: usize = 64;

/// npm package names: optional `@scope/` prefix, lowercase URL-safe characters.
static NPM_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:@[a-z0-9~-][a-z0-9._~-]*/)?[a-z0-9~-][a-z0-9._~-]*$")
        .expect("npm name regex should compile - this is a static pattern")
});

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9._-]*$")
        .expect("dist-tag regex should compile - this is a static pattern")
});

/// Validate an npm package name (scoped or unscoped).
///
/// # Errors
///
/// Returns `AppError::Validation` for empty, overlong, uppercase, or
/// URL-unsafe names, and for names starting with `.` or `_`.
pub fn validate_package_name(name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(AppError::Validation(
            "Package name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_PACKAGE_NAME_LENGTH {
        return Err(AppError::Validation(format!(
            "Package name too long: {} characters (max: {})",
            name.len(),
            MAX_PACKAGE_NAME_LENGTH
        )));
    }

    if name.starts_with('.') || name.starts_with('_') {
        return Err(AppError::Validation(format!(
            "Package name '{}' cannot start with . or _",
            name
        )));
    }

    if !NPM_NAME_REGEX.is_match(name) {
        tracing::warn!(name = %name, "Rejected invalid package name");
        return Err(AppError::Validation(format!(
            "Invalid package name '{}'",
            name
        )));
    }

    Ok(())
}

/// Validate and parse a semantic version string.
///
/// # Errors
///
/// Returns `AppError::Validation` when the string is not a valid semver.
pub fn validate_version(version: &str) -> AppResult<semver::Version> {
    if version.len() > MAX_VERSION_LENGTH {
        return Err(AppError::Validation(format!(
            "Version too long: {} characters (max: {})",
            version.len(),
            MAX_VERSION_LENGTH
        )));
    }

    semver::Version::parse(version)
        .map_err(|e| AppError::Validation(format!("Invalid version '{}': {}", version, e)))
}

/// Validate a dist-tag name. Tags that parse as versions are rejected so a tag
/// can never shadow a version in range lookups.
pub fn validate_tag(tag: &str) -> AppResult<()> {
    if tag.len() > MAX_TAG_LENGTH || !TAG_REGEX.is_match(tag) {
        return Err(AppError::Validation(format!("Invalid dist-tag '{}'", tag)));
    }
    if semver::Version::parse(tag).is_ok() {
        return Err(AppError::Validation(format!(
            "Dist-tag '{}' looks like a version",
            tag
        )));
    }
    Ok(())
}

/// Validates a filename to prevent path traversal attacks.
///
/// # Errors
///
/// Returns an error if the filename:
/// - Is empty or too long (>255 characters)
/// - Contains null bytes or control characters
/// - Contains `..` or a path separator
pub fn validate_filename(filename: &str) -> AppResult<()> {
    if filename.is_empty() {
        tracing::warn!("Empty filename provided");
        return Err(AppError::Validation("Filename cannot be empty".to_string()));
    }

    if filename.len() > MAX_FILENAME_LENGTH {
        tracing::warn!(filename = %filename, length = %filename.len(), "Filename too long");
        return Err(AppError::Validation(format!(
            "Filename too long: {} characters (max: {})",
            filename.len(),
            MAX_FILENAME_LENGTH
        )));
    }

    if filename.contains('\0') {
        tracing::warn!(filename = %filename, "Null byte detected in filename");
        return Err(AppError::Validation(
            "Filename contains null byte".to_string(),
        ));
    }

    if filename.chars().any(|c| c.is_control()) {
        tracing::warn!(filename = %filename, "Control character detected in filename");
        return Err(AppError::Validation(
            "Filename contains control characters".to_string(),
        ));
    }

    if filename.contains("..") {
        tracing::warn!(filename = %filename, "Path traversal attempt detected (..)");
        return Err(AppError::Validation(
            "Filename contains parent directory reference (..)".to_string(),
        ));
    }

    if filename.contains('/') || filename.contains('\\') {
        tracing::warn!(filename = %filename, "Path separator detected in filename");
        return Err(AppError::Validation(
            "Filename cannot contain path separators".to_string(),
        ));
    }

    Ok(())
}

/// The unscoped part of a package name: `@scope/pkg` -> `pkg`.
pub fn base_name(name: &str) -> &str {
    name.rsplit_once('/').map_or(name, |(_, base)| base)
}

/// The canonical tarball file name for a version: `pkg-1.2.3.tgz`.
pub fn tarball_filename(name: &str, version: &str) -> String {
    format!("{}-{}.tgz", base_name(name), version)
}

/// Extract the version from a tarball file name produced by
/// [`tarball_filename`].
///
/// # Errors
///
/// Returns `AppError::Validation` when the file name does not belong to the
/// package or does not carry a valid version.
pub fn version_from_tarball_filename(name: &str, filename: &str) -> AppResult<String> {
    validate_filename(filename)?;

    let version = filename
        .strip_suffix(".tgz")
        .and_then(|stem| stem.strip_prefix(base_name(name)))
        .and_then(|rest| rest.strip_prefix('-'))
        .ok_or_else(|| {
            AppError::Validation(format!(
                "Tarball '{}' does not belong to package '{}'",
                filename, name
            ))
        })?;

    validate_version(version)?;
    Ok(version.to_string())
}
