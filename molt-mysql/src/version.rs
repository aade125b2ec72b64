use std::num::NonZeroI32;

/// Extracts a numeric MySQL server version from a version string.
///
/// Parses strings like "8.0.35" or "5.7.44-log" into the numeric format
/// MAJOR * 10000 + MINOR * 100 + PATCH (8.0.35 = 80035). Returns `None` when
/// the string cannot be parsed or results in zero.
pub fn extract_server_version(server_version_str: impl AsRef<str>) -> Option<NonZeroI32> {
    let version_part = server_version_str
        .as_ref()
        .split_whitespace()
        .next()
        .unwrap_or("0.0.0");

    let version_part = version_part.split('-').next().unwrap_or("0.0.0");

    let components: Vec<&str> = version_part.split('.').collect();

    let major = components
        .first()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);
    let minor = components
        .get(1)
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);
    let patch = components
        .get(2)
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);

    NonZeroI32::new(major * 10000 + minor * 100 + patch)
}
