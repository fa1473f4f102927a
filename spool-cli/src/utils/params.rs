use spool_engine::Headers;
use tracing::debug;

use crate::error::AppError;

/// Parses `Name: value` header arguments into a header map.
///
/// The name is everything before the first ':' and both sides are trimmed.
/// Later occurrences of a header replace earlier ones.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` when an argument has no ':' or an empty
/// name.
pub fn parse_headers(args: &[String]) -> Result<Headers, AppError> {
    let mut headers = Headers::new();
    for arg in args {
        let (name, value) = arg
            .split_once(':')
            .map(|(n, v)| (n.trim(), v.trim()))
            .filter(|(n, _)| !n.is_empty())
            .ok_or_else(|| AppError::InvalidInput(format!("Invalid header format: {arg}")))?;
        debug!(name, "Added header");
        headers.insert(name.to_string(), value.to_string());
    }
    Ok(headers)
}
