//! Utility functions for Convoy services.

/// Parse a duration string like "5m", "1h", "30s", "7d" into seconds.
///
/// A bare number is taken as seconds.
pub fn parse_duration_secs(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }

    let Some((split, _)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str.parse().map_err(|_| format!("Invalid number: {num_str}"))?;

    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(format!("Unknown unit: {unit}")),
    };
    num.checked_mul(scale)
        .ok_or_else(|| format!("Duration out of range: {s}"))
}

/// Redact credentials from a connection URL so it can be logged.
///
/// Strings that do not parse as URLs are returned unchanged.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => raw.to_string(),
    }
}
