//! Locating the JSON payload inside model output.

use serde::de::DeserializeOwned;

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Parse model output into `T`, accepting either the bare object or one
/// nested under `envelope` (e.g. `{"triage_email_lead": {...}}`).
pub fn parse_enveloped<T: DeserializeOwned>(raw: &str, envelope: &str) -> Result<T, String> {
    let json_str = extract_json_object(raw);
    let mut value: serde_json::Value =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    if let Some(inner) = value.get_mut(envelope) {
        value = inner.take();
    }

    serde_json::from_value(value).map_err(|e| format!("schema mismatch: {e}"))
}
