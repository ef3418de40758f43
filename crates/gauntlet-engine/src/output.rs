/// Parse provider text into a JSON object carrying every key in `required_keys`.
///
/// Markdown code fences are stripped first. Returns a description of the
/// problem when the text is not usable.
pub fn parse_structured(text: &str, required_keys: &[String]) -> Result<serde_json::Value, String> {
    let cleaned = strip_code_fences(text);
    let value: serde_json::Value = match serde_json::from_str(&cleaned) {
        Ok(v) => v,
        Err(e) => match extract_object(&cleaned).and_then(|s| serde_json::from_str(s).ok()) {
            Some(v) => v,
            None => return Err(format!("output is not valid JSON: {e}")),
        },
    };

    let Some(obj) = value.as_object() else {
        return Err("expected a JSON object".to_string());
    };
    let missing: Vec<&str> = required_keys
        .iter()
        .filter(|k| !obj.contains_key(k.as_str()))
        .map(|k| k.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required key(s): {}", missing.join(", ")));
    }
    Ok(value)
}

/// Instruction appended to the prompt after a malformed reply.
pub fn correction_instruction(problem: &str, required_keys: &[String]) -> String {
    let keys = if required_keys.is_empty() {
        String::new()
    } else {
        format!(" with the keys {}", required_keys.join(", "))
    };
    format!(
        "\n\nYour previous reply could not be used ({problem}). \
         Reply with exactly one JSON object{keys} and nothing else."
    )
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    // Try ```json ... ``` first
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Try ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Outermost `{ ... }` span, for replies that wrap the object in prose.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
