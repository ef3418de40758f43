use std::sync::OnceLock;

/// Per-file character cap applied before content reaches a prompt.
pub const MAX_FILE_CHARS: usize = 50_000;

const TRUNCATION_MARKER: &str = "\n# ... (truncated)";

/// Prompt-injection phrases and the label they are replaced with.
const INJECTION_PATTERNS: &[(&str, &str)] = &[
    (
        r"(?i)ignore\s+(?:previous|all|above)\s+(?:instructions?|prompts?|commands?)",
        "ignore instruction attempt",
    ),
    (r"(?i)forget\s+(?:everything|all|previous)", "forget instruction attempt"),
    (r"(?i)now\s+(?:act|behave|pretend)\s+(?:as|like)", "role change attempt"),
    (r"(?i)you\s+are\s+now\s+", "identity change attempt"),
    (r"(?i)\bsystem\s*:", "system message attempt"),
    (r"(?i)\bassistant\s*:", "assistant message attempt"),
    (r"(?i)\bhuman\s*:", "human message attempt"),
    (r"(?i)```\s*(?:end|stop|exit|quit)", "escape sequence attempt"),
];

/// Compiled regex cache neutralising prompt-injection markers in untrusted text.
pub struct InputSanitizer {
    patterns: Vec<(regex::Regex, &'static str)>,
    max_chars: usize,
}

impl InputSanitizer {
    /// Compile the built-in patterns. Invalid patterns are skipped with a warning.
    pub fn new(max_chars: usize) -> Self {
        let patterns = INJECTION_PATTERNS
            .iter()
            .filter_map(|(pattern, label)| match regex::Regex::new(pattern) {
                Ok(re) => Some((re, *label)),
                Err(e) => {
                    tracing::warn!(
                        pattern = %pattern,
                        error = %e,
                        "Invalid sanitizer regex, skipping"
                    );
                    None
                }
            })
            .collect();
        Self {
            patterns,
            max_chars,
        }
    }

    /// Process-wide instance with the default cap.
    pub fn shared() -> &'static InputSanitizer {
        static SANITIZER: OnceLock<InputSanitizer> = OnceLock::new();
        SANITIZER.get_or_init(|| InputSanitizer::new(MAX_FILE_CHARS))
    }

    /// Truncate to the character cap and replace every injection marker with a
    /// `# SANITIZED: <label>` comment.
    pub fn sanitize(&self, text: &str) -> String {
        let mut out = match text.char_indices().nth(self.max_chars) {
            Some((cut, _)) => {
                tracing::warn!(
                    chars = text.chars().count(),
                    max = self.max_chars,
                    "Input truncated"
                );
                format!("{}{}", &text[..cut], TRUNCATION_MARKER)
            }
            None => text.to_string(),
        };

        for (re, label) in &self.patterns {
            if re.is_match(&out) {
                tracing::warn!(label = *label, "Prompt-injection marker neutralised");
                out = re
                    .replace_all(&out, format!("# SANITIZED: {label}").as_str())
                    .into_owned();
            }
        }
        out
    }
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(MAX_FILE_CHARS)
    }
}
