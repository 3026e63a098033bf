pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

/// Returns the provider id to use when configuration leaves it blank.
pub fn resolve_provider_id(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        GEMINI_PROVIDER_ID
    } else {
        trimmed
    }
}
