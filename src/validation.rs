//! Boundary validators. All return `Result<_, ValidationError>` — no panics,
//! no exceptions-as-control-flow. The HTTP layer converts failures to 400s.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Shared patterns used across the boundary.
pub static ACCOUNT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("account name regex"));
pub static API_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9_\-./]*$").expect("api path regex"));
pub static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, value: impl ToString, message: &str) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

// ── Scalar validators ───────────────────────────────────────────────────

pub struct StringRules<'a> {
    pub required: bool,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub pattern: Option<&'a Regex>,
    pub allowed: Option<&'a [&'a str]>,
    pub trim: bool,
}

impl Default for StringRules<'_> {
    fn default() -> Self {
        Self {
            required: true,
            min: None,
            max: None,
            pattern: None,
            allowed: None,
            trim: true,
        }
    }
}

pub fn validate_string(
    field: &str,
    value: Option<&str>,
    rules: &StringRules<'_>,
) -> Result<Option<String>, ValidationError> {
    let raw = match value {
        Some(v) => v,
        None if rules.required => {
            return Err(ValidationError::new(field, "", "is required"));
        }
        None => return Ok(None),
    };
    let s = if rules.trim { raw.trim() } else { raw };
    if rules.required && s.is_empty() {
        return Err(ValidationError::new(field, s, "must not be empty"));
    }
    if let Some(min) = rules.min
        && s.len() < min
    {
        return Err(ValidationError::new(
            field,
            s,
            &format!("must be at least {min} characters"),
        ));
    }
    if let Some(max) = rules.max
        && s.len() > max
    {
        return Err(ValidationError::new(
            field,
            s,
            &format!("must be at most {max} characters"),
        ));
    }
    if let Some(pattern) = rules.pattern
        && !pattern.is_match(s)
    {
        return Err(ValidationError::new(field, s, "has an invalid format"));
    }
    if let Some(allowed) = rules.allowed
        && !allowed.contains(&s)
    {
        return Err(ValidationError::new(
            field,
            s,
            &format!("must be one of: {}", allowed.join(", ")),
        ));
    }
    Ok(Some(s.to_string()))
}

pub fn validate_number(
    field: &str,
    value: Option<i64>,
    required: bool,
    min: Option<i64>,
    max: Option<i64>,
) -> Result<Option<i64>, ValidationError> {
    let n = match value {
        Some(n) => n,
        None if required => return Err(ValidationError::new(field, "", "is required")),
        None => return Ok(None),
    };
    if let Some(min) = min
        && n < min
    {
        return Err(ValidationError::new(
            field,
            n,
            &format!("must be >= {min}"),
        ));
    }
    if let Some(max) = max
        && n > max
    {
        return Err(ValidationError::new(
            field,
            n,
            &format!("must be <= {max}"),
        ));
    }
    Ok(Some(n))
}

pub fn validate_bool(
    field: &str,
    value: Option<&Value>,
    required: bool,
) -> Result<Option<bool>, ValidationError> {
    match value {
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(ValidationError::new(field, other, "must be a boolean")),
        None if required => Err(ValidationError::new(field, "", "is required")),
        None => Ok(None),
    }
}

// ── Dedicated validators ────────────────────────────────────────────────

/// `http`/`https`, parseable, non-empty host.
pub fn validate_endpoint_url(field: &str, raw: &str) -> Result<url::Url, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, raw, "must not be empty"));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| ValidationError::new(field, raw, &format!("is not a valid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::new(field, raw, "must use http or https"));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::new(field, raw, "must include a host"));
    }
    Ok(parsed)
}

/// Upstream API keys are opaque but never this short.
pub fn validate_api_key_format(field: &str, raw: &str) -> Result<String, ValidationError> {
    let key = raw.trim();
    if key.len() < 10 {
        return Err(ValidationError::new(
            field,
            "",
            "must be at least 10 characters",
        ));
    }
    Ok(key.to_string())
}

pub fn validate_json_blob(field: &str, raw: &str) -> Result<Value, ValidationError> {
    serde_json::from_str(raw)
        .map_err(|e| ValidationError::new(field, raw, &format!("is not valid JSON: {e}")))
}

/// Model-mapping objects: non-empty string keys mapped to non-empty strings.
pub fn validate_model_mappings(field: &str, value: &Value) -> Result<(), ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::new(field, value, "must be a JSON object"))?;
    for (k, v) in obj {
        if k.trim().is_empty() {
            return Err(ValidationError::new(field, k, "keys must not be empty"));
        }
        match v.as_str() {
            Some(s) if !s.trim().is_empty() => {}
            _ => {
                return Err(ValidationError::new(
                    field,
                    v,
                    &format!("value for `{k}` must be a non-empty string"),
                ));
            }
        }
    }
    Ok(())
}

pub fn validate_priority(field: &str, value: i64) -> Result<i64, ValidationError> {
    validate_number(field, Some(value), true, Some(0), Some(100)).map(|n| n.unwrap_or(0))
}

pub fn validate_account_name(field: &str, raw: &str) -> Result<String, ValidationError> {
    validate_string(
        field,
        Some(raw),
        &StringRules {
            min: Some(1),
            max: Some(64),
            pattern: Some(&ACCOUNT_NAME_RE),
            ..Default::default()
        },
    )
    .map(|s| s.unwrap_or_default())
}

/// Sanitize an arbitrary name into the account-name alphabet.
/// Used by migrations; empty results fall back to `account`.
pub fn sanitize_account_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "account".to_string()
    } else {
        trimmed
    }
}
