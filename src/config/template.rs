//! Placeholder expansion for prompts and file-name patterns.
//!
//! Rendering is whitespace-preserving and strict: referencing a variable
//! that is not bound is an error, not an empty substitution.

use chrono::{DateTime, Datelike, Local, Timelike};
use handlebars::Handlebars;
use serde_json::json;

use super::ConfigError;

fn strict_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry
}

/// Expand the timestamp placeholders `{{year}}`, `{{month}}`, `{{day}}`,
/// `{{hour}}`, `{{minute}}` and `{{second}}` in a file-name pattern.
/// Components are zero-padded to fixed width.
pub fn expand_file_name_pattern(
    pattern: &str,
    now: DateTime<Local>,
) -> Result<String, ConfigError> {
    let registry = strict_registry();
    let data = json!({
        "year": format!("{:04}", now.year()),
        "month": format!("{:02}", now.month()),
        "day": format!("{:02}", now.day()),
        "hour": format!("{:02}", now.hour()),
        "minute": format!("{:02}", now.minute()),
        "second": format!("{:02}", now.second()),
    });
    Ok(registry.render_template(pattern, &data)?)
}

/// Expand `{{response_result_format}}` in a system-prompt template.
pub fn expand_system_prompt(template: &str, format: &str) -> Result<String, ConfigError> {
    let registry = strict_registry();
    let data = json!({ "response_result_format": format });
    Ok(registry.render_template(template, &data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 7, 9, 5, 1).unwrap()
    }

    #[test]
    fn test_file_name_pattern_zero_padded() {
        let name =
            expand_file_name_pattern("run-{{year}}{{month}}{{day}}-{{hour}}{{minute}}{{second}}.log", fixed_now())
                .unwrap();
        assert_eq!(name, "run-20260307-090501.log");
    }

    #[test]
    fn test_unknown_variable_rejected() {
        assert!(expand_file_name_pattern("run-{{fortnight}}.log", fixed_now()).is_err());
    }

    #[test]
    fn test_system_prompt_preserves_whitespace() {
        let rendered = expand_system_prompt(
            "Answer precisely.\n\n  Respond with: {{response_result_format}}\n",
            "one word",
        )
        .unwrap();
        assert_eq!(rendered, "Answer precisely.\n\n  Respond with: one word\n");
    }

    #[test]
    fn test_plain_text_passes_through() {
        let rendered = expand_system_prompt("no placeholders here", "ignored").unwrap();
        assert_eq!(rendered, "no placeholders here");
    }
}
