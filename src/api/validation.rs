use regex::Regex;
use serde::Serialize;

/// One field-level validation problem
#[derive(Debug, Clone, Serialize)]
pub struct FieldIssue {
    pub field: &'static str,
    pub message: String,
}

fn issue(field: &'static str, message: impl Into<String>) -> FieldIssue {
    FieldIssue {
        field,
        message: message.into(),
    }
}

/// 3-50 characters from `[A-Za-z0-9_-]`
pub fn validate_username(username: &str) -> Option<FieldIssue> {
    let pattern = Regex::new(r"^[A-Za-z0-9_-]{3,50}$").expect("static pattern");
    if pattern.is_match(username) {
        None
    } else {
        Some(issue(
            "username",
            "username must be 3-50 characters of letters, digits, underscore or dash",
        ))
    }
}

/// Plausible address shape, at most 254 characters
pub fn validate_email(email: &str) -> Option<FieldIssue> {
    if email.len() > 254 {
        return Some(issue("email", "email must be at most 254 characters"));
    }
    let pattern = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static pattern");
    if pattern.is_match(email) {
        None
    } else {
        Some(issue("email", "email address is not valid"))
    }
}

const WEAK_PATTERNS: [&str; 5] = ["123", "abc", "qwe", "password", "admin"];

/// 8-128 characters with upper, lower, digit and special characters, no
/// run of three identical characters, and no well-known weak pattern
/// anywhere in it.
pub fn validate_password(password: &str) -> Vec<FieldIssue> {
    let mut issues = Vec::new();

    if password.len() < 8 || password.len() > 128 {
        issues.push(issue("password", "password must be 8-128 characters"));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        issues.push(issue("password", "password must contain an uppercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        issues.push(issue("password", "password must contain a lowercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        issues.push(issue("password", "password must contain a digit"));
    }
    if !password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        issues.push(issue("password", "password must contain a special character"));
    }

    let chars: Vec<char> = password.chars().collect();
    if chars.windows(3).any(|w| w[0] == w[1] && w[1] == w[2]) {
        issues.push(issue(
            "password",
            "password must not repeat the same character three times",
        ));
    }

    let lowered = password.to_ascii_lowercase();
    if WEAK_PATTERNS.iter().any(|weak| lowered.contains(weak)) {
        issues.push(issue("password", "password contains a well-known pattern"));
    }

    issues
}

/// Validate the whole registration payload, collecting per-field issues
pub fn validate_registration(
    username: &str,
    email: &str,
    password: &str,
    confirm_password: &str,
) -> Vec<FieldIssue> {
    let mut issues = Vec::new();

    if let Some(problem) = validate_username(username) {
        issues.push(problem);
    }
    if let Some(problem) = validate_email(email) {
        issues.push(problem);
    }
    issues.extend(validate_password(password));

    if password != confirm_password {
        issues.push(issue("confirmPassword", "passwords do not match"));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_strong_registration() {
        let issues = validate_registration(
            "testuser",
            "test@example.com",
            "TestSecret742!",
            "TestSecret742!",
        );
        assert!(issues.is_empty(), "unexpected issues: {:?}", issues);
    }

    #[test]
    fn rejects_weak_password() {
        let issues = validate_password("weak");
        assert!(!issues.is_empty());

        // Too short, no upper, no digit, no special
        assert!(issues.len() >= 4);
    }

    #[test]
    fn rejects_password_mismatch() {
        let issues = validate_registration(
            "testuser",
            "test@example.com",
            "TestSecret742!",
            "OtherSecret963!",
        );
        assert!(issues.iter().any(|i| i.field == "confirmPassword"));
    }

    #[test]
    fn rejects_repeated_character_runs() {
        let issues = validate_password("Gooodpass1!");
        assert!(issues
            .iter()
            .any(|i| i.message.contains("three times")));
    }

    #[test]
    fn rejects_well_known_patterns_anywhere() {
        // Leading, embedded and trailing occurrences all count
        for weak in [
            "Password987!x",
            "Admin654!xyz",
            "Qwerty654!xy",
            "123Adequate!x",
            "abcDefgh1!x",
            "Valid1!qwe",
            "MyPassword9!",
            "X1!abcDef",
            "Grown9!admin",
        ] {
            let issues = validate_password(weak);
            assert!(
                issues.iter().any(|i| i.message.contains("well-known")),
                "{} should be rejected",
                weak
            );
        }

        assert!(!validate_password("Valid1!qwe").is_empty());
    }

    #[test]
    fn username_charset_and_length() {
        assert!(validate_username("ab").is_some());
        assert!(validate_username("has space").is_some());
        assert!(validate_username("ok_user-1").is_none());
        assert!(validate_username(&"x".repeat(51)).is_some());
    }

    #[test]
    fn email_shape_and_length() {
        assert!(validate_email("test@example.com").is_none());
        assert!(validate_email("not-an-email").is_some());
        assert!(validate_email("a b@example.com").is_some());
        let long = format!("{}@example.com", "x".repeat(250));
        assert!(validate_email(&long).is_some());
    }
}
