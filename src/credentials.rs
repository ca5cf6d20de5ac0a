//! Password policy, PIN and password generation, and secret hashing.
use bcrypt::{hash, verify, DEFAULT_COST};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// bcrypt only looks at the first 72 bytes.
pub const MAX_PASSWORD_LENGTH: usize = 72;

pub const MIN_GENERATED_PASSWORD_LENGTH: usize = 12;

pub const DEFAULT_PIN_LENGTH: usize = 6;

const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!@#$%&*-_=+?";

/// PINs may never start with these runs.
const SEQUENTIAL_PREFIXES: &[&str] = &[
    "0123", "1234", "2345", "3456", "4567", "5678", "6789", "9876", "8765", "7654", "6543", "5432",
    "4321", "3210",
];

const KEYBOARD_RUNS: &[&str] = &["qwerty", "azerty", "asdf", "qsdf", "zxcv", "wxcv"];

static COMMON_PASSWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "password", "password1", "123456", "12345678", "123456789", "qwerty", "azerty",
        "abc123", "motdepasse", "letmein", "iloveyou", "admin123", "welcome", "passw0rd",
        "soleil", "bonjour", "ecole123", "school123", "000000", "111111",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{0}")]
    WeakPassword(String),
    #[error("PIN length must be between 4 and 8 digits, got {0}")]
    InvalidPinLength(usize),
    #[error("generated passwords must be 12 to 72 characters long, got {0}")]
    InvalidPasswordLength(usize),
    #[error("hashing failed: {0}")]
    Hashing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordIssue {
    TooShort,
    MissingLowercase,
    MissingUppercase,
    MissingDigit,
    MissingSymbol,
    RepeatedCharacters,
    SequentialPattern,
    LowercaseAndDigitsOnly,
    CommonPassword,
}

impl PasswordIssue {
    /// Penalties lower the score; the rest are suggestions.
    pub fn is_penalty(&self) -> bool {
        matches!(
            self,
            PasswordIssue::RepeatedCharacters
                | PasswordIssue::SequentialPattern
                | PasswordIssue::LowercaseAndDigitsOnly
                | PasswordIssue::CommonPassword
        )
    }

    pub fn message(&self) -> &'static str {
        match self {
            PasswordIssue::TooShort => "use at least 8 characters",
            PasswordIssue::MissingLowercase => "add lowercase letters",
            PasswordIssue::MissingUppercase => "add uppercase letters",
            PasswordIssue::MissingDigit => "add digits",
            PasswordIssue::MissingSymbol => "add symbols",
            PasswordIssue::RepeatedCharacters => "avoid repeating the same character",
            PasswordIssue::SequentialPattern => "avoid sequences such as abc or 123",
            PasswordIssue::LowercaseAndDigitsOnly => "mix in uppercase letters or symbols",
            PasswordIssue::CommonPassword => "this password is too common",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PasswordStrength {
    /// 0..=7
    pub score: u8,
    pub is_strong: bool,
    pub issues: Vec<PasswordIssue>,
}

impl PasswordStrength {
    pub fn has(&self, issue: PasswordIssue) -> bool {
        self.issues.contains(&issue)
    }
}

pub fn check_password_strength(password: &str) -> PasswordStrength {
    let len = password.chars().count();
    let mut score: i32 = 0;
    let mut issues = Vec::new();

    for threshold in [8, 12, 16] {
        if len >= threshold {
            score += 1;
        }
    }
    if len < MIN_PASSWORD_LENGTH {
        issues.push(PasswordIssue::TooShort);
    }

    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| !c.is_alphanumeric());
    for (present, missing) in [
        (has_lower, PasswordIssue::MissingLowercase),
        (has_upper, PasswordIssue::MissingUppercase),
        (has_digit, PasswordIssue::MissingDigit),
        (has_symbol, PasswordIssue::MissingSymbol),
    ] {
        if present {
            score += 1;
        } else {
            issues.push(missing);
        }
    }

    if has_repeated_run(password, 3) {
        issues.push(PasswordIssue::RepeatedCharacters);
    }
    if has_sequential_run(password) {
        issues.push(PasswordIssue::SequentialPattern);
    }
    if !password.is_empty() && !has_upper && !has_symbol {
        issues.push(PasswordIssue::LowercaseAndDigitsOnly);
    }
    if COMMON_PASSWORDS.contains(password.to_lowercase().as_str()) {
        issues.push(PasswordIssue::CommonPassword);
    }

    let penalties = issues.iter().filter(|i| i.is_penalty()).count() as i32;
    let score = (score - penalties).max(0) as u8;
    PasswordStrength {
        score,
        is_strong: score >= 5 && penalties == 0,
        issues,
    }
}

/// Policy applied before an account is created.
pub fn validate_password(password: &str) -> Result<(), CredentialError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(CredentialError::WeakPassword(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(CredentialError::WeakPassword(format!(
            "password must be at most {} bytes",
            MAX_PASSWORD_LENGTH
        )));
    }
    if !password.chars().any(|c| c.is_alphabetic()) || !password.chars().any(|c| c.is_ascii_digit())
    {
        return Err(CredentialError::WeakPassword(
            "password must contain letters and digits".to_string(),
        ));
    }
    if COMMON_PASSWORDS.contains(password.to_lowercase().as_str()) {
        return Err(CredentialError::WeakPassword(
            "password is too common".to_string(),
        ));
    }
    Ok(())
}

fn has_repeated_run(s: &str, run: usize) -> bool {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(run).any(|w| w.iter().all(|c| *c == w[0]))
}

fn has_sequential_run(s: &str) -> bool {
    let lowered = s.to_lowercase();
    if KEYBOARD_RUNS.iter().any(|run| lowered.contains(run)) {
        return true;
    }
    let chars: Vec<char> = lowered.chars().collect();
    chars.windows(3).any(|w| {
        let same_class = w.iter().all(|c| c.is_ascii_digit())
            || w.iter().all(|c| c.is_ascii_lowercase());
        if !same_class {
            return false;
        }
        let (a, b, c) = (w[0] as i32, w[1] as i32, w[2] as i32);
        (b - a == 1 && c - b == 1) || (a - b == 1 && b - c == 1)
    })
}

/// Whether a numeric PIN is trivially guessable.
pub fn is_weak_pin(pin: &str) -> bool {
    let digits: Vec<char> = pin.chars().collect();
    if digits.is_empty() || !digits.iter().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if digits.iter().all(|c| *c == digits[0]) {
        return true;
    }
    if SEQUENTIAL_PREFIXES.iter().any(|p| pin.starts_with(p)) {
        return true;
    }
    let steps: Vec<i32> = digits
        .windows(2)
        .map(|w| w[1] as i32 - w[0] as i32)
        .collect();
    steps.iter().all(|s| *s == 1) || steps.iter().all(|s| *s == -1)
}

pub fn generate_secure_pin(length: usize) -> Result<String, CredentialError> {
    if !(4..=8).contains(&length) {
        return Err(CredentialError::InvalidPinLength(length));
    }
    let mut rng = rand::thread_rng();
    loop {
        let pin: String = (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        if !is_weak_pin(&pin) {
            return Ok(pin);
        }
    }
}

/// Random password containing every character class and passing the
/// strength check.
pub fn generate_password(length: usize) -> Result<String, CredentialError> {
    if length < MIN_GENERATED_PASSWORD_LENGTH || length > MAX_PASSWORD_LENGTH {
        return Err(CredentialError::InvalidPasswordLength(length));
    }
    let all: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS].concat();
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS]
            .iter()
            .filter_map(|set| set.choose(&mut rng).copied())
            .collect();
        while bytes.len() < length {
            if let Some(b) = all.choose(&mut rng) {
                bytes.push(*b);
            }
        }
        bytes.shuffle(&mut rng);
        let candidate: String = bytes.into_iter().map(char::from).collect();
        if check_password_strength(&candidate).is_strong {
            return Ok(candidate);
        }
    }
}

/// bcrypt on the blocking pool.
pub async fn hash_secret(secret: &str, cost: Option<u32>) -> Result<String, CredentialError> {
    let secret = secret.to_string();
    let cost = cost.unwrap_or(DEFAULT_COST);
    tokio::task::spawn_blocking(move || {
        hash(secret, cost).map_err(|e| CredentialError::Hashing(e.to_string()))
    })
    .await
    .map_err(|e| CredentialError::Hashing(format!("task join error: {}", e)))?
}

pub async fn verify_secret(secret: &str, hashed: &str) -> Result<bool, CredentialError> {
    let secret = secret.to_string();
    let hashed = hashed.to_string();
    tokio::task::spawn_blocking(move || {
        verify(secret, &hashed).map_err(|e| CredentialError::Hashing(e.to_string()))
    })
    .await
    .map_err(|e| CredentialError::Hashing(format!("task join error: {}", e)))?
}
