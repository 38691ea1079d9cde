use crate::error::{QueueError, Result};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a collection name before it is interpolated into DDL/DML.
///
/// The abstract document-store contract in `spec.md` assumes a trusted
/// collection name; once that name is formatted into SQL text (Postgres has
/// no placeholder syntax for identifiers) this crate owns that trust
/// boundary and must enforce it itself.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(QueueError::Configuration(
            "queue collection name must not be empty".into(),
        ));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(QueueError::Configuration(format!(
            "queue collection name {name:?} exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().expect("checked non-empty above");
    let first_ok = first.is_ascii_alphabetic() || first == '_';
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !first_ok || !rest_ok {
        return Err(QueueError::Configuration(format!(
            "queue collection name {name:?} must match ^[A-Za-z_][A-Za-z0-9_]*$"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_identifier("jobs").is_ok());
        assert!(validate_identifier("dead_letters_2").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(validate_identifier("jobs\"; DROP TABLE users; --").is_err());
        assert!(validate_identifier("jobs-2").is_err());
        assert!(validate_identifier("1jobs").is_err());
        assert!(validate_identifier("jobs table").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let long = "a".repeat(64);
        assert!(validate_identifier(&long).is_err());
    }
}
