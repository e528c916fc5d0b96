//! Composable input validators.
//!
//! Handlers validate untrusted message fields with small check
//! functions chained through `Checker`. The first failing check wins.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::CommonError;

/// Chainable field validator.
pub struct Checker<'a> {
    field: &'a str,
    value: &'a str,
    error: Option<CommonError>,
}

impl<'a> Checker<'a> {
    pub fn new(field: &'a str, value: &'a str) -> Self {
        Self {
            field,
            value,
            error: None,
        }
    }

    pub fn required(mut self) -> Self {
        if self.error.is_none() && self.value.trim().is_empty() {
            self.error = Some(CommonError::ParamInvalid(format!(
                "{} must not be empty",
                self.field
            )));
        }
        self
    }

    pub fn max_len(mut self, max: usize) -> Self {
        if self.error.is_none() && self.value.len() > max {
            self.error = Some(CommonError::ParamInvalid(format!(
                "{} exceeds {} bytes",
                self.field, max
            )));
        }
        self
    }

    pub fn matches(mut self, re: &Regex) -> Self {
        if self.error.is_none() && !re.is_match(self.value) {
            self.error = Some(CommonError::ParamInvalid(format!(
                "{} has invalid format",
                self.field
            )));
        }
        self
    }

    pub fn one_of(mut self, allowed: &[&str]) -> Self {
        if self.error.is_none() && !allowed.contains(&self.value) {
            self.error = Some(CommonError::ParamInvalid(format!(
                "{} must be one of {:?}",
                self.field, allowed
            )));
        }
        self
    }

    pub fn finish(self) -> Result<(), CommonError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// PEM certificate request envelope.
pub static CSR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^-----BEGIN CERTIFICATE REQUEST-----\s.*-----END CERTIFICATE REQUEST-----\s*$")
        .expect("csr regex")
});

/// Lowercase hyphenated uuid.
pub static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("uuid regex")
});

/// File name without separators or traversal.
pub static FILE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,254}$").expect("file name regex"));

/// Dotted IPv4.
pub static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}$").expect("ipv4 regex"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rejects_blank() {
        assert!(Checker::new("name", "  ").required().finish().is_err());
        assert!(Checker::new("name", "ok").required().finish().is_ok());
    }

    #[test]
    fn first_failure_wins() {
        let err = Checker::new("csr", "")
            .required()
            .matches(&CSR_RE)
            .finish()
            .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn csr_envelope_matches() {
        let csr = "-----BEGIN CERTIFICATE REQUEST-----\nMIIB\n-----END CERTIFICATE REQUEST-----\n";
        assert!(Checker::new("csr", csr).matches(&CSR_RE).finish().is_ok());
        assert!(Checker::new("csr", "-----BEGIN X-----")
            .matches(&CSR_RE)
            .finish()
            .is_err());
    }

    #[test]
    fn uuid_and_file_name_shapes() {
        assert!(Checker::new("uuid", "0d9c41e2-97ab-4c57-8f10-3a1b2c3d4e5f")
            .matches(&UUID_RE)
            .finish()
            .is_ok());
        assert!(Checker::new("name", "../etc/passwd")
            .matches(&FILE_NAME_RE)
            .finish()
            .is_err());
        assert!(Checker::new("name", "model.onnx")
            .matches(&FILE_NAME_RE)
            .finish()
            .is_ok());
    }

    #[test]
    fn one_of_enumerated_set() {
        assert!(Checker::new("mode", "upgrade")
            .one_of(&["upgrade", "effect"])
            .finish()
            .is_ok());
        assert!(Checker::new("mode", "sideways")
            .one_of(&["upgrade", "effect"])
            .finish()
            .is_err());
    }
}
