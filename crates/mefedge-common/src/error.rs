//! Response status codes shared across subsystems.
//!
//! Every operation handler answers the cloud with a `RespMsg` whose
//! status is one of these kinds. The numeric values are part of the
//! wire contract and must stay stable.

use serde::{Deserialize, Serialize};

/// Stable status codes carried in cloud-facing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum RespCode {
    Success,
    ParamConvert,
    ParamInvalid,
    GetRootCa,
    SaveCa,
    DeleteRootCa,
    IssueSrvCert,
    SaveCrl,
    CertTypeError,
    NotFound,
    AlreadyHeld,
    Timeout,
    DiskFull,
    Internal,
}

impl RespCode {
    /// Numeric wire value.
    pub fn code(self) -> u32 {
        match self {
            RespCode::Success => 0,
            RespCode::ParamConvert => 1001,
            RespCode::ParamInvalid => 1002,
            RespCode::GetRootCa => 2001,
            RespCode::SaveCa => 2002,
            RespCode::DeleteRootCa => 2003,
            RespCode::IssueSrvCert => 2004,
            RespCode::SaveCrl => 2005,
            RespCode::CertTypeError => 2006,
            RespCode::NotFound => 3001,
            RespCode::AlreadyHeld => 3002,
            RespCode::Timeout => 3003,
            RespCode::DiskFull => 3004,
            RespCode::Internal => 9999,
        }
    }
}

impl From<RespCode> for u32 {
    fn from(c: RespCode) -> u32 {
        c.code()
    }
}

impl TryFrom<u32> for RespCode {
    type Error = String;

    fn try_from(v: u32) -> Result<Self, String> {
        const ALL: [RespCode; 14] = [
            RespCode::Success,
            RespCode::ParamConvert,
            RespCode::ParamInvalid,
            RespCode::GetRootCa,
            RespCode::SaveCa,
            RespCode::DeleteRootCa,
            RespCode::IssueSrvCert,
            RespCode::SaveCrl,
            RespCode::CertTypeError,
            RespCode::NotFound,
            RespCode::AlreadyHeld,
            RespCode::Timeout,
            RespCode::DiskFull,
            RespCode::Internal,
        ];
        ALL.into_iter()
            .find(|c| c.code() == v)
            .ok_or_else(|| format!("unknown response code: {v}"))
    }
}

/// Errors raised by the shared building blocks in this crate.
#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("both primary and backup are missing or unreadable: {0}")]
    ContentMissing(String),

    #[error("lock already held by pid {pid}: {reason}")]
    AlreadyHeld { pid: u32, reason: String },

    #[error("subprocess timed out after {0}s")]
    Timeout(u64),

    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("path does not exist: {0}")]
    PathNotExist(String),

    #[error("db error: {0}")]
    Db(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for CommonError {
    fn from(e: rusqlite::Error) -> Self {
        CommonError::Db(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resp_codes_round_trip() {
        for code in [RespCode::Success, RespCode::SaveCrl, RespCode::Internal] {
            let n = code.code();
            assert_eq!(RespCode::try_from(n).unwrap(), code);
        }
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(RespCode::try_from(424242).is_err());
    }

    #[test]
    fn success_is_zero() {
        assert_eq!(RespCode::Success.code(), 0);
    }
}
