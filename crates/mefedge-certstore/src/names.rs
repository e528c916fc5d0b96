//! Managed certificate names.

use std::fmt;
use std::str::FromStr;

use crate::error::CertStoreError;

/// Fixed set of certificate names the node manages. Each name owns one
/// root CA slot, one optional CRL and one optional service cert/key
/// pair on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CertName {
    Northern,
    Software,
    Image,
    WsServer,
    WsClient,
    Inner,
    Nginx,
}

impl CertName {
    pub const ALL: [CertName; 7] = [
        CertName::Northern,
        CertName::Software,
        CertName::Image,
        CertName::WsServer,
        CertName::WsClient,
        CertName::Inner,
        CertName::Nginx,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CertName::Northern => "northern",
            CertName::Software => "software",
            CertName::Image => "image",
            CertName::WsServer => "ws_server",
            CertName::WsClient => "ws_client",
            CertName::Inner => "inner",
            CertName::Nginx => "nginx",
        }
    }
}

impl fmt::Display for CertName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertName {
    type Err = CertStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CertName::ALL
            .into_iter()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| CertStoreError::NotFound(format!("unknown cert name: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for name in CertName::ALL {
            assert_eq!(name.as_str().parse::<CertName>().unwrap(), name);
        }
    }

    #[test]
    fn unknown_name_rejected() {
        assert!("bogus".parse::<CertName>().is_err());
    }
}
