use std::str::FromStr;

use crate::error::{Result, TransferError};

/// Query parameter carrying the transfer id in approval deep links.
pub const TRANSFER_ID_PARAM: &str = "transfer_id";
const TRANSFER_ID_PARAM_ALIAS: &str = "transferId";

/// Deep link that resumes the approver flow on an enrolled device, e.g.
/// `vaultbridge://transfer/approve?transfer_id=t1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLink {
    pub transfer_id: String,
}

impl TransferLink {
    pub fn parse(uri: &str) -> Result<Self> {
        let without_fragment = uri.split('#').next().unwrap_or_default();
        let (_, query) = without_fragment
            .split_once('?')
            .ok_or_else(|| TransferError::InvalidLink("missing query string".into()))?;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = percent_decode(key)?;
            if key != TRANSFER_ID_PARAM && key != TRANSFER_ID_PARAM_ALIAS {
                continue;
            }

            let transfer_id = percent_decode(value)?;
            if transfer_id.trim().is_empty() {
                return Err(TransferError::InvalidLink("empty transfer id".into()));
            }
            return Ok(Self { transfer_id });
        }

        Err(TransferError::InvalidLink(format!(
            "no {} parameter",
            TRANSFER_ID_PARAM
        )))
    }
}

impl FromStr for TransferLink {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| TransferError::InvalidLink("truncated percent escape".into()))?;
            let byte = hex::decode(hex)
                .map_err(|e| TransferError::InvalidLink(format!("bad percent escape: {}", e)))?;
            decoded.extend(byte);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(decoded).map_err(|e| TransferError::InvalidLink(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transfer_link() {
        let link = TransferLink::parse("vaultbridge://transfer/approve?transfer_id=t1").unwrap();
        assert_eq!(link.transfer_id, "t1");
    }

    #[test]
    fn test_parse_accepts_alias_and_other_params() {
        let link: TransferLink = "https://vault.example/t?src=push&transferId=abc%2D42#top"
            .parse()
            .unwrap();
        assert_eq!(link.transfer_id, "abc-42");
    }

    #[test]
    fn test_parse_rejects_missing_or_empty_id() {
        assert!(TransferLink::parse("vaultbridge://transfer/approve").is_err());
        assert!(TransferLink::parse("vaultbridge://transfer/approve?transfer_id=").is_err());
        assert!(TransferLink::parse("vaultbridge://transfer/approve?other=1").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_escape() {
        let err = TransferLink::parse("vaultbridge://t?transfer_id=%zz").unwrap_err();
        assert!(matches!(err, TransferError::InvalidLink(_)));
    }
}
