//! Room code format (`abc-1234-xyz`)

use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static ROOM_CODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z]{3}-[a-z0-9]{4}-[a-z]{3}$").ok());

/// A validated room code
///
/// Only codes of the form `[a-z]{3}-[a-z0-9]{4}-[a-z]{3}` can be constructed,
/// so holding a `RoomCode` means the format check already passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Validate and wrap a room code
    ///
    /// # Example
    ///
    /// ```
    /// use vido_mesh::RoomCode;
    ///
    /// assert!(RoomCode::parse("abc-1234-xyz").is_ok());
    /// assert!(RoomCode::parse("ABC123").is_err());
    /// ```
    pub fn parse(code: &str) -> Result<Self> {
        let matches = ROOM_CODE
            .as_ref()
            .map(|re| re.is_match(code))
            .unwrap_or(false);

        if matches {
            Ok(Self(code.to_string()))
        } else {
            Err(Error::InvalidRoomCode(code.to_string()))
        }
    }

    /// The code as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_codes() {
        for code in ["abc-1234-xyz", "abc-defg-hij", "zzz-0a0a-aaa"] {
            assert!(RoomCode::parse(code).is_ok(), "{} should be valid", code);
        }
    }

    #[test]
    fn test_invalid_codes() {
        for code in [
            "ABC123",
            "",
            "abc-1234-xy",
            "abc-12345-xyz",
            "Abc-1234-xyz",
            "abc-1234-xy1",
            "abc_1234_xyz",
            " abc-1234-xyz",
            "abc-1234-xyz\n",
        ] {
            assert!(
                matches!(RoomCode::parse(code), Err(Error::InvalidRoomCode(_))),
                "{:?} should be rejected",
                code
            );
        }
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let ok: RoomCode = serde_json::from_str("\"abc-1234-xyz\"").unwrap();
        assert_eq!(ok.as_str(), "abc-1234-xyz");
        assert!(serde_json::from_str::<RoomCode>("\"nope\"").is_err());
    }
}
