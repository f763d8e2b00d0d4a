// cinder_common is the main cinder library implementing the protocol shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::IdParseError;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of identifier type prefixes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IdPrefix {
    /// An in-flight upload or download session.
    Session,
    /// A sharable link naming a burnable file.
    Link,
    /// A stored file record.
    File,
    /// An externally provisioned user.
    User,
}

impl IdPrefix {
    /// The textual prefix length in bytes.
    pub const LEN: usize = 2;

    /// Returns the two-character prefix code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Session => "SN",
            Self::Link => "LK",
            Self::File => "FL",
            Self::User => "US",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "SN" => Some(Self::Session),
            "LK" => Some(Self::Link),
            "FL" => Some(Self::File),
            "US" => Some(Self::User),
            _ => None,
        }
    }
}

impl fmt::Display for IdPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

fn split_prefix(value: &str) -> Result<(IdPrefix, &str), IdParseError> {
    let code = value.get(..IdPrefix::LEN).ok_or(IdParseError::Truncated)?;
    let prefix =
        IdPrefix::from_code(code).ok_or_else(|| IdParseError::UnknownPrefix(code.to_string()))?;

    let body = &value[IdPrefix::LEN..];
    if body.is_empty() {
        return Err(IdParseError::MissingBody);
    }

    Ok((prefix, body))
}

macro_rules! typed_id {
    ($(#[$outer:meta])* $name:ident, $prefix:expr) => {
        $(#[$outer])*
        #[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name {
            body: String,
        }

        impl $name {
            /// The type prefix of this identifier kind.
            pub const PREFIX: IdPrefix = $prefix;

            /// Returns the identifier body without its prefix.
            pub fn body(&self) -> &str {
                &self.body
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", Self::PREFIX.code(), self.body)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdParseError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                let (prefix, body) = split_prefix(value)?;

                if prefix != Self::PREFIX {
                    return Err(IdParseError::UnexpectedPrefix {
                        expected: Self::PREFIX.code(),
                        actual: prefix.code().to_string(),
                    });
                }

                Ok(Self {
                    body: body.to_string(),
                })
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::try_from(value.as_str())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::try_from(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

typed_id!(
    /// A `SessionId` names a short-lived upload or download session (`SN`).
    SessionId,
    IdPrefix::Session
);
typed_id!(
    /// A `LinkId` names a sharable, burnable exchange (`LK`).
    LinkId,
    IdPrefix::Link
);
typed_id!(
    /// A `FileId` names a stored file record (`FL`).
    FileId,
    IdPrefix::File
);
typed_id!(
    /// A `UserId` names an externally provisioned user (`US`).
    /// User identifiers are never generated by this service.
    UserId,
    IdPrefix::User
);

impl SessionId {
    /// Generates a fresh session identifier from a v4 UUID.
    pub fn generate() -> Self {
        Self {
            body: Uuid::new_v4().to_string(),
        }
    }
}

impl LinkId {
    /// Generates a fresh link identifier from a v4 UUID.
    pub fn generate() -> Self {
        Self {
            body: Uuid::new_v4().to_string(),
        }
    }
}

impl FileId {
    /// Generates a fresh file identifier from a v4 UUID.
    pub fn generate() -> Self {
        Self {
            body: Uuid::new_v4().to_string(),
        }
    }
}
