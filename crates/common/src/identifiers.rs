//! Opaque identifiers handed out to clients. All of them are random 128-bit
//! tokens rendered as 32 lowercase hex characters; the textual form is the
//! only thing that ever leaves the process.

use std::{
    fmt,
    str::FromStr,
};

use serde::{
    de::Error as _,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use uuid::Uuid;

macro_rules! declare_opaque_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                // Accept only the simple form we render; a hyphenated UUID in
                // a URL is a sign the client is making ids up.
                anyhow::ensure!(
                    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()),
                    "invalid identifier {s:?}"
                );
                Ok(Self(Uuid::try_parse(s)?))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

declare_opaque_id!(FileId);
declare_opaque_id!(UploadId);
declare_opaque_id!(JobId);
