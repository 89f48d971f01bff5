//! Strongly-typed identifiers used across the domain.
//!
//! Both ids mirror `BIGINT` keys in the persistence layer, so they wrap `i64`
//! rather than an unsigned type.

use serde::{Deserialize, Serialize};

/// Identifier of a source file (shared by its migration record).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(i64);

/// Identifier of a migration range row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeId(i64);

macro_rules! impl_i64_newtype {
    ($t:ty) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_i64_newtype!(FileId);
impl_i64_newtype!(RangeId);
