//! UUID functionality with fast random generation.
//!
//! Command ids are version 4 UUIDs, formatted as dashed hex on the wire.
//! This module wraps [`uuid::Uuid`] with generation backed by `fastrand`:
//! command ids only need uniqueness per producing session, not
//! cryptographic unpredictability, so the faster generator is fine.

use std::{fmt, ops::Deref, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::Error;

/// A wrapper around [`uuid::Uuid`] used for command correlation.
///
/// Implements `Deref` to [`uuid::Uuid`], allowing transparent access to
/// the underlying type. Serializes as the hyphenated string form.
#[derive(
    Clone, Copy, Debug, DeserializeFromStr, Eq, Hash, Ord, PartialEq, PartialOrd, SerializeDisplay,
)]
pub struct Uuid(pub uuid::Uuid);

impl Deref for Uuid {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Uuid {
    /// Generates a new random UUID v4 using a fast random number generator.
    #[must_use]
    pub fn fast_v4() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        let uuid = uuid::Builder::from_random_bytes(random_bytes).into_uuid();
        Self(uuid)
    }
}

/// Formats as 32 hexadecimal digits with hyphens,
/// e.g. `550e8400-e29b-41d4-a716-446655440000`.
impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(Self).map_err(Into::into)
    }
}

impl From<Uuid> for uuid::Uuid {
    fn from(value: Uuid) -> Self {
        *value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_v4_round_trips_through_strings() {
        let uuid = Uuid::fast_v4();
        let parsed = uuid.to_string().parse::<Uuid>().unwrap();
        assert_eq!(uuid, parsed);
    }

    #[test]
    fn fast_v4_is_version_4() {
        let uuid = Uuid::fast_v4();
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-uuid".parse::<Uuid>().is_err());
        assert!("".parse::<Uuid>().is_err());
    }
}
