// SPDX-License-Identifier: LGPL-3.0-only

use crate::{utils, OTRError};

/// `InstanceTag` identifies one client (instance) among the possibly many that are logged in on
/// the same account at once.
pub type InstanceTag = u32;

/// `INSTANCE_ZERO` is the zero-tag: "any/unknown instance". It is used before the remote
/// client's tag is known, and by OTRv2 which has no notion of instances.
pub const INSTANCE_ZERO: InstanceTag = 0;

/// `INSTANCE_MIN_VALID` is the smallest valid (non-zero) instance tag value.
pub const INSTANCE_MIN_VALID: InstanceTag = 0x0000_0100;

/// `verify` verifies a raw instance tag value: zero or at least `INSTANCE_MIN_VALID`.
pub fn verify(tag: u32) -> Result<InstanceTag, OTRError> {
    if tag > INSTANCE_ZERO && tag < INSTANCE_MIN_VALID {
        Err(OTRError::ProtocolViolation("Illegal instance tag."))
    } else {
        Ok(tag)
    }
}

/// `random_tag` produces a valid, random instance tag for the local client.
#[must_use]
pub fn random_tag() -> InstanceTag {
    loop {
        let tag = u32::from_be_bytes(utils::random::secure_bytes::<4>());
        if tag >= INSTANCE_MIN_VALID {
            return tag;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{random_tag, verify, INSTANCE_MIN_VALID};

    #[test]
    fn test_verify_zero_tag() {
        assert!(verify(0).is_ok());
    }

    #[test]
    fn test_verify_reserved_range() {
        assert!(verify(1).is_err());
        assert!(verify(0xff).is_err());
        assert!(verify(INSTANCE_MIN_VALID - 1).is_err());
    }

    #[test]
    fn test_verify_valid_range() {
        assert!(verify(INSTANCE_MIN_VALID).is_ok());
        assert!(verify(0x1234_5678).is_ok());
        assert!(verify(u32::MAX).is_ok());
    }

    #[test]
    fn test_random_tag_is_valid() {
        for _ in 0..20 {
            assert!(random_tag() >= INSTANCE_MIN_VALID);
        }
    }
}
