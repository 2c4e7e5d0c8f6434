// SPDX-License-Identifier: LGPL-3.0-only

pub mod alloc {
    #[must_use]
    pub fn vec_unique<T: Ord>(mut src: Vec<T>) -> Vec<T> {
        src.sort_unstable();
        src.dedup();
        src
    }
}

pub mod bytes {
    pub fn verify_nonzero<E>(data: &[u8], error: E) -> Result<(), E> {
        if any_nonzero(data) {
            Ok(())
        } else {
            Err(error)
        }
    }

    #[must_use]
    pub fn any_nonzero(data: &[u8]) -> bool {
        data.iter().any(|b| *b != 0)
    }

    /// `clear` overwrites the buffer with zero-bytes.
    pub fn clear(buffer: &mut [u8]) {
        buffer.fill(0);
    }

    /// `concatenate` concatenates two byte-slices into a new byte-array.
    #[must_use]
    pub fn concatenate(v1: &[u8], v2: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(v1.len() + v2.len());
        buffer.extend_from_slice(v1);
        buffer.extend_from_slice(v2);
        buffer
    }
}

pub mod biguint {
    use num_bigint::BigUint;

    /// `to_bytes_be_fixed` produces the fixed-size big-endian encoding of the value. The value
    /// must fit the requested size.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in `N` bytes.
    #[must_use]
    pub fn to_bytes_be_fixed<const N: usize>(v: &BigUint) -> [u8; N] {
        let bytes = v.to_bytes_be();
        assert!(bytes.len() <= N);
        let mut buffer = [0u8; N];
        buffer[N - bytes.len()..].copy_from_slice(&bytes);
        buffer
    }

    /// `to_bytes_le_fixed` produces the fixed-size little-endian encoding of the value.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in `N` bytes.
    #[must_use]
    pub fn to_bytes_le_fixed<const N: usize>(v: &BigUint) -> [u8; N] {
        let bytes = v.to_bytes_le();
        assert!(bytes.len() <= N);
        let mut buffer = [0u8; N];
        buffer[..bytes.len()].copy_from_slice(&bytes);
        buffer
    }
}

pub mod u32 {
    /// `nonzero` turns zero into `None` and any other value into `Some(value)`.
    #[must_use]
    pub fn nonzero(value: u32) -> Option<u32> {
        if value == 0 {
            None
        } else {
            Some(value)
        }
    }

    /// `verify_nonzero` maps a zero value onto the given error.
    pub fn verify_nonzero<E>(value: u32, error: E) -> Result<(), E> {
        if value == 0 {
            Err(error)
        } else {
            Ok(())
        }
    }
}

/// `random` wraps the process-wide `ring` secure random source.
pub mod random {
    use once_cell::sync::Lazy;
    use ring::rand::{SecureRandom, SystemRandom};

    pub static RANDOM: Lazy<SystemRandom> = Lazy::new(SystemRandom::new);

    /// `secure_bytes` draws an `N`-byte array from the secure random generator.
    ///
    /// # Panics
    ///
    /// Panics if the system random source fails.
    #[must_use]
    pub fn secure_bytes<const N: usize>() -> [u8; N] {
        let mut bytes = [0u8; N];
        fill_secure_bytes(&mut bytes);
        bytes
    }

    /// `fill_secure_bytes` overwrites the buffer with output of the secure random generator.
    ///
    /// # Panics
    ///
    /// Panics if the system random source fails.
    pub fn fill_secure_bytes(buffer: &mut [u8]) {
        RANDOM
            .fill(buffer)
            .expect("BUG: failed to produce random bytes");
    }
}

pub mod time {
    /// `unix_seconds_now` is the current time in seconds since the UNIX epoch.
    ///
    /// # Panics
    ///
    /// Panics if the system clock reports a time before the epoch.
    #[must_use]
    pub fn unix_seconds_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("BUG: system clock before UNIX epoch")
            .as_secs()
    }
}
