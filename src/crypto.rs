// SPDX-License-Identifier: LGPL-3.0-only

//! Cryptographic primitives, grouped per algorithm. The protocol engines consume these modules
//! as pure functions; all state machines live elsewhere.

/// `CryptoError` is the error type for cryptographic failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// Verification failure of some cryptographic requirement: a signature, MAC or hash did not
    /// match, or a value failed its range or group-membership check.
    VerificationFailure(&'static str),
}

pub mod constant {
    use super::CryptoError;

    /// `verify` compares two equal-length byte-slices in constant time.
    ///
    /// # Panics
    ///
    /// Panics when the same slice is provided twice, as this is indicative of a programming
    /// error.
    pub fn verify(expected: &[u8], actual: &[u8]) -> Result<(), CryptoError> {
        assert!(!core::ptr::eq(expected, actual));
        ring::constant_time::verify_slices_are_equal(expected, actual).or(Err(
            CryptoError::VerificationFailure("value does not match expected value"),
        ))
    }

    /// `verify_scalars` compares two Ed448 scalar values in constant time.
    pub fn verify_scalars(
        expected: &num_bigint::BigUint,
        actual: &num_bigint::BigUint,
    ) -> Result<(), CryptoError> {
        let b1 = crate::utils::biguint::to_bytes_le_fixed::<57>(expected);
        let b2 = crate::utils::biguint::to_bytes_le_fixed::<57>(actual);
        ring::constant_time::verify_slices_are_equal(&b1, &b2).or(Err(
            CryptoError::VerificationFailure("scalar does not match expected scalar"),
        ))
    }

    /// `verify_points` compares two Ed448 points by their encoding in constant time.
    pub fn verify_points(
        expected: &super::ed448::Point,
        actual: &super::ed448::Point,
    ) -> Result<(), CryptoError> {
        ring::constant_time::verify_slices_are_equal(&expected.encode(), &actual.encode()).or(
            Err(CryptoError::VerificationFailure(
                "point does not match expected point",
            )),
        )
    }
}

pub mod sha1 {
    /// `digest` is the plain 20-byte SHA-1 digest.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; 20] {
        let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        let mut result = [0u8; 20];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// `hmac` is SHA1-HMAC under the given MAC key, as data messages are authenticated.
    #[must_use]
    pub fn hmac(mk: &[u8], data: &[u8]) -> [u8; 20] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, mk);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 20];
        result.clone_from_slice(digest.as_ref());
        result
    }
}

pub mod sha256 {
    /// `digest` is the plain 32-byte SHA-256 digest.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; 32] {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut result = [0u8; 32];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// `digest_with_prefix` hashes a single version byte followed by the data; the SMP proofs
    /// tag each challenge hash this way.
    #[must_use]
    pub fn digest_with_prefix(prefix: u8, data: &[u8]) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        bytes.push(prefix);
        bytes.extend_from_slice(data);
        digest(&bytes)
    }

    /// `hmac` is full-width SHA256-HMAC, keyed with `m1`/`m1'` during the AKE.
    #[must_use]
    pub fn hmac(m1: &[u8], data: &[u8]) -> [u8; 32] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m1);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 32];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// `hmac160` is SHA256-HMAC truncated to its first 20 bytes, keyed with `m2`/`m2'` during
    /// the AKE.
    #[must_use]
    pub fn hmac160(m2: &[u8], data: &[u8]) -> [u8; 20] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m2);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 20];
        result.clone_from_slice(&digest.as_ref()[..20]);
        result
    }
}

pub mod shake256 {
    use sha3::{
        digest::{ExtendableOutput, Update, XofReader},
        Shake256,
    };

    /// `digest` calculates a SHAKE-256 digest of the requested size.
    #[must_use]
    pub fn digest<const N: usize>(data: &[u8]) -> [u8; N] {
        let mut hasher = Shake256::default();
        hasher.update(data);
        let mut reader = hasher.finalize_xof();
        let mut result = [0u8; N];
        reader.read(&mut result);
        result
    }
}

#[allow(non_snake_case)]
pub mod aes128 {
    use aes_ctr::{
        cipher::{generic_array::GenericArray, NewStreamCipher, SyncStreamCipher},
        Aes128Ctr,
    };

    use crate::utils;

    pub const KEY_LENGTH: usize = 16;

    /// `Key` is an AES-128 key. The key is zeroed from memory on drop.
    #[derive(Clone)]
    pub struct Key(pub [u8; KEY_LENGTH]);

    impl Drop for Key {
        fn drop(&mut self) {
            utils::bytes::clear(&mut self.0);
        }
    }

    impl Key {
        #[must_use]
        pub fn generate() -> Self {
            Self(utils::random::secure_bytes::<KEY_LENGTH>())
        }

        #[must_use]
        pub fn encrypt(&self, ctr: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(ctr, data)
        }

        #[must_use]
        pub fn decrypt(&self, ctr: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(ctr, data)
        }

        /// Counter mode applies the same keystream in both directions, so one routine covers
        /// encryption and decryption alike.
        fn crypt(&self, ctr: &[u8; 16], data: &[u8]) -> Vec<u8> {
            let mut result = Vec::from(data);
            let key = GenericArray::from_slice(&self.0);
            let nonce = GenericArray::from_slice(ctr);
            let mut cipher = Aes128Ctr::new(key, nonce);
            cipher.apply_keystream(result.as_mut_slice());
            result
        }
    }
}

#[allow(non_snake_case)]
pub mod dh {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    use crate::utils;

    use super::CryptoError;

    /// `GENERATOR` (g) of the 1536-bit MODP group: 2
    pub static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

    /// `MODULUS` (p) is the 1536-bit MODP group prime from RFC 3526 as prescribed by OTR.
    pub static MODULUS: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(
            b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
              020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
              4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
              EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
              98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
              9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF",
            16,
        )
        .expect("BUG: failed to parse hard-coded modulus")
    });

    /// `MODULUS_MINUS_TWO`: p - 2, upper bound (inclusive) for valid public keys.
    pub static MODULUS_MINUS_TWO: Lazy<BigUint> = Lazy::new(|| &*MODULUS - BigUint::from(2u8));

    /// `Q`: the order of the prime-order subgroup, (p - 1) / 2, as used by SMP.
    pub static Q: Lazy<BigUint> = Lazy::new(|| (&*MODULUS - BigUint::from(1u8)) >> 1u8);

    /// Private exponents are 320 bits, as prescribed by OTR.
    const PRIVATE_KEY_LENGTH: usize = 40;

    /// `verify_public_key` verifies that the public key is a legal group element:
    /// `2 <= y <= p - 2`.
    pub fn verify_public_key(public_key: &BigUint) -> Result<(), CryptoError> {
        if public_key >= &*GENERATOR && public_key <= &*MODULUS_MINUS_TWO {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "DH public key fails verification",
            ))
        }
    }

    /// `verify_exponent` verifies that a scalar is a legal (non-zero) exponent: `1 <= x < q`.
    pub fn verify_exponent(component: &BigUint) -> Result<(), CryptoError> {
        if component >= &BigUint::from(1u8) && component < &*Q {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "DH exponent fails verification",
            ))
        }
    }

    /// `random` produces a random 1536-bit exponent for use in the MODP group.
    #[must_use]
    pub fn random() -> BigUint {
        let mut bytes = [0u8; 192];
        utils::random::fill_secure_bytes(&mut bytes);
        let v = BigUint::from_bytes_be(&bytes);
        utils::bytes::clear(&mut bytes);
        v
    }

    /// `Keypair` is a DH-1536 keypair.
    #[derive(Clone)]
    pub struct Keypair {
        private: BigUint,
        pub public: BigUint,
    }

    /// `SharedSecret` is the result of the DH key exchange.
    pub type SharedSecret = BigUint;

    impl Keypair {
        /// `generate` generates a new DH keypair with a 320-bit private exponent.
        #[must_use]
        pub fn generate() -> Self {
            let private =
                BigUint::from_bytes_be(&utils::random::secure_bytes::<PRIVATE_KEY_LENGTH>());
            let public = GENERATOR.modpow(&private, &MODULUS);
            Self { private, public }
        }

        /// `generate_shared_secret` computes the shared secret `g^xy` from our private key and
        /// their public key. The public key must have been verified before use.
        #[must_use]
        pub fn generate_shared_secret(&self, public_key: &BigUint) -> SharedSecret {
            public_key.modpow(&self.private, &MODULUS)
        }
    }

    impl Drop for Keypair {
        fn drop(&mut self) {
            self.private = BigUint::default();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::{verify_public_key, Keypair, GENERATOR, MODULUS, MODULUS_MINUS_TWO, Q};
        use num_bigint::BigUint;

        #[test]
        fn test_shared_secrets_match() {
            let a = Keypair::generate();
            let b = Keypair::generate();
            assert_eq!(
                a.generate_shared_secret(&b.public),
                b.generate_shared_secret(&a.public)
            );
        }

        #[test]
        fn test_verify_public_key_bounds() {
            assert!(verify_public_key(&BigUint::from(0u8)).is_err());
            assert!(verify_public_key(&BigUint::from(1u8)).is_err());
            assert!(verify_public_key(&BigUint::from(2u8)).is_ok());
            assert!(verify_public_key(&MODULUS_MINUS_TWO).is_ok());
            assert!(verify_public_key(&(&*MODULUS - BigUint::from(1u8))).is_err());
            assert!(verify_public_key(&MODULUS).is_err());
        }

        #[test]
        fn test_subgroup_order() {
            // g^q == 1 (mod p) for generator 2 of the safe-prime group.
            assert_eq!(
                BigUint::from(1u8),
                GENERATOR.modpow(&Q, &MODULUS),
            );
        }
    }
}

pub mod dsa {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    use crate::utils;

    use super::CryptoError;

    /// Signature is the 40-byte DSA signature: `r` and `s`, each 20 bytes big-endian.
    pub const SIGNATURE_LENGTH: usize = 40;
    const PARAM_LENGTH: usize = 20;

    pub type Signature = [u8; SIGNATURE_LENGTH];

    // Fixed 1024-bit/160-bit DSA domain parameters, in the same spirit as OTR's fixed DH group.
    static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(
            b"85D2088956EA6056297B3B09EC36D9B166175538B2F47F2AA4095A7CC36C8831\
              66B904CB451CC92D37C6EE2C180A21D9FEB453FA1C1DA5976379F42357F8D0E7\
              88CBC776B9EB239D4A63A1DCE381D8ABF57D56E3DB64C2C391680089693F2086\
              677A4A4795D1A1BCA81EF36EDA6B11B83F07273714A2C58D82C859ACC1729455",
            16,
        )
        .expect("BUG: failed to parse hard-coded DSA parameter p")
    });
    static Q: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(b"B2A452761F58F0043E9EA9E3CF9F8402CD923E31", 16)
            .expect("BUG: failed to parse hard-coded DSA parameter q")
    });
    static G: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(
            b"62DF78FFAE566444F8D78E82B4C627D0700EC4238ADF0C00E2AFDDD31E6322EC\
              5667FAB5317A9BFF003071560B8CB38DFB85512CE80B1602E3F53AFDB44861DF\
              6CCDC72FF8859B745829A3651867FDBDCD41FE4399ED8647EF1791376E7788C9\
              CA38A062BDAEDAE153B070177C13076D0514514AC48D79F3ED2E9DCF21C89952",
            16,
        )
        .expect("BUG: failed to parse hard-coded DSA parameter g")
    });

    /// `Keypair` is a DSA keypair: the long-term identity of an OTRv2/OTRv3 client.
    pub struct Keypair {
        x: BigUint,
        public: PublicKey,
    }

    impl Keypair {
        /// `generate` generates a new DSA keypair over the fixed domain parameters.
        #[must_use]
        pub fn generate() -> Self {
            let x = random_in_q();
            let y = G.modpow(&x, &P);
            Self {
                x,
                public: PublicKey {
                    p: P.clone(),
                    q: Q.clone(),
                    g: G.clone(),
                    y,
                },
            }
        }

        #[must_use]
        pub fn public_key(&self) -> &PublicKey {
            &self.public
        }

        /// `sign` produces a DSA signature over the provided 32-byte digest. The digest value is
        /// interpreted as a number and taken modulo q, not truncated.
        #[must_use]
        pub fn sign(&self, digest: &[u8; 32]) -> Signature {
            let h = BigUint::from_bytes_be(digest) % &*Q;
            loop {
                let k = random_in_q();
                let r = G.modpow(&k, &P) % &*Q;
                if r == BigUint::default() {
                    continue;
                }
                let Some(kinv) = k.modinv(&Q) else {
                    continue;
                };
                let s = kinv * (&h + &self.x * &r) % &*Q;
                if s == BigUint::default() {
                    continue;
                }
                let mut signature = [0u8; SIGNATURE_LENGTH];
                signature[..PARAM_LENGTH]
                    .copy_from_slice(&utils::biguint::to_bytes_be_fixed::<PARAM_LENGTH>(&r));
                signature[PARAM_LENGTH..]
                    .copy_from_slice(&utils::biguint::to_bytes_be_fixed::<PARAM_LENGTH>(&s));
                return signature;
            }
        }
    }

    impl Drop for Keypair {
        fn drop(&mut self) {
            self.x = BigUint::default();
        }
    }

    /// `PublicKey` is the public component of a DSA keypair, i.e. parameters and `y = g^x`.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct PublicKey {
        pub p: BigUint,
        pub q: BigUint,
        pub g: BigUint,
        pub y: BigUint,
    }

    impl PublicKey {
        /// `from_components` reconstructs a public key from its four MPI components, with basic
        /// sanity checks on the parameters.
        pub fn from_components(
            p: BigUint,
            q: BigUint,
            g: BigUint,
            y: BigUint,
        ) -> Result<Self, CryptoError> {
            if q.bits() > 160 {
                return Err(CryptoError::VerificationFailure(
                    "DSA public key: q exceeds 160 bits",
                ));
            }
            if g <= BigUint::from(1u8) || g >= p || y <= BigUint::from(1u8) || y >= p {
                return Err(CryptoError::VerificationFailure(
                    "DSA public key: component out of range",
                ));
            }
            Ok(Self { p, q, g, y })
        }

        /// `fingerprint` is the SHA-1 digest over the byte-level public key representation,
        /// without the leading key-type bytes.
        #[must_use]
        pub fn fingerprint(&self) -> [u8; 20] {
            let encoded = crate::encoding::OTREncoder::new()
                .write_mpi(&self.p)
                .write_mpi(&self.q)
                .write_mpi(&self.g)
                .write_mpi(&self.y)
                .to_vec();
            super::sha1::digest(&encoded)
        }

        /// `verify` verifies the signature over the provided 32-byte digest.
        pub fn verify(&self, signature: &Signature, digest: &[u8; 32]) -> Result<(), CryptoError> {
            let r = BigUint::from_bytes_be(&signature[..PARAM_LENGTH]);
            let s = BigUint::from_bytes_be(&signature[PARAM_LENGTH..]);
            let zero = BigUint::default();
            if r == zero || r >= self.q || s == zero || s >= self.q {
                return Err(CryptoError::VerificationFailure(
                    "DSA signature: component out of range",
                ));
            }
            let w = s
                .modinv(&self.q)
                .ok_or(CryptoError::VerificationFailure("DSA signature: illegal s"))?;
            let h = BigUint::from_bytes_be(digest) % &self.q;
            let u1 = h * &w % &self.q;
            let u2 = &r * &w % &self.q;
            let v = self.g.modpow(&u1, &self.p) * self.y.modpow(&u2, &self.p) % &self.p % &self.q;
            if v == r {
                Ok(())
            } else {
                Err(CryptoError::VerificationFailure(
                    "DSA signature verification failed",
                ))
            }
        }
    }

    fn random_in_q() -> BigUint {
        loop {
            let v = BigUint::from_bytes_be(&utils::random::secure_bytes::<28>()) % &*Q;
            if v != BigUint::default() {
                return v;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::Keypair;

        #[test]
        fn test_sign_then_verify() {
            let keypair = Keypair::generate();
            let digest = crate::crypto::sha256::digest(b"hello world");
            let sig = keypair.sign(&digest);
            assert!(keypair.public_key().verify(&sig, &digest).is_ok());
        }

        #[test]
        fn test_verify_rejects_tampering() {
            let keypair = Keypair::generate();
            let digest = crate::crypto::sha256::digest(b"hello world");
            let mut sig = keypair.sign(&digest);
            sig[7] ^= 0x08;
            assert!(keypair.public_key().verify(&sig, &digest).is_err());
        }

        #[test]
        fn test_verify_rejects_other_content() {
            let keypair = Keypair::generate();
            let digest = crate::crypto::sha256::digest(b"hello world");
            let sig = keypair.sign(&digest);
            let other = crate::crypto::sha256::digest(b"hello world!");
            assert!(keypair.public_key().verify(&sig, &other).is_err());
        }

        #[test]
        fn test_verify_rejects_foreign_key() {
            let keypair = Keypair::generate();
            let other = Keypair::generate();
            let digest = crate::crypto::sha256::digest(b"hello world");
            let sig = keypair.sign(&digest);
            assert!(other.public_key().verify(&sig, &digest).is_err());
        }
    }
}

/// `otr` contains the OTRv2/OTRv3 key-derivation logic built on the shared DH secret.
pub mod otr {
    use num_bigint::BigUint;

    use crate::{encoding::OTREncoder, utils};

    use super::{aes128, sha1, sha256};

    /// `AKESecrets` contains the secret key material derived from the AKE shared secret:
    /// `h2(b) = SHA256(b || secbytes)`.
    pub struct AKESecrets {
        pub ssid: [u8; 8],
        pub c: aes128::Key,
        pub cp: aes128::Key,
        pub m1: [u8; 32],
        pub m2: [u8; 32],
        pub m1p: [u8; 32],
        pub m2p: [u8; 32],
    }

    impl AKESecrets {
        /// `derive` derives the AKE secrets from `secbytes`, the MPI-encoded shared secret.
        #[must_use]
        pub fn derive(secbytes: &[u8]) -> Self {
            let h2secret0 = h2(0x00, secbytes);
            let h2secret1 = h2(0x01, secbytes);
            let mut ssid = [0u8; 8];
            ssid.copy_from_slice(&h2secret0[..8]);
            let mut c = [0u8; 16];
            c.copy_from_slice(&h2secret1[..16]);
            let mut cp = [0u8; 16];
            cp.copy_from_slice(&h2secret1[16..]);
            Self {
                ssid,
                c: aes128::Key(c),
                cp: aes128::Key(cp),
                m1: h2(0x02, secbytes),
                m2: h2(0x03, secbytes),
                m1p: h2(0x04, secbytes),
                m2p: h2(0x05, secbytes),
            }
        }
    }

    impl Drop for AKESecrets {
        fn drop(&mut self) {
            utils::bytes::clear(&mut self.ssid);
            utils::bytes::clear(&mut self.m1);
            utils::bytes::clear(&mut self.m2);
            utils::bytes::clear(&mut self.m1p);
            utils::bytes::clear(&mut self.m2p);
        }
    }

    fn h2(b: u8, secbytes: &[u8]) -> [u8; 32] {
        sha256::digest(&utils::bytes::concatenate(&[b], secbytes))
    }

    /// `DataSecrets` are the message keys for a single session-key pair: AES keys and MAC keys
    /// for each direction. The "high" end of the key exchange (larger DH public key) sends with
    /// byte 0x01, the "low" end with byte 0x02.
    pub struct DataSecrets {
        sendkey: aes128::Key,
        recvkey: aes128::Key,
        sendmac: [u8; 20],
        recvmac: [u8; 20],
    }

    impl DataSecrets {
        /// `derive` derives the directional message keys from the two public keys and the
        /// MPI-encoded shared secret.
        ///
        /// # Panics
        ///
        /// Panics if both public keys are the same value.
        #[must_use]
        pub fn derive(our_public: &BigUint, their_public: &BigUint, secbytes: &[u8]) -> Self {
            // "The relative ordering is done as unsigned big-endian values." We cannot be on
            // both ends of the comparison at once.
            assert_ne!(our_public, their_public);
            let (sendbyte, recvbyte) = if our_public > their_public {
                (0x01u8, 0x02u8)
            } else {
                (0x02u8, 0x01u8)
            };
            let mut sendkey = [0u8; 16];
            sendkey.copy_from_slice(&h1(sendbyte, secbytes)[..16]);
            let mut recvkey = [0u8; 16];
            recvkey.copy_from_slice(&h1(recvbyte, secbytes)[..16]);
            let sendmac = sha1::digest(&sendkey);
            let recvmac = sha1::digest(&recvkey);
            Self {
                sendkey: aes128::Key(sendkey),
                recvkey: aes128::Key(recvkey),
                sendmac,
                recvmac,
            }
        }

        #[must_use]
        pub fn sender_crypt_key(&self) -> &aes128::Key {
            &self.sendkey
        }

        #[must_use]
        pub fn sender_mac_key(&self) -> &[u8; 20] {
            &self.sendmac
        }

        #[must_use]
        pub fn receiver_crypt_key(&self) -> &aes128::Key {
            &self.recvkey
        }

        #[must_use]
        pub fn receiver_mac_key(&self) -> &[u8; 20] {
            &self.recvmac
        }
    }

    impl Drop for DataSecrets {
        fn drop(&mut self) {
            utils::bytes::clear(&mut self.sendmac);
            utils::bytes::clear(&mut self.recvmac);
        }
    }

    fn h1(b: u8, secbytes: &[u8]) -> [u8; 20] {
        sha1::digest(&utils::bytes::concatenate(&[b], secbytes))
    }

    /// `extra_symmetric_key` derives the 32-byte extra symmetric key, `SHA256(0xFF || secbytes)`,
    /// that both parties can compute but that never travels over the wire.
    #[must_use]
    pub fn extra_symmetric_key(shared_secret: &BigUint) -> [u8; 32] {
        let secbytes = OTREncoder::new().write_mpi(shared_secret).to_vec();
        sha256::digest(&utils::bytes::concatenate(&[0xff], &secbytes))
    }

    #[cfg(test)]
    mod tests {
        use super::DataSecrets;
        use num_bigint::BigUint;

        #[test]
        fn test_data_secrets_mirrored() {
            let a = BigUint::from(0x1234_5678u32);
            let b = BigUint::from(0x1234u16);
            let secbytes = b"mpi-of-shared-secret";
            let ours = DataSecrets::derive(&a, &b, secbytes);
            let theirs = DataSecrets::derive(&b, &a, secbytes);
            assert_eq!(ours.sender_crypt_key().0, theirs.receiver_crypt_key().0);
            assert_eq!(ours.sender_mac_key(), theirs.receiver_mac_key());
            assert_eq!(ours.receiver_crypt_key().0, theirs.sender_crypt_key().0);
            assert_eq!(ours.receiver_mac_key(), theirs.sender_mac_key());
        }
    }
}

#[allow(non_snake_case)]
pub mod ed448 {
    use num_bigint::{BigInt, BigUint};
    use num_integer::Integer;
    use once_cell::sync::Lazy;

    use crate::{encoding::OTRDecoder, utils, OTRError};

    use super::{shake256, CryptoError};

    /// Encoded length of both points and scalars.
    pub const ENCODED_LENGTH: usize = 57;
    /// Length of an EdDSA signature: R || S.
    pub const SIGNATURE_LENGTH: usize = 114;

    /// `MODULUS` (p): `2^448 - 2^224 - 1`.
    pub static MODULUS: Lazy<BigUint> =
        Lazy::new(|| (BigUint::from(1u8) << 448u16) - (BigUint::from(1u8) << 224u16) - 1u8);

    /// `ORDER` (q): the prime order of the base-point subgroup.
    pub static ORDER: Lazy<BigUint> = Lazy::new(|| {
        (BigUint::from(1u8) << 446u16)
            - BigUint::parse_bytes(
                b"13818066809895115352007386748515426880336692474882178609894547503885",
                10,
            )
            .expect("BUG: failed to parse hard-coded subtrahend of group order")
    });

    /// `D`: the (non-square) curve constant, -39081 mod p.
    static D: Lazy<BigUint> = Lazy::new(|| &*MODULUS - BigUint::from(39081u32));

    static G: Lazy<Point> = Lazy::new(|| Point {
        x: BigUint::parse_bytes(
            b"224580040295924300187604334099896036246789641632564134246125461686950415467406\
              032909029192869357953282578032075146446173674602635247710",
            10,
        )
        .expect("BUG: failed to parse hard-coded base point x"),
        y: BigUint::parse_bytes(
            b"298819210078481492676017930443930673437544040154080242095928241372331506189835\
              876003536878655418784733982303233503462500531545062832660",
            10,
        )
        .expect("BUG: failed to parse hard-coded base point y"),
    });

    #[must_use]
    pub fn generator() -> &'static Point {
        &G
    }

    #[must_use]
    pub fn identity() -> Point {
        Point {
            x: BigUint::default(),
            y: BigUint::from(1u8),
        }
    }

    /// `verify` verifies that the point is a legal, non-identity point on the curve.
    pub fn verify(point: &Point) -> Result<(), CryptoError> {
        if point.is_identity() {
            return Err(CryptoError::VerificationFailure(
                "point is the identity element",
            ));
        }
        if point.x >= *MODULUS || point.y >= *MODULUS || !point.is_on_curve() {
            return Err(CryptoError::VerificationFailure("point is not on the curve"));
        }
        Ok(())
    }

    /// `random_in_Zq` produces a random scalar in the base-point subgroup order.
    #[must_use]
    pub fn random_in_Zq() -> BigUint {
        let bytes = utils::random::secure_bytes::<114>();
        BigUint::from_bytes_le(&bytes) % &*ORDER
    }

    /// `hash_to_scalar` hashes a tagged point into a scalar.
    #[must_use]
    pub fn hash_to_scalar(tag: u8, p1: &Point) -> BigUint {
        hash_bytes_to_scalar(tag, &p1.encode())
    }

    /// `hash_to_scalar2` hashes two tagged points into a scalar.
    #[must_use]
    pub fn hash_to_scalar2(tag: u8, p1: &Point, p2: &Point) -> BigUint {
        hash_bytes_to_scalar(tag, &utils::bytes::concatenate(&p1.encode(), &p2.encode()))
    }

    fn hash_bytes_to_scalar(tag: u8, data: &[u8]) -> BigUint {
        let digest = shake256::digest::<114>(&utils::bytes::concatenate(&[tag], data));
        BigUint::from_bytes_le(&digest) % &*ORDER
    }

    /// `Point` is a point on the Goldilocks curve, in affine coordinates.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Point {
        x: BigUint,
        y: BigUint,
    }

    impl Point {
        #[must_use]
        pub fn is_identity(&self) -> bool {
            self.x == BigUint::default() && self.y == BigUint::from(1u8)
        }

        fn is_on_curve(&self) -> bool {
            // x^2 + y^2 == 1 + d*x^2*y^2 (mod p)
            let p: &BigUint = &MODULUS;
            let x2 = &self.x * &self.x % p;
            let y2 = &self.y * &self.y % p;
            let lhs = (&x2 + &y2) % p;
            let rhs = (BigUint::from(1u8) + &*D * x2 % p * y2) % p;
            lhs == rhs
        }

        /// `add` performs Edwards point addition.
        #[must_use]
        pub fn add(&self, other: &Point) -> Point {
            let p: &BigUint = &MODULUS;
            let x1y2 = &self.x * &other.y % p;
            let y1x2 = &self.y * &other.x % p;
            let y1y2 = &self.y * &other.y % p;
            let x1x2 = &self.x * &other.x % p;
            let dxy = &*D * &x1x2 % p * &y1y2 % p;
            let one = BigUint::from(1u8);
            let den_x = (&one + &dxy) % p;
            let den_y = (&one + p - &dxy) % p;
            // Invert both denominators at the cost of a single modular inversion.
            let inv_product = (&den_x * &den_y % p)
                .modinv(p)
                .expect("BUG: denominators must be invertible for valid curve points");
            let inv_den_x = &inv_product * den_y % p;
            let inv_den_y = inv_product * den_x % p;
            Point {
                x: (x1y2 + y1x2) % p * inv_den_x % p,
                y: ((y1y2 + p - x1x2) % p) * inv_den_y % p,
            }
        }

        /// `negate` produces the inverse point: `(-x, y)`.
        #[must_use]
        pub fn negate(&self) -> Point {
            Point {
                x: (&*MODULUS - &self.x) % &*MODULUS,
                y: self.y.clone(),
            }
        }

        /// `mul` performs double-and-add scalar multiplication.
        #[must_use]
        pub fn mul(&self, scalar: &BigUint) -> Point {
            let mut result = identity();
            let mut base = self.clone();
            for limb in scalar.to_u64_digits() {
                for i in 0..64 {
                    if limb >> i & 1 == 1 {
                        result = result.add(&base);
                    }
                    base = base.add(&base);
                }
            }
            result
        }

        /// `encode` produces the 57-byte encoding: the y-coordinate in little-endian order with
        /// the sign bit of x in the most significant bit of the final byte.
        #[must_use]
        pub fn encode(&self) -> [u8; ENCODED_LENGTH] {
            let mut encoded = utils::biguint::to_bytes_le_fixed::<ENCODED_LENGTH>(&self.y);
            if self.x.to_u64_digits().first().unwrap_or(&0) & 1 == 1 {
                encoded[ENCODED_LENGTH - 1] |= 0b1000_0000;
            }
            encoded
        }

        /// `decode` reads a point from its 57-byte encoding, recovering the x-coordinate.
        pub fn decode(encoded: &[u8; ENCODED_LENGTH]) -> Result<Point, OTRError> {
            let x_odd = encoded[ENCODED_LENGTH - 1] >> 7 == 1;
            let mut y_bytes = *encoded;
            y_bytes[ENCODED_LENGTH - 1] &= 0b0111_1111;
            let y = BigUint::from_bytes_le(&y_bytes);
            let p: &BigUint = &MODULUS;
            if y >= *p {
                return Err(OTRError::ProtocolViolation(
                    "Ed448 point: y-coordinate out of range",
                ));
            }
            // x^2 = (y^2 - 1) / (d*y^2 - 1)
            let y2 = &y * &y % p;
            let one = BigUint::from(1u8);
            let num = (&y2 + p - &one) % p;
            let den = (&*D * &y2 % p + p - &one) % p;
            let den_inv = den.modinv(p).ok_or(OTRError::ProtocolViolation(
                "Ed448 point: no square root exists",
            ))?;
            let x2 = num * den_inv % p;
            // p == 3 (mod 4), so a square root is x2^((p+1)/4).
            let x = x2.modpow(&((p + &one) >> 2u8), p);
            if &x * &x % p != x2 {
                return Err(OTRError::ProtocolViolation(
                    "Ed448 point: not a valid point encoding",
                ));
            }
            let x = if x_odd == (x.to_u64_digits().first().unwrap_or(&0) & 1 == 1) {
                x
            } else {
                (p - x) % p
            };
            Ok(Point { x, y })
        }
    }

    /// `ECDHKeyPair` is an ephemeral Ed448 keypair for establishing a shared secret.
    #[derive(Clone)]
    pub struct ECDHKeyPair {
        private: BigUint,
        public: Point,
    }

    impl ECDHKeyPair {
        #[must_use]
        pub fn generate() -> Self {
            let private = random_in_Zq();
            let public = G.mul(&private);
            Self { private, public }
        }

        #[must_use]
        pub fn public(&self) -> &Point {
            &self.public
        }

        /// `generate_shared_secret` computes the ECDH shared secret. The peer's point must have
        /// been verified.
        pub fn generate_shared_secret(&self, other: &Point) -> Result<Point, CryptoError> {
            verify(other)?;
            let shared = other.mul(&self.private);
            if shared.is_identity() {
                return Err(CryptoError::VerificationFailure(
                    "ECDH shared secret is the identity element",
                ));
            }
            Ok(shared)
        }
    }

    impl Drop for ECDHKeyPair {
        fn drop(&mut self) {
            self.private = BigUint::default();
        }
    }

    /// `DOM4`: the RFC 8032 domain separator `dom4(phflag, context)` for Ed448 without
    /// pre-hashing and with an empty context: `"SigEd448" || octet(0) || octet(0)`.
    const DOM4: &[u8] = b"SigEd448\x00\x00";

    /// `EdDSAKeyPair` is the long-term Ed448 identity keypair (OTRv4).
    pub struct EdDSAKeyPair {
        secret: BigUint,
        prefix: [u8; 57],
        public: Point,
    }

    impl EdDSAKeyPair {
        #[must_use]
        pub fn generate() -> Self {
            let symmetric = utils::random::secure_bytes::<57>();
            let h = shake256::digest::<114>(&symmetric);
            let mut scalar_bytes = [0u8; 57];
            scalar_bytes.copy_from_slice(&h[..57]);
            scalar_bytes[0] &= 0b1111_1100;
            scalar_bytes[55] |= 0b1000_0000;
            scalar_bytes[56] = 0;
            let secret = BigUint::from_bytes_le(&scalar_bytes) % &*ORDER;
            let mut prefix = [0u8; 57];
            prefix.copy_from_slice(&h[57..]);
            let public = G.mul(&secret);
            Self {
                secret,
                prefix,
                public,
            }
        }

        #[must_use]
        pub fn public(&self) -> &Point {
            &self.public
        }

        /// `sign` produces an Ed448 signature (R || S) over the message, per RFC 8032 with an
        /// empty context.
        #[must_use]
        pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
            // r = SHAKE256(dom4(0, "") || prefix || M, 114) interpreted little-endian, mod q.
            let mut input = Vec::with_capacity(DOM4.len() + self.prefix.len() + message.len());
            input.extend_from_slice(DOM4);
            input.extend_from_slice(&self.prefix);
            input.extend_from_slice(message);
            let r = BigUint::from_bytes_le(&shake256::digest::<114>(&input)) % &*ORDER;
            let big_r = G.mul(&r);
            let k = challenge(&big_r, &self.public, message);
            let s = (r + k * &self.secret) % &*ORDER;
            let mut signature = [0u8; SIGNATURE_LENGTH];
            signature[..ENCODED_LENGTH].copy_from_slice(&big_r.encode());
            signature[ENCODED_LENGTH..]
                .copy_from_slice(&utils::biguint::to_bytes_le_fixed::<ENCODED_LENGTH>(&s));
            signature
        }
    }

    impl Drop for EdDSAKeyPair {
        fn drop(&mut self) {
            self.secret = BigUint::default();
            utils::bytes::clear(&mut self.prefix);
        }
    }

    /// `validate` verifies an Ed448 signature over a message under the signer's public key.
    pub fn validate(
        public_key: &Point,
        signature: &[u8; SIGNATURE_LENGTH],
        message: &[u8],
    ) -> Result<(), CryptoError> {
        verify(public_key)?;
        let mut r_bytes = [0u8; ENCODED_LENGTH];
        r_bytes.copy_from_slice(&signature[..ENCODED_LENGTH]);
        let big_r = Point::decode(&r_bytes).or(Err(CryptoError::VerificationFailure(
            "EdDSA signature: invalid point R",
        )))?;
        let s = BigUint::from_bytes_le(&signature[ENCODED_LENGTH..]);
        if s >= *ORDER {
            return Err(CryptoError::VerificationFailure(
                "EdDSA signature: scalar S out of range",
            ));
        }
        let k = challenge(&big_r, public_key, message);
        let lhs = G.mul(&s);
        let rhs = big_r.add(&public_key.mul(&k));
        super::constant::verify_points(&lhs, &rhs)
            .or(Err(CryptoError::VerificationFailure(
                "EdDSA signature verification failed",
            )))
    }

    /// `challenge` is the RFC 8032 challenge scalar:
    /// `SHAKE256(dom4(0, "") || R || A || M, 114)` interpreted little-endian, mod q.
    fn challenge(big_r: &Point, public_key: &Point, message: &[u8]) -> BigUint {
        let mut data = Vec::new();
        data.extend_from_slice(DOM4);
        data.extend_from_slice(&big_r.encode());
        data.extend_from_slice(&public_key.encode());
        data.extend_from_slice(message);
        BigUint::from_bytes_le(&shake256::digest::<114>(&data)) % &*ORDER
    }

    /// `RingSignature` is the four-scalar ring signature (sigma) of the OTRv4 DAKE: knowledge of
    /// the private key behind one of three public keys, without revealing which.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct RingSignature {
        c1: BigUint,
        r1: BigUint,
        r2: BigUint,
        r3: BigUint,
    }

    const RING_TAG: u8 = 0x1d;

    impl crate::encoding::OTREncodable for RingSignature {
        fn encode(&self, encoder: &mut crate::encoding::OTREncoder) {
            encoder
                .write_ed448_scalar(&self.c1)
                .write_ed448_scalar(&self.r1)
                .write_ed448_scalar(&self.r2)
                .write_ed448_scalar(&self.r3);
        }
    }

    impl RingSignature {
        pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
            Ok(Self {
                c1: decoder.read_ed448_scalar()?,
                r1: decoder.read_ed448_scalar()?,
                r2: decoder.read_ed448_scalar()?,
                r3: decoder.read_ed448_scalar()?,
            })
        }

        /// `sign` produces the ring signature over the message for ring `{a1, a2, a3}`, of which
        /// the keypair's public key must be a member.
        pub fn sign(
            keypair: &EdDSAKeyPair,
            a1: &Point,
            a2: &Point,
            a3: &Point,
            message: &[u8],
        ) -> Result<RingSignature, CryptoError> {
            let ring = [a1, a2, a3];
            let known = ring
                .iter()
                .position(|p| **p == keypair.public)
                .ok_or(CryptoError::VerificationFailure(
                    "ring signature: own public key is not part of the ring",
                ))?;
            let q: &BigUint = &ORDER;
            let t = random_in_Zq();
            let mut challenges = [BigUint::default(), BigUint::default(), BigUint::default()];
            let mut responses = [random_in_Zq(), random_in_Zq(), random_in_Zq()];
            // Walk the chain from the known index: each commitment determines the next
            // member's challenge.
            challenges[(known + 1) % 3] =
                Self::chain_hash(a1, a2, a3, &G.mul(&t), message);
            for step in 1..3 {
                let j = (known + step) % 3;
                let commitment = G
                    .mul(&responses[j])
                    .add(&ring[j].mul(&challenges[j]));
                challenges[(j + 1) % 3] = Self::chain_hash(a1, a2, a3, &commitment, message);
            }
            responses[known] = (BigInt::from(t)
                - BigInt::from(&challenges[known] * &keypair.secret))
            .mod_floor(&BigInt::from(q.clone()))
            .to_biguint()
            .expect("BUG: mod_floor of positive modulus must be non-negative");
            let [c0, _, _] = &challenges;
            let [r1, r2, r3] = responses;
            Ok(RingSignature {
                c1: c0.clone(),
                r1,
                r2,
                r3,
            })
        }

        /// `validate` verifies the ring signature over the message for ring `{a1, a2, a3}`.
        pub fn validate(
            &self,
            a1: &Point,
            a2: &Point,
            a3: &Point,
            message: &[u8],
        ) -> Result<(), CryptoError> {
            verify(a1)?;
            verify(a2)?;
            verify(a3)?;
            let ring = [a1, a2, a3];
            let responses = [&self.r1, &self.r2, &self.r3];
            let mut c = self.c1.clone();
            for j in 0..3 {
                let commitment = G.mul(responses[j]).add(&ring[j].mul(&c));
                c = Self::chain_hash(a1, a2, a3, &commitment, message);
            }
            super::constant::verify_scalars(&self.c1, &c).or(Err(
                CryptoError::VerificationFailure("ring signature verification failed"),
            ))
        }

        fn chain_hash(a1: &Point, a2: &Point, a3: &Point, commitment: &Point, m: &[u8]) -> BigUint {
            let mut data = Vec::new();
            data.extend_from_slice(&a1.encode());
            data.extend_from_slice(&a2.encode());
            data.extend_from_slice(&a3.encode());
            data.extend_from_slice(&commitment.encode());
            data.extend_from_slice(m);
            hash_bytes_to_scalar(RING_TAG, &data)
        }
    }

}

#[allow(non_snake_case)]
pub mod dh3072 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    use crate::utils;

    use super::CryptoError;

    /// `GENERATOR` (g3): 2
    pub static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

    /// `MODULUS`: the 3072-bit MODP group prime from RFC 3526, as prescribed by OTRv4.
    pub static MODULUS: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(
            b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
              020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
              4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
              EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
              98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
              9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
              E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
              3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
              A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
              ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
              D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
              08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
            16,
        )
        .expect("BUG: failed to parse hard-coded modulus")
    });

    static MODULUS_MINUS_TWO: Lazy<BigUint> = Lazy::new(|| &*MODULUS - BigUint::from(2u8));

    /// Private exponents are 80 bytes (640 bits), as prescribed by OTRv4.
    const PRIVATE_KEY_LENGTH: usize = 80;

    /// `verify` verifies a public key to be a legal group element: `2 <= y <= p - 2`.
    pub fn verify(public_key: &BigUint) -> Result<(), CryptoError> {
        if public_key >= &*GENERATOR && public_key <= &*MODULUS_MINUS_TWO {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "DH-3072 public key fails verification",
            ))
        }
    }

    /// `KeyPair` is an ephemeral keypair in the 3072-bit MODP group ("brace key" material).
    #[derive(Clone)]
    pub struct KeyPair {
        private: BigUint,
        public: BigUint,
    }

    impl KeyPair {
        #[must_use]
        pub fn generate() -> Self {
            let private =
                BigUint::from_bytes_be(&utils::random::secure_bytes::<PRIVATE_KEY_LENGTH>());
            let public = GENERATOR.modpow(&private, &MODULUS);
            Self { private, public }
        }

        #[must_use]
        pub fn public(&self) -> &BigUint {
            &self.public
        }

        /// `generate_shared_secret` computes the shared secret. The peer's public key must be
        /// verified beforehand.
        #[must_use]
        pub fn generate_shared_secret(&self, public_key: &BigUint) -> BigUint {
            public_key.modpow(&self.private, &MODULUS)
        }
    }

    impl Drop for KeyPair {
        fn drop(&mut self) {
            self.private = BigUint::default();
        }
    }

}

/// `otr4` contains the OTRv4 key-derivation logic: SHAKE-256-based KDFs with usage IDs and the
/// mixed (ECDH + DH) shared secret.
pub mod otr4 {
    use num_bigint::BigUint;

    use crate::{encoding::OTREncoder, utils};

    use super::{dh3072, ed448, shake256, CryptoError};

    pub const K_LENGTH: usize = 64;
    pub const FINGERPRINT_LENGTH: usize = 56;

    pub type Fingerprint = [u8; FINGERPRINT_LENGTH];

    const KDF_PREFIX: &[u8] = b"OTRv4";

    pub const USAGE_FINGERPRINT: u8 = 0x00;
    pub const USAGE_BRACE_KEY: u8 = 0x02;
    pub const USAGE_SHARED_SECRET: u8 = 0x03;
    pub const USAGE_SSID: u8 = 0x04;
    pub const USAGE_AUTH_R_BOB_CLIENT_PROFILE: u8 = 0x05;
    pub const USAGE_AUTH_R_ALICE_CLIENT_PROFILE: u8 = 0x06;
    pub const USAGE_AUTH_R_PHI: u8 = 0x07;
    pub const USAGE_AUTH_I_BOB_CLIENT_PROFILE: u8 = 0x08;
    pub const USAGE_AUTH_I_ALICE_CLIENT_PROFILE: u8 = 0x09;
    pub const USAGE_AUTH_I_PHI: u8 = 0x0a;
    pub const USAGE_SMP_SECRET: u8 = 0x1b;

    /// `kdf` is the general-purpose keyed derivation: `SHAKE-256("OTRv4" || usage || data)`.
    #[must_use]
    pub fn kdf<const N: usize>(usage: u8, data: &[u8]) -> [u8; N] {
        let mut input = Vec::with_capacity(KDF_PREFIX.len() + 1 + data.len());
        input.extend_from_slice(KDF_PREFIX);
        input.push(usage);
        input.extend_from_slice(data);
        shake256::digest::<N>(&input)
    }

    /// `hwc` ("hash with context") is the same construction as `kdf`; the alias mirrors the
    /// terminology of the protocol text for non-key outputs.
    #[must_use]
    pub fn hwc<const N: usize>(usage: u8, data: &[u8]) -> [u8; N] {
        kdf::<N>(usage, data)
    }

    /// `fingerprint` computes the 56-byte OTRv4 fingerprint over the long-term public key and
    /// the forging key.
    #[must_use]
    pub fn fingerprint(identity_key: &ed448::Point, forging_key: &ed448::Point) -> Fingerprint {
        hwc::<FINGERPRINT_LENGTH>(
            USAGE_FINGERPRINT,
            &utils::bytes::concatenate(&identity_key.encode(), &forging_key.encode()),
        )
    }

    /// `MixedSharedSecret` combines an ECDH (Ed448) shared secret with a DH-3072 "brace key"
    /// shared secret. Both parts feed the mixed key `K` that all subsequent key derivation is
    /// based on.
    pub struct MixedSharedSecret {
        ecdh: ed448::Point,
        dh: BigUint,
    }

    impl MixedSharedSecret {
        /// `new` computes the mixed shared secret from our two keypairs and the other party's
        /// two public keys.
        pub fn new(
            x: &ed448::ECDHKeyPair,
            a: &dh3072::KeyPair,
            their_ecdh: &ed448::Point,
            their_dh: &BigUint,
        ) -> Result<Self, CryptoError> {
            dh3072::verify(their_dh)?;
            let ecdh = x.generate_shared_secret(their_ecdh)?;
            let dh = a.generate_shared_secret(their_dh);
            Ok(Self { ecdh, dh })
        }

        /// `k` produces the mixed shared secret `K`.
        #[must_use]
        pub fn k(&self) -> [u8; K_LENGTH] {
            let brace = hwc::<32>(
                USAGE_BRACE_KEY,
                &OTREncoder::new().write_mpi(&self.dh).to_vec(),
            );
            hwc::<K_LENGTH>(
                USAGE_SHARED_SECRET,
                &utils::bytes::concatenate(&self.ecdh.encode(), &brace),
            )
        }
    }

    impl Drop for MixedSharedSecret {
        fn drop(&mut self) {
            self.ecdh = ed448::identity();
            self.dh = BigUint::default();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::MixedSharedSecret;
        use crate::crypto::{dh3072, ed448};

        #[test]
        fn test_mixed_shared_secret_agreement() {
            let x_a = ed448::ECDHKeyPair::generate();
            let dh_a = dh3072::KeyPair::generate();
            let x_b = ed448::ECDHKeyPair::generate();
            let dh_b = dh3072::KeyPair::generate();
            let k_a = MixedSharedSecret::new(&x_a, &dh_a, x_b.public(), dh_b.public())
                .unwrap()
                .k();
            let k_b = MixedSharedSecret::new(&x_b, &dh_b, x_a.public(), dh_a.public())
                .unwrap()
                .k();
            assert_eq!(k_a, k_b);
        }
    }
}
