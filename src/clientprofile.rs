// SPDX-License-Identifier: LGPL-3.0-only

use crate::{
    crypto::{dsa, ed448, sha256},
    encoding::{OTRDecoder, OTREncodable, OTREncoder},
    instancetag::{self, InstanceTag},
    utils, OTRError, Version,
};

const TYPE_OWNER_INSTANCE_TAG: u16 = 0x0001;
const TYPE_ED448_PUBLIC_KEY: u16 = 0x0002;
const TYPE_ED448_FORGING_KEY: u16 = 0x0003;
const TYPE_VERSIONS: u16 = 0x0004;
const TYPE_EXPIRATION: u16 = 0x0005;
const TYPE_DSA_PUBLIC_KEY: u16 = 0x0006;
const TYPE_TRANSITIONAL_SIGNATURE: u16 = 0x0007;

/// Ed448 public key-type identifiers as used inside the profile fields.
const KEY_TYPE_IDENTITY: u16 = 0x0010;
const KEY_TYPE_FORGING: u16 = 0x0012;

/// `ClientProfile` is the validated result of a client profile payload: a signed, expiring
/// credential binding an instance tag to the long-term identity and forging keys.
#[derive(Clone)]
pub struct ClientProfile {
    pub owner_tag: InstanceTag,
    pub identity_key: ed448::Point,
    pub forging_key: ed448::Point,
    pub versions: Vec<Version>,
    pub expiration: i64,
    pub legacy_key: Option<dsa::PublicKey>,
}

/// `ClientProfilePayload` is the wire representation of a client profile: the typed fields with
/// the EdDSA signature over them. Its contents are only accessible through `validate`.
#[derive(Clone)]
pub struct ClientProfilePayload {
    owner_tag: Option<InstanceTag>,
    identity_key: Option<ed448::Point>,
    forging_key: Option<ed448::Point>,
    versions: Vec<Version>,
    expiration: Option<i64>,
    legacy_key: Option<dsa::PublicKey>,
    transitional_sig: Option<dsa::Signature>,
    signature: [u8; ed448::SIGNATURE_LENGTH],
}

impl OTREncodable for ClientProfilePayload {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder.write_u32(self.count_fields());
        self.encode_fields(encoder);
        encoder.write_ed448_signature(&self.signature);
    }
}

impl ClientProfilePayload {
    /// `sign` produces a signed payload for the profile. The transitional DSA signature is
    /// produced when the profile carries a legacy DSA public key and the corresponding keypair
    /// is provided.
    pub fn sign(
        profile: &ClientProfile,
        identity_keypair: &ed448::EdDSAKeyPair,
        legacy_keypair: Option<&dsa::Keypair>,
    ) -> Self {
        let mut payload = Self {
            owner_tag: Some(profile.owner_tag),
            identity_key: Some(profile.identity_key.clone()),
            forging_key: Some(profile.forging_key.clone()),
            versions: profile.versions.clone(),
            expiration: Some(profile.expiration),
            legacy_key: profile.legacy_key.clone(),
            transitional_sig: None,
            signature: [0u8; ed448::SIGNATURE_LENGTH],
        };
        if let Some(keypair) = legacy_keypair {
            // Sign the profile fields, excluding the transitional signature itself.
            let mut partial = OTREncoder::new();
            payload.encode_fields(&mut partial);
            payload.transitional_sig = Some(keypair.sign(&sha256::digest(&partial.to_vec())));
        }
        let mut fields = OTREncoder::new();
        payload.encode_fields(&mut fields);
        payload.signature = identity_keypair.sign(&fields.to_vec());
        payload
    }

    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let n = decoder.read_u32()?;
        let mut payload = Self {
            owner_tag: None,
            identity_key: None,
            forging_key: None,
            versions: Vec::new(),
            expiration: None,
            legacy_key: None,
            transitional_sig: None,
            signature: [0u8; ed448::SIGNATURE_LENGTH],
        };
        for _ in 0..n {
            match decoder.read_u16()? {
                TYPE_OWNER_INSTANCE_TAG => {
                    set_unique(&mut payload.owner_tag, decoder.read_instance_tag()?)?;
                }
                TYPE_ED448_PUBLIC_KEY => {
                    if decoder.read_u16()? != KEY_TYPE_IDENTITY {
                        return Err(OTRError::ProtocolViolation(
                            "Client profile: unexpected key type for identity key",
                        ));
                    }
                    set_unique(&mut payload.identity_key, decoder.read_ed448_point()?)?;
                }
                TYPE_ED448_FORGING_KEY => {
                    if decoder.read_u16()? != KEY_TYPE_FORGING {
                        return Err(OTRError::ProtocolViolation(
                            "Client profile: unexpected key type for forging key",
                        ));
                    }
                    set_unique(&mut payload.forging_key, decoder.read_ed448_point()?)?;
                }
                TYPE_VERSIONS => {
                    if !payload.versions.is_empty() {
                        return Err(OTRError::ProtocolViolation(
                            "Client profile: duplicate field",
                        ));
                    }
                    payload.versions = parse_versions(&decoder.read_data()?);
                }
                TYPE_EXPIRATION => {
                    set_unique(&mut payload.expiration, decoder.read_i64()?)?;
                }
                TYPE_DSA_PUBLIC_KEY => {
                    set_unique(&mut payload.legacy_key, decoder.read_public_key()?)?;
                }
                TYPE_TRANSITIONAL_SIGNATURE => {
                    set_unique(&mut payload.transitional_sig, decoder.read_dsa_signature()?)?;
                }
                _ => {
                    return Err(OTRError::ProtocolViolation(
                        "Client profile: unknown field type",
                    ))
                }
            }
        }
        decoder.read_ed448_signature().map(|sig| {
            payload.signature = sig;
            payload
        })
    }

    /// `validate` verifies the payload invariants and signature, producing the embedded client
    /// profile on success.
    pub fn validate(&self) -> Result<ClientProfile, OTRError> {
        let owner_tag = self.owner_tag.ok_or(OTRError::ProtocolViolation(
            "Client profile: missing instance tag",
        ))?;
        utils::u32::verify_nonzero(
            owner_tag,
            OTRError::ProtocolViolation("Client profile: instance tag must not be zero"),
        )?;
        instancetag::verify(owner_tag)?;
        let identity_key = self.identity_key.as_ref().ok_or(OTRError::ProtocolViolation(
            "Client profile: missing identity public key",
        ))?;
        let forging_key = self.forging_key.as_ref().ok_or(OTRError::ProtocolViolation(
            "Client profile: missing forging public key",
        ))?;
        ed448::verify(identity_key).map_err(OTRError::CryptographicViolation)?;
        ed448::verify(forging_key).map_err(OTRError::CryptographicViolation)?;
        if !self.versions.contains(&Version::V4) {
            return Err(OTRError::ProtocolViolation(
                "Client profile: supported versions must include 4",
            ));
        }
        let expiration = self.expiration.ok_or(OTRError::ProtocolViolation(
            "Client profile: missing expiration date",
        ))?;
        let now = i64::try_from(utils::time::unix_seconds_now())
            .expect("BUG: system time out of range");
        if expiration <= now {
            return Err(OTRError::ProtocolViolation("Client profile: profile expired"));
        }
        // The transitional DSA material travels together: key without signature, or signature
        // without key, is illegal.
        match (&self.legacy_key, &self.transitional_sig) {
            (None, None) => {}
            (Some(_), None) | (None, Some(_)) => {
                return Err(OTRError::ProtocolViolation(
                    "Client profile: legacy DSA public key and transitional signature must both be present or both be absent",
                ))
            }
            (Some(legacy_key), Some(sig)) => {
                let mut partial = OTREncoder::new();
                self.encode_fields_without_transitional_sig(&mut partial);
                legacy_key
                    .verify(sig, &sha256::digest(&partial.to_vec()))
                    .map_err(OTRError::CryptographicViolation)?;
            }
        }
        let mut fields = OTREncoder::new();
        self.encode_fields(&mut fields);
        ed448::validate(identity_key, &self.signature, &fields.to_vec())
            .map_err(OTRError::CryptographicViolation)?;
        Ok(ClientProfile {
            owner_tag,
            identity_key: identity_key.clone(),
            forging_key: forging_key.clone(),
            versions: self.versions.clone(),
            expiration,
            legacy_key: self.legacy_key.clone(),
        })
    }

    fn count_fields(&self) -> u32 {
        5 + u32::from(self.legacy_key.is_some()) + u32::from(self.transitional_sig.is_some())
    }

    fn encode_fields(&self, encoder: &mut OTREncoder) {
        self.encode_fields_without_transitional_sig(encoder);
        if let Some(sig) = &self.transitional_sig {
            encoder.write_u16(TYPE_TRANSITIONAL_SIGNATURE);
            encoder.write_dsa_signature(sig);
        }
    }

    fn encode_fields_without_transitional_sig(&self, encoder: &mut OTREncoder) {
        // Encoding assumes a structurally complete payload, as produced by `sign` or `decode`.
        encoder.write_u16(TYPE_OWNER_INSTANCE_TAG);
        encoder.write_u32(self.owner_tag.expect("BUG: missing instance tag"));
        encoder.write_u16(TYPE_ED448_PUBLIC_KEY);
        encoder.write_u16(KEY_TYPE_IDENTITY);
        encoder.write_ed448_point(self.identity_key.as_ref().expect("BUG: missing identity key"));
        encoder.write_u16(TYPE_ED448_FORGING_KEY);
        encoder.write_u16(KEY_TYPE_FORGING);
        encoder.write_ed448_point(self.forging_key.as_ref().expect("BUG: missing forging key"));
        encoder.write_u16(TYPE_VERSIONS);
        encoder.write_data(&encode_versions(&self.versions));
        encoder.write_u16(TYPE_EXPIRATION);
        encoder.write_i64(self.expiration.expect("BUG: missing expiration"));
        if let Some(pk) = &self.legacy_key {
            encoder.write_u16(TYPE_DSA_PUBLIC_KEY);
            encoder.write_public_key(pk);
        }
    }
}

fn set_unique<T>(field: &mut Option<T>, value: T) -> Result<(), OTRError> {
    if field.is_some() {
        Err(OTRError::ProtocolViolation("Client profile: duplicate field"))
    } else {
        *field = Some(value);
        Ok(())
    }
}

fn parse_versions(data: &[u8]) -> Vec<Version> {
    let mut versions = Vec::new();
    for c in data {
        versions.push(match *c {
            b'3' => Version::V3,
            b'4' => Version::V4,
            _ => continue,
        });
    }
    versions
}

fn encode_versions(versions: &[Version]) -> Vec<u8> {
    let mut data = Vec::new();
    for v in versions {
        data.push(match v {
            Version::V3 => b'3',
            Version::V4 => b'4',
            _ => continue,
        });
    }
    data
}

#[cfg(test)]
mod tests {
    use super::{ClientProfile, ClientProfilePayload};
    use crate::{
        crypto::{dsa, ed448},
        encoding::{OTRDecoder, OTREncoder},
        utils, OTRError, Version,
    };

    fn base_profile(identity: &ed448::EdDSAKeyPair, forging: &ed448::EdDSAKeyPair) -> ClientProfile {
        ClientProfile {
            owner_tag: 0x1234_5678,
            identity_key: identity.public().clone(),
            forging_key: forging.public().clone(),
            versions: vec![Version::V3, Version::V4],
            expiration: i64::try_from(utils::time::unix_seconds_now()).unwrap() + 7 * 24 * 3600,
            legacy_key: None,
        }
    }

    fn round_trip(payload: &ClientProfilePayload) -> Result<ClientProfilePayload, OTRError> {
        let encoded = OTREncoder::new().write_encodable(payload).to_vec();
        let mut decoder = OTRDecoder::new(&encoded);
        let decoded = ClientProfilePayload::decode(&mut decoder)?;
        decoder.done()?;
        Ok(decoded)
    }

    #[test]
    fn test_sign_encode_decode_validate() {
        let identity = ed448::EdDSAKeyPair::generate();
        let forging = ed448::EdDSAKeyPair::generate();
        let profile = base_profile(&identity, &forging);
        let payload = ClientProfilePayload::sign(&profile, &identity, None);
        let decoded = round_trip(&payload).unwrap();
        let validated = decoded.validate().unwrap();
        assert_eq!(profile.owner_tag, validated.owner_tag);
        assert_eq!(profile.identity_key, validated.identity_key);
        assert_eq!(profile.forging_key, validated.forging_key);
        assert_eq!(profile.versions, validated.versions);
        assert_eq!(profile.expiration, validated.expiration);
        assert!(validated.legacy_key.is_none());
    }

    #[test]
    fn test_profile_with_transitional_dsa_material() {
        let identity = ed448::EdDSAKeyPair::generate();
        let forging = ed448::EdDSAKeyPair::generate();
        let legacy = dsa::Keypair::generate();
        let mut profile = base_profile(&identity, &forging);
        profile.legacy_key = Some(legacy.public_key().clone());
        let payload = ClientProfilePayload::sign(&profile, &identity, Some(&legacy));
        let validated = round_trip(&payload).unwrap().validate().unwrap();
        assert_eq!(Some(legacy.public_key().clone()), validated.legacy_key);
    }

    #[test]
    fn test_profile_dsa_key_without_transitional_signature_fails() {
        let identity = ed448::EdDSAKeyPair::generate();
        let forging = ed448::EdDSAKeyPair::generate();
        let legacy = dsa::Keypair::generate();
        let mut profile = base_profile(&identity, &forging);
        profile.legacy_key = Some(legacy.public_key().clone());
        // legacy key present, but no keypair provided to produce the transitional signature
        let payload = ClientProfilePayload::sign(&profile, &identity, None);
        assert!(round_trip(&payload).unwrap().validate().is_err());
    }

    #[test]
    fn test_profile_must_support_version_4() {
        let identity = ed448::EdDSAKeyPair::generate();
        let forging = ed448::EdDSAKeyPair::generate();
        let mut profile = base_profile(&identity, &forging);
        profile.versions = vec![Version::V3];
        let payload = ClientProfilePayload::sign(&profile, &identity, None);
        assert!(round_trip(&payload).unwrap().validate().is_err());
    }

    #[test]
    fn test_expired_profile_fails() {
        let identity = ed448::EdDSAKeyPair::generate();
        let forging = ed448::EdDSAKeyPair::generate();
        let mut profile = base_profile(&identity, &forging);
        profile.expiration = i64::try_from(utils::time::unix_seconds_now()).unwrap() - 1;
        let payload = ClientProfilePayload::sign(&profile, &identity, None);
        assert!(round_trip(&payload).unwrap().validate().is_err());
    }

    #[test]
    fn test_signature_under_foreign_key_fails() {
        let identity = ed448::EdDSAKeyPair::generate();
        let forging = ed448::EdDSAKeyPair::generate();
        let other = ed448::EdDSAKeyPair::generate();
        let profile = base_profile(&identity, &forging);
        // signed by a key that is not the profile's identity key
        let payload = ClientProfilePayload::sign(&profile, &other, None);
        assert!(round_trip(&payload).unwrap().validate().is_err());
    }
}
