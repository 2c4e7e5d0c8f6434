// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use num_bigint::BigUint;

use crate::{
    clientprofile::{ClientProfile, ClientProfilePayload},
    crypto::{dh3072, ed448, otr4, shake256},
    encoding::{OTRDecoder, OTREncodable, OTREncoder, SSID},
    messages::EncodedMessageType,
    Host, OTRError,
};

/// `DAKEContext` is the state machine of the OTRv4 interactive deniable authenticated key
/// exchange: `Identity → Auth-R → Auth-I`.
pub struct DAKEContext {
    host: Rc<dyn Host>,
    state: State,
}

impl DAKEContext {
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self {
            host,
            state: State::Initial,
        }
    }

    /// `initiate` starts a new DAKE by producing the Identity message.
    pub fn initiate(&mut self) -> Result<EncodedMessageType, OTRError> {
        if !matches!(self.state, State::Initial) {
            return Err(OTRError::IncorrectState(
                "Authenticated key exchange in progress.",
            ));
        }
        log::info!("Initiating DAKE.");
        let payload_bytes = self.host.client_profile();
        let mut decoder = OTRDecoder::new(&payload_bytes);
        let payload = ClientProfilePayload::decode(&mut decoder)?;
        decoder.done()?;
        let y = ed448::ECDHKeyPair::generate();
        let b = dh3072::KeyPair::generate();
        let identity_message = IdentityMessage {
            profile: payload.clone(),
            y: y.public().clone(),
            b: b.public().clone(),
        };
        self.state = State::AwaitingAuthR {
            y,
            b,
            payload,
            identity_message: identity_message.clone(),
        };
        Ok(EncodedMessageType::Identity(identity_message))
    }

    /// `handle_identity` handles an incoming Identity message: validate the profile and keys,
    /// authenticate the transcript with a ring signature and respond with Auth-R.
    ///
    /// (Roles: Bob initiated, so it is Alice who answers his Identity message here.)
    pub fn handle_identity(
        &mut self,
        message: IdentityMessage,
        account: &[u8],
        contact: &[u8],
    ) -> Result<EncodedMessageType, OTRError> {
        let profile_bob: ClientProfile;
        match &self.state {
            State::Initial | State::AwaitingAuthI { .. } => {
                profile_bob = message.validate()?;
                // In `AwaitingAuthI` we follow the path of the new Identity message; there is no
                // risk in generating fresh key material.
            }
            State::AwaitingAuthR {
                identity_message, ..
            } => {
                profile_bob = message.validate()?;
                // Both parties initiated simultaneously. The tie is broken by comparing the
                // hashed DH public keys; the larger hash stands by its Identity message.
                let our_hashed_b = BigUint::from_bytes_be(&shake256::digest::<32>(
                    &OTREncoder::new().write_mpi(&identity_message.b).to_vec(),
                ));
                let their_hashed_b = BigUint::from_bytes_be(&shake256::digest::<32>(
                    &OTREncoder::new().write_mpi(&message.b).to_vec(),
                ));
                if our_hashed_b > their_hashed_b {
                    return Ok(EncodedMessageType::Identity(identity_message.clone()));
                }
            }
        }
        // Generate own key material and construct the Auth-R message.
        let payload_bytes = self.host.client_profile();
        let mut decoder = OTRDecoder::new(&payload_bytes);
        let payload_alice = ClientProfilePayload::decode(&mut decoder)?;
        decoder.done()?;
        let profile_alice = payload_alice.validate()?;
        let x = ed448::ECDHKeyPair::generate();
        let a = dh3072::KeyPair::generate();
        let tbytes = auth_r_transcript(
            &message.profile,
            &payload_alice,
            &message.y,
            x.public(),
            &message.b,
            a.public(),
            &profile_alice,
            &profile_bob,
            account,
            contact,
        );
        let keypair_identity = self.host.keypair_identity();
        let sigma = ed448::RingSignature::sign(
            keypair_identity,
            &profile_bob.forging_key,
            keypair_identity.public(),
            &message.y,
            &tbytes,
        )
        .map_err(OTRError::CryptographicViolation)?;
        let response = AuthRMessage {
            profile: payload_alice.clone(),
            x: x.public().clone(),
            a: a.public().clone(),
            sigma,
        };
        let k = otr4::MixedSharedSecret::new(&x, &a, &message.y, &message.b)
            .map_err(OTRError::CryptographicViolation)?
            .k();
        self.state = State::AwaitingAuthI {
            payload_alice,
            payload_bob: message.profile.clone(),
            x: x.public().clone(),
            y: message.y.clone(),
            a: a.public().clone(),
            b: message.b.clone(),
            k,
        };
        Ok(EncodedMessageType::AuthR(response))
    }

    /// `handle_auth_r` handles an incoming Auth-R message, verifying the transcript signature
    /// and producing the session key material together with the final Auth-I message.
    ///
    /// (Roles: Bob, the initiator, consumes Alice's Auth-R and closes with Auth-I.)
    pub fn handle_auth_r(
        &mut self,
        message: AuthRMessage,
        account: &[u8],
        contact: &[u8],
    ) -> Result<(MixedKeyMaterial, EncodedMessageType), OTRError> {
        let State::AwaitingAuthR {
            y,
            b,
            payload: payload_bob,
            identity_message: _,
        } = &self.state
        else {
            return Err(OTRError::IncorrectState(
                "Unexpected message received. Ignoring.",
            ));
        };
        log::debug!("Handling Auth-R message.");
        let profile_alice = message.validate()?;
        let profile_bob = payload_bob.validate()?;
        let tbytes = auth_r_transcript(
            payload_bob,
            &message.profile,
            y.public(),
            &message.x,
            b.public(),
            &message.a,
            &profile_alice,
            &profile_bob,
            contact,
            account,
        );
        message
            .sigma
            .validate(
                &profile_bob.forging_key,
                &profile_alice.identity_key,
                y.public(),
                &tbytes,
            )
            .map_err(OTRError::CryptographicViolation)?;
        log::debug!("Auth-R sigma validated.");
        // Generate the response Auth-I message.
        let tbytes = auth_i_transcript(
            payload_bob,
            &message.profile,
            y.public(),
            &message.x,
            b.public(),
            &message.a,
            &profile_alice,
            &profile_bob,
            account,
            contact,
        );
        let keypair_identity = self.host.keypair_identity();
        let sigma = ed448::RingSignature::sign(
            keypair_identity,
            keypair_identity.public(),
            &profile_alice.forging_key,
            &message.x,
            &tbytes,
        )
        .map_err(OTRError::CryptographicViolation)?;
        // Calculate the shared cryptographic material.
        let k = otr4::MixedSharedSecret::new(y, b, &message.x, &message.a)
            .map_err(OTRError::CryptographicViolation)?
            .k();
        let ssid = otr4::hwc::<8>(otr4::USAGE_SSID, &k);
        let material = MixedKeyMaterial {
            ssid,
            k,
            us: otr4::fingerprint(&profile_bob.identity_key, &profile_bob.forging_key),
            them: otr4::fingerprint(&profile_alice.identity_key, &profile_alice.forging_key),
        };
        self.state = State::Initial;
        Ok((material, EncodedMessageType::AuthI(AuthIMessage { sigma })))
    }

    /// `handle_auth_i` processes the received Auth-I message and concludes the DAKE, producing
    /// the session key material.
    ///
    /// (Roles: Alice verifies Bob's closing signature; nothing further is sent.)
    pub fn handle_auth_i(
        &mut self,
        message: AuthIMessage,
        account: &[u8],
        contact: &[u8],
    ) -> Result<MixedKeyMaterial, OTRError> {
        let State::AwaitingAuthI {
            payload_alice,
            payload_bob,
            x,
            y,
            a,
            b,
            k,
        } = &self.state
        else {
            return Err(OTRError::IncorrectState(
                "Unexpected message received. Ignoring.",
            ));
        };
        let profile_alice = payload_alice.validate()?;
        let profile_bob = payload_bob.validate()?;
        let tbytes = auth_i_transcript(
            payload_bob,
            payload_alice,
            y,
            x,
            b,
            a,
            &profile_alice,
            &profile_bob,
            contact,
            account,
        );
        message
            .sigma
            .validate(
                &profile_bob.identity_key,
                &profile_alice.forging_key,
                x,
                &tbytes,
            )
            .map_err(OTRError::CryptographicViolation)?;
        log::debug!("Auth-I sigma validated.");
        let ssid = otr4::hwc::<8>(otr4::USAGE_SSID, k);
        let material = MixedKeyMaterial {
            ssid,
            k: *k,
            us: otr4::fingerprint(&profile_alice.identity_key, &profile_alice.forging_key),
            them: otr4::fingerprint(&profile_bob.identity_key, &profile_bob.forging_key),
        };
        self.state = State::Initial;
        Ok(material)
    }
}

/// `auth_r_transcript` produces the transcript bytes `t` that the Auth-R ring signature covers.
#[allow(clippy::too_many_arguments)]
fn auth_r_transcript(
    payload_bob: &ClientProfilePayload,
    payload_alice: &ClientProfilePayload,
    y: &ed448::Point,
    x: &ed448::Point,
    b: &BigUint,
    a: &BigUint,
    profile_alice: &ClientProfile,
    profile_bob: &ClientProfile,
    account_first: &[u8],
    account_second: &[u8],
) -> Vec<u8> {
    transcript(
        0x00,
        otr4::USAGE_AUTH_R_BOB_CLIENT_PROFILE,
        otr4::USAGE_AUTH_R_ALICE_CLIENT_PROFILE,
        otr4::USAGE_AUTH_R_PHI,
        payload_bob,
        payload_alice,
        y,
        x,
        b,
        a,
        profile_alice,
        profile_bob,
        account_first,
        account_second,
    )
}

/// `auth_i_transcript` produces the transcript bytes `t'` that the Auth-I ring signature covers.
#[allow(clippy::too_many_arguments)]
fn auth_i_transcript(
    payload_bob: &ClientProfilePayload,
    payload_alice: &ClientProfilePayload,
    y: &ed448::Point,
    x: &ed448::Point,
    b: &BigUint,
    a: &BigUint,
    profile_alice: &ClientProfile,
    profile_bob: &ClientProfile,
    account_first: &[u8],
    account_second: &[u8],
) -> Vec<u8> {
    transcript(
        0x01,
        otr4::USAGE_AUTH_I_BOB_CLIENT_PROFILE,
        otr4::USAGE_AUTH_I_ALICE_CLIENT_PROFILE,
        otr4::USAGE_AUTH_I_PHI,
        payload_bob,
        payload_alice,
        y,
        x,
        b,
        a,
        profile_alice,
        profile_bob,
        account_first,
        account_second,
    )
}

#[allow(clippy::too_many_arguments)]
fn transcript(
    prefix: u8,
    usage_bob: u8,
    usage_alice: u8,
    usage_phi: u8,
    payload_bob: &ClientProfilePayload,
    payload_alice: &ClientProfilePayload,
    y: &ed448::Point,
    x: &ed448::Point,
    b: &BigUint,
    a: &BigUint,
    profile_alice: &ClientProfile,
    profile_bob: &ClientProfile,
    account_first: &[u8],
    account_second: &[u8],
) -> Vec<u8> {
    // `phi` is the shared session state: both instance tags and both account identifiers.
    let phi = otr4::hwc::<64>(
        usage_phi,
        &OTREncoder::new()
            .write_u32(profile_alice.owner_tag)
            .write_u32(profile_bob.owner_tag)
            .write_data(account_first)
            .write_data(account_second)
            .to_vec(),
    );
    OTREncoder::new()
        .write_u8(prefix)
        .write(&otr4::hwc::<64>(
            usage_bob,
            &OTREncoder::new().write_encodable(payload_bob).to_vec(),
        ))
        .write(&otr4::hwc::<64>(
            usage_alice,
            &OTREncoder::new().write_encodable(payload_alice).to_vec(),
        ))
        .write_ed448_point(y)
        .write_ed448_point(x)
        .write_mpi(b)
        .write_mpi(a)
        .write(&phi)
        .to_vec()
}

/// `MixedKeyMaterial` is the result of a completed DAKE: the session identifier, the mixed
/// shared secret `K` that all further key derivation builds on, and the fingerprints of both
/// parties.
pub struct MixedKeyMaterial {
    pub ssid: SSID,
    pub k: [u8; otr4::K_LENGTH],
    pub us: otr4::Fingerprint,
    pub them: otr4::Fingerprint,
}

/// Interactive DAKE states.
#[allow(clippy::large_enum_variant)]
enum State {
    /// `Initial` is the state in which Bob initiates the DAKE or Alice receives Bob's Identity
    /// message.
    Initial,
    /// `AwaitingAuthR` is Bob's state while awaiting Alice's Auth-R message.
    AwaitingAuthR {
        y: ed448::ECDHKeyPair,
        b: dh3072::KeyPair,
        payload: ClientProfilePayload,
        identity_message: IdentityMessage,
    },
    /// `AwaitingAuthI` is Alice's state while awaiting Bob's Auth-I message.
    AwaitingAuthI {
        payload_alice: ClientProfilePayload,
        payload_bob: ClientProfilePayload,
        x: ed448::Point,
        y: ed448::Point,
        a: BigUint,
        b: BigUint,
        k: [u8; otr4::K_LENGTH],
    },
}

#[derive(Clone)]
pub struct IdentityMessage {
    pub profile: ClientProfilePayload,
    pub y: ed448::Point,
    pub b: BigUint,
}

impl OTREncodable for IdentityMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_encodable(&self.profile)
            .write_ed448_point(&self.y)
            .write_mpi(&self.b);
    }
}

impl IdentityMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let profile = ClientProfilePayload::decode(decoder)?;
        let y = decoder.read_ed448_point()?;
        let b = decoder.read_mpi()?;
        Ok(Self { profile, y, b })
    }

    fn validate(&self) -> Result<ClientProfile, OTRError> {
        let profile_bob = self.profile.validate()?;
        ed448::verify(&self.y).map_err(OTRError::CryptographicViolation)?;
        dh3072::verify(&self.b).map_err(OTRError::CryptographicViolation)?;
        Ok(profile_bob)
    }
}

#[derive(Clone)]
pub struct AuthRMessage {
    pub profile: ClientProfilePayload,
    pub x: ed448::Point,
    pub a: BigUint,
    pub sigma: ed448::RingSignature,
}

impl OTREncodable for AuthRMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_encodable(&self.profile)
            .write_ed448_point(&self.x)
            .write_mpi(&self.a)
            .write_encodable(&self.sigma);
    }
}

impl AuthRMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let profile = ClientProfilePayload::decode(decoder)?;
        let x = decoder.read_ed448_point()?;
        let a = decoder.read_mpi()?;
        let sigma = ed448::RingSignature::decode(decoder)?;
        Ok(Self {
            profile,
            x,
            a,
            sigma,
        })
    }

    fn validate(&self) -> Result<ClientProfile, OTRError> {
        let profile_alice = self.profile.validate()?;
        ed448::verify(&self.x).map_err(OTRError::CryptographicViolation)?;
        dh3072::verify(&self.a).map_err(OTRError::CryptographicViolation)?;
        Ok(profile_alice)
    }
}

#[derive(Clone)]
pub struct AuthIMessage {
    pub sigma: ed448::RingSignature,
}

impl OTREncodable for AuthIMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder.write_encodable(&self.sigma);
    }
}

impl AuthIMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let sigma = ed448::RingSignature::decode(decoder)?;
        Ok(Self { sigma })
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::DAKEContext;
    use crate::{
        clientprofile::{ClientProfile, ClientProfilePayload},
        crypto::{dsa, ed448},
        encoding::OTREncoder,
        messages::EncodedMessageType,
        utils, Host, Policy, Version,
    };

    struct TestHost {
        keypair: dsa::Keypair,
        identity: ed448::EdDSAKeyPair,
        profile_payload: Vec<u8>,
    }

    impl TestHost {
        fn new(tag: u32) -> Self {
            let keypair = dsa::Keypair::generate();
            let identity = ed448::EdDSAKeyPair::generate();
            let forging = ed448::EdDSAKeyPair::generate();
            let profile = ClientProfile {
                owner_tag: tag,
                identity_key: identity.public().clone(),
                forging_key: forging.public().clone(),
                versions: vec![Version::V3, Version::V4],
                expiration: i64::try_from(utils::time::unix_seconds_now()).unwrap() + 24 * 3600,
                legacy_key: None,
            };
            let payload = ClientProfilePayload::sign(&profile, &identity, None);
            let profile_payload = OTREncoder::new().write_encodable(&payload).to_vec();
            Self {
                keypair,
                identity,
                profile_payload,
            }
        }
    }

    impl Host for TestHost {
        fn inject(&self, _message: &[u8]) {
            panic!("unexpected inject in DAKE tests")
        }

        fn keypair(&self) -> &dsa::Keypair {
            &self.keypair
        }

        fn keypair_identity(&self) -> &ed448::EdDSAKeyPair {
            &self.identity
        }

        fn client_profile(&self) -> Vec<u8> {
            self.profile_payload.clone()
        }

        fn policy(&self) -> Policy {
            Policy::ALLOW_V3
        }

        fn max_message_size(&self) -> usize {
            usize::MAX
        }
    }

    #[test]
    fn test_dake_dual_run_agreement() {
        let host_alice: Rc<dyn Host> = Rc::new(TestHost::new(0x0000_0abc));
        let host_bob: Rc<dyn Host> = Rc::new(TestHost::new(0x0000_0def));
        let mut alice = DAKEContext::new(host_alice);
        let mut bob = DAKEContext::new(host_bob);
        let identity = match bob.initiate().unwrap() {
            EncodedMessageType::Identity(msg) => msg,
            _ => panic!("expected Identity message"),
        };
        let auth_r = match alice
            .handle_identity(identity, b"alice@example.org", b"bob@example.org")
            .unwrap()
        {
            EncodedMessageType::AuthR(msg) => msg,
            _ => panic!("expected Auth-R message"),
        };
        let (material_bob, auth_i) = bob
            .handle_auth_r(auth_r, b"bob@example.org", b"alice@example.org")
            .unwrap();
        let auth_i = match auth_i {
            EncodedMessageType::AuthI(msg) => msg,
            _ => panic!("expected Auth-I message"),
        };
        let material_alice = alice
            .handle_auth_i(auth_i, b"alice@example.org", b"bob@example.org")
            .unwrap();
        assert_eq!(material_alice.ssid, material_bob.ssid);
        assert_eq!(material_alice.k, material_bob.k);
        assert_eq!(material_alice.us, material_bob.them);
        assert_eq!(material_alice.them, material_bob.us);
    }

    #[test]
    fn test_dake_tampered_auth_r_rejected() {
        let host_alice: Rc<dyn Host> = Rc::new(TestHost::new(0x0000_0abc));
        let host_bob: Rc<dyn Host> = Rc::new(TestHost::new(0x0000_0def));
        let mut alice = DAKEContext::new(host_alice);
        let mut bob = DAKEContext::new(host_bob);
        let identity = match bob.initiate().unwrap() {
            EncodedMessageType::Identity(msg) => msg,
            _ => panic!("expected Identity message"),
        };
        let mut auth_r = match alice
            .handle_identity(identity, b"alice@example.org", b"bob@example.org")
            .unwrap()
        {
            EncodedMessageType::AuthR(msg) => msg,
            _ => panic!("expected Auth-R message"),
        };
        // replace the ephemeral point: the transcript signature no longer matches
        auth_r.x = ed448::ECDHKeyPair::generate().public().clone();
        assert!(bob
            .handle_auth_r(auth_r, b"bob@example.org", b"alice@example.org")
            .is_err());
    }

    #[test]
    fn test_dake_simultaneous_identity_tie_break() {
        let host_alice: Rc<dyn Host> = Rc::new(TestHost::new(0x0000_0abc));
        let host_bob: Rc<dyn Host> = Rc::new(TestHost::new(0x0000_0def));
        let mut alice = DAKEContext::new(host_alice);
        let mut bob = DAKEContext::new(host_bob);
        let identity_alice = match alice.initiate().unwrap() {
            EncodedMessageType::Identity(msg) => msg,
            _ => panic!("expected Identity message"),
        };
        let identity_bob = match bob.initiate().unwrap() {
            EncodedMessageType::Identity(msg) => msg,
            _ => panic!("expected Identity message"),
        };
        let response_alice = alice
            .handle_identity(identity_bob, b"alice@example.org", b"bob@example.org")
            .unwrap();
        let response_bob = bob
            .handle_identity(identity_alice, b"bob@example.org", b"alice@example.org")
            .unwrap();
        // Exactly one side concedes and answers with Auth-R; the other resends its Identity.
        let responses = [&response_alice, &response_bob];
        assert_eq!(
            1,
            responses
                .iter()
                .filter(|m| matches!(m, EncodedMessageType::AuthR(_)))
                .count()
        );
        assert_eq!(
            1,
            responses
                .iter()
                .filter(|m| matches!(m, EncodedMessageType::Identity(_)))
                .count()
        );
    }
}
