// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use num_bigint::BigUint;

use crate::{
    crypto::{aes128, constant, dh, dsa, otr::AKESecrets, sha256, CryptoError},
    encoding::{OTRDecoder, OTREncodable, OTREncoder, MAC, SSID},
    messages::EncodedMessageType,
    utils, Host, Version,
};

/// Both parties sign their very first key with keyid 1 during the AKE.
const KEYID_INITIAL: u32 = 1;

/// `AKEContext` is the state machine of the interactive signature-based authenticated key
/// exchange of OTRv2/OTRv3.
pub struct AKEContext {
    version: Version,
    host: Rc<dyn Host>,
    state: AKEState,
}

impl AKEContext {
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self {
            version: Version::None,
            host,
            state: AKEState::None,
        }
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// `initiate` starts a fresh AKE for the specified protocol version by producing the
    /// DH-Commit message. Any exchange in progress is abandoned.
    pub fn initiate(&mut self, version: Version) -> EncodedMessageType {
        assert!(version == Version::V2 || version == Version::V3);
        log::info!("Initiating AKE.");
        let keypair = dh::Keypair::generate();
        let r = aes128::Key::generate();
        let gxmpi = OTREncoder::new().write_mpi(&keypair.public).to_vec();
        let gx_encrypted = r.encrypt(&[0; 16], &gxmpi);
        let gx_hashed = Vec::from(sha256::digest(&gxmpi));
        self.version = version;
        // Send the D-H Commit message and await the D-H Key message.
        self.state = AKEState::AwaitingDHKey(AwaitingDHKey {
            our_dh_keypair: Rc::new(keypair),
            r,
        });
        EncodedMessageType::DHCommit(DHCommitMessage {
            gx_encrypted,
            gx_hashed,
        })
    }

    /// `transfer` duplicates the in-flight exchange so that a per-instance session can continue
    /// it. This covers exactly one situation: a DH-Commit went out with receiver tag zero (the
    /// other client's tag was not yet known), and now a DH-Key answer reveals that tag. Any
    /// state other than `AwaitingDHKey` refuses the transfer.
    pub fn transfer(&self) -> Result<AKEContext, AKEError> {
        match &self.state {
            AKEState::AwaitingDHKey(state) => Ok(Self {
                version: self.version,
                host: Rc::clone(&self.host),
                state: AKEState::AwaitingDHKey(AwaitingDHKey {
                    our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                    r: state.r.clone(),
                }),
            }),
            AKEState::None
            | AKEState::AwaitingRevealSignature(_)
            | AKEState::AwaitingSignature(_) => Err(AKEError::IncorrectState),
        }
    }

    /// `handle_dhcommit` handles an incoming DH-Commit message. The other party may propose a
    /// different protocol version than any exchange currently in flight; the caller verifies the
    /// proposed version against policy before delegating here.
    pub fn handle_dhcommit(
        &mut self,
        version: Version,
        msg: DHCommitMessage,
    ) -> Result<EncodedMessageType, AKEError> {
        let (result, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingSignature(_) => {
                // A commit starts (or restarts) the exchange: answer with a fresh D-H Key and
                // await the reveal.
                Self::respond_dhkey(msg)
            }
            AKEState::AwaitingDHKey(state) => {
                // Commit collision: our own D-H Commit message is still unanswered, and now the
                // other party's commit crosses it on the wire. Exactly one commit may survive,
                // so both ends apply the same rule: interpret the two gx hashes as 32-byte
                // unsigned big-endian numbers, and the larger one stands.
                let gxmpi = OTREncoder::new()
                    .write_mpi(&state.our_dh_keypair.public)
                    .to_vec();
                let our_gxmpi_hashed = sha256::digest(&gxmpi);
                let our_hash = BigUint::from_bytes_be(&our_gxmpi_hashed);
                let their_hash = BigUint::from_bytes_be(&msg.gx_hashed);
                if our_hash > their_hash {
                    // We win: drop their commit and repeat our own, unchanged.
                    let our_gx_encrypted = state.r.encrypt(&[0u8; 16], &gxmpi);
                    let dhcommit = EncodedMessageType::DHCommit(DHCommitMessage {
                        gx_encrypted: our_gx_encrypted,
                        gx_hashed: Vec::from(our_gxmpi_hashed),
                    });
                    (Ok(dhcommit), None)
                } else {
                    // We lose: abandon our own gx and answer their commit as if no exchange had
                    // been started on this side.
                    Self::respond_dhkey(msg)
                }
            }
            AKEState::AwaitingRevealSignature(state) => {
                // A second commit while we already answered one, e.g. a retransmission or a
                // restarted exchange. The stored commit data is replaced with the newly received
                // values; our earlier D-H Key message goes out again unchanged.
                let dhkey = EncodedMessageType::DHKey(DHKeyMessage {
                    gy: state.our_dh_keypair.public.clone(),
                });
                (
                    Ok(dhkey),
                    Some(AKEState::AwaitingRevealSignature(AwaitingRevealSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gx_encrypted: msg.gx_encrypted,
                        gx_hashed: msg.gx_hashed,
                    })),
                )
            }
        };
        if let Some(next) = transition {
            self.version = version;
            self.state = next;
        }
        result
    }

    fn respond_dhkey(
        msg: DHCommitMessage,
    ) -> (Result<EncodedMessageType, AKEError>, Option<AKEState>) {
        let keypair = dh::Keypair::generate();
        let dhkey = EncodedMessageType::DHKey(DHKeyMessage {
            gy: keypair.public.clone(),
        });
        (
            Ok(dhkey),
            Some(AKEState::AwaitingRevealSignature(AwaitingRevealSignature {
                our_dh_keypair: Rc::new(keypair),
                gx_encrypted: msg.gx_encrypted,
                gx_hashed: msg.gx_hashed,
            })),
        )
    }

    /// `handle_dhkey` handles an incoming DH-Key message.
    pub fn handle_dhkey(&mut self, msg: DHKeyMessage) -> Result<EncodedMessageType, AKEError> {
        let (result, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingRevealSignature(_) => {
                // Ignore the message.
                return Err(AKEError::MessageIgnored);
            }
            AKEState::AwaitingDHKey(state) => {
                dh::verify_public_key(&msg.gy).map_err(AKEError::CryptographicViolation)?;
                // Their D-H key completes the shared secret on our side. Authenticate ourselves
                // with the Reveal-Signature message, which also discloses the commit key `r`,
                // and move to AUTHSTATE_AWAITING_SIG.
                let s = state.our_dh_keypair.generate_shared_secret(&msg.gy);
                let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&s).to_vec());
                let keypair = self.host.keypair();
                let pub_b = keypair.public_key();
                let m_b = sha256::hmac(
                    &secrets.m1,
                    &OTREncoder::new()
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_mpi(&msg.gy)
                        .write_public_key(pub_b)
                        .write_u32(KEYID_INITIAL)
                        .to_vec(),
                );
                // DSA is applied to M_B in the protocol's slightly non-standard way: the
                // 32-byte value is reduced mod q instead of truncated, and signed directly
                // without another hash pass.
                let sig_b = keypair.sign(&m_b);
                let x_b = OTREncoder::new()
                    .write_public_key(pub_b)
                    .write_u32(KEYID_INITIAL)
                    .write_dsa_signature(&sig_b)
                    .to_vec();
                let signature_encrypted = secrets.c.encrypt(&[0; 16], &x_b);
                let signature_mac = sha256::hmac160(
                    &secrets.m2,
                    &OTREncoder::new().write_data(&signature_encrypted).to_vec(),
                );
                let reveal_sig_message = RevealSignatureMessage {
                    key: state.r.clone(),
                    signature_encrypted,
                    signature_mac,
                };
                (
                    Ok(EncodedMessageType::RevealSignature(
                        reveal_sig_message.clone(),
                    )),
                    Some(AKEState::AwaitingSignature(AwaitingSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gy: msg.gy,
                        s,
                        previous_message: reveal_sig_message,
                    })),
                )
            }
            AKEState::AwaitingSignature(state) => {
                if state.gy != msg.gy {
                    // Ignore the message.
                    return Err(AKEError::MessageIgnored);
                }
                // The duplicate of a DH-Key message we responded to before: retransmit the
                // Reveal Signature message.
                (
                    Ok(EncodedMessageType::RevealSignature(
                        state.previous_message.clone(),
                    )),
                    None,
                )
            }
        };
        if let Some(next) = transition {
            self.state = next;
        }
        result
    }

    /// `handle_reveal_signature` handles an incoming Reveal-Signature message. On success it
    /// produces the cryptographic material of the established session together with the
    /// Signature message to respond with.
    #[allow(clippy::too_many_lines)]
    pub fn handle_reveal_signature(
        &mut self,
        msg: RevealSignatureMessage,
    ) -> Result<(CryptographicMaterial, EncodedMessageType), AKEError> {
        let (result, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingDHKey(_) | AKEState::AwaitingSignature(_) => {
                // Ignore the message.
                return Err(AKEError::MessageIgnored);
            }
            AKEState::AwaitingRevealSignature(state) => {
                // The revealed key `r` finally opens the commitment from the first message.
                // Everything must check out, in order: the opened gx against the committed
                // hash, the MAC over the encrypted signature, and the signature itself. Only
                // then do we authenticate ourselves in return and consider the session keys
                // established.
                let gxmpi = msg.key.decrypt(&[0; 16], &state.gx_encrypted);
                let gxmpihash = sha256::digest(&gxmpi);
                constant::verify(&gxmpihash, &state.gx_hashed)
                    .map_err(AKEError::CryptographicViolation)?;
                log::debug!("gxmpi verified: correct");

                // Verify the acquired g^x value.
                let gx = OTRDecoder::new(&gxmpi)
                    .read_mpi()
                    .or(Err(AKEError::DataProcessing(
                        "Failed to read MPI from revealed gxmpi",
                    )))?;
                dh::verify_public_key(&gx).map_err(AKEError::CryptographicViolation)?;
                log::debug!("gx verified: correct");

                // The m2-keyed MAC must pass before the encrypted signature is worth touching.
                let s = state.our_dh_keypair.generate_shared_secret(&gx);
                let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&s).to_vec());
                let expected_signature_mac = sha256::hmac160(
                    &secrets.m2,
                    &OTREncoder::new()
                        .write_data(&msg.signature_encrypted)
                        .to_vec(),
                );
                constant::verify(&expected_signature_mac, &msg.signature_mac)
                    .map_err(AKEError::CryptographicViolation)?;
                log::debug!("signature MAC verified: correct");

                // Decrypt X_B and pull out Bob's long-term key, keyid and signature.
                let x_b = secrets.c.decrypt(&[0; 16], &msg.signature_encrypted);
                let mut decoder = OTRDecoder::new(&x_b);
                let pub_b = decoder.read_public_key().or(Err(AKEError::DataProcessing(
                    "Failed to read public key from X_B",
                )))?;
                let keyid_b = decoder.read_u32().or(Err(AKEError::DataProcessing(
                    "Failed to read keyid from X_B",
                )))?;
                utils::u32::verify_nonzero(
                    keyid_b,
                    AKEError::DataProcessing("keyid_b is zero, must be a non-zero value"),
                )?;
                let sig_b = decoder.read_dsa_signature().or(Err(
                    AKEError::DataProcessing("Failed to read signature from X_B"),
                ))?;
                decoder
                    .done()
                    .or(Err(AKEError::DataProcessing("data left over in X_B")))?;
                // Compute M_B from our own view of the exchange and check Bob's signature over
                // it: a valid signature binds his long-term key and keyid to exactly these
                // ephemeral keys, ruling out substitution by a third party.
                let m_b = sha256::hmac(
                    &secrets.m1,
                    &OTREncoder::new()
                        .write_mpi(&gx)
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_public_key(&pub_b)
                        .write_u32(keyid_b)
                        .to_vec(),
                );
                pub_b
                    .verify(&sig_b, &m_b)
                    .map_err(AKEError::CryptographicViolation)?;
                log::debug!("M_B verified: correct");

                let keypair = self.host.keypair();
                let m_a = sha256::hmac(
                    &secrets.m1p,
                    &OTREncoder::new()
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_mpi(&gx)
                        .write_public_key(keypair.public_key())
                        .write_u32(KEYID_INITIAL)
                        .to_vec(),
                );
                let sig_m_a = keypair.sign(&m_a);
                let x_a = OTREncoder::new()
                    .write_public_key(keypair.public_key())
                    .write_u32(KEYID_INITIAL)
                    .write_dsa_signature(&sig_m_a)
                    .to_vec();
                let signature_encrypted = secrets.cp.encrypt(&[0; 16], &x_a);
                let signature_mac = sha256::hmac160(
                    &secrets.m2p,
                    &OTREncoder::new().write_data(&signature_encrypted).to_vec(),
                );
                (
                    Ok((
                        CryptographicMaterial {
                            version: self.version,
                            ssid: secrets.ssid,
                            our_dh: (*state.our_dh_keypair).clone(),
                            their_dh: gx,
                            their_dsa: pub_b,
                        },
                        EncodedMessageType::Signature(SignatureMessage {
                            signature_encrypted,
                            signature_mac,
                        }),
                    )),
                    AKEState::None,
                )
            }
        };
        self.state = transition;
        result
    }

    /// `handle_signature` handles an incoming Signature message, which concludes the AKE for the
    /// initiating party.
    pub fn handle_signature(
        &mut self,
        msg: SignatureMessage,
    ) -> Result<CryptographicMaterial, AKEError> {
        let (result, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingDHKey(_) | AKEState::AwaitingRevealSignature(_) => {
                // Ignore the message.
                return Err(AKEError::MessageIgnored);
            }
            AKEState::AwaitingSignature(state) => {
                // Alice's final message mirrors the checks we just passed ourselves: MAC first,
                // then decrypt X_A and validate her signature over M_A. Success concludes the
                // exchange and the session becomes encrypted.
                let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&state.s).to_vec());
                let mac = sha256::hmac160(
                    &secrets.m2p,
                    &OTREncoder::new()
                        .write_data(&msg.signature_encrypted)
                        .to_vec(),
                );
                constant::verify(&mac, &msg.signature_mac)
                    .map_err(AKEError::CryptographicViolation)?;
                log::debug!("signature MAC verified: correct");
                let x_a = secrets.cp.decrypt(&[0; 16], &msg.signature_encrypted);
                let mut decoder = OTRDecoder::new(&x_a);
                let pub_a = decoder.read_public_key().or(Err(AKEError::DataProcessing(
                    "Failed to read public key from X_A",
                )))?;
                let keyid_a = decoder.read_u32().or(Err(AKEError::DataProcessing(
                    "Failed to read keyid from X_A",
                )))?;
                utils::u32::verify_nonzero(
                    keyid_a,
                    AKEError::DataProcessing("keyid_a is zero, must be a non-zero value"),
                )?;
                let sig_m_a = decoder.read_dsa_signature().or(Err(
                    AKEError::DataProcessing("Failed to read signature from X_A"),
                ))?;
                decoder
                    .done()
                    .or(Err(AKEError::DataProcessing("data left over in X_A")))?;
                let m_a = sha256::hmac(
                    &secrets.m1p,
                    &OTREncoder::new()
                        .write_mpi(&state.gy)
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_public_key(&pub_a)
                        .write_u32(keyid_a)
                        .to_vec(),
                );
                pub_a
                    .verify(&sig_m_a, &m_a)
                    .map_err(AKEError::CryptographicViolation)?;
                log::debug!("M_A signature verified: correct");
                (
                    Ok(CryptographicMaterial {
                        version: self.version,
                        ssid: secrets.ssid,
                        our_dh: (*state.our_dh_keypair).clone(),
                        their_dh: state.gy.clone(),
                        their_dsa: pub_a,
                    }),
                    AKEState::None,
                )
            }
        };
        self.state = transition;
        result
    }
}

/// `CryptographicMaterial` is what a completed AKE hands over to the encrypted session: the
/// session identifier, both DH keys of the initial pair, and the authenticated long-term key of
/// the other party. Key IDs are omitted; the initial pair is 1 on both sides.
pub struct CryptographicMaterial {
    pub version: Version,
    pub ssid: SSID,
    pub our_dh: dh::Keypair,
    pub their_dh: BigUint,
    pub their_dsa: dsa::PublicKey,
}

/// `AKEState` enumerates the exchange's states; each carries what its transitions still need.
enum AKEState {
    /// No exchange in progress.
    None,
    /// Our DH-Commit is out; the commit key and keypair are kept for the remaining steps.
    AwaitingDHKey(AwaitingDHKey),
    /// We answered a commit with our DH-Key; the commitment is kept for later opening.
    AwaitingRevealSignature(AwaitingRevealSignature),
    /// We sent Reveal-Signature; the shared secret and the sent message are kept for the
    /// conclusion and for retransmission.
    AwaitingSignature(AwaitingSignature),
}

struct AwaitingDHKey {
    r: aes128::Key,
    our_dh_keypair: Rc<dh::Keypair>,
}

struct AwaitingRevealSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gx_encrypted: Vec<u8>,
    gx_hashed: Vec<u8>,
}

struct AwaitingSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gy: BigUint,
    s: dh::SharedSecret,
    previous_message: RevealSignatureMessage,
}

impl Drop for AwaitingSignature {
    fn drop(&mut self) {
        self.s = BigUint::default();
    }
}

/// `AKEError` contains the error variants produced while processing AKE messages.
#[derive(Debug)]
pub enum AKEError {
    /// A cryptographic check (hash, MAC, signature, range) did not hold.
    CryptographicViolation(CryptoError),
    /// The message does not fit the exchange at this point and is dropped without effect.
    MessageIgnored,
    /// A message component could not be read: truncated or malformed input.
    DataProcessing(&'static str),
    /// The operation is not available in the current exchange state.
    IncorrectState,
}

pub struct DHCommitMessage {
    pub gx_encrypted: Vec<u8>,
    pub gx_hashed: Vec<u8>,
}

impl DHCommitMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<DHCommitMessage, crate::OTRError> {
        Ok(DHCommitMessage {
            gx_encrypted: decoder.read_data()?,
            gx_hashed: decoder.read_data()?,
        })
    }
}

impl OTREncodable for DHCommitMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.gx_encrypted)
            .write_data(&self.gx_hashed);
    }
}

pub struct DHKeyMessage {
    pub gy: BigUint,
}

impl DHKeyMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<DHKeyMessage, crate::OTRError> {
        Ok(DHKeyMessage {
            gy: decoder.read_mpi()?,
        })
    }
}

impl OTREncodable for DHKeyMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder.write_mpi(&self.gy);
    }
}

#[derive(Clone)]
pub struct RevealSignatureMessage {
    pub key: aes128::Key,
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: MAC,
}

impl RevealSignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<RevealSignatureMessage, crate::OTRError> {
        Ok(RevealSignatureMessage {
            key: aes128::Key(decoder.read_data()?.try_into().or(Err(
                crate::OTRError::ProtocolViolation("Invalid format for 128-bit AES key."),
            ))?),
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

impl OTREncodable for RevealSignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.key.0)
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

pub struct SignatureMessage {
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: MAC,
}

impl SignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<SignatureMessage, crate::OTRError> {
        Ok(SignatureMessage {
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

impl OTREncodable for SignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::{AKEContext, CryptographicMaterial};
    use crate::{
        crypto::{dsa, ed448},
        messages::EncodedMessageType,
        Host, Policy, Version,
    };

    struct TestHost(dsa::Keypair);

    impl Host for TestHost {
        fn inject(&self, _message: &[u8]) {
            panic!("unexpected inject in AKE tests")
        }

        fn keypair(&self) -> &dsa::Keypair {
            &self.0
        }

        fn keypair_identity(&self) -> &ed448::EdDSAKeyPair {
            unimplemented!("not used in AKE tests")
        }

        fn client_profile(&self) -> Vec<u8> {
            Vec::new()
        }

        fn policy(&self) -> Policy {
            Policy::ALLOW_V3
        }

        fn max_message_size(&self) -> usize {
            usize::MAX
        }
    }

    fn run_ake(
        alice: &mut AKEContext,
        bob: &mut AKEContext,
    ) -> (CryptographicMaterial, CryptographicMaterial) {
        let dhcommit = match bob.initiate(Version::V3) {
            EncodedMessageType::DHCommit(msg) => msg,
            _ => panic!("expected DH-Commit"),
        };
        let dhkey = match alice.handle_dhcommit(Version::V3, dhcommit).unwrap() {
            EncodedMessageType::DHKey(msg) => msg,
            _ => panic!("expected DH-Key"),
        };
        let revealsig = match bob.handle_dhkey(dhkey).unwrap() {
            EncodedMessageType::RevealSignature(msg) => msg,
            _ => panic!("expected Reveal-Signature"),
        };
        let (material_alice, signature) = alice.handle_reveal_signature(revealsig).unwrap();
        let signature = match signature {
            EncodedMessageType::Signature(msg) => msg,
            _ => panic!("expected Signature"),
        };
        let material_bob = bob.handle_signature(signature).unwrap();
        (material_alice, material_bob)
    }

    #[test]
    fn test_ake_dual_run_derives_identical_secrets() {
        let host_alice: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let host_bob: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let mut alice = AKEContext::new(Rc::clone(&host_alice));
        let mut bob = AKEContext::new(Rc::clone(&host_bob));
        let (material_alice, material_bob) = run_ake(&mut alice, &mut bob);
        assert_eq!(material_alice.ssid, material_bob.ssid);
        assert_eq!(material_alice.our_dh.public, material_bob.their_dh);
        assert_eq!(material_bob.our_dh.public, material_alice.their_dh);
        assert_eq!(&material_alice.their_dsa, host_bob.keypair().public_key());
        assert_eq!(&material_bob.their_dsa, host_alice.keypair().public_key());
    }

    #[test]
    fn test_ake_simultaneous_dhcommit_tie_break() {
        let host_alice: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let host_bob: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let mut alice = AKEContext::new(host_alice);
        let mut bob = AKEContext::new(host_bob);
        let commit_alice = match alice.initiate(Version::V3) {
            EncodedMessageType::DHCommit(msg) => msg,
            _ => panic!("expected DH-Commit"),
        };
        let commit_bob = match bob.initiate(Version::V3) {
            EncodedMessageType::DHCommit(msg) => msg,
            _ => panic!("expected DH-Commit"),
        };
        // Both receive the other's DH-Commit: exactly one side concedes with a DH-Key reply,
        // the other resends its own DH-Commit.
        let response_alice = alice.handle_dhcommit(Version::V3, commit_bob).unwrap();
        let response_bob = bob.handle_dhcommit(Version::V3, commit_alice).unwrap();
        let concessions = [&response_alice, &response_bob]
            .iter()
            .filter(|m| matches!(m, EncodedMessageType::DHKey(_)))
            .count();
        let resends = [&response_alice, &response_bob]
            .iter()
            .filter(|m| matches!(m, EncodedMessageType::DHCommit(_)))
            .count();
        assert_eq!(1, concessions);
        assert_eq!(1, resends);
        // The exchange completes towards a single encrypted session.
        let (material_1, material_2) = match (response_alice, response_bob) {
            (EncodedMessageType::DHKey(dhkey), EncodedMessageType::DHCommit(_)) => {
                // Bob won the tie-break: Bob's commit stands, Alice conceded.
                let revealsig = match bob.handle_dhkey(dhkey).unwrap() {
                    EncodedMessageType::RevealSignature(msg) => msg,
                    _ => panic!("expected Reveal-Signature"),
                };
                let (material_alice, response) = alice.handle_reveal_signature(revealsig).unwrap();
                let signature = match response {
                    EncodedMessageType::Signature(msg) => msg,
                    _ => panic!("expected Signature"),
                };
                (material_alice, bob.handle_signature(signature).unwrap())
            }
            (EncodedMessageType::DHCommit(_), EncodedMessageType::DHKey(dhkey)) => {
                let revealsig = match alice.handle_dhkey(dhkey).unwrap() {
                    EncodedMessageType::RevealSignature(msg) => msg,
                    _ => panic!("expected Reveal-Signature"),
                };
                let (material_bob, response) = bob.handle_reveal_signature(revealsig).unwrap();
                let signature = match response {
                    EncodedMessageType::Signature(msg) => msg,
                    _ => panic!("expected Signature"),
                };
                (material_bob, alice.handle_signature(signature).unwrap())
            }
            _ => panic!("BUG: unexpected message combination"),
        };
        assert_eq!(material_1.ssid, material_2.ssid);
    }

    #[test]
    fn test_ake_duplicate_dhkey_retransmits_revealsignature() {
        let host_alice: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let host_bob: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let mut alice = AKEContext::new(host_alice);
        let mut bob = AKEContext::new(host_bob);
        let dhcommit = match bob.initiate(Version::V3) {
            EncodedMessageType::DHCommit(msg) => msg,
            _ => panic!("expected DH-Commit"),
        };
        let dhkey = match alice.handle_dhcommit(Version::V3, dhcommit).unwrap() {
            EncodedMessageType::DHKey(msg) => msg,
            _ => panic!("expected DH-Key"),
        };
        let duplicate = super::DHKeyMessage {
            gy: dhkey.gy.clone(),
        };
        let first = match bob.handle_dhkey(dhkey).unwrap() {
            EncodedMessageType::RevealSignature(msg) => msg,
            _ => panic!("expected Reveal-Signature"),
        };
        let second = match bob.handle_dhkey(duplicate).unwrap() {
            EncodedMessageType::RevealSignature(msg) => msg,
            _ => panic!("expected Reveal-Signature"),
        };
        assert_eq!(first.signature_encrypted, second.signature_encrypted);
        assert_eq!(first.signature_mac, second.signature_mac);
    }

    #[test]
    fn test_ake_tampered_revealsignature_rejected() {
        let host_alice: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let host_bob: Rc<dyn Host> = Rc::new(TestHost(dsa::Keypair::generate()));
        let mut alice = AKEContext::new(host_alice);
        let mut bob = AKEContext::new(host_bob);
        let dhcommit = match bob.initiate(Version::V3) {
            EncodedMessageType::DHCommit(msg) => msg,
            _ => panic!("expected DH-Commit"),
        };
        let dhkey = match alice.handle_dhcommit(Version::V3, dhcommit).unwrap() {
            EncodedMessageType::DHKey(msg) => msg,
            _ => panic!("expected DH-Key"),
        };
        let mut revealsig = match bob.handle_dhkey(dhkey).unwrap() {
            EncodedMessageType::RevealSignature(msg) => msg,
            _ => panic!("expected Reveal-Signature"),
        };
        revealsig.signature_encrypted[0] ^= 0x01;
        assert!(alice.handle_reveal_signature(revealsig).is_err());
    }
}
