// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use crate::{
    ake::CryptographicMaterial,
    crypto::{constant, dh, sha1},
    encoding::{Fingerprint, MessageFlags, OTRDecoder, OTREncoder, SSID},
    instancetag::{InstanceTag, INSTANCE_ZERO},
    messages::{encode_authenticator_data, DataMessage, EncodedMessageType},
    keymanager::KeyManager,
    smp::SMPContext,
    Host, OTRError, ProtocolStatus, TLVType, UserMessage, Version, TLV,
};

/// TLV for padding the plaintext to disguise message lengths.
pub const TLV_TYPE_PADDING: TLVType = 0;
/// TLV signaling that the other party has ended the session.
pub const TLV_TYPE_DISCONNECT: TLVType = 1;
/// TLV signaling use of the extra symmetric key, with a 4-byte usage context.
pub const TLV_TYPE_EXTRA_SYMMETRIC_KEY: TLVType = 8;

pub const EXTRA_SYMMETRIC_KEY_LEN: usize = 32;

/// `new_state` produces an instance of the initial (plaintext) protocol state.
pub fn new_state() -> Box<dyn ProtocolState> {
    Box::new(PlaintextState {})
}

/// `ProtocolState` is the interface of the message states: plaintext, encrypted, finished.
/// Transitions between message states produce a new boxed state.
pub trait ProtocolState {
    fn status(&self) -> ProtocolStatus;

    fn version(&self) -> Version;

    /// `handle` processes a data message in the current state. The tuple contains the result for
    /// the receiving client and, if the message causes one, the state transition.
    #[allow(clippy::type_complexity)]
    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    );

    /// `secure` produces the encrypted state that follows a completed key exchange.
    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState>;

    /// `finish` ends the encrypted session locally. The tuple contains the disconnect message to
    /// send, if the current state requires one, and the (plaintext) state to continue with.
    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>);

    /// `prepare` transforms outgoing content for the current state.
    fn prepare(
        &mut self,
        flags: MessageFlags,
        content: &[u8],
    ) -> Result<EncodedMessageType, OTRError>;

    /// `smp` is the SMP handler of the (encrypted) state.
    fn smp(&mut self) -> Result<&mut SMPContext, OTRError>;

    fn ssid(&self) -> Result<SSID, OTRError>;

    fn extra_symmetric_key(&self) -> Result<[u8; EXTRA_SYMMETRIC_KEY_LEN], OTRError>;

    fn their_fingerprint(&self) -> Result<Fingerprint, OTRError>;
}

pub struct PlaintextState {}

impl ProtocolState for PlaintextState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Plaintext
    }

    fn version(&self) -> Version {
        Version::None
    }

    fn handle(
        &mut self,
        _msg: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    ) {
        // A data message without an established session cannot be read.
        (Err(OTRError::UnreadableMessage(INSTANCE_ZERO)), None)
    }

    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState> {
        Box::new(EncryptedState::new(host, our_tag, their_tag, material))
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        _flags: MessageFlags,
        content: &[u8],
    ) -> Result<EncodedMessageType, OTRError> {
        Ok(EncodedMessageType::Unencoded(Vec::from(content)))
    }

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        Err(OTRError::IncorrectState(
            "SMP is not available in plaintext state.",
        ))
    }

    fn ssid(&self) -> Result<SSID, OTRError> {
        Err(OTRError::IncorrectState("No session established."))
    }

    fn extra_symmetric_key(&self) -> Result<[u8; EXTRA_SYMMETRIC_KEY_LEN], OTRError> {
        Err(OTRError::IncorrectState("No session established."))
    }

    fn their_fingerprint(&self) -> Result<Fingerprint, OTRError> {
        Err(OTRError::IncorrectState("No session established."))
    }
}

pub struct EncryptedState {
    version: Version,
    ssid: SSID,
    our_tag: InstanceTag,
    their_tag: InstanceTag,
    their_fingerprint: Fingerprint,
    keys: KeyManager,
    smp: SMPContext,
}

impl ProtocolState for EncryptedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Encrypted
    }

    fn version(&self) -> Version {
        self.version
    }

    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    ) {
        match self.decrypt_message(msg) {
            Ok(content) => self.process_content(&content),
            Err(error) => (Err(error), None),
        }
    }

    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState> {
        // A new AKE may complete while already in encrypted state; the session continues with
        // the fresh key material.
        Box::new(EncryptedState::new(host, our_tag, their_tag, material))
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        let disconnect_content = OTREncoder::new()
            .write_u8(0)
            .write_tlv(&TLV(TLV_TYPE_DISCONNECT, Vec::new()))
            .to_vec();
        let disconnect = self
            .prepare(MessageFlags::IGNORE_UNREADABLE, &disconnect_content)
            .ok();
        (disconnect, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        flags: MessageFlags,
        content: &[u8],
    ) -> Result<EncodedMessageType, OTRError> {
        Ok(EncodedMessageType::Data(self.encrypt_message(flags, content)?))
    }

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        Ok(&mut self.smp)
    }

    fn ssid(&self) -> Result<SSID, OTRError> {
        Ok(self.ssid)
    }

    fn extra_symmetric_key(&self) -> Result<[u8; EXTRA_SYMMETRIC_KEY_LEN], OTRError> {
        Ok(self.keys.extra_symmetric_key())
    }

    fn their_fingerprint(&self) -> Result<Fingerprint, OTRError> {
        Ok(self.their_fingerprint)
    }
}

impl EncryptedState {
    fn new(
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Self {
        let our_fingerprint = host.keypair().public_key().fingerprint();
        let their_fingerprint = material.their_dsa.fingerprint();
        let smp = SMPContext::new(our_fingerprint, their_fingerprint, material.ssid);
        let keys = KeyManager::new((1, material.our_dh), (1, material.their_dh));
        Self {
            version: material.version,
            ssid: material.ssid,
            our_tag,
            their_tag,
            their_fingerprint,
            keys,
            smp,
        }
    }

    fn encrypt_message(
        &mut self,
        flags: MessageFlags,
        content: &[u8],
    ) -> Result<DataMessage, OTRError> {
        let (our_keyid, _) = self.keys.our_current();
        let (their_keyid, _) = self.keys.their_current();
        let secrets = self.keys.session_secrets(our_keyid, their_keyid)?;
        let ctr = self.keys.next_counter();
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&ctr);
        let encrypted = secrets.sender_crypt_key().encrypt(&iv, content);
        let next_dh = self.keys.our_next().1.public.clone();
        let mut message = DataMessage {
            flags,
            sender_keyid: our_keyid,
            receiver_keyid: their_keyid,
            dh_y: next_dh,
            ctr,
            encrypted,
            authenticator: [0u8; 20],
            revealed: self.keys.take_reveal_queue(),
        };
        message.authenticator = sha1::hmac(
            secrets.sender_mac_key(),
            &encode_authenticator_data(self.version, self.our_tag, self.their_tag, &message),
        );
        Ok(message)
    }

    fn decrypt_message(&mut self, message: &DataMessage) -> Result<Vec<u8>, OTRError> {
        // `receiver_keyid` refers to our key, `sender_keyid` to the other party's key.
        dh::verify_public_key(&message.dh_y).map_err(OTRError::CryptographicViolation)?;
        let secrets = self
            .keys
            .session_secrets(message.receiver_keyid, message.sender_keyid)
            .or(Err(OTRError::UnreadableMessage(self.their_tag)))?;
        self.keys
            .verify_receive_counter(message.sender_keyid, message.receiver_keyid, &message.ctr)?;
        let expected_authenticator = sha1::hmac(
            secrets.receiver_mac_key(),
            &encode_authenticator_data(self.version, self.their_tag, self.our_tag, message),
        );
        constant::verify(&expected_authenticator, &message.authenticator)
            .or(Err(OTRError::UnreadableMessage(self.their_tag)))?;
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&message.ctr);
        let content = secrets.receiver_crypt_key().decrypt(&iv, &message.encrypted);
        self.keys.register_used_mac_key(
            message.sender_keyid,
            message.receiver_keyid,
            &message.ctr,
            *secrets.receiver_mac_key(),
        );
        self.keys.acknowledge_ours(message.receiver_keyid)?;
        self.keys
            .register_their_next(message.sender_keyid, &message.dh_y)?;
        Ok(content)
    }

    #[allow(clippy::type_complexity)]
    fn process_content(
        &mut self,
        content: &[u8],
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    ) {
        let (text, tlvs) = match split_content(content) {
            Ok(split) => split,
            Err(error) => return (Err(error), None),
        };
        for tlv in &tlvs {
            if tlv.0 == TLV_TYPE_DISCONNECT {
                log::info!("Other party has ended the encrypted session.");
                return (
                    Ok(UserMessage::ConfidentialSessionFinished(
                        self.their_tag,
                        text,
                    )),
                    Some(Box::new(FinishedState {})),
                );
            }
        }
        (
            Ok(UserMessage::Confidential(self.their_tag, text, tlvs)),
            None,
        )
    }
}

/// `split_content` splits decrypted data-message content into the user-visible text and the TLV
/// records that follow the first NUL byte.
fn split_content(content: &[u8]) -> Result<(Vec<u8>, Vec<TLV>), OTRError> {
    match content.iter().position(|b| *b == 0) {
        None => Ok((Vec::from(content), Vec::new())),
        Some(pos) => {
            let mut decoder = OTRDecoder::new(&content[pos + 1..]);
            let tlvs = decoder
                .read_tlvs()?
                .into_iter()
                .filter(|t| t.0 != TLV_TYPE_PADDING)
                .collect();
            Ok((Vec::from(&content[..pos]), tlvs))
        }
    }
}

pub struct FinishedState {}

impl ProtocolState for FinishedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Finished
    }

    fn version(&self) -> Version {
        Version::None
    }

    fn handle(
        &mut self,
        _msg: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    ) {
        (Err(OTRError::UnreadableMessage(INSTANCE_ZERO)), None)
    }

    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState> {
        Box::new(EncryptedState::new(host, our_tag, their_tag, material))
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        _flags: MessageFlags,
        _content: &[u8],
    ) -> Result<EncodedMessageType, OTRError> {
        // The other party has ended the session; sending is refused until the local user
        // explicitly resets to plaintext.
        Err(OTRError::IncorrectState(
            "Session is finished. Message cannot be sent until the session is reset to plaintext.",
        ))
    }

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        Err(OTRError::IncorrectState(
            "SMP is not available in finished state.",
        ))
    }

    fn ssid(&self) -> Result<SSID, OTRError> {
        Err(OTRError::IncorrectState("Session is finished."))
    }

    fn extra_symmetric_key(&self) -> Result<[u8; EXTRA_SYMMETRIC_KEY_LEN], OTRError> {
        Err(OTRError::IncorrectState("Session is finished."))
    }

    fn their_fingerprint(&self) -> Result<Fingerprint, OTRError> {
        Err(OTRError::IncorrectState("Session is finished."))
    }
}

#[cfg(test)]
mod tests {
    use super::split_content;
    use crate::{encoding::OTREncoder, TLV};

    #[test]
    fn test_split_content_plain_text() {
        let (text, tlvs) = split_content(b"hello world").unwrap();
        assert_eq!(b"hello world".to_vec(), text);
        assert!(tlvs.is_empty());
    }

    #[test]
    fn test_split_content_with_tlvs() {
        let content = OTREncoder::new()
            .write(b"hi")
            .write_u8(0)
            .write_tlv(&TLV(1, Vec::new()))
            .write_tlv(&TLV(8, vec![0, 0, 0, 1]))
            .to_vec();
        let (text, tlvs) = split_content(&content).unwrap();
        assert_eq!(b"hi".to_vec(), text);
        assert_eq!(vec![TLV(1, Vec::new()), TLV(8, vec![0, 0, 0, 1])], tlvs);
    }

    #[test]
    fn test_split_content_padding_dropped() {
        let content = OTREncoder::new()
            .write_u8(0)
            .write_tlv(&TLV(0, vec![0xba; 16]))
            .to_vec();
        let (text, tlvs) = split_content(&content).unwrap();
        assert!(text.is_empty());
        assert!(tlvs.is_empty());
    }
}
