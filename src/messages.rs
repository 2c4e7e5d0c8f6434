// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    ake,
    crypto::ed448,
    dake,
    encoding::{
        KeyID, MessageFlags, OTRDecoder, OTREncodable, OTREncoder, CTR, MAC, MAC4, MAC4_LEN,
    },
    instancetag::{InstanceTag, INSTANCE_ZERO},
    utils, OTRError, Version,
};

const OTR_ERROR_PREFIX: &[u8] = b"?OTR Error:";
const OTR_QUERY_PREFIX: &[u8] = b"?OTRv";
const OTR_ENCODED_PREFIX: &[u8] = b"?OTR:";
const OTR_ENCODED_SUFFIX: &[u8] = b".";

const OTR_DH_COMMIT_TYPE_CODE: u8 = 0x02;
const OTR_DH_KEY_TYPE_CODE: u8 = 0x0a;
const OTR_REVEAL_SIGNATURE_TYPE_CODE: u8 = 0x11;
const OTR_SIGNATURE_TYPE_CODE: u8 = 0x12;
const OTR_IDENTITY_TYPE_CODE: u8 = 0x35;
const OTR_AUTHR_TYPE_CODE: u8 = 0x36;
const OTR_AUTHI_TYPE_CODE: u8 = 0x37;

/// Data messages share type code 0x03 across all protocol versions.
const OTR_DATA_TYPE_CODE: u8 = 0x03;

static QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\?OTR\??(?:v([0-9]*))?\?")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});
const QUERY_GROUP_VERSIONS: usize = 1;
static WHITESPACE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r" \t  \t\t\t\t \t \t \t  ((?:[ \t]{8})*)")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});
const WHITESPACE_GROUP_TAGS: usize = 1;
const WHITESPACE_PREFIX: &[u8] = b" \t  \t\t\t\t \t \t \t  ";
const WHITESPACE_TAG_OTRV1: &[u8] = b" \t \t  \t ";
const WHITESPACE_TAG_OTRV2: &[u8] = b"  \t\t  \t ";
const WHITESPACE_TAG_OTRV3: &[u8] = b"  \t\t  \t\t";
const WHITESPACE_TAG_OTRV4: &[u8] = b"  \t\t \t  ";

/// `parse` interprets a single raw message from the transport as one of the OTR message types.
/// This is the single parsing entry point of the wire codec. (Fragments are recognized
/// separately, before this entry point is used.)
pub fn parse(data: &[u8]) -> Result<MessageType, OTRError> {
    if data.starts_with(OTR_ENCODED_PREFIX) && data.ends_with(OTR_ENCODED_SUFFIX) {
        let start = OTR_ENCODED_PREFIX.len();
        let end = data.len() - OTR_ENCODED_SUFFIX.len();
        parse_encoded_message(&data[start..end])
    } else {
        Ok(parse_plain_message(data))
    }
}

fn parse_encoded_message(data: &[u8]) -> Result<MessageType, OTRError> {
    let data = base64::decode(data).or(Err(OTRError::ProtocolViolation(
        "Invalid message content: content cannot be decoded from base64.",
    )))?;
    let mut decoder = OTRDecoder::new(&data);
    let version: Version = match decoder.read_u16()? {
        0u16 => {
            return Err(OTRError::ProtocolViolation(
                "A protocol version must be provided.",
            ))
        }
        2u16 => Version::V2,
        3u16 => Version::V3,
        4u16 => Version::V4,
        version => return Err(OTRError::UnsupportedVersion(version)),
    };
    let message_type = decoder.read_u8()?;
    let (sender, receiver) = if version == Version::V2 {
        // OTRv2 predates instance tags.
        (INSTANCE_ZERO, INSTANCE_ZERO)
    } else {
        let sender = decoder.read_instance_tag()?;
        utils::u32::verify_nonzero(
            sender,
            OTRError::ProtocolViolation("Sender instance tag must be non-zero."),
        )?;
        (sender, decoder.read_instance_tag()?)
    };
    let encoded = parse_encoded_content(version, message_type, &mut decoder)?;
    decoder.done()?;
    Ok(MessageType::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        message: encoded,
    }))
}

fn parse_encoded_content(
    version: Version,
    message_type: u8,
    decoder: &mut OTRDecoder,
) -> Result<EncodedMessageType, OTRError> {
    match (version, message_type) {
        (Version::V2 | Version::V3, OTR_DH_COMMIT_TYPE_CODE) => Ok(EncodedMessageType::DHCommit(
            ake::DHCommitMessage::decode(decoder)?,
        )),
        (Version::V2 | Version::V3, OTR_DH_KEY_TYPE_CODE) => Ok(EncodedMessageType::DHKey(
            ake::DHKeyMessage::decode(decoder)?,
        )),
        (Version::V2 | Version::V3, OTR_REVEAL_SIGNATURE_TYPE_CODE) => Ok(
            EncodedMessageType::RevealSignature(ake::RevealSignatureMessage::decode(decoder)?),
        ),
        (Version::V2 | Version::V3, OTR_SIGNATURE_TYPE_CODE) => Ok(EncodedMessageType::Signature(
            ake::SignatureMessage::decode(decoder)?,
        )),
        (Version::V2 | Version::V3, OTR_DATA_TYPE_CODE) => {
            Ok(EncodedMessageType::Data(DataMessage::decode(decoder)?))
        }
        (Version::V4, OTR_IDENTITY_TYPE_CODE) => Ok(EncodedMessageType::Identity(
            dake::IdentityMessage::decode(decoder)?,
        )),
        (Version::V4, OTR_AUTHR_TYPE_CODE) => Ok(EncodedMessageType::AuthR(
            dake::AuthRMessage::decode(decoder)?,
        )),
        (Version::V4, OTR_AUTHI_TYPE_CODE) => Ok(EncodedMessageType::AuthI(
            dake::AuthIMessage::decode(decoder)?,
        )),
        (Version::V4, OTR_DATA_TYPE_CODE) => {
            Ok(EncodedMessageType::Data4(DataMessage4::decode(decoder)?))
        }
        _ => Err(OTRError::ProtocolViolation(
            "Invalid or unknown message type, or incorrect protocol version for message type.",
        )),
    }
}

fn parse_plain_message(data: &[u8]) -> MessageType {
    if data.starts_with(OTR_ERROR_PREFIX) {
        // The error marker counts only at offset zero. Anywhere later it is ordinary chat text
        // and must remain so, or conversation content could trigger protocol reactions.
        return MessageType::Error(Vec::from(
            data[OTR_ERROR_PREFIX.len()..]
                .strip_prefix(b" ")
                .unwrap_or(&data[OTR_ERROR_PREFIX.len()..]),
        ));
    }
    if let Some(caps) = QUERY_PATTERN.captures(data) {
        let versions = caps.get(QUERY_GROUP_VERSIONS).map_or(Vec::new(), |m| {
            m.as_bytes()
                .iter()
                .map(|v| {
                    match v {
                        // '1' is not a legal query version: version 1 has its own query format
                        // (`?OTR?`) that this pattern does not capture as a digit.
                        b'1' => Version::Unsupported(1u16),
                        b'2' => Version::V2,
                        b'3' => Version::V3,
                        b'4' => Version::V4,
                        // Unrecognized digits collapse to `u16::MAX`, far outside any plausible
                        // version number, so no collision with a meaningful value is possible.
                        _ => Version::Unsupported(u16::MAX),
                    }
                })
                .filter(|v| match v {
                    Version::V2 | Version::V3 | Version::V4 => true,
                    Version::None | Version::Unsupported(_) => false,
                })
                .collect()
        });
        return MessageType::Query(versions);
    }
    if let Some(caps) = WHITESPACE_PATTERN.captures(data) {
        let cleaned = WHITESPACE_PATTERN.replace_all(data, b"".as_ref()).to_vec();
        let cap = caps
            .get(WHITESPACE_GROUP_TAGS)
            .expect("BUG: hard-coded regex should include capture group");
        return MessageType::Tagged(parse_whitespace_tags(cap.as_bytes()), cleaned);
    }
    MessageType::Plaintext(data.to_vec())
}

fn parse_whitespace_tags(data: &[u8]) -> Vec<Version> {
    let mut result = Vec::new();
    for i in (0..data.len()).step_by(8) {
        match &data[i..i + 8] {
            WHITESPACE_TAG_OTRV1 => result.push(Version::Unsupported(1)),
            WHITESPACE_TAG_OTRV2 => result.push(Version::V2),
            WHITESPACE_TAG_OTRV3 => result.push(Version::V3),
            WHITESPACE_TAG_OTRV4 => result.push(Version::V4),
            _ => { /* ignore unknown tags */ }
        }
    }
    result
}

#[allow(clippy::large_enum_variant)]
pub enum MessageType {
    Error(Vec<u8>),
    Plaintext(Vec<u8>),
    Tagged(Vec<Version>, Vec<u8>),
    Query(Vec<Version>),
    Encoded(EncodedMessage),
}

pub struct EncodedMessage {
    pub version: Version,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    pub message: EncodedMessageType,
}

impl OTREncodable for EncodedMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_u16(encode_version(self.version))
            .write_u8(match self.message {
                EncodedMessageType::Unencoded(_) => panic!(
                    "BUG: an 'Unencoded' payload has no wire form; rework it into a plaintext message first."
                ),
                EncodedMessageType::DHCommit(_) => OTR_DH_COMMIT_TYPE_CODE,
                EncodedMessageType::DHKey(_) => OTR_DH_KEY_TYPE_CODE,
                EncodedMessageType::RevealSignature(_) => OTR_REVEAL_SIGNATURE_TYPE_CODE,
                EncodedMessageType::Signature(_) => OTR_SIGNATURE_TYPE_CODE,
                EncodedMessageType::Identity(_) => OTR_IDENTITY_TYPE_CODE,
                EncodedMessageType::AuthR(_) => OTR_AUTHR_TYPE_CODE,
                EncodedMessageType::AuthI(_) => OTR_AUTHI_TYPE_CODE,
                EncodedMessageType::Data(_) | EncodedMessageType::Data4(_) => OTR_DATA_TYPE_CODE,
            });
        if self.version != Version::V2 {
            encoder.write_u32(self.sender).write_u32(self.receiver);
        }
        encoder.write_encodable(match &self.message {
            EncodedMessageType::Unencoded(_) => panic!(
                "BUG: an 'Unencoded' payload has no wire form; rework it into a plaintext message first."
            ),
            EncodedMessageType::DHCommit(msg) => msg,
            EncodedMessageType::DHKey(msg) => msg,
            EncodedMessageType::RevealSignature(msg) => msg,
            EncodedMessageType::Signature(msg) => msg,
            EncodedMessageType::Data(msg) => msg,
            EncodedMessageType::Identity(msg) => msg,
            EncodedMessageType::AuthR(msg) => msg,
            EncodedMessageType::AuthI(msg) => msg,
            EncodedMessageType::Data4(msg) => msg,
        });
    }
}

/// `EncodedMessageType` discriminates every OTR-encoded message structure.
#[allow(clippy::large_enum_variant)]
pub enum EncodedMessageType {
    /// `Unencoded` escapes the encoding: content that turned out not to need an OTR-encoded
    /// form, e.g. outgoing text while the session is still plaintext. It never appears on the
    /// wire as-is.
    Unencoded(Vec<u8>),
    /// OTRv2/3 DH-Commit message in the AKE process.
    DHCommit(ake::DHCommitMessage),
    /// OTRv2/3 DH-Key message in the AKE process.
    DHKey(ake::DHKeyMessage),
    /// OTRv2/3 Reveal-Signature message in the AKE process.
    RevealSignature(ake::RevealSignatureMessage),
    /// OTRv2/3 Signature message in the AKE process.
    Signature(ake::SignatureMessage),
    /// OTRv2/3 (encrypted) data message.
    Data(DataMessage),
    /// OTRv4 Identity message in the interactive DAKE.
    Identity(dake::IdentityMessage),
    /// OTRv4 Auth-R message in the interactive DAKE.
    AuthR(dake::AuthRMessage),
    /// OTRv4 Auth-I message in the interactive DAKE.
    AuthI(dake::AuthIMessage),
    /// OTRv4 (encrypted) data message.
    Data4(DataMessage4),
}

pub struct DataMessage {
    pub flags: MessageFlags,
    pub sender_keyid: KeyID,
    pub receiver_keyid: KeyID,
    pub dh_y: BigUint,
    // Only the upper 8 counter bytes travel; the receiver completes the 16-byte CTR-mode
    // counter with a zero lower half. An all-zero value is illegal.
    pub ctr: CTR,
    pub encrypted: Vec<u8>,
    pub authenticator: MAC,
    /// `revealed` carries MAC keys whose authentication duty has ended; publishing them is what
    /// makes old transcripts forgeable by anyone.
    pub revealed: Vec<u8>,
}

impl DataMessage {
    fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let flags = MessageFlags::from_bits(decoder.read_u8()?)
            .ok_or(OTRError::ProtocolViolation("Invalid message flags"))?;
        let sender_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"))?;
        let receiver_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"))?;
        let dh_y = decoder.read_mpi()?;
        let ctr = decoder.read_ctr()?;
        let encrypted = decoder.read_data()?;
        let authenticator = decoder.read_mac()?;
        let revealed = decoder.read_data()?;
        Ok(Self {
            flags,
            sender_keyid,
            receiver_keyid,
            dh_y,
            ctr,
            encrypted,
            authenticator,
            revealed,
        })
    }
}

impl OTREncodable for DataMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_u8(self.flags.bits())
            .write_u32(self.sender_keyid)
            .write_u32(self.receiver_keyid)
            .write_mpi(&self.dh_y)
            .write_ctr(&self.ctr)
            .write_data(&self.encrypted)
            .write_mac(&self.authenticator)
            .write_data(&self.revealed);
    }
}

pub struct DataMessage4 {
    pub flags: MessageFlags,
    pub pn: u32,
    pub i: u32,
    pub j: u32,
    pub ecdh: ed448::Point,
    pub dh: BigUint,
    pub encrypted: Vec<u8>,
    pub authenticator: MAC4,
    pub revealed: Vec<u8>,
}

impl DataMessage4 {
    fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let flags = MessageFlags::from_bits(decoder.read_u8()?)
            .ok_or(OTRError::ProtocolViolation("Invalid message flags"))?;
        let pn = decoder.read_u32()?;
        let i = decoder.read_u32()?;
        let j = decoder.read_u32()?;
        let ecdh = decoder.read_ed448_point()?;
        let dh = decoder.read_mpi()?;
        let encrypted = decoder.read_data()?;
        let authenticator = decoder.read_mac4()?;
        let revealed = decoder.read_data()?;
        if revealed.len() % MAC4_LEN != 0 {
            return Err(OTRError::ProtocolViolation(
                "Revealed MACs do not have the expected length.",
            ));
        }
        Ok(Self {
            flags,
            pn,
            i,
            j,
            ecdh,
            dh,
            encrypted,
            authenticator,
            revealed,
        })
    }
}

impl OTREncodable for DataMessage4 {
    fn encode(&self, encoder: &mut OTREncoder) {
        assert_eq!(0, self.revealed.len() % MAC4_LEN);
        encoder
            .write_u8(self.flags.bits())
            .write_u32(self.pn)
            .write_u32(self.i)
            .write_u32(self.j)
            .write_ed448_point(&self.ecdh)
            .write_mpi(&self.dh)
            .write_data(&self.encrypted)
            .write_mac4(&self.authenticator)
            .write_data(&self.revealed);
    }
}

/// `encode_message` produces the full byte-encoding for a single encoded message.
pub fn encode_message(
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    message: EncodedMessageType,
) -> Vec<u8> {
    serialize_message(&MessageType::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        message,
    }))
}

/// `serialize_message` renders a message into the byte-sequence handed to the transport.
pub fn serialize_message(msg: &MessageType) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    match msg {
        MessageType::Error(error) => {
            buffer.extend_from_slice(OTR_ERROR_PREFIX);
            buffer.push(b' ');
            buffer.extend(error);
            buffer
        }
        MessageType::Plaintext(message) => {
            buffer.extend(message);
            buffer
        }
        MessageType::Tagged(versions, message) => {
            assert!(!versions.is_empty());
            buffer.extend(message);
            buffer.extend_from_slice(WHITESPACE_PREFIX);
            for v in utils::alloc::vec_unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV2),
                    Version::V3 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV3),
                    Version::V4 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV4),
                    Version::None | Version::Unsupported(_) => {
                        panic!("BUG: unsupported versions must not be tagged.")
                    }
                }
            }
            buffer
        }
        MessageType::Query(versions) => {
            assert!(!versions.is_empty());
            // Versions are deduplicated; their order carries no meaning. The ancient
            // version-1 query form is never produced.
            buffer.extend_from_slice(OTR_QUERY_PREFIX);
            for v in utils::alloc::vec_unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.push(b'2'),
                    Version::V3 => buffer.push(b'3'),
                    Version::V4 => buffer.push(b'4'),
                    Version::None | Version::Unsupported(_) => {
                        panic!("BUG: unsupported versions must not be queried.")
                    }
                }
            }
            buffer.push(b'?');
            buffer
        }
        MessageType::Encoded(encoded_message) => {
            buffer.extend_from_slice(OTR_ENCODED_PREFIX);
            buffer.extend(
                base64::encode(OTREncoder::new().write_encodable(encoded_message).to_vec())
                    .into_bytes(),
            );
            buffer.extend_from_slice(OTR_ENCODED_SUFFIX);
            buffer
        }
    }
}

/// `encode_authenticator_data` serializes the to-be-authenticated prefix of a data message,
/// i.e. everything up to but excluding the authenticator itself.
pub fn encode_authenticator_data(
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    message: &DataMessage,
) -> Vec<u8> {
    let mut encoder = OTREncoder::new();
    encoder
        .write_u16(encode_version(version))
        .write_u8(OTR_DATA_TYPE_CODE);
    if version != Version::V2 {
        encoder.write_u32(sender).write_u32(receiver);
    }
    encoder
        .write_u8(message.flags.bits())
        .write_u32(message.sender_keyid)
        .write_u32(message.receiver_keyid)
        .write_mpi(&message.dh_y)
        .write_ctr(&message.ctr)
        .write_data(&message.encrypted)
        .to_vec()
}

fn encode_version(version: Version) -> u16 {
    match version {
        Version::None => 0,
        Version::V2 => 2,
        Version::V3 => 3,
        Version::V4 => 4,
        Version::Unsupported(_) => panic!("BUG: unsupported version"),
    }
}
