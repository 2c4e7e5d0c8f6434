// SPDX-License-Identifier: LGPL-3.0-only

//! Off-the-Record messaging protocol for embedding in an existing chat
//! transport. The crate transforms outgoing plaintext into OTR-encoded
//! ciphertext, interprets incoming OTR traffic, negotiates and rekeys
//! sessions, and verifies a peer's identity using the Socialist
//! Millionaires Protocol. OTRv2 and OTRv3 are fully supported; OTRv4
//! support covers the wire codec, client profiles and the interactive
//! DAKE.

use bitflags::bitflags;

use crate::crypto::CryptoError;

pub mod ake;
pub mod clientprofile;
pub mod crypto;
pub mod dake;
pub mod encoding;
mod fragment;
mod host;
mod instancetag;
mod keymanager;
pub mod messages;
mod protocol;
mod session;
mod smp;
pub mod smp4;
mod utils;

pub use crate::host::Host;
pub use crate::instancetag::{InstanceTag, INSTANCE_ZERO};
pub use crate::session::Account;
pub use crate::smp::SMPStatus;

/// `OTRError` collects every failure the crate surfaces to its embedder.
#[derive(Debug)]
pub enum OTRError {
    /// A message broke the rules of the OTR protocol.
    ProtocolViolation(&'static str),
    /// Message payload is incomplete. The provided buffer does not contain the full message.
    IncompleteMessage,
    /// Message to be processed is only a fragment of the full message. More fragments are needed.
    MessageIncomplete,
    /// An encoded message was received that is addressed to another instance (client) of this
    /// account.
    MessageForOtherInstance,
    /// Message was intended for an unknown or no longer existing instance.
    UnknownInstance(InstanceTag),
    /// Violation of cryptographic properties, such as a failed signature, MAC or hash
    /// verification, or an illegal public key.
    CryptographicViolation(CryptoError),
    /// Protocol version of the message is not supported (or disallowed by policy).
    UnsupportedVersion(u16),
    /// No version acceptable to both parties could be negotiated.
    NoAcceptableVersion,
    /// Policy forbids the requested operation.
    PolicyRestriction(&'static str),
    /// The requested operation is not valid in the current protocol state.
    IncorrectState(&'static str),
    /// An OTR data message arrived that could not be read, e.g. because no encrypted session is
    /// established or because keys have rotated away. The instance tag identifies the sending
    /// instance.
    UnreadableMessage(InstanceTag),
    /// The other party announced a failure through an OTR error message; its text is carried
    /// along.
    ErrorMessage(Vec<u8>),
    /// SMP exchange is already in progress.
    SMPInProgress,
    /// SMP exchange was aborted. The flag indicates whether the abort was caused by a protocol
    /// violation of the other party (cheating), as opposed to an orderly abort.
    SMPAborted(bool),
}

/// `Version` enumerates the OTR protocol versions this crate knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    /// `None` is the null-version, present before any version is negotiated.
    None,
    V2,
    V3,
    /// V4 is recognized on the wire, but cannot yet be negotiated for a session.
    V4,
    Unsupported(u16),
}

bitflags! {
    /// `Policy` configures how the protocol behaves for a single account.
    ///
    /// A policy without any allowed protocol version disables OTR processing completely: all
    /// input and output passes through the session untouched.
    pub struct Policy: u32 {
        /// Allow version 2 of the OTR protocol to be used.
        const ALLOW_V2 = 0b0000_0001;
        /// Allow version 3 of the OTR protocol to be used.
        const ALLOW_V3 = 0b0000_0010;
        /// Refuse to send unencrypted messages.
        const REQUIRE_ENCRYPTION = 0b0000_0100;
        /// Advertise support for OTR by appending the whitespace tag to plaintext messages.
        const SEND_WHITESPACE_TAG = 0b0000_1000;
        /// Start the AKE upon receiving a whitespace tag.
        const WHITESPACE_START_AKE = 0b0001_0000;
        /// Start the AKE upon receiving an OTR error message.
        const ERROR_START_AKE = 0b0010_0000;
    }
}

impl Policy {
    /// `allowed` tests whether given protocol version is allowed under this policy.
    #[must_use]
    pub fn allowed(&self, version: Version) -> bool {
        match version {
            Version::V2 => self.contains(Self::ALLOW_V2),
            Version::V3 => self.contains(Self::ALLOW_V3),
            Version::None | Version::V4 | Version::Unsupported(_) => false,
        }
    }

    /// `viable` indicates whether any protocol version is allowed at all, i.e. whether OTR
    /// processing is enabled.
    #[must_use]
    pub fn viable(&self) -> bool {
        self.intersects(Self::ALLOW_V2 | Self::ALLOW_V3)
    }
}

/// `ProtocolStatus` is the public status of the messaging state of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolStatus {
    Plaintext,
    Encrypted,
    Finished,
}

/// `TLVType` is the type discriminator of a TLV record.
pub type TLVType = u16;

/// `TLV` is a type-length-value record carried inside the payload of an OTR data message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TLV(pub TLVType, pub Vec<u8>);

/// `UserMessage` is the result of processing inbound content: the part of the traffic that is
/// relevant to return to the messaging client.
#[derive(Debug)]
pub enum UserMessage {
    /// Nothing to do. The message was fully consumed by the protocol.
    None,
    /// Message for the user, received over unencrypted transport.
    Plaintext(Vec<u8>),
    /// While encrypted sessions are active or encryption is required by policy, a message was
    /// received in plaintext. The client should warn the user.
    WarningUnencrypted(Vec<u8>),
    /// An OTR error message was received, carrying the remote party's diagnostic text.
    Error(Vec<u8>),
    /// Message for the user, received over confidential (OTR) transport.
    Confidential(InstanceTag, Vec<u8>, Vec<TLV>),
    /// A confidential session was established with the instance identified by the tag.
    ConfidentialSessionStarted(InstanceTag),
    /// The confidential session with this instance was ended by the other party. Messages can no
    /// longer be sent until the local user explicitly resets to plaintext.
    ConfidentialSessionFinished(InstanceTag, Vec<u8>),
    /// SMP verification concluded: the secrets match.
    SMPSucceeded(InstanceTag),
    /// SMP verification concluded: the secrets do not match.
    SMPFailed(InstanceTag),
    /// The session with this instance was reset to plaintext.
    Reset(InstanceTag),
}
