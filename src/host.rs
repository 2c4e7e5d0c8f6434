// SPDX-License-Identifier: LGPL-3.0-only

use crate::{
    crypto::{dsa, ed448},
    encoding::Fingerprint,
    instancetag::InstanceTag,
    Policy, ProtocolStatus, TLVType,
};

/// `Host` is the connection back into the messaging client: it supplies long-term key material,
/// policy and transport access, and receives event notifications. The `inject` call is the only
/// I/O the protocol core performs; everything else is queries and notifications.
///
/// Notifications have no-op default implementations so a host only implements what it cares
/// about.
#[allow(unused_variables)]
pub trait Host {
    /// `inject` hands a protocol-generated message to the transport. Such messages exist for
    /// the protocol's own bookkeeping and never reach the user's screen.
    fn inject(&self, message: &[u8]);

    /// `keypair` exposes the host's long-term DSA keypair. The protocol core never persists
    /// the keypair; it is borrowed for the duration of a single operation.
    fn keypair(&self) -> &dsa::Keypair;

    /// `keypair_identity` acquires the host's long-term Ed448 identity keypair (OTRv4).
    fn keypair_identity(&self) -> &ed448::EdDSAKeyPair;

    /// `client_profile` acquires the host's encoded OTRv4 client profile payload. May be empty
    /// if the host does not engage in OTRv4.
    fn client_profile(&self) -> Vec<u8>;

    /// `policy` queries the host for the policy that governs this account's session.
    fn policy(&self) -> Policy;

    /// `max_message_size` is the maximum transport message size in bytes, used to decide on
    /// fragmentation. Return `usize::MAX` for transports without a size limit.
    fn max_message_size(&self) -> usize;

    /// `fallback_message` is the human-readable text appended to an outgoing query message for
    /// clients that do not support OTR.
    fn fallback_message(&self) -> Vec<u8> {
        Vec::from("An Off-The-Record conversation has been requested.")
    }

    /// `reply_for_unreadable_message` supplies the error text sent back to the other party when
    /// an unreadable (data) message was received.
    fn reply_for_unreadable_message(&self) -> Vec<u8> {
        Vec::from("unreadable message")
    }

    /// `unreadable_message_received` signals that a data message arrived that could not be read.
    fn unreadable_message_received(&self, instance: InstanceTag) {}

    /// `unencrypted_message_received` signals that a plaintext message arrived while policy or
    /// session state expects encryption.
    fn unencrypted_message_received(&self, message: &[u8]) {}

    /// `show_error` passes on the diagnostic text of a received OTR error message.
    fn show_error(&self, error: &[u8]) {}

    /// `message_from_another_instance` signals that a message addressed to a different instance
    /// of this account was discarded.
    fn message_from_another_instance(&self) {}

    /// `multiple_instances_detected` signals that more than one remote instance is active for
    /// this conversation.
    fn multiple_instances_detected(&self) {}

    /// `session_status_changed` signals a protocol status transition for an instance.
    fn session_status_changed(&self, instance: InstanceTag, status: ProtocolStatus) {}

    /// `ask_for_secret` signals that the other party initiated SMP verification. The host should
    /// prompt the user for the shared secret and answer through `Account::respond_smp`. The
    /// question is empty if the initiator did not pose one.
    fn ask_for_secret(&self, instance: InstanceTag, question: &[u8]) {}

    /// `smp_error` signals that the SMP exchange was interrupted by a protocol or cryptographic
    /// failure. `cheated` indicates evidence of a dishonest participant.
    fn smp_error(&self, instance: InstanceTag, tlv: TLVType, cheated: bool) {}

    /// `smp_aborted` signals that the SMP exchange was aborted.
    fn smp_aborted(&self, instance: InstanceTag) {}

    /// `verify` signals that the other party's identity was verified through SMP. The host
    /// should mark the fingerprint as trusted.
    fn verify(&self, fingerprint: &Fingerprint) {}

    /// `unverify` signals that SMP concluded negatively. The host should revoke trust in the
    /// fingerprint.
    fn unverify(&self, fingerprint: &Fingerprint) {}

    /// `finished_session_message` signals that a message could not be sent because the session
    /// is finished. The message is passed back for possible retransmission.
    fn finished_session_message(&self, message: &[u8]) {}

    /// `require_encrypted_message` signals that a message was withheld because policy requires
    /// encryption and no encrypted session is available yet.
    fn require_encrypted_message(&self, message: &[u8]) {}

    /// `extra_symmetric_key_discovered` signals that the other party started using the extra
    /// symmetric key out-of-band, with the 4-byte usage context and use-specific data from the
    /// TLV.
    fn extra_symmetric_key_discovered(&self, key: &[u8; 32], context: u32, data: &[u8]) {}
}
