// SPDX-License-Identifier: LGPL-3.0-only

use std::{collections::HashMap, rc::Rc};

use crate::{
    ake::{AKEContext, AKEError},
    encoding::{MessageFlags, OTREncoder},
    fragment::{self, Assembler, FragmentError},
    instancetag::{self, InstanceTag, INSTANCE_ZERO},
    messages::{
        self, encode_message, serialize_message, EncodedMessage, EncodedMessageType, MessageType,
    },
    protocol::{self, TLV_TYPE_EXTRA_SYMMETRIC_KEY},
    smp::{self, SMPStatus},
    utils, Host, OTRError, Policy, ProtocolStatus, UserMessage, Version, TLV,
};

/// `Account` is the master entry point for a single conversation: it demultiplexes the inbound
/// message stream over the per-client instances of the other party, manages the selected
/// outbound instance, and applies the host's policy to everything that passes through.
pub struct Account {
    host: Rc<dyn Host>,
    details: Rc<AccountDetails>,
    /// `instances` holds one sub-session per remote client that has shown itself so far.
    /// Instance 0 is the rendezvous for traffic without a known tag yet: the opening stages of
    /// the AKE, and all of OTRv2.
    instances: HashMap<InstanceTag, Instance>,
    /// `selected` is the instance that outbound messages are transformed for.
    selected: InstanceTag,
    offer: OfferStatus,
    signalled_multiple: bool,
}

impl Account {
    pub fn new(host: Rc<dyn Host>) -> Self {
        let details = Rc::new(AccountDetails {
            tag: instancetag::random_tag(),
        });
        let mut instances = HashMap::new();
        instances.insert(
            INSTANCE_ZERO,
            Instance::new(Rc::clone(&details), INSTANCE_ZERO, Rc::clone(&host)),
        );
        Self {
            host,
            details,
            instances,
            selected: INSTANCE_ZERO,
            offer: OfferStatus::Idle,
            signalled_multiple: false,
        }
    }

    /// `tag` is the instance tag of this (local) client.
    #[must_use]
    pub fn tag(&self) -> InstanceTag {
        self.details.tag
    }

    /// `status` is the protocol status of the selected (outbound) instance.
    #[must_use]
    pub fn status(&self) -> ProtocolStatus {
        self.instances
            .get(&self.selected)
            .expect("BUG: selected instance must exist")
            .status()
    }

    /// `status_of` queries the protocol status of a specific instance.
    #[must_use]
    pub fn status_of(&self, instance: InstanceTag) -> Option<ProtocolStatus> {
        self.instances.get(&instance).map(Instance::status)
    }

    /// `ssid` is the 8-byte session identifier of the encrypted session with the instance, for
    /// out-of-band comparison by the users.
    pub fn ssid(&self, instance: InstanceTag) -> Result<[u8; 8], OTRError> {
        self.instances
            .get(&instance)
            .ok_or(OTRError::UnknownInstance(instance))?
            .state
            .ssid()
    }

    /// `extra_symmetric_key` derives the extra symmetric key of the encrypted session for
    /// out-of-band use by the application.
    pub fn extra_symmetric_key(&self, instance: InstanceTag) -> Result<[u8; 32], OTRError> {
        self.instances
            .get(&instance)
            .ok_or(OTRError::UnknownInstance(instance))?
            .state
            .extra_symmetric_key()
    }

    /// `set_outgoing_instance` explicitly selects the instance that outbound messages are
    /// encrypted for.
    pub fn set_outgoing_instance(&mut self, instance: InstanceTag) -> Result<(), OTRError> {
        if self.instances.contains_key(&instance) {
            self.selected = instance;
            Ok(())
        } else {
            Err(OTRError::UnknownInstance(instance))
        }
    }

    /// `receive` processes a single raw message from the transport. The result is the part that
    /// is relevant to the client; everything protocol-internal is handled, and possible
    /// responses are injected into the transport through the host.
    pub fn receive(&mut self, payload: &[u8]) -> Result<UserMessage, OTRError> {
        let policy = self.host.policy();
        if !policy.viable() {
            // With no version allowed, OTR processing is disabled entirely.
            return Ok(UserMessage::Plaintext(Vec::from(payload)));
        }
        if fragment::match_fragment(payload) {
            return self.receive_fragment(payload);
        }
        match messages::parse(payload)? {
            MessageType::Error(error) => {
                self.host.show_error(&error);
                if policy.contains(Policy::ERROR_START_AKE) {
                    self.query();
                }
                Ok(UserMessage::Error(error))
            }
            MessageType::Plaintext(content) => {
                // The other party answered in plaintext: no point in continuing to offer OTR.
                self.offer = OfferStatus::Rejected;
                if self.has_sessions() || policy.contains(Policy::REQUIRE_ENCRYPTION) {
                    self.host.unencrypted_message_received(&content);
                    Ok(UserMessage::WarningUnencrypted(content))
                } else {
                    Ok(UserMessage::Plaintext(content))
                }
            }
            MessageType::Tagged(versions, content) => {
                self.offer = OfferStatus::Accepted;
                if policy.contains(Policy::WHITESPACE_START_AKE) {
                    if let Some(version) = self.select_version(&policy, &versions) {
                        self.initiate(version, None)?;
                    }
                }
                if self.has_sessions() || policy.contains(Policy::REQUIRE_ENCRYPTION) {
                    self.host.unencrypted_message_received(&content);
                    Ok(UserMessage::WarningUnencrypted(content))
                } else {
                    Ok(UserMessage::Plaintext(content))
                }
            }
            MessageType::Query(versions) => {
                let version = self
                    .select_version(&policy, &versions)
                    .ok_or(OTRError::NoAcceptableVersion)?;
                self.initiate(version, None)?;
                Ok(UserMessage::None)
            }
            MessageType::Encoded(msg) => self.receive_encoded(&policy, msg),
        }
    }

    fn receive_fragment(&mut self, payload: &[u8]) -> Result<UserMessage, OTRError> {
        let fragment = fragment::parse(payload)
            .or(Err(OTRError::ProtocolViolation("Illegal fragment.")))?;
        if fragment.version != Version::V2 {
            instancetag::verify(fragment.sender)?;
            utils::u32::verify_nonzero(
                fragment.sender,
                OTRError::ProtocolViolation("Fragment sender instance tag must be non-zero."),
            )?;
        }
        if fragment.receiver != INSTANCE_ZERO && fragment.receiver != self.details.tag {
            self.host.message_from_another_instance();
            return Err(OTRError::MessageForOtherInstance);
        }
        let instance = self.get_or_create_instance(fragment.sender);
        match instance.assembler.assemble(fragment) {
            Ok(assembled) => self.receive(&assembled),
            Err(FragmentError::IncompleteResult) => Ok(UserMessage::None),
            Err(FragmentError::UnexpectedFragment) => {
                log::debug!("Fragment out of order: discarded partial message.");
                Ok(UserMessage::None)
            }
            Err(
                FragmentError::InvalidFormat
                | FragmentError::InvalidData
                | FragmentError::TooSmall
                | FragmentError::TooManyFragments
                | FragmentError::Unfragmentable,
            ) => Err(OTRError::ProtocolViolation("Invalid fragment.")),
        }
    }

    fn receive_encoded(
        &mut self,
        policy: &Policy,
        msg: EncodedMessage,
    ) -> Result<UserMessage, OTRError> {
        if !policy.allowed(msg.version) {
            return Err(OTRError::UnsupportedVersion(match msg.version {
                Version::V2 => 2,
                Version::V3 => 3,
                Version::V4 => 4,
                Version::None | Version::Unsupported(_) => 0,
            }));
        }
        if msg.receiver != INSTANCE_ZERO && msg.receiver != self.details.tag {
            self.host.message_from_another_instance();
            return Err(OTRError::MessageForOtherInstance);
        }
        // DH-Commit messages may be broadcast with receiver tag 0, because the other party does
        // not know our instance tag yet. Anything else addressed to everyone is dropped.
        if msg.receiver == INSTANCE_ZERO
            && msg.version != Version::V2
            && !matches!(msg.message, EncodedMessageType::DHCommit(_))
        {
            return Err(OTRError::ProtocolViolation(
                "Receiver instance tag is required for this message type.",
            ));
        }
        let master_transfer = if matches!(msg.message, EncodedMessageType::DHKey(_))
            && !self.instances.contains_key(&msg.sender)
        {
            // A DH-Key response on an AKE that the master started with receiver tag 0: the AKE
            // state replicates into the fresh instance, so AKEs with multiple client instances
            // of the other party complete independently.
            self.instances
                .get(&INSTANCE_ZERO)
                .expect("BUG: master instance must exist")
                .ake
                .transfer()
                .ok()
        } else {
            None
        };
        let instance = self.get_or_create_instance(msg.sender);
        if let Some(context) = master_transfer {
            instance.adopt_ake(context);
        }
        let result = instance.handle(msg);
        if let Ok(UserMessage::ConfidentialSessionStarted(tag)) = &result {
            let tag = *tag;
            self.host
                .session_status_changed(tag, ProtocolStatus::Encrypted);
            if self.selected == INSTANCE_ZERO || self.status() == ProtocolStatus::Plaintext {
                // The client has not chosen an instance to talk to, so the newly established
                // confidential session becomes the outbound session.
                self.selected = tag;
            }
        }
        result
    }

    fn get_or_create_instance(&mut self, tag: InstanceTag) -> &mut Instance {
        if !self.instances.contains_key(&tag) {
            let remote_instances = self.instances.len() - 1;
            if remote_instances >= 1 && !self.signalled_multiple {
                self.host.multiple_instances_detected();
                self.signalled_multiple = true;
            }
            self.instances.insert(
                tag,
                Instance::new(Rc::clone(&self.details), tag, Rc::clone(&self.host)),
            );
        }
        self.instances
            .get_mut(&tag)
            .expect("BUG: instance was just inserted")
    }

    /// `send` transforms an outgoing message according to the protocol state of the selected
    /// instance, producing the sequence of payloads to pass to the transport.
    pub fn send(&mut self, content: &[u8]) -> Result<Vec<Vec<u8>>, OTRError> {
        let policy = self.host.policy();
        if !policy.viable() {
            return Ok(vec![Vec::from(content)]);
        }
        let offer = self.offer;
        let instance = self
            .instances
            .get_mut(&self.selected)
            .expect("BUG: selected instance must exist");
        if policy.contains(Policy::REQUIRE_ENCRYPTION)
            && instance.status() == ProtocolStatus::Plaintext
        {
            // Policy requires encryption: the message is withheld and a key exchange is invited
            // instead. The host is notified so the message can be retransmitted later.
            self.host.require_encrypted_message(content);
            self.query();
            return Err(OTRError::PolicyRestriction(
                "Encryption is required by policy, but no confidential session is established yet.",
            ));
        }
        if instance.status() == ProtocolStatus::Finished {
            self.host.finished_session_message(content);
            return Err(OTRError::IncorrectState(
                "Session is finished. The message was not sent.",
            ));
        }
        match instance.prepare(MessageFlags::empty(), content)? {
            EncodedMessageType::Unencoded(message) => {
                let tagged = policy.contains(Policy::SEND_WHITESPACE_TAG)
                    && offer == OfferStatus::Idle;
                if tagged {
                    self.offer = OfferStatus::Sent;
                    let versions = allowed_versions(&policy);
                    Ok(vec![serialize_message(&MessageType::Tagged(
                        versions, message,
                    ))])
                } else {
                    Ok(vec![serialize_message(&MessageType::Plaintext(message))])
                }
            }
            message => {
                let version = instance.state.version();
                let receiver = instance.receiver;
                let encoded = encode_message(version, self.details.tag, receiver, message);
                self.fragments(version, receiver, &encoded)
            }
        }
    }

    fn fragments(
        &self,
        version: Version,
        receiver: InstanceTag,
        encoded: &[u8],
    ) -> Result<Vec<Vec<u8>>, OTRError> {
        fragment::fragment(
            self.host.max_message_size(),
            version,
            self.details.tag,
            receiver,
            encoded,
        )
        .or(Err(OTRError::ProtocolViolation(
            "Message cannot be fragmented to the host's maximum message size.",
        )))
    }

    /// `query` sends the OTR query message for all policy-allowed versions, inviting the other
    /// party to start a key exchange.
    pub fn query(&mut self) {
        let versions = allowed_versions(&self.host.policy());
        if versions.is_empty() {
            return;
        }
        let mut message = serialize_message(&MessageType::Query(versions));
        message.push(b' ');
        message.extend(self.host.fallback_message());
        self.host.inject(&message);
    }

    /// `initiate` starts the AKE for the given version, towards a specific instance or broadcast
    /// (receiver tag 0) when the other party's instance is not yet known.
    pub fn initiate(
        &mut self,
        version: Version,
        receiver: Option<InstanceTag>,
    ) -> Result<UserMessage, OTRError> {
        if !self.host.policy().allowed(version) {
            return Err(OTRError::PolicyRestriction(
                "Requested protocol version is not allowed by policy.",
            ));
        }
        let receiver = receiver.unwrap_or(INSTANCE_ZERO);
        self.get_or_create_instance(receiver).initiate(version);
        Ok(UserMessage::None)
    }

    /// `end` ends the confidential session with the instance: the other party is sent the
    /// disconnect signal and the local state returns to plaintext.
    pub fn end(&mut self, instance: InstanceTag) -> Result<UserMessage, OTRError> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(OTRError::UnknownInstance(instance))?;
        let previous = inst.status();
        inst.reset();
        if previous == inst.status() {
            return Ok(UserMessage::None);
        }
        self.host
            .session_status_changed(instance, ProtocolStatus::Plaintext);
        Ok(UserMessage::Reset(instance))
    }

    /// `initiate_smp` starts the Socialist Millionaires Protocol with the given instance, to
    /// verify that the other party knows the same secret. The question is optional.
    pub fn initiate_smp(
        &mut self,
        instance: InstanceTag,
        secret: &[u8],
        question: &[u8],
    ) -> Result<(), OTRError> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(OTRError::UnknownInstance(instance))?;
        let tlv = inst.state.smp()?.initiate(secret, question)?;
        inst.send_tlv(&tlv)
    }

    /// `respond_smp` answers an SMP exchange initiated by the other party, after the host was
    /// asked for the secret.
    pub fn respond_smp(&mut self, instance: InstanceTag, secret: &[u8]) -> Result<(), OTRError> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(OTRError::UnknownInstance(instance))?;
        let tlv = inst.state.smp()?.respond(secret)?;
        inst.send_tlv(&tlv)
    }

    /// `abort_smp` aborts a running SMP exchange.
    pub fn abort_smp(&mut self, instance: InstanceTag) -> Result<(), OTRError> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(OTRError::UnknownInstance(instance))?;
        let tlv = inst.state.smp()?.abort();
        self.host.smp_aborted(instance);
        let inst = self
            .instances
            .get_mut(&instance)
            .expect("BUG: instance just accessed");
        inst.send_tlv(&tlv)
    }

    /// `send_extra_symmetric_key_tlv` signals to the other party that the extra symmetric key is
    /// about to be used, with a use-specific context.
    pub fn send_extra_symmetric_key_tlv(
        &mut self,
        instance: InstanceTag,
        context: u32,
        data: &[u8],
    ) -> Result<(), OTRError> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(OTRError::UnknownInstance(instance))?;
        // verify that an encrypted session is in place before signalling
        inst.state.extra_symmetric_key()?;
        let payload = OTREncoder::new()
            .write_u32(context)
            .write(data)
            .to_vec();
        inst.send_tlv(&TLV(TLV_TYPE_EXTRA_SYMMETRIC_KEY, payload))
    }

    fn select_version(&self, policy: &Policy, versions: &[Version]) -> Option<Version> {
        if versions.contains(&Version::V3) && policy.contains(Policy::ALLOW_V3) {
            Some(Version::V3)
        } else if versions.contains(&Version::V2) && policy.contains(Policy::ALLOW_V2) {
            Some(Version::V2)
        } else {
            None
        }
    }

    /// `has_sessions` checks whether any instance has an established (or finished) session.
    fn has_sessions(&self) -> bool {
        self.instances.iter().any(|i| {
            i.1.status() == ProtocolStatus::Encrypted || i.1.status() == ProtocolStatus::Finished
        })
    }
}

fn allowed_versions(policy: &Policy) -> Vec<Version> {
    let mut versions = Vec::new();
    if policy.contains(Policy::ALLOW_V2) {
        versions.push(Version::V2);
    }
    if policy.contains(Policy::ALLOW_V3) {
        versions.push(Version::V3);
    }
    versions
}

/// `Instance` is the sub-session bound to one specific client of the other party: its own
/// assembler, key-exchange context and message state.
struct Instance {
    details: Rc<AccountDetails>,
    receiver: InstanceTag,
    host: Rc<dyn Host>,
    assembler: Assembler,
    state: Box<dyn protocol::ProtocolState>,
    ake: AKEContext,
}

impl Instance {
    fn new(details: Rc<AccountDetails>, receiver: InstanceTag, host: Rc<dyn Host>) -> Self {
        Self {
            details,
            receiver,
            assembler: Assembler::new(),
            state: protocol::new_state(),
            ake: AKEContext::new(Rc::clone(&host)),
            host,
        }
    }

    fn status(&self) -> ProtocolStatus {
        self.state.status()
    }

    fn adopt_ake(&mut self, context: AKEContext) {
        self.ake = context;
    }

    /// `inject_encoded` encodes a protocol-internal message and passes it to the transport, in
    /// fragments whenever the transport's maximum message size requires so.
    fn inject_encoded(&self, version: Version, message: EncodedMessageType) {
        let encoded = encode_message(version, self.details.tag, self.receiver, message);
        match fragment::fragment(
            self.host.max_message_size(),
            version,
            self.details.tag,
            self.receiver,
            &encoded,
        ) {
            Ok(fragments) => {
                for piece in fragments {
                    self.host.inject(&piece);
                }
            }
            Err(error) => {
                log::warn!("Message cannot be fragmented to transport size: {error:?}");
            }
        }
    }

    fn initiate(&mut self, version: Version) {
        let msg = self.ake.initiate(version);
        self.inject_encoded(self.ake.version(), msg);
    }

    fn respond_ake(
        &mut self,
        response: Result<EncodedMessageType, AKEError>,
    ) -> Result<UserMessage, OTRError> {
        match response {
            Ok(msg) => {
                self.inject_encoded(self.ake.version(), msg);
                Ok(UserMessage::None)
            }
            Err(error) => convert_ake_error(error),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn handle(&mut self, message: EncodedMessage) -> Result<UserMessage, OTRError> {
        debug_assert!(message.sender == self.receiver);
        match message.message {
            EncodedMessageType::Unencoded(_) => Err(OTRError::ProtocolViolation(
                "Unencoded message-type cannot occur as input.",
            )),
            EncodedMessageType::DHCommit(msg) => {
                let response = self.ake.handle_dhcommit(message.version, msg);
                self.respond_ake(response)
            }
            EncodedMessageType::DHKey(msg) => {
                if message.version != self.ake.version() {
                    return Ok(UserMessage::None);
                }
                let response = self.ake.handle_dhkey(msg);
                self.respond_ake(response)
            }
            EncodedMessageType::RevealSignature(msg) => {
                if message.version != self.ake.version() {
                    return Ok(UserMessage::None);
                }
                match self.ake.handle_reveal_signature(msg) {
                    Ok((material, response)) => {
                        let version = self.ake.version();
                        self.state = self.state.secure(
                            Rc::clone(&self.host),
                            self.details.tag,
                            self.receiver,
                            material,
                        );
                        self.inject_encoded(version, response);
                        Ok(UserMessage::ConfidentialSessionStarted(self.receiver))
                    }
                    Err(error) => convert_ake_error(error),
                }
            }
            EncodedMessageType::Signature(msg) => {
                if message.version != self.ake.version() {
                    return Ok(UserMessage::None);
                }
                match self.ake.handle_signature(msg) {
                    Ok(material) => {
                        self.state = self.state.secure(
                            Rc::clone(&self.host),
                            self.details.tag,
                            self.receiver,
                            material,
                        );
                        Ok(UserMessage::ConfidentialSessionStarted(self.receiver))
                    }
                    Err(error) => convert_ake_error(error),
                }
            }
            EncodedMessageType::Data(msg) => {
                let (result, transition) = self.state.handle(&msg);
                if let Some(next) = transition {
                    self.state = next;
                    if self.state.status() == ProtocolStatus::Finished {
                        self.host
                            .session_status_changed(self.receiver, ProtocolStatus::Finished);
                    }
                }
                match result {
                    Ok(UserMessage::Confidential(tag, content, tlvs)) => {
                        self.process_tlvs(tag, content, tlvs)
                    }
                    Ok(message) => Ok(message),
                    Err(OTRError::UnreadableMessage(_)) => {
                        self.host.unreadable_message_received(self.receiver);
                        let reply = self.host.reply_for_unreadable_message();
                        self.host
                            .inject(&serialize_message(&MessageType::Error(reply)));
                        if msg.flags.contains(MessageFlags::IGNORE_UNREADABLE) {
                            Ok(UserMessage::None)
                        } else {
                            Err(OTRError::UnreadableMessage(self.receiver))
                        }
                    }
                    Err(error) => Err(error),
                }
            }
            EncodedMessageType::Identity(_)
            | EncodedMessageType::AuthR(_)
            | EncodedMessageType::AuthI(_)
            | EncodedMessageType::Data4(_) => {
                // Version 4 sessions cannot be negotiated (yet); encoded v4 traffic is routed
                // but dropped here.
                Err(OTRError::UnsupportedVersion(4))
            }
        }
    }

    fn process_tlvs(
        &mut self,
        tag: InstanceTag,
        content: Vec<u8>,
        tlvs: Vec<TLV>,
    ) -> Result<UserMessage, OTRError> {
        let mut remaining = Vec::new();
        let mut outcome: Option<UserMessage> = None;
        for tlv in tlvs {
            if smp::is_smp_tlv(&tlv) {
                outcome = self.handle_smp_tlv(&tlv);
                continue;
            }
            if tlv.0 == TLV_TYPE_EXTRA_SYMMETRIC_KEY {
                if let Ok(key) = self.state.extra_symmetric_key() {
                    if tlv.1.len() >= 4 {
                        let context = u32::from_be_bytes([tlv.1[0], tlv.1[1], tlv.1[2], tlv.1[3]]);
                        self.host
                            .extra_symmetric_key_discovered(&key, context, &tlv.1[4..]);
                    }
                }
                continue;
            }
            remaining.push(tlv);
        }
        if content.is_empty() && remaining.is_empty() {
            Ok(outcome.unwrap_or(UserMessage::None))
        } else {
            Ok(UserMessage::Confidential(tag, content, remaining))
        }
    }

    /// `handle_smp_tlv` processes a single SMP TLV, sending the response or abort that the
    /// exchange calls for and notifying the host of intermediate and final outcomes.
    fn handle_smp_tlv(&mut self, tlv: &TLV) -> Option<UserMessage> {
        let Ok(smp_context) = self.state.smp() else {
            return None;
        };
        let result = smp_context.handle(tlv);
        match result {
            Ok(Some(reply)) => {
                if self.send_tlv(&reply).is_err() {
                    log::warn!("Failed to send SMP reply.");
                }
            }
            Ok(None) => {
                if let Ok(smp_context) = self.state.smp() {
                    if let Some(question) = smp_context.pending_question() {
                        self.host.ask_for_secret(self.receiver, &question);
                    }
                }
            }
            Err(_) => {
                let smp_context = self
                    .state
                    .smp()
                    .expect("BUG: SMP context was accessible before");
                let cheated = smp_context.status() == SMPStatus::Cheated;
                let abort = smp_context.abort();
                self.host.smp_error(self.receiver, tlv.0, cheated);
                if self.send_tlv(&abort).is_err() {
                    log::warn!("Failed to send SMP abort.");
                }
                return None;
            }
        }
        // Report the conclusion of the exchange, if any.
        let status = self.state.smp().ok()?.status();
        match status {
            SMPStatus::Success => {
                let fingerprint = self.state.their_fingerprint().ok()?;
                self.host.verify(&fingerprint);
                Some(UserMessage::SMPSucceeded(self.receiver))
            }
            SMPStatus::Failure => {
                let fingerprint = self.state.their_fingerprint().ok()?;
                self.host.unverify(&fingerprint);
                Some(UserMessage::SMPFailed(self.receiver))
            }
            SMPStatus::Aborted => {
                self.host.smp_aborted(self.receiver);
                None
            }
            SMPStatus::Initial | SMPStatus::Cheated => None,
        }
    }

    fn prepare(
        &mut self,
        flags: MessageFlags,
        content: &[u8],
    ) -> Result<EncodedMessageType, OTRError> {
        self.state.prepare(flags, content)
    }

    /// `send_tlv` sends a TLV record, without user content, in an encrypted data message.
    fn send_tlv(&mut self, tlv: &TLV) -> Result<(), OTRError> {
        let content = OTREncoder::new().write_u8(0).write_tlv(tlv).to_vec();
        let message = self
            .state
            .prepare(MessageFlags::IGNORE_UNREADABLE, &content)?;
        self.inject_encoded(self.state.version(), message);
        Ok(())
    }

    fn reset(&mut self) {
        let version = self.state.version();
        let (disconnect, state) = self.state.finish();
        self.state = state;
        if let Some(message) = disconnect {
            self.inject_encoded(version, message);
        }
    }
}

fn convert_ake_error(error: AKEError) -> Result<UserMessage, OTRError> {
    match error {
        AKEError::MessageIgnored | AKEError::IncorrectState => {
            // The message does not fit the current AKE state; it is dropped without breaking
            // the exchange, as the other party may retransmit.
            Ok(UserMessage::None)
        }
        AKEError::CryptographicViolation(violation) => {
            Err(OTRError::CryptographicViolation(violation))
        }
        AKEError::DataProcessing(detail) => Err(OTRError::ProtocolViolation(detail)),
    }
}

/// `OfferStatus` tracks the state of the whitespace-tag offer for OTR support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OfferStatus {
    Idle,
    Sent,
    Accepted,
    Rejected,
}

/// `AccountDetails` is the local end's fixed data, shared read-only with every instance.
struct AccountDetails {
    tag: InstanceTag,
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        rc::Rc,
    };

    use super::Account;
    use crate::{
        crypto::{dsa, ed448},
        encoding::{Fingerprint, MessageFlags},
        instancetag::InstanceTag,
        messages::{encode_message, DataMessage, EncodedMessageType},
        Host, OTRError, Policy, ProtocolStatus, UserMessage, Version,
    };

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Verified(Fingerprint),
        Unverified(Fingerprint),
        AskedSecret(Vec<u8>),
        MultipleInstances,
        OtherInstance,
        Unreadable,
        UnencryptedWarning,
        StatusChanged(InstanceTag, ProtocolStatus),
        SMPAborted,
        RequireEncrypted(Vec<u8>),
        FinishedMessage(Vec<u8>),
    }

    struct TestHost {
        policy: Cell<Policy>,
        keypair: dsa::Keypair,
        outbound: RefCell<VecDeque<Vec<u8>>>,
        max_size: Cell<usize>,
        events: RefCell<Vec<Event>>,
    }

    impl TestHost {
        fn new(policy: Policy) -> Rc<Self> {
            Rc::new(Self {
                policy: Cell::new(policy),
                keypair: dsa::Keypair::generate(),
                outbound: RefCell::new(VecDeque::new()),
                max_size: Cell::new(usize::MAX),
                events: RefCell::new(Vec::new()),
            })
        }

        fn take_next(&self) -> Option<Vec<u8>> {
            self.outbound.borrow_mut().pop_front()
        }

        fn has_event(&self, expected: &Event) -> bool {
            self.events.borrow().iter().any(|e| e == expected)
        }

        fn count_events(&self, expected: &Event) -> usize {
            self.events.borrow().iter().filter(|e| *e == expected).count()
        }
    }

    impl Host for TestHost {
        fn inject(&self, message: &[u8]) {
            self.outbound.borrow_mut().push_back(Vec::from(message));
        }

        fn keypair(&self) -> &dsa::Keypair {
            &self.keypair
        }

        fn keypair_identity(&self) -> &ed448::EdDSAKeyPair {
            unimplemented!("OTRv4 identity keys are not used in these tests")
        }

        fn client_profile(&self) -> Vec<u8> {
            Vec::new()
        }

        fn policy(&self) -> Policy {
            self.policy.get()
        }

        fn max_message_size(&self) -> usize {
            self.max_size.get()
        }

        fn unreadable_message_received(&self, _instance: InstanceTag) {
            self.events.borrow_mut().push(Event::Unreadable);
        }

        fn unencrypted_message_received(&self, _message: &[u8]) {
            self.events.borrow_mut().push(Event::UnencryptedWarning);
        }

        fn message_from_another_instance(&self) {
            self.events.borrow_mut().push(Event::OtherInstance);
        }

        fn multiple_instances_detected(&self) {
            self.events.borrow_mut().push(Event::MultipleInstances);
        }

        fn session_status_changed(&self, instance: InstanceTag, status: ProtocolStatus) {
            self.events
                .borrow_mut()
                .push(Event::StatusChanged(instance, status));
        }

        fn ask_for_secret(&self, _instance: InstanceTag, question: &[u8]) {
            self.events
                .borrow_mut()
                .push(Event::AskedSecret(Vec::from(question)));
        }

        fn smp_aborted(&self, _instance: InstanceTag) {
            self.events.borrow_mut().push(Event::SMPAborted);
        }

        fn verify(&self, fingerprint: &Fingerprint) {
            self.events.borrow_mut().push(Event::Verified(*fingerprint));
        }

        fn unverify(&self, fingerprint: &Fingerprint) {
            self.events
                .borrow_mut()
                .push(Event::Unverified(*fingerprint));
        }

        fn finished_session_message(&self, message: &[u8]) {
            self.events
                .borrow_mut()
                .push(Event::FinishedMessage(Vec::from(message)));
        }

        fn require_encrypted_message(&self, message: &[u8]) {
            self.events
                .borrow_mut()
                .push(Event::RequireEncrypted(Vec::from(message)));
        }
    }

    /// Deliver all pending protocol-internal messages between the two parties until the
    /// exchange settles, collecting the results of every `receive`.
    fn pump(
        alice: &mut Account,
        host_alice: &Rc<TestHost>,
        bob: &mut Account,
        host_bob: &Rc<TestHost>,
    ) -> Vec<Result<UserMessage, OTRError>> {
        let mut results = Vec::new();
        loop {
            if let Some(message) = host_alice.take_next() {
                results.push(bob.receive(&message));
            } else if let Some(message) = host_bob.take_next() {
                results.push(alice.receive(&message));
            } else {
                return results;
            }
        }
    }

    fn establish(
        policy_alice: Policy,
        policy_bob: Policy,
    ) -> (Account, Rc<TestHost>, Account, Rc<TestHost>) {
        let host_alice = TestHost::new(policy_alice);
        let host_bob = TestHost::new(policy_bob);
        let mut alice = Account::new(host_alice.clone());
        let mut bob = Account::new(host_bob.clone());
        alice.query();
        // The query travels to Bob; from there the AKE ping-pongs to completion.
        pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
        (alice, host_alice, bob, host_bob)
    }

    #[test]
    fn test_query_starts_encrypted_session_and_transfers_message() {
        let policy = Policy::ALLOW_V2 | Policy::ALLOW_V3;
        let (mut alice, host_alice, mut bob, host_bob) = establish(policy, policy);
        // Encrypted sessions negotiated v3 and share the session identifier.
        assert_eq!(
            alice.ssid(bob.tag()).unwrap(),
            bob.ssid(alice.tag()).unwrap()
        );
        assert!(host_alice.has_event(&Event::StatusChanged(
            bob.tag(),
            ProtocolStatus::Encrypted
        )));
        assert!(host_bob.has_event(&Event::StatusChanged(
            alice.tag(),
            ProtocolStatus::Encrypted
        )));
        // A message transforms to an unreadable payload and arrives intact.
        let payloads = alice.send(b"ping").unwrap();
        assert_eq!(1, payloads.len());
        assert!(payloads[0].starts_with(b"?OTR:"));
        assert!(!payloads[0].windows(4).any(|w| w == b"ping"));
        match bob.receive(&payloads[0]).unwrap() {
            UserMessage::Confidential(tag, content, tlvs) => {
                assert_eq!(alice.tag(), tag);
                assert_eq!(b"ping".to_vec(), content);
                assert!(tlvs.is_empty());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_version2_session_without_instance_tags() {
        let policy = Policy::ALLOW_V2;
        let (mut alice, _host_alice, mut bob, _host_bob) = establish(policy, policy);
        // OTRv2 has no instance tags: the session lives on the rendezvous instance.
        assert_eq!(Some(ProtocolStatus::Encrypted), alice.status_of(0));
        assert_eq!(Some(ProtocolStatus::Encrypted), bob.status_of(0));
        assert_eq!(alice.ssid(0).unwrap(), bob.ssid(0).unwrap());
        let payloads = alice.send(b"ping").unwrap();
        match bob.receive(&payloads[0]).unwrap() {
            UserMessage::Confidential(tag, content, _) => {
                assert_eq!(0, tag);
                assert_eq!(b"ping".to_vec(), content);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_session_with_fragmentation() {
        let policy = Policy::ALLOW_V3;
        let host_alice = TestHost::new(policy);
        let host_bob = TestHost::new(policy);
        host_alice.max_size.set(208);
        host_bob.max_size.set(208);
        let mut alice = Account::new(host_alice.clone());
        let mut bob = Account::new(host_bob.clone());
        alice.query();
        // The AKE completes over fragmented transport messages as well.
        pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        let payloads = alice.send(b"a somewhat longer message to force fragmentation").unwrap();
        assert!(payloads.len() > 1);
        assert!(payloads.iter().all(|p| p.len() <= 208));
        let mut received = Vec::new();
        for p in &payloads {
            match bob.receive(p).unwrap() {
                UserMessage::None => continue,
                UserMessage::Confidential(_, content, _) => received = content,
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(
            b"a somewhat longer message to force fragmentation".to_vec(),
            received
        );
    }

    #[test]
    fn test_replayed_data_message_rejected() {
        let policy = Policy::ALLOW_V3;
        let (mut alice, _host_alice, mut bob, _host_bob) = establish(policy, policy);
        let payloads = alice.send(b"once only").unwrap();
        assert!(matches!(
            bob.receive(&payloads[0]),
            Ok(UserMessage::Confidential(_, _, _))
        ));
        // The duplicate carries a valid MAC but fails the counter check.
        assert!(bob.receive(&payloads[0]).is_err());
    }

    #[test]
    fn test_smp_success_scenario() {
        let policy = Policy::ALLOW_V3;
        let (mut alice, host_alice, mut bob, host_bob) = establish(policy, policy);
        alice
            .initiate_smp(bob.tag(), b"swordfish", b"favourite fish?")
            .unwrap();
        let results = pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert!(host_bob.has_event(&Event::AskedSecret(b"favourite fish?".to_vec())));
        assert!(!results.iter().any(Result::is_err));
        bob.respond_smp(alice.tag(), b"swordfish").unwrap();
        let results = pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert!(results
            .iter()
            .any(|r| matches!(r, Ok(UserMessage::SMPSucceeded(_)))));
        let fpr_alice = host_alice.keypair.public_key().fingerprint();
        let fpr_bob = host_bob.keypair.public_key().fingerprint();
        assert!(host_alice.has_event(&Event::Verified(fpr_bob)));
        assert!(host_bob.has_event(&Event::Verified(fpr_alice)));
    }

    #[test]
    fn test_smp_failure_scenario() {
        let policy = Policy::ALLOW_V3;
        let (mut alice, host_alice, mut bob, host_bob) = establish(policy, policy);
        alice.initiate_smp(bob.tag(), b"swordfish", b"").unwrap();
        pump(&mut alice, &host_alice, &mut bob, &host_bob);
        bob.respond_smp(alice.tag(), b"password").unwrap();
        let results = pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert!(results
            .iter()
            .any(|r| matches!(r, Ok(UserMessage::SMPFailed(_)))));
        let fpr_alice = host_alice.keypair.public_key().fingerprint();
        let fpr_bob = host_bob.keypair.public_key().fingerprint();
        assert!(host_alice.has_event(&Event::Unverified(fpr_bob)));
        assert!(host_bob.has_event(&Event::Unverified(fpr_alice)));
    }

    #[test]
    fn test_multiple_instances() {
        let policy = Policy::ALLOW_V3;
        let host_alice = TestHost::new(policy);
        let host_bob1 = TestHost::new(policy);
        let host_bob2 = TestHost::new(policy);
        let mut alice = Account::new(host_alice.clone());
        let mut bob1 = Account::new(host_bob1.clone());
        let mut bob2 = Account::new(host_bob2.clone());
        bob1.initiate(Version::V3, None).unwrap();
        bob2.initiate(Version::V3, None).unwrap();
        pump(&mut alice, &host_alice, &mut bob1, &host_bob1);
        pump(&mut alice, &host_alice, &mut bob2, &host_bob2);
        assert_eq!(
            Some(ProtocolStatus::Encrypted),
            alice.status_of(bob1.tag())
        );
        assert_eq!(
            Some(ProtocolStatus::Encrypted),
            alice.status_of(bob2.tag())
        );
        assert_eq!(ProtocolStatus::Encrypted, bob1.status());
        assert_eq!(ProtocolStatus::Encrypted, bob2.status());
        assert_eq!(1, host_alice.count_events(&Event::MultipleInstances));
        // A message from Bob's first instance decrypts only in its own sub-session.
        let payloads = bob1.send(b"from bob one").unwrap();
        match alice.receive(&payloads[0]).unwrap() {
            UserMessage::Confidential(tag, content, _) => {
                assert_eq!(bob1.tag(), tag);
                assert_eq!(b"from bob one".to_vec(), content);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let payloads = bob2.send(b"from bob two").unwrap();
        match alice.receive(&payloads[0]).unwrap() {
            UserMessage::Confidential(tag, content, _) => {
                assert_eq!(bob2.tag(), tag);
                assert_eq!(b"from bob two".to_vec(), content);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_policy_gate_disables_processing() {
        let host = TestHost::new(Policy::empty());
        let mut account = Account::new(host.clone());
        // Even OTR-specific content passes through verbatim.
        match account.receive(b"?OTRv23? hi there").unwrap() {
            UserMessage::Plaintext(content) => {
                assert_eq!(b"?OTRv23? hi there".to_vec(), content);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(
            vec![b"hello".to_vec()],
            account.send(b"hello").unwrap()
        );
        assert!(host.outbound.borrow().is_empty());
    }

    #[test]
    fn test_require_encryption_withholds_message() {
        let host = TestHost::new(Policy::ALLOW_V3 | Policy::REQUIRE_ENCRYPTION);
        let mut account = Account::new(host.clone());
        assert!(matches!(
            account.send(b"secret stuff"),
            Err(OTRError::PolicyRestriction(_))
        ));
        assert!(host.has_event(&Event::RequireEncrypted(b"secret stuff".to_vec())));
        // and a query message was sent out to invite an AKE
        let query = host.take_next().unwrap();
        assert!(query.starts_with(b"?OTRv3?"));
    }

    #[test]
    fn test_whitespace_tag_offered_once() {
        let host = TestHost::new(Policy::ALLOW_V2 | Policy::ALLOW_V3 | Policy::SEND_WHITESPACE_TAG);
        let mut account = Account::new(host.clone());
        let first = account.send(b"hello").unwrap();
        assert_eq!(1, first.len());
        assert!(first[0]
            .windows(16)
            .any(|w| w == b" \t  \t\t\t\t \t \t \t  "));
        // subsequent messages are not tagged again
        let second = account.send(b"hello again").unwrap();
        assert_eq!(b"hello again".to_vec(), second[0]);
    }

    #[test]
    fn test_whitespace_tag_triggers_ake() {
        let policy = Policy::ALLOW_V3 | Policy::SEND_WHITESPACE_TAG | Policy::WHITESPACE_START_AKE;
        let host_alice = TestHost::new(policy);
        let host_bob = TestHost::new(policy);
        let mut alice = Account::new(host_alice.clone());
        let mut bob = Account::new(host_bob.clone());
        let tagged = alice.send(b"you there?").unwrap();
        match bob.receive(&tagged[0]).unwrap() {
            UserMessage::Plaintext(content) => assert_eq!(b"you there?".to_vec(), content),
            other => panic!("unexpected result: {other:?}"),
        }
        pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
    }

    #[test]
    fn test_end_session_finishes_remote() {
        let policy = Policy::ALLOW_V3;
        let (mut alice, host_alice, mut bob, host_bob) = establish(policy, policy);
        alice.end(bob.tag()).unwrap();
        assert_eq!(Some(ProtocolStatus::Plaintext), alice.status_of(bob.tag()));
        let results = pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert!(results
            .iter()
            .any(|r| matches!(r, Ok(UserMessage::ConfidentialSessionFinished(_, _)))));
        assert_eq!(Some(ProtocolStatus::Finished), bob.status_of(alice.tag()));
        // Bob cannot send anymore: the message is refused until an explicit reset.
        assert!(bob.send(b"too late").is_err());
        assert!(host_bob.has_event(&Event::FinishedMessage(b"too late".to_vec())));
        bob.end(alice.tag()).unwrap();
        assert_eq!(Some(ProtocolStatus::Plaintext), bob.status_of(alice.tag()));
    }

    #[test]
    fn test_message_for_other_instance_discarded() {
        let policy = Policy::ALLOW_V3;
        let host = TestHost::new(policy);
        let mut account = Account::new(host.clone());
        let crafted = encode_message(
            Version::V3,
            0x0000_0200,
            0x0000_0300, // another client of our account, not us
            EncodedMessageType::Data(junk_data_message()),
        );
        assert!(matches!(
            account.receive(&crafted),
            Err(OTRError::MessageForOtherInstance)
        ));
        assert!(host.has_event(&Event::OtherInstance));
    }

    #[test]
    fn test_data_message_in_plaintext_state_replies_error() {
        let policy = Policy::ALLOW_V3;
        let host = TestHost::new(policy);
        let mut account = Account::new(host.clone());
        let crafted = encode_message(
            Version::V3,
            0x0000_0200,
            account.tag(),
            EncodedMessageType::Data(junk_data_message()),
        );
        assert!(matches!(
            account.receive(&crafted),
            Err(OTRError::UnreadableMessage(_))
        ));
        assert!(host.has_event(&Event::Unreadable));
        let reply = host.take_next().unwrap();
        assert!(reply.starts_with(b"?OTR Error:"));
    }

    #[test]
    fn test_unencrypted_message_warning_during_session() {
        let policy = Policy::ALLOW_V3;
        let (_alice, _host_alice, mut bob, host_bob) = establish(policy, policy);
        match bob.receive(b"suddenly plaintext").unwrap() {
            UserMessage::WarningUnencrypted(content) => {
                assert_eq!(b"suddenly plaintext".to_vec(), content);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(host_bob.has_event(&Event::UnencryptedWarning));
    }

    #[test]
    fn test_extra_symmetric_key_agreement_and_tlv() {
        let policy = Policy::ALLOW_V3;
        let (mut alice, host_alice, mut bob, host_bob) = establish(policy, policy);
        assert_eq!(
            alice.extra_symmetric_key(bob.tag()).unwrap(),
            bob.extra_symmetric_key(alice.tag()).unwrap()
        );
        alice
            .send_extra_symmetric_key_tlv(bob.tag(), 0x0000_0001, b"file-transfer")
            .unwrap();
        let results = pump(&mut alice, &host_alice, &mut bob, &host_bob);
        assert!(!results.iter().any(Result::is_err));
    }

    fn junk_data_message() -> DataMessage {
        DataMessage {
            flags: MessageFlags::empty(),
            sender_keyid: 1,
            receiver_keyid: 1,
            dh_y: num_bigint::BigUint::from(0x1234_5678u32),
            ctr: [0, 0, 0, 0, 0, 0, 0, 1],
            encrypted: vec![1, 2, 3, 4],
            authenticator: [0u8; 20],
            revealed: Vec::new(),
        }
    }
}
