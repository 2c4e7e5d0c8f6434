// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::HashMap;

use num_bigint::BigUint;

use crate::{
    crypto::{dh, otr::DataSecrets},
    encoding::{KeyID, OTREncoder, CTR},
    utils, OTRError,
};

/// `NUM_KEYS` sizes the rotation window: the current and the previous key of each party stay
/// available, anything older is discarded.
const NUM_KEYS: usize = 2;

/// `KeyManager` maintains both our rotating keypairs and the other party's rotating public keys,
/// together with the send counter, replay protection and the administration of MAC keys that
/// must be revealed after use.
pub struct KeyManager {
    ours: KeypairRotation,
    theirs: PublicKeyRotation,
    /// Our send counter. Strictly monotonically increasing; never zero on the wire.
    counter: u64,
    /// Highest received counter value per (their keyid, our keyid) pair, for replay rejection.
    received: HashMap<(KeyID, KeyID), u64>,
    /// Receiving MAC keys that have authenticated at least one message, stored until the
    /// involved session key rotates away.
    used_macs: HashMap<(KeyID, KeyID), [u8; 20]>,
    /// Old MAC keys, ready to be revealed in the next outgoing data message.
    reveal_queue: Vec<u8>,
}

impl KeyManager {
    pub fn new(ours: (KeyID, dh::Keypair), theirs: (KeyID, BigUint)) -> Self {
        Self {
            ours: KeypairRotation::new(ours.0, ours.1),
            theirs: PublicKeyRotation::new(theirs.0, theirs.1),
            counter: 0,
            received: HashMap::new(),
            used_macs: HashMap::new(),
            reveal_queue: Vec::new(),
        }
    }

    /// `next_counter` increments the send counter and produces its 8-byte big-endian value.
    pub fn next_counter(&mut self) -> CTR {
        self.counter += 1;
        self.counter.to_be_bytes()
    }

    #[must_use]
    pub fn our_current(&self) -> (KeyID, &dh::Keypair) {
        self.ours.current()
    }

    #[must_use]
    pub fn our_next(&self) -> (KeyID, &dh::Keypair) {
        self.ours.next()
    }

    #[must_use]
    pub fn their_current(&self) -> (KeyID, &BigUint) {
        self.theirs.current()
    }

    /// `session_secrets` derives the directional message keys for the combination of our keypair
    /// `our_keyid` and their public key `their_keyid`.
    pub fn session_secrets(
        &self,
        our_keyid: KeyID,
        their_keyid: KeyID,
    ) -> Result<DataSecrets, OTRError> {
        let our_keypair = self.ours.select(our_keyid)?;
        let their_key = self.theirs.select(their_keyid)?;
        let shared = our_keypair.generate_shared_secret(their_key);
        let secbytes = OTREncoder::new().write_mpi(&shared).to_vec();
        Ok(DataSecrets::derive(
            &our_keypair.public,
            their_key,
            &secbytes,
        ))
    }

    /// `extra_symmetric_key` derives the 32-byte extra symmetric key from the current session
    /// keys.
    #[must_use]
    pub fn extra_symmetric_key(&self) -> [u8; 32] {
        let (_, our_keypair) = self.ours.current();
        let (_, their_key) = self.theirs.current();
        crate::crypto::otr::extra_symmetric_key(&our_keypair.generate_shared_secret(their_key))
    }

    /// `verify_receive_counter` rejects counter values that do not strictly exceed the highest
    /// value seen for this key pair.
    pub fn verify_receive_counter(
        &self,
        their_keyid: KeyID,
        our_keyid: KeyID,
        ctr: &CTR,
    ) -> Result<(), OTRError> {
        let value = u64::from_be_bytes(*ctr);
        if value == 0 {
            return Err(OTRError::ProtocolViolation("Counter must not be zero."));
        }
        let last = self
            .received
            .get(&(their_keyid, our_keyid))
            .copied()
            .unwrap_or(0);
        if value > last {
            Ok(())
        } else {
            Err(OTRError::ProtocolViolation(
                "Counter value was used before. Message is rejected as replay.",
            ))
        }
    }

    /// `register_used_mac_key` records the counter value of a successfully authenticated message
    /// and remembers the receiving MAC key for later revelation.
    pub fn register_used_mac_key(
        &mut self,
        their_keyid: KeyID,
        our_keyid: KeyID,
        ctr: &CTR,
        mac_key: [u8; 20],
    ) {
        self.received
            .insert((their_keyid, our_keyid), u64::from_be_bytes(*ctr));
        self.used_macs.insert((their_keyid, our_keyid), mac_key);
    }

    /// `acknowledge_ours` processes the acknowledgement of our key with the given ID, rotating
    /// our keypairs when the acknowledgement concerns our next key.
    pub fn acknowledge_ours(&mut self, key_id: KeyID) -> Result<(), OTRError> {
        if !self.ours.acknowledge(key_id)? {
            return Ok(());
        }
        // Our keypair `key_id - 1` rotated away: its receiving MAC keys become public.
        let retired = key_id - 1;
        self.retire_macs(|(_, our)| *our == retired);
        Ok(())
    }

    /// `register_their_next` registers the next public key the other party advertises,
    /// rotating their public keys when it is genuinely new.
    pub fn register_their_next(
        &mut self,
        sender_keyid: KeyID,
        next_key: &BigUint,
    ) -> Result<(), OTRError> {
        if !self.theirs.register(sender_keyid, next_key)? || sender_keyid < 2 {
            return Ok(());
        }
        // Rotating to `sender_keyid + 1` pushes their key `sender_keyid - 1` out of the window.
        let retired = sender_keyid - 1;
        self.retire_macs(|(their, _)| *their <= retired);
        Ok(())
    }

    fn retire_macs(&mut self, retired: impl Fn(&(KeyID, KeyID)) -> bool) {
        let keys: Vec<(KeyID, KeyID)> = self
            .used_macs
            .keys()
            .filter(|k| retired(k))
            .copied()
            .collect();
        for k in keys {
            let mac = self
                .used_macs
                .remove(&k)
                .expect("BUG: key was just listed");
            self.reveal_queue.extend_from_slice(&mac);
        }
        let (our_current, _) = self.ours.current();
        let (their_current, _) = self.theirs.current();
        self.received
            .retain(|(their, our), _| *their + 1 >= their_current && *our + 1 >= our_current);
    }

    /// `take_reveal_queue` drains the old MAC keys accumulated from rotations, to be attached to
    /// the next outgoing data message.
    pub fn take_reveal_queue(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.reveal_queue)
    }
}

/// `KeypairRotation` tracks our two live DH keypairs and advances them as acknowledgements
/// arrive.
///
/// Only the last acknowledged key ID is tracked; IDs increase by one per rotation, so the
/// successor needs no separate bookkeeping. OTR delivers messages in order, which makes it safe
/// to overwrite a keypair the moment its successor has been acknowledged.
struct KeypairRotation {
    keys: [dh::Keypair; NUM_KEYS],
    acknowledged: KeyID,
}

impl KeypairRotation {
    fn new(initial_keyid: KeyID, initial_key: dh::Keypair) -> Self {
        assert!(initial_keyid > 0);
        let mut keys: [dh::Keypair; NUM_KEYS] = [dh::Keypair::generate(), dh::Keypair::generate()];
        keys[initial_keyid as usize % NUM_KEYS] = initial_key;
        Self {
            keys,
            acknowledged: initial_keyid,
        }
    }

    /// `current` is the key acknowledged by the other party; the key we are sending with.
    fn current(&self) -> (KeyID, &dh::Keypair) {
        let idx = (self.acknowledged as usize) % NUM_KEYS;
        (self.acknowledged, &self.keys[idx])
    }

    /// `next` is the key advertised as `next_dh` in outgoing data messages.
    fn next(&self) -> (KeyID, &dh::Keypair) {
        let idx = (self.acknowledged as usize + 1) % NUM_KEYS;
        (self.acknowledged + 1, &self.keys[idx])
    }

    fn select(&self, key_id: KeyID) -> Result<&dh::Keypair, OTRError> {
        if key_id == self.acknowledged {
            Ok(&self.keys[key_id as usize % NUM_KEYS])
        } else if key_id == self.acknowledged + 1 {
            Ok(&self.keys[key_id as usize % NUM_KEYS])
        } else {
            Err(OTRError::ProtocolViolation(
                "Unknown key ID for local keypair.",
            ))
        }
    }

    /// `acknowledge` registers which of our key IDs the other party's message referred to.
    /// Seeing the current ID again is a no-op; seeing the next ID triggers the rotation; any
    /// other ID breaks the protocol. Returns true iff the keys rotated.
    fn acknowledge(&mut self, key_id: KeyID) -> Result<bool, OTRError> {
        if key_id == self.acknowledged {
            Ok(false)
        } else if key_id == self.acknowledged + 1 {
            self.acknowledged = key_id;
            self.keys[(self.acknowledged as usize + 1) % NUM_KEYS] = dh::Keypair::generate();
            Ok(true)
        } else {
            Err(OTRError::ProtocolViolation("Unexpected keyID to confirm."))
        }
    }
}

/// `PublicKeyRotation` manages the rotation of the other party's public keys.
struct PublicKeyRotation {
    keys: [BigUint; NUM_KEYS],
    id: KeyID,
}

impl PublicKeyRotation {
    fn new(key_id: KeyID, public_key: BigUint) -> Self {
        assert!(key_id > 0);
        assert_ne!(public_key, BigUint::default());
        let mut keys: [BigUint; NUM_KEYS] = [BigUint::default(), BigUint::default()];
        keys[key_id as usize % NUM_KEYS] = public_key;
        Self { keys, id: key_id }
    }

    fn current(&self) -> (KeyID, &BigUint) {
        (self.id, &self.keys[self.id as usize % NUM_KEYS])
    }

    fn select(&self, key_id: KeyID) -> Result<&BigUint, OTRError> {
        if key_id == self.id || (self.id > 1 && key_id == self.id - 1) {
            let key = &self.keys[key_id as usize % NUM_KEYS];
            utils::bytes::verify_nonzero(
                &key.to_bytes_be(),
                OTRError::ProtocolViolation("Unknown key ID for remote public key."),
            )?;
            Ok(key)
        } else {
            Err(OTRError::ProtocolViolation(
                "Unknown key ID for remote public key.",
            ))
        }
    }

    /// `register` stores the next public key, rotating when `sender_keyid` shows the other party
    /// has moved on to the key following our registered latest. Returns true iff rotated.
    fn register(&mut self, sender_keyid: KeyID, next_key: &BigUint) -> Result<bool, OTRError> {
        if sender_keyid == self.id {
            assert_ne!(*next_key, BigUint::default());
            let idx = (self.id as usize + 1) % NUM_KEYS;
            self.keys[idx] = next_key.clone();
            self.id += 1;
            Ok(true)
        } else if self.id > 1 && sender_keyid == self.id - 1 {
            // Another message under the pre-rotation key: the advertised next key is the one we
            // already registered; it must not change.
            if &self.keys[self.id as usize % NUM_KEYS] == next_key {
                Ok(false)
            } else {
                Err(OTRError::ProtocolViolation(
                    "Next public key differs from previously advertised key for same key ID.",
                ))
            }
        } else {
            Err(OTRError::ProtocolViolation("Unexpected sender key ID."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KeyManager;
    use crate::crypto::dh;

    fn manager_pair() -> (KeyManager, KeyManager) {
        let alice = dh::Keypair::generate();
        let bob = dh::Keypair::generate();
        let m_alice = KeyManager::new((1, alice.clone()), (1, bob.public.clone()));
        let m_bob = KeyManager::new((1, bob), (1, alice.public.clone()));
        (m_alice, m_bob)
    }

    #[test]
    fn test_counters_start_at_one_and_increase() {
        let (mut alice, _) = manager_pair();
        assert_eq!([0, 0, 0, 0, 0, 0, 0, 1], alice.next_counter());
        assert_eq!([0, 0, 0, 0, 0, 0, 0, 2], alice.next_counter());
    }

    #[test]
    fn test_session_secrets_agree() {
        let (alice, bob) = manager_pair();
        let ours = alice.session_secrets(1, 1).unwrap();
        let theirs = bob.session_secrets(1, 1).unwrap();
        assert_eq!(ours.sender_mac_key(), theirs.receiver_mac_key());
        assert_eq!(ours.receiver_mac_key(), theirs.sender_mac_key());
    }

    #[test]
    fn test_extra_symmetric_keys_agree() {
        let (alice, bob) = manager_pair();
        assert_eq!(alice.extra_symmetric_key(), bob.extra_symmetric_key());
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, _) = manager_pair();
        let ctr = [0u8, 0, 0, 0, 0, 0, 0, 5];
        assert!(alice.verify_receive_counter(1, 1, &ctr).is_ok());
        alice.register_used_mac_key(1, 1, &ctr, [1u8; 20]);
        // same and lower counters are rejected afterwards
        assert!(alice.verify_receive_counter(1, 1, &ctr).is_err());
        let lower = [0u8, 0, 0, 0, 0, 0, 0, 4];
        assert!(alice.verify_receive_counter(1, 1, &lower).is_err());
        let higher = [0u8, 0, 0, 0, 0, 0, 0, 6];
        assert!(alice.verify_receive_counter(1, 1, &higher).is_ok());
    }

    #[test]
    fn test_zero_counter_rejected() {
        let (alice, _) = manager_pair();
        assert!(alice.verify_receive_counter(1, 1, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_rotation_ours() {
        let (mut alice, _) = manager_pair();
        let (next_id, next) = alice.our_next();
        assert_eq!(2, next_id);
        let next_public = next.public.clone();
        // acknowledging the current key changes nothing
        alice.acknowledge_ours(1).unwrap();
        assert_eq!(1, alice.our_current().0);
        // acknowledging the next key rotates
        alice.acknowledge_ours(2).unwrap();
        assert_eq!(2, alice.our_current().0);
        assert_eq!(next_public, alice.our_current().1.public);
        assert_eq!(3, alice.our_next().0);
        // skipping ahead is a protocol violation
        assert!(alice.acknowledge_ours(4).is_err());
    }

    #[test]
    fn test_rotation_theirs_and_mac_reveal() {
        let (mut alice, _) = manager_pair();
        let ctr = [0u8, 0, 0, 0, 0, 0, 0, 1];
        let mac_key = [7u8; 20];
        alice.register_used_mac_key(1, 1, &ctr, mac_key);
        assert!(alice.take_reveal_queue().is_empty());
        let next_theirs = dh::Keypair::generate().public.clone();
        alice.register_their_next(1, &next_theirs).unwrap();
        assert_eq!(2, alice.their_current().0);
        // registering under the now-old key ID with the same advertised key changes nothing
        alice.register_their_next(1, &next_theirs).unwrap();
        assert_eq!(2, alice.their_current().0);
        // their key 1 is still within the two-key window; nothing to reveal yet
        assert!(alice.take_reveal_queue().is_empty());
        // the second rotation pushes their key 1 out: its used MAC key becomes public
        let next_theirs2 = dh::Keypair::generate().public.clone();
        alice.register_their_next(2, &next_theirs2).unwrap();
        assert_eq!(3, alice.their_current().0);
        let revealed = alice.take_reveal_queue();
        assert_eq!(mac_key.to_vec(), revealed);
        assert!(alice.take_reveal_queue().is_empty());
    }

    #[test]
    fn test_register_inconsistent_next_key() {
        let (mut alice, _) = manager_pair();
        let next = dh::Keypair::generate().public.clone();
        alice.register_their_next(1, &next).unwrap();
        let different = dh::Keypair::generate().public.clone();
        assert!(alice.register_their_next(1, &different).is_err());
    }

    #[test]
    fn test_select_unknown_keyids() {
        let (alice, _) = manager_pair();
        assert!(alice.session_secrets(1, 1).is_ok());
        assert!(alice.session_secrets(2, 1).is_ok());
        assert!(alice.session_secrets(3, 1).is_err());
        assert!(alice.session_secrets(1, 2).is_err());
        assert!(alice.session_secrets(1, 0).is_err());
    }

    #[test]
    fn test_shared_secret_after_rotation() {
        let (mut alice, mut bob) = manager_pair();
        // Bob rotates to Alice's next key; Alice acknowledges after Bob acknowledges hers.
        let alice_next = alice.our_next().1.public.clone();
        bob.register_their_next(1, &alice_next).unwrap();
        alice.acknowledge_ours(2).unwrap();
        let ours = alice.session_secrets(2, 1).unwrap();
        let theirs = bob.session_secrets(1, 2).unwrap();
        assert_eq!(ours.sender_mac_key(), theirs.receiver_mac_key());
    }
}
