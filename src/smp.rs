// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::{BigInt, BigUint};
use num_integer::Integer;

use crate::{
    crypto::{dh, sha256},
    encoding::{Fingerprint, OTRDecoder, OTREncoder, SSID},
    OTRError, TLVType, TLV,
};

pub const TLV_TYPE_SMP_MESSAGE_1: TLVType = 2;
pub const TLV_TYPE_SMP_MESSAGE_2: TLVType = 3;
pub const TLV_TYPE_SMP_MESSAGE_3: TLVType = 4;
pub const TLV_TYPE_SMP_MESSAGE_4: TLVType = 5;
pub const TLV_TYPE_SMP_ABORT: TLVType = 6;
/// TLV similar to message 1, but with a user-specified question (null-terminated) prefixed to
/// the payload.
pub const TLV_TYPE_SMP_MESSAGE_1Q: TLVType = 7;

/// `is_smp_tlv` tests whether the TLV is part of the Socialist Millionaires Protocol.
#[must_use]
pub fn is_smp_tlv(tlv: &TLV) -> bool {
    (tlv.0 >= TLV_TYPE_SMP_MESSAGE_1 && tlv.0 <= TLV_TYPE_SMP_ABORT)
        || tlv.0 == TLV_TYPE_SMP_MESSAGE_1Q
}

/// `SMPStatus` is the currently known outcome of the (last) SMP execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SMPStatus {
    /// No SMP exchange has been concluded (includes: exchange in progress).
    Initial,
    /// Exchange completed; the secrets are equal.
    Success,
    /// Exchange completed; the secrets differ.
    Failure,
    /// Exchange was aborted by either party.
    Aborted,
    /// Exchange was interrupted because the other party violated the protocol.
    Cheated,
}

/// `SMPContext` executes the Socialist Millionaires Protocol over the 1536-bit prime-order
/// subgroup: a zero-knowledge comparison of two secrets that reveals only whether they are
/// equal.
pub struct SMPContext {
    state: SMPState,
    status: SMPStatus,
    our_fingerprint: Fingerprint,
    their_fingerprint: Fingerprint,
    ssid: SSID,
}

#[allow(non_snake_case)]
impl SMPContext {
    pub fn new(our_fingerprint: Fingerprint, their_fingerprint: Fingerprint, ssid: SSID) -> Self {
        Self {
            state: SMPState::Expect1,
            status: SMPStatus::Initial,
            our_fingerprint,
            their_fingerprint,
            ssid,
        }
    }

    #[must_use]
    pub fn status(&self) -> SMPStatus {
        self.status
    }

    /// `pending_question` is the question posed by the other party, once SMP message 1 has been
    /// received and the local user's secret is awaited.
    #[must_use]
    pub fn pending_question(&self) -> Option<Vec<u8>> {
        if let SMPState::AwaitingUserSecret { question, .. } = &self.state {
            Some(question.clone())
        } else {
            None
        }
    }

    /// `initiate` starts SMP with the local user's secret and an optional question. Fails if an
    /// exchange is already in progress; directly after an abort is fine.
    pub fn initiate(&mut self, secret: &[u8], question: &[u8]) -> Result<TLV, OTRError> {
        if !matches!(self.state, SMPState::Expect1) {
            return Err(OTRError::SMPInProgress);
        }
        let g1: &BigUint = &dh::GENERATOR;
        let x = self.compute_secret(&self.our_fingerprint, &self.their_fingerprint, secret);
        let (a2, a3) = (dh::random(), dh::random());
        let g2a = g1.modpow(&a2, &dh::MODULUS);
        let g3a = g1.modpow(&a3, &dh::MODULUS);
        let (c2, d2) = proof_know_log(&a2, 1);
        let (c3, d3) = proof_know_log(&a3, 2);
        let mut encoder = OTREncoder::new();
        let typ = if question.is_empty() {
            TLV_TYPE_SMP_MESSAGE_1
        } else {
            encoder.write_bytes_null_terminated(question);
            TLV_TYPE_SMP_MESSAGE_1Q
        };
        let payload = encoder
            .write_mpi_sequence(&[&g2a, &c2, &d2, &g3a, &c3, &d3])
            .to_vec();
        self.status = SMPStatus::Initial;
        self.state = SMPState::Expect2 { x, a2, a3 };
        Ok(TLV(typ, payload))
    }

    /// `handle` processes an incoming SMP TLV. `Ok(Some(tlv))` is the response to send back;
    /// `Ok(None)` means no response is due yet (or the exchange concluded). On a protocol
    /// violation the state resets and an abort TLV must be sent (`Err` + `abort`).
    pub fn handle(&mut self, tlv: &TLV) -> Result<Option<TLV>, OTRError> {
        assert!(is_smp_tlv(tlv));
        if tlv.0 == TLV_TYPE_SMP_ABORT {
            self.state = SMPState::Expect1;
            self.status = SMPStatus::Aborted;
            return Ok(None);
        }
        let result = self.dispatch(tlv);
        if result.is_err() {
            self.state = SMPState::Expect1;
        }
        result
    }

    fn dispatch(&mut self, tlv: &TLV) -> Result<Option<TLV>, OTRError> {
        match tlv.0 {
            TLV_TYPE_SMP_MESSAGE_1 | TLV_TYPE_SMP_MESSAGE_1Q
                if matches!(self.state, SMPState::Expect1) =>
            {
                self.handle_message_1(tlv).map(|()| None)
            }
            TLV_TYPE_SMP_MESSAGE_2 if matches!(self.state, SMPState::Expect2 { .. }) => {
                self.handle_message_2(tlv).map(Some)
            }
            TLV_TYPE_SMP_MESSAGE_3 if matches!(self.state, SMPState::Expect3 { .. }) => {
                self.handle_message_3(tlv).map(Some)
            }
            TLV_TYPE_SMP_MESSAGE_4 if matches!(self.state, SMPState::Expect4 { .. }) => {
                self.handle_message_4(tlv).map(|()| None)
            }
            _ => {
                self.status = SMPStatus::Aborted;
                Err(OTRError::ProtocolViolation(
                    "SMP message arrived out of order.",
                ))
            }
        }
    }

    /// `handle_message_1` processes the initiation message. The exchange pauses until the local
    /// user provides their secret through `respond`.
    fn handle_message_1(&mut self, tlv: &TLV) -> Result<(), OTRError> {
        let mut decoder = OTRDecoder::new(&tlv.1);
        let question = if tlv.0 == TLV_TYPE_SMP_MESSAGE_1Q {
            decoder.read_bytes_null_terminated()
        } else {
            Vec::new()
        };
        let mut mpis = decoder.read_mpi_sequence()?;
        decoder.done()?;
        if mpis.len() != 6 {
            self.status = SMPStatus::Cheated;
            return Err(OTRError::ProtocolViolation(
                "Unexpected number of MPI values in SMP message 1.",
            ));
        }
        let d3 = mpis.pop().expect("BUG: length just checked");
        let c3 = mpis.pop().expect("BUG: length just checked");
        let g3a = mpis.pop().expect("BUG: length just checked");
        let d2 = mpis.pop().expect("BUG: length just checked");
        let c2 = mpis.pop().expect("BUG: length just checked");
        let g2a = mpis.pop().expect("BUG: length just checked");
        self.cheated(verify_group_element(&g2a))?;
        self.cheated(verify_exponent(&d2))?;
        self.cheated(verify_group_element(&g3a))?;
        self.cheated(verify_exponent(&d3))?;
        self.cheated(check_know_log(&c2, &d2, &g2a, 1))?;
        self.cheated(check_know_log(&c3, &d3, &g3a, 2))?;
        self.status = SMPStatus::Initial;
        self.state = SMPState::AwaitingUserSecret { g2a, g3a, question };
        Ok(())
    }

    /// `respond` continues the exchange with the local user's answer to the posed question,
    /// producing SMP message 2.
    pub fn respond(&mut self, secret: &[u8]) -> Result<TLV, OTRError> {
        let (g2a, g3a) = match &self.state {
            SMPState::AwaitingUserSecret { g2a, g3a, .. } => (g2a.clone(), g3a.clone()),
            _ => {
                return Err(OTRError::IncorrectState(
                    "No SMP exchange awaiting an answer.",
                ))
            }
        };
        let g1: &BigUint = &dh::GENERATOR;
        let p: &BigUint = &dh::MODULUS;
        // The other party initiated, so their fingerprint comes first.
        let y = self.compute_secret(&self.their_fingerprint, &self.our_fingerprint, secret);
        let (b2, b3) = (dh::random(), dh::random());
        let g2b = g1.modpow(&b2, p);
        let g3b = g1.modpow(&b3, p);
        let (c2, d2) = proof_know_log(&b2, 3);
        let (c3, d3) = proof_know_log(&b3, 4);
        let g2 = g2a.modpow(&b2, p);
        let g3 = g3a.modpow(&b3, p);
        let r = dh::random();
        let pb = g3.modpow(&r, p);
        let qb = g1.modpow(&r, p) * g2.modpow(&y, p) % p;
        let (cp, d5, d6) = proof_equal_coords(&g2, &g3, &r, &y, 5);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&g2b, &c2, &d2, &g3b, &c3, &d3, &pb, &qb, &cp, &d5, &d6])
            .to_vec();
        self.state = SMPState::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        };
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_2, payload))
    }

    fn handle_message_2(&mut self, tlv: &TLV) -> Result<TLV, OTRError> {
        let (x, a2, a3) = match &self.state {
            SMPState::Expect2 { x, a2, a3 } => (x.clone(), a2.clone(), a3.clone()),
            _ => panic!("BUG: dispatch guarantees state Expect2"),
        };
        let g1: &BigUint = &dh::GENERATOR;
        let p: &BigUint = &dh::MODULUS;
        let mut decoder = OTRDecoder::new(&tlv.1);
        let mpis = decoder.read_mpi_sequence()?;
        decoder.done()?;
        let [g2b, c2, d2, g3b, c3, d3, pb, qb, cp, d5, d6]: [BigUint; 11] =
            mpis.try_into().or(Err(OTRError::ProtocolViolation(
                "Unexpected number of MPI values in SMP message 2.",
            )))?;
        self.cheated(verify_group_element(&g2b))?;
        self.cheated(verify_group_element(&g3b))?;
        self.cheated(verify_group_element(&pb))?;
        self.cheated(verify_group_element(&qb))?;
        self.cheated(verify_exponent(&d2))?;
        self.cheated(verify_exponent(&d3))?;
        self.cheated(verify_exponent(&d5))?;
        self.cheated(verify_exponent(&d6))?;
        self.cheated(check_know_log(&c2, &d2, &g2b, 3))?;
        self.cheated(check_know_log(&c3, &d3, &g3b, 4))?;
        let g2 = g2b.modpow(&a2, p);
        let g3 = g3b.modpow(&a3, p);
        self.cheated(check_equal_coords(&cp, &d5, &d6, &pb, &qb, &g2, &g3, 5))?;
        // Calculate P and Q values for Alice.
        let r = dh::random();
        let pa = g3.modpow(&r, p);
        let qa = g1.modpow(&r, p) * g2.modpow(&x, p) % p;
        let (cp, d5, d6) = proof_equal_coords(&g2, &g3, &r, &x, 6);
        let inv_pb = pb.modinv(p).ok_or(OTRError::ProtocolViolation(
            "Pb has no inverse in the group.",
        ))?;
        let pab = &pa * inv_pb % p;
        let inv_qb = qb.modinv(p).ok_or(OTRError::ProtocolViolation(
            "Qb has no inverse in the group.",
        ))?;
        let qab = &qa * inv_qb % p;
        let ra = qab.modpow(&a3, p);
        let (cr, d7) = proof_equal_logs(&qab, &a3, 7);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&pa, &qa, &cp, &d5, &d6, &ra, &cr, &d7])
            .to_vec();
        self.state = SMPState::Expect4 { g3b, a3, pab, qab };
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_3, payload))
    }

    fn handle_message_3(&mut self, tlv: &TLV) -> Result<TLV, OTRError> {
        let (g3a, g2, g3, b3, pb, qb) = match &self.state {
            SMPState::Expect3 {
                g3a,
                g2,
                g3,
                b3,
                pb,
                qb,
            } => (
                g3a.clone(),
                g2.clone(),
                g3.clone(),
                b3.clone(),
                pb.clone(),
                qb.clone(),
            ),
            _ => panic!("BUG: dispatch guarantees state Expect3"),
        };
        let p: &BigUint = &dh::MODULUS;
        let mut decoder = OTRDecoder::new(&tlv.1);
        let mpis = decoder.read_mpi_sequence()?;
        decoder.done()?;
        let [pa, qa, cp, d5, d6, ra, cr, d7]: [BigUint; 8] =
            mpis.try_into().or(Err(OTRError::ProtocolViolation(
                "Unexpected number of MPI values in SMP message 3.",
            )))?;
        self.cheated(verify_group_element(&pa))?;
        self.cheated(verify_group_element(&qa))?;
        self.cheated(verify_group_element(&ra))?;
        self.cheated(verify_exponent(&d5))?;
        self.cheated(verify_exponent(&d6))?;
        self.cheated(verify_exponent(&d7))?;
        self.cheated(check_equal_coords(&cp, &d5, &d6, &pa, &qa, &g2, &g3, 6))?;
        let inv_pb = pb.modinv(p).ok_or(OTRError::ProtocolViolation(
            "Pb has no inverse in the group.",
        ))?;
        let pab = &pa * inv_pb % p;
        let inv_qb = qb.modinv(p).ok_or(OTRError::ProtocolViolation(
            "Qb has no inverse in the group.",
        ))?;
        let qab = &qa * inv_qb % p;
        self.cheated(check_equal_logs(&cr, &d7, &ra, &g3a, &qab, 7))?;
        // Produce the final message and conclude our side of the comparison.
        let rb = qab.modpow(&b3, p);
        let (cr_b, d7_b) = proof_equal_logs(&qab, &b3, 8);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&rb, &cr_b, &d7_b])
            .to_vec();
        let rab = ra.modpow(&b3, p);
        self.status = if rab == pab {
            SMPStatus::Success
        } else {
            SMPStatus::Failure
        };
        self.state = SMPState::Expect1;
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_4, payload))
    }

    fn handle_message_4(&mut self, tlv: &TLV) -> Result<(), OTRError> {
        let (g3b, a3, pab, qab) = match &self.state {
            SMPState::Expect4 { g3b, a3, pab, qab } => {
                (g3b.clone(), a3.clone(), pab.clone(), qab.clone())
            }
            _ => panic!("BUG: dispatch guarantees state Expect4"),
        };
        let p: &BigUint = &dh::MODULUS;
        let mut decoder = OTRDecoder::new(&tlv.1);
        let mpis = decoder.read_mpi_sequence()?;
        decoder.done()?;
        let [rb, cr, d7]: [BigUint; 3] = mpis.try_into().or(Err(OTRError::ProtocolViolation(
            "Unexpected number of MPI values in SMP message 4.",
        )))?;
        self.cheated(verify_group_element(&rb))?;
        self.cheated(verify_exponent(&d7))?;
        self.cheated(check_equal_logs(&cr, &d7, &rb, &g3b, &qab, 8))?;
        let rab = rb.modpow(&a3, p);
        self.status = if rab == pab {
            SMPStatus::Success
        } else {
            SMPStatus::Failure
        };
        self.state = SMPState::Expect1;
        Ok(())
    }

    /// `abort` throws away whatever stage the exchange had reached and produces the abort TLV
    /// to send.
    pub fn abort(&mut self) -> TLV {
        self.state = SMPState::Expect1;
        self.status = SMPStatus::Aborted;
        TLV(TLV_TYPE_SMP_ABORT, Vec::new())
    }

    /// `cheated` marks the exchange as cheated when the underlying check failed.
    fn cheated(&mut self, result: Result<(), OTRError>) -> Result<(), OTRError> {
        if result.is_err() {
            self.status = SMPStatus::Cheated;
        }
        result
    }

    /// `compute_secret` derives the actual comparison value: the user-provided secret is never
    /// used raw, but always bound to both fingerprints and the session's SSID.
    fn compute_secret(
        &self,
        initiator: &Fingerprint,
        responder: &Fingerprint,
        secret: &[u8],
    ) -> BigUint {
        let digest = sha256::digest(
            &OTREncoder::new()
                .write_u8(1)
                .write_fingerprint(initiator)
                .write_fingerprint(responder)
                .write_ssid(&self.ssid)
                .write_data(secret)
                .to_vec(),
        );
        BigUint::from_bytes_be(&digest)
    }
}

enum SMPState {
    Expect1,
    /// SMP message 1 has arrived; the local user's secret is required to continue.
    AwaitingUserSecret {
        g2a: BigUint,
        g3a: BigUint,
        question: Vec<u8>,
    },
    Expect2 {
        x: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: BigUint,
        pb: BigUint,
        qb: BigUint,
    },
    Expect4 {
        g3b: BigUint,
        a3: BigUint,
        pab: BigUint,
        qab: BigUint,
    },
}

impl Drop for SMPState {
    fn drop(&mut self) {
        // Clear the working exponents; the other values are public group elements.
        match self {
            Self::Expect1 | Self::AwaitingUserSecret { .. } => {}
            Self::Expect2 { x, a2, a3 } => {
                *x = BigUint::default();
                *a2 = BigUint::default();
                *a3 = BigUint::default();
            }
            Self::Expect3 { b3, .. } => {
                *b3 = BigUint::default();
            }
            Self::Expect4 { a3, .. } => {
                *a3 = BigUint::default();
            }
        }
    }
}

/// `verify_group_element` checks that the value is in range to be a (non-unit) group element.
fn verify_group_element(g: &BigUint) -> Result<(), OTRError> {
    dh::verify_public_key(g).or(Err(OTRError::ProtocolViolation(
        "SMP: illegal group element.",
    )))
}

/// `verify_exponent` checks that the value is in range to be an exponent modulo the group order.
fn verify_exponent(x: &BigUint) -> Result<(), OTRError> {
    dh::verify_exponent(x).or(Err(OTRError::ProtocolViolation("SMP: illegal exponent.")))
}

/// `proof_know_log` shows, without revealing `x`, that we know the exponent behind `g1^x`:
/// the Schnorr pair `c = H(g1^r)`, `d = r - x*c (mod q)` for a fresh random `r`.
fn proof_know_log(x: &BigUint, version: u8) -> (BigUint, BigUint) {
    let p: &BigUint = &dh::MODULUS;
    let r = dh::random();
    let c = hash(version, &dh::GENERATOR.modpow(&r, p), None);
    let d = subtract_mod_order(&r, &(x * &c));
    (c, d)
}

/// `check_know_log` is the verifier side of `proof_know_log`: recompute `H(g1^d * gx^c)` and
/// require it to match the received `c`.
fn check_know_log(c: &BigUint, d: &BigUint, gx: &BigUint, version: u8) -> Result<(), OTRError> {
    let p: &BigUint = &dh::MODULUS;
    let gd = dh::GENERATOR.modpow(d, p);
    let xc = gx.modpow(c, p);
    let expected = hash(version, &(gd * xc % p), None);
    if *c == expected {
        Ok(())
    } else {
        Err(OTRError::ProtocolViolation("SMP: proof checking failed."))
    }
}

/// `proof_equal_coords` shows that `P` and `Q` share the same hidden exponent `r`, with the
/// secret in `Q`'s second factor: `P = g3^r` and `Q = g1^r * g2^secret`.
fn proof_equal_coords(
    g2: &BigUint,
    g3: &BigUint,
    r: &BigUint,
    secret: &BigUint,
    version: u8,
) -> (BigUint, BigUint, BigUint) {
    let p: &BigUint = &dh::MODULUS;
    let r1 = dh::random();
    let r2 = dh::random();
    let temp = dh::GENERATOR.modpow(&r1, p) * g2.modpow(&r2, p) % p;
    let c = hash(version, &g3.modpow(&r1, p), Some(&temp));
    let d1 = subtract_mod_order(&r1, &(r * &c));
    let d2 = subtract_mod_order(&r2, &(secret * &c));
    (c, d1, d2)
}

/// `check_equal_coords` is the verifier side of `proof_equal_coords`: recompute
/// `H(g3^d1 * P^c, g1^d1 * g2^d2 * Q^c)` and require it to match the received `c`.
#[allow(clippy::too_many_arguments)]
fn check_equal_coords(
    c: &BigUint,
    d1: &BigUint,
    d2: &BigUint,
    big_p: &BigUint,
    big_q: &BigUint,
    g2: &BigUint,
    g3: &BigUint,
    version: u8,
) -> Result<(), OTRError> {
    let p: &BigUint = &dh::MODULUS;
    let temp1 = g3.modpow(d1, p) * big_p.modpow(c, p) % p;
    let temp2 =
        dh::GENERATOR.modpow(d1, p) * g2.modpow(d2, p) % p * big_q.modpow(c, p) % p;
    let expected = hash(version, &temp1, Some(&temp2));
    if *c == expected {
        Ok(())
    } else {
        Err(OTRError::ProtocolViolation("SMP: proof checking failed."))
    }
}

/// `proof_equal_logs` shows that `R = (Qa/Qb)^x3` reuses exactly the exponent `x3` that
/// already went into our half of `g3`.
fn proof_equal_logs(qab: &BigUint, x3: &BigUint, version: u8) -> (BigUint, BigUint) {
    let p: &BigUint = &dh::MODULUS;
    let r = dh::random();
    let c = hash(version, &dh::GENERATOR.modpow(&r, p), Some(&qab.modpow(&r, p)));
    let d = subtract_mod_order(&r, &(x3 * &c));
    (c, d)
}

/// `check_equal_logs` is the verifier side of `proof_equal_logs`: recompute
/// `H(g1^d * g3o^c, qab^d * R^c)` and require it to match the received `c`.
fn check_equal_logs(
    c: &BigUint,
    d: &BigUint,
    big_r: &BigUint,
    g3o: &BigUint,
    qab: &BigUint,
    version: u8,
) -> Result<(), OTRError> {
    let p: &BigUint = &dh::MODULUS;
    let temp1 = dh::GENERATOR.modpow(d, p) * g3o.modpow(c, p) % p;
    let temp2 = qab.modpow(d, p) * big_r.modpow(c, p) % p;
    let expected = hash(version, &temp1, Some(&temp2));
    if *c == expected {
        Ok(())
    } else {
        Err(OTRError::ProtocolViolation("SMP: proof checking failed."))
    }
}

/// `hash` produces the SMP challenge value: SHA-256 over the step-specific version byte and the
/// MPI-encodings of one or two group elements.
fn hash(version: u8, mpi1: &BigUint, mpi2: Option<&BigUint>) -> BigUint {
    let mut encoder = OTREncoder::new();
    encoder.write_mpi(mpi1);
    if let Some(mpi2) = mpi2 {
        encoder.write_mpi(mpi2);
    }
    BigUint::from_bytes_be(&sha256::digest_with_prefix(version, &encoder.to_vec()))
}

/// `subtract_mod_order` computes `(a - b) mod q` with q the order of the subgroup.
fn subtract_mod_order(a: &BigUint, b: &BigUint) -> BigUint {
    let q = BigInt::from(dh::Q.clone());
    (BigInt::from(a.clone()) - BigInt::from(b.clone()))
        .mod_floor(&q)
        .to_biguint()
        .expect("BUG: mod_floor with positive modulus is non-negative")
}

#[cfg(test)]
mod tests {
    use super::{SMPContext, SMPStatus, TLV_TYPE_SMP_ABORT, TLV_TYPE_SMP_MESSAGE_1Q};
    use crate::TLV;

    fn contexts() -> (SMPContext, SMPContext) {
        let fpr_alice = [0xaa_u8; 20];
        let fpr_bob = [0xbb_u8; 20];
        let ssid = [1u8, 2, 3, 4, 5, 6, 7, 8];
        (
            SMPContext::new(fpr_alice, fpr_bob, ssid),
            SMPContext::new(fpr_bob, fpr_alice, ssid),
        )
    }

    fn run(alice: &mut SMPContext, bob: &mut SMPContext, secret_a: &[u8], secret_b: &[u8]) {
        let smp1 = alice.initiate(secret_a, b"what is the password?").unwrap();
        assert_eq!(TLV_TYPE_SMP_MESSAGE_1Q, smp1.0);
        assert!(bob.handle(&smp1).unwrap().is_none());
        assert_eq!(
            b"what is the password?".to_vec(),
            bob.pending_question().unwrap()
        );
        let smp2 = bob.respond(secret_b).unwrap();
        let smp3 = alice.handle(&smp2).unwrap().unwrap();
        let smp4 = bob.handle(&smp3).unwrap().unwrap();
        assert!(alice.handle(&smp4).unwrap().is_none());
    }

    #[test]
    fn test_smp_success() {
        let (mut alice, mut bob) = contexts();
        run(&mut alice, &mut bob, b"swordfish", b"swordfish");
        assert_eq!(SMPStatus::Success, alice.status());
        assert_eq!(SMPStatus::Success, bob.status());
    }

    #[test]
    fn test_smp_failure_on_different_secrets() {
        let (mut alice, mut bob) = contexts();
        run(&mut alice, &mut bob, b"swordfish", b"password");
        assert_eq!(SMPStatus::Failure, alice.status());
        assert_eq!(SMPStatus::Failure, bob.status());
    }

    #[test]
    fn test_smp_failure_on_single_bit_difference() {
        let (mut alice, mut bob) = contexts();
        run(&mut alice, &mut bob, &[0b0101_0101], &[0b0101_0100]);
        assert_eq!(SMPStatus::Failure, alice.status());
        assert_eq!(SMPStatus::Failure, bob.status());
    }

    #[test]
    fn test_smp_tampered_payload_is_cheating() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"swordfish", b"").unwrap();
        assert!(bob.handle(&smp1).unwrap().is_none());
        let mut smp2 = bob.respond(b"swordfish").unwrap();
        let len = smp2.1.len();
        smp2.1[len - 1] ^= 0x01;
        assert!(alice.handle(&smp2).is_err());
        assert_eq!(SMPStatus::Cheated, alice.status());
        // A fresh pair of contexts runs to completion, unaffected.
        let (mut alice2, mut bob2) = contexts();
        run(&mut alice2, &mut bob2, b"x", b"x");
    }

    #[test]
    fn test_smp_abort_resets() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"swordfish", b"").unwrap();
        assert!(bob.handle(&smp1).unwrap().is_none());
        // initiating while in progress is refused
        assert!(alice.initiate(b"other", b"").is_err());
        let abort = alice.abort();
        assert_eq!(TLV_TYPE_SMP_ABORT, abort.0);
        assert!(bob.handle(&abort).unwrap().is_none());
        assert_eq!(SMPStatus::Aborted, bob.status());
        // a fresh run directly after the abort succeeds
        run(&mut alice, &mut bob, b"again", b"again");
        assert_eq!(SMPStatus::Success, alice.status());
        assert_eq!(SMPStatus::Success, bob.status());
    }

    #[test]
    fn test_smp_out_of_order_message_aborts() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"swordfish", b"").unwrap();
        assert!(bob.handle(&smp1).unwrap().is_none());
        let smp2 = bob.respond(b"swordfish").unwrap();
        let smp3 = alice.handle(&smp2).unwrap().unwrap();
        // Bob receives message 2 (reflected) instead of message 3.
        assert!(bob.handle(&TLV(super::TLV_TYPE_SMP_MESSAGE_2, smp2.1.clone())).is_err());
        assert_eq!(SMPStatus::Aborted, bob.status());
        // The partially-completed exchange cannot continue.
        assert!(bob.handle(&smp3).is_err());
    }
}
