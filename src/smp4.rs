// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::{BigInt, BigUint};
use num_integer::Integer;

use crate::{
    crypto::{
        constant,
        ed448::{self, hash_to_scalar, hash_to_scalar2, Point},
        otr4, shake256,
    },
    encoding::{OTRDecoder, OTREncoder, SSID},
    smp::{
        SMPStatus, TLV_TYPE_SMP_ABORT, TLV_TYPE_SMP_MESSAGE_1, TLV_TYPE_SMP_MESSAGE_2,
        TLV_TYPE_SMP_MESSAGE_3, TLV_TYPE_SMP_MESSAGE_4,
    },
    OTRError, TLV,
};

/// `SMP4Context` executes the Socialist Millionaires Protocol on the Ed448 group, as OTRv4
/// prescribes. The message flow is identical to the classic protocol; group elements are curve
/// points and the challenge hashes are SHAKE-256-based.
pub struct SMP4Context {
    state: State,
    status: SMPStatus,
    our_fingerprint: otr4::Fingerprint,
    their_fingerprint: otr4::Fingerprint,
    ssid: SSID,
}

#[allow(non_snake_case)]
impl SMP4Context {
    pub fn new(
        our_fingerprint: otr4::Fingerprint,
        their_fingerprint: otr4::Fingerprint,
        ssid: SSID,
    ) -> Self {
        Self {
            state: State::ExpectSMP1,
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

    /// `pending_question` is the posed question, once SMP message 1 arrived and the local user's
    /// secret is awaited.
    #[must_use]
    pub fn pending_question(&self) -> Option<Vec<u8>> {
        if let State::AwaitingUserSecret { question, .. } = &self.state {
            Some(question.clone())
        } else {
            None
        }
    }

    /// `initiate` starts the exchange with the local user's secret and an optional question.
    pub fn initiate(&mut self, secret: &[u8], question: &[u8]) -> Result<TLV, OTRError> {
        if !matches!(self.state, State::ExpectSMP1) {
            return Err(OTRError::SMPInProgress);
        }
        let G = ed448::generator();
        let x = self.generate_secret(&self.our_fingerprint, &self.their_fingerprint, secret);
        let a2 = ed448::random_in_Zq();
        let a3 = ed448::random_in_Zq();
        let r2 = ed448::random_in_Zq();
        let r3 = ed448::random_in_Zq();
        let G2a = G.mul(&a2);
        let G3a = G.mul(&a3);
        let c2 = hash_to_scalar(0x01, &G.mul(&r2));
        let d2 = subtract_mod_q(&r2, &(&a2 * &c2));
        let c3 = hash_to_scalar(0x02, &G.mul(&r3));
        let d3 = subtract_mod_q(&r3, &(&a3 * &c3));
        let payload = OTREncoder::new()
            .write_bytes_null_terminated(question)
            .write_ed448_point(&G2a)
            .write_ed448_scalar(&c2)
            .write_ed448_scalar(&d2)
            .write_ed448_point(&G3a)
            .write_ed448_scalar(&c3)
            .write_ed448_scalar(&d3)
            .to_vec();
        self.status = SMPStatus::Initial;
        self.state = State::ExpectSMP2 { x, a2, a3 };
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_1, payload))
    }

    /// `handle_message_1` processes the initiation message. The exchange pauses until the local
    /// user answers through `respond`.
    pub fn handle_message_1(&mut self, tlv: &TLV) -> Result<(), OTRError> {
        assert_eq!(tlv.0, TLV_TYPE_SMP_MESSAGE_1);
        if !matches!(self.state, State::ExpectSMP1) {
            self.status = SMPStatus::Aborted;
            return Err(OTRError::ProtocolViolation(
                "SMP message 1 arrived out of order.",
            ));
        }
        let mut decoder = OTRDecoder::new(&tlv.1);
        let question = decoder.read_bytes_null_terminated();
        let G2a = decoder.read_ed448_point()?;
        let c2 = decoder.read_ed448_scalar()?;
        let d2 = decoder.read_ed448_scalar()?;
        let G3a = decoder.read_ed448_point()?;
        let c3 = decoder.read_ed448_scalar()?;
        let d3 = decoder.read_ed448_scalar()?;
        decoder.done()?;
        let G = ed448::generator();
        self.cheated(ed448::verify(&G2a).map_err(OTRError::CryptographicViolation))?;
        self.cheated(ed448::verify(&G3a).map_err(OTRError::CryptographicViolation))?;
        let c2_expected = hash_to_scalar(0x01, &G.mul(&d2).add(&G2a.mul(&c2)));
        self.cheated(
            constant::verify_scalars(&c2_expected, &c2).map_err(OTRError::CryptographicViolation),
        )?;
        let c3_expected = hash_to_scalar(0x02, &G.mul(&d3).add(&G3a.mul(&c3)));
        self.cheated(
            constant::verify_scalars(&c3_expected, &c3).map_err(OTRError::CryptographicViolation),
        )?;
        self.status = SMPStatus::Initial;
        self.state = State::AwaitingUserSecret { G2a, G3a, question };
        Ok(())
    }

    /// `respond` continues with the local user's answer, producing SMP message 2.
    pub fn respond(&mut self, secret: &[u8]) -> Result<TLV, OTRError> {
        let (G2a, G3a) = match &self.state {
            State::AwaitingUserSecret { G2a, G3a, .. } => (G2a.clone(), G3a.clone()),
            _ => {
                return Err(OTRError::IncorrectState(
                    "No SMP exchange awaiting an answer.",
                ))
            }
        };
        let G = ed448::generator();
        // The other party initiated, so their fingerprint comes first.
        let y = self.generate_secret(&self.their_fingerprint, &self.our_fingerprint, secret);
        let b2 = ed448::random_in_Zq();
        let b3 = ed448::random_in_Zq();
        let r2 = ed448::random_in_Zq();
        let r3 = ed448::random_in_Zq();
        let r4 = ed448::random_in_Zq();
        let r5 = ed448::random_in_Zq();
        let r6 = ed448::random_in_Zq();
        let G2b = G.mul(&b2);
        let G3b = G.mul(&b3);
        let c2 = hash_to_scalar(0x03, &G.mul(&r2));
        let d2 = subtract_mod_q(&r2, &(&b2 * &c2));
        let c3 = hash_to_scalar(0x04, &G.mul(&r3));
        let d3 = subtract_mod_q(&r3, &(&b3 * &c3));
        let G2 = G2a.mul(&b2);
        let G3 = G3a.mul(&b3);
        let Pb = G3.mul(&r4);
        let Qb = G.mul(&r4).add(&G2.mul(&y));
        let cp = hash_to_scalar2(0x05, &G3.mul(&r5), &G.mul(&r5).add(&G2.mul(&r6)));
        let d5 = subtract_mod_q(&r5, &(&r4 * &cp));
        let d6 = subtract_mod_q(&r6, &(&y * &cp));
        let payload = OTREncoder::new()
            .write_ed448_point(&G2b)
            .write_ed448_scalar(&c2)
            .write_ed448_scalar(&d2)
            .write_ed448_point(&G3b)
            .write_ed448_scalar(&c3)
            .write_ed448_scalar(&d3)
            .write_ed448_point(&Pb)
            .write_ed448_point(&Qb)
            .write_ed448_scalar(&cp)
            .write_ed448_scalar(&d5)
            .write_ed448_scalar(&d6)
            .to_vec();
        self.state = State::ExpectSMP3 {
            G3a,
            G2,
            G3,
            b3,
            Pb,
            Qb,
        };
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_2, payload))
    }

    /// `handle_message_2` verifies the responder's half and produces SMP message 3.
    pub fn handle_message_2(&mut self, tlv: &TLV) -> Result<TLV, OTRError> {
        assert_eq!(tlv.0, TLV_TYPE_SMP_MESSAGE_2);
        let (x, a2, a3) = match &self.state {
            State::ExpectSMP2 { x, a2, a3 } => (x.clone(), a2.clone(), a3.clone()),
            _ => {
                self.status = SMPStatus::Aborted;
                return Err(OTRError::ProtocolViolation(
                    "SMP message 2 arrived out of order.",
                ));
            }
        };
        let mut decoder = OTRDecoder::new(&tlv.1);
        let G2b = decoder.read_ed448_point()?;
        let c2 = decoder.read_ed448_scalar()?;
        let d2 = decoder.read_ed448_scalar()?;
        let G3b = decoder.read_ed448_point()?;
        let c3 = decoder.read_ed448_scalar()?;
        let d3 = decoder.read_ed448_scalar()?;
        let Pb = decoder.read_ed448_point()?;
        let Qb = decoder.read_ed448_point()?;
        let cp = decoder.read_ed448_scalar()?;
        let d5 = decoder.read_ed448_scalar()?;
        let d6 = decoder.read_ed448_scalar()?;
        decoder.done()?;
        let G = ed448::generator();
        self.cheated(ed448::verify(&G2b).map_err(OTRError::CryptographicViolation))?;
        self.cheated(ed448::verify(&G3b).map_err(OTRError::CryptographicViolation))?;
        self.cheated(ed448::verify(&Pb).map_err(OTRError::CryptographicViolation))?;
        self.cheated(ed448::verify(&Qb).map_err(OTRError::CryptographicViolation))?;
        self.cheated(
            constant::verify_scalars(&c2, &hash_to_scalar(0x03, &G.mul(&d2).add(&G2b.mul(&c2))))
                .map_err(OTRError::CryptographicViolation),
        )?;
        self.cheated(
            constant::verify_scalars(&c3, &hash_to_scalar(0x04, &G.mul(&d3).add(&G3b.mul(&c3))))
                .map_err(OTRError::CryptographicViolation),
        )?;
        let G2 = G2b.mul(&a2);
        let G3 = G3b.mul(&a3);
        self.cheated(
            constant::verify_scalars(
                &cp,
                &hash_to_scalar2(
                    0x05,
                    &G3.mul(&d5).add(&Pb.mul(&cp)),
                    &G.mul(&d5).add(&G2.mul(&d6)).add(&Qb.mul(&cp)),
                ),
            )
            .map_err(OTRError::CryptographicViolation),
        )?;
        // Produce our halves of P and Q, and the first compound exponent R.
        let r4 = ed448::random_in_Zq();
        let r5 = ed448::random_in_Zq();
        let r6 = ed448::random_in_Zq();
        let r7 = ed448::random_in_Zq();
        let Pa = G3.mul(&r4);
        let Qa = G.mul(&r4).add(&G2.mul(&x));
        let cp_a = hash_to_scalar2(0x06, &G3.mul(&r5), &G.mul(&r5).add(&G2.mul(&r6)));
        let d5_a = subtract_mod_q(&r5, &(&r4 * &cp_a));
        let d6_a = subtract_mod_q(&r6, &(&x * &cp_a));
        let DeltaPaPb = Pa.add(&Pb.negate());
        let DeltaQaQb = Qa.add(&Qb.negate());
        let Ra = DeltaQaQb.mul(&a3);
        let cr = hash_to_scalar2(0x07, &G.mul(&r7), &DeltaQaQb.mul(&r7));
        let d7 = subtract_mod_q(&r7, &(&a3 * &cr));
        let payload = OTREncoder::new()
            .write_ed448_point(&Pa)
            .write_ed448_point(&Qa)
            .write_ed448_scalar(&cp_a)
            .write_ed448_scalar(&d5_a)
            .write_ed448_scalar(&d6_a)
            .write_ed448_point(&Ra)
            .write_ed448_scalar(&cr)
            .write_ed448_scalar(&d7)
            .to_vec();
        self.state = State::ExpectSMP4 {
            G3b,
            DeltaPaPb,
            DeltaQaQb,
            a3,
        };
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_3, payload))
    }

    /// `handle_message_3` verifies the initiator's halves, concludes the comparison on the
    /// responder's side and produces the final SMP message 4.
    pub fn handle_message_3(&mut self, tlv: &TLV) -> Result<TLV, OTRError> {
        assert_eq!(tlv.0, TLV_TYPE_SMP_MESSAGE_3);
        let (G3a, G2, G3, b3, Pb, Qb) = match &self.state {
            State::ExpectSMP3 {
                G3a,
                G2,
                G3,
                b3,
                Pb,
                Qb,
            } => (
                G3a.clone(),
                G2.clone(),
                G3.clone(),
                b3.clone(),
                Pb.clone(),
                Qb.clone(),
            ),
            _ => {
                self.status = SMPStatus::Aborted;
                return Err(OTRError::ProtocolViolation(
                    "SMP message 3 arrived out of order.",
                ));
            }
        };
        let mut decoder = OTRDecoder::new(&tlv.1);
        let Pa = decoder.read_ed448_point()?;
        let Qa = decoder.read_ed448_point()?;
        let cp = decoder.read_ed448_scalar()?;
        let d5 = decoder.read_ed448_scalar()?;
        let d6 = decoder.read_ed448_scalar()?;
        let Ra = decoder.read_ed448_point()?;
        let cr = decoder.read_ed448_scalar()?;
        let d7 = decoder.read_ed448_scalar()?;
        decoder.done()?;
        let G = ed448::generator();
        self.cheated(ed448::verify(&Pa).map_err(OTRError::CryptographicViolation))?;
        self.cheated(ed448::verify(&Qa).map_err(OTRError::CryptographicViolation))?;
        self.cheated(ed448::verify(&Ra).map_err(OTRError::CryptographicViolation))?;
        self.cheated(
            constant::verify_scalars(
                &cp,
                &hash_to_scalar2(
                    0x06,
                    &G3.mul(&d5).add(&Pa.mul(&cp)),
                    &G.mul(&d5).add(&G2.mul(&d6)).add(&Qa.mul(&cp)),
                ),
            )
            .map_err(OTRError::CryptographicViolation),
        )?;
        let DeltaQaQb = Qa.add(&Qb.negate());
        self.cheated(
            constant::verify_scalars(
                &cr,
                &hash_to_scalar2(
                    0x07,
                    &G.mul(&d7).add(&G3a.mul(&cr)),
                    &DeltaQaQb.mul(&d7).add(&Ra.mul(&cr)),
                ),
            )
            .map_err(OTRError::CryptographicViolation),
        )?;
        // Produce the final message and conclude our side of the comparison.
        let r7 = ed448::random_in_Zq();
        let Rb = DeltaQaQb.mul(&b3);
        let cr_b = hash_to_scalar2(0x08, &G.mul(&r7), &DeltaQaQb.mul(&r7));
        let d7_b = subtract_mod_q(&r7, &(&b3 * &cr_b));
        let payload = OTREncoder::new()
            .write_ed448_point(&Rb)
            .write_ed448_scalar(&cr_b)
            .write_ed448_scalar(&d7_b)
            .to_vec();
        let DeltaPaPb = Pa.add(&Pb.negate());
        self.status = if constant::verify_points(&Ra.mul(&b3), &DeltaPaPb).is_ok() {
            SMPStatus::Success
        } else {
            SMPStatus::Failure
        };
        self.state = State::ExpectSMP1;
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_4, payload))
    }

    /// `handle_message_4` concludes the comparison on the initiator's side.
    pub fn handle_message_4(&mut self, tlv: &TLV) -> Result<(), OTRError> {
        assert_eq!(tlv.0, TLV_TYPE_SMP_MESSAGE_4);
        let (G3b, DeltaPaPb, DeltaQaQb, a3) = match &self.state {
            State::ExpectSMP4 {
                G3b,
                DeltaPaPb,
                DeltaQaQb,
                a3,
            } => (
                G3b.clone(),
                DeltaPaPb.clone(),
                DeltaQaQb.clone(),
                a3.clone(),
            ),
            _ => {
                self.status = SMPStatus::Aborted;
                return Err(OTRError::ProtocolViolation(
                    "SMP message 4 arrived out of order.",
                ));
            }
        };
        let mut decoder = OTRDecoder::new(&tlv.1);
        let Rb = decoder.read_ed448_point()?;
        let cr = decoder.read_ed448_scalar()?;
        let d7 = decoder.read_ed448_scalar()?;
        decoder.done()?;
        let G = ed448::generator();
        self.cheated(ed448::verify(&Rb).map_err(OTRError::CryptographicViolation))?;
        self.cheated(
            constant::verify_scalars(
                &cr,
                &hash_to_scalar2(
                    0x08,
                    &G.mul(&d7).add(&G3b.mul(&cr)),
                    &DeltaQaQb.mul(&d7).add(&Rb.mul(&cr)),
                ),
            )
            .map_err(OTRError::CryptographicViolation),
        )?;
        self.status = if constant::verify_points(&Rb.mul(&a3), &DeltaPaPb).is_ok() {
            SMPStatus::Success
        } else {
            SMPStatus::Failure
        };
        self.state = State::ExpectSMP1;
        Ok(())
    }

    /// `abort` throws away whatever stage the exchange had reached and produces the abort TLV.
    pub fn abort(&mut self) -> TLV {
        self.state = State::ExpectSMP1;
        self.status = SMPStatus::Aborted;
        TLV(TLV_TYPE_SMP_ABORT, Vec::new())
    }

    fn cheated(&mut self, result: Result<(), OTRError>) -> Result<(), OTRError> {
        if result.is_err() {
            self.status = SMPStatus::Cheated;
            self.state = State::ExpectSMP1;
        }
        result
    }

    /// `generate_secret` derives the comparison scalar from the user secret, both fingerprints
    /// and the session's SSID.
    fn generate_secret(
        &self,
        first: &otr4::Fingerprint,
        second: &otr4::Fingerprint,
        secret: &[u8],
    ) -> BigUint {
        let secretbytes = shake256::digest::<57>(
            &OTREncoder::new()
                .write_u8(1)
                .write(first)
                .write(second)
                .write_ssid(&self.ssid)
                .write_data(secret)
                .to_vec(),
        );
        let x_bytes = otr4::hwc::<57>(otr4::USAGE_SMP_SECRET, &secretbytes);
        BigUint::from_bytes_le(&x_bytes) % &*ed448::ORDER
    }
}

#[allow(non_snake_case)]
enum State {
    ExpectSMP1,
    AwaitingUserSecret {
        G2a: Point,
        G3a: Point,
        question: Vec<u8>,
    },
    ExpectSMP2 {
        x: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    ExpectSMP3 {
        G3a: Point,
        G2: Point,
        G3: Point,
        b3: BigUint,
        Pb: Point,
        Qb: Point,
    },
    ExpectSMP4 {
        G3b: Point,
        DeltaPaPb: Point,
        DeltaQaQb: Point,
        a3: BigUint,
    },
}

impl Drop for State {
    fn drop(&mut self) {
        // Clear the working exponents; the other values are public group elements.
        match self {
            Self::ExpectSMP1 | Self::AwaitingUserSecret { .. } => {}
            Self::ExpectSMP2 { x, a2, a3 } => {
                *x = BigUint::default();
                *a2 = BigUint::default();
                *a3 = BigUint::default();
            }
            Self::ExpectSMP3 { b3, .. } => {
                *b3 = BigUint::default();
            }
            Self::ExpectSMP4 { a3, .. } => {
                *a3 = BigUint::default();
            }
        }
    }
}

/// `subtract_mod_q` computes `(a - b) mod q` with q the order of the Ed448 subgroup.
fn subtract_mod_q(a: &BigUint, b: &BigUint) -> BigUint {
    let q = BigInt::from(ed448::ORDER.clone());
    (BigInt::from(a.clone()) - BigInt::from(b.clone()))
        .mod_floor(&q)
        .to_biguint()
        .expect("BUG: mod_floor with positive modulus is non-negative")
}

#[cfg(test)]
mod tests {
    use super::SMP4Context;
    use crate::smp::SMPStatus;

    fn contexts() -> (SMP4Context, SMP4Context) {
        let fpr_alice = [0xaa_u8; 56];
        let fpr_bob = [0xbb_u8; 56];
        let ssid = [8u8, 7, 6, 5, 4, 3, 2, 1];
        (
            SMP4Context::new(fpr_alice, fpr_bob, ssid),
            SMP4Context::new(fpr_bob, fpr_alice, ssid),
        )
    }

    fn run(alice: &mut SMP4Context, bob: &mut SMP4Context, secret_a: &[u8], secret_b: &[u8]) {
        let smp1 = alice.initiate(secret_a, b"fish?").unwrap();
        bob.handle_message_1(&smp1).unwrap();
        assert_eq!(b"fish?".to_vec(), bob.pending_question().unwrap());
        let smp2 = bob.respond(secret_b).unwrap();
        let smp3 = alice.handle_message_2(&smp2).unwrap();
        let smp4 = bob.handle_message_3(&smp3).unwrap();
        alice.handle_message_4(&smp4).unwrap();
    }

    #[test]
    fn test_smp4_success() {
        let (mut alice, mut bob) = contexts();
        run(&mut alice, &mut bob, b"swordfish", b"swordfish");
        assert_eq!(SMPStatus::Success, alice.status());
        assert_eq!(SMPStatus::Success, bob.status());
    }

    #[test]
    fn test_smp4_failure_on_different_secrets() {
        let (mut alice, mut bob) = contexts();
        run(&mut alice, &mut bob, b"swordfish", b"password");
        assert_eq!(SMPStatus::Failure, alice.status());
        assert_eq!(SMPStatus::Failure, bob.status());
    }

    #[test]
    fn test_smp4_tampered_proof_is_cheating() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"swordfish", b"").unwrap();
        bob.handle_message_1(&smp1).unwrap();
        let mut smp2 = bob.respond(b"swordfish").unwrap();
        let len = smp2.1.len();
        smp2.1[len - 1] ^= 0x01;
        assert!(alice.handle_message_2(&smp2).is_err());
        assert_eq!(SMPStatus::Cheated, alice.status());
    }

    #[test]
    fn test_smp4_abort_allows_restart() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"swordfish", b"").unwrap();
        bob.handle_message_1(&smp1).unwrap();
        assert!(alice.initiate(b"other", b"").is_err());
        alice.abort();
        bob.abort();
        run(&mut alice, &mut bob, b"again", b"again");
        assert_eq!(SMPStatus::Success, alice.status());
        assert_eq!(SMPStatus::Success, bob.status());
    }
}
