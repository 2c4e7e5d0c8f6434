// SPDX-License-Identifier: LGPL-3.0-only

use bitflags::bitflags;
use num_bigint::BigUint;

use crate::{
    crypto::{dsa, ed448},
    instancetag::{self, InstanceTag},
    OTRError, TLV,
};

pub const CTR_LEN: usize = 8;
pub const MAC_LEN: usize = 20;
pub const MAC4_LEN: usize = 64;
pub const FINGERPRINT_LEN: usize = 20;
pub const SSID_LEN: usize = 8;

pub type CTR = [u8; CTR_LEN];
pub type MAC = [u8; MAC_LEN];
pub type MAC4 = [u8; MAC4_LEN];
pub type Fingerprint = [u8; FINGERPRINT_LEN];
pub type SSID = [u8; SSID_LEN];

/// `KeyID` is the ID of a (rotating) DH session key. A valid key ID is never zero.
pub type KeyID = u32;

/// Maximum decoded length for DATA fields. (Messages cannot meaningfully exceed this size, so
/// larger lengths indicate either corruption or malice.)
const DATA_LEN_MAX: usize = 2_147_483_640; // 2^31 - 8

bitflags! {
    /// `MessageFlags` are the flags of an OTR-encoded data message.
    pub struct MessageFlags: u8 {
        /// IGNORE_UNREADABLE marks messages whose loss warrants no error handling: control
        /// traffic that the user would never have seen anyway.
        const IGNORE_UNREADABLE = 0b0000_0001;
    }
}

/// `OTREncodable` is the trait for types that can write themselves into an `OTREncoder`.
pub trait OTREncodable {
    fn encode(&self, encoder: &mut OTREncoder);
}

/// `OTRDecoder` contains the logic for reading OTR binary types from a byte-buffer.
pub struct OTRDecoder<'a>(&'a [u8]);

impl<'a> OTRDecoder<'a> {
    #[must_use]
    pub fn new(content: &'a [u8]) -> Self {
        Self(content)
    }

    /// `available` is the number of unread bytes left in the buffer.
    #[must_use]
    pub fn available(&self) -> usize {
        self.0.len()
    }

    /// `read_u8` reads a single byte from the buffer.
    pub fn read_u8(&mut self) -> Result<u8, OTRError> {
        if self.0.is_empty() {
            return Err(OTRError::IncompleteMessage);
        }
        let value = self.0[0];
        self.0 = &self.0[1..];
        Ok(value)
    }

    /// `read_u16` consumes two bytes as a big-endian SHORT.
    pub fn read_u16(&mut self) -> Result<u16, OTRError> {
        Ok(u16::from_be_bytes(self.read_array::<2>()?))
    }

    /// `read_u32` consumes four bytes as a big-endian INT.
    pub fn read_u32(&mut self) -> Result<u32, OTRError> {
        Ok(u32::from_be_bytes(self.read_array::<4>()?))
    }

    /// `read_u64` consumes eight bytes as a big-endian LONG.
    pub fn read_u64(&mut self) -> Result<u64, OTRError> {
        Ok(u64::from_be_bytes(self.read_array::<8>()?))
    }

    /// `read_i64` reads a signed 8-byte big-endian value from the buffer.
    pub fn read_i64(&mut self) -> Result<i64, OTRError> {
        Ok(i64::from_be_bytes(self.read_array::<8>()?))
    }

    /// `read_instance_tag` reads and validates an instance tag.
    pub fn read_instance_tag(&mut self) -> Result<InstanceTag, OTRError> {
        instancetag::verify(self.read_u32()?)
    }

    /// `read_data` reads variable-length data from the buffer.
    pub fn read_data(&mut self) -> Result<Vec<u8>, OTRError> {
        let len = self.read_u32()? as usize;
        if len > DATA_LEN_MAX {
            return Err(OTRError::ProtocolViolation(
                "Data length exceeds maximum allowed size.",
            ));
        }
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let data = Vec::from(&self.0[..len]);
        self.0 = &self.0[len..];
        Ok(data)
    }

    /// `read_mpi` reads an MPI (length-prefixed unsigned big-endian magnitude) from the buffer.
    pub fn read_mpi(&mut self) -> Result<BigUint, OTRError> {
        Ok(BigUint::from_bytes_be(&self.read_data()?))
    }

    /// `read_mpi_sequence` consumes a count-prefixed run of MPIs, the list format the SMP TLVs
    /// carry their values in.
    pub fn read_mpi_sequence(&mut self) -> Result<Vec<BigUint>, OTRError> {
        let len = self.read_u32()? as usize;
        let mut mpis = Vec::new();
        for _ in 0..len {
            mpis.push(self.read_mpi()?);
        }
        Ok(mpis)
    }

    /// `read_ctr` reads the 8-byte counter value from the buffer.
    pub fn read_ctr(&mut self) -> Result<CTR, OTRError> {
        self.read_array::<CTR_LEN>()
    }

    /// `read_mac` reads a 20-byte MAC from the buffer.
    pub fn read_mac(&mut self) -> Result<MAC, OTRError> {
        self.read_array::<MAC_LEN>()
    }

    /// `read_mac4` reads a 64-byte OTRv4 MAC from the buffer.
    pub fn read_mac4(&mut self) -> Result<MAC4, OTRError> {
        self.read_array::<MAC4_LEN>()
    }

    /// `read_public_key` consumes the key-type SHORT and the four MPI components of a DSA
    /// public key.
    pub fn read_public_key(&mut self) -> Result<dsa::PublicKey, OTRError> {
        let pktype = self.read_u16()?;
        if pktype != 0u16 {
            return Err(OTRError::ProtocolViolation(
                "Unsupported/invalid public key type.",
            ));
        }
        let p = self.read_mpi()?;
        let q = self.read_mpi()?;
        let g = self.read_mpi()?;
        let y = self.read_mpi()?;
        dsa::PublicKey::from_components(p, q, g, y).map_err(OTRError::CryptographicViolation)
    }

    /// `read_dsa_signature` reads a DSA signature (IEEE-P1363 representation) from the buffer.
    pub fn read_dsa_signature(&mut self) -> Result<dsa::Signature, OTRError> {
        self.read_array::<{ dsa::SIGNATURE_LENGTH }>()
    }

    /// `read_ed448_point` reads and decodes an Ed448 point from the buffer.
    pub fn read_ed448_point(&mut self) -> Result<ed448::Point, OTRError> {
        let encoded = self.read_array::<{ ed448::ENCODED_LENGTH }>()?;
        ed448::Point::decode(&encoded)
    }

    /// `read_ed448_scalar` reads an Ed448 scalar (little-endian) from the buffer.
    pub fn read_ed448_scalar(&mut self) -> Result<BigUint, OTRError> {
        Ok(BigUint::from_bytes_le(
            &self.read_array::<{ ed448::ENCODED_LENGTH }>()?,
        ))
    }

    /// `read_ed448_signature` reads an EdDSA signature from the buffer.
    pub fn read_ed448_signature(&mut self) -> Result<[u8; ed448::SIGNATURE_LENGTH], OTRError> {
        self.read_array::<{ ed448::SIGNATURE_LENGTH }>()
    }

    /// `read_fingerprint` reads an (OTRv3) fingerprint from the buffer.
    pub fn read_fingerprint(&mut self) -> Result<Fingerprint, OTRError> {
        self.read_array::<FINGERPRINT_LEN>()
    }

    /// `read_ssid` reads the 8-byte session ID from the buffer.
    pub fn read_ssid(&mut self) -> Result<SSID, OTRError> {
        self.read_array::<SSID_LEN>()
    }

    /// `read_tlv` reads a single type-length-value record from the buffer.
    pub fn read_tlv(&mut self) -> Result<TLV, OTRError> {
        let typ = self.read_u16()?;
        let len = self.read_u16()? as usize;
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let data = Vec::from(&self.0[..len]);
        self.0 = &self.0[len..];
        Ok(TLV(typ, data))
    }

    /// `read_tlvs` reads TLV records until the buffer is exhausted.
    pub fn read_tlvs(&mut self) -> Result<Vec<TLV>, OTRError> {
        let mut tlvs = Vec::new();
        while !self.0.is_empty() {
            tlvs.push(self.read_tlv()?);
        }
        Ok(tlvs)
    }

    /// `read_bytes_null_terminated` reads bytes up to the next NUL byte (or the remainder of the
    /// buffer if none is present), consuming the terminator.
    pub fn read_bytes_null_terminated(&mut self) -> Vec<u8> {
        match self.0.iter().position(|b| *b == 0) {
            None => {
                let content = Vec::from(self.0);
                self.0 = &[];
                content
            }
            Some(pos) => {
                let content = Vec::from(&self.0[..pos]);
                self.0 = &self.0[pos + 1..];
                content
            }
        }
    }

    /// `done` verifies that the buffer is fully drained. Trailing bytes at the outermost level
    /// are a protocol violation.
    pub fn done(&self) -> Result<(), OTRError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(OTRError::ProtocolViolation("data left over in buffer"))
        }
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], OTRError> {
        if self.0.len() < N {
            return Err(OTRError::IncompleteMessage);
        }
        let mut buffer = [0u8; N];
        buffer.copy_from_slice(&self.0[..N]);
        self.0 = &self.0[N..];
        Ok(buffer)
    }
}

/// `OTREncoder` builds a byte-buffer from OTR binary types.
pub struct OTREncoder {
    buffer: Vec<u8>,
}

impl OTREncoder {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write(&mut self, raw: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(raw);
        self
    }

    pub fn write_encodable(&mut self, encodable: &dyn OTREncodable) -> &mut Self {
        encodable.encode(self);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buffer.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// `write_data` writes variable-length data, i.e. 4-byte length followed by content.
    ///
    /// # Panics
    ///
    /// Panics if data is too large for the 4-byte length prefix.
    pub fn write_data(&mut self, v: &[u8]) -> &mut Self {
        assert!(u32::try_from(v.len()).is_ok());
        self.write_u32(v.len() as u32);
        self.buffer.extend_from_slice(v);
        self
    }

    /// `write_mpi` writes an MPI using its minimal big-endian encoding.
    pub fn write_mpi(&mut self, v: &BigUint) -> &mut Self {
        // `to_bytes_be` produces `[0]` for zero; OTR's MPI encoding of zero is empty.
        if *v == BigUint::default() {
            self.write_u32(0)
        } else {
            self.write_data(&v.to_bytes_be())
        }
    }

    /// `write_mpi_sequence` writes a sequence of MPI values in the format defined by SMP:
    /// `num_mpis, mpi1, mpi2, ...`
    pub fn write_mpi_sequence(&mut self, mpis: &[&BigUint]) -> &mut Self {
        self.write_u32(u32::try_from(mpis.len()).expect("BUG: enormous MPI sequence"));
        for mpi in mpis {
            self.write_mpi(mpi);
        }
        self
    }

    pub fn write_ctr(&mut self, v: &CTR) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_mac(&mut self, v: &MAC) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_mac4(&mut self, v: &MAC4) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_public_key(&mut self, key: &dsa::PublicKey) -> &mut Self {
        self.write_u16(0u16)
            .write_mpi(&key.p)
            .write_mpi(&key.q)
            .write_mpi(&key.g)
            .write_mpi(&key.y)
    }

    pub fn write_dsa_signature(&mut self, sig: &dsa::Signature) -> &mut Self {
        self.buffer.extend_from_slice(sig);
        self
    }

    pub fn write_ed448_point(&mut self, point: &ed448::Point) -> &mut Self {
        self.buffer.extend_from_slice(&point.encode());
        self
    }

    pub fn write_ed448_scalar(&mut self, scalar: &BigUint) -> &mut Self {
        self.buffer
            .extend_from_slice(&crate::utils::biguint::to_bytes_le_fixed::<
                { ed448::ENCODED_LENGTH },
            >(scalar));
        self
    }

    pub fn write_ed448_signature(&mut self, sig: &[u8; ed448::SIGNATURE_LENGTH]) -> &mut Self {
        self.buffer.extend_from_slice(sig);
        self
    }

    pub fn write_fingerprint(&mut self, fingerprint: &Fingerprint) -> &mut Self {
        self.buffer.extend_from_slice(fingerprint);
        self
    }

    pub fn write_ssid(&mut self, ssid: &SSID) -> &mut Self {
        self.buffer.extend_from_slice(ssid);
        self
    }

    /// `write_tlv` writes a type-length-value record.
    ///
    /// # Panics
    ///
    /// Panics if the TLV value exceeds the 2-byte length prefix.
    pub fn write_tlv(&mut self, tlv: &TLV) -> &mut Self {
        let len = u16::try_from(tlv.1.len()).expect("BUG: TLV value too large");
        self.write_u16(tlv.0).write_u16(len);
        self.buffer.extend_from_slice(&tlv.1);
        self
    }

    pub fn write_bytes_null_terminated(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0u8);
        self
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.clone()
    }
}

impl Default for OTREncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::{OTRDecoder, OTREncoder};
    use crate::TLV;

    #[test]
    fn test_round_trip_primitives() {
        let encoded = OTREncoder::new()
            .write_u8(0x42)
            .write_u16(0xbead)
            .write_u32(0xdead_beef)
            .write_u64(0x0123_4567_89ab_cdef)
            .write_i64(-12345)
            .to_vec();
        let mut decoder = OTRDecoder::new(&encoded);
        assert_eq!(0x42, decoder.read_u8().unwrap());
        assert_eq!(0xbead, decoder.read_u16().unwrap());
        assert_eq!(0xdead_beef, decoder.read_u32().unwrap());
        assert_eq!(0x0123_4567_89ab_cdef, decoder.read_u64().unwrap());
        assert_eq!(-12345, decoder.read_i64().unwrap());
        assert!(decoder.done().is_ok());
    }

    #[test]
    fn test_round_trip_data_and_mpi() {
        let mpi = BigUint::parse_bytes(b"ace0fba9871234500000001", 16).unwrap();
        let encoded = OTREncoder::new()
            .write_data(b"hello world")
            .write_mpi(&mpi)
            .write_mpi(&BigUint::default())
            .to_vec();
        let mut decoder = OTRDecoder::new(&encoded);
        assert_eq!(b"hello world".as_slice(), decoder.read_data().unwrap());
        assert_eq!(mpi, decoder.read_mpi().unwrap());
        assert_eq!(BigUint::default(), decoder.read_mpi().unwrap());
        assert!(decoder.done().is_ok());
    }

    #[test]
    fn test_mpi_minimal_encoding() {
        // Zero encodes as a zero-length MPI, not as a single zero byte.
        assert_eq!(
            vec![0, 0, 0, 0],
            OTREncoder::new().write_mpi(&BigUint::default()).to_vec()
        );
        assert_eq!(
            vec![0, 0, 0, 1, 0x7f],
            OTREncoder::new().write_mpi(&BigUint::from(0x7fu8)).to_vec()
        );
    }

    #[test]
    fn test_round_trip_mpi_sequence() {
        let m1 = BigUint::from(42u8);
        let m2 = BigUint::from(0xffff_ffffu32);
        let encoded = OTREncoder::new().write_mpi_sequence(&[&m1, &m2]).to_vec();
        let mut decoder = OTRDecoder::new(&encoded);
        assert_eq!(vec![m1, m2], decoder.read_mpi_sequence().unwrap());
        assert!(decoder.done().is_ok());
    }

    #[test]
    fn test_known_encoding_vector() {
        let expected = hex::decode("0000000301020300000002ffee").unwrap();
        assert_eq!(
            expected,
            OTREncoder::new()
                .write_data(&[1, 2, 3])
                .write_mpi(&BigUint::from(0xffeeu16))
                .to_vec()
        );
    }

    #[test]
    fn test_round_trip_tlv() {
        let tlv = TLV(6, Vec::new());
        let tlv2 = TLV(2, vec![1, 2, 3]);
        let encoded = OTREncoder::new().write_tlv(&tlv).write_tlv(&tlv2).to_vec();
        let mut decoder = OTRDecoder::new(&encoded);
        assert_eq!(vec![tlv, tlv2], decoder.read_tlvs().unwrap());
    }

    #[test]
    fn test_read_data_unreasonable_length() {
        // length prefix of 2^31-1 with no content at all
        let mut decoder = OTRDecoder::new(&[0x7f, 0xff, 0xff, 0xff]);
        assert!(decoder.read_data().is_err());
    }

    #[test]
    fn test_read_bytes_null_terminated() {
        let mut decoder = OTRDecoder::new(b"question\0rest");
        assert_eq!(b"question".as_slice(), decoder.read_bytes_null_terminated());
        assert_eq!(b"rest".as_slice(), decoder.read_bytes_null_terminated());
        assert_eq!(0, decoder.available());
    }

    #[test]
    fn test_done_with_leftovers() {
        let decoder = OTRDecoder::new(b"x");
        assert!(decoder.done().is_err());
    }
}
