// SPDX-License-Identifier: LGPL-3.0-only

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    instancetag::{InstanceTag, INSTANCE_ZERO},
    utils, Version,
};

const OTR_FRAGMENT_V2_PREFIX: &[u8] = b"?OTR,";
const OTR_FRAGMENT_V3V4_PREFIX: &[u8] = b"?OTR|";
const OTR_FRAGMENT_SUFFIX: &[u8] = b",";

const OTR_ENCODED_PREFIX: &[u8] = b"?OTR:";
const OTR_ENCODED_SUFFIX: &[u8] = b".";

/// Upper bound for the v2 fragment header: `?OTR,` + two unpadded 5-digit counts and separators.
const FRAGMENT_V2_OVERHEAD: usize = 18;
/// Constant v3 fragment header size: `?OTR|`, two 8-digit hex tags, two zero-padded counts.
const FRAGMENT_V3_OVERHEAD: usize = 36;
/// Constant v4 fragment header size: v3 plus the 8-digit hex message identifier.
const FRAGMENT_V4_OVERHEAD: usize = 45;

const MAX_FRAGMENTS: usize = 65535;

static FRAGMENT_V2_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\?OTR,(\d{1,5}),(\d{1,5}),([^,]*),$")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});
static FRAGMENT_V3_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\?OTR\|([0-9a-fA-F]{1,8})\|([0-9a-fA-F]{1,8}),(\d{1,5}),(\d{1,5}),([^,]*),$")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});
static FRAGMENT_V4_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\?OTR\|([0-9a-fA-F]{1,8})\|([0-9a-fA-F]{1,8})\|([0-9a-fA-F]{1,8}),(\d{1,5}),(\d{1,5}),([^,]*),$",
    )
    .expect("BUG: failed to compile hard-coded regex-pattern.")
});

/// `FragmentError` contains the errors that can occur during fragmentation and reassembly.
#[derive(Debug, PartialEq, Eq)]
pub enum FragmentError {
    /// A fragment was processed, but more fragments are needed to reassemble the message.
    IncompleteResult,
    /// A fragment arrived out of order. The partial buffer is discarded.
    UnexpectedFragment,
    /// Content does not match any supported fragment format.
    InvalidFormat,
    /// Content matches the fragment format but carries illegal values.
    InvalidData,
    /// The maximum fragment size leaves no room for content after the fragment header.
    TooSmall,
    /// The content requires more fragments than the 16-bit fragment counts can express.
    TooManyFragments,
    /// The content is not eligible for fragmentation: only whole OTR-encoded messages may be
    /// fragmented, and only once.
    Unfragmentable,
}

/// `match_fragment` checks whether the payload has the shape of a message fragment.
#[must_use]
pub fn match_fragment(content: &[u8]) -> bool {
    (content.starts_with(OTR_FRAGMENT_V2_PREFIX) || content.starts_with(OTR_FRAGMENT_V3V4_PREFIX))
        && content.ends_with(OTR_FRAGMENT_SUFFIX)
}

/// `Fragment` is a single piece of a fragmented OTR-encoded message.
pub struct Fragment {
    pub version: Version,
    /// `identifier` is the random per-message identifier of OTRv4 fragmentation. Zero for
    /// version 2 and 3 fragments.
    pub identifier: u32,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    pub part: u16,
    pub total: u16,
    pub payload: Vec<u8>,
}

/// `parse` parses content into a fragment. The content must already match the general fragment
/// shape (see `match_fragment`).
pub fn parse(content: &[u8]) -> Result<Fragment, FragmentError> {
    if let Some(caps) = FRAGMENT_V4_PATTERN.captures(content) {
        return Ok(Fragment {
            version: Version::V4,
            identifier: parse_hex_u32(&caps[1])?,
            sender: parse_hex_u32(&caps[2])?,
            receiver: parse_hex_u32(&caps[3])?,
            part: parse_dec_u16(&caps[4])?,
            total: parse_dec_u16(&caps[5])?,
            payload: caps[6].to_vec(),
        });
    }
    if let Some(caps) = FRAGMENT_V3_PATTERN.captures(content) {
        return Ok(Fragment {
            version: Version::V3,
            identifier: 0,
            sender: parse_hex_u32(&caps[1])?,
            receiver: parse_hex_u32(&caps[2])?,
            part: parse_dec_u16(&caps[3])?,
            total: parse_dec_u16(&caps[4])?,
            payload: caps[5].to_vec(),
        });
    }
    if let Some(caps) = FRAGMENT_V2_PATTERN.captures(content) {
        return Ok(Fragment {
            version: Version::V2,
            identifier: 0,
            sender: INSTANCE_ZERO,
            receiver: INSTANCE_ZERO,
            part: parse_dec_u16(&caps[1])?,
            total: parse_dec_u16(&caps[2])?,
            payload: caps[3].to_vec(),
        });
    }
    Err(FragmentError::InvalidFormat)
}

/// `verify` performs sanity checks on the fragment counters and payload.
pub fn verify(fragment: &Fragment) -> Result<(), FragmentError> {
    if fragment.total == 0
        || fragment.part == 0
        || fragment.part > fragment.total
        || fragment.payload.is_empty()
    {
        Err(FragmentError::InvalidData)
    } else {
        Ok(())
    }
}

/// `fragment` splits an OTR-encoded message into fragments for the requested maximum message
/// size. Content that already fits is returned as-is in a single piece. Only complete
/// OTR-encoded messages may be fragmented: plaintext and existing fragments are refused.
pub fn fragment(
    max_size: usize,
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    content: &[u8],
) -> Result<Vec<Vec<u8>>, FragmentError> {
    if match_fragment(content)
        || !content.starts_with(OTR_ENCODED_PREFIX)
        || !content.ends_with(OTR_ENCODED_SUFFIX)
    {
        return Err(FragmentError::Unfragmentable);
    }
    if content.len() <= max_size {
        return Ok(vec![Vec::from(content)]);
    }
    let overhead = match version {
        Version::V2 => FRAGMENT_V2_OVERHEAD,
        Version::V3 => FRAGMENT_V3_OVERHEAD,
        Version::V4 => FRAGMENT_V4_OVERHEAD,
        Version::None | Version::Unsupported(_) => panic!("BUG: illegal version for fragmenting"),
    };
    if max_size <= overhead {
        return Err(FragmentError::TooSmall);
    }
    let payload_size = max_size - overhead;
    let total = content.len() / payload_size + usize::from(content.len() % payload_size != 0);
    if total > MAX_FRAGMENTS {
        return Err(FragmentError::TooManyFragments);
    }
    let identifier = u32::from_be_bytes(utils::random::secure_bytes::<4>());
    let mut fragments = Vec::with_capacity(total);
    for (i, piece) in content.chunks(payload_size).enumerate() {
        let k = i + 1;
        let mut result = match version {
            Version::V2 => format!("?OTR,{k},{total},"),
            Version::V3 => {
                format!("?OTR|{sender:08x}|{receiver:08x},{k:05},{total:05},")
            }
            Version::V4 => {
                format!("?OTR|{identifier:08x}|{sender:08x}|{receiver:08x},{k:05},{total:05},")
            }
            Version::None | Version::Unsupported(_) => unreachable!(),
        }
        .into_bytes();
        result.extend_from_slice(piece);
        result.extend_from_slice(OTR_FRAGMENT_SUFFIX);
        fragments.push(result);
    }
    Ok(fragments)
}

/// `Assembler` reassembles fragments into the original OTR-encoded message. One assembler
/// exists per remote instance; fragments of distinct logical messages must not interleave.
pub struct Assembler {
    identifier: u32,
    buffer: Vec<u8>,
    last: u16,
    total: u16,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            identifier: 0,
            buffer: Vec::new(),
            last: 0,
            total: 0,
        }
    }

    /// `assemble` processes a single fragment. Returns the reassembled message once all
    /// fragments have arrived in order, or an indication of why not.
    pub fn assemble(&mut self, fragment: Fragment) -> Result<Vec<u8>, FragmentError> {
        verify(&fragment)?;
        if fragment.part == 1 {
            // First fragment. Any partial buffer from an interrupted message is discarded.
            self.identifier = fragment.identifier;
            self.buffer.clear();
            self.buffer.extend_from_slice(&fragment.payload);
            self.last = 1;
            self.total = fragment.total;
        } else if fragment.part == self.last + 1
            && fragment.total == self.total
            && fragment.identifier == self.identifier
            && self.last > 0
        {
            // Next fragment in the ongoing series.
            self.buffer.extend_from_slice(&fragment.payload);
            self.last = fragment.part;
        } else {
            // Out-of-order fragment. The previous partial content cannot be completed anymore.
            self.reset();
            return Err(FragmentError::UnexpectedFragment);
        }
        if self.last == self.total {
            let content = core::mem::take(&mut self.buffer);
            self.reset();
            Ok(content)
        } else {
            Err(FragmentError::IncompleteResult)
        }
    }

    fn reset(&mut self) {
        self.identifier = 0;
        self.buffer.clear();
        self.last = 0;
        self.total = 0;
    }
}

fn parse_hex_u32(data: &[u8]) -> Result<u32, FragmentError> {
    let text = core::str::from_utf8(data).or(Err(FragmentError::InvalidFormat))?;
    u32::from_str_radix(text, 16).or(Err(FragmentError::InvalidFormat))
}

fn parse_dec_u16(data: &[u8]) -> Result<u16, FragmentError> {
    let text = core::str::from_utf8(data).or(Err(FragmentError::InvalidFormat))?;
    text.parse::<u16>().or(Err(FragmentError::InvalidData))
}

#[cfg(test)]
mod tests {
    use super::{fragment, match_fragment, parse, Assembler, FragmentError};
    use crate::Version;

    fn encoded_message_of_length(len: usize) -> Vec<u8> {
        assert!(len > 6);
        let mut content = Vec::from("?OTR:");
        content.resize(len - 1, b'A');
        content.push(b'.');
        content
    }

    #[test]
    fn test_match_fragment() {
        assert!(match_fragment(b"?OTR,1,2,foo,"));
        assert!(match_fragment(b"?OTR|1f2e3d4c|5a6b7c8d,00001,00002,foo,"));
        assert!(!match_fragment(b"?OTR:AAMDYWJjZA==."));
        assert!(!match_fragment(b"Hello world"));
        assert!(!match_fragment(b"?OTR,1,2,foo"));
    }

    #[test]
    fn test_parse_v3_fragment() {
        let f = parse(b"?OTR|5a73a599|27e31597,00002,00003,payloadpiece,").unwrap();
        assert_eq!(Version::V3, f.version);
        assert_eq!(0x5a73_a599, f.sender);
        assert_eq!(0x27e3_1597, f.receiver);
        assert_eq!(2, f.part);
        assert_eq!(3, f.total);
        assert_eq!(b"payloadpiece".as_ref(), f.payload.as_slice());
    }

    #[test]
    fn test_parse_v4_fragment() {
        let f = parse(b"?OTR|3c5b5f03|5a73a599|27e31597,00001,00001,piece,").unwrap();
        assert_eq!(Version::V4, f.version);
        assert_eq!(0x3c5b_5f03, f.identifier);
        assert_eq!(0x5a73_a599, f.sender);
        assert_eq!(0x27e3_1597, f.receiver);
    }

    #[test]
    fn test_parse_v2_fragment() {
        let f = parse(b"?OTR,1,3,piece,").unwrap();
        assert_eq!(Version::V2, f.version);
        assert_eq!(0, f.sender);
        assert_eq!(0, f.receiver);
        assert_eq!(1, f.part);
        assert_eq!(3, f.total);
    }

    #[test]
    fn test_fragment_fits_returned_whole() {
        let content = encoded_message_of_length(100);
        let fragments = fragment(100, Version::V3, 0x100, 0x200, &content).unwrap();
        assert_eq!(1, fragments.len());
        assert_eq!(content, fragments[0]);
    }

    #[test]
    fn test_fragment_refuses_plaintext_and_refragmentation() {
        assert_eq!(
            Err(FragmentError::Unfragmentable),
            fragment(100, Version::V3, 0x100, 0x200, b"just some chat text")
        );
        assert_eq!(
            Err(FragmentError::Unfragmentable),
            fragment(10, Version::V3, 0x100, 0x200, b"?OTR|aa|bb,1,2,piece,")
        );
    }

    #[test]
    fn test_fragment_too_small() {
        let content = encoded_message_of_length(464);
        assert_eq!(
            Err(FragmentError::TooSmall),
            fragment(36, Version::V3, 0x100, 0x200, &content)
        );
        assert!(fragment(37, Version::V3, 0x100, 0x200, &content).is_ok());
    }

    #[test]
    fn test_fragment_464_bytes_at_208_max() {
        let content = encoded_message_of_length(464);
        let fragments = fragment(208, Version::V3, 0x5a73_a599, 0x27e3_1597, &content).unwrap();
        assert_eq!(3, fragments.len());
        assert!(fragments.iter().all(|f| f.len() <= 208));
        assert!(fragments[0].starts_with(b"?OTR|5a73a599|27e31597,00001,00003,"));
        assert!(fragments[1].starts_with(b"?OTR|5a73a599|27e31597,00002,00003,"));
        assert!(fragments[2].starts_with(b"?OTR|5a73a599|27e31597,00003,00003,"));
        let mut assembler = Assembler::new();
        assert_eq!(
            Err(FragmentError::IncompleteResult),
            assembler.assemble(parse(&fragments[0]).unwrap())
        );
        assert_eq!(
            Err(FragmentError::IncompleteResult),
            assembler.assemble(parse(&fragments[1]).unwrap())
        );
        assert_eq!(content, assembler.assemble(parse(&fragments[2]).unwrap()).unwrap());
    }

    #[test]
    fn test_fragment_round_trip_various_sizes() {
        for version in [Version::V2, Version::V3, Version::V4] {
            for max_size in [48, 53, 99, 187, 1024] {
                let content = encoded_message_of_length(751);
                let fragments = fragment(max_size, version, 0x100, 0x200, &content).unwrap();
                let mut assembler = Assembler::new();
                let mut result = None;
                for f in &fragments {
                    match assembler.assemble(parse(f).unwrap()) {
                        Ok(assembled) => result = Some(assembled),
                        Err(FragmentError::IncompleteResult) => continue,
                        Err(e) => panic!("unexpected assembly failure: {e:?}"),
                    }
                }
                assert_eq!(Some(content), result);
            }
        }
    }

    #[test]
    fn test_assembler_out_of_order_resets() {
        let content = encoded_message_of_length(464);
        let fragments = fragment(208, Version::V3, 0x100, 0x200, &content).unwrap();
        let mut assembler = Assembler::new();
        assert_eq!(
            Err(FragmentError::IncompleteResult),
            assembler.assemble(parse(&fragments[0]).unwrap())
        );
        // skipping fragment 2 discards the buffer
        assert_eq!(
            Err(FragmentError::UnexpectedFragment),
            assembler.assemble(parse(&fragments[2]).unwrap())
        );
        // and continuing in order no longer completes, until restarted from the beginning
        assert_eq!(
            Err(FragmentError::UnexpectedFragment),
            assembler.assemble(parse(&fragments[1]).unwrap())
        );
        for (i, f) in fragments.iter().enumerate() {
            let result = assembler.assemble(parse(f).unwrap());
            if i < fragments.len() - 1 {
                assert_eq!(Err(FragmentError::IncompleteResult), result);
            } else {
                assert_eq!(content, result.unwrap());
            }
        }
    }

    #[test]
    fn test_assembler_restart_on_first_fragment() {
        let content = encoded_message_of_length(464);
        let fragments = fragment(208, Version::V3, 0x100, 0x200, &content).unwrap();
        let mut assembler = Assembler::new();
        assert_eq!(
            Err(FragmentError::IncompleteResult),
            assembler.assemble(parse(&fragments[0]).unwrap())
        );
        // a new first fragment restarts accumulation
        assert_eq!(
            Err(FragmentError::IncompleteResult),
            assembler.assemble(parse(&fragments[0]).unwrap())
        );
        assert_eq!(
            Err(FragmentError::IncompleteResult),
            assembler.assemble(parse(&fragments[1]).unwrap())
        );
        assert_eq!(content, assembler.assemble(parse(&fragments[2]).unwrap()).unwrap());
    }

    #[test]
    fn test_verify_rejects_illegal_counts() {
        assert!(parse(b"?OTR,0,3,piece,").is_ok());
        let f = parse(b"?OTR,0,3,piece,").unwrap();
        assert_eq!(Err(FragmentError::InvalidData), Assembler::new().assemble(f));
        let f = parse(b"?OTR,4,3,piece,").unwrap();
        assert_eq!(Err(FragmentError::InvalidData), Assembler::new().assemble(f));
    }
}
