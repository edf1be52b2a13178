//! Command stream encoding.
//!
//! A [`PushStream`] is an append-only buffer of 32-bit hardware command
//! words plus the set of backing allocations those words reference. Streams
//! are recorded by exactly one thread at a time (one stream per recording
//! context), so there is no internal lock.
//!
//! Storage is an arena of fixed-size segments: when a reservation does not
//! fit the active segment, a new same-size segment is chained and written
//! from its start. Already-written segments are never copied or relocated,
//! which keeps the "currently open header" a stable `(segment, word)` index
//! that can be patched in place as payload words accumulate.

use std::sync::Arc;

use crate::bo::{AccessFlags, Bo, BoFlags, DrmDevice};
use crate::error::DriverError;

/// Maximum payload word count (and immediate value) a header can carry.
pub const MAX_METHOD_COUNT: u16 = 0x1fff;

/// 3D engine sub-channel.
pub const SUBC_3D: u8 = 0;
/// Compute engine sub-channel.
pub const SUBC_COMPUTE: u8 = 1;
/// Inline memory-to-memory sub-channel.
pub const SUBC_M2MF: u8 = 2;
/// 2D engine sub-channel.
pub const SUBC_2D: u8 = 3;
/// Copy engine sub-channel.
pub const SUBC_COPY: u8 = 4;

/// The four record forms a command word header can take.
///
/// The discriminant is the 3-bit form field in header bits 31-29.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HdrForm {
    /// Every payload word targets the base method offset.
    ZeroInc = 0b001,
    /// Payload word `i` targets `base + 4 * i`.
    NInc = 0b011,
    /// No payload; a 13-bit value rides in the count field.
    Immediate = 0b100,
    /// First payload word targets the base offset, the rest repeat `base + 4`.
    OneInc = 0b101,
}

impl HdrForm {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0b001 => Some(Self::ZeroInc),
            0b011 => Some(Self::NInc),
            0b100 => Some(Self::Immediate),
            0b101 => Some(Self::OneInc),
            _ => None,
        }
    }
}

/// A decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Record form.
    pub form: HdrForm,
    /// Target sub-channel.
    pub subc: u8,
    /// Base method offset in bytes.
    pub mthd: u16,
    /// Payload word count, or the inline value for immediate records.
    pub value: u16,
}

/// Encode one header word.
///
/// `value` is the payload count, or the inline value for the immediate form.
/// Panics if any field is out of range; those are recording bugs.
pub fn encode_header(form: HdrForm, subc: u8, mthd: u16, value: u16) -> u32 {
    assert!(subc < 8, "sub-channel out of range");
    assert_eq!(mthd & 3, 0, "method offsets are word-aligned");
    assert!(mthd >> 2 <= 0x1fff, "method offset out of range");
    assert!(value <= MAX_METHOD_COUNT, "count/immediate exceeds 13 bits");
    ((form as u32) << 29) | ((value as u32) << 16) | ((subc as u32) << 13) | ((mthd as u32) >> 2)
}

/// Decode one header word, or `None` if the form bits are not a valid form.
pub fn decode_header(word: u32) -> Option<Header> {
    let form = HdrForm::from_bits(word >> 29)?;
    Some(Header {
        form,
        subc: ((word >> 13) & 0x7) as u8,
        mthd: ((word & 0x1fff) << 2) as u16,
        value: ((word >> 16) & 0x1fff) as u16,
    })
}

/// One record pulled out of a stream by [`PushStream::records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The decoded header.
    pub header: Header,
    /// Payload words (empty for immediate records).
    pub payload: Vec<u32>,
}

/// One (backing allocation, access flags) entry in a stream's reference set.
#[derive(Debug, Clone)]
pub struct PushRef {
    /// The referenced allocation.
    pub bo: Arc<Bo>,
    /// Access domains accumulated across all `reference` calls for this BO.
    pub access: AccessFlags,
}

/// One backing segment of a stream: a mapped BO for submittable streams, a
/// plain host buffer for splice-only streams.
pub(crate) struct Segment {
    pub(crate) bo: Option<Arc<Bo>>,
    host: Vec<u32>,
    capacity: usize,
    pub(crate) len: usize,
}

impl Segment {
    fn new_gpu(bo: Arc<Bo>) -> Self {
        let capacity = (bo.size() / 4) as usize;
        assert!(bo.map().is_some(), "stream segments must be host-mapped");
        Self {
            bo: Some(bo),
            host: Vec::new(),
            capacity,
            len: 0,
        }
    }

    fn new_host(capacity: usize) -> Self {
        Self {
            bo: None,
            host: vec![0; capacity],
            capacity,
            len: 0,
        }
    }

    fn put(&mut self, idx: usize, word: u32) {
        debug_assert!(idx < self.capacity);
        match &self.bo {
            Some(bo) => bo.map().unwrap().write_u32(idx, word),
            None => self.host[idx] = word,
        }
    }

    fn get(&self, idx: usize) -> u32 {
        debug_assert!(idx < self.len);
        match &self.bo {
            Some(bo) => bo.map().unwrap().read_u32(idx),
            None => self.host[idx],
        }
    }
}

/// An append-only command stream with its reference set.
pub struct PushStream {
    dev: Option<Arc<dyn DrmDevice>>,
    segments: Vec<Segment>,
    /// `(segment, word)` of the most recently opened header, if it is still
    /// legal to extend its count.
    last_hdr: Option<(usize, usize)>,
    refs: Vec<PushRef>,
    /// Leading reference-set entries that survive reset and submission.
    static_refs: usize,
}

impl PushStream {
    /// Create a kernel-submittable stream over a freshly mapped allocation
    /// of `size_words` words. Chained segments reuse the same size.
    pub fn new(dev: &Arc<dyn DrmDevice>, size_words: usize) -> Result<Self, DriverError> {
        assert!(size_words > 0);
        let bo = dev.new_bo((size_words * 4) as u64, 0, BoFlags::GART | BoFlags::MAP)?;
        Ok(Self {
            dev: Some(Arc::clone(dev)),
            segments: vec![Segment::new_gpu(bo)],
            last_hdr: None,
            refs: Vec::new(),
            static_refs: 0,
        })
    }

    /// Create a host-only stream of `size_words` words.
    ///
    /// Host streams cannot be submitted; they exist to record reusable
    /// prefixes that are later [`splice`](Self::splice)d into real streams.
    pub fn new_host(size_words: usize) -> Self {
        assert!(size_words > 0);
        Self {
            dev: None,
            segments: vec![Segment::new_host(size_words)],
            last_hdr: None,
            refs: Vec::new(),
            static_refs: 0,
        }
    }

    /// Whether this is a host-only stream.
    pub fn is_host(&self) -> bool {
        self.dev.is_none()
    }

    /// Guarantee `words` contiguous words are writable from the cursor.
    ///
    /// Chains a new same-size segment when the active one lacks room, which
    /// also closes the currently open header; a single record must therefore
    /// be covered by one reservation.
    pub fn space(&mut self, words: usize) -> Result<(), DriverError> {
        let cur = self.segments.last().expect("stream has a segment");
        if cur.len + words <= cur.capacity {
            return Ok(());
        }

        let capacity = cur.capacity;
        assert!(words <= capacity, "reservation larger than a stream segment");

        let seg = match &self.dev {
            Some(dev) => {
                let bo = dev.new_bo((capacity * 4) as u64, 0, BoFlags::GART | BoFlags::MAP)?;
                Segment::new_gpu(bo)
            }
            None => Segment::new_host(capacity),
        };
        log::debug!("chaining stream segment {} ({capacity} words)", self.segments.len());
        self.segments.push(seg);
        self.last_hdr = None;
        Ok(())
    }

    fn push_word(&mut self, word: u32) {
        let seg = self.segments.last_mut().expect("stream has a segment");
        assert!(seg.len < seg.capacity, "stream segment overrun; reserve space first");
        let idx = seg.len;
        seg.put(idx, word);
        seg.len += 1;
    }

    /// Open a new header of the given form with a zero count.
    ///
    /// Subsequent [`emit`](Self::emit) calls append payload words and bump
    /// the count in place. Immediate records go through
    /// [`immd`](Self::immd) instead.
    pub fn begin(&mut self, form: HdrForm, subc: u8, mthd: u16) {
        assert!(form != HdrForm::Immediate, "immediate records carry their value inline");
        let si = self.segments.len() - 1;
        let wi = self.segments[si].len;
        self.push_word(encode_header(form, subc, mthd, 0));
        self.last_hdr = Some((si, wi));
    }

    /// Append a single-word immediate record.
    pub fn immd(&mut self, subc: u8, mthd: u16, value: u16) {
        self.push_word(encode_header(HdrForm::Immediate, subc, mthd, value));
        self.last_hdr = None;
    }

    fn bump_count(&mut self, n: u16) {
        let (si, wi) = self.last_hdr.expect("no open method header");
        let hdr = self.segments[si].get(wi);
        let form = HdrForm::from_bits(hdr >> 29).expect("open header is well-formed");
        assert!(form != HdrForm::Immediate);

        let count = (hdr >> 16) & 0x1fff;
        let new_count = count + u32::from(n);
        assert!(
            new_count <= u32::from(MAX_METHOD_COUNT),
            "method count overflows the 13-bit field"
        );

        let patched = (hdr & !0x1fff_0000) | (new_count << 16);
        self.segments[si].put(wi, patched);
    }

    /// Append one payload word to the open record.
    pub fn emit(&mut self, value: u32) {
        self.bump_count(1);
        self.push_word(value);
    }

    /// Append a run of payload words to the open record.
    pub fn emit_slice(&mut self, words: &[u32]) {
        assert!(words.len() <= usize::from(MAX_METHOD_COUNT));
        self.bump_count(words.len() as u16);
        for &w in words {
            self.push_word(w);
        }
    }

    /// Add or merge an entry in the reference set.
    ///
    /// Entries are deduplicated by BO handle; access flags accumulate.
    pub fn reference(&mut self, bo: &Arc<Bo>, access: AccessFlags) {
        for r in &mut self.refs {
            if r.bo.handle() == bo.handle() {
                r.access |= access;
                return;
            }
        }
        self.refs.push(PushRef {
            bo: Arc::clone(bo),
            access,
        });
    }

    /// The current reference set, in insertion order.
    pub fn refs(&self) -> &[PushRef] {
        &self.refs
    }

    /// Number of entries in the reference set.
    pub fn num_refs(&self) -> usize {
        self.refs.len()
    }

    /// Drop reference-set entries beyond the first `n`.
    pub fn truncate_refs(&mut self, n: usize) {
        assert!(n <= self.refs.len());
        self.refs.truncate(n);
    }

    /// Declare the first `n` reference-set entries static: they survive
    /// [`reset`](Self::reset) and submission. Used for references a stream
    /// always needs (its owner's internal allocations).
    pub fn set_static_refs(&mut self, n: usize) {
        assert!(n <= self.refs.len());
        self.static_refs = n;
    }

    /// The declared static-prefix length.
    pub fn static_refs(&self) -> usize {
        self.static_refs
    }

    /// Total words written across all segments.
    pub fn dw_count(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Append another stream's content verbatim.
    ///
    /// Only legal when `other` is an unchained host stream with an empty
    /// reference set; the copied tail is closed against further patching.
    pub fn splice(&mut self, other: &PushStream) -> Result<(), DriverError> {
        assert!(other.is_host(), "only host streams can be spliced");
        assert_eq!(other.segments.len(), 1, "spliced streams must be unchained");
        assert!(other.refs.is_empty(), "spliced streams cannot carry references");

        let count = other.segments[0].len;
        self.space(count)?;
        let src = &other.segments[0];
        let seg = self.segments.last_mut().expect("stream has a segment");
        for i in 0..count {
            let idx = seg.len;
            seg.put(idx, src.get(i));
            seg.len += 1;
        }
        self.last_hdr = None;
        Ok(())
    }

    /// Rewind the stream for reuse.
    ///
    /// Drops chained segments, rewinds the cursor to the start of the first
    /// segment and truncates the reference set to its declared static
    /// prefix, so always-needed references survive the reset.
    pub fn reset(&mut self) {
        self.segments.truncate(1);
        self.segments[0].len = 0;
        self.last_hdr = None;
        let n = self.static_refs;
        self.truncate_refs(n);
    }

    /// Check the header/payload structure of the whole stream.
    ///
    /// Walks every header from the start of each segment, consuming its
    /// declared word count, and asserts the walk never runs past the write
    /// cursor. A mismatch means recording corrupted the stream; that is a
    /// driver bug and must never reach the kernel.
    pub fn validate(&self) {
        for seg in &self.segments {
            let mut idx = 0;
            while idx < seg.len {
                let hdr = decode_header(seg.get(idx)).expect("malformed header word in stream");
                idx += 1;
                if hdr.form != HdrForm::Immediate {
                    idx += usize::from(hdr.value);
                }
                assert!(idx <= seg.len, "stream ends mid-record");
            }
        }
    }

    /// Decode the stream into records, in order.
    ///
    /// Debug and test path; assumes the stream validates.
    pub fn records(&self) -> Vec<Record> {
        let mut out = Vec::new();
        for seg in &self.segments {
            let mut idx = 0;
            while idx < seg.len {
                let header = decode_header(seg.get(idx)).expect("malformed header word in stream");
                idx += 1;
                let mut payload = Vec::new();
                if header.form != HdrForm::Immediate {
                    for _ in 0..header.value {
                        payload.push(seg.get(idx));
                        idx += 1;
                    }
                }
                out.push(Record { header, payload });
            }
        }
        out
    }
}

impl std::fmt::Debug for PushStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushStream")
            .field("host", &self.is_host())
            .field("segments", &self.segments.len())
            .field("dw_count", &self.dw_count())
            .field("refs", &self.refs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(HdrForm::ZeroInc)]
    #[case(HdrForm::NInc)]
    #[case(HdrForm::Immediate)]
    #[case(HdrForm::OneInc)]
    fn test_header_round_trip(#[case] form: HdrForm) {
        for subc in 0..8u8 {
            let word = encode_header(form, subc, 0x1574, 0x1abc);
            let hdr = decode_header(word).unwrap();
            assert_eq!(hdr.form, form);
            assert_eq!(hdr.subc, subc);
            assert_eq!(hdr.mthd, 0x1574);
            assert_eq!(hdr.value, 0x1abc);
        }
    }

    #[test]
    fn test_header_bit_layout() {
        // 100 | count/value | subc | mthd >> 2
        let word = encode_header(HdrForm::Immediate, SUBC_COPY, 0x0100, 0);
        assert_eq!(word, 0x8000_8040);
    }

    #[test]
    fn test_decode_rejects_bad_form() {
        assert!(decode_header(0x0000_0000).is_none());
        assert!(decode_header(0x4000_0000).is_none());
        assert!(decode_header(0xe000_0000).is_none());
    }

    #[test]
    #[should_panic(expected = "count/immediate exceeds 13 bits")]
    fn test_encode_rejects_large_value() {
        encode_header(HdrForm::Immediate, 0, 0x100, 0x2000);
    }

    #[test]
    fn test_record_round_trip() {
        let mut push = PushStream::new_host(64);
        push.space(8).unwrap();
        push.begin(HdrForm::NInc, SUBC_3D, 0x1574);
        push.emit(0x11);
        push.emit(0x22);
        push.immd(SUBC_COMPUTE, 0x0110, 7);
        push.begin(HdrForm::OneInc, SUBC_COPY, 0x0100);
        push.emit_slice(&[1, 2, 3]);
        push.validate();

        let records = push.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].header.form, HdrForm::NInc);
        assert_eq!(records[0].header.mthd, 0x1574);
        assert_eq!(records[0].payload, vec![0x11, 0x22]);
        assert_eq!(records[1].header.form, HdrForm::Immediate);
        assert_eq!(records[1].header.value, 7);
        assert!(records[1].payload.is_empty());
        assert_eq!(records[2].header.subc, SUBC_COPY);
        assert_eq!(records[2].payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_count_saturates_at_13_bits() {
        let mut push = PushStream::new_host(0x2001);
        push.space(0x2000).unwrap();
        push.begin(HdrForm::ZeroInc, SUBC_3D, 0x200);
        for i in 0..usize::from(MAX_METHOD_COUNT) {
            push.emit(i as u32);
        }
        push.validate();
        let records = push.records();
        assert_eq!(records[0].header.value, MAX_METHOD_COUNT);
    }

    #[test]
    #[should_panic(expected = "method count overflows the 13-bit field")]
    fn test_count_overflow_panics() {
        let mut push = PushStream::new_host(0x2002);
        push.space(0x2002).unwrap();
        push.begin(HdrForm::ZeroInc, SUBC_3D, 0x200);
        for i in 0..=usize::from(MAX_METHOD_COUNT) {
            push.emit(i as u32);
        }
    }

    #[test]
    #[should_panic(expected = "no open method header")]
    fn test_emit_without_header_panics() {
        let mut push = PushStream::new_host(16);
        push.emit(0);
    }

    #[test]
    #[should_panic(expected = "stream segment overrun")]
    fn test_overrun_panics() {
        let mut push = PushStream::new_host(2);
        push.begin(HdrForm::NInc, SUBC_3D, 0x100);
        push.emit(1);
        push.emit(2);
    }

    #[test]
    fn test_host_stream_chains_segments() {
        let mut push = PushStream::new_host(4);
        push.space(3).unwrap();
        push.begin(HdrForm::NInc, SUBC_3D, 0x100);
        push.emit_slice(&[1, 2]);
        // Does not fit the one word left in the first segment.
        push.space(2).unwrap();
        push.begin(HdrForm::NInc, SUBC_3D, 0x200);
        push.emit(3);
        push.validate();
        assert_eq!(push.segments().len(), 2);
        assert_eq!(push.dw_count(), 5);
        assert_eq!(push.records().len(), 2);
    }

    #[test]
    fn test_splice_and_reset() {
        let mut prefix = PushStream::new_host(16);
        prefix.immd(SUBC_3D, 0x100, 1);
        prefix.immd(SUBC_3D, 0x104, 2);
        prefix.validate();

        let mut push = PushStream::new_host(32);
        push.splice(&prefix).unwrap();
        push.begin(HdrForm::NInc, SUBC_3D, 0x200);
        push.emit(3);
        push.validate();
        assert_eq!(push.records().len(), 3);

        push.reset();
        assert_eq!(push.dw_count(), 0);
        assert!(push.records().is_empty());
    }

    #[test]
    fn test_reference_dedup_and_merge() {
        let a = Arc::new(Bo::new(1, 0x10000, 0x1000, BoFlags::GART));
        let b = Arc::new(Bo::new(2, 0x20000, 0x1000, BoFlags::empty()));

        let mut push = PushStream::new_host(16);
        push.reference(&a, AccessFlags::RD);
        push.reference(&b, AccessFlags::WR);
        push.reference(&a, AccessFlags::WR);

        assert_eq!(push.num_refs(), 2);
        assert_eq!(push.refs()[0].access, AccessFlags::RDWR);
        assert_eq!(push.refs()[1].access, AccessFlags::WR);

        push.set_static_refs(1);
        push.reset();
        assert_eq!(push.num_refs(), 1);
        assert_eq!(push.refs()[0].bo.handle(), 1);
    }

    #[test]
    #[should_panic(expected = "stream ends mid-record")]
    fn test_validate_catches_truncation() {
        let mut push = PushStream::new_host(16);
        push.begin(HdrForm::NInc, SUBC_3D, 0x100);
        push.emit(1);
        // Corrupt the header count directly, the way a buggy in-place patch
        // would.
        let hdr = push.segments[0].get(0);
        push.segments[0].put(0, (hdr & !0x1fff_0000) | (5 << 16));
        push.validate();
    }
}
