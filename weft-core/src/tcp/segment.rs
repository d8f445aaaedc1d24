//! TCP segment parsing and construction.
//!
//! Headers are parsed from and serialized to network byte order, the
//! checksum is computed over the RFC 8200 IPv6 pseudo-header, and the
//! option kinds the engine negotiates (MSS, window scale, SACK, timestamps)
//! are understood in both directions. Anything else in the option list is
//! skipped by length.

use crate::ip6::Ipv6Address;
use crate::message::Message;

/// Fixed TCP header length in bytes.
pub const HEADER_LEN: usize = 20;
/// Longest legal TCP header, with a full option list.
pub const MAX_HEADER_LEN: usize = 60;

/// A parse failure. Segments that fail to parse are dropped without reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("ran out of bytes while parsing the TCP header")]
    HeaderTooShort,
    #[error("data offset {0} outside 5..=15")]
    BadDataOffset(u8),
    #[error("malformed option list")]
    BadOptions,
    #[error("checksum mismatch: computed {actual:#06x}, header says {expected:#06x}")]
    InvalidChecksum { actual: u16, expected: u16 },
}

/// One's-complement checksum accumulator shared by parsing and building.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Checksum(u16);

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    pub fn add_address(&mut self, address: Ipv6Address) {
        for pair in address.to_bytes().chunks_exact(2) {
            self.add_u8(pair[0], pair[1]);
        }
    }

    /// Adds every remaining byte, padding an odd tail with zero, and returns
    /// how many bytes were consumed.
    pub fn accumulate_remainder(&mut self, bytes: &mut impl Iterator<Item = u8>) -> usize {
        let mut count = 0;
        while let Some(first) = bytes.next() {
            count += 1;
            match bytes.next() {
                Some(second) => {
                    count += 1;
                    self.add_u8(first, second);
                }
                None => self.add_u8(first, 0),
            }
        }
        count
    }

    pub fn as_u16(&self) -> u16 {
        match self.0 {
            // Zero has two one's-complement encodings; emit the nonzero one
            // so the field is never mistaken for "checksum not computed".
            0xffff => 0xffff,
            sum => !sum,
        }
    }
}

/// The six TCP control bits, stored in wire order.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Control(u8);

impl Control {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn new(urg: bool, ack: bool, psh: bool, rst: bool, syn: bool, fin: bool) -> Self {
        Self(
            fin as u8
                | (syn as u8) << 1
                | (rst as u8) << 2
                | (psh as u8) << 3
                | (ack as u8) << 4
                | (urg as u8) << 5,
        )
    }

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn psh(self) -> bool {
        self.0 & Self::PSH != 0
    }

    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn urg(self) -> bool {
        self.0 & Self::URG != 0
    }

    pub fn set_syn(&mut self, on: bool) {
        self.set(Self::SYN, on);
    }

    pub fn set_ack(&mut self, on: bool) {
        self.set(Self::ACK, on);
    }

    pub fn set_fin(&mut self, on: bool) {
        self.set(Self::FIN, on);
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl From<u8> for Control {
    fn from(bits: u8) -> Self {
        Self(bits & 0b11_1111)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

/// A SACK block: one received range past the cumulative acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub left: u32,
    pub right: u32,
}

/// RFC 7323 timestamps carried on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub value: u32,
    pub echo: u32,
}

/// The option kinds the engine understands.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: Vec<SackBlock>,
    pub timestamps: Option<Timestamps>,
}

const KIND_EOL: u8 = 0;
const KIND_NOP: u8 = 1;
const KIND_MSS: u8 = 2;
const KIND_WINDOW_SCALE: u8 = 3;
const KIND_SACK_PERMITTED: u8 = 4;
const KIND_SACK: u8 = 5;
const KIND_TIMESTAMPS: u8 = 8;

impl SegmentOptions {
    pub fn is_empty(&self) -> bool {
        self.mss.is_none()
            && self.window_scale.is_none()
            && !self.sack_permitted
            && self.sack_blocks.is_empty()
            && self.timestamps.is_none()
    }

    /// Serialized length, padded to a four-byte boundary.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.mss.is_some() {
            len += 4;
        }
        if self.window_scale.is_some() {
            len += 3;
        }
        if self.sack_permitted {
            len += 2;
        }
        if !self.sack_blocks.is_empty() {
            len += 2 + 8 * self.sack_blocks.len();
        }
        if self.timestamps.is_some() {
            len += 10;
        }
        (len + 3) & !3
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        if let Some(mss) = self.mss {
            out.push(KIND_MSS);
            out.push(4);
            out.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(shift) = self.window_scale {
            out.push(KIND_WINDOW_SCALE);
            out.push(3);
            out.push(shift);
        }
        if self.sack_permitted {
            out.push(KIND_SACK_PERMITTED);
            out.push(2);
        }
        if !self.sack_blocks.is_empty() {
            out.push(KIND_SACK);
            out.push(2 + 8 * self.sack_blocks.len() as u8);
            for block in &self.sack_blocks {
                out.extend_from_slice(&block.left.to_be_bytes());
                out.extend_from_slice(&block.right.to_be_bytes());
            }
        }
        if let Some(timestamps) = self.timestamps {
            out.push(KIND_TIMESTAMPS);
            out.push(10);
            out.extend_from_slice(&timestamps.value.to_be_bytes());
            out.extend_from_slice(&timestamps.echo.to_be_bytes());
        }
        while (out.len() - start) % 4 != 0 {
            out.push(KIND_EOL);
        }
    }

    fn parse(bytes: &[u8]) -> Result<Self, SegmentError> {
        let mut options = Self::default();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                KIND_EOL => break,
                KIND_NOP => {
                    i += 1;
                    continue;
                }
                kind => {
                    if i + 1 >= bytes.len() {
                        return Err(SegmentError::BadOptions);
                    }
                    let len = bytes[i + 1] as usize;
                    if len < 2 || i + len > bytes.len() {
                        return Err(SegmentError::BadOptions);
                    }
                    let body = &bytes[i + 2..i + len];
                    match kind {
                        KIND_MSS if len == 4 => {
                            options.mss = Some(u16::from_be_bytes([body[0], body[1]]));
                        }
                        KIND_WINDOW_SCALE if len == 3 => {
                            options.window_scale = Some(body[0]);
                        }
                        KIND_SACK_PERMITTED if len == 2 => {
                            options.sack_permitted = true;
                        }
                        KIND_SACK if len >= 10 && (len - 2) % 8 == 0 => {
                            for block in body.chunks_exact(8) {
                                options.sack_blocks.push(SackBlock {
                                    left: u32::from_be_bytes([
                                        block[0], block[1], block[2], block[3],
                                    ]),
                                    right: u32::from_be_bytes([
                                        block[4], block[5], block[6], block[7],
                                    ]),
                                });
                            }
                        }
                        KIND_TIMESTAMPS if len == 10 => {
                            options.timestamps = Some(Timestamps {
                                value: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                                echo: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                            });
                        }
                        // Unknown kinds (and known kinds with surprising
                        // lengths) are skipped by their declared length.
                        _ => {}
                    }
                    i += len;
                }
            }
        }
        Ok(options)
    }
}

/// A parsed or constructed TCP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub ctl: Control,
    pub wnd: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: SegmentOptions,
}

impl TcpHeader {
    /// Parses a header from the start of `bytes`, verifying the checksum
    /// over the whole segment and the IPv6 pseudo-header. Returns the header
    /// and its length so the caller can slice off the text.
    pub fn parse(
        mut bytes: impl Iterator<Item = u8>,
        src_address: Ipv6Address,
        dst_address: Ipv6Address,
    ) -> Result<(Self, usize), SegmentError> {
        let mut next = || -> Result<u8, SegmentError> {
            bytes.next().ok_or(SegmentError::HeaderTooShort)
        };
        let mut checksum = Checksum::new();

        let src_port = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(src_port);

        let dst_port = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(dst_port);

        let seq_bytes = [next()?, next()?, next()?, next()?];
        let seq = u32::from_be_bytes(seq_bytes);
        checksum.add_u32(seq_bytes);

        let ack_bytes = [next()?, next()?, next()?, next()?];
        let ack = u32::from_be_bytes(ack_bytes);
        checksum.add_u32(ack_bytes);

        let offset_and_control = [next()?, next()?];
        checksum.add_u16(u16::from_be_bytes(offset_and_control));
        let data_offset = offset_and_control[0] >> 4;
        let ctl = Control::from(offset_and_control[1]);
        if !(5..=15).contains(&data_offset) {
            return Err(SegmentError::BadDataOffset(data_offset));
        }
        let header_len = data_offset as usize * 4;

        let wnd = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(wnd);

        let expected_checksum = u16::from_be_bytes([next()?, next()?]);

        let urgent = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(urgent);

        let mut option_bytes = [0u8; MAX_HEADER_LEN - HEADER_LEN];
        let option_len = header_len - HEADER_LEN;
        for byte in option_bytes.iter_mut().take(option_len) {
            *byte = next()?;
        }
        let mut option_iter = option_bytes[..option_len].iter().copied();
        checksum.accumulate_remainder(&mut option_iter);
        let options = SegmentOptions::parse(&option_bytes[..option_len])?;

        let text_len = checksum.accumulate_remainder(&mut bytes);

        // IPv6 pseudo-header: addresses, TCP length, next header 6.
        checksum.add_address(src_address);
        checksum.add_address(dst_address);
        let tcp_len = (header_len + text_len) as u32;
        checksum.add_u32(tcp_len.to_be_bytes());
        checksum.add_u8(0, 6);

        let actual = checksum.as_u16();
        if actual != expected_checksum {
            return Err(SegmentError::InvalidChecksum {
                actual,
                expected: expected_checksum,
            });
        }

        Ok((
            Self {
                src_port,
                dst_port,
                seq,
                ack,
                ctl,
                wnd,
                checksum: expected_checksum,
                urgent,
                options,
            },
            header_len,
        ))
    }

    /// The header's length on the wire, options included.
    pub fn len(&self) -> usize {
        HEADER_LEN + self.options.encoded_len()
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        let data_offset = (self.len() / 4) as u8;
        out.push(data_offset << 4);
        out.push(self.ctl.into());
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.urgent.to_be_bytes());
        self.options.encode(out);
    }
}

/// A header plus its segment text.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Message,
}

impl Segment {
    pub fn new(header: TcpHeader, text: Message) -> Self {
        Self { header, text }
    }

    /// The sequence space the segment occupies, control bits included.
    pub fn seg_len(&self) -> usize {
        self.text.len() + self.header.ctl.syn() as usize + self.header.ctl.fin() as usize
    }

    pub fn into_inner(self) -> (TcpHeader, Message) {
        (self.header, self.text)
    }

    /// Serializes the segment for transmission, prepending the header bytes
    /// to the (unchanged, uncopied) text chunks.
    pub fn into_message(self) -> Message {
        let mut header_bytes = Vec::with_capacity(self.header.len());
        self.header.serialize_into(&mut header_bytes);
        let mut message = self.text;
        message.header(header_bytes);
        message
    }
}

/// Fluent construction of outbound segments.
#[derive(Debug, Clone)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack: 0,
            ctl: Control::default(),
            wnd: 0,
            checksum: 0,
            urgent: 0,
            options: SegmentOptions::default(),
        })
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl.set_ack(true);
        self
    }

    pub fn syn(mut self) -> Self {
        self.0.ctl.set(Control::SYN, true);
        self
    }

    pub fn fin(mut self) -> Self {
        self.0.ctl.set(Control::FIN, true);
        self
    }

    pub fn rst(mut self) -> Self {
        self.0.ctl.set(Control::RST, true);
        self
    }

    pub fn psh(mut self) -> Self {
        self.0.ctl.set(Control::PSH, true);
        self
    }

    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    pub fn options(mut self, options: SegmentOptions) -> Self {
        self.0.options = options;
        self
    }

    /// Computes the checksum over the serialized header, the text, and the
    /// IPv6 pseudo-header, and returns the finished segment.
    pub fn build(
        mut self,
        src_address: Ipv6Address,
        dst_address: Ipv6Address,
        text: Message,
    ) -> Segment {
        self.0.checksum = 0;
        let mut header_bytes = Vec::with_capacity(self.0.len());
        self.0.serialize_into(&mut header_bytes);

        let mut checksum = Checksum::new();
        let mut header_iter = header_bytes.iter().copied();
        checksum.accumulate_remainder(&mut header_iter);
        let mut text_iter = text.iter();
        checksum.accumulate_remainder(&mut text_iter);
        drop(text_iter);
        checksum.add_address(src_address);
        checksum.add_address(dst_address);
        let tcp_len = (header_bytes.len() + text.len()) as u32;
        checksum.add_u32(tcp_len.to_be_bytes());
        checksum.add_u8(0, 6);

        self.0.checksum = checksum.as_u16();
        Segment::new(self.0, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv6Address = Ipv6Address::new([
        0xfd, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01,
    ]);
    const DST: Ipv6Address = Ipv6Address::new([
        0xfd, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x02,
    ]);

    fn ip6_header(payload_len: usize) -> etherparse::Ipv6Header {
        etherparse::Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: payload_len as u16,
            next_header: 6,
            hop_limit: 64,
            source: SRC.to_bytes(),
            destination: DST.to_bytes(),
        }
    }

    #[test]
    fn parses_a_plain_segment_built_by_etherparse() -> anyhow::Result<()> {
        let payload = b"Hello, world!";
        let mut expected = etherparse::TcpHeader::new(0xcafe, 0xbabe, 123456789, 1024);
        expected.acknowledgment_number = 10;
        expected.ack = true;
        expected.psh = true;
        let ip_header = ip6_header(expected.header_len() as usize + payload.len());
        expected.checksum = expected.calc_checksum_ipv6(&ip_header, payload)?;

        let mut serial = vec![];
        expected.write(&mut serial)?;
        serial.extend_from_slice(payload);

        let (actual, header_len) = TcpHeader::parse(serial.iter().copied(), SRC, DST)?;
        assert_eq!(header_len, 20);
        assert_eq!(actual.src_port, 0xcafe);
        assert_eq!(actual.dst_port, 0xbabe);
        assert_eq!(actual.seq, 123456789);
        assert_eq!(actual.ack, 10);
        assert!(actual.ctl.ack());
        assert!(actual.ctl.psh());
        assert!(!actual.ctl.syn());
        assert_eq!(actual.wnd, 1024);
        assert_eq!(actual.checksum, expected.checksum);
        Ok(())
    }

    #[test]
    fn parses_syn_options_built_by_etherparse() -> anyhow::Result<()> {
        use etherparse::TcpOptionElement;

        let mut expected = etherparse::TcpHeader::new(49152, 80, 0x1000, 4096);
        expected.syn = true;
        expected.set_options(&[
            TcpOptionElement::MaximumSegmentSize(1220),
            TcpOptionElement::WindowScale(6),
            TcpOptionElement::SelectiveAcknowledgementPermitted,
            TcpOptionElement::Timestamp(77, 0),
        ])?;
        let ip_header = ip6_header(expected.header_len() as usize);
        expected.checksum = expected.calc_checksum_ipv6(&ip_header, &[])?;

        let mut serial = vec![];
        expected.write(&mut serial)?;

        let (actual, header_len) = TcpHeader::parse(serial.iter().copied(), SRC, DST)?;
        assert_eq!(header_len, expected.header_len() as usize);
        assert_eq!(actual.options.mss, Some(1220));
        assert_eq!(actual.options.window_scale, Some(6));
        assert!(actual.options.sack_permitted);
        assert_eq!(
            actual.options.timestamps,
            Some(Timestamps { value: 77, echo: 0 })
        );
        Ok(())
    }

    #[test]
    fn built_segments_parse_back() -> anyhow::Result<()> {
        let options = SegmentOptions {
            mss: Some(1220),
            window_scale: Some(2),
            sack_permitted: true,
            sack_blocks: vec![],
            timestamps: Some(Timestamps { value: 5, echo: 9 }),
        };
        let segment = TcpHeaderBuilder::new(4242, 80, 1000)
            .syn()
            .ack(2000)
            .wnd(8192)
            .options(options.clone())
            .build(SRC, DST, Message::new(b"abc"));
        let wire = segment.into_message().to_vec();

        let (header, header_len) = TcpHeader::parse(wire.iter().copied(), SRC, DST)?;
        assert_eq!(header.seq, 1000);
        assert_eq!(header.ack, 2000);
        assert!(header.ctl.syn() && header.ctl.ack());
        assert_eq!(header.options, options);
        assert_eq!(&wire[header_len..], b"abc");
        Ok(())
    }

    #[test]
    fn built_checksums_match_etherparse() -> anyhow::Result<()> {
        let segment = TcpHeaderBuilder::new(1, 2, 3)
            .ack(4)
            .wnd(5)
            .build(SRC, DST, Message::new(b"payload"));
        let ours = segment.header.checksum;

        let wire = segment.into_message().to_vec();
        let sliced = etherparse::TcpHeaderSlice::from_slice(&wire)?;
        let reference = sliced
            .to_header()
            .calc_checksum_ipv6_raw(SRC.to_bytes(), DST.to_bytes(), &wire[20..])?;
        assert_eq!(ours, reference);
        Ok(())
    }

    #[test]
    fn corrupted_segments_are_rejected() {
        let segment = TcpHeaderBuilder::new(1, 2, 3)
            .ack(4)
            .build(SRC, DST, Message::new(b"payload"));
        let mut wire = segment.into_message().to_vec();
        wire[25] ^= 0x40;
        match TcpHeader::parse(wire.iter().copied(), SRC, DST) {
            Err(SegmentError::InvalidChecksum { .. }) => {}
            other => panic!("expected a checksum error, got {other:?}"),
        }
    }

    #[test]
    fn sack_blocks_round_trip() -> anyhow::Result<()> {
        let options = SegmentOptions {
            sack_blocks: vec![
                SackBlock { left: 100, right: 200 },
                SackBlock { left: 300, right: 400 },
            ],
            timestamps: None,
            ..Default::default()
        };
        let segment = TcpHeaderBuilder::new(9, 10, 11)
            .ack(12)
            .options(options.clone())
            .build(SRC, DST, Message::default());
        let wire = segment.into_message().to_vec();
        let (header, _) = TcpHeader::parse(wire.iter().copied(), SRC, DST)?;
        assert_eq!(header.options.sack_blocks, options.sack_blocks);
        Ok(())
    }

    #[test]
    fn truncated_header_is_too_short() {
        let segment = TcpHeaderBuilder::new(1, 2, 3).build(SRC, DST, Message::default());
        let wire = segment.into_message().to_vec();
        assert_eq!(
            TcpHeader::parse(wire[..10].iter().copied(), SRC, DST),
            Err(SegmentError::HeaderTooShort)
        );
    }
}
