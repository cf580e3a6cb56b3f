//! RFC-1035 message encode/decode: header, question section, and an
//! iterator over the answer/authority/additional resource records.
//!
//! Ported from the source's `dns.c`/`dns.h`. Only the record types the
//! resolver actually consumes (`A`, `AAAA`, `CNAME`, `SRV`) get a typed
//! [`RData`] variant; everything else (including `OPT`, handled specially
//! for its UDP-size field) comes back as an opaque byte range. Name
//! compression pointers are followed on decode; encoding never emits them,
//! matching the source's `xdns_encode_name`, which only ever writes
//! uncompressed labels.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::err::{Error, Result};

/// A DNS resource record type code. Named constants cover what the
/// resolver and cache handle; anything else round-trips through its raw
/// `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: RecordType = RecordType(1);
    pub const NS: RecordType = RecordType(2);
    pub const CNAME: RecordType = RecordType(5);
    pub const SOA: RecordType = RecordType(6);
    pub const PTR: RecordType = RecordType(12);
    pub const MX: RecordType = RecordType(15);
    pub const TXT: RecordType = RecordType(16);
    pub const AAAA: RecordType = RecordType(28);
    pub const SRV: RecordType = RecordType(33);
    pub const OPT: RecordType = RecordType(41);
    pub const ANY: RecordType = RecordType(255);
}

/// Record class; only `IN` is meaningful here but the raw value round-trips.
pub const CLASS_IN: u16 = 1;

fn syntax() -> Error {
    Error::Addr("malformed dns packet".into())
}

fn u16_be(buf: &[u8], pos: usize) -> Result<u16> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(syntax)
}

fn u32_be(buf: &[u8], pos: usize) -> Result<u32> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(syntax)
}

fn put_u16_be(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_be_bytes());
}

/// The 12-byte fixed header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

fn decode_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < 12 {
        return Err(syntax());
    }
    let flags1 = buf[2];
    let flags2 = buf[3];
    Ok(Header {
        id: u16_be(buf, 0)?,
        qr: flags1 & 0x80 != 0,
        opcode: (flags1 >> 3) & 0x0f,
        aa: flags1 & 0x04 != 0,
        tc: flags1 & 0x02 != 0,
        rd: flags1 & 0x01 != 0,
        ra: flags2 & 0x80 != 0,
        rcode: flags2 & 0x0f,
        qdcount: u16_be(buf, 4)?,
        ancount: u16_be(buf, 6)?,
        nscount: u16_be(buf, 8)?,
        arcount: u16_be(buf, 10)?,
    })
}

fn encode_name(out: &mut Vec<u8>, name: &str) -> Result<()> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        out.push(0);
        return Ok(());
    }
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(syntax());
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Decodes a (possibly compressed) name starting at `pos`. Returns the
/// name, always with a trailing `.` (or exactly `.` for the root), and the
/// position in `buf` immediately following the name *as encoded at `pos`*
/// (a followed compression pointer does not advance the caller's cursor
/// past where the pointer itself ended).
fn decode_name(buf: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut jumped = false;
    let mut resume = 0usize;
    let mut hops = 0;

    loop {
        hops += 1;
        if hops > 128 {
            return Err(syntax());
        }
        let b = *buf.get(pos).ok_or_else(syntax)?;
        match b >> 6 {
            0 => {
                let len = b as usize;
                pos += 1;
                if len == 0 {
                    if name.is_empty() {
                        name.push('.');
                    }
                    break;
                }
                if pos + len > buf.len() || name.len() + len + 1 > 255 {
                    return Err(syntax());
                }
                name.push_str(std::str::from_utf8(&buf[pos..pos + len]).map_err(|_| syntax())?);
                name.push('.');
                pos += len;
            }
            3 => {
                let lo = *buf.get(pos + 1).ok_or_else(syntax)?;
                if !jumped {
                    resume = pos + 2;
                }
                jumped = true;
                pos = (((b as usize) & 0x3f) << 8) | lo as usize;
            }
            _ => return Err(syntax()),
        }
    }

    Ok((name, if jumped { resume } else { pos }))
}

/// A question-section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

/// Decoded resource record data. `Other` carries the raw RDATA for any
/// type this crate doesn't need to interpret.
#[derive(Debug, Clone, PartialEq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Srv { priority: u16, weight: u16, port: u16, target: String },
    /// The EDNS0 OPT pseudo-record's advertised UDP payload size.
    Opt { udp_max: u16 },
    Other(Vec<u8>),
}

/// A decoded answer/authority/additional record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: i32,
    pub rdata: RData,
}

fn decode_rdata(buf: &[u8], rtype: RecordType, class: u16, start: usize, rdlength: usize) -> Result<RData> {
    let end = start + rdlength;
    if end > buf.len() {
        return Err(syntax());
    }
    Ok(match rtype {
        RecordType::A => {
            if rdlength != 4 {
                return Err(syntax());
            }
            RData::A(Ipv4Addr::new(buf[start], buf[start + 1], buf[start + 2], buf[start + 3]))
        }
        RecordType::AAAA => {
            if rdlength != 16 {
                return Err(syntax());
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[start..end]);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::CNAME => {
            let (name, pos) = decode_name(buf, start)?;
            if pos > end {
                return Err(syntax());
            }
            RData::Cname(name)
        }
        RecordType::SRV => {
            if rdlength < 6 {
                return Err(syntax());
            }
            let priority = u16_be(buf, start)?;
            let weight = u16_be(buf, start + 2)?;
            let port = u16_be(buf, start + 4)?;
            let (target, pos) = decode_name(buf, start + 6)?;
            if pos > end {
                return Err(syntax());
            }
            RData::Srv { priority, weight, port, target }
        }
        RecordType::OPT => RData::Opt { udp_max: class },
        _ => RData::Other(buf[start..end].to_vec()),
    })
}

/// Which section a decoded item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Question,
    Answer,
    Authority,
    Additional,
}

/// One entry yielded by [`Packet::iter`].
#[derive(Debug, Clone)]
pub enum Item {
    Question(Question),
    Record(Record),
}

/// A DNS message: either built up for sending or loaded from the wire.
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// A fresh query packet with recursion desired, no questions yet.
    pub fn new_query(id: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        put_u16_be(&mut buf, id);
        buf.push(0x01); // RD
        buf.push(0x00);
        put_u16_be(&mut buf, 0); // qdcount
        put_u16_be(&mut buf, 0); // ancount
        put_u16_be(&mut buf, 0); // nscount
        put_u16_be(&mut buf, 0); // arcount
        Packet { buf }
    }

    /// Wraps a received datagram for decoding. Only validates header length;
    /// malformed sections surface as errors from [`Packet::iter`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(syntax());
        }
        Ok(Packet { buf: bytes.to_vec() })
    }

    pub fn header(&self) -> Header {
        decode_header(&self.buf).expect("header validated at construction")
    }

    pub fn id(&self) -> u16 {
        self.header().id
    }

    fn bump_count(&mut self, offset: usize) {
        let count = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]);
        let bytes = (count + 1).to_be_bytes();
        self.buf[offset] = bytes[0];
        self.buf[offset + 1] = bytes[1];
    }

    /// Appends a question. Must be called before any answer records would
    /// exist (there never are any on a packet this type builds).
    pub fn add_question(&mut self, host: &str, qtype: RecordType) -> Result<()> {
        encode_name(&mut self.buf, host)?;
        put_u16_be(&mut self.buf, qtype.0);
        put_u16_be(&mut self.buf, CLASS_IN);
        self.bump_count(4);
        Ok(())
    }

    /// Appends an EDNS0 OPT pseudo-record advertising `udp_max` as the
    /// receiver's accepted UDP payload size.
    pub fn add_opt(&mut self, udp_max: u16) -> Result<()> {
        self.buf.push(0); // root name
        put_u16_be(&mut self.buf, RecordType::OPT.0);
        put_u16_be(&mut self.buf, udp_max);
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // ext_rcode/version/flags
        put_u16_be(&mut self.buf, 0); // rdlength
        self.bump_count(10);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Iterates every question then every answer/authority/additional
    /// record, in wire order.
    pub fn iter(&self) -> RecordIter<'_> {
        let header = self.header();
        RecordIter {
            buf: &self.buf,
            header,
            pos: 12,
            section: Section::Question,
            at: 0,
        }
    }
}

/// Iterator over a packet's question and resource-record sections.
pub struct RecordIter<'a> {
    buf: &'a [u8],
    header: Header,
    pos: usize,
    section: Section,
    at: u16,
}

impl RecordIter<'_> {
    fn section_count(&self) -> u16 {
        match self.section {
            Section::Question => self.header.qdcount,
            Section::Answer => self.header.ancount,
            Section::Authority => self.header.nscount,
            Section::Additional => self.header.arcount,
        }
    }

    fn advance_section(&mut self) -> bool {
        self.section = match self.section {
            Section::Question => Section::Answer,
            Section::Answer => Section::Authority,
            Section::Authority => Section::Additional,
            Section::Additional => return false,
        };
        self.at = 0;
        true
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<(Section, Item)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.at >= self.section_count() {
                if !self.advance_section() {
                    return None;
                }
                continue;
            }

            let section = self.section;
            let result = (|| -> Result<(Item, usize)> {
                let (name, mut pos) = decode_name(self.buf, self.pos)?;
                if section == Section::Question {
                    let qtype = RecordType(u16_be(self.buf, pos)?);
                    let qclass = u16_be(self.buf, pos + 2)?;
                    pos += 4;
                    Ok((Item::Question(Question { name, qtype, qclass }), pos))
                } else {
                    let rtype = RecordType(u16_be(self.buf, pos)?);
                    let class = u16_be(self.buf, pos + 2)?;
                    let ttl = u32_be(self.buf, pos + 4)? as i32;
                    let rdlength = u16_be(self.buf, pos + 8)? as usize;
                    pos += 10;
                    let rdata = decode_rdata(self.buf, rtype, class, pos, rdlength)?;
                    pos += rdlength;
                    Ok((Item::Record(Record { name, rtype, class, ttl, rdata }), pos))
                }
            })();

            self.at += 1;
            return Some(match result {
                Ok((item, pos)) => {
                    self.pos = pos;
                    Ok((section, item))
                }
                Err(e) => Err(e),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips_through_decode() {
        let mut p = Packet::new_query(0x1234);
        p.add_question("example.com", RecordType::ANY).unwrap();
        let bytes = p.as_bytes().to_vec();

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.id(), 0x1234);
        assert_eq!(decoded.header().qdcount, 1);

        let mut items = decoded.iter();
        match items.next().unwrap().unwrap() {
            (Section::Question, Item::Question(q)) => {
                assert_eq!(q.name, "example.com.");
                assert_eq!(q.qtype, RecordType::ANY);
            }
            _ => panic!("expected question"),
        }
        assert!(items.next().is_none());
    }

    #[test]
    fn compressed_name_pointer_is_followed() {
        // Header (12) + "example.com" question (name 13 bytes + 4) + an
        // answer whose name is a pointer back to offset 12.
        let mut p = Packet::new_query(1);
        p.add_question("example.com", RecordType::A).unwrap();
        let mut bytes = p.as_bytes().to_vec();

        // Hand-append one A record with a compressed name pointing at 12.
        bytes.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12
        bytes.extend_from_slice(&RecordType::A.0.to_be_bytes());
        bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
        bytes.extend_from_slice(&300i32.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[93, 184, 216, 34]);
        bytes[6] = 0;
        bytes[7] = 1; // ancount = 1

        let decoded = Packet::decode(&bytes).unwrap();
        let items: Vec<_> = decoded.iter().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(items.len(), 2);
        match &items[1] {
            (Section::Answer, Item::Record(r)) => {
                assert_eq!(r.name, "example.com.");
                assert_eq!(r.rdata, RData::A(Ipv4Addr::new(93, 184, 216, 34)));
                assert_eq!(r.ttl, 300);
            }
            _ => panic!("expected answer record"),
        }
    }
}
