//! Incremental, pull-based HTTP/1.x request/response/chunked-body scanner.
//!
//! Ported from the source's `http.c` state machine (`REQ`/`RES`/`FLD`/`CHK`
//! clusters). The source re-enters a `switch` mid-case so a short read can
//! resume exactly where it left off; here, since the caller always presents
//! the full unconsumed tail in one contiguous slice (the ring buffer's
//! job), each call re-attempts the current clause from its start and
//! reports zero bytes consumed when the slice doesn't yet hold a complete
//! token. The state machine only ever advances past bytes it has fully
//! accounted for.

use crate::config::{HttpOpts, HTTP_MAX_NO_PROGRESS_SCANS};
use crate::err::{Error, HttpError, Result};

use super::map::HeaderMap;

/// A byte offset/length pair into the slice passed to the most recent
/// [`Parser::next`] call. Never owns data; the caller's buffer must stay
/// alive and at the same offset until the range is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub off: usize,
    pub len: usize,
}

impl Range {
    fn new(off: usize, len: usize) -> Self {
        Range { off, len }
    }

    /// Resolves this range against the buffer it was produced from.
    pub fn get<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.off..self.off + self.len]
    }
}

/// One parse event, carrying ranges into the buffer given to the `next`
/// call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A complete request line.
    Request { method: Range, uri: Range, version: u8 },
    /// A complete response line.
    Response { status: u16, reason: Range, version: u8 },
    /// A header or trailer field, only yielded when the parser has no
    /// owned [`HeaderMap`] to collect into.
    Field { name: Range, value: Range },
    /// End of headers; framing has been resolved from scraped fields.
    BodyStart { content_length: usize, chunked: bool },
    /// A chunked-body chunk size line; the caller must itself consume
    /// exactly `length` raw bytes before calling `next` again.
    BodyChunk { length: usize },
    /// The terminal zero-size chunk was seen; trailers (if any) follow.
    BodyEnd,
    /// The message (and any trailers) is complete.
    TrailerEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cs {
    ReqLine,
    ResLine,
    Field,
    ChunkSize,
    ChunkCrlf,
    Done,
}

const FKEEPALIVE: u8 = 1 << 0;
const FCHUNKED: u8 = 1 << 1;

/// The incremental scanner. Construct with [`Parser::request`] or
/// [`Parser::response`].
pub struct Parser {
    cs: Cs,
    response: bool,
    flags: u8,
    trailers: bool,
    body_len: usize,
    cscans: u32,
    limits: HttpOpts,
    map: Option<HeaderMap>,
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
        )
}

fn find(buf: &[u8], byte: u8) -> Option<usize> {
    buf.iter().position(|&b| b == byte)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

impl Parser {
    fn new(response: bool, map: Option<HeaderMap>) -> Self {
        Parser {
            cs: if response { Cs::ResLine } else { Cs::ReqLine },
            response,
            flags: 0,
            trailers: false,
            body_len: 0,
            cscans: 0,
            limits: HttpOpts::default(),
            map,
        }
    }

    /// A parser for an incoming or outgoing request.
    pub fn request(map: Option<HeaderMap>) -> Self {
        Parser::new(false, map)
    }

    /// A parser for an incoming or outgoing response.
    pub fn response(map: Option<HeaderMap>) -> Self {
        Parser::new(true, map)
    }

    /// Overrides the default per-field size limits.
    pub fn with_limits(mut self, limits: HttpOpts) -> Self {
        self.limits = limits;
        self
    }

    pub fn is_response(&self) -> bool {
        self.response
    }

    pub fn is_done(&self) -> bool {
        self.cs == Cs::Done
    }

    pub fn keepalive(&self) -> bool {
        self.flags & FKEEPALIVE != 0
    }

    pub fn chunked(&self) -> bool {
        self.flags & FCHUNKED != 0
    }

    /// Returns the owned header map, if any, replacing it with `None`.
    pub fn take_map(&mut self) -> Option<HeaderMap> {
        self.map.take()
    }

    pub fn map(&self) -> Option<&HeaderMap> {
        self.map.as_ref()
    }

    pub fn map_mut(&mut self) -> Option<&mut HeaderMap> {
        self.map.as_mut()
    }

    /// Resets the parser to its initial state for the same direction
    /// (request/response), keeping configured limits, discarding any
    /// in-flight framing state, and clearing the header map if one is owned.
    pub fn reset(&mut self) {
        let limits = self.limits;
        let map = self.map.take().map(|mut m| {
            m.clear();
            m
        });
        *self = Parser::new(self.response, map);
        self.limits = limits;
    }

    /// Feeds `buf`, the full unconsumed tail of input, and returns the next
    /// event along with how many leading bytes of `buf` it accounted for —
    /// the caller must drop exactly that many bytes before the next call.
    /// Returns `Ok(None)` when `buf` doesn't yet hold a complete token.
    pub fn next(&mut self, buf: &[u8]) -> Result<Option<(Event, usize)>> {
        if self.cs == Cs::Done {
            return Err(Error::Http(HttpError::State));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let outcome = match self.cs {
            Cs::ReqLine => self.parse_request_line(buf)?,
            Cs::ResLine => self.parse_response_line(buf)?,
            Cs::Field => match self.parse_field(buf)? {
                Some(FieldOutcome::EndOfHeaders(consumed)) => {
                    let content_length = self.body_len;
                    let chunked = self.chunked();
                    let event = if self.trailers {
                        self.cs = Cs::Done;
                        Event::TrailerEnd
                    } else {
                        self.cs = if chunked { Cs::ChunkSize } else { Cs::Done };
                        Event::BodyStart { content_length, chunked }
                    };
                    Some((event, consumed))
                }
                Some(FieldOutcome::Field { name, value, consumed }) => {
                    if let Some(map) = self.map.as_mut() {
                        // Scraped straight into the map; no event this
                        // round, keep scanning the next field.
                        let name_s = std::str::from_utf8(name.get(buf))
                            .map_err(|_| Error::Http(HttpError::Syntax))?;
                        let value_s = std::str::from_utf8(value.get(buf))
                            .map_err(|_| Error::Http(HttpError::Syntax))?;
                        map.insert(name_s, value_s);
                        self.scrape(name.get(buf), value.get(buf))?;
                        self.cscans = 0;
                        return self.consume_and_continue(buf, consumed);
                    }
                    self.scrape(name.get(buf), value.get(buf))?;
                    Some((Event::Field { name, value }, consumed))
                }
                None => None,
            },
            Cs::ChunkSize => self.parse_chunk_size(buf)?,
            Cs::ChunkCrlf => self.parse_chunk_crlf(buf)?,
            Cs::Done => return Err(Error::Http(HttpError::State)),
        };

        match outcome {
            Some((event, consumed)) => {
                self.cscans = 0;
                Ok(Some((event, consumed)))
            }
            None => {
                self.cscans += 1;
                if self.cscans > HTTP_MAX_NO_PROGRESS_SCANS {
                    return Err(Error::Http(HttpError::TooShort));
                }
                Ok(None)
            }
        }
    }

    /// Helper for the "scraped silently, keep going" path: recurses with
    /// `buf` advanced by `consumed`, matching the source's `goto again`.
    fn consume_and_continue(&mut self, buf: &[u8], consumed: usize) -> Result<Option<(Event, usize)>> {
        match self.next(&buf[consumed..])? {
            Some((event, more)) => Ok(Some((event, consumed + more))),
            None => Ok(None),
        }
    }

    fn scrape(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        if self.trailers || self.body_len != 0 {
            return Ok(());
        }
        if name.eq_ignore_ascii_case(b"content-length") {
            if value.is_empty() {
                return Err(Error::Http(HttpError::Syntax));
            }
            let mut num: usize = 0;
            for &b in value {
                if !b.is_ascii_digit() {
                    return Err(Error::Http(HttpError::Syntax));
                }
                num = num * 10 + (b - b'0') as usize;
            }
            self.body_len = num;
        } else if name.eq_ignore_ascii_case(b"connection") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.flags |= FKEEPALIVE;
            } else if value.eq_ignore_ascii_case(b"close") {
                self.flags &= !FKEEPALIVE;
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") && value.eq_ignore_ascii_case(b"chunked") {
            self.flags |= FCHUNKED;
        }
        Ok(())
    }

    fn parse_request_line(&mut self, buf: &[u8]) -> Result<Option<(Event, usize)>> {
        let method_end = match find(buf, b' ') {
            Some(i) => i,
            None => {
                if buf.len() > self.limits.max_method as usize {
                    return Err(Error::Http(HttpError::Size));
                }
                return Ok(None);
            }
        };
        if method_end == 0 || method_end > self.limits.max_method as usize {
            return Err(Error::Http(if method_end == 0 {
                HttpError::Syntax
            } else {
                HttpError::Size
            }));
        }
        if !buf[..method_end].iter().all(|&b| is_tchar(b)) {
            return Err(Error::Http(HttpError::Syntax));
        }

        let uri_start = method_end + 1;
        let uri_rel_end = match find(&buf[uri_start..], b' ') {
            Some(i) => i,
            None => {
                if (buf.len() - uri_start) > self.limits.max_uri as usize {
                    return Err(Error::Http(HttpError::Size));
                }
                return Ok(None);
            }
        };
        let uri_end = uri_start + uri_rel_end;
        if uri_rel_end == 0 || uri_rel_end > self.limits.max_uri as usize {
            return Err(Error::Http(if uri_rel_end == 0 {
                HttpError::Syntax
            } else {
                HttpError::Size
            }));
        }
        if buf[uri_start..uri_end]
            .iter()
            .any(|&b| b < 0x21 || b == 0x7f)
        {
            return Err(Error::Http(HttpError::Syntax));
        }

        let ver_start = uri_end + 1;
        if buf.len() < ver_start + 10 {
            return Ok(None);
        }
        if &buf[ver_start..ver_start + 7] != b"HTTP/1." {
            return Err(Error::Http(HttpError::Syntax));
        }
        let digit = buf[ver_start + 7];
        if !digit.is_ascii_digit() {
            return Err(Error::Http(HttpError::Syntax));
        }
        if &buf[ver_start + 8..ver_start + 10] != b"\r\n" {
            return Err(Error::Http(HttpError::Syntax));
        }

        let version = digit - b'0';
        if version == 1 {
            self.flags |= FKEEPALIVE;
        }
        self.cs = Cs::Field;
        let event = Event::Request {
            method: Range::new(0, method_end),
            uri: Range::new(uri_start, uri_rel_end),
            version,
        };
        Ok(Some((event, ver_start + 10)))
    }

    fn parse_response_line(&mut self, buf: &[u8]) -> Result<Option<(Event, usize)>> {
        if buf.len() < 9 {
            return Ok(None);
        }
        if &buf[0..7] != b"HTTP/1." {
            return Err(Error::Http(HttpError::Syntax));
        }
        let digit = buf[7];
        if !digit.is_ascii_digit() {
            return Err(Error::Http(HttpError::Syntax));
        }
        if buf[8] != b' ' {
            return Err(Error::Http(HttpError::Syntax));
        }
        let version = digit - b'0';

        let code_start = 9;
        let mut i = code_start;
        let mut status: u32 = 0;
        while i < buf.len() && buf[i] != b' ' {
            if !buf[i].is_ascii_digit() {
                return Err(Error::Http(HttpError::Syntax));
            }
            status = status * 10 + (buf[i] - b'0') as u32;
            i += 1;
        }
        if i == buf.len() {
            return Ok(None);
        }
        let reason_start = i + 1;
        let reason_rel_end = match find_crlf(&buf[reason_start..]) {
            Some(i) => i,
            None => {
                if (buf.len() - reason_start) > self.limits.max_reason as usize {
                    return Err(Error::Http(HttpError::Size));
                }
                return Ok(None);
            }
        };
        if reason_rel_end > self.limits.max_reason as usize {
            return Err(Error::Http(HttpError::Size));
        }

        self.cs = Cs::Field;
        let event = Event::Response {
            status: status as u16,
            reason: Range::new(reason_start, reason_rel_end),
            version,
        };
        Ok(Some((event, reason_start + reason_rel_end + 2)))
    }

    fn parse_field(&mut self, buf: &[u8]) -> Result<Option<FieldOutcome>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if &buf[0..2] == b"\r\n" {
            return Ok(Some(FieldOutcome::EndOfHeaders(2)));
        }

        let name_end = match find(buf, b':') {
            Some(i) => i,
            None => {
                if buf.len() > self.limits.max_field as usize {
                    return Err(Error::Http(HttpError::Size));
                }
                return Ok(None);
            }
        };
        if name_end == 0 || name_end > self.limits.max_field as usize {
            return Err(Error::Http(if name_end == 0 {
                HttpError::Syntax
            } else {
                HttpError::Size
            }));
        }
        if !buf[..name_end].iter().all(|&b| is_tchar(b)) {
            return Err(Error::Http(HttpError::Syntax));
        }

        let mut value_start = name_end + 1;
        while value_start < buf.len() && (buf[value_start] == b' ' || buf[value_start] == b'\t') {
            value_start += 1;
        }
        if value_start >= buf.len() {
            return Ok(None);
        }

        let value_rel_end = match find_crlf(&buf[value_start..]) {
            Some(i) => i,
            None => {
                if (buf.len() - value_start) > self.limits.max_value as usize {
                    return Err(Error::Http(HttpError::Size));
                }
                return Ok(None);
            }
        };
        if value_rel_end > self.limits.max_value as usize {
            return Err(Error::Http(HttpError::Size));
        }
        let mut value_end = value_start + value_rel_end;
        while value_end > value_start && (buf[value_end - 1] == b' ' || buf[value_end - 1] == b'\t') {
            value_end -= 1;
        }

        let consumed = value_start + value_rel_end + 2;
        Ok(Some(FieldOutcome::Field {
            name: Range::new(0, name_end),
            value: Range::new(value_start, value_end - value_start),
            consumed,
        }))
    }

    fn parse_chunk_size(&mut self, buf: &[u8]) -> Result<Option<(Event, usize)>> {
        let mut i = 0;
        let mut len: usize = 0;
        while i < buf.len() && buf[i].is_ascii_hexdigit() {
            len = (len << 4) | (buf[i] as char).to_digit(16).unwrap() as usize;
            i += 1;
        }
        if i == 0 {
            if !buf.is_empty() && !buf[0].is_ascii_hexdigit() {
                return Err(Error::Http(HttpError::Syntax));
            }
            return Ok(None);
        }
        // Ignore chunk extensions (`;...`) up to the line terminator.
        let mut j = i;
        while j < buf.len() && buf[j] != b'\r' {
            j += 1;
        }
        if buf.len() < j + 2 {
            return Ok(None);
        }
        if &buf[j..j + 2] != b"\r\n" {
            return Err(Error::Http(HttpError::Syntax));
        }
        let consumed = j + 2;

        if len == 0 {
            self.trailers = true;
            self.cs = Cs::Field;
            Ok(Some((Event::BodyEnd, consumed)))
        } else {
            self.cs = Cs::ChunkCrlf;
            Ok(Some((Event::BodyChunk { length: len }, consumed)))
        }
    }

    fn parse_chunk_crlf(&mut self, buf: &[u8]) -> Result<Option<(Event, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if &buf[0..2] != b"\r\n" {
            return Err(Error::Http(HttpError::Syntax));
        }
        self.cs = Cs::ChunkSize;
        // No event of its own; immediately retry at ChunkSize with the
        // CRLF dropped, mirroring the source's `goto again`.
        match self.parse_chunk_size(&buf[2..])? {
            Some((event, more)) => Ok(Some((event, 2 + more))),
            None => Ok(None),
        }
    }
}

enum FieldOutcome {
    Field { name: Range, value: Range, consumed: usize },
    EndOfHeaders(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(input: &[u8], mut parser: Parser) -> Vec<Event> {
        let mut events = Vec::new();
        let mut buf = input.to_vec();
        let mut pos = 0;
        loop {
            match parser.next(&buf[pos..]).unwrap() {
                Some((event, consumed)) => {
                    events.push(event);
                    pos += consumed;
                    if parser.is_done() {
                        break;
                    }
                }
                None => break,
            }
        }
        events
    }

    #[test]
    fn parses_request_line_and_fields_whole() {
        let input = b"GET /p HTTP/1.1\r\nHost: x\r\n\r\n";
        let events = drive(input, Parser::request(None));
        assert_eq!(events.len(), 3);
        match events[0] {
            Event::Request { method, uri, version } => {
                assert_eq!(method.get(input), b"GET");
                assert_eq!(uri.get(input), b"/p");
                assert_eq!(version, 1);
            }
            _ => panic!("expected Request"),
        }
        match events[1] {
            Event::Field { name, value } => {
                assert_eq!(name.get(input), b"Host");
                assert_eq!(value.get(input), b"x");
            }
            _ => panic!("expected Field"),
        }
        assert!(matches!(
            events[2],
            Event::BodyStart { content_length: 0, chunked: false }
        ));
    }

    #[test]
    fn byte_at_a_time_chunked_request_matches_expected_sequence() {
        let input = b"GET /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n7\r\n World!\r\n0\r\n\r\n";
        let mut parser = Parser::request(None);
        let mut fed = Vec::new();
        let mut events = Vec::new();
        let mut consumed_total = 0;
        // Raw chunk-data bytes owed to the parser's "you skip the body"
        // contract, not yet available in `fed`.
        let mut pending_skip = 0usize;

        for &b in input {
            fed.push(b);
            loop {
                if pending_skip > 0 {
                    if fed.len() - consumed_total < pending_skip {
                        break;
                    }
                    consumed_total += pending_skip;
                    pending_skip = 0;
                    continue;
                }
                match parser.next(&fed[consumed_total..]).unwrap() {
                    Some((event, consumed)) => {
                        consumed_total += consumed;
                        if let Event::BodyChunk { length } = event {
                            pending_skip = length;
                        }
                        events.push(event);
                        if parser.is_done() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            if parser.is_done() {
                break;
            }
        }

        assert_eq!(events.len(), 7);
        assert!(matches!(events[0], Event::Request { .. }));
        assert!(matches!(events[1], Event::Field { .. }));
        assert!(matches!(events[2], Event::Field { .. }));
        assert!(matches!(
            events[3],
            Event::BodyStart { chunked: true, .. }
        ));
        assert!(matches!(events[4], Event::BodyChunk { length: 5 }));
        assert!(matches!(events[5], Event::BodyChunk { length: 7 }));
        assert!(matches!(events[6], Event::TrailerEnd) || matches!(events[6], Event::BodyEnd));
    }

    #[test]
    fn header_map_collection_scrapes_silently() {
        let input = b"GET / HTTP/1.1\r\nHost: x\r\nX-A: 1\r\nX-A: 2\r\n\r\n";
        let mut parser = Parser::request(Some(HeaderMap::new()));
        let mut pos = 0;
        let mut saw_request = false;
        let mut saw_body_start = false;
        loop {
            match parser.next(&input[pos..]).unwrap() {
                Some((event, consumed)) => {
                    pos += consumed;
                    match event {
                        Event::Request { .. } => saw_request = true,
                        Event::Field { .. } => panic!("fields should be scraped, not yielded"),
                        Event::BodyStart { .. } => saw_body_start = true,
                        _ => {}
                    }
                    if parser.is_done() {
                        break;
                    }
                }
                None => break,
            }
        }
        assert!(saw_request);
        assert!(saw_body_start);
        let map = parser.map_mut().unwrap();
        assert_eq!(map.get("x-a"), Some(&[Box::from("1"), Box::from("2")][..]));
        assert_eq!(map.get("host"), Some(&[Box::from("x")][..]));
    }

    #[test]
    fn content_length_is_scraped_into_body_start() {
        let input = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let mut parser = Parser::request(None);
        let mut pos = 0;
        let mut body_start = None;
        loop {
            match parser.next(&input[pos..]).unwrap() {
                Some((event, consumed)) => {
                    pos += consumed;
                    if let Event::BodyStart { content_length, chunked } = event {
                        body_start = Some((content_length, chunked));
                    }
                    if parser.is_done() {
                        break;
                    }
                }
                None => break,
            }
        }
        assert_eq!(body_start, Some((4, false)));
    }

    #[test]
    fn oversized_method_is_rejected() {
        let mut method = vec![b'A'; 64];
        method.push(b' ');
        method.extend_from_slice(b"/ HTTP/1.1\r\n\r\n");
        let mut parser = Parser::request(None);
        let err = parser.next(&method).unwrap_err();
        assert!(matches!(err, Error::Http(HttpError::Size)));
    }

    #[test]
    fn malformed_version_is_syntax_error() {
        let input = b"GET / HTTP/x.1\r\n\r\n";
        let mut parser = Parser::request(None);
        let err = parser.next(input).unwrap_err();
        assert!(matches!(err, Error::Http(HttpError::Syntax)));
    }
}
