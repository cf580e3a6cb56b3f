//! Drives the HTTP parser one byte at a time over a chunked request and
//! checks the exact event sequence it produces.

use taskhub::http::{Event, Parser};

/// A copy of [`Event`] with its buffer ranges already resolved to owned
/// bytes, so the sequence can be compared independently of which byte
/// offsets happened to hold each token during incremental parsing.
#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Request { method: Vec<u8>, uri: Vec<u8>, version: u8 },
    Field { name: Vec<u8>, value: Vec<u8> },
    BodyStart { content_length: usize, chunked: bool },
    BodyChunk { length: usize },
    BodyEnd,
    TrailerEnd,
}

fn resolve(event: Event, buf: &[u8]) -> Seen {
    match event {
        Event::Request { method, uri, version } => Seen::Request {
            method: method.get(buf).to_vec(),
            uri: uri.get(buf).to_vec(),
            version,
        },
        Event::Response { .. } => unreachable!("request parser never emits a response event"),
        Event::Field { name, value } => Seen::Field {
            name: name.get(buf).to_vec(),
            value: value.get(buf).to_vec(),
        },
        Event::BodyStart { content_length, chunked } => Seen::BodyStart { content_length, chunked },
        Event::BodyChunk { length } => Seen::BodyChunk { length },
        Event::BodyEnd => Seen::BodyEnd,
        Event::TrailerEnd => Seen::TrailerEnd,
    }
}

#[test]
fn byte_at_a_time_chunked_request() {
    let input = b"GET /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n7\r\n World!\r\n0\r\n\r\n";

    let mut parser = Parser::request(None);
    let mut buf: Vec<u8> = Vec::new();
    let mut events = Vec::new();
    // Raw chunk-data bytes the driver owes the parser before the next
    // `next()` call, per `BodyChunk`'s "caller must itself consume exactly
    // `length` raw bytes" contract.
    let mut pending_skip = 0usize;

    for &byte in input {
        buf.push(byte);
        loop {
            if pending_skip > 0 {
                if buf.len() < pending_skip {
                    break;
                }
                buf.drain(..pending_skip);
                pending_skip = 0;
                continue;
            }
            match parser.next(&buf).unwrap() {
                Some((event, consumed)) => {
                    if let Event::BodyChunk { length } = event {
                        pending_skip = length;
                    }
                    events.push(resolve(event, &buf));
                    buf.drain(..consumed);
                }
                None => break,
            }
        }
    }

    assert_eq!(
        events,
        vec![
            Seen::Request { method: b"GET".to_vec(), uri: b"/p".to_vec(), version: 1 },
            Seen::Field { name: b"Host".to_vec(), value: b"x".to_vec() },
            Seen::Field { name: b"Transfer-Encoding".to_vec(), value: b"chunked".to_vec() },
            Seen::BodyStart { content_length: 0, chunked: true },
            Seen::BodyChunk { length: 5 },
            Seen::BodyChunk { length: 7 },
            Seen::TrailerEnd,
        ]
    );
}
