//! TTL-bounded record cache keyed by `(name, type)`.
//!
//! Grounded in the source's `dnsc.c`: entries are the parsed RDATA plus an
//! insertion timestamp and the TTL seen on the wire. A lookup that finds an
//! expired entry removes it on the spot rather than waiting for a sweep,
//! matching `xdns_cache_get`'s inline `entry_expired` check.

use crate::clock::Clock;
use crate::err::Result;
use crate::hash::HashMap;

use super::packet::{Item, Packet, RData, RecordType, Section};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    name: Box<str>,
    rtype: RecordType,
}

struct Entry {
    rdata: RData,
    ttl: i32,
    inserted_at: i64,
}

fn expired(entry: &Entry, now_secs: i64) -> bool {
    entry.inserted_at + entry.ttl as i64 <= now_secs
}

fn now_secs() -> Result<i64> {
    Ok(Clock::real()?.as_msec() / 1000)
}

/// Record types the cache stores; anything else (seen while walking a
/// response's sections) is skipped, mirroring `xdns_res_copy`'s `ENOTSUP`
/// path for RDATA shapes it doesn't know how to keep.
fn supported(rtype: RecordType) -> bool {
    matches!(rtype, RecordType::A | RecordType::AAAA | RecordType::CNAME | RecordType::SRV)
}

/// A cache of resolved DNS records, keyed by name and record type.
pub struct Cache {
    entries: HashMap<Key, Entry>,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            entries: HashMap::with_capacity(64),
        }
    }

    /// Returns the cached record data for `(name, rtype)`, or `None` if
    /// absent or expired. An expired hit is evicted before returning `None`.
    pub fn get(&mut self, name: &str, rtype: RecordType) -> Result<Option<RData>> {
        let key = Key { name: name.to_ascii_lowercase().into_boxed_str(), rtype };
        let now = now_secs()?;
        let hit = self.entries.get(&key).map(|e| expired(e, now));
        Ok(match hit {
            Some(true) => {
                self.entries.remove(&key);
                None
            }
            Some(false) => self.entries.get(&key).map(|e| e.rdata.clone()),
            None => None,
        })
    }

    /// Walks every section of a decoded response packet and upserts every
    /// record of a supported type, overwriting any prior entry for the same
    /// `(name, type)`.
    pub fn insert_response(&mut self, packet: &Packet) -> Result<usize> {
        let now = now_secs()?;
        let mut stored = 0;
        for item in packet.iter() {
            let (section, item) = item?;
            if section == Section::Question {
                continue;
            }
            let Item::Record(record) = item else { continue };
            if !supported(record.rtype) {
                continue;
            }
            let key = Key {
                name: record.name.to_ascii_lowercase().into_boxed_str(),
                rtype: record.rtype,
            };
            self.entries.insert(
                key,
                Entry {
                    rdata: record.rdata,
                    ttl: record.ttl,
                    inserted_at: now,
                },
            );
            stored += 1;
        }
        Ok(stored)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Cache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::packet::{Packet, RecordType};
    use std::net::Ipv4Addr;

    fn response_with_a_record(name: &str, ttl: i32, addr: Ipv4Addr) -> Packet {
        let mut p = Packet::new_query(1);
        p.add_question(name, RecordType::A).unwrap();
        let mut bytes = p.as_bytes().to_vec();
        bytes.extend_from_slice(&[0xC0, 0x0C]);
        bytes.extend_from_slice(&RecordType::A.0.to_be_bytes());
        bytes.extend_from_slice(&super::super::packet::CLASS_IN.to_be_bytes());
        bytes.extend_from_slice(&ttl.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&addr.octets());
        bytes[7] = 1; // ancount
        Packet::decode(&bytes).unwrap()
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut cache = Cache::new();
        let pkt = response_with_a_record("example.com", 300, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(cache.insert_response(&pkt).unwrap(), 1);

        let got = cache.get("example.com.", RecordType::A).unwrap();
        assert_eq!(got, Some(RData::A(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut cache = Cache::new();
        let pkt = response_with_a_record("Example.COM", 300, Ipv4Addr::new(5, 6, 7, 8));
        cache.insert_response(&pkt).unwrap();
        assert!(cache.get("example.com.", RecordType::A).unwrap().is_some());
    }

    #[test]
    fn expired_entry_is_evicted_on_lookup() {
        let mut cache = Cache::new();
        let pkt = response_with_a_record("example.com", -1, Ipv4Addr::new(1, 1, 1, 1));
        cache.insert_response(&pkt).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("example.com.", RecordType::A).unwrap(), None);
        assert_eq!(cache.len(), 0);
    }
}
