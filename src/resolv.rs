//! Stateless DNS resolver over a pool of UDP sockets, ported from the
//! source's `resolv.c`.
//!
//! Each call builds a fresh type-`ANY` query, sends it to a configured
//! server (optionally rotating), and retries up to a configured attempt
//! count on timeout. `CNAME` answers recurse; `SRV` answers resolve their
//! target and graft priority/weight/port onto the result, then the whole
//! set sorts by priority.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ResolverOpts;
use crate::dns::{Item, Packet, RData, RecordType, Section};
use crate::err::{Error, Result};
use crate::hub;

const MAX_UDP: usize = 4096;

/// One resolved endpoint, with whatever `SRV`/TTL provenance applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRecord {
    pub addr: IpAddr,
    pub port: u16,
    pub ttl: i32,
    pub priority: u16,
    pub weight: u16,
}

fn bad(msg: &str) -> Error {
    Error::Addr(msg.to_string())
}

fn seed_from_env() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let pid = std::process::id();
    nanos ^ pid.wrapping_mul(0x9E3779B9)
}

/// A minimal splitmix-style step, just enough to spread 16-bit query ids
/// across calls without pulling in a `rand` dependency for one counter.
fn next_seed(seed: u32) -> u32 {
    let mut x = seed;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

fn sockaddr_of(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: 0,
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// A resolver bound to a fixed list of upstream servers.
pub struct Resolver {
    opts: ResolverOpts,
    servers: Vec<SocketAddr>,
    hostpos: Cell<usize>,
    fdpool: RefCell<Vec<RawFd>>,
    seed: Cell<u32>,
}

impl Resolver {
    /// Builds a resolver over `servers` (must be non-empty, and of a single
    /// address family, matching the fd pool's reuse assumption).
    pub fn new(servers: Vec<SocketAddr>, opts: ResolverOpts) -> Result<Self> {
        if servers.is_empty() {
            return Err(bad("no dns servers configured"));
        }
        Ok(Resolver {
            opts,
            servers,
            hostpos: Cell::new(0),
            fdpool: RefCell::new(Vec::new()),
            seed: Cell::new(seed_from_env()),
        })
    }

    fn next_id(&self) -> u16 {
        let seed = next_seed(self.seed.get());
        self.seed.set(seed);
        seed as u16
    }

    fn next_server(&self) -> SocketAddr {
        let pos = self.hostpos.get();
        let server = self.servers[pos];
        if self.opts.rotate {
            self.hostpos.set((pos + 1) % self.servers.len());
        }
        server
    }

    fn take_fd(&self) -> Result<RawFd> {
        if let Some(fd) = self.fdpool.borrow_mut().pop() {
            return Ok(fd);
        }
        let domain = if self.servers[0].is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        hub::socket(domain, libc::SOCK_DGRAM, 0)
    }

    fn give_fd(&self, fd: RawFd) {
        self.fdpool.borrow_mut().push(fd);
    }

    /// Resolves `name`, recursing through `CNAME`/`SRV` indirections up to
    /// `ResolverOpts::max_srv_depth`.
    pub fn resolve(&self, name: &str) -> Result<Vec<ResolvedRecord>> {
        self.resolve_depth(name, 0)
    }

    fn resolve_depth(&self, name: &str, depth: u32) -> Result<Vec<ResolvedRecord>> {
        if depth > self.opts.max_srv_depth {
            return Err(bad("srv/cname recursion exceeded configured depth"));
        }

        let id = self.next_id();
        let mut query = Packet::new_query(id);
        query.add_question(name, RecordType::ANY)?;
        if self.opts.edns0_udp_max > 0 {
            query.add_opt(self.opts.edns0_udp_max)?;
        }
        let out = query.as_bytes().to_vec();

        let fd = self.take_fd()?;
        let outcome = self.send_with_retries(fd, &out, id, name);
        self.give_fd(fd);

        let response = outcome?;
        self.translate(&response, depth)
    }

    fn send_with_retries(&self, fd: RawFd, out: &[u8], id: u16, name: &str) -> Result<Vec<u8>> {
        let mut last_err = Error::TimedOut;
        for attempt in 0..self.opts.attempts {
            let server = self.next_server();
            log::debug!("resolving {name} via {server} (attempt {}/{})", attempt + 1, self.opts.attempts);

            let (addr, addrlen) = sockaddr_of(server);
            let sockaddr = unsafe { &*(&addr as *const _ as *const libc::sockaddr) };
            if let Err(e) = hub::sendto(fd, out, sockaddr, addrlen, self.opts.timeout_ms) {
                last_err = e;
                break;
            }

            let mut buf = vec![0u8; MAX_UDP];
            match hub::recvfrom(fd, &mut buf, self.opts.timeout_ms) {
                Ok((n, _from)) => {
                    buf.truncate(n);
                    let reply_id = buf.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]]));
                    if reply_id != Some(id) {
                        log::debug!("resolve for {name}: stale reply id, retrying");
                        continue;
                    }
                    return Ok(buf);
                }
                Err(e) if matches!(e, Error::TimedOut) => {
                    log::debug!("resolve attempt {} for {name} timed out", attempt + 1);
                    last_err = e;
                    continue;
                }
                Err(e) => {
                    last_err = e;
                    break;
                }
            }
        }
        Err(last_err)
    }

    fn translate(&self, buf: &[u8], depth: u32) -> Result<Vec<ResolvedRecord>> {
        let packet = Packet::decode(buf)?;
        let mut out = Vec::new();
        let mut needs_sort = false;

        for item in packet.iter() {
            let (section, item) = item?;
            if section != Section::Answer {
                continue;
            }
            let Item::Record(record) = item else { continue };

            match record.rdata {
                RData::A(addr) => out.push(ResolvedRecord {
                    addr: IpAddr::V4(addr),
                    port: 0,
                    ttl: record.ttl,
                    priority: 0,
                    weight: 0,
                }),
                RData::Aaaa(addr) => out.push(ResolvedRecord {
                    addr: IpAddr::V6(addr),
                    port: 0,
                    ttl: record.ttl,
                    priority: 0,
                    weight: 0,
                }),
                RData::Cname(ref target) => {
                    out.extend(self.resolve_depth(target, depth + 1)?);
                }
                RData::Srv { priority, weight, port, ref target } => {
                    let targets = self.resolve_depth(target, depth + 1)?;
                    for mut r in targets {
                        r.port = port;
                        r.priority = priority;
                        r.weight = weight;
                        if r.ttl > record.ttl {
                            r.ttl = record.ttl;
                        }
                        out.push(r);
                    }
                    needs_sort = true;
                }
                _ => {}
            }
        }

        if needs_sort {
            out.sort_by_key(|r| r.priority);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_server_list() {
        assert!(Resolver::new(Vec::new(), ResolverOpts::default()).is_err());
    }

    #[test]
    fn seed_stepping_is_deterministic_and_varies() {
        let a = next_seed(12345);
        let b = next_seed(a);
        assert_ne!(a, b);
        assert_eq!(a, next_seed(12345));
    }
}
