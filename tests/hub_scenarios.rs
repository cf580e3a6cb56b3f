//! End-to-end hub scenarios: concurrent sleeps, a pipe echo, and a UDP
//! timeout-then-receive sequence, each driven through the public hub API
//! on a single `Hub` instance.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use taskhub::config::HubOpts;
use taskhub::err::Error;
use taskhub::hub::{self, Hub};

fn sockaddr_in(port: u16, addr: [u8; 4]) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr),
        },
        sin_zero: [0; 8],
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn concurrent_sleeps_all_complete_within_window() {
    init_logging();
    let mut hub = Hub::new(HubOpts::default()).unwrap();
    let completed = Rc::new(Cell::new(0u32));

    for ms in [10i64, 20, 10] {
        let completed = completed.clone();
        hub.spawn(move || {
            hub::sleep(ms);
            completed.set(completed.get() + 1);
        })
        .unwrap();
    }

    let start = Instant::now();
    hub.run().unwrap();
    let elapsed = start.elapsed().as_millis();

    assert_eq!(completed.get(), 3);
    assert!(elapsed >= 15, "completed too early: {elapsed}ms");
    assert!(elapsed <= 60, "completed suspiciously late: {elapsed}ms");
}

#[test]
fn pipe_echo_five_writes_then_eof() {
    let mut hub = Hub::new(HubOpts::default()).unwrap();
    let (rfd, wfd) = hub::pipe().unwrap();
    let reads: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let reads = reads.clone();
        hub.spawn(move || loop {
            let mut buf = [0u8; 16];
            let n = hub::read(rfd, &mut buf, -1).unwrap();
            if n == 0 {
                unsafe { libc::close(rfd) };
                break;
            }
            reads.borrow_mut().push(buf[..n].to_vec());
        })
        .unwrap();
    }

    hub.spawn(move || {
        for _ in 0..5 {
            hub::write_all(wfd, b"test", -1).unwrap();
            hub::sleep(10);
        }
        unsafe { libc::close(wfd) };
    })
    .unwrap();

    hub.run().unwrap();

    let reads = reads.borrow();
    assert_eq!(reads.len(), 5);
    assert!(reads.iter().all(|chunk| chunk == b"test"));
}

#[test]
fn udp_recvfrom_times_out_then_receives() {
    let mut hub = Hub::new(HubOpts::default()).unwrap();
    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));

    {
        let received = received.clone();
        hub.spawn(move || {
            let fd = hub::socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
            let addr = sockaddr_in(3334, [0, 0, 0, 0]);
            let rc = unsafe {
                libc::bind(
                    fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            assert_eq!(rc, 0);

            let mut buf = [0u8; 16];
            let err = hub::recvfrom(fd, &mut buf, 20).unwrap_err();
            assert!(matches!(err, Error::TimedOut));

            let (n, _from) = hub::recvfrom(fd, &mut buf, 30).unwrap();
            *received.borrow_mut() = Some(buf[..n].to_vec());
            unsafe { libc::close(fd) };
        })
        .unwrap();
    }

    hub.spawn(move || {
        hub::sleep(25);
        let fd = hub::socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        let addr = sockaddr_in(3334, [127, 0, 0, 1]);
        let sockaddr = unsafe { &*(&addr as *const _ as *const libc::sockaddr) };
        hub::sendto(fd, b"test", sockaddr, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t, -1).unwrap();
        unsafe { libc::close(fd) };
    })
    .unwrap();

    hub.run().unwrap();

    assert_eq!(received.borrow().as_deref(), Some(&b"test"[..]));
}
