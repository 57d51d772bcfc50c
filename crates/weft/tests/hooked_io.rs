//! Hooked socket I/O, end to end: timeouts, retries and pass-through

use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libc::{c_int, c_void, socklen_t};
use weft::{fd_manager, hook, IoEvent, IoManager};

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn socketpair() -> (c_int, c_int) {
    let mut fds = [0 as c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn recv_timeout_cancels_after_deadline() {
    let iom = IoManager::new(1, false, "e2e_rcvto").unwrap();
    let (a, b) = socketpair();

    let result = Arc::new(Mutex::new(None::<(isize, i32, Duration)>));
    let out = result.clone();
    iom.schedule(move || {
        // Adopt the descriptor; this also makes it kernel-nonblocking
        fd_manager().get(a, true).unwrap();

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 50_000,
        };
        let rc = hook::setsockopt(
            a,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const c_void,
            std::mem::size_of::<libc::timeval>() as socklen_t,
        );
        assert_eq!(rc, 0);

        let mut buf = [0u8; 16];
        let start = Instant::now();
        let n = hook::recv(a, &mut buf, 0);
        *out.lock().unwrap() = Some((n, last_errno(), start.elapsed()));
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        result.lock().unwrap().is_some()
    }));
    iom.stop();

    let (n, err, elapsed) = result.lock().unwrap().unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(1000), "{:?}", elapsed);

    fd_manager().del(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn recv_resumes_when_data_arrives() {
    let iom = IoManager::new(1, false, "e2e_recv").unwrap();
    let (a, b) = socketpair();

    let result = Arc::new(Mutex::new(None::<Vec<u8>>));
    let out = result.clone();
    iom.schedule(move || {
        fd_manager().get(a, true).unwrap();
        let mut buf = [0u8; 16];
        // No deadline set: parks until the peer writes
        let n = hook::recv(a, &mut buf, 0);
        assert!(n > 0);
        *out.lock().unwrap() = Some(buf[..n as usize].to_vec());
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert!(result.lock().unwrap().is_none());
    let n = unsafe { libc::write(b, b"hello".as_ptr() as *const c_void, 5) };
    assert_eq!(n, 5);

    assert!(wait_until(Duration::from_secs(5), || {
        result.lock().unwrap().is_some()
    }));
    iom.stop();

    assert_eq!(result.lock().unwrap().as_deref(), Some(&b"hello"[..]));
    fd_manager().del(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn hooked_read_matches_blocking_semantics() {
    // Round-trip law: the hooked read returns the same bytes the plain
    // blocking read would, modulo scheduling delay.
    let iom = IoManager::new(1, false, "e2e_echo").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    let server_fd = server.into_raw_fd();

    let result = Arc::new(Mutex::new(None::<Vec<u8>>));
    let out = result.clone();
    iom.schedule(move || {
        fd_manager().get(server_fd, true).unwrap();
        let mut buf = [0u8; 32];
        let n = hook::read(server_fd, &mut buf);
        assert_eq!(n, 12);
        let echoed = hook::write(server_fd, &buf[..n as usize]);
        assert_eq!(echoed, 12);
        *out.lock().unwrap() = Some(buf[..n as usize].to_vec());
    })
    .unwrap();

    use std::io::{Read, Write};
    let mut client = client;
    std::thread::sleep(Duration::from_millis(20));
    client.write_all(b"weft-payload").unwrap();

    let mut echo = [0u8; 12];
    client.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"weft-payload");

    assert!(wait_until(Duration::from_secs(5), || {
        result.lock().unwrap().is_some()
    }));
    iom.stop();
    assert_eq!(result.lock().unwrap().as_deref(), Some(&b"weft-payload"[..]));

    fd_manager().del(server_fd);
    unsafe {
        libc::close(server_fd);
    }
}

#[test]
fn connect_timeout_to_blackhole() {
    let iom = IoManager::new(1, false, "e2e_connto").unwrap();

    let result = Arc::new(Mutex::new(None::<(c_int, i32, Duration, c_int)>));
    let out = result.clone();
    iom.schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // RFC 5737-adjacent black hole: packets go nowhere
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 80u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([10, 255, 255, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };

        let start = Instant::now();
        let rc = hook::connect_with_timeout(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            100,
        );
        let err = last_errno();
        let elapsed = start.elapsed();

        // The descriptor must still be valid and closable afterwards
        let close_rc = hook::close(fd);
        *out.lock().unwrap() = Some((rc, err, elapsed, close_rc));
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        result.lock().unwrap().is_some()
    }));
    iom.stop();

    let (rc, err, elapsed, close_rc) = result.lock().unwrap().unwrap();
    assert_eq!(rc, -1);
    assert_eq!(close_rc, 0);
    if err == libc::ETIMEDOUT {
        assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(3000), "{:?}", elapsed);
    } else {
        // Sandboxed environments reject unroutable targets outright
        // instead of dropping packets; the timeout path never engages.
        assert!(
            err == libc::ENETUNREACH || err == libc::EHOSTUNREACH || err == libc::ECONNREFUSED,
            "unexpected errno {}",
            err
        );
    }
}

#[test]
fn connect_does_not_report_success_when_registration_fails() {
    weft::trace::set_log_level(weft::LogLevel::Off);
    let iom = IoManager::new(1, false, "e2e_conndup").unwrap();

    let result = Arc::new(Mutex::new(None::<c_int>));
    let out = result.clone();
    iom.schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // Occupy the WRITE slot so the connect path cannot register it
        let iomc = IoManager::current().unwrap();
        iomc.add_event_cb(fd, IoEvent::Write, || {}).unwrap();

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 80u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([10, 255, 255, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };

        // EINPROGRESS + a taken WRITE slot must come back as a failure,
        // never as a completed connect; a refused route fails here too.
        let rc = hook::connect_with_timeout(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            100,
        );

        iomc.cancel_event(fd, IoEvent::Write);
        let _ = hook::close(fd);
        *out.lock().unwrap() = Some(rc);
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        result.lock().unwrap().is_some()
    }));
    iom.stop();

    assert_eq!(result.lock().unwrap().unwrap(), -1);
}

#[test]
fn user_nonblock_bypasses_parking() {
    let iom = IoManager::new(1, false, "e2e_unb").unwrap();
    let (a, b) = socketpair();

    let result = Arc::new(Mutex::new(None::<(isize, i32)>));
    let out = result.clone();
    iom.schedule(move || {
        fd_manager().get(a, true).unwrap();
        // The user opts into non-blocking: EAGAIN comes straight back
        let flags = hook::fcntl(a, libc::F_GETFL, 0);
        assert_eq!(hook::fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);

        let mut buf = [0u8; 8];
        let n = hook::recv(a, &mut buf, 0);
        *out.lock().unwrap() = Some((n, last_errno()));
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        result.lock().unwrap().is_some()
    }));
    iom.stop();

    let (n, err) = result.lock().unwrap().unwrap();
    assert_eq!(n, -1);
    assert!(err == libc::EAGAIN || err == libc::EWOULDBLOCK);

    fd_manager().del(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn accept_registers_peer_descriptor() {
    let iom = IoManager::new(1, false, "e2e_accept").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();

    let result = Arc::new(Mutex::new(None::<c_int>));
    let out = result.clone();
    iom.schedule(move || {
        fd_manager().get(listen_fd, true).unwrap();
        let fd = hook::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut());
        *out.lock().unwrap() = Some(fd);
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    let _client = TcpStream::connect(addr).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        result.lock().unwrap().is_some()
    }));
    let peer = result.lock().unwrap().unwrap();
    assert!(peer >= 0);
    // accept() adopted the peer into the descriptor registry
    let ctx = fd_manager().get(peer, false).unwrap();
    assert!(ctx.is_socket());
    assert!(ctx.sys_nonblock());

    iom.stop();
    fd_manager().del(listen_fd);
    fd_manager().del(peer);
    unsafe {
        libc::close(peer);
    }
}
