//! Integration tests for the mio transport.
//!
//! These tests drive SockDriver over real loopback TCP connections.

use bytes::Bytes;
use sockq::{AbortReason, Config, Error, GroupId, SockDriver, SockId, WriteRequest};
use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

/// Spin `f` against the driver until it returns `Some`, failing after ~5s.
fn wait_for<T>(driver: &mut SockDriver, mut f: impl FnMut(&mut SockDriver) -> Option<T>) -> T {
    for _ in 0..5000 {
        if let Some(v) = f(driver) {
            return v;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for condition");
}

fn listen(driver: &mut SockDriver) -> (SockId, SocketAddr) {
    let listener = driver.listen("127.0.0.1", 0).unwrap();
    let addr = driver.local_addr(listener).unwrap();
    (listener, addr)
}

fn accept_into(driver: &mut SockDriver, listener: SockId, group: GroupId) -> SockId {
    let id = wait_for(driver, |d| d.accept(listener).unwrap());
    driver.add_to_group(group, id).unwrap();
    id
}

#[test]
fn test_mio_driver_new() {
    let driver = SockDriver::mio(Config::default()).unwrap();
    assert_eq!(driver.socket_count(), 0);
}

#[test]
fn test_listen_ephemeral() {
    let mut driver = SockDriver::mio(Config::default()).unwrap();
    let (listener, addr) = listen(&mut driver);
    assert_ne!(addr.port(), 0);
    assert!(matches!(
        driver.is_connected(listener),
        Err(Error::WrongKind { .. })
    ));
    driver.close(listener).unwrap();
}

#[test]
fn test_accept_and_echo() {
    let mut driver = SockDriver::mio(Config::default()).unwrap();
    let (listener, addr) = listen(&mut driver);
    let group = driver.create_group();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let id = accept_into(&mut driver, listener, group);
    assert!(driver.is_connected(id).unwrap());
    assert_eq!(driver.peer_addr(id).unwrap(), client.local_addr().unwrap());
    assert_eq!(driver.local_addr(id).unwrap(), addr);
    assert!(matches!(
        driver.peer_addr(listener),
        Err(Error::WrongKind { .. })
    ));

    client.write_all(b"hello").unwrap();

    let ready = wait_for(&mut driver, |d| {
        let ready = d.poll_group(group, 8).unwrap();
        (!ready.is_empty()).then_some(ready)
    });
    assert_eq!(ready, vec![id]);

    let mut buf = [0u8; 64];
    let n = driver.recv(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");

    let done = Rc::new(Cell::new(false));
    let flag = done.clone();
    let req = WriteRequest::from_bytes(Bytes::copy_from_slice(&buf[..n]))
        .on_complete(move |_, _, status| {
            assert!(status.is_ok());
            flag.set(true);
        });
    driver.writev_async(id, req).unwrap();

    wait_for(&mut driver, |d| {
        d.poll_group(group, 8).unwrap();
        done.get().then_some(())
    });

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello");
}

#[test]
fn test_recv_would_block_when_idle() {
    let mut driver = SockDriver::mio(Config::default()).unwrap();
    let (listener, addr) = listen(&mut driver);
    let group = driver.create_group();

    let _client = TcpStream::connect(addr).unwrap();
    let id = accept_into(&mut driver, listener, group);

    let mut buf = [0u8; 16];
    assert!(driver.recv(id, &mut buf).unwrap_err().is_would_block());
    assert!(driver.poll_group(group, 8).unwrap().is_empty());
}

#[test]
fn test_peer_close_reports_eof() {
    let mut driver = SockDriver::mio(Config::default()).unwrap();
    let (listener, addr) = listen(&mut driver);
    let group = driver.create_group();

    let client = TcpStream::connect(addr).unwrap();
    let id = accept_into(&mut driver, listener, group);
    drop(client);

    wait_for(&mut driver, |d| {
        let ready = d.poll_group(group, 8).unwrap();
        ready.contains(&id).then_some(())
    });
    let mut buf = [0u8; 16];
    assert_eq!(driver.recv(id, &mut buf).unwrap(), 0);
}

#[test]
fn test_close_shuts_peer() {
    let mut driver = SockDriver::mio(Config::default()).unwrap();
    let (listener, addr) = listen(&mut driver);
    let group = driver.create_group();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let id = accept_into(&mut driver, listener, group);

    driver.close(id).unwrap();
    assert!(driver.group_members(group).unwrap().is_empty());

    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_connect_outbound() {
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let mut driver = SockDriver::mio(Config::default()).unwrap();
    let group = driver.create_group();
    let id = driver.connect("127.0.0.1", port).unwrap();
    driver.add_to_group(group, id).unwrap();

    let (mut peer, _) = server.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // Writes would-block until a pump reports the connect complete.
    let n = wait_for(&mut driver, |d| {
        d.poll_group(group, 8).unwrap();
        match d.write(id, b"ping") {
            Ok(n) => Some(n),
            Err(e) if e.is_would_block() => None,
            Err(e) => panic!("write failed: {e}"),
        }
    });
    assert_eq!(n, 4);
    assert!(driver.is_connected(id).unwrap());

    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn test_connect_refused() {
    // Bind then drop to find a port with nothing listening.
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let mut driver = SockDriver::mio(Config::default()).unwrap();
    let group = driver.create_group();
    let id = match driver.connect("127.0.0.1", port) {
        Ok(id) => id,
        // Some platforms refuse synchronously.
        Err(Error::Transport(_)) => return,
        Err(e) => panic!("unexpected error: {e}"),
    };
    driver.add_to_group(group, id).unwrap();

    let status = Rc::new(Cell::new(None));
    let slot = status.clone();
    let req = WriteRequest::from_bytes(Bytes::from_static(b"queued"))
        .on_complete(move |_, _, result| slot.set(Some(result)));
    driver.writev_async(id, req).unwrap();

    // Checking the connection first consumes the pending socket error; the
    // flush inside the poll must still see the failure.
    let result = wait_for(&mut driver, |d| {
        let _ = d.is_connected(id);
        d.poll_group(group, 8).unwrap();
        status.get()
    });
    assert!(matches!(result, Err(AbortReason::Transport(_))));

    assert!(!driver.is_connected(id).unwrap());
    for _ in 0..3 {
        assert!(matches!(driver.write(id, b"x"), Err(Error::Transport(_))));
    }
}

#[test]
fn test_large_async_writes_drain() {
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 64;

    let config = Config {
        send_buf_size: 64 * 1024,
        ..Default::default()
    };
    let mut driver = SockDriver::mio(config).unwrap();
    let (listener, addr) = listen(&mut driver);
    let group = driver.create_group();

    let reader = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut data = vec![0u8; CHUNK * CHUNKS];
        client.read_exact(&mut data).unwrap();
        data
    });

    let id = accept_into(&mut driver, listener, group);

    let completed = Rc::new(Cell::new(0));
    for i in 0..CHUNKS {
        let completed = completed.clone();
        let chunk = Bytes::from(vec![i as u8; CHUNK]);
        let req = WriteRequest::from_bytes(chunk).on_complete(move |_, _, status| {
            assert!(status.is_ok());
            completed.set(completed.get() + 1);
        });
        driver.writev_async(id, req).unwrap();
    }

    wait_for(&mut driver, |d| {
        d.poll_group(group, 8).unwrap();
        (completed.get() == CHUNKS).then_some(())
    });
    assert_eq!(driver.pending_bytes(id).unwrap(), 0);

    let data = reader.join().unwrap();
    for (i, chunk) in data.chunks(CHUNK).enumerate() {
        assert!(chunk.iter().all(|b| *b == i as u8), "chunk {i} out of order");
    }
}
