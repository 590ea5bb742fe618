//! Integration coverage for [`r3bl_csp::netpoll`] driven end to end
//! through a loopback TCP connection: a process parks on
//! [`r3bl_csp::netpoll::NetpollHandle::wait_read`] until data arrives,
//! and a second test drives the timeout side of the same race.

use std::{io::{Read, Write},
          net::{TcpListener, TcpStream},
          os::fd::AsRawFd,
          sync::mpsc,
          time::Duration};

use r3bl_csp::{netpoll::NetpollHandle, process::ProcStat, timer, Runtime, RuntimeConfig};

fn test_runtime() -> Runtime {
    Runtime::start(RuntimeConfig::builder().n_cpus(2).max_threads(4).build()).expect("runtime should start in the test environment")
}

#[test]
fn wait_read_resumes_once_the_peer_writes() {
    let runtime = test_runtime();
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding a loopback listener should succeed");
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = mpsc::channel();
    let netpoll: NetpollHandle = runtime.netpoll().clone();
    runtime
        .spawn("waiter", move || {
            let (stream, _) = listener.accept().expect("accept should succeed once the client connects");
            stream.set_nonblocking(true).expect("set_nonblocking should succeed");
            let fd = stream.as_raw_fd();
            let status = netpoll.wait_read(fd, None).expect("fd should be valid");
            let mut stream = stream;
            let mut buf = [0u8; 16];
            let n = if status == ProcStat::NetpollAvail { stream.read(&mut buf).unwrap_or(0) } else { 0 };
            let _ = tx.send((status, buf[.. n].to_vec()));
        })
        .unwrap();

    // Give the server process a moment to reach `accept`, then connect and
    // write — there is no explicit "listening" signal to wait on here
    // since `TcpListener::bind` above already completed before the spawn.
    std::thread::sleep(Duration::from_millis(50));
    let mut client = TcpStream::connect(addr).expect("connecting to the loopback listener should succeed");
    client.write_all(b"hello").expect("write should succeed");

    let (status, received) = rx.recv_timeout(Duration::from_secs(5)).expect("the waiter process should observe readability");
    assert_eq!(status, ProcStat::NetpollAvail);
    assert_eq!(received, b"hello");

    runtime.shutdown();
}

#[test]
fn wait_read_times_out_when_nothing_arrives() {
    let runtime = test_runtime();
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding a loopback listener should succeed");
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = mpsc::channel();
    let netpoll: NetpollHandle = runtime.netpoll().clone();
    runtime
        .spawn("idle-waiter", move || {
            let (stream, _) = listener.accept().expect("accept should succeed once the client connects");
            stream.set_nonblocking(true).expect("set_nonblocking should succeed");
            let fd = stream.as_raw_fd();
            let status = netpoll.wait_read(fd, Some(100 * timer::MILLISECOND)).expect("fd should be valid");
            let _ = tx.send(status);
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let client = TcpStream::connect(addr).expect("connecting should succeed");
    // Deliberately never write anything on `client`; it just needs to
    // stay open so the accepted socket doesn't see EOF.

    let status = rx.recv_timeout(Duration::from_secs(5)).expect("the waiter process should observe a timeout");
    assert_eq!(status, ProcStat::NetpollTimeout);

    drop(client);
    runtime.shutdown();
}
