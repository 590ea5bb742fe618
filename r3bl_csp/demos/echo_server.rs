/*
 *   Copyright (c) 2025 R3BL LLC
 *   All rights reserved.
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! A non-blocking TCP echo server: one process accepts connections, and
//! one `async`-style child process per accepted connection reads whatever
//! the client sends and writes it straight back, gated on
//! [`r3bl_csp::netpoll::NetpollHandle::wait_read`]/
//! [`r3bl_csp::netpoll::NetpollHandle::wait_write`] rather than blocking
//! the OS thread.

use std::{io::{ErrorKind, Read, Write},
          net::{TcpListener, TcpStream},
          os::fd::AsRawFd,
          sync::Arc};

use clap::Parser;
use mio::Interest;
use r3bl_csp::{netpoll::NetpollHandle, process::ProcStat, Runtime, RuntimeConfig};

/// Echoes back whatever each connected client sends, one process per
/// connection.
#[derive(Parser)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7878")]
    addr: String,

    /// Caps the runtime's scheduler threads; 0 uses the host's CPU count.
    #[arg(long, default_value_t = 0)]
    max_threads: usize,
}

fn handle_conn(netpoll: NetpollHandle, stream: TcpStream) {
    stream.set_nonblocking(true).expect("set_nonblocking should succeed on a freshly accepted socket");
    let fd = stream.as_raw_fd();
    let mut stream = stream;
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => return, // peer closed
            Ok(n) => {
                if !write_all(&netpoll, fd, &mut stream, &buf[.. n]) {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                match netpoll.wait_read(fd, None).expect("fd should stay within the waiter table") {
                    ProcStat::NetpollAvail => continue,
                    other => {
                        tracing::warn!(?other, "unexpected status waiting to read from echo connection");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "echo connection read failed");
                return;
            }
        }
    }
}

/// Writes `data` in full, parking on [`NetpollHandle::wait_write`] every
/// time the socket's send buffer is momentarily full. Returns `false` if
/// the connection should be torn down instead.
fn write_all(netpoll: &NetpollHandle, fd: i32, stream: &mut TcpStream, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return false,
            Ok(n) => data = &data[n ..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                match netpoll.wait_write(fd, None).expect("fd should stay within the waiter table") {
                    ProcStat::NetpollAvail => {}
                    other => {
                        tracing::warn!(?other, "unexpected status waiting to write to echo connection");
                        return false;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "echo connection write failed");
                return false;
            }
        }
    }
    true
}

fn accept_loop(runtime: Arc<Runtime>, listener: TcpListener) {
    listener.set_nonblocking(true).expect("set_nonblocking should succeed on the listening socket");
    let listener_fd = listener.as_raw_fd();

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "accepted echo connection");
                let netpoll = runtime.netpoll().clone();
                runtime.spawn("echo-conn", move || handle_conn(netpoll, stream)).expect("connection process should spawn");
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                // SAFETY: `listener_fd` stays open and registered for the
                // whole wait; `netpoll` deregisters it for us if the wait
                // times out, which it never does here (`None`).
                match runtime.netpoll().wait(listener_fd, Interest::READABLE, None) {
                    Ok(ProcStat::NetpollAvail) => continue,
                    Ok(other) => {
                        tracing::warn!(?other, "unexpected status waiting to accept");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "netpoll registration failed for listening socket");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                return;
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = RuntimeConfig::builder();
    if args.max_threads > 0 {
        config = config.max_threads(args.max_threads);
    }
    let runtime = Arc::new(Runtime::start(config.build()).expect("runtime should start on this host"));
    let listener = TcpListener::bind(&args.addr).expect("binding the echo server's listening socket should succeed");
    println!("echo server listening on {}", args.addr);

    let accept_runtime = Arc::clone(&runtime);
    runtime.spawn("echo-accept", move || accept_loop(accept_runtime, listener)).expect("accept process should spawn");

    // A demo has no natural shutdown trigger; run until killed.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
