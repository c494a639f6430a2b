//! Shared helpers for the loopback-socket tests.

use crate::server::Server;
use crate::store::CredentialStore;
use crate::transport::Irc;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// A connected transport plus the server side of the loopback socket.
pub struct Pair {
    pub irc: Irc,
    pub peer: TcpStream,
}

impl Pair {
    pub fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        Pair {
            irc: Irc::new(client),
            peer,
        }
    }
}

/// A fully constructed [`Server`] over a loopback socket, plus the peer end
/// for observing what the bot sends.
pub fn loopback_server(nickname: &str, store: CredentialStore) -> (Server, TcpStream) {
    let Pair { irc, peer } = Pair::new();
    let server = Server::new(irc, "127.0.0.1".to_string(), peer.local_addr().unwrap().port(), nickname, store);
    (server, peer)
}

/// Block until `fd` is readable (bounded, so a broken test fails fast).
pub fn wait_readable(fd: RawFd) {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, 2000) };
}

/// Read everything currently buffered on the peer side.
pub fn read_available(peer: &mut TcpStream) -> String {
    wait_readable(peer.as_raw_fd());
    peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match peer.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Assert that nothing has been sent to the peer.
pub fn assert_no_output(peer: &mut TcpStream) {
    peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let mut chunk = [0u8; 64];
    match peer.read(&mut chunk) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!(
            "unexpected output: {:?}",
            String::from_utf8_lossy(&chunk[..n])
        ),
    }
}
