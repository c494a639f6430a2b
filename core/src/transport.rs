//! Low-level IRC transport
//!
//! Framed send/receive over the connection socket plus the command
//! builders. Lines go out with a leading `\r` and trailing `\r\n`; sends
//! carry `MSG_NOSIGNAL` so a peer disconnect surfaces as an error instead
//! of terminating the process.

use crate::{Error, Result};
use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::raw::c_void;
use tracing::error;

/// Size of one receive chunk.
const RECV_CHUNK: usize = 4096;
/// Maximum chunks drained per receive call.
const RECV_TRIES: usize = 5;
/// How long to wait for the farewell to drain on quit, in milliseconds.
const QUIT_DRAIN_MS: i32 = 5000;

/// Low-level API to interact with the IRC server.
///
/// Owns the socket; it is closed on drop.
pub struct Irc {
    stream: TcpStream,
}

impl Irc {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Registration sequence: `USER`, `NICK`, then a NickServ identify when
    /// a password is given. Attempts every step and returns the first
    /// failure encountered.
    pub fn login(&self, nickname: &str, password: &str) -> Result<()> {
        let mut first_err = None;
        if let Err(e) = self.send_raw(&format!("\rUSER {nickname} 0 * :{nickname}\r\n")) {
            error!("failed to send USER login message: {e}");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.nick(nickname) {
            error!("failed to send NICK login message: {e}");
            first_err.get_or_insert(e);
        }
        if !password.is_empty() {
            if let Err(e) = self.privmsg("NickServ", &format!("identify {password}")) {
                error!("failed to send IDENTIFY login message: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn nick(&self, nickname: &str) -> Result<usize> {
        self.send_raw(&format!("\rNICK {nickname}\r\n"))
    }

    pub fn join(&self, channel: &str) -> Result<usize> {
        self.send_raw(&format!("\rJOIN {channel}\r\n"))
    }

    pub fn part(&self, channel: &str) -> Result<usize> {
        self.send_raw(&format!("\rPART {channel}\r\n"))
    }

    pub fn privmsg(&self, recipient: &str, msg: &str) -> Result<usize> {
        self.send_raw(&format!("\rPRIVMSG {recipient} :{msg}\r\n"))
    }

    pub fn pong(&self, parameter: &str) -> Result<usize> {
        self.send_raw(&format!("\rPONG :{parameter}\r\n"))
    }

    /// Send the farewell, then block briefly for writability so the server
    /// receives it before the socket goes away.
    pub fn quit(&self, msg: &str) -> Result<usize> {
        let sent = self.send_raw(&format!("\rQUIT :{msg}\r\n"))?;
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, QUIT_DRAIN_MS) };
        Ok(sent)
    }

    /// Send raw bytes with `MSG_NOSIGNAL`. Partial writes are not retried.
    pub fn send_raw(&self, msg: &str) -> Result<usize> {
        let r = unsafe {
            libc::send(
                self.as_raw_fd(),
                msg.as_ptr() as *const c_void,
                msg.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if r < 0 {
            let err = io::Error::last_os_error();
            error!("failed to send data: {err}");
            return Err(Error::Transport(err.to_string()));
        }
        Ok(r as usize)
    }

    /// Drain whatever is readable, up to `RECV_CHUNK * RECV_TRIES` bytes,
    /// stopping early once the buffer ends in a newline. A partial final
    /// line is trimmed back to the last newline so the caller never sees a
    /// fragment.
    ///
    /// Returns `Ok("")` on a spurious wake with nothing to read and
    /// [`Error::ConnectionClosed`] on peer EOF.
    pub fn recv(&self) -> Result<String> {
        let mut buf: Vec<u8> = Vec::new();
        let mut filled = 0usize;
        let mut tries = RECV_TRIES;
        loop {
            buf.resize(filled + RECV_CHUNK, 0);
            let r = unsafe {
                libc::recv(
                    self.as_raw_fd(),
                    buf[filled..].as_mut_ptr() as *mut c_void,
                    RECV_CHUNK,
                    libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
                )
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!("failed to receive data: {err}");
                    return Err(Error::Transport(err.to_string()));
                }
                if filled == 0 {
                    return Ok(String::new());
                }
                break;
            }
            if r == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += r as usize;
            tries -= 1;
            if buf[filled - 1] == b'\n' || tries == 0 {
                break;
            }
        }
        // Discard a trailing fragment with no newline.
        while filled > 0 && buf[filled - 1] != b'\n' {
            filled -= 1;
        }
        buf.truncate(filled);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::test_util::{read_available, wait_readable, Pair};
    use std::io::Write;
    use std::net::Shutdown;

    #[test]
    fn test_builders_round_trip() {
        let Pair { irc, mut peer } = Pair::new();

        irc.join("#chan").unwrap();
        irc.nick("alice").unwrap();
        irc.privmsg("#chan", "hey what's up!").unwrap();
        irc.part("#chan").unwrap();
        irc.pong("irc.example.net").unwrap();

        let buf = read_available(&mut peer);
        let lines: Vec<&str> = buf.split(['\r', '\n']).filter(|l| !l.is_empty()).collect();
        assert_eq!(
            lines,
            vec![
                "JOIN #chan",
                "NICK alice",
                "PRIVMSG #chan :hey what's up!",
                "PART #chan",
                "PONG :irc.example.net",
            ]
        );

        // Every builder line parses back to its command and tokens.
        let m = Message::parse(lines[2]).unwrap();
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.params, vec!["#chan", ":hey", "what's", "up!"]);
    }

    #[test]
    fn test_login_sequence() {
        let Pair { irc, mut peer } = Pair::new();
        irc.login("bot", "hunter2").unwrap();
        let buf = read_available(&mut peer);
        let lines: Vec<&str> = buf.split(['\r', '\n']).filter(|l| !l.is_empty()).collect();
        assert_eq!(
            lines,
            vec![
                "USER bot 0 * :bot",
                "NICK bot",
                "PRIVMSG NickServ :identify hunter2",
            ]
        );
    }

    #[test]
    fn test_login_without_password_skips_identify() {
        let Pair { irc, mut peer } = Pair::new();
        irc.login("bot", "").unwrap();
        let buf = read_available(&mut peer);
        assert!(!buf.contains("NickServ"));
    }

    #[test]
    fn test_recv_whole_lines() {
        let Pair { irc, mut peer } = Pair::new();
        peer.write_all(b"PING :a\r\nPART #x\r\n").unwrap();
        wait_readable(irc.as_raw_fd());
        assert_eq!(irc.recv().unwrap(), "PING :a\r\nPART #x\r\n");
    }

    #[test]
    fn test_recv_trims_partial_final_line() {
        let Pair { irc, mut peer } = Pair::new();
        peer.write_all(b"PING :a\r\nPARTIAL").unwrap();
        wait_readable(irc.as_raw_fd());
        assert_eq!(irc.recv().unwrap(), "PING :a\r\n");
    }

    #[test]
    fn test_recv_nothing_pending() {
        let Pair { irc, peer: _peer } = Pair::new();
        assert_eq!(irc.recv().unwrap(), "");
    }

    #[test]
    fn test_recv_eof() {
        let Pair { irc, peer } = Pair::new();
        peer.shutdown(Shutdown::Both).unwrap();
        wait_readable(irc.as_raw_fd());
        assert!(matches!(irc.recv(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_quit_sends_colon_prefixed_farewell() {
        let Pair { irc, mut peer } = Pair::new();
        irc.quit("Goodbye cruel world!").unwrap();
        let buf = read_available(&mut peer);
        assert_eq!(buf, "\rQUIT :Goodbye cruel world!\r\n");
    }
}
