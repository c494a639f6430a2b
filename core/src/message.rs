//! IRC message parsing and classification
//!
//! Implements the subset of the RFC 1459 / IRCv3 message format the bot
//! reacts to. A parsed [`Message`] owns its fields; classification into an
//! [`Event`] drives the per-connection dispatch loop.

use crate::store::{Capability, CredentialStore};
use crate::{Error, Result};
use std::fmt;

/// The in-chat control prefix. A user command arrives on the wire as the
/// trailing-text token `":" + prefix + name`, e.g. `:,hi`.
pub const COMMAND_PREFIX: char = ',';

/// The literal second parameter that requests worker shutdown from chat.
const QUIT_COMMAND: &str = ":,quit";

/// Wire command classification.
///
/// Chosen by exact literal match against the command token; everything else
/// (numerics, CAP, NOTICE, ...) is `Default` and silently consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Default,
    Ping,
    Login,
    Nick,
    Join,
    Part,
    PrivMsg,
    Quit,
}

impl MessageKind {
    fn classify(command: &str) -> Self {
        match command {
            "PING" => MessageKind::Ping,
            "LOGIN" => MessageKind::Login,
            "NICK" => MessageKind::Nick,
            "JOIN" => MessageKind::Join,
            "PART" => MessageKind::Part,
            "PRIVMSG" => MessageKind::PrivMsg,
            "QUIT" | "KILL" => MessageKind::Quit,
            _ => MessageKind::Default,
        }
    }
}

/// A user identity extracted from a message source of the form
/// `nick[!user[@host]]`. Missing trailing fields are empty, never absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub nickname: String,
    pub username: String,
    pub hostname: String,
}

impl UserIdentity {
    /// Split a source on `!` and `@`. A source without `!` is a server
    /// name, not a user, and fails.
    pub fn parse(source: &str) -> Result<Self> {
        let (nickname, rest) = source.split_once('!').ok_or_else(|| {
            Error::MessageParse(format!("source is not a user specification: {source}"))
        })?;
        let (username, hostname) = match rest.split_once('@') {
            Some((user, host)) => (user, host),
            None => (rest, ""),
        };
        Ok(Self {
            nickname: nickname.to_string(),
            username: username.to_string(),
            hostname: hostname.to_string(),
        })
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}@{}", self.nickname, self.username, self.hostname)
    }
}

/// Whether a source denotes a user rather than a server.
pub fn is_user_source(source: &str) -> bool {
    source.contains('!')
}

/// One parsed wire line.
///
/// Parameters are the space-delimited tokens after the command; the trailing
/// `:`-prefixed token keeps its colon and is not re-joined, so a control
/// word arrives as `:,hi` in `params[1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, `key -> value`; the value may be empty.
    pub tags: Vec<(String, String)>,
    /// Message source, either `server.name` or `nick!user@host`.
    pub source: Option<String>,
    /// The command token, alphabetic or three-digit numeric.
    pub command: String,
    /// Ordered parameters; always non-empty with a non-empty first token.
    pub params: Vec<String>,
    /// Classification of `command`.
    pub kind: MessageKind,
}

impl Message {
    /// Parse one line (no trailing CRLF).
    pub fn parse(line: &str) -> Result<Self> {
        let mut rest = line;

        let mut tags = Vec::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let (section, after) = stripped
                .split_once(' ')
                .ok_or_else(|| Error::MessageParse(format!("unterminated tags: {line}")))?;
            for tag in section.split(';') {
                if tag.is_empty() {
                    continue;
                }
                match tag.split_once('=') {
                    Some((key, value)) => tags.push((key.to_string(), value.to_string())),
                    None => tags.push((tag.to_string(), String::new())),
                }
            }
            rest = after;
        }

        let mut source = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (src, after) = stripped
                .split_once(' ')
                .ok_or_else(|| Error::MessageParse(format!("no command present: {line}")))?;
            source = Some(src.to_string());
            rest = after;
        }

        // Consecutive spaces never produce empty tokens.
        let mut words = rest.split(' ').filter(|w| !w.is_empty());
        let command = words
            .next()
            .ok_or_else(|| Error::MessageParse(format!("no command present: {line}")))?
            .to_string();
        let params: Vec<String> = words.map(str::to_string).collect();
        if params.is_empty() {
            return Err(Error::MessageParse(format!("no parameter present: {line}")));
        }

        let kind = MessageKind::classify(&command);
        Ok(Self {
            tags,
            source,
            command,
            params,
            kind,
        })
    }

    fn source_str(&self) -> &str {
        self.source.as_deref().unwrap_or("")
    }

    /// Whether this message is the in-chat shutdown request: a PRIVMSG whose
    /// second parameter is the literal `:,quit` from an identity holding the
    /// `QUIT` capability.
    fn is_quit_request(&self, identity: &UserIdentity, store: &CredentialStore) -> bool {
        self.params.get(1).map(String::as_str) == Some(QUIT_COMMAND)
            && store.is_capable(identity, Capability::QUIT)
    }

    /// Convert into the typed [`Event`] the dispatch visitor consumes.
    ///
    /// A `PRIVMSG` or `NICK` whose source is a bare server name (no `!`) is
    /// malformed here and fails like any other parse error.
    pub fn into_event(self, store: &CredentialStore) -> Result<Event> {
        match self.kind {
            MessageKind::Ping => Ok(Event::Ping(PingMessage(self))),
            MessageKind::Nick => {
                let identity = UserIdentity::parse(self.source_str())?;
                Ok(Event::Nick(NickMessage {
                    message: self,
                    identity,
                }))
            }
            MessageKind::Join => Ok(Event::Join(JoinMessage(self))),
            MessageKind::Part => Ok(Event::Part(PartMessage(self))),
            MessageKind::PrivMsg => {
                let identity = UserIdentity::parse(self.source_str())?;
                if self.is_quit_request(&identity, store) {
                    return Ok(Event::Quit);
                }
                Ok(Event::PrivMsg(PrivMsg {
                    message: self,
                    identity,
                }))
            }
            MessageKind::Quit => Ok(Event::Quit),
            MessageKind::Default | MessageKind::Login => Ok(Event::Default(self)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "Tags=")?;
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, " ")?;
        }
        write!(
            f,
            "Source={} Command={} Param=",
            self.source_str(),
            self.command
        )?;
        for param in &self.params {
            write!(f, "{param} ")?;
        }
        Ok(())
    }
}

/// Strip the leading `:` of a trailing-text token, if present.
fn strip_trailing_colon(param: &str) -> &str {
    param.strip_prefix(':').unwrap_or(param)
}

/// A `PING` from the server.
#[derive(Debug)]
pub struct PingMessage(Message);

impl PingMessage {
    /// The token to echo back in the `PONG` reply, colon stripped.
    pub fn pong_parameter(&self) -> &str {
        strip_trailing_colon(&self.0.params[0])
    }
}

/// A `NICK` change echo.
#[derive(Debug)]
pub struct NickMessage {
    message: Message,
    identity: UserIdentity,
}

impl NickMessage {
    pub fn new_nickname(&self) -> &str {
        strip_trailing_colon(&self.message.params[0])
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }
}

/// A `JOIN` acknowledgement echo.
#[derive(Debug)]
pub struct JoinMessage(Message);

impl JoinMessage {
    pub fn channel(&self) -> &str {
        strip_trailing_colon(&self.0.params[0])
    }
}

/// A `PART` acknowledgement echo.
#[derive(Debug)]
pub struct PartMessage(Message);

impl PartMessage {
    pub fn channel(&self) -> &str {
        strip_trailing_colon(&self.0.params[0])
    }
}

/// A `PRIVMSG` from a user. The source has been validated to contain `!`.
#[derive(Debug)]
pub struct PrivMsg {
    message: Message,
    identity: UserIdentity,
}

impl PrivMsg {
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// The buffer the message was sent to: a channel, or the bot's own
    /// nickname for a private message.
    pub fn channel(&self) -> &str {
        &self.message.params[0]
    }

    /// The control word including its colon and prefix (`:,hi`), when any
    /// parameter follows the channel.
    pub fn user_command(&self) -> Option<&str> {
        self.message.params.get(1).map(String::as_str)
    }

    /// Everything after the control word.
    pub fn command_parameters(&self) -> &[String] {
        self.message.params.get(2..).unwrap_or(&[])
    }
}

/// The typed variant the dispatch visitor matches on.
///
/// `Quit` is a sentinel produced by the wire `QUIT`/`KILL` commands or by a
/// privileged `,quit` control message.
#[derive(Debug)]
pub enum Event {
    Default(Message),
    Ping(PingMessage),
    Nick(NickMessage),
    Join(JoinMessage),
    Part(PartMessage),
    PrivMsg(PrivMsg),
    Quit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CredentialStore;

    fn event(line: &str) -> Result<Event> {
        Message::parse(line)?.into_event(&CredentialStore::default())
    }

    #[test]
    fn test_full_parsing() {
        let m = Message::parse("@url=;netsplit=tur,ty :dan!d@localhost PRIVMSG #chan :hey what's up!")
            .unwrap();
        assert_eq!(m.source.as_deref(), Some("dan!d@localhost"));
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.kind, MessageKind::PrivMsg);
        assert_eq!(m.params, vec!["#chan", ":hey", "what's", "up!"]);
    }

    #[test]
    fn test_tag_parsing() {
        let m = Message::parse("@url=;netsplit=tur,ty :dan!d@localhost PRIVMSG #chan :hi").unwrap();
        assert_eq!(m.tags.len(), 2);
        assert_eq!(m.tags[0], ("url".to_string(), String::new()));
        assert_eq!(m.tags[1], ("netsplit".to_string(), "tur,ty".to_string()));
    }

    #[test]
    fn test_parameter_spaces() {
        let m = Message::parse(":source command 1  2   3 4 ").unwrap();
        assert_eq!(m.params, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_bad_messages() {
        assert!(Message::parse("").is_err());
        assert!(Message::parse("@url=").is_err());
        assert!(Message::parse("@url").is_err());
        assert!(Message::parse(":source_no_command").is_err());
        assert!(Message::parse(":source command_no_parameters").is_err());
        assert!(Message::parse("command pa ra me te rs").is_ok());
        assert!(Message::parse(":source command pa ra me te rs").is_ok());
        assert!(Message::parse("@key=val;key= :source command pa ra me te rs").is_ok());
    }

    #[test]
    fn test_classification() {
        assert_eq!(Message::parse("PING :x").unwrap().kind, MessageKind::Ping);
        assert_eq!(Message::parse("QUIT :x").unwrap().kind, MessageKind::Quit);
        assert_eq!(Message::parse("KILL :x").unwrap().kind, MessageKind::Quit);
        assert_eq!(Message::parse("LOGIN :x").unwrap().kind, MessageKind::Login);
        // Numerics and anything unrecognized stay Default.
        assert_eq!(
            Message::parse(":server 001 bot :Welcome").unwrap().kind,
            MessageKind::Default
        );
        // Classification is an exact match, no case folding.
        assert_eq!(Message::parse("ping :x").unwrap().kind, MessageKind::Default);
    }

    #[test]
    fn test_user_identity() {
        let u = UserIdentity::parse("dan!~d@localhost/foo").unwrap();
        assert_eq!(u.nickname, "dan");
        assert_eq!(u.username, "~d");
        assert_eq!(u.hostname, "localhost/foo");

        let u = UserIdentity::parse("dan!~d").unwrap();
        assert_eq!(u.username, "~d");
        assert_eq!(u.hostname, "");

        let u = UserIdentity::parse("dan!").unwrap();
        assert_eq!(u.username, "");
        assert_eq!(u.hostname, "");

        let u = UserIdentity::parse("dan!~d@").unwrap();
        assert_eq!(u.username, "~d");
        assert_eq!(u.hostname, "");

        assert!(UserIdentity::parse("server.example.net").is_err());
    }

    #[test]
    fn test_privmsg_accessors() {
        let ev = event(":dan!~d@host PRIVMSG #chan :,nick newbot extra").unwrap();
        let Event::PrivMsg(msg) = ev else {
            panic!("expected privmsg event");
        };
        assert_eq!(msg.identity().nickname, "dan");
        assert_eq!(msg.channel(), "#chan");
        assert_eq!(msg.user_command(), Some(":,nick"));
        assert_eq!(msg.command_parameters(), ["newbot", "extra"]);
    }

    #[test]
    fn test_privmsg_without_control_word() {
        let ev = event(":dan!~d@host PRIVMSG #chan").unwrap();
        let Event::PrivMsg(msg) = ev else {
            panic!("expected privmsg event");
        };
        assert_eq!(msg.user_command(), None);
        assert!(msg.command_parameters().is_empty());
    }

    #[test]
    fn test_server_privmsg_is_malformed() {
        assert!(event(":server.example.net PRIVMSG #chan :hello").is_err());
    }

    #[test]
    fn test_wire_quit_and_kill() {
        assert!(matches!(event(":dan!~d@host QUIT :bye").unwrap(), Event::Quit));
        assert!(matches!(event(":oper!o@host KILL bot :bye").unwrap(), Event::Quit));
    }

    #[test]
    fn test_quit_request_literal_form() {
        let store = CredentialStore::with_user("dan", "~d", "host", Capability::QUIT);

        // The colon-prefixed wire form from a capable user quits.
        let ev = Message::parse(":dan!~d@host PRIVMSG #chan :,quit")
            .unwrap()
            .into_event(&store)
            .unwrap();
        assert!(matches!(ev, Event::Quit));

        // Without the capability it is an ordinary user command.
        let ev = event(":dan!~d@host PRIVMSG #chan :,quit").unwrap();
        assert!(matches!(ev, Event::PrivMsg(_)));

        // A different second parameter never quits, capability or not.
        let ev = Message::parse(":dan!~d@host PRIVMSG #chan :,hi")
            .unwrap()
            .into_event(&store)
            .unwrap();
        assert!(matches!(ev, Event::PrivMsg(_)));
    }

    #[test]
    fn test_event_accessor_colon_stripping() {
        let Event::Ping(ping) = event("PING :irc.example.net").unwrap() else {
            panic!("expected ping");
        };
        assert_eq!(ping.pong_parameter(), "irc.example.net");
        let Event::Ping(ping) = event("PING irc.example.net").unwrap() else {
            panic!("expected ping");
        };
        assert_eq!(ping.pong_parameter(), "irc.example.net");

        let Event::Nick(nick) = event(":bot!u@h NICK :newbot").unwrap() else {
            panic!("expected nick");
        };
        assert_eq!(nick.new_nickname(), "newbot");
        assert_eq!(nick.identity().nickname, "bot");

        let Event::Join(join) = event(":bot!u@h JOIN ##foo").unwrap() else {
            panic!("expected join");
        };
        assert_eq!(join.channel(), "##foo");
    }
}
