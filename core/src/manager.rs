//! Per-thread connection runtime
//!
//! A [`Manager`] owns one [`Server`] and one multiplexer and drives the
//! receive -> parse -> dispatch loop. Construction pins it to the current
//! thread: it reserves a private realtime-signal slot, blocks every other
//! signal (so signals reach workers only through each worker's signalfd) and
//! names the thread after the slot and server address. Timers and signal
//! subscriptions ride the same multiplexer as the server socket.

use crate::command;
use crate::epoll::{Callback, ConfigFlags, EpollManager, EventFlags, ReadyEvent};
use crate::message::{Event, Message};
use crate::server::Server;
use crate::{Error, Result};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Offset of the next unreserved realtime signal above `SIGRTMIN`.
static NEXT_SIGNAL_OFFSET: AtomicI32 = AtomicI32::new(0);

/// Handler for one subscribed signal number.
pub type SignalHandler = Box<dyn FnMut(&libc::signalfd_siginfo)>;

/// Handler for one timer, called with the expiration count.
pub type TimerHandler = Box<dyn FnMut(u64)>;

/// A reserved realtime-signal number, returned to the counter on drop.
/// Exhaustion fails construction; slots never alias.
struct SignalSlot {
    signo: i32,
}

impl SignalSlot {
    fn reserve() -> Result<Self> {
        let offset = NEXT_SIGNAL_OFFSET.fetch_add(1, Ordering::Relaxed);
        let signo = libc::SIGRTMIN() + offset;
        if signo > libc::SIGRTMAX() {
            NEXT_SIGNAL_OFFSET.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Resource(
                "no more managers can be created, signal slots exhausted".to_string(),
            ));
        }
        Ok(Self { signo })
    }

    fn index(&self) -> i32 {
        self.signo - libc::SIGRTMIN()
    }
}

impl Drop for SignalSlot {
    fn drop(&mut self) {
        NEXT_SIGNAL_OFFSET.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The dispatch context handed to every handler: the server plus the
/// signal/timer routing tables. Split out of [`Manager`] so the multiplexer
/// can lend it to callbacks while it is itself borrowed by the tick.
pub struct Context {
    pub server: Server,
    sigfd: Option<RawFd>,
    sigset: libc::sigset_t,
    signal_handlers: HashMap<i32, SignalHandler>,
    timer_handlers: HashMap<RawFd, TimerHandler>,
    quit: bool,
}

impl Context {
    /// Ask the event loop to exit after the current tick.
    pub fn request_quit(&mut self) {
        self.quit = true;
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Consume everything queued on the signalfd, dispatching each record
    /// to the handler for its signal number.
    fn drain_signalfd(&mut self) {
        let Some(fd) = self.sigfd else { return };
        loop {
            let mut si: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let r = unsafe {
                libc::read(
                    fd,
                    &mut si as *mut libc::signalfd_siginfo as *mut c_void,
                    mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!("failed to consume signal from signalfd: {err}");
                }
                return;
            }
            if (r as usize) < mem::size_of::<libc::signalfd_siginfo>() {
                warn!("short read from signalfd, dropping record");
                return;
            }
            match self.signal_handlers.get_mut(&(si.ssi_signo as i32)) {
                Some(handler) => handler(&si),
                None => warn!("no handler registered for signal {}", si.ssi_signo),
            }
        }
    }

    /// Fire the handler for one expired timer.
    fn fire_timer(&mut self, fd: RawFd) {
        let mut buf = [0u8; 8];
        let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if r != buf.len() as isize {
            return;
        }
        let expirations = u64::from_ne_bytes(buf);
        match self.timer_handlers.get_mut(&fd) {
            Some(handler) => handler(expirations),
            None => warn!("no handler registered for timerfd {fd}"),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(fd) = self.sigfd {
            unsafe { libc::close(fd) };
        }
        for fd in self.timer_handlers.keys() {
            unsafe { libc::close(*fd) };
        }
    }
}

/// The per-thread runtime: one server, one multiplexer, one signal slot.
pub struct Manager {
    poller: EpollManager<Context>,
    pub ctx: Context,
    slot: SignalSlot,
}

impl Manager {
    /// Build the runtime around a freshly connected server and pin it to
    /// the calling thread.
    pub fn new(server: Server) -> Result<Self> {
        let poller = EpollManager::new()?;
        let slot = SignalSlot::reserve()?;

        // Block everything except the reserved slot; subscribed signals are
        // delivered through the signalfd instead.
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigfillset(&mut mask);
            libc::sigdelset(&mut mask, slot.signo);
            if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
                return Err(Error::Resource("failed to set up signal mask".to_string()));
            }
        }

        // Thread name is capped at 15 bytes plus the terminator.
        let mut name = format!("{}-{}", slot.index(), server.address());
        name.truncate(15);
        if let Ok(cname) = CString::new(name) {
            let r = unsafe { libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr()) };
            if r != 0 {
                warn!("failed to set thread name: {}", io::Error::from_raw_os_error(r));
            }
        }

        let mut sigset: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut sigset);
            libc::sigaddset(&mut sigset, slot.signo);
        }

        Ok(Self {
            poller,
            ctx: Context {
                server,
                sigfd: None,
                sigset,
                signal_handlers: HashMap::new(),
                timer_handlers: HashMap::new(),
                quit: false,
            },
            slot,
        })
    }

    /// The realtime signal reserved for this worker. Sending it to the
    /// process reaches this Manager's handlers once subscribed.
    pub fn reserved_signal(&self) -> i32 {
        self.slot.signo
    }

    // Signal events

    /// Subscribe a handler for a signal number. The signalfd is created and
    /// registered with the multiplexer on first use.
    pub fn register_signal_event(&mut self, signal: i32, handler: SignalHandler) -> Result<()> {
        if unsafe { libc::sigismember(&self.ctx.sigset, signal) } == 1
            && self.ctx.signal_handlers.contains_key(&signal)
        {
            return Ok(());
        }
        unsafe { libc::sigaddset(&mut self.ctx.sigset, signal) };
        match self.ctx.sigfd {
            None => {
                let fd = unsafe {
                    libc::signalfd(-1, &self.ctx.sigset, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
                };
                if fd < 0 {
                    unsafe { libc::sigdelset(&mut self.ctx.sigset, signal) };
                    return Err(Error::Resource(format!(
                        "failed to create signalfd: {}",
                        io::Error::last_os_error()
                    )));
                }
                self.ctx.sigfd = Some(fd);
                self.poller.register_fd(
                    fd,
                    EventFlags::IN,
                    ConfigFlags::empty(),
                    Box::new(|ctx: &mut Context, _ev: ReadyEvent| ctx.drain_signalfd()),
                )?;
            }
            Some(fd) => {
                if unsafe { libc::signalfd(fd, &self.ctx.sigset, 0) } < 0 {
                    unsafe { libc::sigdelset(&mut self.ctx.sigset, signal) };
                    return Err(Error::Resource(format!(
                        "failed to extend signalfd mask: {}",
                        io::Error::last_os_error()
                    )));
                }
            }
        }
        self.ctx.signal_handlers.insert(signal, handler);
        Ok(())
    }

    /// Drop the subscription for a signal number.
    pub fn delete_signal_event(&mut self, signal: i32) -> Result<()> {
        if unsafe { libc::sigismember(&self.ctx.sigset, signal) } != 1 {
            return Err(Error::State(format!("signal {signal} is not subscribed")));
        }
        unsafe { libc::sigdelset(&mut self.ctx.sigset, signal) };
        if let Some(fd) = self.ctx.sigfd {
            if unsafe { libc::signalfd(fd, &self.ctx.sigset, 0) } < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        self.ctx.signal_handlers.remove(&signal);
        Ok(())
    }

    // Timer events

    /// Create a timerfd on `clock`, register it with the multiplexer and
    /// route its expirations to `handler`. The timer starts disarmed.
    pub fn register_timer_event(
        &mut self,
        clock: libc::clockid_t,
        handler: TimerHandler,
    ) -> Result<RawFd> {
        let fd = unsafe { libc::timerfd_create(clock, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Resource(format!(
                "failed to create timerfd: {}",
                io::Error::last_os_error()
            )));
        }
        if let Err(e) = self.poller.register_fd(
            fd,
            EventFlags::IN,
            ConfigFlags::empty(),
            Box::new(move |ctx: &mut Context, ev: ReadyEvent| ctx.fire_timer(ev.fd)),
        ) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        self.ctx.timer_handlers.insert(fd, handler);
        Ok(fd)
    }

    /// Arm (or re-arm) a registered timer with a periodic interval.
    pub fn rearm_timer_event(&mut self, fd: RawFd, interval: Duration) -> Result<()> {
        self.set_timer(fd, interval)
    }

    /// Stop a registered timer without unregistering it.
    pub fn disarm_timer_event(&mut self, fd: RawFd) -> Result<()> {
        self.set_timer(fd, Duration::ZERO)
    }

    /// Unregister a timer and close its fd.
    pub fn delete_timer_event(&mut self, fd: RawFd) -> Result<()> {
        if self.ctx.timer_handlers.remove(&fd).is_none() {
            return Err(Error::State(format!("timerfd {fd} is not registered")));
        }
        self.poller.delete_fd(fd)?;
        unsafe { libc::close(fd) };
        Ok(())
    }

    fn set_timer(&mut self, fd: RawFd, interval: Duration) -> Result<()> {
        if !self.ctx.timer_handlers.contains_key(&fd) {
            return Err(Error::State(format!("timerfd {fd} is not registered")));
        }
        let ts = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };
        if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    // Event loop

    /// One multiplexer tick.
    pub fn run_once(&mut self, timeout_ms: i32) -> Result<()> {
        let Manager { poller, ctx, .. } = self;
        poller.run(ctx, timeout_ms)
    }

    /// Register the server socket and loop until a quit is dispatched, the
    /// peer hangs up, or the multiplexer fails.
    pub fn run(&mut self) -> Result<()> {
        let server_fd = self.ctx.server.as_raw_fd();
        let callback: Callback<Context> =
            Box::new(|ctx: &mut Context, _ev: ReadyEvent| handle_socket_readable(ctx));
        self.poller
            .register_fd(server_fd, EventFlags::IN, ConfigFlags::empty(), callback)?;

        info!("main loop for server {}", self.ctx.server.address());
        let mut result = Ok(());
        while !self.ctx.should_quit() {
            if let Err(e) = self.run_once(-1) {
                error!("exiting event loop: {e}");
                result = Err(e);
                break;
            }
        }
        self.poller.delete_fd(server_fd)?;
        result
    }
}

fn handle_socket_readable(ctx: &mut Context) {
    let buf = match ctx.server.irc().recv() {
        Ok(buf) => buf,
        Err(Error::ConnectionClosed) => {
            info!("connection closed by peer");
            ctx.request_quit();
            return;
        }
        Err(e) => {
            error!("receive failed: {e}");
            ctx.request_quit();
            return;
        }
    };
    if buf.is_empty() {
        return;
    }
    for line in tokenize_lines(&buf) {
        process_line(ctx, line);
    }
}

/// Split a receive buffer into lines on any run of `\r` / `\n`.
pub fn tokenize_lines(buf: &str) -> impl Iterator<Item = &str> {
    buf.split(['\r', '\n']).filter(|line| !line.is_empty())
}

/// Parse and dispatch one wire line. Malformed lines are logged and
/// skipped; they never terminate the worker.
pub fn process_line(ctx: &mut Context, line: &str) {
    let message = match Message::parse(line) {
        Ok(message) => message,
        Err(e) => {
            info!("skipping malformed line: {e}");
            return;
        }
    };
    debug!("{message}");
    let event = match message.into_event(ctx.server.store()) {
        Ok(event) => event,
        Err(e) => {
            info!("skipping malformed line: {e}");
            return;
        }
    };
    dispatch_event(ctx, event);
}

/// The visitor over typed message variants.
fn dispatch_event(ctx: &mut Context, event: Event) {
    match event {
        Event::Default(_) => {}
        Event::Ping(msg) => {
            info!("received PING, replying with PONG to {}", msg.pong_parameter());
            if let Err(e) = ctx.server.irc().pong(msg.pong_parameter()) {
                error!("failed to send PONG: {e}");
            }
        }
        Event::Nick(msg) => {
            info!("nickname change received, applying {}", msg.new_nickname());
            ctx.server
                .update_nickname(&msg.identity().nickname, msg.new_nickname());
        }
        Event::Join(msg) => {
            debug!("join request completion received for {}", msg.channel());
            ctx.server.update_join_channel(msg.channel());
        }
        Event::Part(msg) => {
            debug!("part request completion received for {}", msg.channel());
            ctx.server.update_part_channel(msg.channel());
        }
        Event::PrivMsg(msg) => command::dispatch(ctx, &msg),
        Event::Quit => {
            info!("quit request received, winding up");
            ctx.request_quit();
        }
    }
}
