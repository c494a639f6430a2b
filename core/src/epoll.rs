//! Readiness multiplexer
//!
//! A thin wrapper over the kernel's epoll facility. File descriptors are
//! registered with a callback and an event/config mask; [`EpollManager::run`]
//! performs one wait-and-dispatch tick. Callbacks receive the owning context
//! `C` by exclusive borrow, which is how per-thread state reaches handlers
//! without shared-pointer indirection.

use crate::{Error, Result};
use bitflags::bitflags;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

bitflags! {
    /// Readiness event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const IN = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
        const PRI = libc::EPOLLPRI as u32;
    }
}

bitflags! {
    /// Registration behavior bits, kept separate from readiness events so
    /// one cannot be smuggled in as the other.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConfigFlags: u32 {
        const EDGE_TRIGGERED = libc::EPOLLET as u32;
        const ONESHOT = libc::EPOLLONESHOT as u32;
        const WAKEUP = libc::EPOLLWAKEUP as u32;
        const EXCLUSIVE = libc::EPOLLEXCLUSIVE as u32;
    }
}

/// One readiness report handed to a callback.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub events: EventFlags,
}

/// Per-fd dispatch callback.
pub type Callback<C> = Box<dyn FnMut(&mut C, ReadyEvent)>;

/// A static hook attached to the loop itself rather than to an fd.
pub type Hook = Box<dyn FnMut()>;

/// Where a static hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticEventKind {
    /// At the start of every `run` call.
    Pre,
    /// At the end of every `run` call.
    Post,
    /// When the multiplexer is destroyed.
    Exit,
}

struct FdEntry<C> {
    events: EventFlags,
    config: ConfigFlags,
    callback: Callback<C>,
    enabled: bool,
}

/// The multiplexer. `C` is the context type threaded into callbacks.
pub struct EpollManager<C> {
    epfd: RawFd,
    entries: HashMap<RawFd, FdEntry<C>>,
    pre_hooks: Vec<Hook>,
    post_hooks: Vec<Hook>,
    exit_hooks: Vec<Hook>,
}

impl<C> EpollManager<C> {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Resource(format!(
                "failed to create epoll instance: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(Self {
            epfd,
            entries: HashMap::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            exit_hooks: Vec::new(),
        })
    }

    /// Attach a hook to the loop. Hooks of one kind run in registration
    /// order.
    pub fn register_static_event(&mut self, kind: StaticEventKind, hook: Hook) {
        match kind {
            StaticEventKind::Pre => self.pre_hooks.push(hook),
            StaticEventKind::Post => self.post_hooks.push(hook),
            StaticEventKind::Exit => self.exit_hooks.push(hook),
        }
    }

    /// Add an fd with its callback; enabled by default. Fails if the fd is
    /// already registered.
    pub fn register_fd(
        &mut self,
        fd: RawFd,
        events: EventFlags,
        config: ConfigFlags,
        callback: Callback<C>,
    ) -> Result<()> {
        if self.entries.contains_key(&fd) {
            return Err(Error::State(format!("fd {fd} is already registered")));
        }
        let mut ev = libc::epoll_event {
            events: events.bits() | config.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        self.entries.insert(
            fd,
            FdEntry {
                events,
                config,
                callback,
                enabled: true,
            },
        );
        Ok(())
    }

    /// Re-attach a disabled fd's callback without touching the kernel
    /// registration.
    pub fn enable_fd(&mut self, fd: RawFd) -> Result<()> {
        self.entry_mut(fd)?.enabled = true;
        Ok(())
    }

    /// Keep the entry but stop invoking its callback.
    pub fn disable_fd(&mut self, fd: RawFd) -> Result<()> {
        self.entry_mut(fd)?.enabled = false;
        Ok(())
    }

    /// Replace the readiness mask, preserving config bits.
    pub fn modify_fd_events(&mut self, fd: RawFd, events: EventFlags) -> Result<()> {
        let epfd = self.epfd;
        let entry = self.entry_mut(fd)?;
        let mut ev = libc::epoll_event {
            events: events.bits() | entry.config.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        entry.events = events;
        Ok(())
    }

    /// Replace the config bits, preserving the readiness mask. `EXCLUSIVE`
    /// is rejected here; the kernel only accepts it at registration.
    pub fn modify_fd_config(&mut self, fd: RawFd, config: ConfigFlags) -> Result<()> {
        if config.contains(ConfigFlags::EXCLUSIVE) {
            return Err(Error::State(
                "exclusive wakeup may not be set via modify".to_string(),
            ));
        }
        let epfd = self.epfd;
        let entry = self.entry_mut(fd)?;
        let mut ev = libc::epoll_event {
            events: entry.events.bits() | config.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        entry.config = config;
        Ok(())
    }

    /// Replace the callback slot.
    pub fn modify_fd_callback(&mut self, fd: RawFd, callback: Callback<C>) -> Result<()> {
        self.entry_mut(fd)?.callback = callback;
        Ok(())
    }

    /// Remove the entry and the kernel registration.
    pub fn delete_fd(&mut self, fd: RawFd) -> Result<()> {
        if self.entries.remove(&fd).is_none() {
            return Err(Error::State(format!("fd {fd} is not registered")));
        }
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } < 0
        {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    /// One tick: pre-hooks, one wait, dispatch to enabled callbacks,
    /// post-hooks. A wait interrupted by a signal is retried. A readiness
    /// report for an fd missing from the table fails the tick.
    pub fn run(&mut self, ctx: &mut C, timeout_ms: i32) -> Result<()> {
        for hook in &mut self.pre_hooks {
            hook();
        }

        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.entries.len().max(1)];
        let ready = loop {
            let r = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            }
            break r as usize;
        };

        for ev in &events[..ready] {
            let fd = ev.u64 as RawFd;
            let report = ReadyEvent {
                fd,
                events: EventFlags::from_bits_truncate(ev.events),
            };
            match self.entries.get_mut(&fd) {
                None => {
                    // Polled but not in the table, something is borked.
                    return Err(Error::State(format!(
                        "fd {fd} reported ready but is not registered"
                    )));
                }
                Some(entry) if entry.enabled => (entry.callback)(ctx, report),
                Some(_) => {}
            }
        }

        for hook in &mut self.post_hooks {
            hook();
        }
        Ok(())
    }

    fn entry_mut(&mut self, fd: RawFd) -> Result<&mut FdEntry<C>> {
        self.entries
            .get_mut(&fd)
            .ok_or_else(|| Error::State(format!("fd {fd} is not registered")))
    }
}

impl<C> Drop for EpollManager<C> {
    fn drop(&mut self) {
        for hook in &mut self.exit_hooks {
            hook();
        }
        unsafe { libc::close(self.epfd) };
    }
}
