//! User-command dispatch
//!
//! A control word arrives as the first parameter after the channel of a
//! PRIVMSG, in the form `":" + prefix + name` with prefix `,`. Dispatch
//! checks the process-wide built-in map first, then the server's
//! plugin-command map, and silently drops anything unrecognized. Every
//! command declares an inclusive argument-count range that is enforced
//! before its handler runs.

use crate::manager::Context;
use crate::message::{PrivMsg, COMMAND_PREFIX};
use crate::plugin::{PluginHandle, PluginHelpContext};
use crate::store::Capability;
use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::{error, warn};

/// Handler signature shared by built-in and plugin commands.
pub type CommandFn = fn(&mut Context, &PrivMsg);

/// A dispatchable command: an inclusive argument-count range and the
/// handler to run when the count is in range.
#[derive(Clone, Copy)]
pub struct UserCommand {
    pub min_args: usize,
    pub max_args: usize,
    pub handler: CommandFn,
}

impl UserCommand {
    pub const fn new(min_args: usize, max_args: usize, handler: CommandFn) -> Self {
        Self {
            min_args,
            max_args,
            handler,
        }
    }
}

fn command_key(name: &str) -> String {
    format!(":{COMMAND_PREFIX}{name}")
}

lazy_static! {
    /// The built-in command map. Process-wide and immutable after
    /// initialization, so dispatch reads it without locking.
    static ref BUILTIN_COMMANDS: HashMap<String, UserCommand> = {
        let mut map = HashMap::new();
        map.insert(command_key("hi"), UserCommand::new(0, 0, builtin_hi as CommandFn));
        map.insert(command_key("nick"), UserCommand::new(1, 1, builtin_nick as CommandFn));
        map.insert(command_key("join"), UserCommand::new(1, 1, builtin_join as CommandFn));
        map.insert(command_key("part"), UserCommand::new(1, 1, builtin_part as CommandFn));
        map.insert(command_key("load"), UserCommand::new(1, 1, builtin_load as CommandFn));
        map.insert(command_key("unload"), UserCommand::new(1, 1, builtin_unload as CommandFn));
        map.insert(command_key("help"), UserCommand::new(0, 1, builtin_help as CommandFn));
        map
    };
}

/// Send a reply addressed to the invoker. The target is the message's
/// channel, unless the message was sent privately to the bot itself, in
/// which case the reply goes back to the invoker's nickname.
pub fn send_invoker_reply(ctx: &mut Context, msg: &PrivMsg, reply: &str) {
    let nickname = &msg.identity().nickname;
    let target = if msg.channel() == ctx.server.nickname() {
        nickname.as_str()
    } else {
        msg.channel()
    };
    if let Err(e) = ctx.server.send_channel(target, &format!("{nickname}: {reply}")) {
        error!("failed to send reply to {target}: {e}");
    }
}

/// True iff the invoker holds one of the required capability bits. Replies
/// with a denial otherwise; unknown identities fail closed.
pub fn invoker_permission_check(ctx: &mut Context, msg: &PrivMsg, required: Capability) -> bool {
    if ctx.server.store().is_capable(msg.identity(), required) {
        true
    } else {
        send_invoker_reply(ctx, msg, "Error: Permission denied.");
        false
    }
}

/// Dispatch one PRIVMSG: built-ins first, then the server's plugin-command
/// map, then a silent drop. The map's read lock is taken only after the
/// built-in miss and released before the handler runs, so the load and
/// unload built-ins can take the write lock mid-dispatch.
pub fn dispatch(ctx: &mut Context, msg: &PrivMsg) {
    let Some(name) = msg.user_command() else {
        return;
    };
    let command = match BUILTIN_COMMANDS.get(name) {
        Some(command) => *command,
        None => match ctx.server.user_command(name) {
            Some(command) => command,
            None => return,
        },
    };
    let argc = msg.command_parameters().len();
    if argc < command.min_args || argc > command.max_args {
        send_invoker_reply(
            ctx,
            msg,
            "Incorrect number of arguments passed to command, see ,help",
        );
        return;
    }
    (command.handler)(ctx, msg);
}

// Builtin user commands

fn builtin_hi(ctx: &mut Context, msg: &PrivMsg) {
    send_invoker_reply(ctx, msg, "Hello!");
}

fn builtin_nick(ctx: &mut Context, msg: &PrivMsg) {
    if invoker_permission_check(ctx, msg, Capability::NICK_MODIFY) {
        ctx.server.set_nickname(&msg.command_parameters()[0]);
    }
}

fn builtin_join(ctx: &mut Context, msg: &PrivMsg) {
    if invoker_permission_check(ctx, msg, Capability::JOIN) {
        if let Err(e) = ctx.server.join_channel(&msg.command_parameters()[0]) {
            error!("join command failed: {e}");
        }
    }
}

fn builtin_part(ctx: &mut Context, msg: &PrivMsg) {
    if invoker_permission_check(ctx, msg, Capability::PART) {
        let channel = msg.command_parameters()[0].clone();
        if ctx.server.part_channel(&channel).is_err() {
            send_invoker_reply(ctx, msg, "No such channel.");
        }
    }
}

fn builtin_load(ctx: &mut Context, msg: &PrivMsg) {
    if !invoker_permission_check(ctx, msg, Capability::ADMIN) {
        return;
    }
    let name = msg.command_parameters()[0].clone();
    if ctx.server.has_plugin(&name) {
        send_invoker_reply(ctx, msg, "Plugin already loaded.");
        return;
    }
    let handle = match PluginHandle::open(&name) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("failed to load plugin {name}: {e}");
            send_invoker_reply(ctx, msg, "Failed to load plugin.");
            return;
        }
    };
    let server: *mut crate::server::Server = &mut ctx.server;
    if let Err(e) = unsafe { handle.register(server) } {
        warn!("failed to register plugin {name}: {e}");
        send_invoker_reply(ctx, msg, "Failed to load plugin.");
        return;
    }
    ctx.server.insert_plugin(name, handle);
    send_invoker_reply(ctx, msg, "Plugin loaded.");
}

fn builtin_unload(ctx: &mut Context, msg: &PrivMsg) {
    if !invoker_permission_check(ctx, msg, Capability::ADMIN) {
        return;
    }
    let name = &msg.command_parameters()[0];
    let Some(handle) = ctx.server.take_plugin(name) else {
        send_invoker_reply(ctx, msg, "No such plugin.");
        return;
    };
    // The plugin drops its command-map entries before the module unloads.
    let server: *mut crate::server::Server = &mut ctx.server;
    if let Err(e) = unsafe { handle.delete(server) } {
        warn!("failed to run delete entry of plugin {name}: {e}");
    }
    drop(handle);
    send_invoker_reply(ctx, msg, "Plugin unloaded.");
}

fn builtin_help(ctx: &mut Context, msg: &PrivMsg) {
    match msg.command_parameters().first() {
        None => {
            let mut reply =
                String::from("Commands available: hi, nick, join, part, load, unload, help");
            let plugins = ctx.server.plugin_names();
            if !plugins.is_empty() {
                reply.push_str("; loaded plugins: ");
                reply.push_str(&plugins.join(", "));
            }
            send_invoker_reply(ctx, msg, &reply);
        }
        Some(name) => {
            // The handle is parked outside the registry for the duration of
            // the call so the help context can borrow the whole manager.
            let Some(handle) = ctx.server.take_plugin(name) else {
                send_invoker_reply(ctx, msg, "No such plugin.");
                return;
            };
            let name = name.clone();
            {
                let mut help_ctx = PluginHelpContext {
                    manager: ctx,
                    message: msg,
                };
                if let Err(e) = unsafe { handle.help(&mut help_ctx) } {
                    warn!("failed to run help entry of plugin {name}: {e}");
                }
            }
            ctx.server.insert_plugin(name, handle);
        }
    }
}
