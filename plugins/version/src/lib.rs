//! Reference dynamic plugin
//!
//! Adds a single `,version` command. Built as a cdylib, dropped next to the
//! bot binary as `libversion.so` and loaded from chat with `,load version`.

use rustbot_core::{
    send_invoker_reply, CommandFn, Context, PluginHelpContext, PrivMsg, Server, UserCommand,
};
use std::os::raw::c_void;

const COMMANDS: &[(&str, UserCommand)] = &[(
    ":,version",
    UserCommand::new(0, 0, version_command as CommandFn),
)];

fn version_command(ctx: &mut Context, msg: &PrivMsg) {
    send_invoker_reply(ctx, msg, "Beta.");
}

/// # Safety
/// `server` must point at the Server loading this plugin.
#[no_mangle]
pub unsafe extern "C" fn RegisterPluginCommands_version(server: *mut c_void) {
    let server = unsafe { &*server.cast::<Server>() };
    for (name, command) in COMMANDS {
        server.add_plugin_command(name, *command);
    }
}

/// # Safety
/// `server` must point at the Server that loaded this plugin.
#[no_mangle]
pub unsafe extern "C" fn DeletePluginCommands_version(server: *mut c_void) {
    let server = unsafe { &*server.cast::<Server>() };
    for (name, _) in COMMANDS {
        server.remove_plugin_command(name);
    }
}

/// # Safety
/// `ctx` must point at a live help context for the invoking message.
#[no_mangle]
pub unsafe extern "C" fn HelpPluginCommands_version(ctx: *mut c_void) {
    let help = unsafe { &mut *ctx.cast::<PluginHelpContext>() };
    send_invoker_reply(help.manager, help.message, "Usage: ,version");
}
