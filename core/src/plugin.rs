//! Dynamic command plugins
//!
//! A plugin is a shared object at `./lib<name>.so` (platform equivalent)
//! exporting three C-callable entry points, each taking one opaque pointer:
//!
//! - `RegisterPluginCommands_<name>` — called with the owning [`Server`];
//!   the plugin adds its `(command, callback)` pairs to the command map.
//! - `DeletePluginCommands_<name>` — called with the Server; the plugin
//!   removes exactly the commands it added.
//! - `HelpPluginCommands_<name>` — called with a [`PluginHelpContext`]; the
//!   plugin replies with its usage text.
//!
//! The handle owns the loaded library; dropping it unloads the module. The
//! Server removes the plugin's command entries before the handle is dropped,
//! otherwise a later dispatch could call into unmapped memory.

use crate::manager::Context;
use crate::message::PrivMsg;
use crate::server::Server;
use crate::{Error, Result};
use libloading::{Library, Symbol};
use std::env;
use std::os::raw::c_void;

const REGISTER_PREFIX: &str = "RegisterPluginCommands_";
const DELETE_PREFIX: &str = "DeletePluginCommands_";
const HELP_PREFIX: &str = "HelpPluginCommands_";

/// The signature shared by all three entry points.
pub type PluginEntryFn = unsafe extern "C" fn(*mut c_void);

/// What the help entry point receives: the invoking manager context and the
/// message that asked for help.
pub struct PluginHelpContext<'a> {
    pub manager: &'a mut Context,
    pub message: &'a PrivMsg,
}

/// Ownership of one loaded plugin module.
pub struct PluginHandle {
    name: String,
    library: Library,
}

impl PluginHandle {
    /// Load `./lib<name>.so` relative to the process working directory.
    /// Succeeds only when the module opens and all three well-known symbols
    /// resolve, so a handle is never retained for a half-usable module.
    pub fn open(name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(Error::PluginLoad(format!("invalid plugin name: {name}")));
        }
        let path = env::current_dir()
            .map_err(Error::Io)?
            .join(format!("{}{name}{}", env::consts::DLL_PREFIX, env::consts::DLL_SUFFIX));
        let library = unsafe { Library::new(&path) }
            .map_err(|e| Error::PluginLoad(format!("{}: {e}", path.display())))?;
        let handle = Self {
            name: name.to_string(),
            library,
        };
        handle.entry(REGISTER_PREFIX)?;
        handle.entry(DELETE_PREFIX)?;
        handle.entry(HELP_PREFIX)?;
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry(&self, prefix: &str) -> Result<Symbol<'_, PluginEntryFn>> {
        let symbol = format!("{prefix}{}", self.name);
        unsafe { self.library.get(symbol.as_bytes()) }
            .map_err(|e| Error::PluginLoad(format!("symbol {symbol} not found: {e}")))
    }

    /// Run the registration entry point.
    ///
    /// # Safety
    /// `server` must point at the live Server that owns this handle, and the
    /// plugin must not retain the pointer past the matching [`delete`] call.
    ///
    /// [`delete`]: PluginHandle::delete
    pub unsafe fn register(&self, server: *mut Server) -> Result<()> {
        let f = self.entry(REGISTER_PREFIX)?;
        unsafe { f(server.cast::<c_void>()) };
        Ok(())
    }

    /// Run the deletion entry point.
    ///
    /// # Safety
    /// As for [`register`](PluginHandle::register).
    pub unsafe fn delete(&self, server: *mut Server) -> Result<()> {
        let f = self.entry(DELETE_PREFIX)?;
        unsafe { f(server.cast::<c_void>()) };
        Ok(())
    }

    /// Run the help entry point.
    ///
    /// # Safety
    /// `ctx` must point at a live [`PluginHelpContext`] for the duration of
    /// the call.
    pub unsafe fn help(&self, ctx: *mut PluginHelpContext<'_>) -> Result<()> {
        let f = self.entry(HELP_PREFIX)?;
        unsafe { f(ctx.cast::<c_void>()) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_module_fails() {
        let err = match PluginHandle::open("definitely_not_present") {
            Ok(_) => panic!("expected plugin load error"),
            Err(e) => e,
        };
        match err {
            Error::PluginLoad(msg) => assert!(msg.contains("definitely_not_present")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_path_escapes_rejected() {
        assert!(PluginHandle::open("").is_err());
        assert!(PluginHandle::open("../evil").is_err());
        assert!(PluginHandle::open("dir/evil").is_err());
    }
}
