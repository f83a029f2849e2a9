//! IPC codec and wire protocol: MessagePack framing.

pub mod codec;
pub mod protocol;

use std::path::PathBuf;

/// Default daemon socket: `$XDG_RUNTIME_DIR/waitd/waitd.sock`.
///
/// `None` when `$XDG_RUNTIME_DIR` is not set.
pub fn default_socket_path() -> Option<PathBuf> {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")?;
    Some(PathBuf::from(runtime_dir).join("waitd").join("waitd.sock"))
}
