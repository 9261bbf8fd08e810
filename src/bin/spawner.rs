//! `leash-spawner` — the fd hand-off helper.
//!
//! Invoked by the controller as
//! `leash-spawner <socket-path> <cmd-abs-path> [arg …]`. The argv after the
//! socket path is the target command verbatim, so no option parsing happens
//! here: the first two positionals are the protocol.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process;

fn main() {
    let mut args: Vec<OsString> = std::env::args_os().skip(1).collect();
    if args.len() < 2 {
        eprintln!("usage: leash-spawner <socket-path> <cmd-abs-path> [arg ...]");
        process::exit(2);
    }
    let socket_path = PathBuf::from(args.remove(0));

    match leash::spawner::run(&socket_path, &args) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("leash-spawner: {err}");
            process::exit(1);
        }
    }
}
