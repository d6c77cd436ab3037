//! Version subcommand implementation

use wayport_protocol::constants::{MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

pub fn run() {
    println!("wayport {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol {PROTOCOL_VERSION} (accepts {MIN_PROTOCOL_VERSION}-{MAX_PROTOCOL_VERSION})"
    );
    println!("target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}
