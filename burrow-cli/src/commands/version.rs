//! Version subcommand

pub fn run() {
    println!("burrow {}", env!("CARGO_PKG_VERSION"));
    println!("protocol version {}", burrow_protocol::constants::PROTO_VERSION);
}
