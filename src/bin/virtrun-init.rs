//! Guest init: PID 1 inside the virtrun virtual machine.
//!
//! Built as a statically linked binary (musl targets) and embedded into
//! the host tool, which places it at `/init` in the initramfs:
//!
//! ```sh
//! cargo build --release --target x86_64-unknown-linux-musl --bin virtrun-init
//! ```

fn main() {
    // RUST_LOG reaches us through the kernel command line environment
    env_logger::init();
    virtrun::guest::run()
}
