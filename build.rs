use std::env;
use std::fs;
use std::path::PathBuf;

// Wrapped mode embeds a statically linked virtrun-init per guest
// architecture. The blobs are produced out of band, e.g.:
//
//   cargo build --release --target x86_64-unknown-linux-musl --bin virtrun-init
//
// and picked up from $VIRTRUN_INIT_DIR (default: init-blobs/) as
// virtrun-init-<arch>. A missing blob compiles to `None` so the host tool
// still builds; wrapped mode then reports the expected path at runtime.
fn main() {
    println!("cargo:rerun-if-env-changed=VIRTRUN_INIT_DIR");
    println!("cargo:rerun-if-changed=init-blobs");

    let blob_dir = env::var_os("VIRTRUN_INIT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("init-blobs"));

    let mut table = String::new();
    for arch in ["amd64", "arm64", "riscv64"] {
        let path = blob_dir.join(format!("virtrun-init-{arch}"));
        let name = arch.to_uppercase();
        if path.is_file() {
            let abs = fs::canonicalize(&path).expect("canonicalize init blob path");
            table.push_str(&format!(
                "pub const {name}: Option<&[u8]> = Some(include_bytes!({abs:?}));\n"
            ));
        } else {
            table.push_str(&format!("pub const {name}: Option<&[u8]> = None;\n"));
        }
    }

    let out = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR not set"));
    fs::write(out.join("init_blobs.rs"), table).expect("write init blob table");
}
