//! Mounts a host directory and an in-memory scratch space under one
//! composed namespace, then walks and prints it.
//!
//! ```sh
//! cargo run --example mirror -- --dir /tmp/export
//! ```

use std::sync::Arc;

use clap::Parser;

use mosaicfs::fs::util;
use mosaicfs::local::LocalFs;
use mosaicfs::memory::MemoryFs;
use mosaicfs::walk::{walk, Walk};
use mosaicfs::{Config, Fs as _, Root};

#[derive(Parser)]
#[command(about = "Expose a host directory through a composed virtual namespace")]
struct Args {
    /// Host directory to mount at /data.
    #[arg(long)]
    dir: std::path::PathBuf,

    /// Directory for persistent handle databases.
    #[arg(long)]
    handle_storage: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config { persistent_storage: args.handle_storage, ..Config::default() };

    let root = Root::new(config);
    root.mount("/data", Arc::new(LocalFs::new(&args.dir)), 1).await?;

    let scratch = Arc::new(MemoryFs::new());
    util::write_file(scratch.as_ref(), "/readme.txt", b"scratch space\n").await?;
    root.mount("/scratch", scratch, 2).await?;

    walk(&root, "/", &mut |path, info, err| {
        match (info, err) {
            (Some(info), None) => {
                let kind = if info.is_dir() { "dir " } else { "file" };
                println!("{kind} {path} ({} bytes)", info.size);
            }
            (_, Some(err)) => println!("err  {path}: {err}"),
            _ => {}
        }
        Ok(Walk::Continue)
    })
    .await?;

    root.close().await?;
    Ok(())
}
