use clap::CommandFactory;
use clap_complete::{generate_to, Shell};
use std::env;
use std::io::Error;

include!("src/cli.rs");

fn main() -> Result<(), Error> {
    let outdir = match env::var_os("OUT_DIR") {
        None => return Ok(()),
        Some(outdir) => outdir,
    };

    let mut app = Cli::command();
    for shell in Shell::value_variants() {
        generate_to(*shell, &mut app, "ups-hid-daemon", &outdir)?;
    }

    println!("cargo:rerun-if-changed=src/cli.rs");
    Ok(())
}
