use std::path::PathBuf;
use std::process::ExitCode;

use imgmount::{mount, MountOptions};
use tracing::error;

const USAGE: &str = "usage: imgmount <image> [options.json]";

fn main() -> ExitCode {
    // Control log level with RUST_LOG, e.g.
    //   RUST_LOG=imgmount::trackfile=trace imgmount disc.cue
    imgmount::logging::init();

    let mut args = std::env::args_os().skip(1);
    let Some(image) = args.next().map(PathBuf::from) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    let options = match args.next().map(PathBuf::from) {
        Some(profile) => match MountOptions::from_json_file(&profile) {
            Ok(options) => options,
            Err(e) => {
                error!(error = %e, "Could not load mount options");
                return ExitCode::FAILURE;
            }
        },
        None => MountOptions::default(),
    };

    let mounted = match mount(&image, &options) {
        Ok(mounted) => mounted,
        Err(e) => {
            error!(path = %image.display(), error = %e, "Mount failed");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&mounted.info()) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!(error = %e, "Could not serialize mount summary");
            return ExitCode::FAILURE;
        }
    }
    if let Some(disc) = mounted.as_cdrom() {
        disc.shutdown();
    }
    ExitCode::SUCCESS
}
