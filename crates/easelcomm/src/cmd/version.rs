use easelcomm::link::HandshakeConfig;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("easelcomm {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let handshake = HandshakeConfig::default();
    println!("name: easelcomm");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "link_protocol: {} {}",
        handshake.protocol_name, handshake.protocol_version
    );
    println!(
        "build_target: {}",
        option_env!("EASELCOMM_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("features: model={}, cli=true", cfg!(feature = "model"));

    Ok(SUCCESS)
}
