use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_fields, OutputFormat};

#[derive(Debug, Serialize)]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    target_os: &'static str,
    target_arch: &'static str,
    git_hash: &'static str,
    async_support: bool,
}

impl VersionInfo {
    fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            target: option_env!("IPCORE_BUILD_TARGET").unwrap_or("unknown"),
            target_os: std::env::consts::OS,
            target_arch: std::env::consts::ARCH,
            git_hash: option_env!("GIT_HASH").unwrap_or("unknown"),
            async_support: cfg!(feature = "async"),
        }
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.to_string()),
            ("version", self.version.to_string()),
            ("target", self.target.to_string()),
            ("target_os", self.target_os.to_string()),
            ("target_arch", self.target_arch.to_string()),
            ("git_hash", self.git_hash.to_string()),
            ("async", self.async_support.to_string()),
        ]
    }
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    let info = VersionInfo::current();
    if args.extended {
        print_fields("ipcore version", &info, &info.fields(), format);
    } else {
        println!("{} {}", info.name, info.version);
    }
    Ok(SUCCESS)
}
