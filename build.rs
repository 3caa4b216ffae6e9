// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn package_arg() -> Arg {
    Arg::new("package").required(true).help("Package name")
}

fn build_cli() -> Command {
    Command::new("pkgsync")
        .version(env!("CARGO_PKG_VERSION"))
        .author("pkgsync Contributors")
        .about("Keep a directory of package files in sync with a remote catalog")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Settings file (default: <config dir>/pkgsync/pkgsync.toml)"),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("PATH")
                .global(true)
                .help("Install directory (default: <data dir>/pkgsync/packages)"),
        )
        .arg(
            Arg::new("cache_dir")
                .long("cache-dir")
                .value_name("PATH")
                .global(true)
                .help("Catalog cache directory (default: <cache dir>/pkgsync)"),
        )
        .subcommand(
            Command::new("install")
                .about("Install a package from the repository")
                .arg(package_arg()),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove an installed package")
                .arg(package_arg()),
        )
        .subcommand(
            Command::new("update")
                .about("Update an installed package to the latest release")
                .arg(package_arg()),
        )
        .subcommand(
            Command::new("reinstall")
                .about("Remove a package and install it again from the repository")
                .arg(package_arg()),
        )
        .subcommand(
            Command::new("reinstall-untracked")
                .about("Reinstall a package that was not installed through pkgsync")
                .arg(package_arg()),
        )
        .subcommand(Command::new("update-repo").about("Refresh the package list from the repository"))
        .subcommand(Command::new("update-all").about("Update all tracked packages to the latest release"))
        .subcommand(
            Command::new("reinstall-all-untracked")
                .about("Reinstall all packages that were not installed through pkgsync"),
        )
        .subcommand(Command::new("check").about("Check installed packages against the tracked list"))
        .subcommand(
            Command::new("list")
                .about("List candidate packages for a command")
                .arg(
                    Arg::new("kind")
                        .required(true)
                        .value_parser(["install", "remove", "update", "reinstall", "reinstall-untracked"])
                        .help("Command to list candidates for"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("pkgsync.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
