//! `pinns`: pins a chosen set of namespaces to files under a directory so
//! they outlive the process that created them (spec §4.9).

use anyhow::Result;
use clap::{crate_version, Parser};
use conmon::pinns::{run, NsKind, NsRequest, PinRequest};

const HOST_PASSTHROUGH: &str = "host";

#[derive(Parser, Debug)]
#[clap(
    name = "pinns",
    version(crate_version!()),
    after_help("More info at: https://github.com/containers/conmon")
)]
struct Args {
    /// Directory to pin the namespaces under.
    #[clap(long("dir"), short('d'), value_name("PATH"))]
    dir: String,

    /// File name to use for each pinned namespace (default: the namespace kind).
    #[clap(long("file-name"), value_name("NAME"), default_value("ns"))]
    file_name: String,

    /// Pin a uts namespace. Pass "host" to bind the host's instead of a fresh one.
    #[clap(long("uts"), value_name("host"))]
    uts: Option<Option<String>>,

    /// Pin an ipc namespace. Pass "host" to bind the host's instead of a fresh one.
    #[clap(long("ipc"), value_name("host"))]
    ipc: Option<Option<String>>,

    /// Pin a net namespace. Pass "host" to bind the host's instead of a fresh one.
    #[clap(long("net"), value_name("host"))]
    net: Option<Option<String>>,

    /// Pin a user namespace. Pass "host" to bind the host's instead of a fresh one.
    #[clap(long("user"), value_name("host"))]
    user: Option<Option<String>>,

    /// Pin a cgroup namespace. Pass "host" to bind the host's instead of a fresh one.
    #[clap(long("cgroup"), value_name("host"))]
    cgroup: Option<Option<String>>,

    /// Pin a mount namespace.
    #[clap(long("mnt"))]
    mnt: bool,

    /// A sysctl to apply after unsharing, as `key=value`. May be repeated,
    /// or a single legacy `+`-joined batch (SPEC_FULL.md §C).
    #[clap(long("sysctl"), short('s'), multiple_occurrences(true), value_name("KEY=VALUE"))]
    sysctl: Vec<String>,

    /// uid map string, `@`-separated lines and `-`-separated fields.
    #[clap(long("uid-map"), value_name("MAP"))]
    uid_map: Option<String>,

    /// gid map string, `@`-separated lines and `-`-separated fields.
    #[clap(long("gid-map"), value_name("MAP"))]
    gid_map: Option<String>,
}

fn opt_to_request(kind: NsKind, opt: &Option<Option<String>>) -> Option<NsRequest> {
    opt.as_ref().map(|inner| NsRequest {
        kind,
        host_passthrough: inner.as_deref() == Some(HOST_PASSTHROUGH),
    })
}

fn parse_sysctls(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .flat_map(|entry| entry.split('+'))
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut namespaces = Vec::new();
    namespaces.extend(opt_to_request(NsKind::Uts, &args.uts));
    namespaces.extend(opt_to_request(NsKind::Ipc, &args.ipc));
    namespaces.extend(opt_to_request(NsKind::Net, &args.net));
    namespaces.extend(opt_to_request(NsKind::User, &args.user));
    namespaces.extend(opt_to_request(NsKind::Cgroup, &args.cgroup));
    if args.mnt {
        namespaces.push(NsRequest {
            kind: NsKind::Mnt,
            host_passthrough: false,
        });
    }

    if namespaces.is_empty() {
        eprintln!("No namespace specified for pinning");
        std::process::exit(1);
    }

    let req = PinRequest {
        pin_dir: args.dir.into(),
        file_name: args.file_name,
        namespaces,
        sysctls: parse_sysctls(&args.sysctl),
        uid_map: args.uid_map,
        gid_map: args.gid_map,
    };

    if let Err(e) = run(&req) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
