//! pesign command-line front-end.
//!
//! Flag parsing and logging setup only; every operation runs through the
//! library dispatcher, and the process exits exactly once, here.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};

use pesign::{dispatch, DigestKind, OperationDescriptor, Outcome};

const DEFAULT_CERT_DIR: &str = "/etc/pki/pesign";

fn cli() -> Command {
    // The short help flag is surrendered to --hash; help stays long-only.
    Command::new("pesign")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign, inspect and manipulate Authenticode signatures on PE binaries")
        .disable_help_flag(true)
        .arg(
            Arg::new("help")
                .long("help")
                .action(ArgAction::Help)
                .help("print help"),
        )
        .arg(
            Arg::new("in")
                .short('i')
                .long("in")
                .value_name("infile")
                .help("specify input file"),
        )
        .arg(
            Arg::new("out")
                .short('o')
                .long("out")
                .value_name("outfile")
                .help("specify output file"),
        )
        .arg(
            Arg::new("certificate")
                .short('c')
                .long("certificate")
                .value_name("nickname")
                .help("specify certificate nickname"),
        )
        .arg(
            Arg::new("certdir")
                .short('n')
                .long("certdir")
                .value_name("directory")
                .default_value(DEFAULT_CERT_DIR)
                .help("specify certificate database directory"),
        )
        .arg(
            Arg::new("force")
                .short('f')
                .long("force")
                .action(ArgAction::SetTrue)
                .help("force overwriting of output file"),
        )
        .arg(
            Arg::new("sign")
                .short('s')
                .long("sign")
                .action(ArgAction::SetTrue)
                .help("create a new signature"),
        )
        .arg(
            Arg::new("hash")
                .short('h')
                .long("hash")
                .action(ArgAction::SetTrue)
                .help("hash binary"),
        )
        .arg(
            Arg::new("digest_type")
                .short('d')
                .long("digest_type")
                .value_name("type")
                .default_value("sha256")
                .help("digest type to use for pe hash"),
        )
        .arg(
            Arg::new("import-signature")
                .short('m')
                .long("import-signature")
                .value_name("insig")
                .help("import signature from file"),
        )
        .arg(
            Arg::new("export-signed-attributes")
                .short('E')
                .long("export-signed-attributes")
                .value_name("file")
                .help("export signed attributes to file"),
        )
        .arg(
            Arg::new("import-signed-attributes")
                .short('I')
                .long("import-signed-attributes")
                .value_name("file")
                .help("import signed attributes from file"),
        )
        .arg(
            Arg::new("import-raw-signature")
                .short('R')
                .long("import-raw-signature")
                .value_name("inraw")
                .help("import raw signature from file"),
        )
        .arg(
            Arg::new("signature-number")
                .short('u')
                .long("signature-number")
                .value_name("sig-number")
                .default_value("0")
                .help("specify which signature to operate on"),
        )
        .arg(
            Arg::new("list-signatures")
                .short('l')
                .long("list-signatures")
                .action(ArgAction::SetTrue)
                .help("list signatures"),
        )
        .arg(
            Arg::new("show-signature")
                .short('S')
                .long("show-signature")
                .action(ArgAction::SetTrue)
                .help("show signature"),
        )
        .arg(
            Arg::new("remove-signature")
                .short('r')
                .long("remove-signature")
                .action(ArgAction::SetTrue)
                .help("remove signature"),
        )
        .arg(
            Arg::new("export-signature")
                .short('e')
                .long("export-signature")
                .value_name("outsig")
                .help("export signature to file"),
        )
        .arg(
            Arg::new("export-pubkey")
                .short('K')
                .long("export-pubkey")
                .value_name("outkey")
                .help("export pubkey to file"),
        )
        .arg(
            Arg::new("export-cert")
                .short('C')
                .long("export-cert")
                .value_name("outcert")
                .help("export signing cert to file"),
        )
        .arg(
            Arg::new("ascii-armor")
                .short('a')
                .long("ascii-armor")
                .action(ArgAction::SetTrue)
                .help("use ascii armoring"),
        )
        .arg(
            Arg::new("daemonize")
                .short('D')
                .long("daemonize")
                .action(ArgAction::SetTrue)
                .help("run as a daemon process"),
        )
        .arg(
            Arg::new("nofork")
                .short('N')
                .long("nofork")
                .action(ArgAction::SetTrue)
                .help("don't fork when daemonizing"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("be very verbose"),
        )
        .arg(
            Arg::new("padding")
                .short('P')
                .long("padding")
                .action(ArgAction::SetTrue)
                .help("pad data section"),
        )
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("pesign: {message}");
    ExitCode::from(1)
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    let verbose = matches.get_flag("verbose");
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "info" } else { "warn" }),
    )
    .init();

    let digest_name = matches
        .get_one::<String>("digest_type")
        .map(String::as_str)
        .unwrap_or("sha256");
    if digest_name == "help" {
        println!("Supported digests:");
        for kind in DigestKind::ALL {
            println!("\t{}", kind.as_str());
        }
        return ExitCode::SUCCESS;
    }
    let Some(digest) = DigestKind::from_name(digest_name) else {
        return fail(format_args!("Digest \"{digest_name}\" not found."));
    };

    let signum = match matches
        .get_one::<String>("signature-number")
        .map(String::as_str)
        .unwrap_or("0")
        .parse::<i64>()
    {
        Ok(n) => n,
        Err(e) => return fail(format_args!("invalid signature number: {e}")),
    };

    let path_of = |name: &str| matches.get_one::<String>(name).map(PathBuf::from);
    let descriptor = OperationDescriptor {
        in_path: path_of("in"),
        out_path: path_of("out"),
        raw_sig_in: path_of("import-raw-signature"),
        sattrs_in: path_of("import-signed-attributes"),
        sattrs_out: path_of("export-signed-attributes"),
        sig_in: path_of("import-signature"),
        sig_out: path_of("export-signature"),
        pubkey_out: path_of("export-pubkey"),
        cert_out: path_of("export-cert"),
        cert_nickname: matches.get_one::<String>("certificate").cloned(),
        cert_dir: path_of("certdir").unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_DIR)),
        signum,
        digest,
        sign: matches.get_flag("sign"),
        hash: matches.get_flag("hash"),
        remove: matches.get_flag("remove-signature"),
        list: matches.get_flag("list-signatures") || matches.get_flag("show-signature"),
        force: matches.get_flag("force"),
        ascii_armor: matches.get_flag("ascii-armor"),
        padding: matches.get_flag("padding"),
        verbose,
        daemonize: matches.get_flag("daemonize"),
        nofork: matches.get_flag("nofork"),
    };

    match dispatch::run(&descriptor) {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::NothingToDo) => {
            eprintln!("pesign: Nothing to do.");
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}
