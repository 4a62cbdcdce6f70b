use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

/// Pure clap command definitions with zero business logic
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new(env!("CARGO_PKG_NAME"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("uri")
                .action(ArgAction::Append)
                .env("TLSPULSE_URI")
                .help("URI to check, repeat for more targets")
                .long("uri")
                .long_help(
                    "URI of an endpoint to check, repeat the flag for more targets.\n\
                    The scheme selects how the connection is upgraded to TLS:\n\n\
                    - smtp, submission: SMTP STARTTLS\n\
                    - imap: IMAP STARTTLS\n\
                    - ldap: LDAP StartTLS extended operation\n\
                    - mysql: MySQL SSLRequest\n\
                    - postgres, postgresql: PostgreSQL SSLRequest\n\
                    - anything else (https, smtps, imaps, ldaps, ...): TLS from the first byte\n\n\
                    Examples: https://example.com, smtp://mail.example.com, \
                    postgres://db.example.com:5433\n\n\
                    TLSPULSE_URI accepts a comma separated list."
                )
                .short('u')
                .value_delimiter(',')
                .value_name("URI")
                .required(true),
        )
        .arg(
            Arg::new("checks")
                .default_value("identity,not-after,not-before,ocsp,trust")
                .env("TLSPULSE_CHECKS")
                .help("Comma separated list of checks to run")
                .long("checks")
                .long_help(
                    "Comma separated list of certificate checks:\n\n\
                    - identity: certificate names match the URI host\n\
                    - not-after: expiration against the renewal window\n\
                    - not-before: certificate already valid\n\
                    - ocsp: revocation status from the OCSP responder\n\
                    - trust: chain verifies against the trusted roots\n\n\
                    Availability is always reported."
                )
                .value_name("CHECKS"),
        )
        .arg(
            Arg::new("renewal-days")
                .default_value("90")
                .env("TLSPULSE_RENEWAL_DAYS")
                .help("Longest renewal window, in days")
                .long("renewal-days")
                .value_name("DAYS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("renewal-ratio")
                .default_value("0.3333333333333333")
                .env("TLSPULSE_RENEWAL_RATIO")
                .help("Share of the certificate lifetime that makes up the renewal window")
                .long("renewal-ratio")
                .long_help(
                    "Share of the certificate lifetime that makes up the renewal window,\n\
                    capped by --renewal-days. The not-after check turns warning in the middle\n\
                    third of the window and critical in its last third."
                )
                .value_name("RATIO")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("trust")
                .action(ArgAction::Append)
                .env("TLSPULSE_TRUST")
                .help("Additional CA certificate file or directory to trust")
                .long("trust")
                .long_help(
                    "Additional CA certificate (PEM or DER) to trust besides the bundled roots.\n\
                    A directory adds every certificate it contains. Repeat for more paths.\n\n\
                    Example: /etc/ssl/private-ca"
                )
                .value_name("PATH"),
        )
        .arg(
            Arg::new("resolvers")
                .default_value("5")
                .env("TLSPULSE_RESOLVERS")
                .help("Number of concurrent resolver tasks")
                .long("resolvers")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("workers")
                .default_value("20")
                .env("TLSPULSE_WORKERS")
                .help("Number of concurrent worker tasks")
                .long("workers")
                .short('w')
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("connect-timeout")
                .env("TLSPULSE_CONNECT_TIMEOUT")
                .help("Seconds allowed for each connect, dialogue step and handshake (default: half the interval, at most 10)")
                .long("connect-timeout")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("interval")
                .default_value("60")
                .env("TLSPULSE_INTERVAL")
                .help("number of seconds between checks")
                .long("interval")
                .short('i')
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("ehlo-hostname")
                .env("TLSPULSE_EHLO_HOSTNAME")
                .help("Name announced in SMTP EHLO (default: the machine hostname)")
                .long("ehlo-hostname")
                .value_name("HOSTNAME"),
        )
        .arg(
            Arg::new("listen")
                .env("TLSPULSE_LISTEN")
                .help("IP address to bind to (default: [::]:port, accepts both IPv6 and IPv4)")
                .long("listen")
                .long_help(
                    "IP address to bind to:\n\
                    Not specified (default) binds to [::]:port which accepts both IPv6 and IPv4 connections.\n\
                    Falls back to 0.0.0.0:port if IPv6 is unavailable.\n\n\
                    Specific IPv4 examples: '0.0.0.0', '127.0.0.1'\n\
                    Specific IPv6: '::', '::1'"
                )
                .short('l')
                .value_name("IP"),
        )
        .arg(
            Arg::new("port")
                .default_value("9400")
                .env("TLSPULSE_PORT")
                .help("listening port for /metrics")
                .long("port")
                .short('p')
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("output")
                .default_value("json")
                .env("TLSPULSE_OUTPUT")
                .help("Print every signal as JSON on stdout, or nothing")
                .long("output")
                .short('o')
                .value_parser(["json", "none"]),
        )
        .arg(
            Arg::new("verbose")
                .action(ArgAction::Count)
                .help("Increase log verbosity (-v info, -vv debug, -vvv trace), RUST_LOG overrides")
                .long("verbose")
                .short('v'),
        )
}
