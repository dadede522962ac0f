use std::net;
use std::net::ToSocketAddrs;
use std::process;

use anyhow::Context as _;
use crossbeam_channel as chan;

use palaver_node::runtime::Runtime;
use palaver_node::service;
use palaver_node::service::DEFAULT_PORT;
use palaver_node::{logger, signals, ui};

pub const NAME: &str = "palaver-node";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The well-known host joined when no bootstrap is given.
pub const DEFAULT_BOOTSTRAP_HOST: &str = "startup_server";

pub const HELP_MSG: &str = r#"
Usage

   palaver-node [startup | <bootstrap-host>] [<option>...]

   Without arguments, the node joins the chat through the well-known
   "startup_server" host. Pass `startup` to run the bootstrap node of a
   fresh network, or a hostname to join through that host.

   Debug output goes to the file named by `LOG_FILE` (default `chat.log`).

Options

    --nickname  <name>     Display name shown to other participants
    --port      <port>     Port to listen on (default 65412)
    --version              Print program version
    --help                 Print help
"#;

#[derive(Debug)]
struct Options {
    /// Host to join through; `None` makes us the bootstrap node.
    bootstrap: Option<String>,
    nickname: String,
    port: u16,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut command = None;
        let mut nickname = None;
        let mut port = DEFAULT_PORT;

        while let Some(arg) = parser.next()? {
            match arg {
                Value(val) if command.is_none() => {
                    command = Some(val.string()?);
                }
                Long("nickname") => {
                    nickname = Some(parser.value()?.string()?);
                }
                Long("port") => {
                    port = parser.value()?.parse()?;
                }
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(-1);
                }
                Long("version") => {
                    println!("{NAME} {VERSION}");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }
        let bootstrap = match command.as_deref() {
            Some("startup") => None,
            Some(host) => Some(host.to_owned()),
            None => Some(DEFAULT_BOOTSTRAP_HOST.to_owned()),
        };

        Ok(Self {
            bootstrap,
            nickname: nickname.unwrap_or_else(|| "anonymous".to_owned()),
            port,
        })
    }
}

fn execute() -> anyhow::Result<()> {
    logger::init(logger::env_level().unwrap_or(log::Level::Debug))?;
    let options = Options::from_env()?;

    log::info!(target: "node", "Starting node..");
    log::info!(target: "node", "Version {VERSION}");

    let connect = match &options.bootstrap {
        Some(host) => {
            let addr = (host.as_str(), DEFAULT_PORT)
                .to_socket_addrs()
                .with_context(|| format!("couldn't resolve bootstrap host `{host}`"))?
                .next()
                .with_context(|| format!("no address found for bootstrap host `{host}`"))?;
            vec![addr]
        }
        None => vec![],
    };
    let config = service::Config {
        nickname: options.nickname,
        connect,
        listen: net::SocketAddr::new(net::Ipv4Addr::UNSPECIFIED.into(), options.port),
        ..service::Config::default()
    };

    let (notify, signals) = chan::bounded(1);
    signals::install(notify)?;

    let runtime = Runtime::init(config)?;
    println!("Listening on {}. Type away.", runtime.local_addr);

    ui::run(&runtime.handle, &runtime.events, &signals)?;

    runtime.handle.shutdown().ok();
    runtime.join()?;

    Ok(())
}

fn main() {
    if let Err(err) = execute() {
        if let Some(src) = err.source() {
            log::error!(target: "node", "Fatal: {err}: {src}");
        } else {
            log::error!(target: "node", "Fatal: {err}");
        }
        eprintln!("Fatal: {err}");
        process::exit(1);
    }
}
