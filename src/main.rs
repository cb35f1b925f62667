#![deny(clippy::all, clippy::pedantic, warnings)]

mod acceptor;
mod config;
mod proposal;
mod proposer;
mod rpc;
#[cfg(test)]
mod scenarios;
mod state;

#[macro_use]
extern crate log;

use {
    clap::{Arg, Command},
    env_logger::{fmt::Color, Builder},
    hyper_util::{
        client::legacy::{connect::HttpConnector, Client},
        rt::TokioExecutor,
    },
    log::{Level, LevelFilter},
    proposer::propose,
    state::initial,
    std::{
        env,
        fmt::{self, Display, Formatter},
        io::{self, Write},
        net::SocketAddr,
        path::{Path, PathBuf},
        process::exit,
        str::FromStr,
        sync::Arc,
    },
    tokio::{sync::RwLock, try_join},
    tokio_util::sync::CancellationToken,
};

// The name of the consensus instance every agent proposes its own address
// for on startup. [tag:leader_key]
const LEADER_KEY: &[u8] = b"leader";

// The program version
const VERSION: &str = env!("CARGO_PKG_VERSION");

// Defaults
const CONFIG_FILE_DEFAULT_PATH: &str = "config.yml";
const DATA_DIR_DEFAULT_PATH: &str = "data";
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// Command-line option names
const CONFIG_FILE_OPTION: &str = "config-file";
const DATA_DIR_OPTION: &str = "data-dir";
const IP_OPTION: &str = "ip";
const NODE_OPTION: &str = "node";
const PORT_OPTION: &str = "port";
const PROPOSE_OPTION: &str = "propose";

// This struct represents a summary of the command-line options
#[derive(Clone)]
struct Settings {
    nodes: Vec<SocketAddr>,
    node_index: usize,
    address: SocketAddr,
    proposal_override: Option<String>,
    data_file_path: PathBuf,
}

// The error type that unifies the acceptor's transport errors with the
// proposer's, so [tag:agent_try_join] can run both tasks under one
// `try_join!`.
#[derive(Debug)]
enum AgentError {
    Io(io::Error),
    Propose(proposer::ProposeError),
}

impl Display for AgentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Io(error) => write!(f, "{error}"),
            AgentError::Propose(error) => write!(f, "{error}"),
        }
    }
}

// Set up the logger.
fn set_up_logging() {
    Builder::new()
        .filter_module(
            module_path!(),
            LevelFilter::from_str(
                &env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
            )
            .unwrap_or(DEFAULT_LOG_LEVEL),
        )
        .format(|buf, record| {
            let mut style = buf.style();
            style.set_bold(true);
            match record.level() {
                Level::Error => {
                    style.set_color(Color::Red);
                }
                Level::Warn => {
                    style.set_color(Color::Yellow);
                }
                Level::Info => {
                    style.set_color(Color::Green);
                }
                Level::Debug | Level::Trace => {
                    style.set_color(Color::Blue);
                }
            }
            let indent_size = record.level().to_string().len() + 3;
            let indent = &" ".repeat(indent_size);
            let options = textwrap::Options::with_termwidth()
                .initial_indent(indent)
                .subsequent_indent(indent);
            writeln!(
                buf,
                "{} {}",
                style.value(format!("[{}]", record.level())),
                &textwrap::fill(&record.args().to_string(), &options)[indent_size..],
            )
        })
        .init();
}

// Parse the command-line options.
#[allow(clippy::too_many_lines)]
async fn settings() -> io::Result<Settings> {
    // Set up the command-line interface.
    let matches = Command::new("Paxos")
        .version(VERSION)
        .author("Stephan Boyer <stephan@stephanboyer.com>")
        .about("This is an implementation of single-decree paxos.")
        .arg(
            Arg::new(NODE_OPTION)
                .value_name("INDEX")
                .short('n')
                .long(NODE_OPTION)
                .help("Sets the index of the node corresponding to this instance")
                .required(true), // [tag:node_required]
        )
        .arg(
            Arg::new(PROPOSE_OPTION)
                .value_name("VALUE")
                .short('v')
                .long(PROPOSE_OPTION)
                .help(
                    "Overrides the value this node proposes for the `leader` key \
                     (default: this node's own address)",
                ),
        )
        .arg(
            Arg::new(CONFIG_FILE_OPTION)
                .value_name("PATH")
                .short('c')
                .long(CONFIG_FILE_OPTION)
                .help(format!(
                    "Sets the path of the config file (default: {CONFIG_FILE_DEFAULT_PATH})",
                )),
        )
        .arg(
            Arg::new(DATA_DIR_OPTION)
                .value_name("PATH")
                .short('d')
                .long(DATA_DIR_OPTION)
                .help(format!(
                    "Sets the path of the directory in which to store persistent data \
                     (default: {DATA_DIR_DEFAULT_PATH})",
                )),
        )
        .arg(
            Arg::new(IP_OPTION)
                .value_name("ADDRESS")
                .short('i')
                .long(IP_OPTION)
                .help(
                    "Sets the IP address to run on \
                     (if different from the configuration)",
                ),
        )
        .arg(
            Arg::new(PORT_OPTION)
                .value_name("PORT")
                .short('p')
                .long(PORT_OPTION)
                .help("Sets the port to run on (if different from the configuration)"),
        )
        .get_matches();

    // Parse the config file path.
    let config_file_path = matches
        .get_one::<String>(CONFIG_FILE_OPTION)
        .map_or(CONFIG_FILE_DEFAULT_PATH, String::as_str);

    // Parse the config file.
    let config = config::read(Path::new(config_file_path)).await?;

    // Parse the node index. The unwrap is safe due to [ref:node_required].
    let node_repr = matches.get_one::<String>(NODE_OPTION).unwrap();
    let node_index: usize = node_repr.parse().map_err(|error| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{node_repr}` is not a valid node index. Reason: {error}"),
        )
    })?;
    if node_index >= config.nodes.len() {
        // [tag:node_index_valid]
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("There is no node with index {node_repr}."),
        ));
    }

    // Parse the IP address, if given.
    let ip = matches.get_one::<String>(IP_OPTION).map_or_else(
        || Ok(config.nodes[node_index].ip()), // [ref:node_index_valid]
        |raw_ip| {
            raw_ip.parse().map_err(|error| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("`{raw_ip}` is not a valid IP address. Reason: {error}"),
                )
            })
        },
    )?;

    // Parse the port number, if given.
    let port = matches.get_one::<String>(PORT_OPTION).map_or_else(
        || Ok(config.nodes[node_index].port()), // [ref:node_index_valid]
        |raw_port| {
            raw_port.parse().map_err(|error| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("`{raw_port}` is not a valid port number. Reason: {error}"),
                )
            })
        },
    )?;

    // Parse the data directory path.
    let data_dir_path = Path::new(
        matches
            .get_one::<String>(DATA_DIR_OPTION)
            .map_or(DATA_DIR_DEFAULT_PATH, String::as_str),
    );

    // Determine the data file path [tag:data_file_path_has_parent].
    let data_file_path = Path::join(data_dir_path, format!("{ip}:{port}"));

    // Return the settings.
    Ok(Settings {
        nodes: config.nodes,
        node_index,
        address: SocketAddr::new(ip, port),
        proposal_override: matches.get_one::<String>(PROPOSE_OPTION).cloned(),
        data_file_path,
    })
}

// Let the fun begin!
#[tokio::main]
async fn main() {
    // Set up the logger.
    set_up_logging();

    // Parse the command-line arguments.
    let settings = match settings().await {
        Ok(settings) => settings,
        Err(error) => {
            error!("{}", error);
            exit(1);
        }
    };

    // Initialize the program state.
    let state = Arc::new(RwLock::new(initial()));

    // Attempt to read any persisted state.
    match state::read(&settings.data_file_path).await {
        Ok(persisted_state) => {
            let mut guard = state.write().await;
            *guard = persisted_state;
            info!("State loaded from persistent storage.");
        }
        Err(error) => {
            if error.kind() == io::ErrorKind::NotFound {
                info!("Starting from the initial state.");
            } else {
                error!(
                    "Unable to load state file `{}`. Reason: {}",
                    settings.data_file_path.to_string_lossy(),
                    error,
                );
                exit(1);
            }
        }
    }

    // The client peer handles share for every outbound Prepare/Accept/Choose
    // call this agent's proposer ever issues.
    let client: rpc::HttpClient =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    // Cancelled when the process receives Ctrl-C, so an in-flight Propose can
    // unwind its dials and backoff sleeps instead of leaking a task forever.
    let cancel = CancellationToken::new();
    let shutdown_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt. Shutting down.");
            shutdown_signal.cancel();
        }
    });

    // Clone out every field each side needs so both tasks below can take
    // ownership of their half with `async move`, rather than racing over
    // shared borrows of `settings`/`state`.
    let acceptor_state = state.clone();
    let acceptor_data_file_path = settings.data_file_path.clone();
    let acceptor_address = settings.address;
    let propose_data_file_path = settings.data_file_path.clone();
    let nodes = settings.nodes.clone();
    let node_index = settings.node_index;
    // Every agent proposes its own address for the `leader` key on startup,
    // per spec.md 6; `--propose` only overrides the value, for testing.
    let proposal_value = settings
        .proposal_override
        .clone()
        .unwrap_or_else(|| acceptor_address.to_string());

    // Run the acceptor and the proposer. [tag:agent_try_join]
    if let Err(error) = try_join!(
        async move {
            acceptor::acceptor(acceptor_state, &acceptor_data_file_path, acceptor_address)
                .await
                .map_err(AgentError::Io)
        },
        async move {
            propose(
                state,
                &propose_data_file_path,
                client,
                &nodes,
                node_index,
                LEADER_KEY,
                proposal_value.as_bytes(),
                cancel,
            )
            .await
            .map_err(AgentError::Propose)
        },
    ) {
        error!("{}", error);
        exit(1);
    }
}
