use serde::Deserialize;
use std::{io, net::SocketAddr, path::Path};
use tokio::fs;

// One entry in the cluster's node list, as written in the config file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
struct Node {
    address: SocketAddr,
}

// The parsed config file: just the addresses of every node in the cluster,
// in the order the `--node` index refers to them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub nodes: Vec<SocketAddr>,
}

// Parse config data.
pub fn parse(config: &str) -> Result<Vec<SocketAddr>, String> {
    let nodes: Vec<Node> = serde_yaml::from_str(config).map_err(|error| error.to_string())?;
    Ok(nodes.into_iter().map(|node| node.address).collect())
}

// Read and parse the config file at the given path.
pub async fn read(path: &Path) -> io::Result<Config> {
    let data = fs::read_to_string(path).await?;
    let nodes =
        parse(&data).map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    Ok(Config { nodes })
}
