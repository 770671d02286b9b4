//! Typed parsing and formatting for every wire message in `spec.md` §6.

use std::fmt;

use thiserror::Error;

/// A line that could not be parsed into any known message shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed message: {0}")]
pub struct ParseError(pub String);

fn tokens(line: &str) -> Vec<&str> {
    line.split(' ').filter(|t| !t.is_empty()).collect()
}

fn parse_port(tok: &str) -> Result<u16, ParseError> {
    tok.parse::<u16>()
        .map_err(|_| ParseError(format!("expected a port, got {tok:?}")))
}

fn parse_u64(tok: &str) -> Result<u64, ParseError> {
    tok.parse::<u64>()
        .map_err(|_| ParseError(format!("expected a non-negative integer, got {tok:?}")))
}

/// A command sent by a client to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Store { name: String, size: u64 },
    Load { name: String },
    Reload { name: String },
    Remove { name: String },
    List,
}

impl ClientRequest {
    /// Parses one client command line. The first token not a valid name
    /// (empty/absent) or arity mismatch is reported as [`ParseError`].
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let toks = tokens(line);
        match toks.as_slice() {
            ["STORE", name, size] => Ok(Self::Store {
                name: (*name).to_string(),
                size: parse_u64(size)?,
            }),
            ["LOAD", name] => Ok(Self::Load {
                name: (*name).to_string(),
            }),
            ["RELOAD", name] => Ok(Self::Reload {
                name: (*name).to_string(),
            }),
            ["REMOVE", name] => Ok(Self::Remove {
                name: (*name).to_string(),
            }),
            ["LIST"] => Ok(Self::List),
            _ => Err(ParseError(format!("unrecognized client command: {line:?}"))),
        }
    }

    /// The filename this request names, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Store { name, .. }
            | Self::Load { name }
            | Self::Reload { name }
            | Self::Remove { name } => Some(name),
            Self::List => None,
        }
    }

    /// Whether this request is a `RELOAD` (used to clear the load cursor on
    /// any other command).
    #[must_use]
    pub fn is_reload(&self) -> bool {
        matches!(self, Self::Reload { .. })
    }
}

/// A reply sent by the controller to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    StoreTo(Vec<u16>),
    StoreComplete,
    LoadFrom { port: u16, size: u64 },
    RemoveComplete,
    List(Vec<String>),
    ErrorFileAlreadyExists,
    ErrorFileDoesNotExist,
    ErrorNotEnoughDstores,
    ErrorLoad,
}

impl fmt::Display for ClientReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreTo(ports) => {
                write!(f, "STORE_TO")?;
                for p in ports {
                    write!(f, " {p}")?;
                }
                Ok(())
            }
            Self::StoreComplete => write!(f, "STORE_COMPLETE"),
            Self::LoadFrom { port, size } => write!(f, "LOAD_FROM {port} {size}"),
            Self::RemoveComplete => write!(f, "REMOVE_COMPLETE"),
            Self::List(names) => {
                write!(f, "LIST")?;
                for n in names {
                    write!(f, " {n}")?;
                }
                Ok(())
            }
            Self::ErrorFileAlreadyExists => write!(f, "ERROR_FILE_ALREADY_EXISTS"),
            Self::ErrorFileDoesNotExist => write!(f, "ERROR_FILE_DOES_NOT_EXIST"),
            Self::ErrorNotEnoughDstores => write!(f, "ERROR_NOT_ENOUGH_DSTORES"),
            Self::ErrorLoad => write!(f, "ERROR_LOAD"),
        }
    }
}

/// A message sent by a data node to the controller, on a joined node session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeInbound {
    Join(u16),
    ListReply(Vec<String>),
    StoreAck(String),
    /// `REMOVE_ACK name`: the node deleted the file.
    RemoveAck(String),
    /// `ERROR_FILE_DOES_NOT_EXIST name` on a node session: the node had no
    /// such file, accepted as a successful REMOVE ack without a decrement.
    RemoveNotFound(String),
    RebalanceComplete,
}

impl NodeInbound {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let toks = tokens(line);
        match toks.as_slice() {
            ["JOIN", port] => Ok(Self::Join(parse_port(port)?)),
            ["LIST", rest @ ..] => Ok(Self::ListReply(rest.iter().map(|s| (*s).to_string()).collect())),
            ["STORE_ACK", name] => Ok(Self::StoreAck((*name).to_string())),
            ["REMOVE_ACK", name] => Ok(Self::RemoveAck((*name).to_string())),
            ["ERROR_FILE_DOES_NOT_EXIST", name] => Ok(Self::RemoveNotFound((*name).to_string())),
            ["REBALANCE_COMPLETE"] => Ok(Self::RebalanceComplete),
            _ => Err(ParseError(format!("unrecognized node message: {line:?}"))),
        }
    }
}

/// A message sent by the controller to a data node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutbound {
    List,
    Remove(String),
    /// `REBALANCE S f1 c1 p1,1 … D r1 …`: files this node must push to the
    /// listed destinations, and files it must delete locally.
    Rebalance {
        sends: Vec<(String, Vec<u16>)>,
        removals: Vec<String>,
    },
}

impl fmt::Display for NodeOutbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List => write!(f, "LIST"),
            Self::Remove(name) => write!(f, "REMOVE {name}"),
            Self::Rebalance { sends, removals } => {
                write!(f, "REBALANCE {}", sends.len())?;
                for (name, dests) in sends {
                    write!(f, " {name} {}", dests.len())?;
                    for d in dests {
                        write!(f, " {d}")?;
                    }
                }
                write!(f, " {}", removals.len())?;
                for r in removals {
                    write!(f, " {r}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_store() {
        assert_eq!(
            ClientRequest::parse("STORE a.txt 5").unwrap(),
            ClientRequest::Store { name: "a.txt".into(), size: 5 }
        );
    }

    #[test]
    fn rejects_store_with_bad_size() {
        assert!(ClientRequest::parse("STORE a.txt five").is_err());
    }

    #[test]
    fn parses_list_with_no_args() {
        assert_eq!(ClientRequest::parse("LIST").unwrap(), ClientRequest::List);
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(ClientRequest::parse("FROBNICATE x").is_err());
    }

    #[test]
    fn formats_store_to() {
        let reply = ClientReply::StoreTo(vec![4001, 4002]);
        assert_eq!(reply.to_string(), "STORE_TO 4001 4002");
    }

    #[test]
    fn formats_list_with_files() {
        let reply = ClientReply::List(vec!["a.txt".into(), "b.txt".into()]);
        assert_eq!(reply.to_string(), "LIST a.txt b.txt");
    }

    #[test]
    fn formats_empty_list() {
        let reply = ClientReply::List(vec![]);
        assert_eq!(reply.to_string(), "LIST");
    }

    #[test]
    fn parses_node_join() {
        assert_eq!(NodeInbound::parse("JOIN 4001").unwrap(), NodeInbound::Join(4001));
    }

    #[test]
    fn parses_node_list_reply_with_files() {
        assert_eq!(
            NodeInbound::parse("LIST a.txt b.txt").unwrap(),
            NodeInbound::ListReply(vec!["a.txt".into(), "b.txt".into()])
        );
    }

    #[test]
    fn parses_node_list_reply_empty() {
        assert_eq!(NodeInbound::parse("LIST").unwrap(), NodeInbound::ListReply(vec![]));
    }

    #[test]
    fn parses_store_ack() {
        assert_eq!(
            NodeInbound::parse("STORE_ACK a.txt").unwrap(),
            NodeInbound::StoreAck("a.txt".into())
        );
    }

    #[test]
    fn parses_remove_not_found_as_accepted_ack() {
        assert_eq!(
            NodeInbound::parse("ERROR_FILE_DOES_NOT_EXIST a.txt").unwrap(),
            NodeInbound::RemoveNotFound("a.txt".into())
        );
    }

    #[test]
    fn formats_rebalance_dispatch() {
        let msg = NodeOutbound::Rebalance {
            sends: vec![("a.txt".into(), vec![4002, 4003])],
            removals: vec!["b.txt".into()],
        };
        assert_eq!(msg.to_string(), "REBALANCE 1 a.txt 2 4002 4003 1 b.txt");
    }

    #[test]
    fn formats_rebalance_with_no_work() {
        let msg = NodeOutbound::Rebalance { sends: vec![], removals: vec![] };
        assert_eq!(msg.to_string(), "REBALANCE 0 0");
    }
}
