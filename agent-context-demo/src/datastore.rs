//! An in-memory key-value client and the instrumentation that records its
//! commands as datastore segments.
//!
//! The client behaves like a typical pipelined database client: commands are
//! queued synchronously and a connection task, created along with the client,
//! answers them in order. The connection task belongs to whoever created the
//! client, not to the transactions issuing commands, so any context it sees is
//! unrelated to the command being served.

use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use agent_context::{Context, ContextManager};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot::{self, Sender as OneshotSender};
use tracing::{debug, trace};

use crate::tracer::Tracer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatastoreError {
    Closed,
    UnknownCommand(String),
    WrongArity(String),
}

impl Display for DatastoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DatastoreError::Closed => write!(f, "connection closed"),
            DatastoreError::UnknownCommand(name) => write!(f, "unknown command '{name}'"),
            DatastoreError::WrongArity(name) => {
                write!(f, "wrong number of arguments for '{name}'")
            }
        }
    }
}

impl StdError for DatastoreError {}

type Reply = Result<Option<String>, DatastoreError>;

struct Command {
    args: Vec<String>,
    reply: OneshotSender<Reply>,
}

#[derive(Clone)]
pub struct KvClient {
    queue: UnboundedSender<Command>,
}

impl KvClient {
    /// Creates a client and spawns its connection task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a `LocalSet`.
    pub fn connect(latency: Duration) -> KvClient {
        let (queue, receiver) = mpsc::unbounded_channel();

        tokio::task::spawn_local(serve(receiver, latency));

        KvClient { queue }
    }

    /// Queues the command right away and returns a future for the reply.
    pub fn send_command(&self, args: &[&str]) -> impl Future<Output = Reply> + 'static {
        let (reply, receiver) = oneshot::channel();
        let command = Command {
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            reply,
        };

        let queued = self.queue.send(command).is_ok();

        async move {
            if !queued {
                return Err(DatastoreError::Closed);
            }

            receiver.await.unwrap_or(Err(DatastoreError::Closed))
        }
    }
}

async fn serve(mut receiver: UnboundedReceiver<Command>, latency: Duration) {
    let mut data = HashMap::new();

    while let Some(command) = receiver.recv().await {
        tokio::time::sleep(latency).await;

        let reply = execute(&mut data, &command.args);
        trace!("served {:?}", command.args);

        // the caller may have stopped waiting
        let _ = command.reply.send(reply);
    }

    debug!("connection closed");
}

fn execute(data: &mut HashMap<String, String>, args: &[String]) -> Reply {
    let Some((name, rest)) = args.split_first() else {
        return Err(DatastoreError::UnknownCommand(String::new()));
    };

    match (name.to_uppercase().as_str(), rest) {
        ("PING", []) => Ok(Some("PONG".to_owned())),
        ("SET", [key, value]) => {
            data.insert(key.clone(), value.clone());
            Ok(Some("OK".to_owned()))
        }
        ("GET", [key]) => Ok(data.get(key).cloned()),
        ("DEL", [key]) => Ok(data.remove(key).map(|_| "1".to_owned())),
        ("PING" | "SET" | "GET" | "DEL", _) => Err(DatastoreError::WrongArity(name.clone())),
        _ => Err(DatastoreError::UnknownCommand(name.clone())),
    }
}

/// Wraps a [`KvClient`] so every command is recorded as a segment of the
/// transaction that issued it.
pub struct InstrumentedKv {
    client: KvClient,
    tracer: Rc<Tracer>,
    capture_attributes: bool,
}

impl InstrumentedKv {
    pub fn new(client: KvClient, tracer: Rc<Tracer>, capture_attributes: bool) -> InstrumentedKv {
        InstrumentedKv {
            client,
            tracer,
            capture_attributes,
        }
    }

    /// Records a `Datastore/operation/Kv/<command>` segment under the ambient
    /// segment and queues the command with that segment ambient.
    pub fn send_command(&self, args: &[&str]) -> impl Future<Output = Reply> + 'static {
        let operation = args
            .first()
            .map(|name| name.to_lowercase())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "other".to_owned());

        let mut parameters = BTreeMap::new();
        if self.capture_attributes {
            for (name, arg) in [("key", args.get(1)), ("value", args.get(2))] {
                // empty arguments are skipped
                let Some(arg) = arg.filter(|arg| !arg.is_empty()) else {
                    continue;
                };

                if let Ok(encoded) = serde_json::to_string(arg) {
                    parameters.insert(name.to_owned(), encoded);
                }
            }
        }

        let name = format!("Datastore/operation/Kv/{operation}");
        match self.tracer.create_segment_with(name, parameters) {
            Some(segment) => self
                .tracer
                .manager()
                .run_with_context(Context::with_segment(segment), || {
                    self.client.send_command(args)
                }),
            None => self.client.send_command(args),
        }
    }
}
