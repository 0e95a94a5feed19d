/// The model actor and its handle.
///
/// Every loaded model is owned by exactly one tokio task. Callers talk to it
/// through a cheap, cloneable [`ModelHandle`]; each call becomes a command in
/// the actor's bounded inbox and the reply comes back on a oneshot channel.
/// Commands run one at a time in arrival order, so there is never more than
/// one writer for a model's partitions.
///
/// # Scheduling
///
/// - **Normal**: the actor waits for either a command or an idle notice from
///   one of its partition workers.
/// - **Resharding**: the actor alternates between serving at most one pending
///   command (and idle notice) and running one resharding step, so callers
///   keep getting answers while data moves. Training calls are deferred until
///   the resharding commits.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cache::IdleNotice;
use crate::error::{ChainError, ChainResult};
use crate::model::{Model, ModelStats, TrainOutcome};
use crate::options::{ModelOptions, OptionsUpdate};
use crate::query::TagQuery;
use crate::ring::PartitionId;
use crate::transition::DEFAULT_STEP_LIMIT;
use crate::types::{EdgeRecord, Tag, Token};

const INBOX_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<ChainResult<T>>;

enum Command {
    Configure {
        update: OptionsUpdate,
        reply: Reply<ModelOptions>,
    },
    Train {
        tokens: Vec<Token>,
        tags: Vec<Tag>,
        reply: Reply<TrainOutcome>,
    },
    Generate {
        query: TagQuery,
        step_limit: usize,
        reply: Reply<Vec<Token>>,
    },
    DumpPartition {
        id: PartitionId,
        reply: Reply<Vec<EdgeRecord>>,
    },
    Stats {
        reply: Reply<ModelStats>,
    },
    Flush {
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
}

/// Handle to a running model actor.
///
/// # Example
///
/// ```ignore
/// use koru_chain::{ModelHandle, ModelOptions, TagQuery, Token};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let model = ModelHandle::load("/tmp/chain", ModelOptions::default()).await?;
///
///     let words = "the quick brown fox".split(' ').map(Token::text).collect();
///     model.train(words, vec![]).await?;
///
///     let sentence = model.generate(TagQuery::Always).await?;
///     println!("{:?}", sentence);
///
///     model.unload().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ModelHandle {
    inbox: mpsc::Sender<Command>,
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.path)
            .field("running", &!self.inbox.is_closed())
            .finish()
    }
}

impl ModelHandle {
    /// Load (or create) the model stored at `path` and start its actor.
    ///
    /// # Errors
    ///
    /// Fails without starting an actor if the stored state is corrupt or the
    /// creation options conflict with it.
    pub async fn load(path: impl AsRef<Path>, options: ModelOptions) -> ChainResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let model = Model::open(&path, options, notice_tx).await?;

        let (inbox, commands) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(run(model, commands, notice_rx));

        Ok(Self {
            inbox,
            path: Arc::new(path),
        })
    }

    /// Storage path of this model.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> ChainResult<T> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(build(reply))
            .await
            .map_err(|_| ChainError::ActorStopped)?;
        response.await.map_err(|_| ChainError::ActorStopped)?
    }

    /// Persist the model and stop its actor.
    ///
    /// Other clones of this handle get `ActorStopped` afterwards.
    pub async fn unload(self) -> ChainResult<()> {
        self.call(|reply| Command::Stop { reply }).await
    }

    /// Change mutable options.
    pub async fn configure(&self, update: OptionsUpdate) -> ChainResult<ModelOptions> {
        self.call(|reply| Command::Configure { update, reply }).await
    }

    /// Learn a token sequence, recording every edge under each of `tags`
    /// (or the default tag if `tags` is empty).
    pub async fn train(&self, tokens: Vec<Token>, tags: Vec<Tag>) -> ChainResult<TrainOutcome> {
        self.call(|reply| Command::Train { tokens, tags, reply })
            .await
    }

    /// Generate a sequence with the default step limit.
    pub async fn generate(&self, query: TagQuery) -> ChainResult<Vec<Token>> {
        self.generate_with_limit(query, DEFAULT_STEP_LIMIT).await
    }

    /// Generate a sequence of at most `step_limit` tokens.
    pub async fn generate_with_limit(&self, query: TagQuery, step_limit: usize) -> ChainResult<Vec<Token>> {
        self.call(|reply| Command::Generate {
            query,
            step_limit,
            reply,
        })
        .await
    }

    /// Raw edges of one partition. Intended for debugging.
    pub async fn dump_partition(&self, id: PartitionId) -> ChainResult<Vec<EdgeRecord>> {
        self.call(|reply| Command::DumpPartition { id, reply }).await
    }

    /// Current statistics.
    pub async fn stats(&self) -> ChainResult<ModelStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Persist control state and flush open partitions without unloading.
    pub async fn flush(&self) -> ChainResult<()> {
        self.call(|reply| Command::Flush { reply }).await
    }
}

/// Whether the actor keeps running after a command.
enum Flow {
    Continue,
    Stop,
}

async fn run(
    mut model: Model,
    mut commands: mpsc::Receiver<Command>,
    mut notices: mpsc::UnboundedReceiver<IdleNotice>,
) {
    info!(path = %model.dir().display(), "Model actor started");

    loop {
        if model.is_resharding() {
            if let Ok(notice) = notices.try_recv() {
                model.handle_idle(notice);
            }
            match commands.try_recv() {
                Ok(command) => {
                    if let Flow::Stop = handle(&mut model, command).await {
                        break;
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    shutdown(&mut model).await;
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }
            if let Err(e) = model.reshard_step().await {
                error!(error = %e, "Resharding step failed");
                // Give the disk a moment before retrying the same step.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Flow::Stop = handle(&mut model, command).await {
                        break;
                    }
                }
                None => {
                    shutdown(&mut model).await;
                    break;
                }
            },
            Some(notice) = notices.recv() => model.handle_idle(notice),
        }
    }

    info!(path = %model.dir().display(), "Model actor stopped");
}

async fn handle(model: &mut Model, command: Command) -> Flow {
    match command {
        Command::Configure { update, reply } => {
            let _ = reply.send(model.configure(update).await);
        }
        Command::Train { tokens, tags, reply } => {
            let _ = reply.send(model.train(tokens, tags).await);
        }
        Command::Generate {
            query,
            step_limit,
            reply,
        } => {
            let _ = reply.send(model.generate(&query, step_limit));
        }
        Command::DumpPartition { id, reply } => {
            let _ = reply.send(model.dump_partition(id));
        }
        Command::Stats { reply } => {
            let _ = reply.send(Ok(model.stats()));
        }
        Command::Flush { reply } => {
            let _ = reply.send(model.flush().await);
        }
        Command::Stop { reply } => {
            let _ = reply.send(model.shutdown().await);
            return Flow::Stop;
        }
    }
    Flow::Continue
}

async fn shutdown(model: &mut Model) {
    debug!("All handles dropped, shutting down");
    if let Err(e) = model.shutdown().await {
        warn!(error = %e, "Failed to shut down model cleanly");
    }
}
