use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, Pipeline, Value};

use crate::{ConcurrencyConflict, Result, TransactionError};

/// Interprets the reply of one scoped command.
///
/// In a transaction the reply only exists after `EXEC`, so the check is
/// deferred until commit.
pub type ReplyCheck = Box<dyn FnOnce(Value) -> Result<()> + Send>;

/// A read that must hold before a transaction may write.
///
/// `read` is sent after `WATCH key` and before `MULTI`, and `check` judges
/// its reply. A failed check aborts the whole transaction.
struct Guard {
    key: String,
    read: Cmd,
    check: ReplyCheck,
}

/// A single Redis command enlisted in a [`TransactionScope`].
pub struct ScopedOperation {
    name: &'static str,
    cmd: Cmd,
    check: Option<ReplyCheck>,
    guard: Option<Guard>,
}

impl ScopedOperation {
    /// Wraps a command whose reply is not inspected.
    pub fn new(name: &'static str, cmd: Cmd) -> Self {
        Self {
            name,
            cmd,
            check: None,
            guard: None,
        }
    }

    /// Attaches a check that turns the command's reply into success or an
    /// error (typically a concurrency conflict).
    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: FnOnce(Value) -> Result<()> + Send + 'static,
    {
        self.check = Some(Box::new(check));
        self
    }

    /// Attaches a precondition on `key` for transactional scopes.
    ///
    /// At commit `key` is watched and `read` is evaluated by `check` before
    /// anything is queued, so a failed precondition or a concurrent change of
    /// `key` discards every operation of the transaction. Immediate scopes
    /// skip the guard and rely on the command's own check.
    pub fn with_guard<F>(mut self, key: impl Into<String>, read: Cmd, check: F) -> Self
    where
        F: FnOnce(Value) -> Result<()> + Send + 'static,
    {
        self.guard = Some(Guard {
            key: key.into(),
            read,
            check: Box::new(check),
        });
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn settle(name: &'static str, check: Option<ReplyCheck>, reply: Value) -> Result<()> {
    match check {
        Some(check) => check(reply),
        None => match reply {
            Value::ServerError(err) => Err(TransactionError::UnexpectedReply {
                operation: name,
                detail: format!("{err:?}"),
            }),
            _ => Ok(()),
        },
    }
}

enum Mode {
    Immediate,
    Transactional {
        client: Client,
        pipeline: Pipeline,
        pending: Vec<(&'static str, Option<ReplyCheck>)>,
        guards: Vec<Guard>,
    },
}

/// A group of Redis commands that either commit together or run one by one.
///
/// A transactional scope queues every operation into a single `MULTI`/`EXEC`
/// block that is sent by [`TransactionScope::commit`]. Nothing is visible to
/// other clients before that. An immediate scope executes each operation as
/// soon as it is run and `commit` has nothing left to do.
///
/// Redis does not roll back a transaction when one of its commands reports a
/// failure, so preconditions are not left to the queued commands. Operations
/// carrying a guard have their keys watched and their preconditions read
/// before `MULTI`; a failed guard sends nothing, and a watched key changed
/// in between makes `EXEC` discard the whole block. Guarded commits run on
/// a connection opened for that commit alone, since `WATCH` state belongs
/// to the connection.
pub struct TransactionScope {
    connection: MultiplexedConnection,
    mode: Mode,
}

impl TransactionScope {
    /// Creates a scope that defers operations until commit.
    ///
    /// `client` opens the private connection a guarded commit needs.
    pub fn transactional(client: Client, connection: MultiplexedConnection) -> Self {
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        Self {
            connection,
            mode: Mode::Transactional {
                client,
                pipeline,
                pending: Vec::new(),
                guards: Vec::new(),
            },
        }
    }

    /// Creates a scope that runs operations right away.
    pub fn immediate(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            mode: Mode::Immediate,
        }
    }

    /// Returns true when operations are deferred until commit.
    pub fn is_transactional(&self) -> bool {
        matches!(self.mode, Mode::Transactional { .. })
    }

    /// Number of operations waiting for commit.
    pub fn pending(&self) -> usize {
        match &self.mode {
            Mode::Immediate => 0,
            Mode::Transactional { pending, .. } => pending.len(),
        }
    }

    /// Returns the scope's connection for reads that must not be enlisted.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Runs or enlists an operation.
    ///
    /// In an immediate scope the command is executed and its check applied
    /// before returning. In a transactional scope it is queued and any error
    /// surfaces from [`TransactionScope::commit`].
    pub async fn run(&mut self, operation: ScopedOperation) -> Result<()> {
        let ScopedOperation {
            name,
            cmd,
            check,
            guard,
        } = operation;
        match &mut self.mode {
            Mode::Immediate => {
                let reply: Value = cmd.query_async(&mut self.connection).await?;
                settle(name, check, reply)
            }
            Mode::Transactional {
                pipeline,
                pending,
                guards,
                ..
            } => {
                tracing::trace!(operation = name, "enlisted in transaction");
                pipeline.add_command(cmd);
                pending.push((name, check));
                guards.extend(guard);
                Ok(())
            }
        }
    }

    /// Commits the queued operations atomically.
    ///
    /// Guards are checked first; if any fails, or a watched key changes
    /// before `EXEC`, nothing is written. Otherwise every operation's check
    /// is applied to its reply. The first failure is returned and any
    /// further failures are logged.
    pub async fn commit(self) -> Result<()> {
        let Self { connection, mode } = self;
        let Mode::Transactional {
            client,
            pipeline,
            pending,
            guards,
        } = mode
        else {
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            operations = pending.len(),
            guards = guards.len(),
            "committing redis transaction"
        );
        let outcome = if guards.is_empty() {
            execute(connection, &pipeline, pending).await
        } else {
            let watched = client.get_multiplexed_async_connection().await?;
            execute_guarded(watched, &pipeline, pending, guards).await
        };

        match &outcome {
            Ok(()) => metrics::counter!("redis_transactions_committed_total").increment(1),
            Err(_) => metrics::counter!("redis_transactions_failed_total").increment(1),
        }
        outcome
    }
}

/// Watches every guarded key, checks the guards and then executes the
/// transaction on `connection`.
async fn execute_guarded(
    mut connection: MultiplexedConnection,
    pipeline: &Pipeline,
    pending: Vec<(&'static str, Option<ReplyCheck>)>,
    guards: Vec<Guard>,
) -> Result<()> {
    let keys: Vec<String> = guards.iter().map(|guard| guard.key.clone()).collect();
    let _: () = redis::cmd("WATCH")
        .arg(&keys)
        .query_async(&mut connection)
        .await?;

    for guard in guards {
        let reply: Value = guard.read.query_async(&mut connection).await?;
        if let Err(err) = (guard.check)(reply) {
            tracing::debug!(key = %guard.key, error = %err, "transaction guard failed");
            let _: () = redis::cmd("UNWATCH").query_async(&mut connection).await?;
            return Err(err);
        }
    }

    let replies: Option<Vec<Value>> = pipeline.query_async(&mut connection).await?;
    match replies {
        Some(replies) => settle_all(pending, replies),
        None => Err(ConcurrencyConflict::WatchedKeyChanged { keys }.into()),
    }
}

async fn execute(
    mut connection: MultiplexedConnection,
    pipeline: &Pipeline,
    pending: Vec<(&'static str, Option<ReplyCheck>)>,
) -> Result<()> {
    let replies: Vec<Value> = pipeline.query_async(&mut connection).await?;
    settle_all(pending, replies)
}

fn settle_all(pending: Vec<(&'static str, Option<ReplyCheck>)>, replies: Vec<Value>) -> Result<()> {
    if replies.len() != pending.len() {
        return Err(TransactionError::UnexpectedReply {
            operation: "EXEC",
            detail: format!(
                "expected {} replies, received {}",
                pending.len(),
                replies.len()
            ),
        });
    }

    let mut first_error = None;
    for ((name, check), reply) in pending.into_iter().zip(replies) {
        if let Err(err) = settle(name, check, reply) {
            if first_error.is_none() {
                first_error = Some(err);
            } else {
                tracing::warn!(operation = name, error = %err, "transaction operation failed");
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
