//! Asynchronous fan-out RPC client (component E). A single `RpcClient`
//! fans one batch of tasks out across many remote hosts, respecting global
//! and per-host concurrency caps, failing a task over to its next candidate
//! host on a connection error, and tolerating (or not, per config) individual
//! task failure.
//!
//! Concurrency is expressed with native `async`/`await` rather than manual
//! `epoll`/readiness polling: `execute` drives every task inside a
//! `tokio::task::LocalSet`, so the whole run stays on one OS thread (the
//! thread that calls `execute`) even though the underlying `tokio` runtime
//! may be multi-threaded. Per-host and global caps are `tokio::sync::Semaphore`
//! permits rather than hand-rolled counters — a task that can't get a permit
//! simply awaits, which is the back-pressure the task queue needs.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::net::pool::ConnectionPool;
use crate::varint::{put_lenenc_string, put_varuint};
use crate::wire::{Frame, Opcode};

/// Index into the client's task table. Never an owning reference — a
/// `Connection` only ever borrows a task by handle while it is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(usize);

/// Mirrors the contract in the component design, even though this
/// implementation moves between these points with `async`/`await` rather
/// than a manually-polled state field. Logged at each transition so the
/// lifecycle is still observable externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshake,
    Ready,
    Query,
    Close,
}

struct TaskSpec<P> {
    opcode: u16,
    flags: u16,
    payload: Bytes,
    hosts: Vec<String>,
    privdata: P,
}

type ResultCb<P> = Rc<dyn Fn(&P, u16, u16, Bytes)>;
type StartedCb<P> = Rc<dyn Fn(&P)>;
type CompletedCb<P> = Rc<dyn Fn(&P, bool)>;

struct Inner<P> {
    config: ClientConfig,
    pool: Rc<ConnectionPool>,
    auth_data: Vec<(String, String)>,
    global_sem: Semaphore,
    host_sems: RefCell<HashMap<String, Rc<Semaphore>>>,
    run_queue: RefCell<Vec<TaskSpec<P>>>,
    shutdown: Cell<bool>,
    on_result: RefCell<Option<ResultCb<P>>>,
    on_started: RefCell<Option<StartedCb<P>>>,
    on_completed: RefCell<Option<CompletedCb<P>>>,
}

/// Not `Send`/`Sync` by design — a client is built and driven from a single
/// task, and `execute` pins it to a `LocalSet` on that task's thread.
#[derive(Clone)]
pub struct RpcClient<P: 'static>(Rc<Inner<P>>);

impl<P: 'static> RpcClient<P> {
    pub fn new(config: ClientConfig, pool: Rc<ConnectionPool>, auth_data: Vec<(String, String)>) -> Self {
        let global_sem = Semaphore::new(config.max_concurrent_tasks);
        Self(Rc::new(Inner {
            config,
            pool,
            auth_data,
            global_sem,
            host_sems: RefCell::new(HashMap::new()),
            run_queue: RefCell::new(Vec::new()),
            shutdown: Cell::new(false),
            on_result: RefCell::new(None),
            on_started: RefCell::new(None),
            on_completed: RefCell::new(None),
        }))
    }

    pub fn set_result_callback(&self, cb: impl Fn(&P, u16, u16, Bytes) + 'static) {
        *self.0.on_result.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_started_callback(&self, cb: impl Fn(&P) + 'static) {
        *self.0.on_started.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_completed_callback(&self, cb: impl Fn(&P, bool) + 'static) {
        *self.0.on_completed.borrow_mut() = Some(Rc::new(cb));
    }

    /// Enqueues one task. `hosts` is tried in order; a connection failure on
    /// `hosts[0]` fails the task over to `hosts[1]`, and so on. Must be
    /// called before `execute` — tasks added mid-run are not picked up.
    pub fn add_rpc(
        &self,
        opcode: u16,
        flags: u16,
        payload: impl Into<Bytes>,
        hosts: Vec<String>,
        privdata: P,
    ) -> Result<TaskHandle> {
        if hosts.is_empty() {
            return Err(Error::InvalidArgument("add_rpc requires at least one candidate host".into()));
        }
        let mut queue = self.0.run_queue.borrow_mut();
        let handle = TaskHandle(queue.len());
        queue.push(TaskSpec {
            opcode,
            flags,
            payload: payload.into(),
            hosts,
            privdata,
        });
        Ok(handle)
    }

    /// Marks the client for shutdown. Tasks that haven't started their next
    /// connection attempt yet observe the flag at their next checkpoint and
    /// complete with `success = false` instead of proceeding; tasks mid
    /// request/response are allowed to finish the current round trip.
    pub fn shutdown(&self) {
        self.0.shutdown.set(true);
    }

    fn host_semaphore(&self, host: &str) -> Rc<Semaphore> {
        let mut sems = self.0.host_sems.borrow_mut();
        sems.entry(host.to_string())
            .or_insert_with(|| Rc::new(Semaphore::new(self.0.config.max_concurrent_tasks_per_host)))
            .clone()
    }

    fn invoke_on_started(&self, privdata: &P) {
        if let Some(cb) = self.0.on_started.borrow().as_ref() {
            cb(privdata);
        }
    }

    fn invoke_on_result(&self, privdata: &P, opcode: u16, flags: u16, payload: Bytes) {
        if let Some(cb) = self.0.on_result.borrow().as_ref() {
            cb(privdata, opcode, flags, payload);
        }
    }

    fn invoke_on_completed(&self, privdata: &P, success: bool) {
        if let Some(cb) = self.0.on_completed.borrow().as_ref() {
            cb(privdata, success);
        }
    }

    /// Runs every queued task to completion (success or host-list
    /// exhaustion). Returns `Ok(())` once all tasks have completed, unless
    /// `tolerate_failures` is `false` and some task exhausts its host list,
    /// in which case `execute` returns the first such error and signals
    /// shutdown so tasks still in flight wind down early.
    pub async fn execute(self) -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local.run_until(self.clone().execute_inner()).await
    }

    async fn execute_inner(self) -> Result<()> {
        let tasks: Vec<TaskSpec<P>> = self.0.run_queue.borrow_mut().drain(..).collect();
        let total = tasks.len();
        if total == 0 {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
        for (idx, task) in tasks.into_iter().enumerate() {
            let client = self.clone();
            let tx = tx.clone();
            tokio::task::spawn_local(async move {
                let success = client.run_task(TaskHandle(idx), task).await;
                let _ = tx.send(success);
            });
        }
        drop(tx);

        let mut completed = 0usize;
        let mut first_error = None;
        while completed < total {
            match rx.recv().await {
                Some(success) => {
                    completed += 1;
                    if !success && !self.0.config.tolerate_failures && first_error.is_none() {
                        first_error = Some(Error::Protocol(
                            "rpc task exhausted all candidate hosts".into(),
                        ));
                        self.shutdown();
                    }
                }
                None => break,
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(())
    }

    /// Drives one task through its candidate host list, acquiring the
    /// global and per-host semaphore permits that bound concurrency, and
    /// invoking the configured callbacks. Always returns (never panics on a
    /// host failure) so the caller can count it as completed either way.
    async fn run_task(&self, handle: TaskHandle, task: TaskSpec<P>) -> bool {
        let _global_permit = match self.0.global_sem.acquire().await {
            Ok(p) => p,
            Err(_) => return false,
        };

        if self.0.shutdown.get() {
            self.invoke_on_completed(&task.privdata, false);
            return false;
        }

        self.invoke_on_started(&task.privdata);
        tracing::debug!(task = handle.0, hosts = ?task.hosts, "rpc task started");

        let mut success = false;
        for host in &task.hosts {
            if self.0.shutdown.get() {
                break;
            }
            let host_sem = self.host_semaphore(host);
            let _host_permit = match host_sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            match self.try_host(host, &task).await {
                Ok(()) => {
                    success = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(task = handle.0, host, error = %e, "host attempt failed, trying next candidate");
                }
            }
        }

        self.invoke_on_completed(&task.privdata, success);
        success
    }

    async fn try_host(&self, host: &str, task: &TaskSpec<P>) -> Result<()> {
        let mut state = ConnectionState::Connecting;
        let mut stream = self.obtain_connection(host, &mut state).await?;

        state = ConnectionState::Query;
        let frame = Frame::new(task.opcode, task.flags, task.payload.clone());
        let io_timeout = self.0.pool.io_timeout();
        timeout(io_timeout, frame.write_to(&mut stream))
            .await
            .map_err(|_| Error::Timeout(io_timeout))??;
        let result = timeout(io_timeout, Frame::read_from(&mut stream))
            .await
            .map_err(|_| Error::Timeout(io_timeout))??;
        state = ConnectionState::Ready;
        tracing::trace!(host, ?state, "rpc response received");

        self.invoke_on_result(&task.privdata, result.opcode, result.flags, result.payload);
        self.0.pool.release(host, stream);
        Ok(())
    }

    /// Pulls a pooled, already-handshaken connection if one exists, or opens
    /// and handshakes a fresh one. `state` is updated as the caller's
    /// observable record of progress through CONNECTING/HANDSHAKE/READY.
    async fn obtain_connection(&self, host: &str, state: &mut ConnectionState) -> Result<TcpStream> {
        if let Some(stream) = self.0.pool.acquire(host) {
            *state = ConnectionState::Ready;
            return Ok(stream);
        }

        let io_timeout = self.0.pool.io_timeout();
        let mut stream = timeout(io_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| Error::Timeout(io_timeout))??;

        *state = ConnectionState::Handshake;
        self.handshake(&mut stream).await?;
        *state = ConnectionState::Ready;
        Ok(stream)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        let mut payload = BytesMut::new();
        put_varuint(&mut payload, self.0.auth_data.len() as u64);
        for (k, v) in &self.0.auth_data {
            put_lenenc_string(&mut payload, k);
            put_lenenc_string(&mut payload, v);
        }
        let hello = Frame::new(Opcode::Hello.as_u16(), 0, payload.freeze());

        let io_timeout = self.0.pool.io_timeout();
        timeout(io_timeout, hello.write_to(stream))
            .await
            .map_err(|_| Error::Timeout(io_timeout))??;
        let ack = timeout(io_timeout, Frame::read_from(stream))
            .await
            .map_err(|_| Error::Timeout(io_timeout))??;

        if ack.opcode == Opcode::HelloAck.as_u16() {
            Ok(())
        } else {
            Err(Error::AuthRejected(
                "peer did not respond with HELLO_ACK".into(),
            ))
        }
    }
}

/// How long an idle, un-reused connection may sit in READY state before the
/// client considers it worth proactively closing rather than returning to
/// the pool. Exposed for callers composing their own idle sweeps; this
/// client itself relies on the pool's `max_conn_age` instead.
pub fn default_idle_timeout(config: &ClientConfig) -> Duration {
    config.idle_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server_with_hello() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    loop {
                        let frame = match Frame::read_from(&mut sock).await {
                            Ok(f) => f,
                            Err(_) => return,
                        };
                        let reply = if frame.opcode == Opcode::Hello.as_u16() {
                            Frame::new(Opcode::HelloAck.as_u16(), 0, Bytes::new())
                        } else {
                            Frame::new(Opcode::QueryResult.as_u16(), 0, frame.payload.clone())
                        };
                        if reply.write_to(&mut sock).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn single_task_roundtrips_result_through_callback() {
        let addr = echo_server_with_hello().await;
        let pool = StdRc::new(ConnectionPool::new(&PoolConfig::default()));
        let client = RpcClient::new(ClientConfig::default(), pool, Vec::new());

        let results: StdRc<StdRefCell<Vec<Bytes>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let results_cb = results.clone();
        client.set_result_callback(move |_p: &u64, _op, _flags, payload| {
            results_cb.borrow_mut().push(payload);
        });

        client
            .add_rpc(
                Opcode::Query.as_u16(),
                0,
                Bytes::from_static(b"select 1"),
                vec![addr],
                7u64,
            )
            .unwrap();

        client.execute().await.unwrap();
        assert_eq!(results.borrow().len(), 1);
        assert_eq!(&results.borrow()[0][..], b"select 1");
    }

    #[tokio::test]
    async fn failover_tries_second_host_after_connection_refused() {
        let addr = echo_server_with_hello().await;
        let dead = "127.0.0.1:1"; // reserved, nothing listens there
        let pool = StdRc::new(ConnectionPool::new(&PoolConfig::default()));
        let client = RpcClient::new(ClientConfig::default(), pool, Vec::new());

        let completed = StdRc::new(StdRefCell::new(None));
        let completed_cb = completed.clone();
        client.set_completed_callback(move |_p: &u64, success| {
            *completed_cb.borrow_mut() = Some(success);
        });

        client
            .add_rpc(
                Opcode::Query.as_u16(),
                0,
                Bytes::from_static(b"select 1"),
                vec![dead.to_string(), addr],
                1u64,
            )
            .unwrap();

        client.execute().await.unwrap();
        assert_eq!(*completed.borrow(), Some(true));
    }

    #[tokio::test]
    async fn intolerant_client_surfaces_error_when_all_hosts_fail() {
        let mut cfg = ClientConfig::default();
        cfg.tolerate_failures = false;
        let pool = StdRc::new(ConnectionPool::new(&PoolConfig::default()));
        let client = RpcClient::new(cfg, pool, Vec::new());

        client
            .add_rpc(
                Opcode::Query.as_u16(),
                0,
                Bytes::from_static(b"select 1"),
                vec!["127.0.0.1:1".to_string()],
                1u64,
            )
            .unwrap();

        let result = client.execute().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tolerant_client_completes_with_failure_callback() {
        let mut cfg = ClientConfig::default();
        cfg.tolerate_failures = true;
        let pool = StdRc::new(ConnectionPool::new(&PoolConfig::default()));
        let client = RpcClient::new(cfg, pool, Vec::new());

        let completed = StdRc::new(StdRefCell::new(None));
        let completed_cb = completed.clone();
        client.set_completed_callback(move |_p: &u64, success| {
            *completed_cb.borrow_mut() = Some(success);
        });

        client
            .add_rpc(
                Opcode::Query.as_u16(),
                0,
                Bytes::from_static(b"select 1"),
                vec!["127.0.0.1:1".to_string()],
                1u64,
            )
            .unwrap();

        client.execute().await.unwrap();
        assert_eq!(*completed.borrow(), Some(false));
    }
}
