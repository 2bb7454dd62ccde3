//! The Channel Splicer: given one accepted inbound session channel and its
//! freshly opened upstream mirror, wires the two together until either side
//! closes.
//!
//! The upstream [`Channel`] exposes its receive half only through
//! `.wait()`, which needs `&mut self` — so exactly one task may own it.
//! Everything that needs to read from upstream (stdout, stderr, exit
//! status) is therefore demultiplexed out of that one task's `.wait()` loop
//! into per-role queues, each drained by its own small applier task; and
//! everything that needs to *write* to upstream (stdin bytes, pty/shell/exec
//! requests) is funneled into the same owning task over an internal command
//! queue, which both preserves the sender's arrival order and sidesteps the
//! aliasing problem. The result is four spawned tasks realizing the five
//! roles named in the channel-splicing contract; see `DESIGN.md` for why
//! `request_proxy_inbound` and `copy_stdin` share a task.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::Msg as ClientMsg;
use russh::server::Handle as ServerHandle;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::request_proxy::{self, proxy_requests, QueuedRequest, Request, RequestKind, RequestSink};

/// Grace delay observed before closing the upstream write half after the
/// corresponding inbound stream ends, giving any final framed message (e.g.
/// a trailing `exit-status`) time to arrive before the socket half closes.
const CLOSE_GRACE: Duration = Duration::from_millis(10);

/// Commands funneled into the task that owns the upstream `Channel`.
enum UpstreamCmd {
    Stdin(Vec<u8>),
    Request {
        kind: RequestKind,
        done: Option<oneshot::Sender<bool>>,
    },
    Eof,
    Close,
}

/// Spawns the splicing tasks for one accepted inbound session channel paired
/// with its already-open upstream mirror. `inbound_handle` is the server
/// handle used to push data/requests back to the inbound client;
/// `inbound_channel` identifies which of its channels this splice serves.
pub fn spawn(
    inbound_channel: ChannelId,
    inbound_handle: ServerHandle,
    upstream_channel: Channel<ClientMsg>,
) -> SplicedChannel {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UpstreamCmd>();
    let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (reqb_tx, reqb_rx) = mpsc::unbounded_channel::<QueuedRequest>();

    // Task 1: owns the upstream Channel. Multiplexes inbound-originated
    // commands (stdin bytes, requests) onto it, and demultiplexes its
    // `.wait()` stream into the three upstream-to-inbound role queues.
    let owner = tokio::spawn(upstream_owner_task(
        inbound_channel,
        inbound_handle.clone(),
        upstream_channel,
        cmd_rx,
        stdout_tx,
        stderr_tx,
        reqb_tx,
    ));

    // Task 2: data copy, upstream stdout -> inbound.
    let stdout_task = tokio::spawn(copy_stdout(
        inbound_channel,
        inbound_handle.clone(),
        stdout_rx,
    ));

    // Task 3: data copy, upstream stderr -> inbound.
    let stderr_task = tokio::spawn(copy_stderr(
        inbound_channel,
        inbound_handle.clone(),
        stderr_rx,
    ));

    // Task 4: request proxy B, upstream exit-status -> inbound.
    let reqb_task = tokio::spawn(request_proxy_outbound(
        inbound_channel,
        inbound_handle,
        reqb_rx,
    ));

    SplicedChannel {
        cmd_tx,
        owner,
        stdout_task,
        stderr_task,
        reqb_task,
    }
}

/// Handle returned by [`spawn`]. Drop order matches the close-ordering
/// discipline: data copies are awaited before the request proxy, and the
/// owning task (which covers both copy_stdin and request_proxy_inbound) is
/// torn down last since it also holds the upstream channel itself.
pub struct SplicedChannel {
    cmd_tx: mpsc::UnboundedSender<UpstreamCmd>,
    owner: tokio::task::JoinHandle<()>,
    stdout_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
    reqb_task: tokio::task::JoinHandle<()>,
}

impl SplicedChannel {
    /// Forward a chunk of inbound stdin data to the upstream channel.
    pub fn send_stdin(&self, data: Vec<u8>) {
        let _ = self.cmd_tx.send(UpstreamCmd::Stdin(data));
    }

    /// Forward an inbound out-of-band request (pty-req/shell/exec/...) and
    /// get back whether the upstream accepted it.
    pub async fn forward_request(&self, kind: RequestKind) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(UpstreamCmd::Request {
                kind,
                done: Some(done_tx),
            })
            .is_err()
        {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }

    /// The inbound stream ended (channel EOF). Schedules the upstream write
    /// half to close after the grace delay.
    pub fn notify_inbound_eof(&self) {
        let _ = self.cmd_tx.send(UpstreamCmd::Eof);
    }

    /// The inbound channel closed outright.
    pub fn notify_inbound_close(&self) {
        let _ = self.cmd_tx.send(UpstreamCmd::Close);
    }

    /// Wait for every splicing task to finish: the three data/request-B
    /// appliers first, then the owning task last, mirroring the contract's
    /// "await data copies before request proxies" ordering applied to the
    /// task that carries both of the remaining roles.
    pub async fn join(self) {
        let _ = self.stdout_task.await;
        let _ = self.stderr_task.await;
        let _ = self.reqb_task.await;
        drop(self.cmd_tx);
        let _ = self.owner.await;
    }

    /// Test-only constructor: builds a `SplicedChannel` wired to a live
    /// `cmd_rx` but backed by no-op join handles, so the command-enqueuing
    /// side of the public API (`send_stdin`/`forward_request`/
    /// `notify_inbound_eof`/`notify_inbound_close`) can be exercised without
    /// a real upstream `Channel` or inbound `ServerHandle`.
    #[cfg(test)]
    fn for_test() -> (Self, mpsc::UnboundedReceiver<UpstreamCmd>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            SplicedChannel {
                cmd_tx,
                owner: tokio::spawn(async {}),
                stdout_task: tokio::spawn(async {}),
                stderr_task: tokio::spawn(async {}),
                reqb_task: tokio::spawn(async {}),
            },
            cmd_rx,
        )
    }
}

/// What the upstream channel's `.wait()` stream resolved to, decoupled from
/// the side effects (queue routing, IO against `inbound`) that act on it —
/// exists so the demultiplexing decision is testable without a live
/// `Channel`, which `ChannelMsg` values themselves don't require to
/// construct.
#[derive(Debug, PartialEq, Eq)]
enum UpstreamEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    Closed,
    Ended,
    Ignored,
}

fn classify_upstream_msg(msg: Option<ChannelMsg>) -> UpstreamEvent {
    match msg {
        Some(ChannelMsg::Data { data }) => UpstreamEvent::Stdout(data.to_vec()),
        Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
            UpstreamEvent::Stderr(data.to_vec())
        }
        Some(ChannelMsg::ExtendedData { .. }) => UpstreamEvent::Ignored,
        Some(ChannelMsg::ExitStatus { exit_status }) => UpstreamEvent::ExitStatus(exit_status),
        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
            UpstreamEvent::ExitSignal(request_proxy::sig_name(&signal_name))
        }
        Some(ChannelMsg::Eof) => UpstreamEvent::Eof,
        Some(ChannelMsg::Close) => UpstreamEvent::Closed,
        Some(_) => UpstreamEvent::Ignored,
        None => UpstreamEvent::Ended,
    }
}

async fn upstream_owner_task(
    channel_id: ChannelId,
    inbound: ServerHandle,
    mut channel: Channel<ClientMsg>,
    mut cmd_rx: mpsc::UnboundedReceiver<UpstreamCmd>,
    stdout_tx: mpsc::UnboundedSender<Vec<u8>>,
    stderr_tx: mpsc::UnboundedSender<Vec<u8>>,
    reqb_tx: mpsc::UnboundedSender<QueuedRequest>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UpstreamCmd::Stdin(data)) => {
                        if let Err(err) = channel.data(&data[..]).await {
                            warn!(channel = %channel_id, %err, "forwarding stdin to upstream failed");
                        }
                    }
                    Some(UpstreamCmd::Request { kind, done }) => {
                        let accepted = forward_request_kind(&channel, &kind).await;
                        if let Some(done) = done {
                            let _ = done.send(accepted);
                        }
                    }
                    Some(UpstreamCmd::Eof) => {
                        sleep(CLOSE_GRACE).await;
                        if let Err(err) = channel.eof().await {
                            debug!(channel = %channel_id, %err, "closing upstream write half");
                        }
                    }
                    Some(UpstreamCmd::Close) => {
                        let _ = channel.close().await;
                        break;
                    }
                    None => break,
                }
            }
            msg = channel.wait() => {
                match classify_upstream_msg(msg) {
                    UpstreamEvent::Stdout(data) => {
                        let _ = stdout_tx.send(data);
                    }
                    UpstreamEvent::Stderr(data) => {
                        let _ = stderr_tx.send(data);
                    }
                    UpstreamEvent::ExitStatus(exit_status) => {
                        let _ = reqb_tx.send((
                            Request { kind: RequestKind::ExitStatus(exit_status), want_reply: false },
                            None,
                        ));
                    }
                    UpstreamEvent::ExitSignal(signal) => {
                        debug!(channel = %channel_id, %signal, "upstream sent exit-signal");
                    }
                    UpstreamEvent::Eof => {
                        sleep(CLOSE_GRACE).await;
                        if let Err(err) = inbound.eof(channel_id).await {
                            debug!(channel = %channel_id, ?err, "telling inbound client about upstream eof");
                        }
                    }
                    UpstreamEvent::Closed | UpstreamEvent::Ended => break,
                    UpstreamEvent::Ignored => {}
                }
            }
        }
    }
    debug!(channel = %channel_id, "upstream owner task finished");
}

async fn forward_request_kind(channel: &Channel<ClientMsg>, kind: &RequestKind) -> bool {
    let result = match kind {
        RequestKind::PtyReq {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            channel
                .request_pty(
                    true,
                    term,
                    *col_width,
                    *row_height,
                    *pix_width,
                    *pix_height,
                    modes,
                )
                .await
        }
        RequestKind::Shell => channel.request_shell(true).await,
        RequestKind::Exec(command) => channel.exec(true, command.clone()).await,
        RequestKind::Subsystem(name) => channel.request_subsystem(true, name.as_str()).await,
        RequestKind::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .window_change(*col_width, *row_height, *pix_width, *pix_height)
                .await
        }
        RequestKind::Env { name, value } => channel.set_env(true, name, value).await,
        RequestKind::Signal(name) => channel.signal(request_proxy::sig_from_name(name)).await,
        RequestKind::ExitStatus(_) => Ok(()),
    };

    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(%err, "forwarding request to upstream failed");
            false
        }
    }
}

async fn copy_stdout(
    channel_id: ChannelId,
    inbound: ServerHandle,
    mut stdout_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = stdout_rx.recv().await {
        if inbound
            .data(channel_id, CryptoVec::from(data))
            .await
            .is_err()
        {
            warn!(channel = %channel_id, "inbound client gone, stopping stdout copy");
            break;
        }
    }
}

async fn copy_stderr(
    channel_id: ChannelId,
    inbound: ServerHandle,
    mut stderr_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = stderr_rx.recv().await {
        if inbound
            .extended_data(channel_id, 1, CryptoVec::from(data))
            .await
            .is_err()
        {
            warn!(channel = %channel_id, "inbound client gone, stopping stderr copy");
            break;
        }
    }
}

async fn request_proxy_outbound(
    channel_id: ChannelId,
    inbound: ServerHandle,
    reqb_rx: mpsc::UnboundedReceiver<QueuedRequest>,
) {
    let sink = InboundExitStatusSink { channel_id, inbound };
    proxy_requests(reqb_rx, &sink).await;
}

struct InboundExitStatusSink {
    channel_id: ChannelId,
    inbound: ServerHandle,
}

#[async_trait]
impl RequestSink for InboundExitStatusSink {
    async fn forward(&self, request: &Request) -> bool {
        if let RequestKind::ExitStatus(code) = &request.kind {
            self.inbound
                .exit_status_request(self.channel_id, *code)
                .await
                .is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;

    #[test]
    fn classifies_stdout_and_stderr() {
        assert_eq!(
            classify_upstream_msg(Some(ChannelMsg::Data {
                data: CryptoVec::from(b"hello".to_vec())
            })),
            UpstreamEvent::Stdout(b"hello".to_vec())
        );
        assert_eq!(
            classify_upstream_msg(Some(ChannelMsg::ExtendedData {
                data: CryptoVec::from(b"hello".to_vec()),
                ext: 1
            })),
            UpstreamEvent::Stderr(b"hello".to_vec())
        );
        assert_eq!(
            classify_upstream_msg(Some(ChannelMsg::ExtendedData {
                data: CryptoVec::from(b"hello".to_vec()),
                ext: 2
            })),
            UpstreamEvent::Ignored
        );
    }

    #[test]
    fn classifies_exit_status_and_exit_signal() {
        assert_eq!(
            classify_upstream_msg(Some(ChannelMsg::ExitStatus { exit_status: 7 })),
            UpstreamEvent::ExitStatus(7)
        );
        assert_eq!(
            classify_upstream_msg(Some(ChannelMsg::ExitSignal {
                signal_name: russh::Sig::KILL,
                core_dumped: false,
                error_message: String::new(),
                lang_tag: String::new(),
            })),
            UpstreamEvent::ExitSignal("KILL".to_string())
        );
    }

    #[test]
    fn classifies_eof_close_and_stream_end() {
        assert_eq!(classify_upstream_msg(Some(ChannelMsg::Eof)), UpstreamEvent::Eof);
        assert_eq!(
            classify_upstream_msg(Some(ChannelMsg::Close)),
            UpstreamEvent::Closed
        );
        assert_eq!(classify_upstream_msg(None), UpstreamEvent::Ended);
    }

    #[tokio::test]
    async fn notify_inbound_eof_enqueues_an_eof_command() {
        let (spliced, mut cmd_rx) = SplicedChannel::for_test();
        spliced.notify_inbound_eof();
        assert!(matches!(cmd_rx.recv().await, Some(UpstreamCmd::Eof)));
    }

    #[tokio::test]
    async fn notify_inbound_close_enqueues_a_close_command() {
        let (spliced, mut cmd_rx) = SplicedChannel::for_test();
        spliced.notify_inbound_close();
        assert!(matches!(cmd_rx.recv().await, Some(UpstreamCmd::Close)));
    }

    #[tokio::test]
    async fn send_stdin_enqueues_data_in_arrival_order() {
        let (spliced, mut cmd_rx) = SplicedChannel::for_test();
        spliced.send_stdin(b"first".to_vec());
        spliced.send_stdin(b"second".to_vec());

        match cmd_rx.recv().await {
            Some(UpstreamCmd::Stdin(data)) => assert_eq!(data, b"first"),
            _ => panic!("expected first stdin chunk"),
        }
        match cmd_rx.recv().await {
            Some(UpstreamCmd::Stdin(data)) => assert_eq!(data, b"second"),
            _ => panic!("expected second stdin chunk"),
        }
    }

    #[tokio::test]
    async fn forward_request_waits_for_the_reply_sent_on_its_oneshot() {
        let (spliced, mut cmd_rx) = SplicedChannel::for_test();
        let forwarded = tokio::spawn(async move { spliced.forward_request(RequestKind::Shell).await });

        match cmd_rx.recv().await {
            Some(UpstreamCmd::Request {
                kind: RequestKind::Shell,
                done: Some(done),
            }) => {
                done.send(true).unwrap();
            }
            _ => panic!("expected a shell request with a reply slot"),
        }

        assert!(forwarded.await.unwrap());
    }
}
