//! Direction-agnostic request forwarding. A [`Request`] is the normalized
//! form of any SSH channel out-of-band request (`pty-req`, `shell`, `exec`,
//! `window-change`, `subsystem`, `env`, `signal`, `exit-status`); a
//! [`RequestSink`] is whatever the request gets forwarded onto, whether
//! that's the upstream channel or the inbound client's session handle.
//!
//! [`proxy_requests`] drives Request Proxy B (upstream exit-status ->
//! inbound) directly, since that direction is naturally queue-shaped: the
//! owning task demultiplexes `Channel::wait()` into a queue, and a single
//! consumer drains it. Request Proxy A (inbound -> upstream) is realized
//! inline in `splicer::SplicedChannel::forward_request`/`connection.rs`
//! instead of through this loop, because each inbound request already
//! arrives as one sequential `Handler` callback and needs its result fed
//! straight back into `session.channel_success`/`channel_failure` — but it
//! forwards the exact same normalized [`Request`]/[`RequestKind`] shape, so
//! the two directions stay behaviorally identical and are covered by the
//! same model here.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

/// Terminal mode opcode/value pair, as carried in a `pty-req`.
pub type PtyModes = Vec<(russh::Pty, u32)>;

#[derive(Debug, Clone)]
pub enum RequestKind {
    PtyReq {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: PtyModes,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Env {
        name: String,
        value: String,
    },
    Signal(String),
    ExitStatus(u32),
}

impl RequestKind {
    /// SSH defines `want_reply` as always false for requests that don't
    /// expect a response; `exit-status` and `window-change` are the two
    /// cases that matter here.
    pub fn implies_no_reply(&self) -> bool {
        matches!(
            self,
            RequestKind::ExitStatus(_) | RequestKind::WindowChange { .. } | RequestKind::Signal(_)
        )
    }
}

/// `russh::Sig`'s name as carried over the wire, matching the named variants
/// laid out in RFC 4254 section 6.10. Kept as a local match rather than a
/// call into `russh::Sig` itself since the enum's own name/parse methods
/// aren't part of its public surface.
pub fn sig_name(sig: &russh::Sig) -> String {
    match sig {
        russh::Sig::ABRT => "ABRT".to_string(),
        russh::Sig::ALRM => "ALRM".to_string(),
        russh::Sig::FPE => "FPE".to_string(),
        russh::Sig::HUP => "HUP".to_string(),
        russh::Sig::ILL => "ILL".to_string(),
        russh::Sig::INT => "INT".to_string(),
        russh::Sig::KILL => "KILL".to_string(),
        russh::Sig::PIPE => "PIPE".to_string(),
        russh::Sig::QUIT => "QUIT".to_string(),
        russh::Sig::SEGV => "SEGV".to_string(),
        russh::Sig::TERM => "TERM".to_string(),
        russh::Sig::USR1 => "USR1".to_string(),
        russh::Sig::Custom(name) => name.clone(),
    }
}

/// Inverse of [`sig_name`].
pub fn sig_from_name(name: &str) -> russh::Sig {
    match name {
        "ABRT" => russh::Sig::ABRT,
        "ALRM" => russh::Sig::ALRM,
        "FPE" => russh::Sig::FPE,
        "HUP" => russh::Sig::HUP,
        "ILL" => russh::Sig::ILL,
        "INT" => russh::Sig::INT,
        "KILL" => russh::Sig::KILL,
        "PIPE" => russh::Sig::PIPE,
        "QUIT" => russh::Sig::QUIT,
        "SEGV" => russh::Sig::SEGV,
        "TERM" => russh::Sig::TERM,
        "USR1" => russh::Sig::USR1,
        other => russh::Sig::Custom(other.to_string()),
    }
}

/// A single normalized request, queued for forwarding in arrival order.
#[derive(Debug)]
pub struct Request {
    pub kind: RequestKind,
    pub want_reply: bool,
}

/// One item placed on a request-forwarding queue: the request itself, plus
/// an optional reply slot the sender is waiting on. `None` means the
/// original requester didn't ask for a reply (`want_reply == false`), so the
/// forwarder doesn't need to wait for or report a result.
pub type QueuedRequest = (Request, Option<oneshot::Sender<bool>>);

/// Whatever a [`Request`] gets forwarded onto. Implementations translate
/// each `RequestKind` into the destination's native call and report whether
/// the destination accepted it.
#[async_trait]
pub trait RequestSink: Send + Sync {
    async fn forward(&self, request: &Request) -> bool;
}

/// Drains `queue` in order and forwards each request to `sink`, replying on
/// the request's oneshot (if any) with the sink's accept/reject result. This
/// is the direction-agnostic core of both Request Proxy A and B: it
/// preserves arrival order (single consumer of a single mpsc queue) and
/// never aborts on an individual forwarding failure — a failed forward is
/// reported as a declined request, not a torn-down channel, matching
/// spec-level error handling for this component.
pub async fn proxy_requests(
    mut queue: mpsc::UnboundedReceiver<QueuedRequest>,
    sink: &dyn RequestSink,
) {
    while let Some((request, reply_slot)) = queue.recv().await {
        trace!(want_reply = request.want_reply, "forwarding request");
        let accepted = sink.forward(&request).await;
        if let Some(reply_slot) = reply_slot {
            if reply_slot.send(accepted).is_err() {
                warn!("reply receiver dropped before request finished forwarding");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn named_signals_round_trip() {
        for name in ["ABRT", "ALRM", "FPE", "HUP", "ILL", "INT", "KILL", "PIPE", "QUIT", "SEGV", "TERM", "USR1"] {
            assert_eq!(sig_name(&sig_from_name(name)), name);
        }
    }

    #[test]
    fn unrecognized_signal_name_round_trips_as_custom() {
        assert_eq!(sig_name(&sig_from_name("WINCH")), "WINCH");
    }

    struct CountingSink {
        calls: Arc<AtomicUsize>,
        accept: bool,
    }

    #[async_trait]
    impl RequestSink for CountingSink {
        async fn forward(&self, _request: &Request) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    #[tokio::test]
    async fn forwards_in_order_and_reports_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            calls: calls.clone(),
            accept: true,
        };
        let (tx, rx) = mpsc::unbounded_channel();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((
            Request {
                kind: RequestKind::Shell,
                want_reply: true,
            },
            Some(reply_tx),
        ))
        .unwrap();
        drop(tx);

        proxy_requests(rx, &sink).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(reply_rx.await.unwrap());
    }

    #[tokio::test]
    async fn no_reply_slot_when_want_reply_false() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            calls: calls.clone(),
            accept: false,
        };
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send((
            Request {
                kind: RequestKind::ExitStatus(0),
                want_reply: false,
            },
            None,
        ))
        .unwrap();
        drop(tx);

        proxy_requests(rx, &sink).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn continues_after_a_declined_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            calls: calls.clone(),
            accept: false,
        };
        let (tx, rx) = mpsc::unbounded_channel();

        for _ in 0..3 {
            let (reply_tx, _reply_rx) = oneshot::channel();
            tx.send((
                Request {
                    kind: RequestKind::Shell,
                    want_reply: true,
                },
                Some(reply_tx),
            ))
            .unwrap();
        }
        drop(tx);

        proxy_requests(rx, &sink).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
