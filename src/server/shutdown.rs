use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Creates a handle that can hand out one shutdown signal per RPC server. Dropping the handle
/// stops every server that received a signal from it.
pub(crate) fn shutdown_handle() -> RpcServerShutdownHandle {
    RpcServerShutdownHandle { txs: Vec::new() }
}

pub(crate) struct RpcServerShutdownHandle {
    txs: Vec<oneshot::Sender<()>>,
}

impl RpcServerShutdownHandle {
    pub(crate) fn signal(&mut self) -> RpcServerShutdownSignal {
        let (tx, rx) = oneshot::channel();
        self.txs.push(tx);
        RpcServerShutdownSignal { rx }
    }

    pub(crate) fn shutdown(self) {
        for tx in self.txs {
            let _ = tx.send(());
        }
    }
}

pub(crate) struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for RpcServerShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = Pin::new(&mut self.rx);

        match rx.poll(cx) {
            Poll::Pending => Poll::Pending,
            // Sent or dropped, both mean stop.
            Poll::Ready(_) => Poll::Ready(()),
        }
    }
}
