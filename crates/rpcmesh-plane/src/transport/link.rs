use bytes::Bytes;
use tokio::sync::mpsc;

use rpcmesh_core::error::{Result, RpcError};

/// One end of a bidirectional message link.
#[derive(Debug)]
pub struct Link {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

/// Two connected link ends. Each end's `recv` yields `None` once the other
/// end is dropped.
pub fn link_pair(capacity: usize) -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
}

impl Link {
    pub async fn send(&self, msg: Bytes) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| RpcError::Transport("link closed".into()))
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Split into independently owned halves (writer, reader).
    pub fn split(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        (self.tx, self.rx)
    }
}
