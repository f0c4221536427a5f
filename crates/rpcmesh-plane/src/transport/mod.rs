//! Transport layer.
//!
//! The byte carrier between a machine and the control plane is an external
//! collaborator. `link` provides the in-process carrier used by embedded
//! meshes and tests: ordered, reliable, opaque messages whose connection ends
//! when the peer drops its half.

pub mod link;

pub use link::{link_pair, Link};

use bytes::Bytes;
use tokio::sync::mpsc;

use rpcmesh_core::protocol::Frame;

/// Drain an outbound frame queue onto a link until either side closes.
pub(crate) async fn write_frames(mut out_rx: mpsc::Receiver<Frame>, link_tx: mpsc::Sender<Bytes>) {
    while let Some(frame) = out_rx.recv().await {
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(kind = frame.kind_str(), error = %e, "frame encode failed");
                continue;
            }
        };
        if link_tx.send(bytes).await.is_err() {
            break;
        }
    }
}
