//! Node-wide transport for raft messages. Every group on a node shares one listener and one
//! outbound connection per peer; inbound messages are routed to groups by their group id.

use std::collections::HashMap;
use std::sync::Arc;

use futures::SinkExt;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{Receiver, UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::Result;
use crate::raft::rpc::{Address, Message};
use crate::raft::{GroupId, NodeId};

/// Raft addresses of every node this host knows about.
pub type AddressBook = Arc<RwLock<HashMap<NodeId, String>>>;

/// Inbound channel of each group hosted on this node.
pub type Router = Arc<RwLock<HashMap<GroupId, UnboundedSender<Message>>>>;

pub async fn receive_task(
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
    listener: TcpListener,
    router: Router,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            Ok((s, addr)) = listener.accept() => {
                tracing::debug!(?addr, "peer connected");
                let router = router.clone();
                tokio::spawn(async move {
                    match stream_messages(s, router).await {
                        Ok(()) => tracing::debug!(?addr, "peer disconnected"),
                        Err(err) => tracing::warn!(?addr, %err, "error reading from peer"),
                    }
                });
            }
        }
    }

    tracing::debug!("receive complete");
    Ok(())
}

async fn stream_messages(stream: TcpStream, router: Router) -> Result<()> {
    let length_delimited = FramedRead::new(stream, LengthDelimitedCodec::new());
    let mut stream = tokio_serde::SymmetricallyFramed::new(
        length_delimited,
        tokio_serde::formats::SymmetricalJson::<Message>::default(),
    );

    while let Some(message) = stream.try_next().await? {
        tracing::trace!(?message, "receive message");
        let tx = router.read().get(&message.group).cloned();
        match tx {
            Some(tx) => {
                // the group stopped while the message was in flight
                let _ = tx.send(message);
            }
            None => tracing::trace!(group = message.group, "message for group not hosted here"),
        }
    }
    Ok(())
}

pub async fn send_task(
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
    id: NodeId,
    addresses: AddressBook,
    mut out_rx: UnboundedReceiver<Message>,
) -> Result<()> {
    let mut node_txs: HashMap<NodeId, mpsc::Sender<Message>> = HashMap::new();

    loop {
        let mut message = tokio::select! {
            _ = shutdown.recv() => break,
            message = out_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if message.from == Address::Local {
            message.from = Address::Peer(id)
        }
        let to = match &message.to {
            Address::Peer(peer) => *peer,
            addr => {
                tracing::error!(?addr, "received outbound message for non-TCP address");
                continue;
            }
        };

        if !node_txs.contains_key(&to) || node_txs.get(&to).map_or(false, |tx| tx.is_closed()) {
            let addr = match addresses.read().get(&to).cloned() {
                Some(addr) => addr,
                None => {
                    tracing::debug!(peer = to, "no address for peer, discarding message");
                    continue;
                }
            };
            let (tx, rx) = mpsc::channel::<Message>(1000);
            node_txs.insert(to, tx);
            tokio::spawn(connect_and_send(to, addr, rx));
        }

        if let Some(tx) = node_txs.get(&to) {
            match tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(peer = to, "full send buffer for peer, discarding message")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    node_txs.remove(&to);
                }
            }
        }
    }
    Ok(())
}

/// Create a new send task for a given node.
///
/// * `peer` - The node which messages will be sent to.
/// * `addr` - Its raft address.
/// * `out_rx` - The channel messages to send are written to.
async fn connect_and_send(peer: NodeId, addr: String, mut out_rx: Receiver<Message>) -> Result<()> {
    loop {
        match TcpStream::connect(&addr).await {
            Ok(socket) => match send_messages(socket, &mut out_rx).await {
                Ok(()) => break Ok(()),
                Err(err) => tracing::debug!(peer, %addr, %err, "failed sending to raft peer"),
            },
            Err(err) => tracing::debug!(peer, %addr, %err, "failed connecting to raft peer"),
        }
        // drop what queued up while the peer was unreachable
        while out_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Write messages to socket in a loop.
///
/// * `socket` - The TCP socket messages will be written to.
/// * `out_rx` - The channel from which to receive new messages to write.
async fn send_messages(socket: TcpStream, out_rx: &mut mpsc::Receiver<Message>) -> Result<()> {
    socket.set_nodelay(true)?;
    // identify frames with a header indicating length
    let length_delimited = FramedWrite::new(socket, LengthDelimitedCodec::new());
    let mut stream = tokio_serde::SymmetricallyFramed::new(
        length_delimited,
        tokio_serde::formats::SymmetricalJson::<Message>::default(),
    );

    while let Some(message) = out_rx.recv().await {
        stream.send(message).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Command;
    use bytes::Bytes;
    use futures::SinkExt;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn read_message() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router: Router = Default::default();
        router.write().insert(7, tx);
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(receive_task(shutdown_tx.subscribe(), listener, router));

        let stream = TcpStream::connect(addr).await?;
        let out_msg = Message::new(7, Address::Peer(1), Address::Peer(2), Command::Tick);
        let ignored = Message::new(8, Address::Peer(1), Address::Peer(2), Command::Noop);

        let mut frame = FramedWrite::new(stream, LengthDelimitedCodec::new());
        frame
            .send(Bytes::from(serde_json::to_string(&ignored)?))
            .await?;
        frame
            .send(Bytes::from(serde_json::to_string(&out_msg)?))
            .await?;

        match rx.recv().await {
            Some(in_msg) => assert_eq!(out_msg, in_msg),
            _ => panic!(),
        }

        Ok(())
    }

    #[tokio::test]
    async fn send_message() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addresses: AddressBook = Default::default();
        addresses
            .write()
            .insert(2, listener.local_addr()?.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(send_task(shutdown_tx.subscribe(), 1, addresses, rx));

        let out_msg = Message::new(3, Address::Local, Address::Peer(2), Command::Tick);
        let expected = Message::new(3, Address::Peer(1), Address::Peer(2), Command::Tick);
        tx.send(out_msg).unwrap();

        let (stream, _addr) = listener.accept().await?;
        let mut frame = FramedRead::new(stream, LengthDelimitedCodec::new());
        match frame.next().await {
            Some(Ok(bytes)) => {
                let in_msg: Message = serde_json::from_slice(&bytes)?;
                assert_eq!(expected, in_msg);
            }
            _ => panic!(),
        };

        Ok(())
    }
}
